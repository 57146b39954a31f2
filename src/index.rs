use crate::config::PROGRESS_INTERVAL;
use crate::error::RowResult;
use crate::models::{LinkTargetRecord, LinkTargetRow, PageRecord, PageRow, RedirectRow};
use indicatif::ProgressBar;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Dump titles use underscores; link sources occasionally carry spaces.
pub fn normalize_title(title: &str) -> Cow<'_, str> {
    if title.contains(' ') {
        Cow::Owned(title.replace(' ', "_"))
    } else {
        Cow::Borrowed(title)
    }
}

/// Shares one allocation between identical titles (`X` in namespace 0 and `Talk:X` in 1).
#[derive(Default)]
pub struct TitleInterner {
    titles: FxHashSet<Arc<str>>,
}

impl TitleInterner {
    pub fn intern(&mut self, title: &str) -> Arc<str> {
        let normalized = normalize_title(title);
        if let Some(existing) = self.titles.get(&*normalized) {
            return existing.clone();
        }
        let title: Arc<str> = Arc::from(&*normalized);
        self.titles.insert(title.clone());
        title
    }

    pub fn len(&self) -> usize {
        self.titles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.titles.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageDirectoryStats {
    pub pages: u64,
    pub redirect_pages: u64,
    pub duplicate_ids: u64,
    pub duplicate_titles: u64,
    pub malformed_rows: u64,
    pub redirects_attached: u64,
    pub redirects_dangling: u64,
    pub redirects_interwiki: u64,
    pub redirects_orphaned: u64,
    pub redirects_stale: u64,
    pub redirects_duplicate: u64,
    pub malformed_redirect_rows: u64,
    pub unique_titles: u64,
}

type TitleIndex = FxHashMap<i32, FxHashMap<Arc<str>, u32>>;

/// Mutable stage of the page directory. Pages first, then redirects, then [`finish`].
///
/// [`finish`]: PageDirectoryBuilder::finish
#[derive(Default)]
pub struct PageDirectoryBuilder {
    records: Vec<PageRecord>,
    slots: FxHashMap<u32, u32>,
    titles: TitleIndex,
    interner: TitleInterner,
    stats: PageDirectoryStats,
}

impl PageDirectoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a page. A repeated id keeps the first record and is counted.
    pub fn add_page(&mut self, row: PageRow) -> bool {
        if self.slots.contains_key(&row.id) {
            self.stats.duplicate_ids += 1;
            debug!(id = row.id, title = %row.title, "Duplicate page id ignored");
            return false;
        }

        let title = self.interner.intern(&row.title);
        let by_title = self.titles.entry(row.namespace).or_default();
        if by_title.contains_key(&title) {
            self.stats.duplicate_titles += 1;
            debug!(
                id = row.id,
                namespace = row.namespace,
                title = %title,
                "Duplicate (namespace, title); first page keeps the title"
            );
        } else {
            by_title.insert(title.clone(), row.id);
        }

        if row.is_redirect {
            self.stats.redirect_pages += 1;
        }
        self.slots.insert(row.id, self.records.len() as u32);
        self.records.push(PageRecord {
            id: row.id,
            namespace: row.namespace,
            title,
            is_redirect: row.is_redirect,
            redirect_target: None,
        });
        self.stats.pages += 1;
        true
    }

    pub fn record_malformed_page(&mut self) {
        self.stats.malformed_rows += 1;
    }

    pub fn record_malformed_redirect(&mut self) {
        self.stats.malformed_redirect_rows += 1;
    }

    /// Points a redirect page at its target. Must run after every page is added.
    pub fn attach_redirect(&mut self, row: RedirectRow) {
        if row.interwiki.as_deref().is_some_and(|iw| !iw.is_empty()) {
            self.stats.redirects_interwiki += 1;
            return;
        }
        let Some(&slot) = self.slots.get(&row.from) else {
            self.stats.redirects_orphaned += 1;
            return;
        };
        let target = self
            .titles
            .get(&row.namespace)
            .and_then(|by_title| by_title.get(&*normalize_title(&row.title)))
            .copied();

        let record = &mut self.records[slot as usize];
        if !record.is_redirect {
            self.stats.redirects_stale += 1;
            return;
        }
        if record.redirect_target.is_some() {
            self.stats.redirects_duplicate += 1;
            return;
        }
        match target {
            Some(target_id) => {
                record.redirect_target = Some(target_id);
                self.stats.redirects_attached += 1;
            }
            None => {
                self.stats.redirects_dangling += 1;
                debug!(
                    from = row.from,
                    namespace = row.namespace,
                    title = %row.title,
                    "Redirect target does not exist"
                );
            }
        }
    }

    /// Freezes the directory. Records are reordered by page id so that every
    /// id-ordered traversal (node export) is deterministic.
    pub fn finish(mut self) -> PageDirectory {
        self.records.sort_unstable_by_key(|r| r.id);
        for (slot, record) in self.records.iter().enumerate() {
            self.slots.insert(record.id, slot as u32);
        }
        self.stats.unique_titles = self.interner.len() as u64;

        if self.stats.duplicate_ids > 0 {
            warn!(
                duplicates = self.stats.duplicate_ids,
                "Duplicate page ids were ignored (first occurrence kept)"
            );
        }
        if self.stats.redirects_dangling > 0 {
            info!(
                dangling = self.stats.redirects_dangling,
                "Redirects point at pages that do not exist"
            );
        }

        PageDirectory {
            records: self.records,
            slots: self.slots,
            titles: self.titles,
            stats: self.stats,
        }
    }
}

/// Immutable `page_id -> PageRecord` directory with a `(namespace, title)` index.
/// Shared by reference across resolution workers.
pub struct PageDirectory {
    records: Vec<PageRecord>,
    slots: FxHashMap<u32, u32>,
    titles: TitleIndex,
    stats: PageDirectoryStats,
}

impl PageDirectory {
    /// Builds the directory from `page` rows, then attaches `redirect` rows.
    pub fn build<P, R>(pages: P, redirects: R) -> Self
    where
        P: IntoIterator<Item = RowResult<PageRow>>,
        R: IntoIterator<Item = RowResult<RedirectRow>>,
    {
        let mut builder = PageDirectoryBuilder::new();
        let pb = ProgressBar::new_spinner();
        pb.set_message("Loading pages");

        for (n, row) in pages.into_iter().enumerate() {
            match row {
                Ok(row) => {
                    builder.add_page(row);
                }
                Err(e) => {
                    debug!(error = %e, "Skipping malformed page row");
                    builder.record_malformed_page();
                }
            }
            if n as u64 % PROGRESS_INTERVAL == 0 {
                pb.tick();
            }
        }

        pb.set_message("Attaching redirects");
        for (n, row) in redirects.into_iter().enumerate() {
            match row {
                Ok(row) => builder.attach_redirect(row),
                Err(e) => {
                    debug!(error = %e, "Skipping malformed redirect row");
                    builder.record_malformed_redirect();
                }
            }
            if n as u64 % PROGRESS_INTERVAL == 0 {
                pb.tick();
            }
        }
        pb.finish_and_clear();

        let directory = builder.finish();
        info!(
            pages = directory.stats.pages,
            redirect_pages = directory.stats.redirect_pages,
            redirects_attached = directory.stats.redirects_attached,
            unique_titles = directory.stats.unique_titles,
            "Page directory built"
        );
        directory
    }

    #[inline]
    pub fn get(&self, id: u32) -> Option<&PageRecord> {
        self.slots
            .get(&id)
            .map(|&slot| &self.records[slot as usize])
    }

    #[inline]
    pub fn slot_of(&self, id: u32) -> Option<usize> {
        self.slots.get(&id).map(|&slot| slot as usize)
    }

    /// Secondary lookup used for legacy rows and link-target rows.
    #[inline]
    pub fn lookup(&self, namespace: i32, title: &str) -> Option<&PageRecord> {
        self.titles
            .get(&namespace)
            .and_then(|by_title| by_title.get(&*normalize_title(title)))
            .and_then(|&id| self.get(id))
    }

    /// Returns the interned title allocation for `(namespace, title)` if a page holds it.
    fn shared_title(&self, namespace: i32, title: &str) -> Option<Arc<str>> {
        self.titles
            .get(&namespace)
            .and_then(|by_title| by_title.get_key_value(title))
            .map(|(shared, _)| shared.clone())
    }

    /// All pages in ascending id order.
    pub fn records(&self) -> &[PageRecord] {
        &self.records
    }

    pub fn max_id(&self) -> u32 {
        self.records.last().map(|r| r.id).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stats(&self) -> &PageDirectoryStats {
        &self.stats
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkTargetStats {
    pub link_targets: u64,
    pub duplicate_ids: u64,
    pub malformed_rows: u64,
    /// Targets whose title allocation is shared with a page
    pub shared_titles: u64,
}

/// Immutable `lt_id -> (namespace, title)` directory (modern schema).
pub struct LinkTargetDirectory {
    targets: FxHashMap<u64, LinkTargetRecord>,
    stats: LinkTargetStats,
}

impl LinkTargetDirectory {
    /// Builds from `linktarget` rows, reusing page title allocations where possible.
    pub fn build<I>(rows: I, pages: &PageDirectory) -> Self
    where
        I: IntoIterator<Item = RowResult<LinkTargetRow>>,
    {
        let mut targets: FxHashMap<u64, LinkTargetRecord> = FxHashMap::default();
        let mut interner = TitleInterner::default();
        let mut stats = LinkTargetStats::default();
        let pb = ProgressBar::new_spinner();
        pb.set_message("Loading link targets");

        for (n, row) in rows.into_iter().enumerate() {
            match row {
                Ok(row) => {
                    if targets.contains_key(&row.id) {
                        stats.duplicate_ids += 1;
                        debug!(id = row.id, "Duplicate link target id ignored");
                        continue;
                    }
                    let normalized = normalize_title(&row.title);
                    let title = match pages.shared_title(row.namespace, &normalized) {
                        Some(shared) => {
                            stats.shared_titles += 1;
                            shared
                        }
                        None => interner.intern(&normalized),
                    };
                    targets.insert(
                        row.id,
                        LinkTargetRecord {
                            id: row.id,
                            namespace: row.namespace,
                            title,
                        },
                    );
                    stats.link_targets += 1;
                }
                Err(e) => {
                    debug!(error = %e, "Skipping malformed linktarget row");
                    stats.malformed_rows += 1;
                }
            }
            if n as u64 % PROGRESS_INTERVAL == 0 {
                pb.tick();
            }
        }
        pb.finish_and_clear();

        if stats.duplicate_ids > 0 {
            warn!(
                duplicates = stats.duplicate_ids,
                "Duplicate link target ids were ignored (first occurrence kept)"
            );
        }
        info!(
            link_targets = stats.link_targets,
            shared_titles = stats.shared_titles,
            "Link-target directory built"
        );

        Self { targets, stats }
    }

    #[inline]
    pub fn get(&self, id: u64) -> Option<&LinkTargetRecord> {
        self.targets.get(&id)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn stats(&self) -> &LinkTargetStats {
        &self.stats
    }
}
