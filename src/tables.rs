//! Column bindings and row decoding for the four input tables.
//!
//! Every binding is resolved from the dump's `CREATE TABLE` header when the table is
//! opened, so a shape mismatch fails the run before any row is read.

use crate::config::Schema;
use crate::error::{MalformedRow, PipelineError, RowResult};
use crate::index::{LinkTargetDirectory, PageDirectory};
use crate::models::{LinkTargetRow, PageRow, RawLinkRecord, RedirectRow};
use crate::parser::{SqlDump, SqlValue};
use crate::resolve::LinkRowSource;
use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

fn int_at(row: &[SqlValue], idx: usize, column: &str) -> RowResult<i64> {
    match row.get(idx) {
        Some(SqlValue::Int(v)) => Ok(*v),
        Some(other) => Err(MalformedRow::new(format!(
            "`{column}` is not an integer: {other:?}"
        ))),
        None => Err(MalformedRow::new(format!(
            "tuple has {} values, `{column}` is at {idx}",
            row.len()
        ))),
    }
}

fn u32_at(row: &[SqlValue], idx: usize, column: &str) -> RowResult<u32> {
    let v = int_at(row, idx, column)?;
    u32::try_from(v).map_err(|_| MalformedRow::new(format!("`{column}` out of range: {v}")))
}

fn u64_at(row: &[SqlValue], idx: usize, column: &str) -> RowResult<u64> {
    let v = int_at(row, idx, column)?;
    u64::try_from(v).map_err(|_| MalformedRow::new(format!("`{column}` out of range: {v}")))
}

fn i32_at(row: &[SqlValue], idx: usize, column: &str) -> RowResult<i32> {
    let v = int_at(row, idx, column)?;
    i32::try_from(v).map_err(|_| MalformedRow::new(format!("`{column}` out of range: {v}")))
}

/// Moves the string out of the tuple; each column is taken at most once.
fn take_text(row: &mut [SqlValue], idx: usize, column: &str) -> RowResult<String> {
    let len = row.len();
    match row.get_mut(idx) {
        Some(SqlValue::Text(text)) => Ok(std::mem::take(text)),
        Some(other) => Err(MalformedRow::new(format!(
            "`{column}` is not a string: {other:?}"
        ))),
        None => Err(MalformedRow::new(format!(
            "tuple has {len} values, `{column}` is at {idx}"
        ))),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PageColumns {
    id: usize,
    namespace: usize,
    title: usize,
    is_redirect: usize,
}

impl PageColumns {
    pub fn bind(dump: &SqlDump) -> Result<Self, PipelineError> {
        let idx = dump.require_columns(&[
            "page_id",
            "page_namespace",
            "page_title",
            "page_is_redirect",
        ])?;
        Ok(Self {
            id: idx[0],
            namespace: idx[1],
            title: idx[2],
            is_redirect: idx[3],
        })
    }

    pub fn decode(&self, mut row: Vec<SqlValue>) -> RowResult<PageRow> {
        Ok(PageRow {
            id: u32_at(&row, self.id, "page_id")?,
            namespace: i32_at(&row, self.namespace, "page_namespace")?,
            is_redirect: int_at(&row, self.is_redirect, "page_is_redirect")? != 0,
            title: take_text(&mut row, self.title, "page_title")?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RedirectColumns {
    from: usize,
    namespace: usize,
    title: usize,
    interwiki: Option<usize>,
}

impl RedirectColumns {
    pub fn bind(dump: &SqlDump) -> Result<Self, PipelineError> {
        let idx = dump.require_columns(&["rd_from", "rd_namespace", "rd_title"])?;
        Ok(Self {
            from: idx[0],
            namespace: idx[1],
            title: idx[2],
            interwiki: dump.column_index("rd_interwiki"),
        })
    }

    pub fn decode(&self, mut row: Vec<SqlValue>) -> RowResult<RedirectRow> {
        let interwiki = match self.interwiki {
            Some(idx) => match row.get(idx) {
                Some(SqlValue::Null) | None => None,
                Some(_) => Some(take_text(&mut row, idx, "rd_interwiki")?),
            },
            None => None,
        }
        .filter(|prefix| !prefix.is_empty());
        Ok(RedirectRow {
            from: u32_at(&row, self.from, "rd_from")?,
            namespace: i32_at(&row, self.namespace, "rd_namespace")?,
            title: take_text(&mut row, self.title, "rd_title")?,
            interwiki,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LinkTargetColumns {
    id: usize,
    namespace: usize,
    title: usize,
}

impl LinkTargetColumns {
    /// `lt_namespace` is mandatory: without it a link target cannot be joined to a page.
    pub fn bind(dump: &SqlDump) -> Result<Self, PipelineError> {
        if dump.column_index("lt_namespace").is_none() {
            return Err(PipelineError::schema(
                dump.table(),
                "required column `lt_namespace` is absent; link targets cannot be joined to pages without it",
            ));
        }
        let idx = dump.require_columns(&["lt_id", "lt_namespace", "lt_title"])?;
        Ok(Self {
            id: idx[0],
            namespace: idx[1],
            title: idx[2],
        })
    }

    pub fn decode(&self, mut row: Vec<SqlValue>) -> RowResult<LinkTargetRow> {
        Ok(LinkTargetRow {
            id: u64_at(&row, self.id, "lt_id")?,
            namespace: i32_at(&row, self.namespace, "lt_namespace")?,
            title: take_text(&mut row, self.title, "lt_title")?,
        })
    }
}

/// `pagelinks` bindings for the declared schema.
#[derive(Debug, Clone, Copy)]
pub enum LinkColumns {
    Legacy {
        from: usize,
        namespace: usize,
        title: usize,
    },
    Modern {
        from: usize,
        from_namespace: usize,
        target_id: usize,
    },
}

impl LinkColumns {
    pub fn bind(dump: &SqlDump, schema: Schema) -> Result<Self, PipelineError> {
        let has = |name: &str| dump.column_index(name).is_some();
        match schema {
            Schema::Legacy => {
                if !has("pl_title") && has("pl_target_id") {
                    return Err(PipelineError::schema(
                        dump.table(),
                        "declared `legacy` but the table has `pl_target_id` and no `pl_title`; this is the modern layout (use --schema modern)",
                    ));
                }
                let idx = dump.require_columns(&["pl_from", "pl_namespace", "pl_title"])?;
                Ok(LinkColumns::Legacy {
                    from: idx[0],
                    namespace: idx[1],
                    title: idx[2],
                })
            }
            Schema::Modern => {
                if !has("pl_target_id") && has("pl_title") {
                    return Err(PipelineError::schema(
                        dump.table(),
                        "declared `modern` but the table has `pl_title` and no `pl_target_id`; this is the legacy layout (use --schema legacy)",
                    ));
                }
                let idx =
                    dump.require_columns(&["pl_from", "pl_from_namespace", "pl_target_id"])?;
                Ok(LinkColumns::Modern {
                    from: idx[0],
                    from_namespace: idx[1],
                    target_id: idx[2],
                })
            }
        }
    }

    pub fn decode(&self, mut row: Vec<SqlValue>) -> RowResult<RawLinkRecord> {
        match *self {
            LinkColumns::Legacy {
                from,
                namespace,
                title,
            } => Ok(RawLinkRecord::Legacy {
                from: u32_at(&row, from, "pl_from")?,
                target_namespace: i32_at(&row, namespace, "pl_namespace")?,
                target_title: take_text(&mut row, title, "pl_title")?,
            }),
            LinkColumns::Modern {
                from,
                from_namespace,
                target_id,
            } => Ok(RawLinkRecord::Modern {
                from: u32_at(&row, from, "pl_from")?,
                from_namespace: i32_at(&row, from_namespace, "pl_from_namespace")?,
                target_id: u64_at(&row, target_id, "pl_target_id")?,
            }),
        }
    }
}

/// An opened `page` dump with bound columns.
pub struct PageTable {
    dump: SqlDump,
    columns: PageColumns,
}

impl PageTable {
    pub fn open(path: &Path) -> Result<Self> {
        let dump = SqlDump::open(path, "page")?;
        let columns = PageColumns::bind(&dump)?;
        Ok(Self { dump, columns })
    }
}

pub struct RedirectTable {
    dump: SqlDump,
    columns: RedirectColumns,
}

impl RedirectTable {
    pub fn open(path: &Path) -> Result<Self> {
        let dump = SqlDump::open(path, "redirect")?;
        let columns = RedirectColumns::bind(&dump)?;
        if columns.interwiki.is_none() {
            warn!("`redirect` has no `rd_interwiki` column; every redirect is treated as local");
        }
        Ok(Self { dump, columns })
    }
}

pub struct LinkTargetTable {
    dump: SqlDump,
    columns: LinkTargetColumns,
}

impl LinkTargetTable {
    pub fn open(path: &Path) -> Result<Self> {
        let dump = SqlDump::open(path, "linktarget")?;
        let columns = LinkTargetColumns::bind(&dump)?;
        Ok(Self { dump, columns })
    }
}

/// Builds the page directory from the `page` dump and, when given, the `redirect` dump.
pub fn load_page_directory(
    page: &PageTable,
    redirect: Option<&RedirectTable>,
) -> Result<PageDirectory> {
    info!(path = ?page.dump.path(), "Loading page table");
    let mut page_rows = page.dump.rows()?;
    let mut redirect_rows = match redirect {
        Some(table) => Some(table.dump.rows()?),
        None => {
            warn!("No redirect table given; redirect pages will not resolve");
            None
        }
    };

    let directory = PageDirectory::build(
        page_rows
            .by_ref()
            .map(|row| row.and_then(|values| page.columns.decode(values))),
        redirect_rows.iter_mut().flatten().map(|row| {
            row.and_then(|values| match redirect {
                Some(table) => table.columns.decode(values),
                None => Err(MalformedRow::new("no redirect table")),
            })
        }),
    );

    page_rows
        .finish()
        .with_context(|| format!("Failed to read page dump: {:?}", page.dump.path()))?;
    if let (Some(rows), Some(table)) = (redirect_rows.as_mut(), redirect) {
        rows.finish()
            .with_context(|| format!("Failed to read redirect dump: {:?}", table.dump.path()))?;
    }
    Ok(directory)
}

pub fn load_link_targets(
    table: &LinkTargetTable,
    pages: &PageDirectory,
) -> Result<LinkTargetDirectory> {
    info!(path = ?table.dump.path(), "Loading linktarget table");
    let mut rows = table.dump.rows()?;
    let directory = LinkTargetDirectory::build(
        rows.by_ref()
            .map(|row| row.and_then(|values| table.columns.decode(values))),
        pages,
    );
    rows.finish()
        .with_context(|| format!("Failed to read linktarget dump: {:?}", table.dump.path()))?;
    Ok(directory)
}

/// `pagelinks` rows decoded under the declared schema, read segment-parallel.
pub struct DumpLinkSource {
    dump: SqlDump,
    columns: LinkColumns,
}

impl DumpLinkSource {
    pub fn open(path: &Path, schema: Schema) -> Result<Self> {
        let dump = SqlDump::open(path, "pagelinks")?;
        let columns = LinkColumns::bind(&dump, schema)?;
        Ok(Self { dump, columns })
    }

    pub fn path(&self) -> &Path {
        self.dump.path()
    }
}

impl LinkRowSource for DumpLinkSource {
    fn par_segments<R, F>(&self, limit: Option<u64>, f: F) -> Result<Vec<(usize, R)>>
    where
        R: Send,
        F: Fn(usize, &mut dyn Iterator<Item = RowResult<RawLinkRecord>>) -> R + Sync + Send,
    {
        let columns = self.columns;
        match limit {
            // A limited run reads the head of the file in order, as one segment
            Some(limit) => {
                let mut rows = self.dump.rows()?;
                let result = {
                    let mut records = rows
                        .by_ref()
                        .take(usize::try_from(limit).unwrap_or(usize::MAX))
                        .map(|row| row.and_then(|values| columns.decode(values)));
                    f(0, &mut records)
                };
                rows.finish()
                    .with_context(|| format!("Failed to read pagelinks dump: {:?}", self.path()))?;
                Ok(vec![(0, result)])
            }
            None => self.dump.par_map_segments(|seq, rows| {
                let mut records = rows.map(|row| row.and_then(|values| columns.decode(values)));
                f(seq, &mut records)
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn dump_text(table: &str, columns: &[&str], tuples: &[&str]) -> String {
        let mut text = format!("CREATE TABLE `{table}` (\n");
        for column in columns {
            text.push_str(&format!("  `{column}` int(11) NOT NULL,\n"));
        }
        text.push_str("  PRIMARY KEY (`x`)\n) ENGINE=InnoDB;\n");
        if !tuples.is_empty() {
            text.push_str(&format!(
                "INSERT INTO `{table}` VALUES {};\n",
                tuples.join(",")
            ));
        }
        text
    }

    fn write_dump(dir: &TempDir, name: &str, text: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, text).unwrap();
        path
    }

    fn collect(source: &DumpLinkSource, limit: Option<u64>) -> Vec<RowResult<RawLinkRecord>> {
        source
            .par_segments(limit, |_, rows| rows.collect::<Vec<_>>())
            .unwrap()
            .into_iter()
            .flat_map(|(_, rows)| rows)
            .collect()
    }

    #[test]
    fn decodes_page_rows() {
        let dir = TempDir::new().unwrap();
        let path = write_dump(
            &dir,
            "page.sql",
            &dump_text(
                "page",
                &["page_id", "page_namespace", "page_title", "page_is_redirect", "page_len"],
                &["(1,0,'Rust',0,120)", "(2,0,'Rust_lang',1,30)", "(3,0,NULL,0,1)"],
            ),
        );
        let table = PageTable::open(&path).unwrap();
        let dir = load_page_directory(&table, None).unwrap();
        assert_eq!(dir.len(), 2);
        assert!(dir.get(2).unwrap().is_redirect);
        assert_eq!(dir.stats().malformed_rows, 1);
    }

    #[test]
    fn attaches_redirects_and_skips_interwiki() {
        let dir = TempDir::new().unwrap();
        let page = write_dump(
            &dir,
            "page.sql",
            &dump_text(
                "page",
                &["page_id", "page_namespace", "page_title", "page_is_redirect"],
                &["(1,0,'A',0)", "(2,0,'B',1)", "(3,0,'C',1)"],
            ),
        );
        let redirect = write_dump(
            &dir,
            "redirect.sql",
            &dump_text(
                "redirect",
                &["rd_from", "rd_namespace", "rd_title", "rd_interwiki", "rd_fragment"],
                &["(2,0,'A','',NULL)", "(3,0,'Elsewhere','w',NULL)"],
            ),
        );
        let pages = PageTable::open(&page).unwrap();
        let redirects = RedirectTable::open(&redirect).unwrap();
        let directory = load_page_directory(&pages, Some(&redirects)).unwrap();
        assert_eq!(directory.get(2).unwrap().redirect_target, Some(1));
        assert_eq!(directory.get(3).unwrap().redirect_target, None);
        assert_eq!(directory.stats().redirects_interwiki, 1);
    }

    #[test]
    fn linktarget_without_namespace_fails_fast() {
        let dir = TempDir::new().unwrap();
        let path = write_dump(
            &dir,
            "lt.sql",
            &dump_text("linktarget", &["lt_id", "lt_title"], &["(10,'B')"]),
        );
        let err = LinkTargetTable::open(&path).err().unwrap();
        let schema = err.downcast_ref::<PipelineError>().unwrap();
        assert_eq!(schema.exit_code(), 2);
        assert!(err.to_string().contains("lt_namespace"));
    }

    #[test]
    fn link_targets_decode() {
        let dir = TempDir::new().unwrap();
        let page = write_dump(
            &dir,
            "page.sql",
            &dump_text(
                "page",
                &["page_id", "page_namespace", "page_title", "page_is_redirect"],
                &["(2,0,'B',0)"],
            ),
        );
        let lt = write_dump(
            &dir,
            "lt.sql",
            &dump_text(
                "linktarget",
                &["lt_id", "lt_namespace", "lt_title"],
                &["(10,0,'B')", "(11,10,'Infobox')", "(-1,0,'Bad')"],
            ),
        );
        let pages = load_page_directory(&PageTable::open(&page).unwrap(), None).unwrap();
        let targets = load_link_targets(&LinkTargetTable::open(&lt).unwrap(), &pages).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets.get(11).unwrap().namespace, 10);
        assert_eq!(targets.stats().malformed_rows, 1);
        assert_eq!(targets.stats().shared_titles, 1);
    }

    #[test]
    fn schema_layouts_are_never_guessed() {
        let dir = TempDir::new().unwrap();
        let legacy = write_dump(
            &dir,
            "legacy.sql",
            &dump_text(
                "pagelinks",
                &["pl_from", "pl_namespace", "pl_title", "pl_from_namespace"],
                &["(1,0,'B',0)"],
            ),
        );
        let modern = write_dump(
            &dir,
            "modern.sql",
            &dump_text(
                "pagelinks",
                &["pl_from", "pl_from_namespace", "pl_target_id"],
                &["(1,0,10)"],
            ),
        );

        let err = DumpLinkSource::open(&legacy, Schema::Modern).err().unwrap();
        assert!(err.to_string().contains("--schema legacy"));
        let err = DumpLinkSource::open(&modern, Schema::Legacy).err().unwrap();
        assert!(err.to_string().contains("--schema modern"));

        assert!(DumpLinkSource::open(&legacy, Schema::Legacy).is_ok());
        assert!(DumpLinkSource::open(&modern, Schema::Modern).is_ok());
    }

    #[test]
    fn link_rows_decode_per_schema() {
        let dir = TempDir::new().unwrap();
        let modern = write_dump(
            &dir,
            "modern.sql",
            &dump_text(
                "pagelinks",
                &["pl_from", "pl_from_namespace", "pl_target_id"],
                &["(1,0,10)", "(1,0,'x')", "(2,0,11)"],
            ),
        );
        let source = DumpLinkSource::open(&modern, Schema::Modern).unwrap();
        let rows = collect(&source, None);
        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows[0],
            Ok(RawLinkRecord::Modern {
                from: 1,
                from_namespace: 0,
                target_id: 10
            })
        );
        assert!(rows[1].is_err());

        let legacy = write_dump(
            &dir,
            "legacy.sql",
            &dump_text(
                "pagelinks",
                &["pl_from", "pl_namespace", "pl_title"],
                &["(1,0,'Some_title')"],
            ),
        );
        let source = DumpLinkSource::open(&legacy, Schema::Legacy).unwrap();
        assert_eq!(
            collect(&source, None),
            vec![Ok(RawLinkRecord::Legacy {
                from: 1,
                target_namespace: 0,
                target_title: "Some_title".to_string()
            })]
        );
    }

    #[test]
    fn limit_truncates_in_file_order() {
        let dir = TempDir::new().unwrap();
        let tuples: Vec<String> = (0..50).map(|i| format!("({i},0,{})", i + 100)).collect();
        let tuple_refs: Vec<&str> = tuples.iter().map(String::as_str).collect();
        let path = write_dump(
            &dir,
            "pl.sql",
            &dump_text(
                "pagelinks",
                &["pl_from", "pl_from_namespace", "pl_target_id"],
                &tuple_refs,
            ),
        );
        let source = DumpLinkSource::open(&path, Schema::Modern).unwrap();
        let rows = collect(&source, Some(5));
        let sources: Vec<u32> = rows
            .iter()
            .map(|r| r.as_ref().unwrap().from_page_id())
            .collect();
        assert_eq!(sources, vec![0, 1, 2, 3, 4]);
    }
}
