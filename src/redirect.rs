use crate::index::PageDirectory;
use crate::models::{PageRecord, RedirectFailure};
use tracing::trace;

/// Follows redirect chains over a built [`PageDirectory`]. Pure lookups, no I/O.
///
/// The hop bound defaults to [`crate::config::REDIRECT_MAX_HOPS`]. The live site renders a
/// redirect to a redirect without following it further, so long chains are treated as
/// broken rather than chased.
#[derive(Clone, Copy)]
pub struct RedirectResolver<'a> {
    pages: &'a PageDirectory,
    max_hops: u32,
}

impl<'a> RedirectResolver<'a> {
    pub fn new(pages: &'a PageDirectory, max_hops: u32) -> Self {
        Self { pages, max_hops }
    }

    pub fn max_hops(&self) -> u32 {
        self.max_hops
    }

    /// Returns the first non-redirect page reachable from `start` within the hop bound.
    /// A non-redirect `start` resolves to itself with zero hops.
    pub fn resolve(&self, start: &'a PageRecord) -> Result<&'a PageRecord, RedirectFailure> {
        self.resolve_with_hops(start).map(|(page, _)| page)
    }

    /// Like [`resolve`](Self::resolve), also reporting the number of hops taken.
    pub fn resolve_with_hops(
        &self,
        start: &'a PageRecord,
    ) -> Result<(&'a PageRecord, u32), RedirectFailure> {
        let mut current = start;
        let mut hops = 0u32;
        let mut visited: Vec<u32> = Vec::new();

        while current.is_redirect {
            if hops == self.max_hops {
                trace!(start = start.id, hops, "Redirect chain exceeds hop bound");
                return Err(RedirectFailure::TooManyHops);
            }
            let Some(next_id) = current.redirect_target else {
                return Err(RedirectFailure::Dangling);
            };
            visited.push(current.id);
            if visited.contains(&next_id) {
                trace!(start = start.id, at = next_id, "Redirect cycle");
                return Err(RedirectFailure::Cycle);
            }
            let Some(next) = self.pages.get(next_id) else {
                return Err(RedirectFailure::Dangling);
            };
            current = next;
            hops += 1;
        }
        Ok((current, hops))
    }
}
