use serde::Serialize;
use std::sync::Arc;

/// One row of the `page` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRow {
    pub id: u32,
    pub namespace: i32,
    pub title: String,
    pub is_redirect: bool,
}

/// One row of the `redirect` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRow {
    pub from: u32,
    pub namespace: i32,
    pub title: String,
    /// Non-empty for redirects that leave the wiki
    pub interwiki: Option<String>,
}

/// One row of the `linktarget` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTargetRow {
    pub id: u64,
    pub namespace: i32,
    pub title: String,
}

/// One row of `pagelinks`, in whichever layout the run declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLinkRecord {
    Legacy {
        from: u32,
        target_namespace: i32,
        target_title: String,
    },
    Modern {
        from: u32,
        from_namespace: i32,
        target_id: u64,
    },
}

impl RawLinkRecord {
    pub fn from_page_id(&self) -> u32 {
        match self {
            RawLinkRecord::Legacy { from, .. } | RawLinkRecord::Modern { from, .. } => *from,
        }
    }
}

/// A page as held by the directory. Titles are interned and shared with the title index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRecord {
    pub id: u32,
    pub namespace: i32,
    pub title: Arc<str>,
    pub is_redirect: bool,
    pub redirect_target: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTargetRecord {
    pub id: u64,
    pub namespace: i32,
    pub title: Arc<str>,
}

/// Canonical source -> canonical target. Ordering is `(source, target)`, which is the
/// order edges appear in `edges.csv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DirectedEdge {
    pub source: u32,
    pub target: u32,
}

impl DirectedEdge {
    pub fn new(source: u32, target: u32) -> Self {
        Self { source, target }
    }

    pub fn is_self_loop(&self) -> bool {
        self.source == self.target
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&self.source.to_le_bytes());
        buf[4..].copy_from_slice(&self.target.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: [u8; 8]) -> Self {
        Self {
            source: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            target: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// `(namespace, title)` names no existing page
    Redlink,
    /// `pl_target_id` is absent from the link-target directory
    MissingLinkTarget,
    /// Redirect chain was too long, cyclic, or pointed nowhere
    Redirect(RedirectFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectFailure {
    TooManyHops,
    Cycle,
    Dangling,
}

/// What happened to one raw link row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Edge(DirectedEdge),
    SelfLoop,
    SkippedNamespace,
    MissingSource,
    Unresolved(UnresolvedReason),
    Malformed,
}

impl LinkOutcome {
    pub fn edge(&self) -> Option<DirectedEdge> {
        match self {
            LinkOutcome::Edge(edge) => Some(*edge),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_bytes_roundtrip() {
        let edge = DirectedEdge::new(7, u32::MAX - 3);
        assert_eq!(DirectedEdge::from_bytes(edge.to_bytes()), edge);
    }

    #[test]
    fn edges_sort_by_source_then_target() {
        let mut edges = vec![
            DirectedEdge::new(2, 1),
            DirectedEdge::new(1, 9),
            DirectedEdge::new(1, 3),
        ];
        edges.sort();
        assert_eq!(
            edges,
            vec![
                DirectedEdge::new(1, 3),
                DirectedEdge::new(1, 9),
                DirectedEdge::new(2, 1),
            ]
        );
    }

    #[test]
    fn raw_record_exposes_source() {
        let legacy = RawLinkRecord::Legacy {
            from: 4,
            target_namespace: 0,
            target_title: "B".to_string(),
        };
        let modern = RawLinkRecord::Modern {
            from: 5,
            from_namespace: 0,
            target_id: 10,
        };
        assert_eq!(legacy.from_page_id(), 4);
        assert_eq!(modern.from_page_id(), 5);
    }
}
