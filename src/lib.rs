//! Linkgraph: Wikipedia link-graph resolution and CSV export
//!
//! This crate turns the `page`, `redirect`, `linktarget` and `pagelinks` SQL dumps of a
//! MediaWiki site into a deduplicated, namespace-filtered, redirect-resolved directed
//! graph written as `nodes.csv` and `edges.csv` for bulk graph import:
//!
//! 1. **Directory Pass** -- Stream the `page` and `redirect` dumps (and `linktarget` under
//!    the modern schema) into immutable in-memory directories keyed by id and title
//! 2. **Pre-flight Gate** -- Resolve a seeded, position-uniform sample of link rows and
//!    refuse to start when malformed or unresolvable rows dominate
//! 3. **Resolution Pass** -- Resolve every link row in parallel, canonicalizing both
//!    endpoints through redirects, and spill surviving edges into source-range shards
//! 4. **Reduction and Export** -- Sort and deduplicate each shard in order, stream the
//!    globally sorted edges into staged CSV files and derive the node set
//! 5. **Post-run Gate** -- Reconcile counters against written rows, check referential
//!    integrity and re-derive a sample of edges from the raw stream, then commit
//!
//! # Architecture
//!
//! - **Streaming SQL parsing** -- Dumps are never loaded whole; `INSERT` statements are
//!   tokenized tuple by tuple, and uncompressed dumps are split into byte-range segments
//! - **Explicit schema** -- The pagelinks layout is declared by the caller and checked
//!   against the `CREATE TABLE` block before any row is read
//! - **Bounded memory dedup** -- Edges spill to per-source-range shard files that are
//!   sorted independently, so the full edge set never sits in memory
//! - **Staged artifacts** -- Everything is written to `*.tmp` and renamed only when both
//!   gates pass, so a failed run never replaces earlier artifacts
//! - **Reproducible** -- Fixed seeds and sorted output make reruns byte-identical
//!
//! # Key Modules
//!
//! - [`parser`] -- Streaming SQL dump reader with bz2/gzip decompression
//! - [`tables`] -- Column binding and typed row decoding per table
//! - [`index`] -- Page and link-target directories
//! - [`redirect`] -- Bounded redirect chain resolution
//! - [`resolve`] -- Per-row link resolution and the parallel resolution pass
//! - [`merge`] -- Spill shards and the sorted dedup reduction
//! - [`export`] -- Staged CSV artifacts and artifact verification
//! - [`validate`] -- Pre-flight sampling, bias test and post-run reconciliation
//! - [`stats`] -- Outcome counters
//! - [`report`] -- Run report and console summary
//! - [`pipeline`] -- End-to-end orchestration
//! - [`config`] -- Constants, thresholds and run configuration
//!
//! # Example Usage
//!
//! ```bash
//! # Full run against a modern dump set
//! linkgraph resolve-links --schema modern \
//!     --page enwiki-page.sql.gz --redirect enwiki-redirect.sql.gz \
//!     --linktarget enwiki-linktarget.sql.gz --pagelinks enwiki-pagelinks.sql.gz \
//!     -o output/
//!
//! # Smoke run over the first million link rows (writes *.smoke.csv)
//! linkgraph resolve-links --schema modern ... -o output/ --limit 1000000
//!
//! # Re-check committed artifacts
//! linkgraph verify-csvs -o output/
//! ```

pub mod config;
pub mod error;
pub mod export;
pub mod index;
pub mod merge;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod redirect;
pub mod report;
pub mod resolve;
pub mod stats;
pub mod tables;
pub mod validate;
