//! Streaming reader for MediaWiki SQL table dumps (`*.sql`, `*.sql.gz`, `*.sql.bz2`).
//!
//! A dump is a `CREATE TABLE` block followed by long `INSERT INTO ... VALUES (..),(..);`
//! lines. The header is parsed once for column names; the data lines are parsed tuple by
//! tuple without materializing the table.
//!
//! Uncompressed dumps are split into byte ranges aligned to line starts so every worker
//! reads through its own file handle. Compressed dumps cannot be seeked, so a single
//! decoder feeds line batches to the worker pool instead.

use crate::config::{READ_BUFFER_SIZE, SEGMENTS_PER_THREAD, SEGMENT_BYTES};
use crate::error::{MalformedRow, PipelineError, RowResult};
use anyhow::{Context, Result};
use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use memchr::{memchr2, memmem};
use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Cursor, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

static CREATE_TABLE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^CREATE TABLE `([^`]+)` \(").unwrap());

static COLUMN_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s+`([^`]+)`\s+\w").unwrap());

/// Byte ranges smaller than this are not worth a separate file handle.
const MIN_RANGE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
}

impl Compression {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("gz") => Compression::Gzip,
            Some("bz2") => Compression::Bzip2,
            _ => Compression::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// An opened table dump with its parsed column header.
#[derive(Debug, Clone)]
pub struct SqlDump {
    path: PathBuf,
    table: String,
    columns: Vec<String>,
    compression: Compression,
    insert_prefix: Arc<[u8]>,
    /// Offset of the first `INSERT` line (uncompressed dumps only)
    data_offset: u64,
    len: u64,
}

impl SqlDump {
    /// Opens `path` and reads the `CREATE TABLE` header. The dump must declare `table`.
    pub fn open(path: impl AsRef<Path>, table: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let compression = Compression::from_path(&path);
        let len = fs::metadata(&path)
            .with_context(|| format!("Failed to read metadata for dump: {:?}", path))?
            .len();
        let mut reader = open_reader(&path, compression)
            .with_context(|| format!("Failed to open dump: {:?}", path))?;

        let insert_prefix: Arc<[u8]> = format!("INSERT INTO `{table}` VALUES ").into_bytes().into();
        let mut columns = Vec::new();
        let mut declared_table: Option<String> = None;
        let mut in_create = false;
        let mut offset = 0u64;
        let mut data_offset = None;
        let mut line = Vec::new();

        loop {
            line.clear();
            let n = reader
                .read_until(b'\n', &mut line)
                .with_context(|| format!("Failed to read dump header: {:?}", path))?;
            if n == 0 {
                break;
            }
            if line.starts_with(b"INSERT INTO ") {
                data_offset = Some(offset);
                break;
            }
            offset += n as u64;

            let text = String::from_utf8_lossy(&line);
            if in_create {
                if text.starts_with(')') {
                    in_create = false;
                } else if let Some(caps) = COLUMN_REGEX.captures(&text) {
                    columns.push(caps[1].to_string());
                }
            } else if let Some(caps) = CREATE_TABLE_REGEX.captures(&text) {
                declared_table = Some(caps[1].to_string());
                in_create = true;
            }
        }

        match declared_table {
            None => {
                return Err(PipelineError::schema(
                    table,
                    format!(
                        "{:?} has no CREATE TABLE header; column layout cannot be verified",
                        path
                    ),
                )
                .into())
            }
            Some(ref declared) if declared != table => {
                return Err(PipelineError::schema(
                    table,
                    format!("{:?} declares table `{}`", path, declared),
                )
                .into())
            }
            Some(_) => {}
        }

        debug!(
            table = table,
            columns = ?columns,
            compression = ?compression,
            "Dump header parsed"
        );

        Ok(Self {
            path,
            table: table.to_string(),
            columns,
            compression,
            insert_prefix,
            data_offset: data_offset.unwrap_or(len),
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Resolves each required column to its position, failing on the first absent one.
    pub fn require_columns(&self, names: &[&str]) -> Result<Vec<usize>, PipelineError> {
        names
            .iter()
            .map(|name| {
                self.column_index(name).ok_or_else(|| {
                    PipelineError::schema(
                        &self.table,
                        format!(
                            "required column `{}` is absent (found: {})",
                            name,
                            self.columns.join(", ")
                        ),
                    )
                })
            })
            .collect()
    }

    /// Sequential rows over the whole dump in file order.
    pub fn rows(&self) -> Result<SegmentRows<Box<dyn BufRead + Send>>> {
        let reader = open_reader(&self.path, self.compression)
            .with_context(|| format!("Failed to open dump: {:?}", self.path))?;
        Ok(SegmentRows::new(
            reader,
            self.insert_prefix.clone(),
            0,
            u64::MAX,
        ))
    }

    /// Runs `f` over every segment of the dump on the rayon pool. Results are returned in
    /// segment order, tagged with the segment sequence number.
    pub fn par_map_segments<R, F>(&self, f: F) -> Result<Vec<(usize, R)>>
    where
        R: Send,
        F: Fn(usize, &mut dyn Iterator<Item = RowResult<Vec<SqlValue>>>) -> R + Sync + Send,
    {
        let mut results = match self.compression {
            Compression::None => {
                let ranges = self.byte_ranges(rayon::current_num_threads() * SEGMENTS_PER_THREAD);
                ranges
                    .into_par_iter()
                    .enumerate()
                    .map(|(seq, (start, end))| {
                        let prefix = self.insert_prefix.clone();
                        let mut rows = open_range(&self.path, start, end, prefix).with_context(|| {
                            format!("Failed to open dump segment: {:?}", self.path)
                        })?;
                        let result = f(seq, &mut rows);
                        rows.finish().with_context(|| {
                            format!("Failed to read dump segment: {:?}", self.path)
                        })?;
                        Ok((seq, result))
                    })
                    .collect::<Result<Vec<_>>>()?
            }
            Compression::Gzip | Compression::Bzip2 => {
                let reader = open_reader(&self.path, self.compression)
                    .with_context(|| format!("Failed to open dump: {:?}", self.path))?;
                LineBatches::new(reader)
                    .enumerate()
                    .par_bridge()
                    .map(|(seq, batch)| {
                        let batch = batch
                            .with_context(|| format!("Failed to decode dump: {:?}", self.path))?;
                        let mut rows = SegmentRows::new(
                            Cursor::new(batch),
                            self.insert_prefix.clone(),
                            0,
                            u64::MAX,
                        );
                        let result = f(seq, &mut rows);
                        rows.finish()?;
                        Ok((seq, result))
                    })
                    .collect::<Result<Vec<_>>>()?
            }
        };
        results.sort_unstable_by_key(|(seq, _)| *seq);
        Ok(results)
    }

    /// Splits the data section into at most `max_ranges` contiguous byte ranges.
    fn byte_ranges(&self, max_ranges: usize) -> Vec<(u64, u64)> {
        let span = self.len.saturating_sub(self.data_offset);
        let count = (span / MIN_RANGE_BYTES).clamp(1, max_ranges.max(1) as u64);
        (0..count)
            .map(|i| {
                let start = self.data_offset + span * i / count;
                let end = self.data_offset + span * (i + 1) / count;
                (start, end)
            })
            .collect()
    }
}

fn open_reader(path: &Path, compression: Compression) -> io::Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    Ok(match compression {
        Compression::None => Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, file)),
        Compression::Gzip => Box::new(BufReader::with_capacity(
            READ_BUFFER_SIZE,
            MultiGzDecoder::new(file),
        )),
        Compression::Bzip2 => Box::new(BufReader::with_capacity(
            READ_BUFFER_SIZE,
            MultiBzDecoder::new(file),
        )),
    })
}

/// Opens the rows whose line starts in `[start, end)`.
fn open_range(
    path: &Path,
    start: u64,
    end: u64,
    prefix: Arc<[u8]>,
) -> io::Result<SegmentRows<BufReader<File>>> {
    let mut file = File::open(path)?;
    if start == 0 {
        return Ok(SegmentRows::new(
            BufReader::with_capacity(READ_BUFFER_SIZE, file),
            prefix,
            0,
            end,
        ));
    }
    // Step back one byte: if it is the newline ending the previous line, `start` is
    // itself a line start and nothing is skipped.
    file.seek(SeekFrom::Start(start - 1))?;
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
    let mut partial = Vec::new();
    let skipped = reader.read_until(b'\n', &mut partial)?;
    Ok(SegmentRows::new(reader, prefix, start - 1 + skipped as u64, end))
}

/// Tuples of every `INSERT` line whose first byte lies before `end`.
pub struct SegmentRows<R> {
    reader: R,
    prefix: Arc<[u8]>,
    offset: u64,
    end: u64,
    line: Vec<u8>,
    pos: usize,
    done: bool,
    error: Option<io::Error>,
}

impl<R: BufRead> SegmentRows<R> {
    fn new(reader: R, prefix: Arc<[u8]>, offset: u64, end: u64) -> Self {
        Self {
            reader,
            prefix,
            offset,
            end,
            line: Vec::new(),
            pos: 0,
            done: false,
            error: None,
        }
    }

    /// Surfaces an I/O error that cut the segment short.
    pub fn finish(&mut self) -> io::Result<()> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn read_insert_line(&mut self) -> bool {
        loop {
            if self.offset >= self.end {
                return false;
            }
            self.line.clear();
            match self.reader.read_until(b'\n', &mut self.line) {
                Ok(0) => return false,
                Ok(n) => {
                    self.offset += n as u64;
                    if self.line.starts_with(&self.prefix) {
                        self.pos = self.prefix.len();
                        return true;
                    }
                }
                Err(e) => {
                    self.error = Some(e);
                    return false;
                }
            }
        }
    }
}

impl<R: BufRead> Iterator for SegmentRows<R> {
    type Item = RowResult<Vec<SqlValue>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = next_tuple(&self.line, &mut self.pos) {
                return Some(row);
            }
            if self.done || !self.read_insert_line() {
                self.done = true;
                return None;
            }
        }
    }
}

/// Whole lines from a sequential decoder, grouped into batches of about `SEGMENT_BYTES`.
struct LineBatches<R> {
    reader: R,
    done: bool,
}

impl<R> LineBatches<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for LineBatches<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut batch = Vec::new();
        loop {
            match self.reader.read_until(b'\n', &mut batch) {
                Ok(0) => {
                    self.done = true;
                    break;
                }
                Ok(_) if batch.len() >= SEGMENT_BYTES => break,
                Ok(_) => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        if batch.is_empty() {
            None
        } else {
            Some(Ok(batch))
        }
    }
}

/// Parses the next tuple at `pos`, or returns `None` once the line is exhausted.
/// A malformed tuple is reported once and parsing resumes at the following tuple.
pub fn next_tuple(buf: &[u8], pos: &mut usize) -> Option<RowResult<Vec<SqlValue>>> {
    while *pos < buf.len() && matches!(buf[*pos], b',' | b';' | b' ' | b'\n' | b'\r') {
        *pos += 1;
    }
    if *pos >= buf.len() {
        return None;
    }
    let start = *pos;
    match parse_tuple(buf, pos) {
        Ok(values) => Some(Ok(values)),
        Err(reason) => {
            *pos = match memmem::find(&buf[start + 1..], b"),(") {
                Some(idx) => start + 1 + idx + 2,
                None => buf.len(),
            };
            Some(Err(MalformedRow::new(format!(
                "{} (tuple at byte {})",
                reason, start
            ))))
        }
    }
}

fn parse_tuple(buf: &[u8], pos: &mut usize) -> Result<Vec<SqlValue>, String> {
    if buf[*pos] != b'(' {
        return Err(format!("expected '(' but found {:?}", buf[*pos] as char));
    }
    *pos += 1;
    let mut values = Vec::with_capacity(8);
    loop {
        values.push(parse_value(buf, pos)?);
        match buf.get(*pos) {
            Some(b',') => *pos += 1,
            Some(b')') => {
                *pos += 1;
                return Ok(values);
            }
            Some(&c) => return Err(format!("unexpected {:?} after value", c as char)),
            None => return Err("unterminated tuple".to_string()),
        }
    }
}

fn parse_value(buf: &[u8], pos: &mut usize) -> Result<SqlValue, String> {
    match buf.get(*pos) {
        Some(b'\'') => parse_string(buf, pos).map(SqlValue::Text),
        Some(_) => {
            let rest = &buf[*pos..];
            let len = memchr2(b',', b')', rest).ok_or("unterminated value")?;
            let token = &rest[..len];
            *pos += len;
            parse_token(token)
        }
        None => Err("unterminated tuple".to_string()),
    }
}

fn parse_token(token: &[u8]) -> Result<SqlValue, String> {
    let text = std::str::from_utf8(token)
        .map_err(|_| "non-UTF-8 bare value".to_string())?
        .trim();
    if text.eq_ignore_ascii_case("NULL") {
        return Ok(SqlValue::Null);
    }
    if let Ok(v) = text.parse::<i64>() {
        return Ok(SqlValue::Int(v));
    }
    if let Ok(v) = text.parse::<f64>() {
        return Ok(SqlValue::Float(v));
    }
    Err(format!("unrecognized value {:?}", text))
}

fn parse_string(buf: &[u8], pos: &mut usize) -> Result<String, String> {
    *pos += 1;
    let mut out = Vec::new();
    loop {
        let rest = &buf[*pos..];
        let idx = memchr2(b'\\', b'\'', rest).ok_or("unterminated string")?;
        out.extend_from_slice(&rest[..idx]);
        *pos += idx;
        if buf[*pos] == b'\'' {
            // '' is an escaped quote
            if buf.get(*pos + 1) == Some(&b'\'') {
                out.push(b'\'');
                *pos += 2;
                continue;
            }
            *pos += 1;
            break;
        }
        let escaped = *buf.get(*pos + 1).ok_or("dangling escape")?;
        out.push(match escaped {
            b'n' => b'\n',
            b'r' => b'\r',
            b't' => b'\t',
            b'0' => 0,
            b'b' => 0x08,
            b'Z' => 0x1a,
            other => other,
        });
        *pos += 2;
    }
    Ok(match String::from_utf8(out) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    })
}
