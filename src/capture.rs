//! Trace capture archives
//!
//! A capture is a zip archive written by the tracing parser run:
//!
//! | Entry | Content |
//! |-------|---------|
//! | `info.csv` | `capture_epoch_millis;nr_matchers;nr_nodes;tree_depth` |
//! | `matchers.csv` | `id;class_name;matcher_type;name` |
//! | `nodes.csv` | `parent_id;id;level;success;matcher_id;start;end;nanos` |
//! | `input.txt` | the parsed input, UTF-8 |
//!
//! CSV entries use `;` as separator and have no header row. Nodes are listed
//! in id order and the root has parent `-1`.

use crate::error::CaptureError;
use crate::model::{MatcherId, MatcherType, NodeId, ParseInfo, RuleInfo, TraceEvent};
use chrono::{DateTime, Utc};
use csv::StringRecord;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const INFO_ENTRY: &str = "info.csv";
pub const MATCHERS_ENTRY: &str = "matchers.csv";
pub const NODES_ENTRY: &str = "nodes.csv";
pub const INPUT_ENTRY: &str = "input.txt";

const SEPARATOR: u8 = b';';

/// An opened capture archive
///
/// The header (`info.csv`) is read eagerly; matchers and nodes are streamed
/// on demand so that large captures never sit in memory.
#[derive(Debug)]
pub struct TraceCapture {
    path: PathBuf,
    info: ParseInfo,
}

impl TraceCapture {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        let mut archive = open_archive(&path)?;
        let info = read_info(&mut archive)?;
        // Fail early on archives missing an entry rather than mid-ingestion
        for entry in [MATCHERS_ENTRY, NODES_ENTRY, INPUT_ENTRY] {
            archive.by_name(entry)?;
        }
        log::debug!(
            "Opened capture {}: {} matchers, {} nodes",
            path.display(),
            info.nr_matchers,
            info.nr_nodes
        );
        Ok(Self { path, info })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn parse_info(&self) -> &ParseInfo {
        &self.info
    }

    /// Read the whole input text
    pub fn input_text(&self) -> Result<String, CaptureError> {
        let mut archive = open_archive(&self.path)?;
        let mut entry = archive.by_name(INPUT_ENTRY)?;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        Ok(String::from_utf8(bytes)?)
    }

    /// Stream matcher declarations in file order
    pub fn for_each_matcher<F, E>(&self, mut f: F) -> Result<(), E>
    where
        F: FnMut(RuleInfo) -> Result<(), E>,
        E: From<CaptureError>,
    {
        let mut archive = open_archive(&self.path)?;
        let entry = archive.by_name(MATCHERS_ENTRY).map_err(CaptureError::from)?;
        let mut reader = csv_reader(entry);
        let mut record = StringRecord::new();
        let mut index: u64 = 0;

        while read_record(&mut reader, &mut record, MATCHERS_ENTRY)? {
            index += 1;
            let matcher_type: MatcherType = field(&record, 2, MATCHERS_ENTRY, index)?;
            let rule = RuleInfo {
                id: field(&record, 0, MATCHERS_ENTRY, index)?,
                class_name: text_field(&record, 1, MATCHERS_ENTRY, index)?,
                matcher_type,
                name: text_field(&record, 3, MATCHERS_ENTRY, index)?,
            };
            f(rule)?;
        }
        Ok(())
    }

    /// Stream invocations in file order, together with the id the capture
    /// gives them
    pub fn for_each_node<F, E>(&self, mut f: F) -> Result<(), E>
    where
        F: FnMut(NodeId, TraceEvent) -> Result<(), E>,
        E: From<CaptureError>,
    {
        let mut archive = open_archive(&self.path)?;
        let entry = archive.by_name(NODES_ENTRY).map_err(CaptureError::from)?;
        let mut reader = csv_reader(entry);
        let mut record = StringRecord::new();
        let mut index: u64 = 0;

        while read_record(&mut reader, &mut record, NODES_ENTRY)? {
            index += 1;
            let parent: i64 = field(&record, 0, NODES_ENTRY, index)?;
            let id: NodeId = field(&record, 1, NODES_ENTRY, index)?;
            let success: u8 = field(&record, 3, NODES_ENTRY, index)?;
            let event = TraceEvent {
                parent: if parent < 0 {
                    None
                } else {
                    Some(NodeId::try_from(parent).map_err(|_| {
                        invalid(NODES_ENTRY, index, format!("parent id {} out of range", parent))
                    })?)
                },
                level: field(&record, 2, NODES_ENTRY, index)?,
                success: match success {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(invalid(
                            NODES_ENTRY,
                            index,
                            format!("success flag must be 0 or 1, got {}", other),
                        )
                        .into())
                    }
                },
                matcher_id: field(&record, 4, NODES_ENTRY, index)?,
                start: field(&record, 5, NODES_ENTRY, index)?,
                end: field(&record, 6, NODES_ENTRY, index)?,
                nanos: field(&record, 7, NODES_ENTRY, index)?,
            };
            f(id, event)?;
        }
        Ok(())
    }
}

fn open_archive(path: &Path) -> Result<ZipArchive<File>, CaptureError> {
    let file = File::open(path)?;
    Ok(ZipArchive::new(file)?)
}

fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .delimiter(SEPARATOR)
        .has_headers(false)
        .flexible(true)
        .from_reader(reader)
}

fn read_record<R: Read>(
    reader: &mut csv::Reader<R>,
    record: &mut StringRecord,
    entry: &'static str,
) -> Result<bool, CaptureError> {
    reader
        .read_record(record)
        .map_err(|source| CaptureError::Csv { entry, source })
}

fn read_info(archive: &mut ZipArchive<File>) -> Result<ParseInfo, CaptureError> {
    let entry = archive.by_name(INFO_ENTRY)?;
    let mut reader = csv_reader(entry);
    let mut record = StringRecord::new();
    if !read_record(&mut reader, &mut record, INFO_ENTRY)? {
        return Err(invalid(INFO_ENTRY, 1, "missing header record"));
    }

    let millis: i64 = field(&record, 0, INFO_ENTRY, 1)?;
    let capture_date = DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| invalid(INFO_ENTRY, 1, format!("invalid timestamp {}", millis)))?;

    Ok(ParseInfo {
        capture_date,
        nr_matchers: field(&record, 1, INFO_ENTRY, 1)?,
        nr_nodes: field(&record, 2, INFO_ENTRY, 1)?,
        tree_depth: field(&record, 3, INFO_ENTRY, 1)?,
    })
}

fn invalid(entry: &'static str, record: u64, reason: impl Into<String>) -> CaptureError {
    CaptureError::InvalidRecord {
        entry,
        record,
        reason: reason.into(),
    }
}

fn text_field(
    record: &StringRecord,
    idx: usize,
    entry: &'static str,
    index: u64,
) -> Result<String, CaptureError> {
    record
        .get(idx)
        .map(str::to_string)
        .ok_or_else(|| invalid(entry, index, format!("missing column {}", idx + 1)))
}

fn field<T>(
    record: &StringRecord,
    idx: usize,
    entry: &'static str,
    index: u64,
) -> Result<T, CaptureError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = record
        .get(idx)
        .ok_or_else(|| invalid(entry, index, format!("missing column {}", idx + 1)))?;
    raw.trim().parse::<T>().map_err(|e| {
        invalid(
            entry,
            index,
            format!("column {} ('{}'): {}", idx + 1, raw, e),
        )
    })
}

// ============================================================================
// Writing captures
// ============================================================================

/// Assembles a capture archive
///
/// Levels and the tree depth are derived from the parent links, so callers
/// only describe the tree shape.
#[derive(Debug, Clone)]
pub struct CaptureBuilder {
    capture_date: DateTime<Utc>,
    input: String,
    matchers: Vec<RuleInfo>,
    nodes: Vec<TraceEvent>,
}

impl CaptureBuilder {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            capture_date: Utc::now(),
            input: input.into(),
            matchers: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn captured_at(mut self, date: DateTime<Utc>) -> Self {
        self.capture_date = date;
        self
    }

    /// Declare a rule
    pub fn rule(&mut self, class_name: &str, matcher_type: MatcherType, name: &str) -> MatcherId {
        let id = self.matchers.len() as MatcherId;
        self.matchers.push(RuleInfo {
            id,
            class_name: class_name.to_string(),
            matcher_type,
            name: name.to_string(),
        });
        id
    }

    /// Record an invocation; `parent` must already be recorded
    ///
    /// # Panics
    ///
    /// If `parent` does not name a node recorded earlier.
    pub fn node(
        &mut self,
        parent: Option<NodeId>,
        matcher_id: MatcherId,
        success: bool,
        start: usize,
        end: usize,
        nanos: u64,
    ) -> NodeId {
        let level = match parent {
            None => 0,
            Some(p) => self.nodes[p as usize].level + 1,
        };
        let id = self.nodes.len() as NodeId;
        self.nodes.push(TraceEvent {
            parent,
            level,
            matcher_id,
            success,
            start,
            end,
            nanos,
        });
        id
    }

    pub fn parse_info(&self) -> ParseInfo {
        ParseInfo {
            capture_date: self.capture_date,
            nr_matchers: self.matchers.len(),
            nr_nodes: self.nodes.len(),
            tree_depth: self.nodes.iter().map(|n| n.level + 1).max().unwrap_or(0),
        }
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<(), CaptureError> {
        let file = File::create(path.as_ref())?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let info = self.parse_info();
        let info_csv = to_csv(
            INFO_ENTRY,
            std::iter::once(vec![
                info.capture_date.timestamp_millis().to_string(),
                info.nr_matchers.to_string(),
                info.nr_nodes.to_string(),
                info.tree_depth.to_string(),
            ]),
        )?;

        let matchers_csv = to_csv(
            MATCHERS_ENTRY,
            self.matchers.iter().map(|m| {
                vec![
                    m.id.to_string(),
                    m.class_name.clone(),
                    m.matcher_type.to_string(),
                    m.name.clone(),
                ]
            }),
        )?;

        let nodes_csv = to_csv(
            NODES_ENTRY,
            self.nodes.iter().enumerate().map(|(id, n)| {
                vec![
                    n.parent.map(i64::from).unwrap_or(-1).to_string(),
                    id.to_string(),
                    n.level.to_string(),
                    u8::from(n.success).to_string(),
                    n.matcher_id.to_string(),
                    n.start.to_string(),
                    n.end.to_string(),
                    n.nanos.to_string(),
                ]
            }),
        )?;

        for (name, bytes) in [
            (INFO_ENTRY, info_csv.as_slice()),
            (MATCHERS_ENTRY, matchers_csv.as_slice()),
            (NODES_ENTRY, nodes_csv.as_slice()),
            (INPUT_ENTRY, self.input.as_bytes()),
        ] {
            zip.start_file(name, options)?;
            zip.write_all(bytes)?;
        }
        zip.finish()?;
        Ok(())
    }
}

fn to_csv<I>(entry: &'static str, rows: I) -> Result<Vec<u8>, CaptureError>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut writer = csv::WriterBuilder::new()
        .delimiter(SEPARATOR)
        .has_headers(false)
        .from_writer(Vec::new());
    for row in rows {
        writer
            .write_record(&row)
            .map_err(|source| CaptureError::Csv { entry, source })?;
    }
    writer
        .into_inner()
        .map_err(|e| CaptureError::Io(e.into_error()))
}
