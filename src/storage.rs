//! Session artifact storage and the append-only report log.
//!
//! Storage layout, per work unit (one directory per recording session):
//!
//! ```text
//! root/{sessionId}/chunk-{N}.<ext>                 audio input
//! root/{sessionId}/transcription-chunk-{N}.json    transcription output
//! root/{sessionId}/transcription-complete.json     completion marker
//! ```

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use crate::error::{BfError, BfResult};
use crate::model::BatchReport;

/// Object name of the per-session completion marker. Sessions carrying it
/// are skipped by the scanner without listing their chunks.
pub const COMPLETION_MARKER: &str = "transcription-complete.json";

const OUTPUT_PREFIX: &str = "transcription-chunk-";
const INPUT_PREFIX: &str = "chunk-";

/// Parse the chunk index out of an input object name (`chunk-{N}.<ext>`).
/// Output objects do not match: their prefix differs.
#[must_use]
pub fn input_chunk_index(name: &str) -> Option<u32> {
    let rest = name.strip_prefix(INPUT_PREFIX)?;
    let digits = rest.split('.').next()?;
    digits.parse().ok()
}

/// Parse the chunk index out of an output object name
/// (`transcription-chunk-{N}.json`).
#[must_use]
pub fn output_chunk_index(name: &str) -> Option<u32> {
    let rest = name.strip_prefix(OUTPUT_PREFIX)?;
    let digits = rest.strip_suffix(".json")?;
    digits.parse().ok()
}

/// Object name for the output artifact of chunk `index`.
#[must_use]
pub fn output_name(index: u32) -> String {
    format!("{OUTPUT_PREFIX}{index}.json")
}

/// Read/write surface over the session store. Injectable so the scanner and
/// pipeline can be tested against an in-memory tree.
pub trait ArtifactStore: Send + Sync {
    /// Unit identifiers in discovery order. Listing failure is an error,
    /// never an empty listing.
    fn list_units(&self) -> BfResult<Vec<String>>;
    /// Object names within one unit.
    fn list_objects(&self, unit: &str) -> BfResult<Vec<String>>;
    fn read(&self, unit: &str, name: &str) -> BfResult<Vec<u8>>;
    fn write(&self, unit: &str, name: &str, bytes: &[u8]) -> BfResult<()>;
    fn exists(&self, unit: &str, name: &str) -> BfResult<bool>;
}

// ---------------------------------------------------------------------------
// Filesystem store
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn unit_dir(&self, unit: &str) -> PathBuf {
        self.root.join(unit)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn list_units(&self) -> BfResult<Vec<String>> {
        let entries = fs::read_dir(&self.root).map_err(|error| {
            BfError::Storage(format!(
                "cannot list storage root `{}`: {error}",
                self.root.display()
            ))
        })?;

        let mut units = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|error| {
                BfError::Storage(format!("listing interrupted under storage root: {error}"))
            })?;
            if entry
                .file_type()
                .map_err(|error| BfError::Storage(error.to_string()))?
                .is_dir()
            {
                units.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        // Directory iteration order is platform-dependent; sort so repeated
        // scans discover units in a stable order.
        units.sort();
        Ok(units)
    }

    fn list_objects(&self, unit: &str) -> BfResult<Vec<String>> {
        let dir = self.unit_dir(unit);
        let entries = fs::read_dir(&dir).map_err(|error| {
            BfError::Storage(format!("cannot list unit `{}`: {error}", dir.display()))
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|error| {
                BfError::Storage(format!("listing interrupted in unit `{unit}`: {error}"))
            })?;
            if entry
                .file_type()
                .map_err(|error| BfError::Storage(error.to_string()))?
                .is_file()
            {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, unit: &str, name: &str) -> BfResult<Vec<u8>> {
        let path = self.unit_dir(unit).join(name);
        fs::read(&path).map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                BfError::MissingArtifact(path)
            } else {
                BfError::Storage(format!("cannot read `{}`: {error}", path.display()))
            }
        })
    }

    fn write(&self, unit: &str, name: &str, bytes: &[u8]) -> BfResult<()> {
        let dir = self.unit_dir(unit);
        fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        let tmp = dir.join(format!(".{name}.tmp"));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn exists(&self, unit: &str, name: &str) -> BfResult<bool> {
        Ok(self.unit_dir(unit).join(name).exists())
    }
}

// ---------------------------------------------------------------------------
// Report log
// ---------------------------------------------------------------------------

/// Append-only run history: one JSON line per [`BatchReport`]. Lines are
/// never rewritten or deleted.
#[derive(Debug)]
pub struct ReportLog {
    path: PathBuf,
}

impl ReportLog {
    #[must_use]
    pub fn new(state_dir: &std::path::Path) -> Self {
        Self {
            path: state_dir.join("batch-reports.jsonl"),
        }
    }

    pub fn append(&self, report: &BatchReport) -> BfResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(report)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Most recent `limit` reports, oldest first. Unparseable lines are
    /// skipped with a warning so one corrupt row cannot hide the history.
    pub fn recent(&self, limit: usize) -> BfResult<Vec<BatchReport>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new())
            }
            Err(error) => return Err(error.into()),
        };

        let mut reports = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<BatchReport>(line) {
                Ok(report) => reports.push(report),
                Err(error) => {
                    tracing::warn!(%error, "skipping unparseable report log line");
                }
            }
        }
        if reports.len() > limit {
            reports.drain(..reports.len() - limit);
        }
        Ok(reports)
    }
}
