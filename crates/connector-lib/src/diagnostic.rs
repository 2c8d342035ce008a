//! Diagnostic archives: crash reports found on disk and on-demand diagnostics
//!
//! Archives are written through the `ArchiveWriter` trait so that the same
//! content can be dumped to a directory, kept in memory or uploaded.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Marker file present while a crash report is being written.
pub const WRITE_IN_PROGRESS_MARKER: &str = "crash_report.in_progress";

/// Destination of diagnostic content
pub trait ArchiveWriter: Send {
    fn add_file(&mut self, name: &str, content: &[u8]) -> Result<()>;
}

/// Writes each archive entry as a file in a directory
#[derive(Debug, Clone)]
pub struct DirectoryArchive {
    root: PathBuf,
}

impl DirectoryArchive {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create directory {:?}", root))?;
        Ok(Self { root })
    }
}

impl ArchiveWriter for DirectoryArchive {
    fn add_file(&mut self, name: &str, content: &[u8]) -> Result<()> {
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        std::fs::write(&path, content).with_context(|| format!("Failed to write {:?}", path))
    }
}

/// Keeps archive entries in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.files
    }

    pub fn file_as_string(&self, name: &str) -> Option<String> {
        self.files
            .get(name)
            .map(|content| String::from_utf8_lossy(content).into_owned())
    }

    /// Concatenate every entry with a header, for a single text download.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (name, content) in &self.files {
            out.push_str(&format!("==> {} <==\n", name));
            out.push_str(&String::from_utf8_lossy(content));
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

impl ArchiveWriter for MemoryArchive {
    fn add_file(&mut self, name: &str, content: &[u8]) -> Result<()> {
        self.files.insert(name.to_string(), content.to_vec());
        Ok(())
    }
}

/// Kind of diagnostic, as expected by the upload endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Crash,
    OnDemand,
}

impl DiagnosticKind {
    pub fn as_api_type(&self) -> u8 {
        match self {
            DiagnosticKind::Crash => 0,
            DiagnosticKind::OnDemand => 1,
        }
    }
}

#[derive(Debug, Clone)]
enum Content {
    File(PathBuf),
    Memory(Arc<Vec<u8>>),
}

/// A diagnostic archive waiting for upload
#[derive(Debug, Clone)]
pub struct DiagnosticFile {
    pub filename: String,
    pub kind: DiagnosticKind,
    /// Token of the request that asked for an on-demand diagnostic
    pub request_token: String,
    content: Content,
}

impl DiagnosticFile {
    pub fn crash_report(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            filename,
            kind: DiagnosticKind::Crash,
            request_token: String::new(),
            content: Content::File(path),
        }
    }

    pub fn on_demand(filename: impl Into<String>, request_token: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            kind: DiagnosticKind::OnDemand,
            request_token: request_token.into(),
            content: Content::Memory(Arc::new(content)),
        }
    }

    pub fn size(&self) -> Result<u64> {
        match &self.content {
            Content::File(path) => Ok(std::fs::metadata(path)
                .with_context(|| format!("Failed to stat {:?}", path))?
                .len()),
            Content::Memory(content) => Ok(content.len() as u64),
        }
    }

    pub fn read(&self) -> Result<Vec<u8>> {
        match &self.content {
            Content::File(path) => {
                std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))
            }
            Content::Memory(content) => Ok(content.as_ref().clone()),
        }
    }
}

/// Where crash reports waiting for upload are found
pub trait DiagnosticSource: Send + Sync {
    fn crash_reports(&self) -> Result<Vec<DiagnosticFile>>;
}

/// Crash reports stored as `.zip` files in a directory
#[derive(Debug, Clone)]
pub struct CrashReportDirectory {
    dir: PathBuf,
}

impl CrashReportDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl DiagnosticSource for CrashReportDirectory {
    fn crash_reports(&self) -> Result<Vec<DiagnosticFile>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        if self.dir.join(WRITE_IN_PROGRESS_MARKER).exists() {
            debug!(dir = ?self.dir, "Crash report being written, not listing");
            return Ok(Vec::new());
        }

        let mut reports = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list crash reports in {:?}", self.dir))?;

        for entry in entries {
            let path = entry.context("Failed to read crash report entry")?.path();
            if path.is_file() && path.extension().map(|e| e == "zip").unwrap_or(false) {
                reports.push(DiagnosticFile::crash_report(path));
            }
        }

        reports.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(reports)
    }
}
