use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::events::SessionSummary;

/// Proxy-wide index of finished sessions, one JSON object per line.
pub const SESSION_LIST_FILE: &str = ".session_list";

/// Logs with fewer events than this are renamed with a `.scan` suffix.
pub const SCAN_THRESHOLD: usize = 10;

/// On-disk JSON array of a session's events.
///
/// `[` is written on open, events are joined with `,\n`, and `\n]` closes
/// the array in [`SessionLog::finalize`]. Write failures are logged and
/// the log goes quiet; they never interrupt the relay.
#[derive(Debug)]
pub struct SessionLog {
    dir: PathBuf,
    filename: String,
    file: Option<File>,
    entries: usize,
}

impl SessionLog {
    pub fn open(dir: &Path, session_key: &str) -> Self {
        let filename = format!("{session_key}.log.json");
        let file = match open_append(dir, &filename) {
            Ok(mut f) => match f.write_all(b"[\n") {
                Ok(()) => Some(f),
                Err(e) => {
                    warn!(file = %filename, error = %e, "Session log write failed");
                    None
                }
            },
            Err(e) => {
                warn!(file = %filename, error = %e, "Session log open failed");
                None
            }
        };
        Self {
            dir: dir.to_path_buf(),
            filename,
            file,
            entries: 0,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }

    pub fn append(&mut self, event_json: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let result = if self.entries == 0 {
            file.write_all(event_json.as_bytes())
        } else {
            file.write_all(b",\n")
                .and_then(|_| file.write_all(event_json.as_bytes()))
        };
        match result {
            Ok(()) => self.entries += 1,
            Err(e) => {
                warn!(file = %self.filename, error = %e, "Session log write failed");
                self.file = None;
            }
        }
    }

    /// Close the array and, for short sessions, move the file to `<name>.scan`.
    /// Returns the final file name. Further appends are ignored.
    pub fn finalize(&mut self, event_count: usize) -> String {
        let Some(mut file) = self.file.take() else {
            return self.filename.clone();
        };
        if let Err(e) = file.write_all(b"\n]").and_then(|_| file.flush()) {
            warn!(file = %self.filename, error = %e, "Session log close failed");
        }
        drop(file);

        if event_count < SCAN_THRESHOLD {
            let scan_name = format!("{}.scan", self.filename);
            match std::fs::rename(self.path(), self.dir.join(&scan_name)) {
                Ok(()) => self.filename = scan_name,
                Err(e) => warn!(
                    file = %self.filename,
                    error = %e,
                    "Renaming short session log failed"
                ),
            }
        }
        self.filename.clone()
    }
}

fn open_append(dir: &Path, filename: &str) -> Result<File> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating session folder: {}", dir.display()))?;
    let path = dir.join(filename);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening session log: {}", path.display()))
}

/// Append one summary line to `<dir>/.session_list`.
pub fn append_index(dir: &Path, summary: &SessionSummary) -> Result<()> {
    let mut line = serde_json::to_string(summary).context("serializing session summary")?;
    line.push('\n');
    let mut file = open_append(dir, SESSION_LIST_FILE)?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("writing {}", SESSION_LIST_FILE))
}

/// Read back the session index.
pub fn read_index(dir: &Path) -> Result<Vec<SessionSummary>> {
    let path = dir.join(SESSION_LIST_FILE);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).context("parsing session summary"))
        .collect()
}
