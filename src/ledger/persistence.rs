//! Append-only NDJSON ledger file: one signed JSON record per line.

use crate::error::LedgerError;
use crate::ledger::LineageEvent;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

pub struct NdjsonLedgerFile {
    path: PathBuf,
    file: File,
}

impl NdjsonLedgerFile {
    /// Open (creating parents as needed) and read back every record with its
    /// 1-based line number. Blank lines are skipped; any other undecodable
    /// line fails the open, except an unterminated last line left by an
    /// interrupted append, which is cut off.
    pub fn open(path: &Path) -> Result<(Self, Vec<(usize, LineageEvent)>), LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let mut raw = Vec::new();
        (&file).read_to_end(&mut raw)?;
        let terminated = raw.iter().rposition(|&b| b == b'\n').map_or(0, |end| end + 1);
        let (body, tail) = raw.split_at(terminated);

        let mut records = Vec::new();
        let mut lines = 0;
        for (idx, line) in body.split(|&b| b == b'\n').enumerate() {
            lines = idx;
            if is_blank(line) {
                continue;
            }
            let event: LineageEvent = serde_json::from_slice(line).map_err(|e| {
                LedgerError::Persistence(format!(
                    "corrupt record at line {} of {}: {}",
                    idx + 1,
                    path.display(),
                    e
                ))
            })?;
            records.push((idx + 1, event));
        }

        if !is_blank(tail) {
            let line = lines + 1;
            match serde_json::from_slice::<LineageEvent>(tail) {
                Ok(event) => {
                    (&file).write_all(b"\n")?;
                    records.push((line, event));
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        line,
                        bytes = tail.len(),
                        error = %e,
                        "Dropped torn ledger record"
                    );
                    file.set_len(body.len() as u64)?;
                    file.sync_data()?;
                }
            }
        }

        Ok((
            NdjsonLedgerFile {
                path: path.to_path_buf(),
                file,
            },
            records,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append records and sync them to disk.
    pub fn append(&mut self, events: &[LineageEvent]) -> Result<(), LedgerError> {
        let mut buf = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buf, event)
                .map_err(|e| LedgerError::Persistence(format!("encode {}: {}", event.event_id, e)))?;
            buf.push(b'\n');
        }
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        Ok(())
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

/// Encode events as NDJSON, one per line.
pub fn to_ndjson<'a, I>(events: I) -> String
where
    I: IntoIterator<Item = &'a LineageEvent>,
{
    let mut out = String::new();
    for event in events {
        if let Ok(line) = serde_json::to_string(event) {
            out.push_str(&line);
            out.push('\n');
        }
    }
    out
}

/// Decode an NDJSON body. Blank lines are skipped.
pub fn parse_ndjson(body: &str) -> Result<Vec<LineageEvent>, LedgerError> {
    body.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .map_err(|e| LedgerError::Sync(format!("bad record at line {}: {}", idx + 1, e)))
        })
        .collect()
}
