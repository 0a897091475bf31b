//! Newline-delimited JSON flat files.
//!
//! These are blocking functions; async callers run them through
//! `tokio::task::spawn_blocking`. Rewrites go through a temporary file in
//! the target directory that is fsynced and renamed over the target, so a
//! reader never observes a half-written file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Create an empty file at `path` if nothing exists there.
pub fn ensure_file(path: &Path) -> StoreResult<()> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(format!("creating {}", path.display()), e))?;
    Ok(())
}

/// Replace the contents of `path` with one line per record.
pub fn write_all<T: Serialize>(path: &Path, records: &[T]) -> StoreResult<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let staged = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| StoreError::io(format!("staging {}", path.display()), e))?;

    {
        let mut out = BufWriter::new(staged.as_file());
        write_lines(&mut out, records)?;
        out.flush()
            .map_err(|e| StoreError::io(format!("writing {}", path.display()), e))?;
    }
    staged
        .as_file()
        .sync_all()
        .map_err(|e| StoreError::io(format!("syncing {}", path.display()), e))?;
    staged
        .persist(path)
        .map_err(|e| StoreError::io(format!("replacing {}", path.display()), e.error))?;

    debug!(path = %path.display(), records = records.len(), "flat file rewritten");
    Ok(())
}

/// Append one line per record to `path`, creating it if needed.
///
/// A trailing partial line left by an interrupted writer is terminated
/// first so the new records start on their own lines.
pub fn append<T: Serialize>(path: &Path, records: &[T]) -> StoreResult<()> {
    if records.is_empty() {
        return Ok(());
    }
    let ctx = |verb: &str| format!("{verb} {}", path.display());

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(ctx("opening"), e))?;

    let len = file
        .metadata()
        .map_err(|e| StoreError::io(ctx("inspecting"), e))?
        .len();
    let mut out = Vec::new();
    if len > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::Start(len - 1))
            .and_then(|_| file.read_exact(&mut last))
            .map_err(|e| StoreError::io(ctx("reading"), e))?;
        if last[0] != b'\n' {
            out.push(b'\n');
        }
    }
    write_lines(&mut out, records)?;

    file.write_all(&out)
        .and_then(|_| file.sync_all())
        .map_err(|e| StoreError::io(ctx("appending to"), e))?;

    debug!(path = %path.display(), records = records.len(), "flat file appended");
    Ok(())
}

/// Strict read used when attaching.
///
/// Blank lines are skipped, and so is an unterminated final line that does
/// not parse (an interrupted append). Any other malformed line fails.
pub fn load<T: DeserializeOwned>(path: &Path) -> StoreResult<Vec<T>> {
    let content = read_string(path)?;
    let mut records = Vec::new();

    for (idx, chunk) in content.split_inclusive('\n').enumerate() {
        let line = chunk.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) if !chunk.ends_with('\n') => {
                warn!(path = %path.display(), line = idx + 1, error = %e, "skipping partial trailing line");
            }
            Err(source) => {
                return Err(StoreError::Load {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    source,
                });
            }
        }
    }
    Ok(records)
}

/// Lenient read-back: every line that does not parse is skipped.
pub fn read_all<T: DeserializeOwned>(path: &Path) -> StoreResult<Vec<T>> {
    let content = read_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

fn read_string(path: &Path) -> StoreResult<String> {
    let mut content = String::new();
    File::open(path)
        .and_then(|mut f| f.read_to_string(&mut content))
        .map_err(|e| StoreError::io(format!("reading {}", path.display()), e))?;
    Ok(content)
}

fn write_lines<W: Write, T: Serialize>(out: &mut W, records: &[T]) -> StoreResult<()> {
    for record in records {
        serde_json::to_writer(&mut *out, record)?;
        out.write_all(b"\n")
            .map_err(|e| StoreError::io("writing record", e))?;
    }
    Ok(())
}
