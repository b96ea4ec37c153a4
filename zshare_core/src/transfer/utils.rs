use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::constants::MAX_FILENAME_LENGTH;
use super::protocol::MetaData;
use crate::ReceivedFile;
use crate::error::ValidationError;

const FALLBACK_NAME: &str = "unknown_file";

/// Extensions longer than this are not worth keeping when a name is cut short
const MAX_KEPT_EXTENSION: usize = 20;

const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Check announced metadata against the receiver's limits
pub fn validate_metadata(meta: &MetaData, max_size: u64) -> Result<(), ValidationError> {
    if meta.size > max_size {
        return Err(ValidationError::TooLarge {
            size: meta.size,
            max: max_size,
        });
    }
    if meta.name.len() > MAX_FILENAME_LENGTH * 4 {
        return Err(ValidationError::NameTooLong(meta.name.len()));
    }
    Ok(())
}

/// Reduce a peer-supplied name to a single safe path component
pub fn sanitize_file_name(file_name: &str) -> String {
    let last = file_name.rsplit(['/', '\\']).next().unwrap_or_default();
    let clean: String = last.chars().filter(|c| !c.is_control()).collect();

    let trimmed = clean.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return FALLBACK_NAME.to_string();
    }
    let stem = trimmed.split('.').next().unwrap_or_default();
    if RESERVED_NAMES.iter().any(|r| stem.eq_ignore_ascii_case(r)) {
        return FALLBACK_NAME.to_string();
    }

    if clean.len() <= MAX_FILENAME_LENGTH {
        return clean;
    }
    match clean.rfind('.') {
        Some(dot) if clean.len() - dot < MAX_KEPT_EXTENSION => {
            let ext = &clean[dot..];
            let base = truncate_at_char(&clean[..dot], MAX_FILENAME_LENGTH - ext.len());
            format!("{}{}", base, ext)
        }
        _ => truncate_at_char(&clean, MAX_FILENAME_LENGTH).to_string(),
    }
}

fn truncate_at_char(s: &str, max: usize) -> &str {
    let mut cut = max.min(s.len());
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}

/// Create a file only the owner can read (0o600 on Unix). Fails if it exists.
pub async fn open_secure_file(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

/// `name.ext`, then `name (1).ext`, `name (2).ext`, ... until one is free
fn candidate_path(dir: &Path, name: &str, attempt: u32) -> PathBuf {
    if attempt == 0 {
        return dir.join(name);
    }
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    };
    dir.join(format!("{} ({}){}", stem, attempt, ext))
}

/// Write a completed download into `dir` without overwriting anything there.
/// Returns the path actually used.
pub async fn save_received(dir: &Path, file: &ReceivedFile) -> io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let name = sanitize_file_name(&file.meta.name);

    let mut attempt = 0;
    let (path, mut out) = loop {
        let path = candidate_path(dir, &name, attempt);
        match open_secure_file(&path).await {
            Ok(out) => break (path, out),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < 10_000 => attempt += 1,
            Err(e) => return Err(e),
        }
    };

    out.write_all(&file.data).await?;
    out.flush().await?;
    info!(
        "Saved {} ({}) to {}",
        file.meta.name,
        human_file_size(file.data.len() as u64),
        path.display()
    );
    Ok(path)
}

/// Bytes per second for display
pub fn format_bitrate(bytes_per_sec: f64) -> String {
    if !bytes_per_sec.is_finite() || bytes_per_sec <= 0.0 {
        return "Starting...".to_string();
    }
    if bytes_per_sec > 1_000_000.0 {
        format!("{:.2} MB/s", bytes_per_sec / 1_000_000.0)
    } else if bytes_per_sec > 1_000.0 {
        format!("{:.1} KB/s", bytes_per_sec / 1_000.0)
    } else {
        format!("{:.0} B/s", bytes_per_sec)
    }
}

pub fn human_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
