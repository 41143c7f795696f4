use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone};

pub const RECORDING_PREFIX: &str = "recording_";

/// `recording_<YYYYMMDD_HHMMSS>.<ext>`
pub fn recording_file_name<Tz: TimeZone>(started: &DateTime<Tz>, ext: &str) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{}{}.{}",
        RECORDING_PREFIX,
        started.format("%Y%m%d_%H%M%S"),
        ext
    )
}

/// Creates `dir` if needed and returns a path that does not exist yet.
///
/// Two sessions started within the same second get `_1`, `_2`, ... suffixes.
pub fn next_recording_path<Tz: TimeZone>(
    dir: &Path,
    started: &DateTime<Tz>,
    ext: &str,
) -> io::Result<PathBuf>
where
    Tz::Offset: std::fmt::Display,
{
    std::fs::create_dir_all(dir)?;

    let name = recording_file_name(started, ext);
    let candidate = dir.join(&name);
    if !candidate.exists() {
        return Ok(candidate);
    }

    let stem = name.trim_end_matches(&format!(".{}", ext)).to_string();
    (1u32..)
        .map(|n| dir.join(format!("{}_{}.{}", stem, n, ext)))
        .find(|path| !path.exists())
        .ok_or_else(|| io::Error::new(io::ErrorKind::AlreadyExists, "no free recording name"))
}
