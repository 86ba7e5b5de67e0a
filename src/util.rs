//! Small shared helpers: atomic file writes and time conversions.

use std::fs;
use std::io::{self, Write};

use camino::Utf8Path;

/// Write `contents` to `path`, replacing any existing file atomically.
///
/// Writes to a temporary file in the same directory first, then renames it
/// over `path`, so a crash mid-write never leaves a truncated file behind.
/// Used by every cache's `checkpoint()`.
pub fn write_file(path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .expect("a checkpoint path must be a file, so it must have a parent");
    fs::create_dir_all(dir)?;

    let mut tmp_file = tempfile::Builder::new().tempfile_in(dir)?;
    tmp_file.as_file_mut().write_all(contents)?;
    tmp_file.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/// The current Unix timestamp, in seconds. The queue fabric, caches and
/// trust engine all key TTL/validity checks off this rather than
/// `SystemTime` directly, so tests can inject fixed clocks.
pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is set before 1970")
        .as_secs() as i64
}
