//! Loaders for the plain-text side files that gate registration and
//! connection setup: IP/UUID ban lists, the optional name whitelist, banned
//! word list, and the UUID-to-account device binding log.
//!
//! All of them share the same line format: one token per line, blank lines
//! and lines starting with `#` ignored.

use std::fs;
use std::io;
use std::path::Path;

pub fn load_lines(path: &Path) -> io::Result<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

pub fn contains_exact(list: &[String], needle: &str) -> bool {
    list.iter().any(|entry| entry == needle)
}

/// Device binding file lines are `uuid|name`. Counts how many distinct
/// accounts a given device UUID has already registered.
pub fn count_uuid_bindings(bindings_path: &Path, uuid: &str) -> io::Result<usize> {
    Ok(load_lines(bindings_path)?
        .iter()
        .filter(|line| line.split('|').next() == Some(uuid))
        .count())
}

pub fn append_line(path: &Path, line: &str) -> io::Result<()> {
    use std::io::Write;
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}
