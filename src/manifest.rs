//! Manifest reader (spec.md §2 item 8): turns an input-file-list file into
//! an ordered, deduplicated `Vec<InputFile>`.

use std::path::Path;

use anyhow::{Context, Result};

use crate::schema::InputFile;

/// Read a manifest file: one path per line, blank lines skipped, each line
/// trimmed, duplicates dropped on first occurrence (order preserved).
pub fn read(path: &Path) -> Result<Vec<InputFile>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read manifest file {}", path.display()))?;

    let mut seen = std::collections::HashSet::new();
    let mut entries = Vec::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            entries.push(InputFile::new(trimmed));
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_blank_lines_and_trims() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.txt");
        std::fs::write(&path, "  /a.txt  \n\n/b.txt\n").unwrap();
        let entries = read(&path).unwrap();
        assert_eq!(
            entries,
            vec![InputFile::new("/a.txt"), InputFile::new("/b.txt")]
        );
    }

    #[test]
    fn dedups_on_first_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.txt");
        std::fs::write(&path, "/a.txt\n/b.txt\n/a.txt\n").unwrap();
        let entries = read(&path).unwrap();
        assert_eq!(entries, vec![InputFile::new("/a.txt"), InputFile::new("/b.txt")]);
    }

    #[test]
    fn missing_manifest_file_is_an_error() {
        let result = read(Path::new("/nonexistent/manifest.txt"));
        assert!(result.is_err());
    }
}
