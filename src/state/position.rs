// Schema position - number of schema-log lines the receiver has confirmed.
//
// Stored as a single decimal integer. Written with the same temp-file plus
// rename as the other state files so a crash never leaves a torn number.

use crate::error::Result;
use crate::state::write_atomic;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct SchemaPosition {
    path: PathBuf,
    lines: u64,
}

impl SchemaPosition {
    /// Load the confirmed position; a missing file means nothing was sent yet.
    pub fn load(path: &Path) -> Result<Self> {
        let lines = match fs::read_to_string(path) {
            Ok(content) => parse_position(&content).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "schema position file {} does not hold a line count: {:?}",
                        path.display(),
                        content.trim()
                    ),
                )
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            lines,
        })
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// Persist a newly confirmed position. Never moves backwards.
    pub fn advance(&mut self, lines: u64) -> Result<()> {
        if lines < self.lines {
            tracing::warn!(
                "Refusing to move schema position back from {} to {}",
                self.lines,
                lines
            );
            return Ok(());
        }
        if lines == self.lines && self.path.exists() {
            return Ok(());
        }

        write_atomic(&self.path, |file| {
            use std::io::Write;
            writeln!(file, "{}", lines)
        })?;
        self.lines = lines;
        Ok(())
    }
}

fn parse_position(content: &str) -> Option<u64> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Some(0);
    }
    trimmed.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let pos = SchemaPosition::load(&dir.path().join("sync_schema.pos")).unwrap();
        assert_eq!(pos.lines(), 0);
    }

    #[test]
    fn test_advance_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sender").join("sync_schema.pos");

        let mut pos = SchemaPosition::load(&path).unwrap();
        pos.advance(1200).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), "1200");

        let reloaded = SchemaPosition::load(&path).unwrap();
        assert_eq!(reloaded.lines(), 1200);
    }

    #[test]
    fn test_never_moves_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync_schema.pos");

        let mut pos = SchemaPosition::load(&path).unwrap();
        pos.advance(50).unwrap();
        pos.advance(10).unwrap();
        assert_eq!(pos.lines(), 50);
        assert_eq!(SchemaPosition::load(&path).unwrap().lines(), 50);
    }

    #[test]
    fn test_garbage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync_schema.pos");
        fs::write(&path, "twelve\n").unwrap();
        assert!(SchemaPosition::load(&path).is_err());
    }
}
