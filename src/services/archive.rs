//! Message archiver: every wire message crossing the bridge can be kept as
//! a timestamped file for traceability.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "in"),
            Direction::Outbound => write!(f, "out"),
        }
    }
}

#[async_trait]
pub trait MessageArchiver: Send + Sync {
    /// Persist one message. `kind` is the wire grammar (`astm`/`hl7`),
    /// `label` names the transaction and peer (e.g. `LAB-29/Analyzer`).
    /// Archiving failures are reported but must never fail a transaction.
    async fn archive(
        &self,
        analyzer_id: &str,
        kind: &str,
        payload: &str,
        label: &str,
        direction: Direction,
    ) -> Result<(), String>;
}

/// Filesystem archiver: `<root>/<analyzer_id>/<timestamp>_<label>_<dir>.<kind>`.
pub struct FileArchiver {
    root: PathBuf,
}

impl FileArchiver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl MessageArchiver for FileArchiver {
    async fn archive(
        &self,
        analyzer_id: &str,
        kind: &str,
        payload: &str,
        label: &str,
        direction: Direction,
    ) -> Result<(), String> {
        let dir = self.root.join(sanitize(analyzer_id));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| format!("cannot create archive directory: {}", e))?;

        let filename = format!(
            "{}_{}_{}.{}",
            Utc::now().format("%Y%m%d_%H%M%S%.3f"),
            sanitize(label),
            direction,
            sanitize(kind)
        );
        let path = dir.join(filename);

        tokio::fs::write(&path, payload.as_bytes())
            .await
            .map_err(|e| format!("cannot write archive file {}: {}", path.display(), e))?;

        log::debug!("Archived {} message to {}", label, path.display());
        Ok(())
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Used when `archive_msg` is off.
pub struct NoopArchiver;

#[async_trait]
impl MessageArchiver for NoopArchiver {
    async fn archive(
        &self,
        _analyzer_id: &str,
        _kind: &str,
        _payload: &str,
        _label: &str,
        _direction: Direction,
    ) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path_separators() {
        assert_eq!(sanitize("LAB-29/Analyzer"), "LAB-29-Analyzer");
        assert_eq!(sanitize("XP-300 lab#1"), "XP-300-lab-1");
    }

    #[tokio::test]
    async fn test_file_archiver_writes_payload() {
        let root = std::env::temp_dir().join(format!(
            "sysmex-bridge-archive-test-{}",
            std::process::id()
        ));
        let archiver = FileArchiver::new(&root);

        archiver
            .archive("XP-300", "astm", "H|\\^&\rL|1|N", "LAB-29/Analyzer", Direction::Inbound)
            .await
            .unwrap();

        let dir = root.join("XP-300");
        let entries: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let path = entries[0].as_ref().unwrap().path();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.contains("LAB-29-Analyzer_in"));
        assert!(name.ends_with(".astm"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "H|\\^&\rL|1|N");

        std::fs::remove_dir_all(&root).unwrap();
    }
}
