use std::io::{BufRead, Write};
use std::path::PathBuf;

use uuid::Uuid;

use crate::error::{NutriLensError, Result};
use crate::model::FoodLogEntry;

/// JSONL file of entries whose remote persist has not succeeded yet.
#[derive(Debug, Clone)]
pub struct PendingQueue {
    pub path: PathBuf,
}

impl PendingQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append one entry (creates file + dir if needed). An entry already
    /// queued under the same id is not written twice.
    pub fn append(&self, entry: &FoodLogEntry) -> Result<()> {
        if self.read_all()?.iter().any(|e| e.id == entry.id) {
            tracing::debug!(id = %entry.id, "entry already pending");
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        let line = serde_json::to_string(entry)
            .map_err(|e| NutriLensError::Storage(format!("failed to encode entry: {e}")))?;
        writeln!(file, "{line}").map_err(|e| self.io_err(e))?;
        Ok(())
    }

    /// Read every queued entry, skipping malformed lines.
    pub fn read_all(&self) -> Result<Vec<FoodLogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path).map_err(|e| self.io_err(e))?;
        let reader = std::io::BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| self.io_err(e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<FoodLogEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::debug!("skipping malformed pending line: {e}"),
            }
        }
        Ok(entries)
    }

    /// Drop the given ids from the queue, deleting the file once it is empty.
    pub fn remove(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() || !self.path.exists() {
            return Ok(());
        }
        let remaining: Vec<FoodLogEntry> = self
            .read_all()?
            .into_iter()
            .filter(|e| !ids.contains(&e.id))
            .collect();

        if remaining.is_empty() {
            return std::fs::remove_file(&self.path).map_err(|e| self.io_err(e));
        }

        let mut contents = String::new();
        for entry in &remaining {
            let line = serde_json::to_string(entry)
                .map_err(|e| NutriLensError::Storage(format!("failed to encode entry: {e}")))?;
            contents.push_str(&line);
            contents.push('\n');
        }
        std::fs::write(&self.path, contents).map_err(|e| self.io_err(e))
    }

    pub fn is_empty(&self) -> bool {
        !self.path.exists()
            || std::fs::metadata(&self.path)
                .map(|m| m.len() == 0)
                .unwrap_or(true)
    }

    fn io_err(&self, e: std::io::Error) -> NutriLensError {
        NutriLensError::Storage(format!("pending queue {}: {e}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AnalysisResult;
    use chrono::Utc;

    fn entry(name: &str) -> FoodLogEntry {
        FoodLogEntry::from_result(
            &AnalysisResult {
                food_name: name.into(),
                calories: 100,
                narrative: String::new(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PendingQueue::new(dir.path().join("sub").join("pending.jsonl"));
        assert!(queue.is_empty());

        let a = entry("Apple");
        let b = entry("Bread");
        queue.append(&a).unwrap();
        queue.append(&b).unwrap();

        let all = queue.read_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], a);
        assert_eq!(all[1], b);
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_append_same_id_once() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PendingQueue::new(dir.path().join("pending.jsonl"));
        let a = entry("Apple");
        queue.append(&a).unwrap();
        queue.append(&a).unwrap();
        assert_eq!(queue.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_some_then_all() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PendingQueue::new(dir.path().join("pending.jsonl"));
        let a = entry("Apple");
        let b = entry("Bread");
        queue.append(&a).unwrap();
        queue.append(&b).unwrap();

        queue.remove(&[a.id]).unwrap();
        let left = queue.read_all().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, b.id);

        queue.remove(&[b.id]).unwrap();
        assert!(queue.is_empty());
        assert!(!queue.path.exists());
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.jsonl");
        let a = entry("Apple");
        std::fs::write(
            &path,
            format!("not json\n\n{}\n", serde_json::to_string(&a).unwrap()),
        )
        .unwrap();
        let queue = PendingQueue::new(path);
        let all = queue.read_all().unwrap();
        assert_eq!(all, vec![a]);
    }
}
