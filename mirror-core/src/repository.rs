//! The seam between the mirror and the local clone.
//!
//! Everything the conversion and reconciliation layers need from a
//! source-control tool goes through this trait, so the writers can be
//! exercised against an in-memory fake and the real implementation can live
//! with the rest of the subprocess plumbing.

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Repository: Send + Sync {
    /// Raw bytes of every note attached to `revision` under `notes_ref`,
    /// one record per line. Missing notes are an empty blob, not an error.
    async fn get_notes(&self, notes_ref: &str, revision: &str) -> Result<Vec<u8>>;

    /// Attach one more note to `revision` under `notes_ref`. Appends are
    /// additive; existing notes are never rewritten.
    async fn append_note(&self, notes_ref: &str, revision: &str, note: &[u8]) -> Result<()>;

    /// Fetch and merge notes matching `ref_pattern` from `remote`.
    async fn pull_notes(&self, remote: &str, ref_pattern: &str) -> Result<()>;

    /// Push notes matching `ref_pattern` to `remote`.
    async fn push_notes(&self, remote: &str, ref_pattern: &str) -> Result<()>;

    /// The commits reachable from `head` but not from `base`, oldest first.
    async fn list_commits_between(&self, base: &str, head: &str) -> Result<Vec<String>>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory stand-in for a local clone, for exercising the writers.
    #[derive(Default)]
    pub struct FakeRepo {
        notes: Mutex<HashMap<(String, String), Vec<Vec<u8>>>>,
        commits: Vec<String>,
    }

    impl FakeRepo {
        pub fn with_commits(commits: Vec<String>) -> Self {
            Self {
                notes: Mutex::new(HashMap::new()),
                commits,
            }
        }

        /// Notes appended for (ref, revision), in append order.
        pub fn notes_at(&self, notes_ref: &str, revision: &str) -> Vec<Vec<u8>> {
            self.notes
                .lock()
                .unwrap()
                .get(&(notes_ref.to_string(), revision.to_string()))
                .cloned()
                .unwrap_or_default()
        }

        pub fn total_notes(&self) -> usize {
            self.notes.lock().unwrap().values().map(Vec::len).sum()
        }
    }

    #[async_trait]
    impl Repository for FakeRepo {
        async fn get_notes(&self, notes_ref: &str, revision: &str) -> Result<Vec<u8>> {
            let notes = self.notes.lock().unwrap();
            let mut blob = Vec::new();
            if let Some(entries) = notes.get(&(notes_ref.to_string(), revision.to_string())) {
                for entry in entries {
                    blob.extend_from_slice(entry);
                    blob.push(b'\n');
                }
            }
            Ok(blob)
        }

        async fn append_note(&self, notes_ref: &str, revision: &str, note: &[u8]) -> Result<()> {
            self.notes
                .lock()
                .unwrap()
                .entry((notes_ref.to_string(), revision.to_string()))
                .or_default()
                .push(note.to_vec());
            Ok(())
        }

        async fn pull_notes(&self, _remote: &str, _ref_pattern: &str) -> Result<()> {
            Ok(())
        }

        async fn push_notes(&self, _remote: &str, _ref_pattern: &str) -> Result<()> {
            Ok(())
        }

        async fn list_commits_between(&self, _base: &str, _head: &str) -> Result<Vec<String>> {
            Ok(self.commits.clone())
        }
    }
}
