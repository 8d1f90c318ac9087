use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BackupAttempt, HistoryStore};
use crate::errors::HistoryError;

/// Process-local history. Used when no history database is configured, and in tests.
#[derive(Default)]
pub struct MemoryHistoryStore {
    records: RwLock<Vec<BackupAttempt>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn snapshot(&self) -> Vec<BackupAttempt> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, attempt: &BackupAttempt) -> Result<i64, HistoryError> {
        let mut records = self.records.write().await;
        let id = records.len() as i64 + 1;
        let mut stored = attempt.clone();
        stored.id = Some(id);
        records.push(stored);
        Ok(id)
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<BackupAttempt>, HistoryError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .rev()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn get(&self, id: i64) -> Result<Option<BackupAttempt>, HistoryError> {
        let records = self.records.read().await;
        Ok(records.iter().find(|r| r.id == Some(id)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::InitiatorKind;
    use chrono::Utc;

    fn attempt(name: &str) -> BackupAttempt {
        BackupAttempt::begin(Utc::now(), name.to_string(), InitiatorKind::Automatic, None)
    }

    #[tokio::test]
    async fn test_list_is_newest_first_with_paging() {
        let store = MemoryHistoryStore::new();
        for name in ["a", "b", "c"] {
            store.append(&attempt(name)).await.unwrap();
        }

        let first_page = store.list(2, 0).await.unwrap();
        let names: Vec<_> = first_page.iter().map(|a| a.artifact_name.as_str()).collect();
        assert_eq!(names, vec!["c", "b"]);

        let second_page = store.list(2, 2).await.unwrap();
        assert_eq!(second_page.len(), 1);
        assert_eq!(second_page[0].artifact_name, "a");
    }

    #[tokio::test]
    async fn test_get_by_id_and_append_does_not_touch_prior_records() {
        let store = MemoryHistoryStore::new();
        let first = store.append(&attempt("a")).await.unwrap();
        let mut failed = attempt("b");
        failed.mark_failed("boom");
        store.append(&failed).await.unwrap();

        let stored = store.get(first).await.unwrap().unwrap();
        assert_eq!(stored.id, Some(first));
        assert!(stored.succeeded);
        assert!(store.get(99).await.unwrap().is_none());
    }
}
