//! Async facade over the blocking SQLite layer.
//!
//! Every call hops to the blocking pool, so the supervisor's tasks never
//! hold a runtime worker across a SQLite operation.

use std::sync::Arc;

use crate::db::{Db, RepoRecord, StoreError};

#[derive(Clone)]
pub struct RepoStore {
    db: Arc<Db>,
}

impl RepoStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub async fn insert_new(&self, record: RepoRecord) -> Result<(), StoreError> {
        let db = self.db.clone();
        run_blocking(move || db.insert_new(&record)).await
    }

    pub async fn get(&self, owner: &str, name: &str) -> Result<Option<RepoRecord>, StoreError> {
        let db = self.db.clone();
        let owner = owner.to_string();
        let name = name.to_string();
        run_blocking(move || db.get(&owner, &name)).await
    }

    pub async fn list_all(&self) -> Result<Vec<RepoRecord>, StoreError> {
        let db = self.db.clone();
        run_blocking(move || db.list_all()).await
    }

    pub async fn update<F>(&self, owner: &str, name: &str, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut RepoRecord) + Send + 'static,
    {
        let db = self.db.clone();
        let owner = owner.to_string();
        let name = name.to_string();
        run_blocking(move || db.update(&owner, &name, mutate)).await
    }

    pub async fn delete(&self, owner: &str, name: &str) -> Result<bool, StoreError> {
        let db = self.db.clone();
        let owner = owner.to_string();
        let name = name.to_string();
        run_blocking(move || db.delete(&owner, &name)).await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(StoreError::Internal(format!(
            "spawn_blocking panicked: {}",
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::RepoState;

    fn store() -> RepoStore {
        RepoStore::new(Arc::new(Db::new_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn async_round_trip() {
        let store = store();
        store
            .insert_new(RepoRecord::new(
                "owner".to_string(),
                "repo".to_string(),
                "token".to_string(),
            ))
            .await
            .unwrap();

        store
            .update("owner", "repo", |record| {
                record.state = RepoState::Ready;
            })
            .await
            .unwrap();

        let record = store.get("owner", "repo").await.unwrap().unwrap();
        assert_eq!(record.state, RepoState::Ready);

        assert!(store.delete("owner", "repo").await.unwrap());
        assert!(store.get("owner", "repo").await.unwrap().is_none());
    }
}
