use std::sync::Arc;
use std::time::Duration;

use crate::notify::Notifier;
use crate::repository::{MemoryRepository, Repository};
use crate::storage::{ContentStore, StorageError};

/// Tunables the handlers consult.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_file_size: u64,
    pub session_ttl: Duration,
    pub reset_code_ttl: Duration,
    pub bcrypt_cost: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_file_size: 500 * 1024 * 1024,
            session_ttl: Duration::from_secs(24 * 60 * 60),
            reset_code_ttl: Duration::from_secs(15 * 60),
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

/// Everything shared between connections. Built once at startup.
#[derive(Clone)]
pub struct Services {
    pub repo: Arc<dyn Repository>,
    pub store: ContentStore,
    pub notifier: Arc<dyn Notifier>,
    pub limits: Limits,
}

impl Services {
    pub fn new(
        repo: Arc<dyn Repository>,
        store: ContentStore,
        notifier: Arc<dyn Notifier>,
        limits: Limits,
    ) -> Self {
        Self {
            repo,
            store,
            notifier,
            limits,
        }
    }

    /// Services over a fresh in-memory repository. File ids continue past
    /// the highest one already in `store`, so new uploads never collide with
    /// artifacts left by an earlier run.
    pub async fn in_memory(
        store: ContentStore,
        notifier: Arc<dyn Notifier>,
        limits: Limits,
    ) -> Result<Self, StorageError> {
        let resume_after = store.highest_file_id().await?;
        if resume_after > 0 {
            tracing::info!(resume_after, "store holds earlier files, file ids continue past them");
        }
        let repo = Arc::new(MemoryRepository::with_file_ids_after(resume_after));
        Ok(Self::new(repo, store, notifier, limits))
    }
}
