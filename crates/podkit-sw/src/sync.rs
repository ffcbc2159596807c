//! Background sync hook.
//!
//! The actual data synchronisation belongs to the host application; the
//! worker only promises to run the collaborator for the registered tag and
//! to stay alive until it settles.

use async_trait::async_trait;
use tracing::info;

use crate::Result;

/// Application-provided synchronisation work.
#[async_trait]
pub trait SyncCollaborator: Send + Sync {
    /// Run a sync for `tag`. An error asks the runtime to retry later.
    async fn sync(&self, tag: &str) -> Result<()>;
}

/// Placeholder collaborator that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSync;

#[async_trait]
impl SyncCollaborator for NoopSync {
    async fn sync(&self, tag: &str) -> Result<()> {
        info!(tag, "Syncing podcast data");
        Ok(())
    }
}
