use enclave_shared::types::IdentityId;

use crate::db::SharedDatabase;
use crate::error::{EngineError, Result};

/// Answers "has `blocker` blocked `blocked`" for the router.
pub trait BlockList: Send + Sync {
    fn is_blocked(&self, blocker: &IdentityId, blocked: &IdentityId) -> Result<bool>;
}

/// Block list kept in the engine's own database.
#[derive(Clone)]
pub struct StoreBlockList {
    db: SharedDatabase,
}

impl StoreBlockList {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    pub fn block(&self, blocker: &IdentityId, blocked: &IdentityId) -> Result<bool> {
        if blocker == blocked {
            return Err(EngineError::invalid("cannot block yourself"));
        }
        let created = self.db.with(|db| Ok(db.block(blocker, blocked)?))?;
        if created {
            tracing::info!(blocker = %blocker, blocked = %blocked, "identity blocked");
        }
        Ok(created)
    }

    pub fn unblock(&self, blocker: &IdentityId, blocked: &IdentityId) -> Result<bool> {
        self.db.with(|db| Ok(db.unblock(blocker, blocked)?))
    }
}

impl BlockList for StoreBlockList {
    fn is_blocked(&self, blocker: &IdentityId, blocked: &IdentityId) -> Result<bool> {
        self.db.with(|db| Ok(db.is_blocked(blocker, blocked)?))
    }
}
