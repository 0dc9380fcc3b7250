use std::sync::{Arc, Mutex};

use enclave_store::Database;

use crate::error::{EngineError, Result};

/// A single SQLite handle shared by every component of the engine.
///
/// Each closure runs with exclusive access, so a closure is one atomic
/// unit with respect to every other store operation.
#[derive(Clone)]
pub struct SharedDatabase {
    inner: Arc<Mutex<Database>>,
}

impl SharedDatabase {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut Database) -> Result<T>) -> Result<T> {
        let mut db = self
            .inner
            .lock()
            .map_err(|_| EngineError::StoreUnavailable("database lock poisoned".into()))?;
        f(&mut db)
    }
}
