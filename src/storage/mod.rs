// src/storage/mod.rs
//! Pluggable stores for accounts and per-player data.
//!
//! The core only depends on these contracts. Implementations may block on
//! I/O, so callers must never invoke them while holding the registry lock.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use crate::models::account::Account;

#[derive(Debug)]
pub enum StorageError {
    Backend(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(msg) => write!(f, "storage backend error: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

/// Account record store: stable player ids and their issued tokens.
pub trait AccountStorage: Send + Sync {
    fn get_account(&self, uid: &str) -> Result<Option<Account>, StorageError>;
    fn upsert_account(&self, account: Account) -> Result<(), StorageError>;
    /// Releases backend resources. Called on every shutdown path.
    fn close(&self);
}

/// Opaque per-player blob store.
pub trait PdataStorage: Send + Sync {
    fn get_pdata(&self, uid: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn set_pdata(&self, uid: &str, data: Vec<u8>) -> Result<(), StorageError>;
    fn close(&self);
}

/// The stores the process runs with, acquired at startup and closed on
/// every shutdown path.
#[derive(Clone)]
pub struct Storages {
    pub accounts: Arc<dyn AccountStorage>,
    pub pdata: Arc<dyn PdataStorage>,
}

impl Storages {
    pub fn close(&self) {
        self.accounts.close();
        self.pdata.close();
    }
}
