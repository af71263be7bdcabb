// src/storage/memory.rs
use dashmap::DashMap;
use log::debug;

use super::{AccountStorage, PdataStorage, StorageError};
use crate::models::account::Account;

#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: DashMap<String, Account>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccountStorage for MemoryAccountStore {
    fn get_account(&self, uid: &str) -> Result<Option<Account>, StorageError> {
        Ok(self.accounts.get(uid).map(|r| r.value().clone()))
    }

    fn upsert_account(&self, account: Account) -> Result<(), StorageError> {
        self.accounts.insert(account.uid.clone(), account);
        Ok(())
    }

    fn close(&self) {
        debug!("closing in-memory account store ({} accounts)", self.accounts.len());
    }
}

#[derive(Default)]
pub struct MemoryPdataStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryPdataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PdataStorage for MemoryPdataStore {
    fn get_pdata(&self, uid: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blobs.get(uid).map(|r| r.value().clone()))
    }

    fn set_pdata(&self, uid: &str, data: Vec<u8>) -> Result<(), StorageError> {
        self.blobs.insert(uid.to_string(), data);
        Ok(())
    }

    fn close(&self) {
        debug!("closing in-memory pdata store ({} blobs)", self.blobs.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn account_upsert_and_get() {
        let store = MemoryAccountStore::new();
        assert!(store.get_account("1001").unwrap().is_none());

        let mut acct = Account::new("1001");
        acct.issue_token("tok-a".into(), SystemTime::UNIX_EPOCH + Duration::from_secs(5));
        store.upsert_account(acct).unwrap();

        let back = store.get_account("1001").unwrap().unwrap();
        assert_eq!(back.uid, "1001");
        assert_eq!(back.token.as_deref(), Some("tok-a"));
    }

    #[test]
    fn upsert_replaces_the_record() {
        let store = MemoryAccountStore::new();
        let mut acct = Account::new("1001");
        acct.issue_token("tok-a".into(), SystemTime::UNIX_EPOCH);
        store.upsert_account(acct.clone()).unwrap();
        acct.issue_token("tok-b".into(), SystemTime::UNIX_EPOCH + Duration::from_secs(1));
        store.upsert_account(acct).unwrap();

        let back = store.get_account("1001").unwrap().unwrap();
        assert_eq!(back.token.as_deref(), Some("tok-b"));
    }

    #[test]
    fn pdata_roundtrip() {
        let store = MemoryPdataStore::new();
        assert!(store.get_pdata("1001").unwrap().is_none());
        store.set_pdata("1001", vec![1, 2, 3]).unwrap();
        assert_eq!(store.get_pdata("1001").unwrap().unwrap(), vec![1, 2, 3]);
        store.set_pdata("1001", vec![9]).unwrap();
        assert_eq!(store.get_pdata("1001").unwrap().unwrap(), vec![9]);
    }
}
