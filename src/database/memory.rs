// Bitcoin Dev Kit
// Written in 2020 by Alekos Filini <alekos.filini@gmail.com>
//
// Copyright (c) 2020-2021 Bitcoin Dev Kit Developers
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.


//! In-memory ephemeral database
//!
//! [`MemoryDatabase`] keeps one typed table per kind of record. Its content is lost on drop, which
//! makes it a good fit for tests, short-lived watch-only wallets and targets without a filesystem.

use std::collections::{BTreeMap, HashMap};

use bitcoin::hash_types::Txid;
use bitcoin::{OutPoint, Script, Transaction};

use crate::database::{BatchDatabase, BatchOperations, ConfigurableDatabase, Database};
use crate::error::Error;
use crate::types::*;

/// A single write, either applied right away or staged in a [`MemoryBatch`]
#[derive(Debug, Clone)]
enum Write {
    Script(Script, KeychainKind, u32),
    Utxo(LocalUtxo),
    RawTx(Transaction),
    Tx(TransactionDetails),
    LastIndex(KeychainKind, u32),
    SyncTime(SyncTime),
    RemoveUtxo(OutPoint),
    RemoveTx(Txid),
}

#[derive(Debug, Default, Clone)]
struct Tables {
    scripts: BTreeMap<(KeychainKind, u32), Script>,
    paths: HashMap<Script, (KeychainKind, u32)>,
    utxos: BTreeMap<OutPoint, LocalUtxo>,
    raw_txs: BTreeMap<Txid, Transaction>,
    // details are kept without the raw transaction, which lives in `raw_txs`
    txs: BTreeMap<Txid, TransactionDetails>,
    last_index: HashMap<KeychainKind, u32>,
    checksums: HashMap<KeychainKind, String>,
    sync_time: Option<SyncTime>,
}

impl Tables {
    fn apply(&mut self, write: Write) {
        match write {
            Write::Script(script, keychain, child) => {
                self.paths.insert(script.clone(), (keychain, child));
                self.scripts.insert((keychain, child), script);
            }
            Write::Utxo(utxo) => {
                self.utxos.insert(utxo.outpoint, utxo);
            }
            Write::RawTx(tx) => {
                self.raw_txs.insert(tx.txid(), tx);
            }
            Write::Tx(mut details) => {
                if let Some(tx) = details.transaction.take() {
                    self.raw_txs.insert(details.txid, tx);
                }
                self.txs.insert(details.txid, details);
            }
            Write::LastIndex(keychain, index) => {
                self.last_index.insert(keychain, index);
            }
            Write::SyncTime(sync_time) => self.sync_time = Some(sync_time),
            Write::RemoveUtxo(outpoint) => {
                self.utxos.remove(&outpoint);
            }
            Write::RemoveTx(txid) => {
                self.txs.remove(&txid);
                self.raw_txs.remove(&txid);
            }
        }
    }

    fn details(&self, details: &TransactionDetails, include_raw: bool) -> TransactionDetails {
        let mut details = details.clone();
        if include_raw {
            details.transaction = self.raw_txs.get(&details.txid).cloned();
        }
        details
    }
}

/// Implements [`BatchOperations`] by turning every call into a [`Write`] handed to `$sink`
macro_rules! impl_writes {
    ($ty:ty, $self:ident, $write:ident => $sink:expr) => {
        impl BatchOperations for $ty {
            fn set_script_pubkey(
                &mut $self,
                script: &Script,
                keychain: KeychainKind,
                child: u32,
            ) -> Result<(), Error> {
                let $write = Write::Script(script.clone(), keychain, child);
                $sink;
                Ok(())
            }
            fn set_utxo(&mut $self, utxo: &LocalUtxo) -> Result<(), Error> {
                let $write = Write::Utxo(utxo.clone());
                $sink;
                Ok(())
            }
            fn set_raw_tx(&mut $self, transaction: &Transaction) -> Result<(), Error> {
                let $write = Write::RawTx(transaction.clone());
                $sink;
                Ok(())
            }
            fn set_tx(&mut $self, transaction: &TransactionDetails) -> Result<(), Error> {
                let $write = Write::Tx(transaction.clone());
                $sink;
                Ok(())
            }
            fn set_last_index(&mut $self, keychain: KeychainKind, value: u32) -> Result<(), Error> {
                let $write = Write::LastIndex(keychain, value);
                $sink;
                Ok(())
            }
            fn set_sync_time(&mut $self, sync_time: SyncTime) -> Result<(), Error> {
                let $write = Write::SyncTime(sync_time);
                $sink;
                Ok(())
            }
            fn del_utxo(&mut $self, outpoint: &OutPoint) -> Result<(), Error> {
                let $write = Write::RemoveUtxo(*outpoint);
                $sink;
                Ok(())
            }
            fn del_tx(&mut $self, txid: &Txid) -> Result<(), Error> {
                let $write = Write::RemoveTx(*txid);
                $sink;
                Ok(())
            }
        }
    };
}

/// In-memory ephemeral database
///
/// For a store that survives restarts use the `key-value-db` backend.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    tables: Tables,
}

impl MemoryDatabase {
    /// Create an empty database
    pub fn new() -> Self {
        MemoryDatabase::default()
    }
}

/// Writes staged against a [`MemoryDatabase`], applied in order on commit
#[derive(Debug, Default)]
pub struct MemoryBatch {
    writes: Vec<Write>,
}

impl_writes!(MemoryDatabase, self, write => self.tables.apply(write));
impl_writes!(MemoryBatch, self, write => self.writes.push(write));

impl Database for MemoryDatabase {
    fn check_descriptor_checksum(
        &mut self,
        keychain: KeychainKind,
        checksum: &str,
    ) -> Result<(), Error> {
        match self.tables.checksums.get(&keychain) {
            Some(stored) if stored != checksum => Err(Error::ChecksumMismatch),
            Some(_) => Ok(()),
            None => {
                self.tables.checksums.insert(keychain, checksum.to_string());
                Ok(())
            }
        }
    }

    fn iter_utxos(&self) -> Result<Vec<LocalUtxo>, Error> {
        Ok(self.tables.utxos.values().cloned().collect())
    }

    fn iter_raw_txs(&self) -> Result<Vec<Transaction>, Error> {
        Ok(self.tables.raw_txs.values().cloned().collect())
    }

    fn iter_txs(&self, include_raw: bool) -> Result<Vec<TransactionDetails>, Error> {
        Ok(self
            .tables
            .txs
            .values()
            .map(|details| self.tables.details(details, include_raw))
            .collect())
    }

    fn get_script_pubkey_from_path(
        &self,
        keychain: KeychainKind,
        child: u32,
    ) -> Result<Option<Script>, Error> {
        Ok(self.tables.scripts.get(&(keychain, child)).cloned())
    }

    fn get_path_from_script_pubkey(
        &self,
        script: &Script,
    ) -> Result<Option<(KeychainKind, u32)>, Error> {
        Ok(self.tables.paths.get(script).copied())
    }

    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<LocalUtxo>, Error> {
        Ok(self.tables.utxos.get(outpoint).cloned())
    }

    fn get_raw_tx(&self, txid: &Txid) -> Result<Option<Transaction>, Error> {
        Ok(self.tables.raw_txs.get(txid).cloned())
    }

    fn get_tx(&self, txid: &Txid, include_raw: bool) -> Result<Option<TransactionDetails>, Error> {
        Ok(self
            .tables
            .txs
            .get(txid)
            .map(|details| self.tables.details(details, include_raw)))
    }

    fn get_last_index(&self, keychain: KeychainKind) -> Result<Option<u32>, Error> {
        Ok(self.tables.last_index.get(&keychain).copied())
    }

    fn get_sync_time(&self) -> Result<Option<SyncTime>, Error> {
        Ok(self.tables.sync_time.clone())
    }

    fn increment_last_index(&mut self, keychain: KeychainKind) -> Result<u32, Error> {
        let index = self
            .tables
            .last_index
            .entry(keychain)
            .and_modify(|index| *index += 1)
            .or_insert(0);
        Ok(*index)
    }
}

impl BatchDatabase for MemoryDatabase {
    type Batch = MemoryBatch;

    fn begin_batch(&self) -> Self::Batch {
        MemoryBatch::default()
    }

    fn commit_batch(&mut self, batch: Self::Batch) -> Result<(), Error> {
        // in-memory writes can't fail halfway, so applying in place is atomic
        for write in batch.writes {
            self.tables.apply(write);
        }
        Ok(())
    }
}

impl ConfigurableDatabase for MemoryDatabase {
    type Config = ();

    fn from_config(_config: &Self::Config) -> Result<Self, Error> {
        Ok(MemoryDatabase::default())
    }
}

#[cfg(test)]
mod test {
    use super::MemoryDatabase;
    use crate::database::test;

    #[test]
    fn test_script_pubkey() {
        test::test_script_pubkey(MemoryDatabase::new());
    }

    #[test]
    fn test_batch_script_pubkey() {
        test::test_batch_script_pubkey(MemoryDatabase::new());
    }

    #[test]
    fn test_utxo() {
        test::test_utxo(MemoryDatabase::new());
    }

    #[test]
    fn test_raw_tx() {
        test::test_raw_tx(MemoryDatabase::new());
    }

    #[test]
    fn test_tx() {
        test::test_tx(MemoryDatabase::new());
    }

    #[test]
    fn test_last_index() {
        test::test_last_index(MemoryDatabase::new());
    }

    #[test]
    fn test_sync_time() {
        test::test_sync_time(MemoryDatabase::new());
    }

    #[test]
    fn test_check_descriptor_checksum() {
        test::test_check_descriptor_checksum(MemoryDatabase::new());
    }

    #[test]
    fn test_batch_is_atomic() {
        test::test_batch_is_atomic(MemoryDatabase::new());
    }

    #[test]
    fn test_batch_delete() {
        test::test_batch_delete(MemoryDatabase::new());
    }
}
