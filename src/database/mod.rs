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


//! Wallet storage
//!
//! The wallet only keeps chain-derived data here: revealed scripts, UTXOs, transactions and
//! the sync checkpoint. Nothing stored is secret, so a store can be wiped and rebuilt by a sync.
//!
//! Two backends ship with the crate: [`MemoryDatabase`] and, behind the `key-value-db`
//! feature, a [`sled::Tree`]. [`AnyDatabase`] picks one at runtime.

use bitcoin::hash_types::Txid;
use bitcoin::{OutPoint, Script, Transaction, TxOut};

use crate::error::Error;
use crate::types::*;

pub mod any;
pub use any::{AnyDatabase, DatabaseConfig, SledDbConfiguration};

#[cfg(feature = "key-value-db")]
pub(crate) mod keyvalue;

pub mod memory;
pub use memory::MemoryDatabase;

/// Writes shared by a store and its batches
pub trait BatchOperations {
    /// Record that `script` was derived at `child` on `keychain`
    fn set_script_pubkey(
        &mut self,
        script: &Script,
        keychain: KeychainKind,
        child: u32,
    ) -> Result<(), Error>;
    /// Insert or replace a [`LocalUtxo`]
    fn set_utxo(&mut self, utxo: &LocalUtxo) -> Result<(), Error>;
    /// Store a transaction by its txid
    fn set_raw_tx(&mut self, transaction: &Transaction) -> Result<(), Error>;
    /// Insert or replace the details of a transaction. The raw transaction, when attached, is
    /// stored separately.
    fn set_tx(&mut self, transaction: &TransactionDetails) -> Result<(), Error>;
    /// Overwrite the last revealed index of `keychain`
    fn set_last_index(&mut self, keychain: KeychainKind, value: u32) -> Result<(), Error>;
    /// Overwrite the sync checkpoint
    fn set_sync_time(&mut self, sync_time: SyncTime) -> Result<(), Error>;

    /// Forget a UTXO, if present
    fn del_utxo(&mut self, outpoint: &OutPoint) -> Result<(), Error>;
    /// Forget a transaction, both its details and its raw form
    fn del_tx(&mut self, txid: &Txid) -> Result<(), Error>;
}

/// Reads, plus the two read-modify-write operations the wallet relies on
pub trait Database: BatchOperations {
    /// Compare `checksum` with the one stored for `keychain`, storing it on first use.
    ///
    /// Returns [`Error::ChecksumMismatch`] when a different descriptor was used before.
    fn check_descriptor_checksum(
        &mut self,
        keychain: KeychainKind,
        checksum: &str,
    ) -> Result<(), Error>;

    /// Every stored UTXO, spent or not
    fn iter_utxos(&self) -> Result<Vec<LocalUtxo>, Error>;
    /// Every stored raw transaction
    fn iter_raw_txs(&self) -> Result<Vec<Transaction>, Error>;
    /// Every stored transaction, with its raw form attached if `include_raw`
    fn iter_txs(&self, include_raw: bool) -> Result<Vec<TransactionDetails>, Error>;

    /// The script derived at `child` on `keychain`, if revealed
    fn get_script_pubkey_from_path(
        &self,
        keychain: KeychainKind,
        child: u32,
    ) -> Result<Option<Script>, Error>;
    /// Where `script` was derived, if it belongs to the wallet
    fn get_path_from_script_pubkey(
        &self,
        script: &Script,
    ) -> Result<Option<(KeychainKind, u32)>, Error>;
    /// Look up a UTXO by outpoint
    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<LocalUtxo>, Error>;
    /// Look up a raw transaction by txid
    fn get_raw_tx(&self, txid: &Txid) -> Result<Option<Transaction>, Error>;
    /// Look up the details of a transaction by txid
    fn get_tx(&self, txid: &Txid, include_raw: bool) -> Result<Option<TransactionDetails>, Error>;
    /// The last revealed index of `keychain`, `None` before the first reveal
    fn get_last_index(&self, keychain: KeychainKind) -> Result<Option<u32>, Error>;
    /// The sync checkpoint, `None` before the first sync
    fn get_sync_time(&self) -> Result<Option<SyncTime>, Error>;

    /// Bump the last revealed index of `keychain` and return the new value, starting at `0`
    fn increment_last_index(&mut self, keychain: KeychainKind) -> Result<u32, Error>;
}

/// A [`Database`] that can stage writes and apply them all at once
pub trait BatchDatabase: Database {
    /// Staged writes
    type Batch: BatchOperations;

    /// Start an empty batch
    fn begin_batch(&self) -> Self::Batch;
    /// Apply every staged write, or none of them on error
    fn commit_batch(&mut self, batch: Self::Batch) -> Result<(), Error>;
}

/// A [`Database`] that can be opened from a serializable configuration
pub trait ConfigurableDatabase: Database + Sized {
    /// Configuration to open the store from
    type Config: std::fmt::Debug;

    /// Open the store
    fn from_config(config: &Self::Config) -> Result<Self, Error>;
}

pub(crate) trait DatabaseUtils: Database {
    fn is_mine(&self, script: &Script) -> Result<bool, Error> {
        Ok(self.get_path_from_script_pubkey(script)?.is_some())
    }

    fn get_previous_output(&self, outpoint: &OutPoint) -> Result<Option<TxOut>, Error> {
        let prev_tx = match self.get_raw_tx(&outpoint.txid)? {
            Some(tx) => tx,
            None => return Ok(None),
        };

        prev_tx
            .output
            .get(outpoint.vout as usize)
            .cloned()
            .map(Some)
            .ok_or(Error::InvalidOutpoint(*outpoint))
    }
}

impl<T: Database> DatabaseUtils for T {}

/// Checks every backend has to pass, run from each backend's own test module
#[cfg(test)]
pub mod test {
    use std::str::FromStr;

    use bitcoin::consensus::encode::deserialize;
    use bitcoin::hashes::hex::FromHex;

    use super::*;

    fn p2pkh_script() -> Script {
        Script::from(
            Vec::<u8>::from_hex("76a91402306a7c23f3e8010de41e9e591348bb83f11daa88ac").unwrap(),
        )
    }

    fn legacy_tx() -> Transaction {
        let bytes = Vec::<u8>::from_hex("0100000001a15d57094aa7a21a28cb20b59aab8fc7d1149a3bdbcddba9c622e4f5f6a99ece010000006c493046022100f93bb0e7d8db7bd46e40132d1f8242026e045f03a0efe71bbb8e3f475e970d790221009337cd7f1f929f00cc6ff01f03729b069a7c21b59b1736ddfee5db5946c5da8c0121033b9b137ee87d5a812d6f506efdd37f0affa7ffc310711c06c7f3e097c9447c52ffffffff0100e1f505000000001976a9140389035a9225b3839e2bbf32d826a1e222031fd888ac00000000").unwrap();
        deserialize(&bytes).unwrap()
    }

    fn confirmed_details() -> TransactionDetails {
        let tx = legacy_tx();
        TransactionDetails {
            txid: tx.txid(),
            transaction: Some(tx),
            received: 1337,
            sent: 420420,
            fee: Some(140),
            confirmation_time: Some(BlockTime::new(Some(1000), Some(123456)).unwrap()),
        }
    }

    pub fn test_script_pubkey<D: Database>(mut db: D) {
        let script = p2pkh_script();
        db.set_script_pubkey(&script, KeychainKind::Internal, 42)
            .unwrap();

        assert_eq!(
            db.get_script_pubkey_from_path(KeychainKind::Internal, 42)
                .unwrap(),
            Some(script.clone())
        );
        assert_eq!(
            db.get_script_pubkey_from_path(KeychainKind::External, 42)
                .unwrap(),
            None
        );
        assert_eq!(
            db.get_path_from_script_pubkey(&script).unwrap(),
            Some((KeychainKind::Internal, 42))
        );
        assert!(db.is_mine(&script).unwrap());
    }

    pub fn test_batch_script_pubkey<D: BatchDatabase>(mut db: D) {
        let script = p2pkh_script();
        let mut batch = db.begin_batch();
        batch
            .set_script_pubkey(&script, KeychainKind::External, 7)
            .unwrap();
        assert!(!db.is_mine(&script).unwrap());

        db.commit_batch(batch).unwrap();
        assert_eq!(
            db.get_path_from_script_pubkey(&script).unwrap(),
            Some((KeychainKind::External, 7))
        );
    }

    pub fn test_utxo<D: Database>(mut db: D) {
        let outpoint = OutPoint::from_str(
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456:0",
        )
        .unwrap();
        let mut utxo = LocalUtxo {
            outpoint,
            txout: TxOut {
                value: 133742,
                script_pubkey: p2pkh_script(),
            },
            keychain: KeychainKind::External,
            is_spent: false,
        };
        db.set_utxo(&utxo).unwrap();
        assert_eq!(db.get_utxo(&outpoint).unwrap(), Some(utxo.clone()));

        // a second write replaces the first one
        utxo.is_spent = true;
        db.set_utxo(&utxo).unwrap();
        assert_eq!(db.iter_utxos().unwrap(), vec![utxo]);

        db.del_utxo(&outpoint).unwrap();
        assert_eq!(db.get_utxo(&outpoint).unwrap(), None);
        assert!(db.iter_utxos().unwrap().is_empty());
    }

    pub fn test_raw_tx<D: Database>(mut db: D) {
        let tx = legacy_tx();
        db.set_raw_tx(&tx).unwrap();

        assert_eq!(db.get_raw_tx(&tx.txid()).unwrap(), Some(tx.clone()));
        assert_eq!(db.iter_raw_txs().unwrap(), vec![tx.clone()]);

        let outpoint = OutPoint::new(tx.txid(), 0);
        assert_eq!(
            db.get_previous_output(&outpoint).unwrap(),
            Some(tx.output[0].clone())
        );
        assert!(matches!(
            db.get_previous_output(&OutPoint::new(tx.txid(), 1)),
            Err(Error::InvalidOutpoint(_))
        ));
    }

    pub fn test_tx<D: Database>(mut db: D) {
        let details = confirmed_details();
        let txid = details.txid;
        db.set_tx(&details).unwrap();

        assert_eq!(db.get_tx(&txid, true).unwrap(), Some(details.clone()));
        assert_eq!(db.get_raw_tx(&txid).unwrap(), details.transaction);

        let stripped = TransactionDetails {
            transaction: None,
            ..details.clone()
        };
        assert_eq!(db.get_tx(&txid, false).unwrap(), Some(stripped.clone()));
        assert_eq!(db.iter_txs(false).unwrap(), vec![stripped]);
        assert_eq!(db.iter_txs(true).unwrap(), vec![details]);

        db.del_tx(&txid).unwrap();
        assert_eq!(db.get_tx(&txid, true).unwrap(), None);
        assert_eq!(db.get_raw_tx(&txid).unwrap(), None);
    }

    pub fn test_last_index<D: Database>(mut db: D) {
        assert_eq!(db.increment_last_index(KeychainKind::Internal).unwrap(), 0);
        assert_eq!(
            db.get_last_index(KeychainKind::Internal).unwrap(),
            Some(0)
        );

        db.set_last_index(KeychainKind::External, 1337).unwrap();
        assert_eq!(
            db.increment_last_index(KeychainKind::External).unwrap(),
            1338
        );
        assert_eq!(
            db.get_last_index(KeychainKind::External).unwrap(),
            Some(1338)
        );
    }

    pub fn test_sync_time<D: Database>(mut db: D) {
        assert_eq!(db.get_sync_time().unwrap(), None);

        for height in [100, 90] {
            let sync_time = SyncTime {
                block_time: BlockTime::new(Some(height), Some(1000)).unwrap(),
            };
            db.set_sync_time(sync_time.clone()).unwrap();
            assert_eq!(db.get_sync_time().unwrap(), Some(sync_time));
        }
    }

    pub fn test_check_descriptor_checksum<D: Database>(mut db: D) {
        db.check_descriptor_checksum(KeychainKind::External, "tqz0nc62")
            .unwrap();
        db.check_descriptor_checksum(KeychainKind::External, "tqz0nc62")
            .unwrap();
        db.check_descriptor_checksum(KeychainKind::Internal, "lasegmfs")
            .unwrap();

        assert!(matches!(
            db.check_descriptor_checksum(KeychainKind::External, "lasegmfs"),
            Err(Error::ChecksumMismatch)
        ));
    }

    pub fn test_batch_is_atomic<D: BatchDatabase>(mut db: D) {
        let details = confirmed_details();
        let mut batch = db.begin_batch();
        batch.set_tx(&details).unwrap();
        batch.set_last_index(KeychainKind::External, 5).unwrap();

        assert_eq!(db.get_tx(&details.txid, false).unwrap(), None);
        assert_eq!(db.get_last_index(KeychainKind::External).unwrap(), None);

        db.commit_batch(batch).unwrap();

        assert_eq!(db.get_tx(&details.txid, true).unwrap(), Some(details));
        assert_eq!(db.get_last_index(KeychainKind::External).unwrap(), Some(5));
    }

    pub fn test_batch_delete<D: BatchDatabase>(mut db: D) {
        let details = confirmed_details();
        db.set_tx(&details).unwrap();

        let mut batch = db.begin_batch();
        batch.del_tx(&details.txid).unwrap();
        assert!(db.get_tx(&details.txid, false).unwrap().is_some());

        db.commit_batch(batch).unwrap();
        assert_eq!(db.get_tx(&details.txid, false).unwrap(), None);
        assert!(db.iter_raw_txs().unwrap().is_empty());
    }
}
