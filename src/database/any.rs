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


//! Database chosen at runtime
//!
//! [`AnyDatabase`] wraps every backend compiled into the crate behind one type, so the backend
//! can come from a configuration file:
//!
//! ```no_run
//! # use bitcoin::Network;
//! # use bdk_engine::database::*;
//! # use bdk_engine::Wallet;
//! let config: DatabaseConfig = serde_json::from_str(r#"{"Memory":null}"#)?;
//! let database = AnyDatabase::from_config(&config)?;
//! let wallet = Wallet::new("wpkh([c258d2e4/84h/1h/0h]tpubDDYkZojQFQjht8Tm4jsS3iuEmKjTiEGjG6KnuFNKKJb5A6ZUCUZKdvLdSDWofKi4ToRCwb9poe1XdqfUnP4jaJjCB2Zwv11ZLgSbnZSNecE/0/*)", None, Network::Testnet, database)?;
//! # Ok::<(), bdk_engine::Error>(())
//! ```

use super::*;

/// Forward a call to whichever backend `$value` holds
macro_rules! dispatch {
    ($ty:ident, $value:expr, |$inner:ident| $call:expr) => {
        match $value {
            $ty::Memory($inner) => $call,
            #[cfg(feature = "key-value-db")]
            $ty::Sled($inner) => $call,
        }
    };
}

/// One of the [`Database`] backends compiled into the crate
#[derive(Debug)]
pub enum AnyDatabase {
    /// [`MemoryDatabase`]
    Memory(memory::MemoryDatabase),
    #[cfg(feature = "key-value-db")]
    #[cfg_attr(docsrs, doc(cfg(feature = "key-value-db")))]
    /// A [`sled::Tree`]
    Sled(sled::Tree),
}

impl From<memory::MemoryDatabase> for AnyDatabase {
    fn from(db: memory::MemoryDatabase) -> Self {
        AnyDatabase::Memory(db)
    }
}

#[cfg(feature = "key-value-db")]
impl From<sled::Tree> for AnyDatabase {
    fn from(tree: sled::Tree) -> Self {
        AnyDatabase::Sled(tree)
    }
}

/// The batch type matching the [`AnyDatabase`] variant that created it
pub enum AnyBatch {
    /// Batch of a [`MemoryDatabase`]
    Memory(memory::MemoryBatch),
    #[cfg(feature = "key-value-db")]
    #[cfg_attr(docsrs, doc(cfg(feature = "key-value-db")))]
    /// Batch of a [`sled::Tree`]
    Sled(sled::Batch),
}

macro_rules! impl_any_writes {
    ($ty:ident) => {
        impl BatchOperations for $ty {
            fn set_script_pubkey(
                &mut self,
                script: &Script,
                keychain: KeychainKind,
                child: u32,
            ) -> Result<(), Error> {
                dispatch!($ty, self, |db| db.set_script_pubkey(script, keychain, child))
            }
            fn set_utxo(&mut self, utxo: &LocalUtxo) -> Result<(), Error> {
                dispatch!($ty, self, |db| db.set_utxo(utxo))
            }
            fn set_raw_tx(&mut self, transaction: &Transaction) -> Result<(), Error> {
                dispatch!($ty, self, |db| db.set_raw_tx(transaction))
            }
            fn set_tx(&mut self, transaction: &TransactionDetails) -> Result<(), Error> {
                dispatch!($ty, self, |db| db.set_tx(transaction))
            }
            fn set_last_index(&mut self, keychain: KeychainKind, value: u32) -> Result<(), Error> {
                dispatch!($ty, self, |db| db.set_last_index(keychain, value))
            }
            fn set_sync_time(&mut self, sync_time: SyncTime) -> Result<(), Error> {
                dispatch!($ty, self, |db| db.set_sync_time(sync_time))
            }
            fn del_utxo(&mut self, outpoint: &OutPoint) -> Result<(), Error> {
                dispatch!($ty, self, |db| db.del_utxo(outpoint))
            }
            fn del_tx(&mut self, txid: &Txid) -> Result<(), Error> {
                dispatch!($ty, self, |db| db.del_tx(txid))
            }
        }
    };
}

impl_any_writes!(AnyDatabase);
impl_any_writes!(AnyBatch);

impl Database for AnyDatabase {
    fn check_descriptor_checksum(
        &mut self,
        keychain: KeychainKind,
        checksum: &str,
    ) -> Result<(), Error> {
        dispatch!(AnyDatabase, self, |db| db
            .check_descriptor_checksum(keychain, checksum))
    }

    fn iter_utxos(&self) -> Result<Vec<LocalUtxo>, Error> {
        dispatch!(AnyDatabase, self, |db| db.iter_utxos())
    }
    fn iter_raw_txs(&self) -> Result<Vec<Transaction>, Error> {
        dispatch!(AnyDatabase, self, |db| db.iter_raw_txs())
    }
    fn iter_txs(&self, include_raw: bool) -> Result<Vec<TransactionDetails>, Error> {
        dispatch!(AnyDatabase, self, |db| db.iter_txs(include_raw))
    }

    fn get_script_pubkey_from_path(
        &self,
        keychain: KeychainKind,
        child: u32,
    ) -> Result<Option<Script>, Error> {
        dispatch!(AnyDatabase, self, |db| db
            .get_script_pubkey_from_path(keychain, child))
    }
    fn get_path_from_script_pubkey(
        &self,
        script: &Script,
    ) -> Result<Option<(KeychainKind, u32)>, Error> {
        dispatch!(AnyDatabase, self, |db| db.get_path_from_script_pubkey(script))
    }
    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<LocalUtxo>, Error> {
        dispatch!(AnyDatabase, self, |db| db.get_utxo(outpoint))
    }
    fn get_raw_tx(&self, txid: &Txid) -> Result<Option<Transaction>, Error> {
        dispatch!(AnyDatabase, self, |db| db.get_raw_tx(txid))
    }
    fn get_tx(&self, txid: &Txid, include_raw: bool) -> Result<Option<TransactionDetails>, Error> {
        dispatch!(AnyDatabase, self, |db| db.get_tx(txid, include_raw))
    }
    fn get_last_index(&self, keychain: KeychainKind) -> Result<Option<u32>, Error> {
        dispatch!(AnyDatabase, self, |db| db.get_last_index(keychain))
    }
    fn get_sync_time(&self) -> Result<Option<SyncTime>, Error> {
        dispatch!(AnyDatabase, self, |db| db.get_sync_time())
    }

    fn increment_last_index(&mut self, keychain: KeychainKind) -> Result<u32, Error> {
        dispatch!(AnyDatabase, self, |db| db.increment_last_index(keychain))
    }
}

impl BatchDatabase for AnyDatabase {
    type Batch = AnyBatch;

    fn begin_batch(&self) -> Self::Batch {
        match self {
            AnyDatabase::Memory(db) => AnyBatch::Memory(db.begin_batch()),
            #[cfg(feature = "key-value-db")]
            AnyDatabase::Sled(db) => AnyBatch::Sled(db.begin_batch()),
        }
    }

    fn commit_batch(&mut self, batch: Self::Batch) -> Result<(), Error> {
        match (self, batch) {
            (AnyDatabase::Memory(db), AnyBatch::Memory(batch)) => db.commit_batch(batch),
            #[cfg(feature = "key-value-db")]
            (AnyDatabase::Sled(db), AnyBatch::Sled(batch)) => db.commit_batch(batch),
            #[cfg(feature = "key-value-db")]
            _ => Err(Error::Generic(
                "Batch created by a different database type".into(),
            )),
        }
    }
}

/// Where a [`sled::Tree`] lives on disk
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SledDbConfiguration {
    /// Directory of the sled database
    pub path: String,
    /// Tree inside the database, one per wallet
    pub tree_name: String,
}

/// Serializable configuration for an [`AnyDatabase`]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DatabaseConfig {
    /// The memory database takes no configuration
    Memory(()),
    #[cfg(feature = "key-value-db")]
    #[cfg_attr(docsrs, doc(cfg(feature = "key-value-db")))]
    /// Open a [`sled::Tree`]
    Sled(SledDbConfiguration),
}

#[cfg(feature = "key-value-db")]
impl From<SledDbConfiguration> for DatabaseConfig {
    fn from(config: SledDbConfiguration) -> Self {
        DatabaseConfig::Sled(config)
    }
}

impl ConfigurableDatabase for AnyDatabase {
    type Config = DatabaseConfig;

    fn from_config(config: &Self::Config) -> Result<Self, Error> {
        match config {
            DatabaseConfig::Memory(()) => Ok(memory::MemoryDatabase::new().into()),
            #[cfg(feature = "key-value-db")]
            DatabaseConfig::Sled(config) => Ok(sled::Tree::from_config(config)?.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::database::test;

    #[test]
    fn test_memory_from_config() {
        let config: DatabaseConfig = serde_json::from_str(r#"{"Memory":null}"#).unwrap();
        assert_eq!(config, DatabaseConfig::Memory(()));

        let db = AnyDatabase::from_config(&config).unwrap();
        assert!(matches!(db, AnyDatabase::Memory(_)));
        test::test_batch_is_atomic(db);
    }

    #[test]
    fn test_any_memory_database() {
        test::test_script_pubkey(AnyDatabase::from(MemoryDatabase::new()));
        test::test_batch_delete(AnyDatabase::from(MemoryDatabase::new()));
        test::test_sync_time(AnyDatabase::from(MemoryDatabase::new()));
        test::test_utxo(AnyDatabase::from(MemoryDatabase::new()));
    }

    #[cfg(feature = "key-value-db")]
    #[test]
    fn test_sled_from_config() {
        let mut dir = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        dir.push(format!("bdk_engine_any_{}", nanos));
        let config = DatabaseConfig::from(SledDbConfiguration {
            path: dir.to_string_lossy().into_owned(),
            tree_name: "wallet".into(),
        });

        let db = AnyDatabase::from_config(&config).unwrap();
        assert!(matches!(db, AnyDatabase::Sled(_)));
        test::test_last_index(db);
    }
}
