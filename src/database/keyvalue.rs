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


//! [`sled`] backend
//!
//! Every record lives in one [`Tree`] under a one-letter prefix:
//!
//! | prefix | key                    | value                        |
//! |--------|------------------------|------------------------------|
//! | `p`    | keychain, child (BE)   | consensus-encoded script     |
//! | `s`    | script bytes           | JSON `(keychain, child)`     |
//! | `u`    | consensus outpoint     | JSON [`LocalUtxo`]           |
//! | `r`    | txid                   | consensus-encoded tx         |
//! | `t`    | txid                   | JSON details, without raw tx |
//! | `c`    | keychain               | last index (BE `u32`)        |
//! | `d`    | keychain               | descriptor checksum          |
//! | `l`    |                        | JSON [`SyncTime`]            |

use std::convert::TryInto;

use serde::de::DeserializeOwned;
use sled::{Batch, Tree};

use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::hash_types::Txid;
use bitcoin::{OutPoint, Script, Transaction};

use crate::database::{BatchDatabase, BatchOperations, ConfigurableDatabase, Database};
use crate::error::Error;
use crate::types::*;

use super::SledDbConfiguration;

mod key {
    use super::*;

    pub const UTXO: &[u8] = b"u";
    pub const RAW_TX: &[u8] = b"r";
    pub const TX: &[u8] = b"t";
    pub const SYNC_TIME: &[u8] = b"l";

    pub fn script(keychain: KeychainKind, child: u32) -> Vec<u8> {
        [b"p", keychain.as_ref(), &child.to_be_bytes()[..]].concat()
    }

    pub fn path(script: &Script) -> Vec<u8> {
        [b"s", script.as_bytes()].concat()
    }

    pub fn utxo(outpoint: &OutPoint) -> Vec<u8> {
        [UTXO, &serialize(outpoint)].concat()
    }

    pub fn raw_tx(txid: &Txid) -> Vec<u8> {
        [RAW_TX, &serialize(txid)].concat()
    }

    pub fn tx(txid: &Txid) -> Vec<u8> {
        [TX, &serialize(txid)].concat()
    }

    pub fn last_index(keychain: KeychainKind) -> Vec<u8> {
        [b"c", keychain.as_ref()].concat()
    }

    pub fn checksum(keychain: KeychainKind) -> Vec<u8> {
        [b"d", keychain.as_ref()].concat()
    }
}

fn decode_index(bytes: &[u8]) -> Result<u32, Error> {
    let bytes: [u8; 4] = bytes
        .try_into()
        .map_err(|_| Error::Generic(format!("Corrupted derivation index: {:?}", bytes)))?;
    Ok(u32::from_be_bytes(bytes))
}

fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Sink for raw writes, shared by the tree itself and its write-only batches
pub trait KvWriter {
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), Error>;
    fn delete(&mut self, key: Vec<u8>) -> Result<(), Error>;
}

impl KvWriter for Tree {
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), Error> {
        self.insert(key, value)?;
        Ok(())
    }

    fn delete(&mut self, key: Vec<u8>) -> Result<(), Error> {
        self.remove(key)?;
        Ok(())
    }
}

impl KvWriter for Batch {
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), Error> {
        self.insert(key, value);
        Ok(())
    }

    fn delete(&mut self, key: Vec<u8>) -> Result<(), Error> {
        self.remove(key);
        Ok(())
    }
}

impl<W: KvWriter> BatchOperations for W {
    fn set_script_pubkey(
        &mut self,
        script: &Script,
        keychain: KeychainKind,
        child: u32,
    ) -> Result<(), Error> {
        self.put(key::script(keychain, child), serialize(script))?;
        self.put(key::path(script), serde_json::to_vec(&(keychain, child))?)
    }

    fn set_utxo(&mut self, utxo: &LocalUtxo) -> Result<(), Error> {
        self.put(key::utxo(&utxo.outpoint), serde_json::to_vec(utxo)?)
    }

    fn set_raw_tx(&mut self, transaction: &Transaction) -> Result<(), Error> {
        self.put(key::raw_tx(&transaction.txid()), serialize(transaction))
    }

    fn set_tx(&mut self, transaction: &TransactionDetails) -> Result<(), Error> {
        let mut details = transaction.clone();
        if let Some(tx) = details.transaction.take() {
            self.set_raw_tx(&tx)?;
        }
        self.put(key::tx(&details.txid), serde_json::to_vec(&details)?)
    }

    fn set_last_index(&mut self, keychain: KeychainKind, value: u32) -> Result<(), Error> {
        self.put(key::last_index(keychain), value.to_be_bytes().to_vec())
    }

    fn set_sync_time(&mut self, sync_time: SyncTime) -> Result<(), Error> {
        self.put(key::SYNC_TIME.to_vec(), serde_json::to_vec(&sync_time)?)
    }

    fn del_utxo(&mut self, outpoint: &OutPoint) -> Result<(), Error> {
        self.delete(key::utxo(outpoint))
    }

    fn del_tx(&mut self, txid: &Txid) -> Result<(), Error> {
        self.delete(key::tx(txid))?;
        self.delete(key::raw_tx(txid))
    }
}

impl Database for Tree {
    fn check_descriptor_checksum(
        &mut self,
        keychain: KeychainKind,
        checksum: &str,
    ) -> Result<(), Error> {
        // only the first caller stores its checksum
        let stored = self.compare_and_swap(
            key::checksum(keychain),
            None as Option<&[u8]>,
            Some(checksum.as_bytes()),
        )?;
        match stored {
            Ok(()) => Ok(()),
            Err(swap) if swap.current.as_deref() == Some(checksum.as_bytes()) => Ok(()),
            Err(_) => Err(Error::ChecksumMismatch),
        }
    }

    fn iter_utxos(&self) -> Result<Vec<LocalUtxo>, Error> {
        self.scan_prefix(key::UTXO)
            .map(|entry| from_json(&entry?.1))
            .collect()
    }

    fn iter_raw_txs(&self) -> Result<Vec<Transaction>, Error> {
        self.scan_prefix(key::RAW_TX)
            .map(|entry| Ok(deserialize(&entry?.1)?))
            .collect()
    }

    fn iter_txs(&self, include_raw: bool) -> Result<Vec<TransactionDetails>, Error> {
        self.scan_prefix(key::TX)
            .map(|entry| {
                let mut details: TransactionDetails = from_json(&entry?.1)?;
                if include_raw {
                    details.transaction = self.get_raw_tx(&details.txid)?;
                }
                Ok(details)
            })
            .collect()
    }

    fn get_script_pubkey_from_path(
        &self,
        keychain: KeychainKind,
        child: u32,
    ) -> Result<Option<Script>, Error> {
        match self.get(key::script(keychain, child))? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_path_from_script_pubkey(
        &self,
        script: &Script,
    ) -> Result<Option<(KeychainKind, u32)>, Error> {
        self.get(key::path(script))?
            .map(|bytes| from_json(&bytes))
            .transpose()
    }

    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<LocalUtxo>, Error> {
        self.get(key::utxo(outpoint))?
            .map(|bytes| from_json(&bytes))
            .transpose()
    }

    fn get_raw_tx(&self, txid: &Txid) -> Result<Option<Transaction>, Error> {
        match self.get(key::raw_tx(txid))? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_tx(&self, txid: &Txid, include_raw: bool) -> Result<Option<TransactionDetails>, Error> {
        let mut details: TransactionDetails = match self.get(key::tx(txid))? {
            Some(bytes) => from_json(&bytes)?,
            None => return Ok(None),
        };
        if include_raw {
            details.transaction = self.get_raw_tx(txid)?;
        }
        Ok(Some(details))
    }

    fn get_last_index(&self, keychain: KeychainKind) -> Result<Option<u32>, Error> {
        self.get(key::last_index(keychain))?
            .map(|bytes| decode_index(&bytes))
            .transpose()
    }

    fn get_sync_time(&self) -> Result<Option<SyncTime>, Error> {
        self.get(key::SYNC_TIME)?
            .map(|bytes| from_json(&bytes))
            .transpose()
    }

    fn increment_last_index(&mut self, keychain: KeychainKind) -> Result<u32, Error> {
        let updated = self.update_and_fetch(key::last_index(keychain), |prev| {
            let next = match prev.map(decode_index) {
                Some(Ok(index)) => index + 1,
                _ => 0,
            };
            Some(next.to_be_bytes().to_vec())
        })?;

        updated.map_or(Ok(0), |bytes| decode_index(&bytes))
    }
}

impl BatchDatabase for Tree {
    type Batch = Batch;

    fn begin_batch(&self) -> Self::Batch {
        Batch::default()
    }

    fn commit_batch(&mut self, batch: Self::Batch) -> Result<(), Error> {
        Ok(self.apply_batch(batch)?)
    }
}

impl ConfigurableDatabase for Tree {
    type Config = SledDbConfiguration;

    fn from_config(config: &Self::Config) -> Result<Self, Error> {
        Ok(sled::open(&config.path)?.open_tree(&config.tree_name)?)
    }
}
