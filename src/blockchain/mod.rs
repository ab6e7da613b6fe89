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

//! Blockchain backends
//!
//! This module provides the implementation of a few commonly-used backends like
//! [Electrum](crate::blockchain::electrum) and [Esplora](crate::blockchain::esplora), along with a
//! generalized trait [`Blockchain`] that can be implemented to build customized backends.
//!
//! Backends only answer a handful of batched queries. The gap-limit scan that turns those answers
//! into wallet state lives in [`script_sync`] and is shared by every backend.

use std::ops::Deref;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

use bitcoin::{BlockHash, BlockHeader, Script, Transaction, Txid};

use crate::error::Error;
use crate::FeeRate;

pub(crate) mod script_sync;

#[cfg(any(feature = "electrum", feature = "esplora"))]
pub mod any;
#[cfg(any(feature = "electrum", feature = "esplora"))]
pub use any::{AnyBlockchain, BlockchainConfig};

#[cfg(feature = "electrum")]
#[cfg_attr(docsrs, doc(cfg(feature = "electrum")))]
pub mod electrum;
#[cfg(feature = "electrum")]
pub use self::electrum::ElectrumBlockchain;
#[cfg(feature = "electrum")]
pub use self::electrum::ElectrumBlockchainConfig;

#[cfg(feature = "esplora")]
#[cfg_attr(docsrs, doc(cfg(feature = "esplora")))]
pub mod esplora;
#[cfg(feature = "esplora")]
pub use self::esplora::EsploraBlockchain;
#[cfg(feature = "esplora")]
pub use self::esplora::EsploraBlockchainConfig;

/// Default number of consecutive unused scripts after which a scan stops
pub const DEFAULT_STOP_GAP: usize = 20;

/// Trait that defines the actions that must be supported by a blockchain backend
///
/// The batched methods are used by the wallet's sync: their results must be returned in the same
/// order as the requested items.
pub trait Blockchain {
    /// Broadcast a transaction
    fn broadcast(&self, tx: &Transaction) -> Result<(), Error>;
    /// Return the current height
    fn get_height(&self) -> Result<u32, Error>;
    /// Fetch the hash of the block at `height`
    fn get_block_hash(&self, height: u64) -> Result<BlockHash, Error>;
    /// Estimate the fee rate required to confirm a transaction in a given `target` of blocks
    fn estimate_fee(&self, target: usize) -> Result<FeeRate, Error>;
    /// Fetch a transaction from the blockchain given its txid
    fn get_tx(&self, txid: &Txid) -> Result<Option<Transaction>, Error>;

    /// For every script return the txids that touch it, along with their confirmation height.
    /// Unconfirmed transactions have a `None` height.
    fn batch_script_get_history(
        &self,
        scripts: &[Script],
    ) -> Result<Vec<Vec<(Txid, Option<u32>)>>, Error>;
    /// Fetch many transactions at once. Unknown txids are an error.
    fn batch_transaction_get(&self, txids: &[Txid]) -> Result<Vec<Transaction>, Error>;
    /// Fetch the headers of the blocks at the given heights
    fn batch_block_header(&self, heights: &[u32]) -> Result<Vec<BlockHeader>, Error>;

    /// Number of consecutive unused scripts after which a sync stops scanning a keychain
    fn stop_gap(&self) -> usize {
        DEFAULT_STOP_GAP
    }
}

/// Trait for [`Blockchain`] types that can be created given a configuration
pub trait ConfigurableBlockchain: Blockchain + Sized {
    /// Type that contains the configuration
    type Config: std::fmt::Debug;

    /// Create a new instance given a configuration
    fn from_config(config: &Self::Config) -> Result<Self, Error>;
}

/// Data sent with a progress update over a [`channel`]
pub type ProgressData = (f32, Option<String>);

/// Trait for types that can receive and process progress updates during [`Wallet::sync`]
///
/// Updates run on the thread that called `sync` and should return quickly.
///
/// [`Wallet::sync`]: crate::wallet::Wallet::sync
pub trait Progress: Send + 'static + core::fmt::Debug {
    /// Send a new progress update
    ///
    /// The `progress` value should be in the range 0.0 - 100.0, and the `message` value is an
    /// optional text message that can be displayed to the user.
    fn update(&self, progress: f32, message: Option<String>) -> Result<(), Error>;
}

/// Shortcut to create a [`channel`] (pair of [`Sender`] and [`Receiver`]) that can transport [`ProgressData`]
pub fn progress() -> (Sender<ProgressData>, Receiver<ProgressData>) {
    channel()
}

impl Progress for Sender<ProgressData> {
    fn update(&self, progress: f32, message: Option<String>) -> Result<(), Error> {
        if !(0.0..=100.0).contains(&progress) {
            return Err(Error::InvalidProgressValue(progress));
        }

        self.send((progress, message))
            .map_err(|_| Error::ProgressUpdateError)
    }
}

/// Type that implements [`Progress`] and drops every update received
#[derive(Clone, Copy, Default, Debug)]
pub struct NoopProgress;

/// Create a new instance of [`NoopProgress`]
pub fn noop_progress() -> NoopProgress {
    NoopProgress
}

impl Progress for NoopProgress {
    fn update(&self, _progress: f32, _message: Option<String>) -> Result<(), Error> {
        Ok(())
    }
}

/// Type that implements [`Progress`] and logs at level `INFO` every update received
#[derive(Clone, Copy, Default, Debug)]
pub struct LogProgress;

/// Create a new instance of [`LogProgress`]
pub fn log_progress() -> LogProgress {
    LogProgress
}

impl Progress for LogProgress {
    fn update(&self, progress: f32, message: Option<String>) -> Result<(), Error> {
        log::info!(
            "Sync {:.3}%: `{}`",
            progress,
            message.unwrap_or_else(|| "".into())
        );

        Ok(())
    }
}

impl<T: Blockchain> Blockchain for Arc<T> {
    fn broadcast(&self, tx: &Transaction) -> Result<(), Error> {
        self.deref().broadcast(tx)
    }
    fn get_height(&self) -> Result<u32, Error> {
        self.deref().get_height()
    }
    fn get_block_hash(&self, height: u64) -> Result<BlockHash, Error> {
        self.deref().get_block_hash(height)
    }
    fn estimate_fee(&self, target: usize) -> Result<FeeRate, Error> {
        self.deref().estimate_fee(target)
    }
    fn get_tx(&self, txid: &Txid) -> Result<Option<Transaction>, Error> {
        self.deref().get_tx(txid)
    }
    fn batch_script_get_history(
        &self,
        scripts: &[Script],
    ) -> Result<Vec<Vec<(Txid, Option<u32>)>>, Error> {
        self.deref().batch_script_get_history(scripts)
    }
    fn batch_transaction_get(&self, txids: &[Txid]) -> Result<Vec<Transaction>, Error> {
        self.deref().batch_transaction_get(txids)
    }
    fn batch_block_header(&self, heights: &[u32]) -> Result<Vec<BlockHeader>, Error> {
        self.deref().batch_block_header(heights)
    }
    fn stop_gap(&self) -> usize {
        self.deref().stop_gap()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_channel_progress_rejects_out_of_range() {
        let (sender, receiver) = progress();

        sender.update(0.0, None).unwrap();
        sender.update(42.5, Some("halfway".into())).unwrap();
        sender.update(100.0, None).unwrap();
        assert!(matches!(
            sender.update(100.5, None),
            Err(Error::InvalidProgressValue(_))
        ));
        assert!(matches!(
            sender.update(-1.0, None),
            Err(Error::InvalidProgressValue(_))
        ));

        let received: Vec<ProgressData> = receiver.try_iter().collect();
        assert_eq!(
            received,
            vec![
                (0.0, None),
                (42.5, Some("halfway".to_string())),
                (100.0, None)
            ]
        );
    }

    #[test]
    fn test_channel_progress_closed_receiver() {
        let (sender, receiver) = progress();
        drop(receiver);

        assert!(matches!(
            sender.update(10.0, None),
            Err(Error::ProgressUpdateError)
        ));
    }
}
