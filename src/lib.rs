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

// rustdoc will warn if there are missing docs
#![warn(missing_docs)]
// only enables the `doc_cfg` feature when
// the `docsrs` configuration attribute is defined
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A descriptor-based wallet engine.
//!
//! A [`Wallet`] is built from one or two output descriptors and a [`database`] where it keeps
//! what it learned about the chain. From there it can:
//!
//! * reveal addresses, see [`Wallet::get_address`];
//! * discover its transactions through a [`blockchain`] backend, see [`Wallet::sync`];
//! * build, sign and finalize PSBTs, see [`Wallet::build_tx`] and [`Wallet::sign`];
//! * replace its own unconfirmed transactions with higher-fee ones, see
//!   [`Wallet::build_fee_bump`].
//!
//! ## Example
//!
//! ```no_run
//! use bdk_engine::blockchain::ElectrumBlockchain;
//! use bdk_engine::database::MemoryDatabase;
//! use bdk_engine::electrum_client::Client;
//! use bdk_engine::{SyncOptions, Wallet};
//!
//! fn main() -> Result<(), bdk_engine::Error> {
//!     let blockchain = ElectrumBlockchain::from(Client::new("ssl://electrum.blockstream.info:60002")?);
//!     let wallet = Wallet::new(
//!         "wpkh([c258d2e4/84h/1h/0h]tpubDDYkZojQFQjht8Tm4jsS3iuEmKjTiEGjG6KnuFNKKJb5A6ZUCUZKdvLdSDWofKi4ToRCwb9poe1XdqfUnP4jaJjCB2Zwv11ZLgSbnZSNecE/0/*)",
//!         Some("wpkh([c258d2e4/84h/1h/0h]tpubDDYkZojQFQjht8Tm4jsS3iuEmKjTiEGjG6KnuFNKKJb5A6ZUCUZKdvLdSDWofKi4ToRCwb9poe1XdqfUnP4jaJjCB2Zwv11ZLgSbnZSNecE/1/*)"),
//!         bitcoin::Network::Testnet,
//!         MemoryDatabase::default(),
//!     )?;
//!
//!     wallet.sync(&blockchain, SyncOptions::default())?;
//!
//!     println!("Descriptor balance: {} SAT", wallet.get_balance()?);
//!
//!     Ok(())
//! }
//! ```

pub extern crate bitcoin;
extern crate log;
pub extern crate miniscript;
extern crate serde;
extern crate serde_json;

#[cfg(feature = "keys-bip39")]
extern crate bip39;

#[cfg(feature = "electrum")]
pub extern crate electrum_client;

#[cfg(feature = "esplora")]
pub extern crate ureq;

#[cfg(feature = "key-value-db")]
pub extern crate sled;

#[macro_use]
pub(crate) mod error;
pub mod blockchain;
pub mod database;
pub mod descriptor;
pub mod keys;
pub mod psbt;
pub(crate) mod types;
pub mod wallet;

pub use error::Error;
pub use types::*;
pub use wallet::signer;
pub use wallet::signer::SignOptions;
pub use wallet::tx_builder::TxBuilder;
pub use wallet::{AddressIndex, AddressInfo, SyncOptions, Wallet};

/// Get the version of the library at runtime
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION", "unknown")
}
