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

//! Esplora
//!
//! This module defines a [`EsploraBlockchain`] struct that can query an Esplora
//! backend to populate the wallet's [database](crate::database::Database).
//!
//! ## Example
//!
//! ```no_run
//! # use bdk_engine::blockchain::esplora::EsploraBlockchain;
//! let blockchain = EsploraBlockchain::new("https://blockstream.info/testnet/api", 20);
//! # Ok::<(), bdk_engine::Error>(())
//! ```
//!
//! Requests go through the blocking `ureq` HTTP client.

use std::collections::HashMap;
use std::fmt;
use std::io;

use bitcoin::consensus;
use bitcoin::{BlockHash, Txid};

use crate::error::Error;
use crate::FeeRate;

mod ureq;

pub use self::ureq::*;

const DEFAULT_CONCURRENT_REQUESTS: u8 = 4;

fn into_fee_rate(target: usize, estimates: HashMap<String, f64>) -> Result<FeeRate, Error> {
    let mut estimates = estimates
        .into_iter()
        .map(|(k, v)| Ok::<_, std::num::ParseIntError>((k.parse::<usize>()?, v)))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Generic(e.to_string()))?;
    estimates.sort_by_key(|(k, _)| *k);

    let fee_val = estimates
        .into_iter()
        .take_while(|(k, _)| k <= &target)
        .map(|(_, v)| v)
        .last()
        .unwrap_or(1.0);

    Ok(FeeRate::from_sat_per_vb(fee_val as f32))
}

/// Data returned by the Esplora API about a transaction touching a script
#[derive(serde::Deserialize, Clone, Debug)]
struct EsploraGetHistory {
    txid: Txid,
    status: EsploraGetHistoryStatus,
}

#[derive(serde::Deserialize, Clone, Debug)]
struct EsploraGetHistoryStatus {
    block_height: Option<u32>,
}

/// Errors that can happen during a sync with [`EsploraBlockchain`]
#[derive(Debug)]
pub enum EsploraError {
    /// Error during ureq HTTP request
    Ureq(::ureq::Error),
    /// Transport error during the ureq HTTP call
    UreqTransport(::ureq::Transport),
    /// HTTP response error
    HttpResponse(u16),
    /// IO error during ureq response read
    Io(io::Error),
    /// Invalid number returned
    Parsing(std::num::ParseIntError),
    /// Invalid Bitcoin data returned
    BitcoinEncoding(bitcoin::consensus::encode::Error),
    /// Invalid Hex data returned
    Hex(bitcoin::hashes::hex::Error),
    /// A request thread panicked
    ThreadPanicked,

    /// Transaction not found
    TransactionNotFound(Txid),
    /// Header height not found
    HeaderHeightNotFound(u32),
    /// Header hash not found
    HeaderHashNotFound(BlockHash),
}

impl fmt::Display for EsploraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ureq(err) => write!(f, "HTTP request error: {}", err),
            Self::UreqTransport(err) => write!(f, "HTTP transport error: {}", err),
            Self::HttpResponse(code) => write!(f, "Unexpected HTTP status {}", code),
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Parsing(err) => write!(f, "Invalid number returned: {}", err),
            Self::BitcoinEncoding(err) => write!(f, "Invalid Bitcoin data returned: {}", err),
            Self::Hex(err) => write!(f, "Invalid hex data returned: {}", err),
            Self::ThreadPanicked => write!(f, "A request thread panicked"),
            Self::TransactionNotFound(txid) => write!(f, "Transaction {} not found", txid),
            Self::HeaderHeightNotFound(height) => {
                write!(f, "Header at height {} not found", height)
            }
            Self::HeaderHashNotFound(hash) => write!(f, "Header with hash {} not found", hash),
        }
    }
}

impl std::error::Error for EsploraError {}

impl_error!(::ureq::Error, Ureq, EsploraError);
impl_error!(::ureq::Transport, UreqTransport, EsploraError);
impl_error!(io::Error, Io, EsploraError);
impl_error!(std::num::ParseIntError, Parsing, EsploraError);
impl_error!(consensus::encode::Error, BitcoinEncoding, EsploraError);
impl_error!(bitcoin::hashes::hex::Error, Hex, EsploraError);

/// Configuration for an [`EsploraBlockchain`]
#[derive(Debug, serde::Deserialize, serde::Serialize, Clone, PartialEq, Eq)]
pub struct EsploraBlockchainConfig {
    /// Base URL of the esplora service
    ///
    /// eg. `https://blockstream.info/api/`
    pub base_url: String,
    /// Optional URL of the proxy to use to make requests to the Esplora server
    ///
    /// The string should be formatted as: `<protocol>://<user>:<password>@host:<port>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    /// Number of parallel requests sent to the esplora service (default: 4)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u8>,
    /// Stop searching addresses for transactions after finding an unused gap of this length.
    pub stop_gap: usize,
    /// Socket timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl EsploraBlockchainConfig {
    /// create a config with default values given the base url
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            proxy: None,
            timeout: None,
            stop_gap: super::DEFAULT_STOP_GAP,
            concurrency: None,
        }
    }
}
