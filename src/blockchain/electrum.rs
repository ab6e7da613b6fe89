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

//! Electrum
//!
//! This module defines a [`Blockchain`] struct that wraps an [`electrum_client::Client`]
//! and answers the queries the wallet needs to populate its [database](crate::database::Database).
//!
//! ## Example
//!
//! ```no_run
//! # use bdk_engine::blockchain::electrum::ElectrumBlockchain;
//! let client = electrum_client::Client::new("ssl://electrum.blockstream.info:50002")?;
//! let blockchain = ElectrumBlockchain::from(client);
//! # Ok::<(), bdk_engine::Error>(())
//! ```

#[allow(unused_imports)]
use log::{debug, error, info, trace};

use bitcoin::{BlockHash, BlockHeader, Script, Transaction, Txid};

use electrum_client::{Client, ConfigBuilder, ElectrumApi, Socks5Config};

use super::*;
use crate::error::Error;
use crate::FeeRate;

/// Wrapper over an Electrum Client that implements the required blockchain traits
///
/// ## Example
/// See the [`blockchain::electrum`](crate::blockchain::electrum) module for a usage example.
pub struct ElectrumBlockchain {
    client: Client,
    stop_gap: usize,
}

impl std::convert::From<Client> for ElectrumBlockchain {
    fn from(client: Client) -> Self {
        ElectrumBlockchain {
            client,
            stop_gap: DEFAULT_STOP_GAP,
        }
    }
}

impl Blockchain for ElectrumBlockchain {
    fn broadcast(&self, tx: &Transaction) -> Result<(), Error> {
        Ok(self.client.transaction_broadcast(tx).map(|_| ())?)
    }

    fn get_height(&self) -> Result<u32, Error> {
        // TODO: unsubscribe when added to the client, or is there a better call to use here?

        Ok(self
            .client
            .block_headers_subscribe()
            .map(|data| data.height as u32)?)
    }

    fn get_block_hash(&self, height: u64) -> Result<BlockHash, Error> {
        Ok(self.client.block_header(height as usize)?.block_hash())
    }

    fn estimate_fee(&self, target: usize) -> Result<FeeRate, Error> {
        Ok(FeeRate::from_btc_per_kvb(
            self.client.estimate_fee(target)? as f32
        ))
    }

    fn get_tx(&self, txid: &Txid) -> Result<Option<Transaction>, Error> {
        Ok(self.client.transaction_get(txid).map(Option::Some)?)
    }

    fn batch_script_get_history(
        &self,
        scripts: &[Script],
    ) -> Result<Vec<Vec<(Txid, Option<u32>)>>, Error> {
        let histories = self.client.batch_script_get_history(scripts.iter())?;

        Ok(histories
            .into_iter()
            .map(|history| {
                history
                    .into_iter()
                    .map(|res| {
                        // zero or negative heights are mempool transactions
                        let height = if res.height > 0 {
                            Some(res.height as u32)
                        } else {
                            None
                        };
                        (res.tx_hash, height)
                    })
                    .collect()
            })
            .collect())
    }

    fn batch_transaction_get(&self, txids: &[Txid]) -> Result<Vec<Transaction>, Error> {
        Ok(self.client.batch_transaction_get(txids.iter())?)
    }

    fn batch_block_header(&self, heights: &[u32]) -> Result<Vec<BlockHeader>, Error> {
        Ok(self.client.batch_block_header(heights.iter().cloned())?)
    }

    fn stop_gap(&self) -> usize {
        self.stop_gap
    }
}

/// Configuration for an [`ElectrumBlockchain`]
#[derive(Debug, serde::Deserialize, serde::Serialize, Clone, PartialEq, Eq)]
pub struct ElectrumBlockchainConfig {
    /// URL of the Electrum server (such as ElectrumX, Esplora, BWT) may start with `ssl://` or `tcp://` and include a port
    ///
    /// eg. `ssl://electrum.blockstream.info:60002`
    pub url: String,
    /// URL of the socks5 proxy server or a Tor service
    pub socks5: Option<String>,
    /// Request retry count
    pub retry: u8,
    /// Request timeout (seconds)
    pub timeout: Option<u8>,
    /// Stop searching addresses for transactions after finding an unused gap of this length
    pub stop_gap: usize,
    /// Validate the domain when using SSL
    pub validate_domain: bool,
}

impl ConfigurableBlockchain for ElectrumBlockchain {
    type Config = ElectrumBlockchainConfig;

    fn from_config(config: &Self::Config) -> Result<Self, Error> {
        let socks5 = config.socks5.as_ref().map(Socks5Config::new);
        let electrum_config = ConfigBuilder::new()
            .retry(config.retry)
            .timeout(config.timeout)?
            .socks5(socks5)?
            .validate_domain(config.validate_domain)
            .build();

        Ok(ElectrumBlockchain {
            client: Client::from_config(config.url.as_str(), electrum_config)?,
            stop_gap: config.stop_gap,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_electrum_config_serde() {
        let json = r#"{
            "url": "ssl://electrum.blockstream.info:60002",
            "socks5": null,
            "retry": 3,
            "timeout": 5,
            "stop_gap": 25,
            "validate_domain": true
        }"#;
        let config: ElectrumBlockchainConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.url, "ssl://electrum.blockstream.info:60002");
        assert_eq!(config.retry, 3);
        assert_eq!(config.timeout, Some(5));
        assert_eq!(config.stop_gap, 25);
        assert!(config.validate_domain);
        assert_eq!(config.socks5, None);
    }
}
