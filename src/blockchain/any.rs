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

//! Runtime-checked blockchain types
//!
//! This module provides the implementation of [`AnyBlockchain`] which allows switching the
//! inner [`Blockchain`] type at runtime.
//!
//! ## Example
//!
//! When paired with the use of [`ConfigurableBlockchain`], it allows creating any
//! blockchain type supported using a single line of code:
//!
//! ```no_run
//! # use bdk_engine::blockchain::*;
//! let config: BlockchainConfig = serde_json::from_str(
//!     r#"{"type": "electrum", "url": "ssl://electrum.blockstream.info:60002", "socks5": null,
//!         "retry": 3, "timeout": 5, "stop_gap": 20, "validate_domain": true}"#,
//! )?;
//! let blockchain = AnyBlockchain::from_config(&config)?;
//! let height = blockchain.get_height();
//! # Ok::<(), bdk_engine::Error>(())
//! ```

use super::*;

macro_rules! impl_from {
    ( boxed $from:ty, $to:ty, $variant:ident, $( $cfg:tt )* ) => {
        $( $cfg )*
        impl From<$from> for $to {
            fn from(inner: $from) -> Self {
                <$to>::$variant(Box::new(inner))
            }
        }
    };
    ( $from:ty, $to:ty, $variant:ident, $( $cfg:tt )* ) => {
        $( $cfg )*
        impl From<$from> for $to {
            fn from(inner: $from) -> Self {
                <$to>::$variant(inner)
            }
        }
    };
}

macro_rules! impl_inner_method {
    ( $self:expr, $name:ident $(, $args:expr)* ) => {
        match $self {
            #[cfg(feature = "electrum")]
            AnyBlockchain::Electrum(inner) => inner.$name( $($args, )* ),
            #[cfg(feature = "esplora")]
            AnyBlockchain::Esplora(inner) => inner.$name( $($args, )* ),
        }
    }
}

/// Type that can contain any of the [`Blockchain`] types defined by the library
///
/// It allows switching backend at runtime
///
/// See [this module](crate::blockchain::any)'s documentation for a usage example.
pub enum AnyBlockchain {
    #[cfg(feature = "electrum")]
    #[cfg_attr(docsrs, doc(cfg(feature = "electrum")))]
    /// Electrum client
    Electrum(Box<electrum::ElectrumBlockchain>),
    #[cfg(feature = "esplora")]
    #[cfg_attr(docsrs, doc(cfg(feature = "esplora")))]
    /// Esplora client
    Esplora(Box<esplora::EsploraBlockchain>),
}

impl Blockchain for AnyBlockchain {
    fn broadcast(&self, tx: &Transaction) -> Result<(), Error> {
        impl_inner_method!(self, broadcast, tx)
    }

    fn get_height(&self) -> Result<u32, Error> {
        impl_inner_method!(self, get_height)
    }

    fn get_block_hash(&self, height: u64) -> Result<BlockHash, Error> {
        impl_inner_method!(self, get_block_hash, height)
    }

    fn estimate_fee(&self, target: usize) -> Result<FeeRate, Error> {
        impl_inner_method!(self, estimate_fee, target)
    }

    fn get_tx(&self, txid: &Txid) -> Result<Option<Transaction>, Error> {
        impl_inner_method!(self, get_tx, txid)
    }

    fn batch_script_get_history(
        &self,
        scripts: &[Script],
    ) -> Result<Vec<Vec<(Txid, Option<u32>)>>, Error> {
        impl_inner_method!(self, batch_script_get_history, scripts)
    }

    fn batch_transaction_get(&self, txids: &[Txid]) -> Result<Vec<Transaction>, Error> {
        impl_inner_method!(self, batch_transaction_get, txids)
    }

    fn batch_block_header(&self, heights: &[u32]) -> Result<Vec<BlockHeader>, Error> {
        impl_inner_method!(self, batch_block_header, heights)
    }

    fn stop_gap(&self) -> usize {
        impl_inner_method!(self, stop_gap)
    }
}

impl_from!(boxed electrum::ElectrumBlockchain, AnyBlockchain, Electrum, #[cfg(feature = "electrum")]);
impl_from!(boxed esplora::EsploraBlockchain, AnyBlockchain, Esplora, #[cfg(feature = "esplora")]);

/// Type that can contain any of the blockchain configurations defined by the library
///
/// This allows storing a single configuration that can be loaded into an [`AnyBlockchain`]
/// instance. Wallets that plan to offer users the ability to switch blockchain backend at runtime
/// will find this particularly useful.
///
/// This type can be serialized from a JSON object like:
///
/// ```
/// # #[cfg(feature = "electrum")]
/// # {
/// use bdk_engine::blockchain::{electrum::ElectrumBlockchainConfig, BlockchainConfig};
/// let config: BlockchainConfig = serde_json::from_str(
///     r#"{
///    "type" : "electrum",
///    "url" : "ssl://electrum.blockstream.info:50002",
///    "retry": 2,
///    "socks5": null,
///    "timeout": null,
///    "stop_gap": 20,
///    "validate_domain": true
/// }"#,
/// )
/// .unwrap();
/// assert_eq!(
///     config,
///     BlockchainConfig::Electrum(ElectrumBlockchainConfig {
///         url: "ssl://electrum.blockstream.info:50002".into(),
///         retry: 2,
///         socks5: None,
///         timeout: None,
///         stop_gap: 20,
///         validate_domain: true,
///     })
/// );
/// # }
/// ```
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockchainConfig {
    #[cfg(feature = "electrum")]
    #[cfg_attr(docsrs, doc(cfg(feature = "electrum")))]
    /// Electrum client
    Electrum(electrum::ElectrumBlockchainConfig),
    #[cfg(feature = "esplora")]
    #[cfg_attr(docsrs, doc(cfg(feature = "esplora")))]
    /// Esplora client
    Esplora(esplora::EsploraBlockchainConfig),
}

impl ConfigurableBlockchain for AnyBlockchain {
    type Config = BlockchainConfig;

    fn from_config(config: &Self::Config) -> Result<Self, Error> {
        Ok(match config {
            #[cfg(feature = "electrum")]
            BlockchainConfig::Electrum(inner) => {
                AnyBlockchain::Electrum(Box::new(electrum::ElectrumBlockchain::from_config(inner)?))
            }
            #[cfg(feature = "esplora")]
            BlockchainConfig::Esplora(inner) => {
                AnyBlockchain::Esplora(Box::new(esplora::EsploraBlockchain::from_config(inner)?))
            }
        })
    }
}

impl_from!(electrum::ElectrumBlockchainConfig, BlockchainConfig, Electrum, #[cfg(feature = "electrum")]);
impl_from!(esplora::EsploraBlockchainConfig, BlockchainConfig, Esplora, #[cfg(feature = "esplora")]);

#[cfg(test)]
mod test {
    use super::*;

    #[cfg(feature = "esplora")]
    #[test]
    fn test_esplora_config_tagged() {
        let config: BlockchainConfig = serde_json::from_str(
            r#"{"type": "esplora", "base_url": "https://blockstream.info/api", "stop_gap": 10, "concurrency": 8}"#,
        )
        .unwrap();

        let mut expected = esplora::EsploraBlockchainConfig::new("https://blockstream.info/api".into());
        expected.stop_gap = 10;
        expected.concurrency = Some(8);
        assert_eq!(config, BlockchainConfig::Esplora(expected));

        let blockchain = AnyBlockchain::from_config(&config).unwrap();
        assert_eq!(blockchain.stop_gap(), 10);
    }

    #[cfg(feature = "electrum")]
    #[test]
    fn test_electrum_config_roundtrip_through_tag() {
        let inner = electrum::ElectrumBlockchainConfig {
            url: "tcp://127.0.0.1:50001".into(),
            socks5: None,
            retry: 1,
            timeout: Some(3),
            stop_gap: 15,
            validate_domain: false,
        };
        let config: BlockchainConfig = inner.clone().into();

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["type"], "electrum");
        assert_eq!(json["stop_gap"], 15);

        let parsed: BlockchainConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, BlockchainConfig::Electrum(inner));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let res = serde_json::from_str::<BlockchainConfig>(r#"{"type": "rpc", "url": "x"}"#);
        assert!(res.is_err());
    }
}
