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

//! Esplora by way of `ureq` HTTP client.

use std::collections::HashMap;
use std::io;
use std::io::Read;
use std::str::FromStr;
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace};

use ::ureq::{Agent, AgentBuilder, Proxy, Response};

use bitcoin::consensus::{deserialize, serialize};
use bitcoin::hashes::hex::{FromHex, ToHex};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::{BlockHash, BlockHeader, Script, Transaction, Txid};

use super::{into_fee_rate, EsploraBlockchainConfig, EsploraError, EsploraGetHistory};
use crate::blockchain::*;
use crate::error::Error;
use crate::FeeRate;

// esplora pages confirmed history by this many transactions
const CHAIN_PAGE_SIZE: usize = 25;

#[derive(Debug)]
struct UrlClient {
    url: String,
    agent: Agent,
}

/// Structure that implements the logic to sync with Esplora
///
/// ## Example
/// See the [`blockchain::esplora`](crate::blockchain::esplora) module for a usage example.
#[derive(Debug)]
pub struct EsploraBlockchain {
    url_client: UrlClient,
    stop_gap: usize,
    concurrency: u8,
}

impl std::convert::From<UrlClient> for EsploraBlockchain {
    fn from(url_client: UrlClient) -> Self {
        EsploraBlockchain {
            url_client,
            stop_gap: DEFAULT_STOP_GAP,
            concurrency: super::DEFAULT_CONCURRENT_REQUESTS,
        }
    }
}

impl EsploraBlockchain {
    /// Create a new instance of the client from a base URL and `stop_gap`.
    pub fn new(base_url: &str, stop_gap: usize) -> Self {
        EsploraBlockchain {
            url_client: UrlClient {
                url: base_url.trim_end_matches('/').to_string(),
                agent: Agent::new(),
            },
            stop_gap,
            concurrency: super::DEFAULT_CONCURRENT_REQUESTS,
        }
    }

    /// Set the inner `ureq` agent.
    pub fn with_agent(mut self, agent: Agent) -> Self {
        self.url_client.agent = agent;
        self
    }

    /// Set the number of parallel requests the client can make.
    pub fn with_concurrency(mut self, concurrency: u8) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    // runs `f` over `items`, `concurrency` requests at a time, keeping the order
    fn parallel<T, R, F>(&self, items: &[T], f: F) -> Result<Vec<R>, EsploraError>
    where
        T: Sync,
        R: Send,
        F: Fn(&UrlClient, &T) -> Result<R, EsploraError> + Sync,
    {
        let f = &f;
        let client = &self.url_client;
        let mut results = Vec::with_capacity(items.len());

        for chunk in items.chunks(self.concurrency.max(1) as usize) {
            let chunk_results: Vec<Result<R, EsploraError>> = std::thread::scope(|s| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|item| s.spawn(move || f(client, item)))
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .unwrap_or_else(|_| Err(EsploraError::ThreadPanicked))
                    })
                    .collect()
            });

            for result in chunk_results {
                results.push(result?);
            }
        }

        Ok(results)
    }
}

impl Blockchain for EsploraBlockchain {
    fn broadcast(&self, tx: &Transaction) -> Result<(), Error> {
        Ok(self.url_client._broadcast(tx)?)
    }

    fn get_height(&self) -> Result<u32, Error> {
        Ok(self.url_client._get_height()?)
    }

    fn get_block_hash(&self, height: u64) -> Result<BlockHash, Error> {
        Ok(self.url_client._get_block_hash(height as u32)?)
    }

    fn estimate_fee(&self, target: usize) -> Result<FeeRate, Error> {
        let estimates = self.url_client._get_fee_estimates()?;
        into_fee_rate(target, estimates)
    }

    fn get_tx(&self, txid: &Txid) -> Result<Option<Transaction>, Error> {
        Ok(self.url_client._get_tx(txid)?)
    }

    fn batch_script_get_history(
        &self,
        scripts: &[Script],
    ) -> Result<Vec<Vec<(Txid, Option<u32>)>>, Error> {
        Ok(self.parallel(scripts, |client, script| client._script_get_history(script))?)
    }

    fn batch_transaction_get(&self, txids: &[Txid]) -> Result<Vec<Transaction>, Error> {
        Ok(self.parallel(txids, |client, txid| client._get_tx_no_opt(txid))?)
    }

    fn batch_block_header(&self, heights: &[u32]) -> Result<Vec<BlockHeader>, Error> {
        Ok(self.parallel(heights, |client, height| client._get_header(*height))?)
    }

    fn stop_gap(&self) -> usize {
        self.stop_gap
    }
}

impl UrlClient {
    fn script_to_scripthash(script: &Script) -> String {
        sha256::Hash::hash(script.as_bytes()).into_inner().to_hex()
    }

    fn _get_tx(&self, txid: &Txid) -> Result<Option<Transaction>, EsploraError> {
        let resp = self
            .agent
            .get(&format!("{}/tx/{}/raw", self.url, txid))
            .call();

        match resp {
            Ok(resp) => Ok(Some(deserialize(&into_bytes(resp)?)?)),
            Err(::ureq::Error::Status(code, _)) => {
                if is_status_not_found(code) {
                    return Ok(None);
                }
                Err(EsploraError::HttpResponse(code))
            }
            Err(e) => Err(EsploraError::Ureq(e)),
        }
    }

    fn _get_tx_no_opt(&self, txid: &Txid) -> Result<Transaction, EsploraError> {
        match self._get_tx(txid) {
            Ok(Some(tx)) => Ok(tx),
            Ok(None) => Err(EsploraError::TransactionNotFound(*txid)),
            Err(e) => Err(e),
        }
    }

    fn _get_block_hash(&self, block_height: u32) -> Result<BlockHash, EsploraError> {
        let resp = self
            .agent
            .get(&format!("{}/block-height/{}", self.url, block_height))
            .call();

        let text = match resp {
            Ok(resp) => Ok(resp.into_string()?),
            Err(::ureq::Error::Status(code, _)) if is_status_not_found(code) => {
                Err(EsploraError::HeaderHeightNotFound(block_height))
            }
            Err(::ureq::Error::Status(code, _)) => Err(EsploraError::HttpResponse(code)),
            Err(e) => Err(EsploraError::Ureq(e)),
        }?;

        BlockHash::from_str(text.trim()).map_err(|_| EsploraError::HeaderHeightNotFound(block_height))
    }

    fn _get_header(&self, block_height: u32) -> Result<BlockHeader, EsploraError> {
        let hash = self._get_block_hash(block_height)?;

        let resp = self
            .agent
            .get(&format!("{}/block/{}/header", self.url, hash))
            .call();

        match resp {
            Ok(resp) => Ok(deserialize(&Vec::from_hex(resp.into_string()?.trim())?)?),
            Err(::ureq::Error::Status(code, _)) if is_status_not_found(code) => {
                Err(EsploraError::HeaderHashNotFound(hash))
            }
            Err(::ureq::Error::Status(code, _)) => Err(EsploraError::HttpResponse(code)),
            Err(e) => Err(EsploraError::Ureq(e)),
        }
    }

    fn _broadcast(&self, transaction: &Transaction) -> Result<(), EsploraError> {
        let resp = self
            .agent
            .post(&format!("{}/tx", self.url))
            .send_string(&serialize(transaction).to_hex());

        match resp {
            Ok(_) => Ok(()),
            Err(::ureq::Error::Status(code, _)) => Err(EsploraError::HttpResponse(code)),
            Err(e) => Err(EsploraError::Ureq(e)),
        }
    }

    fn _get_height(&self) -> Result<u32, EsploraError> {
        let resp = self
            .agent
            .get(&format!("{}/blocks/tip/height", self.url))
            .call();

        match resp {
            Ok(resp) => Ok(resp.into_string()?.trim().parse()?),
            Err(::ureq::Error::Status(code, _)) => Err(EsploraError::HttpResponse(code)),
            Err(e) => Err(EsploraError::Ureq(e)),
        }
    }

    fn _get_history_page(&self, path: &str) -> Result<Vec<EsploraGetHistory>, EsploraError> {
        let resp = self.agent.get(&format!("{}{}", self.url, path)).call();

        match resp {
            Ok(resp) => Ok(resp.into_json()?),
            Err(::ureq::Error::Status(code, _)) => Err(EsploraError::HttpResponse(code)),
            Err(e) => Err(EsploraError::Ureq(e)),
        }
    }

    fn _script_get_history(
        &self,
        script: &Script,
    ) -> Result<Vec<(Txid, Option<u32>)>, EsploraError> {
        let mut result = Vec::new();
        let scripthash = Self::script_to_scripthash(script);

        // Add the unconfirmed transactions first
        let mempool = self._get_history_page(&format!("/scripthash/{}/txs/mempool", scripthash))?;
        result.extend(mempool.into_iter().map(|x| (x.txid, None)));

        debug!(
            "Found {} mempool txs for {} - {:?}",
            result.len(),
            scripthash,
            script
        );

        // Then go through all the pages of confirmed transactions
        let mut last_txid = String::new();
        loop {
            let page = self._get_history_page(&format!(
                "/scripthash/{}/txs/chain/{}",
                scripthash, last_txid
            ))?;

            let len = page.len();
            if let Some(elem) = page.last() {
                last_txid = elem.txid.to_hex();
            }

            debug!("... adding {} confirmed transactions", len);

            result.extend(page.into_iter().map(|x| (x.txid, x.status.block_height)));

            if len < CHAIN_PAGE_SIZE {
                break;
            }
        }

        Ok(result)
    }

    fn _get_fee_estimates(&self) -> Result<HashMap<String, f64>, EsploraError> {
        let resp = self
            .agent
            .get(&format!("{}/fee-estimates", self.url,))
            .call();

        match resp {
            Ok(resp) => Ok(resp.into_json()?),
            Err(::ureq::Error::Status(code, _)) => Err(EsploraError::HttpResponse(code)),
            Err(e) => Err(EsploraError::Ureq(e)),
        }
    }
}

fn is_status_not_found(status: u16) -> bool {
    status == 404
}

fn into_bytes(resp: Response) -> Result<Vec<u8>, io::Error> {
    const BYTES_LIMIT: usize = 10 * 1_024 * 1_024;

    let mut buf: Vec<u8> = vec![];
    resp.into_reader()
        .take((BYTES_LIMIT + 1) as u64)
        .read_to_end(&mut buf)?;
    if buf.len() > BYTES_LIMIT {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            "response too big for into_bytes",
        ));
    }

    Ok(buf)
}

impl ConfigurableBlockchain for EsploraBlockchain {
    type Config = EsploraBlockchainConfig;

    fn from_config(config: &Self::Config) -> Result<Self, Error> {
        let mut agent_builder = AgentBuilder::new();

        if let Some(timeout) = config.timeout {
            agent_builder = agent_builder.timeout(Duration::from_secs(timeout));
        }

        if let Some(proxy) = &config.proxy {
            agent_builder = agent_builder.proxy(Proxy::new(proxy).map_err(EsploraError::from)?);
        }

        let mut blockchain = EsploraBlockchain::new(config.base_url.as_str(), config.stop_gap)
            .with_agent(agent_builder.build());

        if let Some(concurrency) = config.concurrency {
            blockchain = blockchain.with_concurrency(concurrency);
        }

        Ok(blockchain)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_from_config() {
        let mut config = EsploraBlockchainConfig::new("https://blockstream.info/api/".into());
        config.concurrency = Some(0);
        config.stop_gap = 5;
        config.timeout = Some(10);

        let blockchain = EsploraBlockchain::from_config(&config).unwrap();
        assert_eq!(blockchain.url_client.url, "https://blockstream.info/api");
        assert_eq!(blockchain.stop_gap(), 5);
        // zero would never make progress
        assert_eq!(blockchain.concurrency, 1);
    }

    #[test]
    fn test_script_to_scripthash() {
        let script = Script::from(
            Vec::<u8>::from_hex("76a91402306a7c23f3e8010de41e9e591348bb83f11daa88ac").unwrap(),
        );
        let scripthash = UrlClient::script_to_scripthash(&script);
        assert_eq!(scripthash.len(), 64);
        assert_eq!(
            scripthash,
            sha256::Hash::hash(script.as_bytes()).into_inner().to_hex()
        );
    }
}
