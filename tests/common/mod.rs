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

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

use bdk_engine::bitcoin::hashes::Hash;
use bdk_engine::bitcoin::{
    BlockHash, BlockHeader, Network, OutPoint, PackedLockTime, Script, Transaction, TxIn,
    TxMerkleNode, TxOut, Txid, WPubkeyHash,
};
use bdk_engine::blockchain::Blockchain;
use bdk_engine::database::MemoryDatabase;
use bdk_engine::{AddressIndex, Error, FeeRate, SyncOptions, Wallet};

pub const GENESIS_TIME: u32 = 1_600_000_000;

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A script no test wallet owns
pub fn external_script() -> Script {
    Script::new_v0_p2wpkh(&WPubkeyHash::hash(b"somebody else"))
}

#[derive(Debug, Default)]
struct ChainState {
    tip: u32,
    /// Every transaction the node knows, with the height it confirmed at
    txs: BTreeMap<Txid, (Transaction, Option<u32>)>,
    nonce: u32,
}

/// An in-memory chain and mempool
///
/// Scripts histories are computed from the stored transactions, the same way an Electrum server
/// would: a transaction belongs to a script's history if it pays to it or spends from it.
#[derive(Debug, Default)]
pub struct MockBlockchain {
    state: Mutex<ChainState>,
    /// When set, the next history request signals it started and waits to be released
    history_pause: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl MockBlockchain {
    pub fn new(tip: u32) -> Self {
        let blockchain = MockBlockchain::default();
        blockchain.state.lock().unwrap().tip = tip;
        blockchain
    }

    /// Send `value` to `script` from outside the wallet, confirmed at `height`
    pub fn fund(&self, script: &Script, value: u64, height: Option<u32>) -> OutPoint {
        let mut state = self.state.lock().unwrap();
        state.nonce += 1;

        let faucet = Transaction {
            version: 1,
            lock_time: PackedLockTime(state.nonce),
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                ..TxIn::default()
            }],
            output: vec![TxOut {
                value: value + 1_000,
                script_pubkey: external_script(),
            }],
        };
        let funding = Transaction {
            version: 1,
            lock_time: PackedLockTime(0),
            input: vec![TxIn {
                previous_output: OutPoint::new(faucet.txid(), 0),
                ..TxIn::default()
            }],
            output: vec![TxOut {
                value,
                script_pubkey: script.clone(),
            }],
        };
        let outpoint = OutPoint::new(funding.txid(), 0);

        state.txs.insert(faucet.txid(), (faucet, Some(1)));
        state.txs.insert(funding.txid(), (funding, height));

        outpoint
    }

    pub fn confirm(&self, txid: &Txid, height: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some((_, confirmation)) = state.txs.get_mut(txid) {
            *confirmation = Some(height);
        }
        state.tip = state.tip.max(height);
    }

    pub fn set_tip(&self, tip: u32) {
        self.state.lock().unwrap().tip = tip;
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.state.lock().unwrap().txs.contains_key(txid)
    }

    /// Block the next script history request. The returned receiver is notified when the
    /// request starts, and the request completes after a message on the returned sender.
    pub fn pause_history_requests(&self) -> (Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = channel();
        let (release_tx, release_rx) = channel();
        *self.history_pause.lock().unwrap() = Some((entered_tx, release_rx));

        (entered_rx, release_tx)
    }

    fn header(height: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: GENESIS_TIME + height * 600,
            bits: 0x207fffff,
            nonce: height,
        }
    }
}

impl Blockchain for MockBlockchain {
    fn broadcast(&self, tx: &Transaction) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.txs.insert(tx.txid(), (tx.clone(), None));
        Ok(())
    }

    fn get_height(&self) -> Result<u32, Error> {
        Ok(self.state.lock().unwrap().tip)
    }

    fn get_block_hash(&self, height: u64) -> Result<BlockHash, Error> {
        Ok(Self::header(height as u32).block_hash())
    }

    fn estimate_fee(&self, _target: usize) -> Result<FeeRate, Error> {
        Ok(FeeRate::from_sat_per_vb(1.0))
    }

    fn get_tx(&self, txid: &Txid) -> Result<Option<Transaction>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .txs
            .get(txid)
            .map(|(tx, _)| tx.clone()))
    }

    fn batch_script_get_history(
        &self,
        scripts: &[Script],
    ) -> Result<Vec<Vec<(Txid, Option<u32>)>>, Error> {
        let pause = self.history_pause.lock().unwrap().take();
        if let Some((entered, release)) = pause {
            let _ = entered.send(());
            let _ = release.recv();
        }

        let state = self.state.lock().unwrap();
        let pays_to = |tx: &Transaction, script: &Script| {
            tx.output.iter().any(|output| output.script_pubkey == *script)
        };

        Ok(scripts
            .iter()
            .map(|script| {
                state
                    .txs
                    .iter()
                    .filter(|(_, (tx, _))| {
                        pays_to(tx, script)
                            || tx.input.iter().any(|input| {
                                state
                                    .txs
                                    .get(&input.previous_output.txid)
                                    .and_then(|(prev, _)| {
                                        prev.output.get(input.previous_output.vout as usize)
                                    })
                                    .map_or(false, |prevout| prevout.script_pubkey == *script)
                            })
                    })
                    .map(|(txid, (_, height))| (*txid, *height))
                    .collect()
            })
            .collect())
    }

    fn batch_transaction_get(&self, txids: &[Txid]) -> Result<Vec<Transaction>, Error> {
        let state = self.state.lock().unwrap();
        txids
            .iter()
            .map(|txid| {
                state
                    .txs
                    .get(txid)
                    .map(|(tx, _)| tx.clone())
                    .ok_or_else(|| Error::Generic(format!("Unknown transaction {}", txid)))
            })
            .collect()
    }

    fn batch_block_header(&self, heights: &[u32]) -> Result<Vec<BlockHeader>, Error> {
        Ok(heights.iter().map(|height| Self::header(*height)).collect())
    }

    fn stop_gap(&self) -> usize {
        5
    }
}

pub fn get_test_wpkh() -> &'static str {
    "wpkh(tprv8ZgxMBicQKsPd3EupYiPRhaMooHKUHJxNsTfYuScep13go8QFfHdtkG9nRkFGb7busX4isf6X9dURGCoKgitaApQ6MupRhZMcELAxTBRJgS/0/*)"
}

pub fn get_test_wpkh_change() -> &'static str {
    "wpkh(tprv8ZgxMBicQKsPd3EupYiPRhaMooHKUHJxNsTfYuScep13go8QFfHdtkG9nRkFGb7busX4isf6X9dURGCoKgitaApQ6MupRhZMcELAxTBRJgS/1/*)"
}

pub fn new_wallet() -> Wallet<MemoryDatabase> {
    Wallet::new(
        get_test_wpkh(),
        Some(get_test_wpkh_change()),
        Network::Regtest,
        MemoryDatabase::new(),
    )
    .unwrap()
}

/// A synced wallet holding one confirmed utxo for every value in `amounts`
pub fn get_funded_wallet(amounts: &[u64]) -> (Wallet<MemoryDatabase>, MockBlockchain) {
    let wallet = new_wallet();
    let blockchain = MockBlockchain::new(100);

    for amount in amounts {
        let address = wallet.get_address(AddressIndex::New).unwrap();
        blockchain.fund(&address.script_pubkey(), *amount, Some(50));
    }
    wallet.sync(&blockchain, SyncOptions::default()).unwrap();

    (wallet, blockchain)
}
