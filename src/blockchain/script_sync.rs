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

/*!
This models how a sync happens where you have a server that you send your script pubkeys to and it
returns associated transactions i.e. electrum.

The sync is a chain of requests: scripts first (gap-limit scan per keychain), then the full
transactions that were never seen before along with their parents, and finally the block headers
needed for confirmation times. Every request works on a [`Snapshot`] of the wallet taken before
any network call; the result is a [`SyncUpdate`] that is applied to the database as one batch.
*/

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use bitcoin::{BlockHeader, OutPoint, Script, Transaction, TxOut, Txid};
use log::{debug, info, trace};
use rand::seq::SliceRandom;

use crate::blockchain::{Blockchain, Progress};
use crate::database::{BatchDatabase, BatchOperations, Database};
use crate::descriptor::{DescriptorMeta, ExtendedDescriptor};
use crate::error::Error;
use crate::types::*;

// share of the progress bar used by the script scan, the rest goes to txs and headers
const SCAN_PROGRESS: f32 = 80.0;

/// A keychain to scan along with the descriptor that generates its scripts
pub(crate) struct KeychainScan<'a> {
    pub keychain: KeychainKind,
    pub descriptor: &'a ExtendedDescriptor,
    /// Last index revealed to the user: the scan never stops before it
    pub revealed: Option<u32>,
}

/// Wallet transactions known before the sync starts
pub(crate) struct Snapshot {
    txs: HashMap<Txid, TransactionDetails>,
    raw_txs: HashMap<Txid, Transaction>,
}

impl Snapshot {
    pub fn load<D: Database>(db: &D) -> Result<Self, Error> {
        let txs = db
            .iter_txs(false)?
            .into_iter()
            .map(|details| (details.txid, details))
            .collect();
        let raw_txs = db
            .iter_raw_txs()?
            .into_iter()
            .map(|tx| (tx.txid(), tx))
            .collect();

        Ok(Snapshot { txs, raw_txs })
    }
}

/// A request for on-chain information
pub(crate) enum Request<'a> {
    /// A request for transactions related to script pubkeys.
    Script(ScriptReq<'a>),
    /// A request for full transactions.
    Tx(TxReq),
    /// A request for the headers of the blocks that confirmed transactions.
    Conftime(ConftimeReq),
    /// Requests are finished, here's the update to apply to the database.
    Finish(SyncUpdate),
}

impl Request<'_> {
    pub fn progress(&self) -> (f32, String) {
        match self {
            Request::Script(req) => req.progress(),
            Request::Tx(req) if req.parents => (88.0, "Fetching parent transactions".into()),
            Request::Tx(_) => (85.0, "Fetching transactions".into()),
            Request::Conftime(_) => (95.0, "Fetching confirmation times".into()),
            Request::Finish(_) => (99.0, "Applying update".into()),
        }
    }
}

/// Start a sync
pub(crate) fn start<'a>(
    snapshot: Snapshot,
    mut keychains: Vec<KeychainScan<'a>>,
    stop_gap: usize,
    tip: u32,
) -> Result<Request<'a>, Error> {
    // shuffling improves privacy, the server doesn't know if the first request is for the
    // internal or the external keychain
    keychains.shuffle(&mut rand::thread_rng());

    let state = State::new(snapshot, tip);
    let total_keychains = keychains.len();
    match keychains.pop() {
        Some(current) => {
            let mut req = ScriptReq {
                state,
                current,
                next_keychains: keychains,
                keychains_done: 0,
                total_keychains,
                batch: Vec::new(),
                batch_start: 0,
                stop_gap: stop_gap.max(1),
            };
            req.fill_batch()?;
            Ok(Request::Script(req))
        }
        None => Ok(TxReq::next(state, false)),
    }
}

/// Gap-limit scan of the script pubkeys of every keychain
pub(crate) struct ScriptReq<'a> {
    state: State,
    current: KeychainScan<'a>,
    next_keychains: Vec<KeychainScan<'a>>,
    keychains_done: usize,
    total_keychains: usize,
    batch: Vec<Script>,
    batch_start: u32,
    stop_gap: usize,
}

impl<'a> ScriptReq<'a> {
    pub fn request(&self) -> &[Script] {
        &self.batch
    }

    fn fill_batch(&mut self) -> Result<(), Error> {
        let size = if self.current.descriptor.is_derivable() {
            self.stop_gap
        } else {
            1
        };

        self.batch.clear();
        for index in self.batch_start..self.batch_start.saturating_add(size as u32) {
            let script = self.current.descriptor.derive_script(index)?;
            self.state
                .scripts
                .insert(script.clone(), (self.current.keychain, index));
            self.batch.push(script);
        }
        Ok(())
    }

    // index the scan has to reach for the current keychain
    fn target(&self) -> u32 {
        let after_used = self
            .state
            .last_used
            .get(&self.current.keychain)
            .map_or(0, |used| used + 1)
            + self.stop_gap as u32;
        let after_revealed = self.current.revealed.map_or(0, |revealed| revealed + 1);

        std::cmp::max(after_used, after_revealed)
    }

    fn progress(&self) -> (f32, String) {
        let per_keychain = SCAN_PROGRESS / self.total_keychains as f32;
        let fraction = (self.batch_start as f32 / self.target() as f32).min(1.0);

        (
            per_keychain * (self.keychains_done as f32 + fraction),
            format!(
                "Scanning {:?} keychain from index {}",
                self.current.keychain, self.batch_start
            ),
        )
    }

    pub fn satisfy(
        mut self,
        // for every script the txids touching it and their confirmation height
        histories: Vec<Vec<(Txid, Option<u32>)>>,
    ) -> Result<Request<'a>, Error> {
        if histories.len() != self.batch.len() {
            return Err(Error::Generic(format!(
                "Expected the history of {} scripts, got {}",
                self.batch.len(),
                histories.len()
            )));
        }

        for (offset, history) in histories.into_iter().enumerate() {
            let index = self.batch_start + offset as u32;
            trace!(
                "found {} transactions for {:?} index {}",
                history.len(),
                self.current.keychain,
                index
            );

            if !history.is_empty() {
                let used = self
                    .state
                    .last_used
                    .entry(self.current.keychain)
                    .or_insert(index);
                *used = std::cmp::max(*used, index);
            }

            for (txid, height) in history {
                self.state.observe(txid, height);
            }
        }
        self.batch_start += self.batch.len() as u32;

        if self.current.descriptor.is_derivable() && self.batch_start < self.target() {
            self.fill_batch()?;
            return Ok(Request::Script(self));
        }

        debug!(
            "finished scanning keychain {:?} at index {}, last used {:?}",
            self.current.keychain,
            self.batch_start,
            self.state.last_used.get(&self.current.keychain)
        );
        self.keychains_done += 1;

        if let Some(next) = self.next_keychains.pop() {
            self.current = next;
            self.batch_start = 0;
            self.fill_batch()?;
            return Ok(Request::Script(self));
        }

        Ok(TxReq::next(self.state, false))
    }
}

/// Download of the transactions never seen before, and then of their parents
pub(crate) struct TxReq {
    state: State,
    request: Vec<Txid>,
    parents: bool,
}

impl TxReq {
    fn next<'a>(state: State, parents: bool) -> Request<'a> {
        let request: Vec<Txid> = if parents {
            state.missing_parents().into_iter().collect()
        } else {
            state.tx_needed.keys().cloned().collect()
        };

        match (request.is_empty(), parents) {
            (true, false) => TxReq::next(state, true),
            (true, true) => Request::Conftime(ConftimeReq::new(state)),
            (false, _) => Request::Tx(TxReq {
                state,
                request,
                parents,
            }),
        }
    }

    pub fn request(&self) -> &[Txid] {
        &self.request
    }

    pub fn satisfy<'a>(mut self, txs: Vec<Transaction>) -> Result<Request<'a>, Error> {
        if txs.len() != self.request.len() {
            return Err(Error::Generic(format!(
                "Expected {} transactions, got {}",
                self.request.len(),
                txs.len()
            )));
        }

        for (txid, tx) in self.request.iter().zip(txs.into_iter()) {
            if tx.txid() != *txid {
                return Err(Error::Generic(format!(
                    "Requested transaction {}, got {}",
                    txid,
                    tx.txid()
                )));
            }
            debug!("downloaded tx {}", txid);

            if self.parents {
                self.state.parents.insert(*txid, tx);
            } else {
                self.state.fetched.insert(*txid, tx);
            }
        }

        if self.parents {
            Ok(Request::Conftime(ConftimeReq::new(self.state)))
        } else {
            Ok(TxReq::next(self.state, true))
        }
    }
}

/// Final step is to get the timestamps of the blocks at the heights we've seen
pub(crate) struct ConftimeReq {
    state: State,
    request: Vec<u32>,
}

impl ConftimeReq {
    fn new(state: State) -> Self {
        let mut heights: BTreeSet<u32> = state
            .tx_needed
            .values()
            .chain(state.updated.values())
            .filter_map(|height| *height)
            .collect();
        // the tip timestamp becomes the sync time
        heights.insert(state.tip);

        ConftimeReq {
            request: heights.into_iter().collect(),
            state,
        }
    }

    pub fn request(&self) -> &[u32] {
        &self.request
    }

    pub fn satisfy<'a>(self, headers: Vec<BlockHeader>) -> Result<Request<'a>, Error> {
        if headers.len() != self.request.len() {
            return Err(Error::Generic(format!(
                "Expected {} block headers, got {}",
                self.request.len(),
                headers.len()
            )));
        }

        let timestamps: HashMap<u32, u64> = self
            .request
            .iter()
            .cloned()
            .zip(headers.iter().map(|header| header.time as u64))
            .collect();

        Ok(Request::Finish(self.state.into_update(&timestamps)?))
    }
}

struct State {
    snapshot: Snapshot,
    tip: u32,
    /// Every script derived during the scan
    scripts: HashMap<Script, (KeychainKind, u32)>,
    /// Highest index with some history, per keychain
    last_used: HashMap<KeychainKind, u32>,
    /// Transactions never seen before, with the height they were reported at
    tx_needed: BTreeMap<Txid, Option<u32>>,
    /// Known transactions whose confirmation height changed
    updated: BTreeMap<Txid, Option<u32>>,
    fetched: HashMap<Txid, Transaction>,
    parents: HashMap<Txid, Transaction>,
}

impl State {
    fn new(snapshot: Snapshot, tip: u32) -> Self {
        State {
            snapshot,
            tip,
            scripts: HashMap::new(),
            last_used: HashMap::new(),
            tx_needed: BTreeMap::new(),
            updated: BTreeMap::new(),
            fetched: HashMap::new(),
            parents: HashMap::new(),
        }
    }

    fn observe(&mut self, txid: Txid, height: Option<u32>) {
        match self.snapshot.txs.get(&txid) {
            Some(known) => {
                let old_height = known.confirmation_time.as_ref().map(|time| time.height);
                if old_height != height {
                    // confirmed since the last sync, or reorged out
                    debug!(
                        "height of {} changed from {:?} to {:?}",
                        txid, old_height, height
                    );
                    self.updated.insert(txid, height);
                }
            }
            None => {
                self.tx_needed.insert(txid, height);
            }
        }
    }

    fn missing_parents(&self) -> BTreeSet<Txid> {
        self.fetched
            .values()
            .flat_map(|tx| tx.input.iter())
            .filter(|input| !input.previous_output.is_null())
            .map(|input| input.previous_output.txid)
            .filter(|txid| {
                !self.fetched.contains_key(txid)
                    && !self.parents.contains_key(txid)
                    && !self.snapshot.raw_txs.contains_key(txid)
            })
            .collect()
    }

    fn previous_output(&self, outpoint: &OutPoint) -> Option<&TxOut> {
        self.fetched
            .get(&outpoint.txid)
            .or_else(|| self.parents.get(&outpoint.txid))
            .or_else(|| self.snapshot.raw_txs.get(&outpoint.txid))
            .and_then(|tx| tx.output.get(outpoint.vout as usize))
    }

    fn is_mine(&self, script: &Script) -> bool {
        self.scripts.contains_key(script)
    }

    fn details(&self, tx: &Transaction, confirmation_time: Option<BlockTime>) -> TransactionDetails {
        let mut sent = 0;
        let mut inputs_sum = Some(0u64);
        for input in tx.input.iter() {
            if input.previous_output.is_null() {
                continue;
            }

            match self.previous_output(&input.previous_output) {
                Some(txout) => {
                    inputs_sum = inputs_sum.map(|sum| sum + txout.value);
                    if self.is_mine(&txout.script_pubkey) {
                        sent += txout.value;
                    }
                }
                None => inputs_sum = None,
            }
        }

        let outputs_sum: u64 = tx.output.iter().map(|output| output.value).sum();
        let received = tx
            .output
            .iter()
            .filter(|output| self.is_mine(&output.script_pubkey))
            .map(|output| output.value)
            .sum();

        TransactionDetails {
            transaction: Some(tx.clone()),
            txid: tx.txid(),
            received,
            sent,
            // coinbase transactions have no inputs to pay a fee with
            fee: inputs_sum.map(|sum| sum.saturating_sub(outputs_sum)),
            confirmation_time,
        }
    }

    fn into_update(self, timestamps: &HashMap<u32, u64>) -> Result<SyncUpdate, Error> {
        let confirmation_time = |height: &Option<u32>| {
            height.and_then(|height| BlockTime::new(Some(height), timestamps.get(&height).cloned()))
        };

        let mut txs = Vec::with_capacity(self.tx_needed.len() + self.updated.len());
        for (txid, height) in self.tx_needed.iter() {
            let tx = self
                .fetched
                .get(txid)
                .ok_or_else(|| Error::Generic(format!("Transaction {} was not downloaded", txid)))?;
            txs.push(self.details(tx, confirmation_time(height)));
        }
        for (txid, height) in self.updated.iter() {
            if let Some(known) = self.snapshot.txs.get(txid) {
                let mut details = known.clone();
                details.confirmation_time = confirmation_time(height);
                txs.push(details);
            }
        }

        let sync_time = timestamps.get(&self.tip).map(|timestamp| SyncTime {
            block_time: BlockTime {
                height: self.tip,
                timestamp: *timestamp,
            },
        });

        Ok(SyncUpdate {
            scripts: self.scripts,
            last_used: self.last_used,
            txs,
            parents: self.parents.into_iter().map(|(_, tx)| tx).collect(),
            sync_time,
        })
    }
}

/// Everything a sync learned, ready to be applied to the database in one batch
pub(crate) struct SyncUpdate {
    scripts: HashMap<Script, (KeychainKind, u32)>,
    last_used: HashMap<KeychainKind, u32>,
    /// New transactions carry the raw transaction, updated ones don't
    txs: Vec<TransactionDetails>,
    parents: Vec<Transaction>,
    sync_time: Option<SyncTime>,
}

impl SyncUpdate {
    fn keychain_of<D: Database>(&self, db: &D, script: &Script) -> Result<Option<KeychainKind>, Error> {
        match self.scripts.get(script) {
            Some((keychain, _)) => Ok(Some(*keychain)),
            None => Ok(db.get_path_from_script_pubkey(script)?.map(|(keychain, _)| keychain)),
        }
    }

    /// Apply the update to the database, atomically
    ///
    /// Transactions are only ever added or updated, never removed.
    pub fn apply<D: BatchDatabase>(self, db: &mut D) -> Result<(), Error> {
        let mut batch = db.begin_batch();

        for (script, (keychain, index)) in self.scripts.iter() {
            if db.get_path_from_script_pubkey(script)?.is_none() {
                batch.set_script_pubkey(script, *keychain, *index)?;
            }
        }

        for parent in self.parents.iter() {
            batch.set_raw_tx(parent)?;
        }

        // every outpoint spent by a wallet transaction, old or new
        let mut spent: HashSet<OutPoint> = HashSet::new();
        let known_txs = db.iter_txs(true)?;
        for tx in known_txs
            .iter()
            .chain(self.txs.iter())
            .filter_map(|details| details.transaction.as_ref())
        {
            spent.extend(tx.input.iter().map(|input| input.previous_output));
        }

        for details in self.txs.iter() {
            if let Some(tx) = &details.transaction {
                for (vout, output) in tx.output.iter().enumerate() {
                    if let Some(keychain) = self.keychain_of(db, &output.script_pubkey)? {
                        let outpoint = OutPoint::new(details.txid, vout as u32);
                        batch.set_utxo(&LocalUtxo {
                            outpoint,
                            txout: output.clone(),
                            keychain,
                            is_spent: spent.contains(&outpoint),
                        })?;
                    }
                }
            }

            batch.set_tx(details)?;
        }

        // utxos we already had that the new transactions spend
        for utxo in db.iter_utxos()? {
            if !utxo.is_spent && spent.contains(&utxo.outpoint) {
                batch.set_utxo(&LocalUtxo {
                    is_spent: true,
                    ..utxo
                })?;
            }
        }

        // the revealed index never moves backwards
        for (keychain, used) in self.last_used.iter() {
            let current = db.get_last_index(*keychain)?;
            if current.map_or(true, |current| current < *used) {
                debug!("updating index of {:?} to {}", keychain, used);
                batch.set_last_index(*keychain, *used)?;
            }
        }

        if let Some(sync_time) = self.sync_time {
            batch.set_sync_time(sync_time)?;
        }

        info!(
            "committing sync update: {} transactions, {} parents",
            self.txs.len(),
            self.parents.len()
        );
        db.commit_batch(batch)
    }
}

/// Run a whole sync against `blockchain`, reporting to `progress` after every request
pub(crate) fn run<'a, B: Blockchain + ?Sized>(
    blockchain: &B,
    snapshot: Snapshot,
    keychains: Vec<KeychainScan<'a>>,
    progress: &dyn Progress,
) -> Result<SyncUpdate, Error> {
    let tip = blockchain.get_height()?;
    let mut request = start(snapshot, keychains, blockchain.stop_gap(), tip)?;
    let mut last_progress = 0.0f32;

    loop {
        let (value, message) = request.progress();
        // the scan target can grow, never report going backwards
        last_progress = last_progress.max(value);
        progress.update(last_progress, Some(message))?;

        request = match request {
            Request::Script(req) => {
                let histories = blockchain.batch_script_get_history(req.request())?;
                req.satisfy(histories)?
            }
            Request::Tx(req) => {
                let txs = blockchain.batch_transaction_get(req.request())?;
                req.satisfy(txs)?
            }
            Request::Conftime(req) => {
                let headers = blockchain.batch_block_header(req.request())?;
                req.satisfy(headers)?
            }
            Request::Finish(update) => return Ok(update),
        };
    }
}
