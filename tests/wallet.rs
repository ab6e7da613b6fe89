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

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use assert_matches::assert_matches;
use bdk_engine::bitcoin::{Network, Sequence};
use bdk_engine::blockchain::progress;
use bdk_engine::database::{Database, MemoryDatabase};
use bdk_engine::{
    AddressIndex, Error, FeeRate, KeychainKind, SignOptions, SyncOptions, TransactionDetails,
    Wallet,
};

use common::*;

fn sorted_txs(wallet: &Wallet<MemoryDatabase>) -> Vec<TransactionDetails> {
    let mut txs = wallet.list_transactions(false).unwrap();
    txs.sort_by_key(|details| details.txid);
    txs
}

#[test]
fn test_bip84_testnet_address() {
    let wallet = Wallet::new(
        "wpkh(tprv8ZgxMBicQKsPcx5nBGsR63Pe8KnRUqmbJNENAfGftF3yuXoMMoVJJcYeUw5eVkm9WBPjWYt6HMWYJNesB5HaNVBaFc1M6dRjWSYnmewUMYy/84h/0h/0h/0/*)",
        None,
        Network::Testnet,
        MemoryDatabase::new(),
    )
    .unwrap();

    let address = wallet.get_address(AddressIndex::New).unwrap();
    assert_eq!(address.index, 0);
    assert_eq!(
        address.to_string(),
        "tb1qkmvk2nadgplmd57ztld8nf8v2yxkzmdvvztyse"
    );
}

#[test]
fn test_wrong_network_key() {
    let res = Wallet::new(
        "wpkh(xprv9s21ZrQH143K4CTb63EaMxja1YiTnSEWKMbn23uoEnAzxjdUJRQkazCAtzxGm4LSoTSVTptoV9RbchnKPW9HxKtZumdyxyikZFDLhogJ5Uj/0/*)",
        None,
        Network::Testnet,
        MemoryDatabase::new(),
    );
    assert_matches!(res, Err(Error::Descriptor(_)));
}

#[test]
fn test_sync_finds_funds() {
    init();

    let (wallet, _) = get_funded_wallet(&[50_000, 20_000]);

    let balance = wallet.get_balance().unwrap();
    assert_eq!(balance.confirmed, 70_000);
    assert_eq!(wallet.list_unspent().unwrap().len(), 2);
    assert_eq!(wallet.list_transactions(false).unwrap().len(), 2);

    let sync_time = wallet.database().unwrap().get_sync_time().unwrap().unwrap();
    assert_eq!(sync_time.block_time.height, 100);
    assert_eq!(
        sync_time.block_time.timestamp,
        (GENESIS_TIME + 100 * 600) as u64
    );
}

#[test]
fn test_sync_reports_fee_and_confirmation() {
    let (wallet, _) = get_funded_wallet(&[50_000]);

    let details = &wallet.list_transactions(true).unwrap()[0];
    assert_eq!(details.received, 50_000);
    assert_eq!(details.sent, 0);
    assert_eq!(details.fee, Some(1_000));
    assert_eq!(details.confirmation_time.as_ref().map(|t| t.height), Some(50));
    assert!(details.transaction.is_some());
}

#[test]
fn test_sync_is_idempotent() {
    let (wallet, blockchain) = get_funded_wallet(&[50_000, 3_000]);

    let txs = sorted_txs(&wallet);
    let unspent = wallet.list_unspent().unwrap();

    wallet.sync(&blockchain, SyncOptions::default()).unwrap();

    assert_eq!(sorted_txs(&wallet), txs);
    let mut after = wallet.list_unspent().unwrap();
    let mut before = unspent;
    after.sort_by_key(|utxo| utxo.outpoint);
    before.sort_by_key(|utxo| utxo.outpoint);
    assert_eq!(after, before);
}

#[test]
fn test_sync_updates_confirmation() {
    let wallet = new_wallet();
    let blockchain = MockBlockchain::new(100);
    let address = wallet.get_address(AddressIndex::New).unwrap();
    let outpoint = blockchain.fund(&address.script_pubkey(), 10_000, None);

    wallet.sync(&blockchain, SyncOptions::default()).unwrap();
    assert_eq!(wallet.get_balance().unwrap().untrusted_pending, 10_000);

    blockchain.confirm(&outpoint.txid, 101);
    wallet.sync(&blockchain, SyncOptions::default()).unwrap();

    let balance = wallet.get_balance().unwrap();
    assert_eq!(balance.confirmed, 10_000);
    assert_eq!(balance.untrusted_pending, 0);
    let details = wallet.get_tx(&outpoint.txid, false).unwrap().unwrap();
    assert_eq!(details.confirmation_time.map(|t| t.height), Some(101));
}

#[test]
fn test_sync_respects_stop_gap() {
    let wallet = new_wallet();
    let blockchain = MockBlockchain::new(100);

    // index 4 is within the gap of the mock (5), index 20 is not
    let near = wallet.get_address(AddressIndex::Peek(4)).unwrap();
    let far = wallet.get_address(AddressIndex::Peek(20)).unwrap();
    blockchain.fund(&near.script_pubkey(), 10_000, Some(90));
    blockchain.fund(&far.script_pubkey(), 20_000, Some(90));

    wallet.sync(&blockchain, SyncOptions::default()).unwrap();
    assert_eq!(wallet.get_balance().unwrap().confirmed, 10_000);
    assert_eq!(
        wallet
            .database()
            .unwrap()
            .get_last_index(KeychainKind::External)
            .unwrap(),
        Some(4)
    );

    // revealing addresses up to the far one makes the next sync find it
    wallet.get_address(AddressIndex::Reset(20)).unwrap();
    wallet.sync(&blockchain, SyncOptions::default()).unwrap();
    assert_eq!(wallet.get_balance().unwrap().confirmed, 30_000);
}

#[test]
fn test_sync_progress() {
    let (wallet, blockchain) = get_funded_wallet(&[50_000]);
    let (sender, receiver) = progress();

    wallet
        .sync(
            &blockchain,
            SyncOptions {
                progress: Some(Box::new(sender)),
            },
        )
        .unwrap();

    let updates: Vec<f32> = receiver.try_iter().map(|(value, _)| value).collect();
    assert!(!updates.is_empty());
    assert!(updates.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(updates.last(), Some(&100.0));
}

#[test]
fn test_sync_in_progress() {
    let wallet = Arc::new(new_wallet());
    let blockchain = Arc::new(MockBlockchain::new(100));
    let (entered, release) = blockchain.pause_history_requests();

    let first = {
        let wallet = Arc::clone(&wallet);
        let blockchain = Arc::clone(&blockchain);
        thread::spawn(move || wallet.sync(&*blockchain, SyncOptions::default()).is_ok())
    };

    // the first sync is now blocked inside the scan
    entered.recv().unwrap();
    assert_matches!(
        wallet.sync(&*blockchain, SyncOptions::default()),
        Err(Error::SyncInProgress)
    );
    // reads still work and see the pre-sync state
    assert_eq!(wallet.get_balance().unwrap().total(), 0);

    release.send(()).unwrap();
    assert!(first.join().unwrap());

    // and once it's done another sync can start
    wallet.sync(&*blockchain, SyncOptions::default()).unwrap();
}

#[test]
fn test_concurrent_new_addresses_are_distinct() {
    let wallet = Arc::new(new_wallet());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let wallet = Arc::clone(&wallet);
            thread::spawn(move || {
                (0..10)
                    .map(|_| wallet.get_address(AddressIndex::New).unwrap().index)
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let indexes: Vec<u32> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    let unique: HashSet<u32> = indexes.iter().cloned().collect();

    assert_eq!(indexes.len(), 80);
    assert_eq!(unique.len(), 80);
    assert_eq!(unique, (0..80).collect());
}

#[test]
fn test_balance_partition() {
    let wallet = new_wallet();
    let blockchain = MockBlockchain::new(100);
    for (value, height) in [(10_000, Some(20)), (7_000, None), (3_000, Some(99))] {
        let address = wallet.get_address(AddressIndex::New).unwrap();
        blockchain.fund(&address.script_pubkey(), value, height);
    }
    wallet.sync(&blockchain, SyncOptions::default()).unwrap();

    let balance = wallet.get_balance().unwrap();
    assert_eq!(
        balance.immature + balance.trusted_pending + balance.untrusted_pending + balance.confirmed,
        balance.total()
    );
    assert_eq!(
        balance.trusted_pending + balance.confirmed,
        balance.spendable()
    );
    assert_eq!(balance.total(), 20_000);
    assert_eq!(balance.untrusted_pending, 7_000);
}

#[test]
fn test_drain_wallet_two_utxos() {
    let (wallet, _) = get_funded_wallet(&[5_000, 3_000]);
    let change = wallet
        .get_internal_address(AddressIndex::New)
        .unwrap()
        .script_pubkey();

    let mut builder = wallet.build_tx();
    builder
        .drain_wallet()
        .drain_to(change)
        .fee_rate(FeeRate::from_sat_per_vb(1.0));
    let (psbt, details) = builder.finish().unwrap();

    let fee = details.fee.unwrap();
    assert_eq!(psbt.unsigned_tx.input.len(), 2);
    assert_eq!(psbt.unsigned_tx.output.len(), 1);
    assert_eq!(psbt.unsigned_tx.output[0].value, 8_000 - fee);
    assert_eq!(details.sent, 8_000);
    assert_eq!(details.received, 8_000 - fee);

    let spent: HashSet<_> = psbt
        .unsigned_tx
        .input
        .iter()
        .map(|input| input.previous_output)
        .collect();
    let unspent: HashSet<_> = wallet
        .list_unspent()
        .unwrap()
        .into_iter()
        .map(|utxo| utxo.outpoint)
        .collect();
    assert_eq!(spent, unspent);
}

#[test]
fn test_must_spend_overrides_unspendable() {
    let (wallet, _) = get_funded_wallet(&[50_000, 30_000]);
    let utxos = wallet.list_unspent().unwrap();
    let small = utxos.iter().find(|u| u.txout.value == 30_000).unwrap();

    let mut builder = wallet.build_tx();
    builder
        .add_recipient(external_script(), 1_000)
        .add_utxo(small.outpoint)
        .unwrap()
        .add_unspendable(small.outpoint);
    let (psbt, _) = builder.finish().unwrap();

    assert!(psbt
        .unsigned_tx
        .input
        .iter()
        .any(|input| input.previous_output == small.outpoint));
}

#[test]
fn test_manually_selected_only_insufficient() {
    let (wallet, _) = get_funded_wallet(&[50_000, 3_000]);
    let small = wallet
        .list_unspent()
        .unwrap()
        .into_iter()
        .find(|u| u.txout.value == 3_000)
        .unwrap();

    let mut builder = wallet.build_tx();
    builder
        .add_recipient(external_script(), 10_000)
        .add_utxo(small.outpoint)
        .unwrap()
        .manually_selected_only();
    assert_matches!(builder.finish(), Err(Error::InsufficientFunds { .. }));
}

#[test]
fn test_rbf_sequence_bound() {
    let (wallet, _) = get_funded_wallet(&[50_000]);

    let mut builder = wallet.build_tx();
    builder
        .add_recipient(external_script(), 10_000)
        .enable_rbf_with_sequence(Sequence(0xFFFFFFFE));
    assert!(builder.finish().is_ok());

    let mut builder = wallet.build_tx();
    builder
        .add_recipient(external_script(), 10_000)
        .enable_rbf_with_sequence(Sequence(0xFFFFFFFF));
    assert_matches!(builder.finish(), Err(Error::InvalidSequence(_)));
}

#[test]
fn test_configuration_errors_come_first() {
    let wallet = new_wallet();
    let revealed = wallet
        .database()
        .unwrap()
        .get_last_index(KeychainKind::Internal)
        .unwrap();

    let mut builder = wallet.build_tx();
    builder
        .add_recipient(external_script(), 10_000)
        .fee_rate(FeeRate::from_sat_per_vb(2.0))
        .fee_absolute(500);
    assert_matches!(builder.finish(), Err(Error::ConflictingFeePolicy));

    // no change address was revealed
    assert_eq!(
        wallet
            .database()
            .unwrap()
            .get_last_index(KeychainKind::Internal)
            .unwrap(),
        revealed
    );
}

#[test]
fn test_no_recipients() {
    let (wallet, _) = get_funded_wallet(&[50_000]);
    assert_matches!(wallet.build_tx().finish(), Err(Error::NoRecipients));
}

#[test]
fn test_no_utxos_selected() {
    let (wallet, _) = get_funded_wallet(&[50_000]);
    let mut builder = wallet.build_tx();
    builder
        .add_recipient(external_script(), 10_000)
        .manually_selected_only();
    assert_matches!(builder.finish(), Err(Error::NoUtxosSelected));
}

#[test]
fn test_drain_to_needs_utxos() {
    let (wallet, _) = get_funded_wallet(&[50_000]);
    let mut builder = wallet.build_tx();
    builder.drain_to(external_script());
    assert_matches!(builder.finish(), Err(Error::NoUtxosSelected));
}

#[test]
fn test_insufficient_funds_keeps_change_index() {
    let (wallet, _) = get_funded_wallet(&[50_000]);
    let last_change = || {
        wallet
            .database()
            .unwrap()
            .get_last_index(KeychainKind::Internal)
            .unwrap()
    };
    let before = last_change();

    let mut builder = wallet.build_tx();
    builder.add_recipient(external_script(), 80_000);
    assert_matches!(builder.finish(), Err(Error::InsufficientFunds { .. }));
    assert_eq!(last_change(), before);
}

#[test]
fn test_unavailable_utxo() {
    let (wallet, _) = get_funded_wallet(&[50_000]);
    let mut outpoint = wallet.list_unspent().unwrap()[0].outpoint;
    outpoint.vout = 7;

    let mut builder = wallet.build_tx();
    assert_matches!(
        builder.add_utxo(outpoint),
        Err(Error::UnavailableUtxo(o)) if o == outpoint
    );
}

#[test]
fn test_spend_broadcast_and_resync() {
    init();

    let (wallet, blockchain) = get_funded_wallet(&[50_000]);

    let mut builder = wallet.build_tx();
    builder.add_recipient(external_script(), 20_000).enable_rbf();
    let (mut psbt, details) = builder.finish().unwrap();
    assert!(wallet.sign(&mut psbt, SignOptions::default()).unwrap());

    let tx = psbt.extract_tx();
    let txid = wallet.broadcast(&blockchain, &tx).unwrap();
    assert!(blockchain.contains(&txid));

    // the wallet knows about the spend before syncing
    let unspent = wallet.list_unspent().unwrap();
    assert_eq!(unspent.len(), 1);
    assert_eq!(unspent[0].outpoint.txid, txid);
    let recorded = wallet.get_tx(&txid, false).unwrap().unwrap();
    assert_eq!(recorded.sent, 50_000);
    assert_eq!(recorded.received, details.received);
    assert_eq!(recorded.fee, details.fee);

    let balance = wallet.get_balance().unwrap();
    assert_eq!(balance.trusted_pending, details.received);

    blockchain.confirm(&txid, 105);
    wallet.sync(&blockchain, SyncOptions::default()).unwrap();

    let unspent = wallet.list_unspent().unwrap();
    assert_eq!(unspent.len(), 1);
    assert_eq!(wallet.get_balance().unwrap().confirmed, details.received);
    assert_eq!(
        wallet
            .get_tx(&txid, false)
            .unwrap()
            .unwrap()
            .confirmation_time
            .map(|t| t.height),
        Some(105)
    );
}

#[test]
fn test_fee_bump_after_broadcast() {
    let (wallet, blockchain) = get_funded_wallet(&[50_000]);

    let mut builder = wallet.build_tx();
    builder.add_recipient(external_script(), 20_000).enable_rbf();
    let (mut psbt, details) = builder.finish().unwrap();
    assert!(wallet.sign(&mut psbt, SignOptions::default()).unwrap());
    let tx = psbt.extract_tx();
    wallet.broadcast(&blockchain, &tx).unwrap();

    let mut builder = wallet.build_fee_bump(tx.txid()).unwrap();
    builder.fee_rate(FeeRate::from_sat_per_vb(3.0));
    let (mut bumped, bumped_details) = builder.finish().unwrap();
    assert!(wallet.sign(&mut bumped, SignOptions::default()).unwrap());

    assert!(bumped_details.fee.unwrap() > details.fee.unwrap());
    assert_eq!(
        bumped.unsigned_tx.input[0].previous_output,
        tx.input[0].previous_output
    );
    assert!(bumped
        .unsigned_tx
        .output
        .iter()
        .any(|o| o.script_pubkey == external_script() && o.value == 20_000));
}

#[test]
fn test_cancel_broadcast_tx() {
    let (wallet, blockchain) = get_funded_wallet(&[50_000]);
    let before = wallet.list_unspent().unwrap();

    let mut builder = wallet.build_tx();
    builder.add_recipient(external_script(), 20_000);
    let (mut psbt, _) = builder.finish().unwrap();
    assert!(wallet.sign(&mut psbt, SignOptions::default()).unwrap());
    let tx = psbt.extract_tx();
    wallet.broadcast(&blockchain, &tx).unwrap();

    wallet.cancel_tx(&tx).unwrap();

    assert_eq!(wallet.list_unspent().unwrap(), before);
    assert!(wallet.get_tx(&tx.txid(), false).unwrap().is_none());
}
