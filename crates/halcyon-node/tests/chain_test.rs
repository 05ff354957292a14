//! End-to-end chain scenarios: connecting, fee policy, sibling forks,
//! fake-stake rejection, and the token overlay.


use tempfile::TempDir;

use halcyon_core::constants::{COIN, MIN_TX_FEE};
use halcyon_core::difficulty::check_proof_of_work;
use halcyon_core::error::TxValidationError;
use halcyon_core::hash::Hash256;
use halcyon_core::merkle::merkle_root;
use halcyon_core::params::{Network, NetworkFork, Params};
use halcyon_core::script::Script;
use halcyon_core::types::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};
use halcyon_node::chain::{BlockAction, ChainState};
use halcyon_node::config::NodeConfig;
use halcyon_node::error::NodeError;
use halcyon_node::fork_simulator::ViuError;
use halcyon_node::txdb::DbEnvironment;
use halcyon_tokens::script::{TokenScript, TransferInstruction};

// ----------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------

fn open_chain_with(params: Params) -> (TempDir, ChainState) {
    let dir = TempDir::new().unwrap();
    let env = DbEnvironment::open(dir.path()).unwrap();
    let chain = ChainState::open(env, params, NodeConfig::default()).unwrap();
    (dir, chain)
}

fn open_chain() -> (TempDir, ChainState) {
    open_chain_with(Params::new(Network::Testnet))
}

/// An anyone-can-spend output script.
fn trivial_script() -> Script {
    Script(vec![0x51])
}

/// A coinbase paying the full PoW subsidy plus `fees`, made unique by the
/// height baked into its script.
fn coinbase_for(height: i32, time: u32, fees: i64) -> Transaction {
    let mut script_sig = Script::new();
    script_sig.push_data(&(height as u32).to_le_bytes());
    Transaction {
        version: 1,
        time,
        vin: vec![TxIn { prevout: OutPoint::null(), script_sig, sequence: u32::MAX }],
        vout: vec![TxOut::new(2_000 * COIN + fees, trivial_script())],
        lock_time: 0,
    }
}

/// Assemble and mine a block on `parent` with the given extra
/// transactions; fees are routed into the coinbase.
fn build_block(chain: &ChainState, parent: &Hash256, txs: Vec<Transaction>, fees: i64) -> Block {
    let parent_index = chain.block_index(parent).expect("parent must be indexed");
    let height = parent_index.height + 1;
    let time = parent_index.time + 30;

    let mut vtx = vec![coinbase_for(height, time, fees)];
    vtx.extend(txs);
    let hashes: Vec<Hash256> = vtx.iter().map(Transaction::hash).collect();

    let mut block = Block {
        header: BlockHeader {
            version: 6,
            hash_prev_block: *parent,
            hash_merkle_root: merkle_root(&hashes),
            time,
            bits: chain.next_target_for(parent, false),
            nonce: 0,
        },
        vtx,
        signature: vec![],
    };
    while !check_proof_of_work(&block.hash(), block.header.bits) {
        block.header.nonce += 1;
    }
    block
}

/// Extend the best chain by `count` empty blocks; returns their coinbase
/// transactions in order.
fn extend_chain(chain: &mut ChainState, count: usize) -> Vec<Transaction> {
    let mut coinbases = Vec::new();
    for _ in 0..count {
        let tip = chain.best().hash;
        let block = build_block(chain, &tip, vec![], 0);
        coinbases.push(block.vtx[0].clone());
        assert_eq!(chain.process_block(&block).unwrap(), BlockAction::Accepted);
    }
    coinbases
}

/// Salt a block's coinbase script so siblings of canonical blocks get
/// distinct hashes, then recompute the merkle root and re-mine.
fn uniquify(block: &mut Block, salt: i64) {
    block.vtx[0].vin[0].script_sig.push_int(0x40 + salt);
    block.header.hash_merkle_root =
        merkle_root(&block.vtx.iter().map(Transaction::hash).collect::<Vec<_>>());
    block.header.nonce = 0;
    while !check_proof_of_work(&block.hash(), block.header.bits) {
        block.header.nonce += 1;
    }
}

/// A transaction spending one trivial-script output.
fn spend(funding: &Transaction, value_out: i64, time: u32) -> Transaction {
    Transaction {
        version: 1,
        time,
        vin: vec![TxIn::new(OutPoint::new(funding.hash(), 0))],
        vout: vec![TxOut::new(value_out, trivial_script())],
        lock_time: 0,
    }
}

// ----------------------------------------------------------------------
// Connecting blocks
// ----------------------------------------------------------------------

#[test]
fn extending_the_chain_moves_the_tip() {
    let (_dir, mut chain) = open_chain();
    let genesis = chain.best().hash;
    extend_chain(&mut chain, 3);

    let best = chain.best();
    assert_eq!(best.height, 3);
    assert_ne!(best.hash, genesis);

    // the parent chain is forward-linked
    let genesis_index = chain.block_index(&genesis).unwrap();
    assert!(!genesis_index.hash_next.is_zero());

    // the on-disk best hash matches memory
    assert_eq!(chain.txdb().read_best_chain_hash().unwrap(), Some(best.hash));
}

#[test]
fn connected_transactions_get_spend_records() {
    let (_dir, mut chain) = open_chain();
    let coinbases = extend_chain(&mut chain, 12);
    let funding = &coinbases[0]; // height 1, mature at 11 on testnet

    let tip = chain.best().hash;
    let tx = spend(funding, 2_000 * COIN - MIN_TX_FEE, chain.best().time + 30);
    let block = build_block(&chain, &tip, vec![tx.clone()], MIN_TX_FEE);
    chain.process_block(&block).unwrap();

    let txdb = chain.txdb();
    // the spender has a fresh record with one unspent slot
    let spender_index = txdb.read_tx_index(&tx.hash()).unwrap().unwrap();
    assert_eq!(spender_index.spent.len(), 1);
    assert!(!spender_index.is_output_spent(0));
    // the funding output is marked spent by this block
    let funding_index = txdb.read_tx_index(&funding.hash()).unwrap().unwrap();
    assert!(funding_index.is_output_spent(0));
    assert_eq!(funding_index.spent[0].block_hash, block.hash());
}

#[test]
fn immature_coinbase_spend_rejected_in_block() {
    let (_dir, mut chain) = open_chain();
    let coinbases = extend_chain(&mut chain, 3);
    // coinbase of height 3 is far from mature
    let young = coinbases.last().unwrap();

    let tip = chain.best().hash;
    let tx = spend(young, 2_000 * COIN - MIN_TX_FEE, chain.best().time + 30);
    let block = build_block(&chain, &tip, vec![tx], MIN_TX_FEE);

    let err = chain.process_block(&block).unwrap_err();
    assert!(
        matches!(
            err,
            NodeError::Block(halcyon_core::error::BlockValidationError::Tx {
                source: TxValidationError::PrematureSpend(_),
                ..
            })
        ),
        "got {err:?}"
    );
    // the block stays off the best chain
    assert_eq!(chain.best().height, 3);
}

#[test]
fn overpaying_coinbase_rejected() {
    let (_dir, mut chain) = open_chain();
    let tip = chain.best().hash;
    let mut block = build_block(&chain, &tip, vec![], 0);
    // pay more than the subsidy allows and re-mine
    block.vtx[0].vout[0].value = 3_000 * COIN;
    block.header.hash_merkle_root =
        merkle_root(&block.vtx.iter().map(Transaction::hash).collect::<Vec<_>>());
    block.header.nonce = 0;
    while !check_proof_of_work(&block.hash(), block.header.bits) {
        block.header.nonce += 1;
    }

    let err = chain.process_block(&block).unwrap_err();
    assert!(matches!(
        err,
        NodeError::Block(halcyon_core::error::BlockValidationError::CoinbaseRewardTooHigh { .. })
    ));
    assert_eq!(chain.best().height, 0);
}

// ----------------------------------------------------------------------
// Fee policy (mempool admission)
// ----------------------------------------------------------------------

#[test]
fn underpaying_fee_rejected_then_exact_fee_accepted() {
    let (_dir, mut chain) = open_chain();
    let coinbases = extend_chain(&mut chain, 12);
    let funding = &coinbases[0];
    let time = chain.best().time + 5;

    // one unit short of the relay floor
    let cheap = spend(funding, 2_000 * COIN - (MIN_TX_FEE - 1), time);
    match chain.accept_to_memory_pool(&cheap, false) {
        Err(TxValidationError::InsufficientFee { paid, required }) => {
            assert_eq!(paid, MIN_TX_FEE - 1);
            assert_eq!(required, MIN_TX_FEE);
        }
        other => panic!("expected fee rejection, got {other:?}"),
    }

    // exactly the floor passes
    let paying = spend(funding, 2_000 * COIN - MIN_TX_FEE, time);
    chain.accept_to_memory_pool(&paying, false).unwrap();
    assert!(chain.mempool.exists(&paying.hash()));

    // and a conflicting respend of the same output is refused
    let conflict = spend(funding, 2_000 * COIN - 2 * MIN_TX_FEE, time);
    assert_eq!(
        chain.accept_to_memory_pool(&conflict, false),
        Err(TxValidationError::Conflict)
    );
}

#[test]
fn unknown_inputs_are_orphan_candidates() {
    let (_dir, mut chain) = open_chain();
    extend_chain(&mut chain, 2);
    let mut phantom = Transaction::default();
    phantom.time = chain.best().time;
    phantom.vin.push(TxIn::new(OutPoint::new(Hash256([0x77; 32]), 0)));
    phantom.vout.push(TxOut::new(1_000, trivial_script()));

    assert_eq!(
        chain.accept_to_memory_pool(&phantom, false),
        Err(TxValidationError::MissingInputs)
    );
}

#[test]
fn loose_coinbase_rejected() {
    let (_dir, mut chain) = open_chain();
    let coinbase = coinbase_for(1, chain.best().time, 0);
    assert_eq!(
        chain.accept_to_memory_pool(&coinbase, false),
        Err(TxValidationError::CoinbaseAsLooseTx)
    );
}

// ----------------------------------------------------------------------
// Forks and reorganization
// ----------------------------------------------------------------------

#[test]
fn smaller_trust_sibling_is_ignored() {
    let (_dir, mut chain) = open_chain();
    extend_chain(&mut chain, 4);
    let best_before = chain.best();

    // a sibling of the tip: same parent, same height, equal trust at
    // best, never more
    let parent = chain
        .block_index(&best_before.hash)
        .unwrap()
        .hash_prev;
    let mut sibling = build_block(&chain, &parent, vec![], 0);
    // a distinct coinbase makes this a true sibling of the canonical block
    uniquify(&mut sibling, 1);

    assert_eq!(chain.process_block(&sibling).unwrap(), BlockAction::Accepted);
    // indexed, but the best chain did not move
    assert!(chain.block_index(&sibling.hash()).is_some());
    assert_eq!(chain.best().hash, best_before.hash);
    assert_eq!(chain.best().height, best_before.height);
}

#[test]
fn higher_trust_fork_reorganizes() {
    let (_dir, mut chain) = open_chain();
    extend_chain(&mut chain, 3);
    let main_tip = chain.best().hash;
    let ancestor = chain.block_index(&main_tip).unwrap().hash_prev;

    // a competing branch from one block back, two blocks long
    let mut fork_a = build_block(&chain, &ancestor, vec![], 0);
    uniquify(&mut fork_a, 2);
    chain.process_block(&fork_a).unwrap();
    assert_eq!(chain.best().hash, main_tip, "equal trust must not reorganize");

    let fork_b = build_block(&chain, &fork_a.hash(), vec![], 0);
    chain.process_block(&fork_b).unwrap();

    assert_eq!(chain.best().hash, fork_b.hash());
    assert_eq!(chain.best().height, 4);
    assert_eq!(
        chain.txdb().read_best_chain_hash().unwrap(),
        Some(fork_b.hash())
    );
}

#[test]
fn fake_stake_double_spend_fork_is_rejected() {
    let (_dir, mut chain) = open_chain();
    // heights 1..=14; funding is the coinbase of height 1
    let coinbases = extend_chain(&mut chain, 14);
    let funding = &coinbases[0];

    // height 15: the funding output is spent on the main chain
    let tip = chain.best().hash;
    let spend_main = spend(funding, 2_000 * COIN - MIN_TX_FEE, chain.best().time + 30);
    let block_15 = build_block(&chain, &tip, vec![spend_main], MIN_TX_FEE);
    chain.process_block(&block_15).unwrap();

    // heights 16..=19 empty
    extend_chain(&mut chain, 4);
    let best_before = chain.best();
    let disk_best_before = chain.txdb().read_best_chain_hash().unwrap();

    // fork branches at height 16, above the spender at 15
    let fork_point = chain.main_chain_hash_at(16).unwrap();
    let mut fork_tip = fork_point;
    for salt in 0..3i64 {
        let mut block = build_block(&chain, &fork_tip, vec![], 0);
        uniquify(&mut block, 7 + salt);
        // trust stays at or below the main chain: stored silently
        chain.process_block(&block).unwrap();
        fork_tip = block.hash();
    }

    // the overtaking fork block re-spends the long-spent funding output
    let double_spend = spend(funding, 2_000 * COIN - MIN_TX_FEE, chain.best().time + 30);
    let attack = build_block(&chain, &fork_tip, vec![double_spend], MIN_TX_FEE);
    let err = chain.process_block(&attack).unwrap_err();

    assert!(
        matches!(
            err,
            NodeError::Viu(ViuError::DoublespendAttemptSpentAlreadyBeforeTheFork)
        ),
        "got {err:?}"
    );

    // reorganization was fully atomic: neither memory nor disk moved
    assert_eq!(chain.best().hash, best_before.hash);
    assert_eq!(chain.best().height, best_before.height);
    assert_eq!(chain.txdb().read_best_chain_hash().unwrap(), disk_best_before);
}

// ----------------------------------------------------------------------
// Token overlay
// ----------------------------------------------------------------------

fn token_params() -> Params {
    Params::new(Network::Testnet)
        .with_fork_height(NetworkFork::Tachyon, 0)
        .with_token_activation(0)
}

/// An issuance of `symbol` funded by `funding`'s first output.
fn issuance_tx(funding: &Transaction, symbol: &str, time: u32) -> Transaction {
    let marker = TokenScript::Issuance {
        symbol: symbol.to_string(),
        amount: 1_000,
        locked: true,
        instructions: vec![TransferInstruction { output_index: 0, amount: 1_000 }],
    };
    Transaction {
        version: 1,
        time,
        vin: vec![TxIn::new(OutPoint::new(funding.hash(), 0))],
        vout: vec![
            TxOut::new(2_000 * COIN - MIN_TX_FEE, trivial_script()),
            TxOut::new(0, marker.to_script()),
        ],
        lock_time: 0,
    }
}

#[test]
fn issuance_symbol_unique_in_mempool_and_chain() {
    let (_dir, mut chain) = open_chain_with(token_params());
    // with the symbol fork active the full 120-block maturity applies
    let coinbases = extend_chain(&mut chain, 125);
    let time = chain.best().time + 5;

    let first = issuance_tx(&coinbases[0], "ABCDE", time);
    chain.accept_to_memory_pool(&first, false).unwrap();
    assert!(chain.mempool.is_issuance_symbol_in_mempool("abcde"));

    // a second in-flight issuance differing only by case is refused
    let second = issuance_tx(&coinbases[1], "abcde", time);
    assert!(matches!(
        chain.accept_to_memory_pool(&second, false),
        Err(TxValidationError::Token(_))
    ));

    // connect the first issuance
    let tip = chain.best().hash;
    let block = build_block(&chain, &tip, vec![first.clone()], MIN_TX_FEE);
    chain.process_block(&block).unwrap();
    assert!(!chain.mempool.exists(&first.hash()));

    // the symbol index persisted under its lowercased form
    let txdb = chain.txdb();
    assert_eq!(
        txdb.read_token_txs_with_symbol("AbCdE").unwrap(),
        vec![first.hash()]
    );
    let stored = txdb.read_token_tx(&first.hash()).unwrap().unwrap();
    assert_eq!(stored.symbol_if_issuance(), Some("ABCDE"));
    assert_eq!(stored.tokens_of_output(0)[0].amount, 1_000);

    // with the symbol on the main chain, reissuing is refused for good
    let third = issuance_tx(&coinbases[2], "Abcde", chain.best().time + 5);
    assert!(matches!(
        chain.accept_to_memory_pool(&third, false),
        Err(TxValidationError::Token(_))
    ));
}

#[test]
fn two_issuances_of_same_symbol_in_one_block_rejected() {
    let (_dir, mut chain) = open_chain_with(token_params());
    let coinbases = extend_chain(&mut chain, 125);
    let height_before = chain.best().height;
    let time = chain.best().time + 30;

    let first = issuance_tx(&coinbases[0], "ABCDE", time);
    let second = issuance_tx(&coinbases[1], "abcde", time);
    let tip = chain.best().hash;
    let block = build_block(&chain, &tip, vec![first, second], 2 * MIN_TX_FEE);

    let err = chain.process_block(&block).unwrap_err();
    assert!(matches!(err, NodeError::Tx(TxValidationError::Token(_))), "got {err:?}");
    assert_eq!(chain.best().height, height_before);
}

#[test]
fn token_transfer_follows_issuance() {
    let (_dir, mut chain) = open_chain_with(token_params());
    let coinbases = extend_chain(&mut chain, 125);
    let time = chain.best().time + 30;

    let issuance = issuance_tx(&coinbases[0], "MOVE", time);
    let tip = chain.best().hash;
    let block = build_block(&chain, &tip, vec![issuance.clone()], MIN_TX_FEE);
    chain.process_block(&block).unwrap();

    // transfer the issued tokens onward
    let marker = TokenScript::Transfer {
        instructions: vec![TransferInstruction { output_index: 0, amount: 400 }],
    };
    let transfer = Transaction {
        version: 1,
        time: chain.best().time + 30,
        vin: vec![TxIn::new(OutPoint::new(issuance.hash(), 0))],
        vout: vec![
            TxOut::new(COIN, trivial_script()),
            TxOut::new(2_000 * COIN - 2 * MIN_TX_FEE - COIN, trivial_script()),
            TxOut::new(0, marker.to_script()),
        ],
        lock_time: 0,
    };
    let tip = chain.best().hash;
    let block = build_block(&chain, &tip, vec![transfer.clone()], MIN_TX_FEE);
    chain.process_block(&block).unwrap();

    let stored = chain.txdb().read_token_tx(&transfer.hash()).unwrap().unwrap();
    assert_eq!(stored.tokens_of_output(0)[0].amount, 400);
    // the remainder flowed to the change output
    assert_eq!(stored.tokens_of_output(1)[0].amount, 600);
}
