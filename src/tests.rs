// Cross-module scenarios: whole-torrent state transitions driven through
// the dispatcher, and live two-session transfers over in-memory streams.

use std::sync::Arc;
use std::time::Duration;

use crate::{
    block::BlockInfo,
    config::Config,
    disk::{DiskCommand, DiskTx},
    ext::{self, ExtendedHandshake},
    p2p::{
        message::Message,
        peer::{ConnInfo, CryptoInfo, Network, PeerSource},
        reader, PeerId,
    },
    picker::Priority,
    torrent::{Callbacks, PieceTable, TorrentContext, TorrentParams},
};

pub(crate) mod util {
    use super::*;
    use hex_literal::hex;
    use tokio::sync::mpsc;

    pub(crate) const BLOCK: usize = crate::BLOCK_SIZE;

    pub(crate) const INFO_HASH: [u8; 20] = hex!("2f2d3c4b5a69788796a5b4c3d2e1f00112233445");

    // For chasing a failing session test with RUST_LOG-style output.
    #[allow(dead_code)]
    pub(crate) fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .try_init();
    }

    pub(crate) fn conn(addr: &str, fast: bool, extended: bool) -> ConnInfo {
        ConnInfo {
            remote_addr: addr.parse().unwrap(),
            network: Network::Tcp,
            outgoing: true,
            source: PeerSource::Tracker,
            trusted: false,
            crypto: CryptoInfo::default(),
            remote_id: *b"-XX0100-000000000000",
            fast,
            extended,
        }
    }

    // A context with a throwaway disk channel, for tests that never leave
    // the state machine.
    pub(crate) fn test_ctx(info: Option<PieceTable>) -> Arc<TorrentContext> {
        let (disk_tx, disk_rx) = mpsc::unbounded_channel();
        // Keep the channel open without a task behind it.
        std::mem::forget(disk_rx);
        ctx_with_disk(info, disk_tx)
    }

    pub(crate) fn ctx_with_disk(
        info: Option<PieceTable>,
        disk_tx: DiskTx,
    ) -> Arc<TorrentContext> {
        TorrentContext::new(TorrentParams {
            info_hash: INFO_HASH,
            client_id: *b"-PW0100-000000000000",
            config: Config::default(),
            disk_tx,
            info,
            info_bytes: None,
            up_limiter: None,
            down_limiter: None,
            callbacks: Callbacks::default(),
        })
    }

    // Two-block pieces throughout.
    pub(crate) fn ctx_with_pieces(num_pieces: usize) -> Arc<TorrentContext> {
        test_ctx(Some(PieceTable::new(
            (num_pieces * 2 * BLOCK) as u64,
            2 * BLOCK,
        )))
    }

    // Registers a connection and marks the peer as having every piece.
    pub(crate) fn add_seed_peer(ctx: &Arc<TorrentContext>, addr: &str, fast: bool) -> PeerId {
        let id = ctx.insert_peer(conn(addr, fast, false));
        let mut state = ctx.state();
        let num_pieces = state.num_pieces();
        state.peer_mut(id).unwrap().bitfield.fill(true);
        for piece_idx in 0..num_pieces {
            state.availability[piece_idx] += 1;
        }
        state.peer_pieces_changed(id);
        id
    }

    pub(crate) fn fixture(num_pieces: usize, fast: bool) -> (Arc<TorrentContext>, PeerId) {
        let ctx = ctx_with_pieces(num_pieces);
        let id = add_seed_peer(&ctx, "10.0.0.1:6881", fast);
        (ctx, id)
    }

    pub(crate) fn two_peer_fixture(
        num_pieces: usize,
    ) -> (Arc<TorrentContext>, PeerId, PeerId) {
        let ctx = ctx_with_pieces(num_pieces);
        let a = add_seed_peer(&ctx, "10.0.0.1:6881", true);
        let b = add_seed_peer(&ctx, "10.0.0.2:6881", true);
        (ctx, a, b)
    }

    // In-memory storage behind the disk channel: reads yield patterned
    // bytes, writes succeed, hash checks pass. Replies to CheckPiece go
    // through the context's hash hook like the real disk task would.
    pub(crate) fn spawn_fake_disk(hashes_ok: bool) -> (DiskTx, tokio::sync::oneshot::Sender<Arc<TorrentContext>>) {
        let (disk_tx, mut disk_rx) = mpsc::unbounded_channel();
        let (ctx_tx, ctx_rx) = tokio::sync::oneshot::channel::<Arc<TorrentContext>>();

        tokio::spawn(async move {
            let ctx = match ctx_rx.await {
                Ok(ctx) => ctx,
                Err(_) => return,
            };
            while let Some(cmd) = disk_rx.recv().await {
                match cmd {
                    DiskCommand::ReadBlock { block, tx } => {
                        tx.send(Ok(vec![block.piece_idx as u8; block.len])).ok();
                    }
                    DiskCommand::WriteBlock { block, tx } => {
                        tx.send((block.data, Ok(()))).ok();
                    }
                    DiskCommand::CheckPiece { piece_idx } => {
                        ctx.piece_hashed(piece_idx, hashes_ok);
                    }
                }
            }
        });

        (disk_tx, ctx_tx)
    }
}

use util::*;

// A hash failure unpends every chunk of the piece, clears its dirtier set,
// and leaves the piece eligible for re-download.
#[test]
fn test_piece_hash_failure_resets_chunks() {
    let (ctx, id) = fixture(4, true);
    let mut state = ctx.state();
    state.peer_mut(id).unwrap().peer_choking = false;
    state.peer_mut(id).unwrap().max_blocks_received_between_updates = 8;

    {
        let partial = state.partial_mut(1);
        partial.dirty.fill(true);
        partial.dirtiers.insert(id);
    }
    state.peer_mut(id).unwrap().touched_pieces.insert(1);

    state.piece_hashed(1, false);

    let partial = state.partials.get(&1).unwrap();
    assert!(partial.dirty.not_any());
    assert!(partial.dirtiers.is_empty());
    let peer = state.peer(id).unwrap();
    assert!(!peer.touched_pieces.contains(&1));
    assert_eq!(peer.stats.pieces_dirtied_bad, 1);

    // Re-eligible: the rebuilt request set reaches into piece 1 again.
    assert!(state
        .peer(id)
        .unwrap()
        .next_requests
        .iter()
        .any(|r| r.piece_idx == 1));
}

// Learning metadata_size from an extension handshake sizes the assembly
// buffer but completes nothing.
#[test]
fn test_metadata_size_observed_but_incomplete() {
    let ctx = test_ctx(None);
    let id = ctx.insert_peer(conn("10.0.0.1:6881", true, true));

    let mut m = std::collections::BTreeMap::new();
    m.insert(ext::METADATA_NAME.to_string(), 3i64);
    let handshake = ExtendedHandshake {
        m: Some(m),
        metadata_size: Some(2 * 0x4000 + 100),
        ..Default::default()
    };

    let mut state = ctx.state();
    reader::dispatch(
        &ctx,
        &mut state,
        id,
        Message::Extended { id: ext::HANDSHAKE_ID, payload: handshake.to_bytes() },
    )
    .unwrap();

    assert!(!state.have_all_metadata_pieces());
    assert!(!state.metadata_complete());
    assert_eq!(state.metadata_bytes().len(), 2 * 0x4000 + 100);
    assert!(state.metadata_bytes().iter().all(|&b| b == 0));

    // All three missing pieces were asked for, addressed with the peer's id.
    let peer = state.peer(id).unwrap();
    let requests = peer
        .out_queue
        .iter()
        .filter(|m| matches!(m, Message::Extended { id: 3, .. }))
        .count();
    assert_eq!(requests, 3);
    assert_eq!(peer.metadata_requests.count_ones(), 3);
}

// Choke with fast enabled preserves the in-flight set; each explicit
// Reject then shrinks it by one.
#[test]
fn test_choke_under_fast_keeps_requests() {
    let (ctx, id) = fixture(4, true);
    let mut state = ctx.state();
    state.peer_mut(id).unwrap().peer_choking = false;
    state.peer_mut(id).unwrap().max_blocks_received_between_updates = 4;

    let a = BlockInfo { piece_idx: 1, offset: 0, len: BLOCK };
    let b = BlockInfo { piece_idx: 1, offset: BLOCK, len: BLOCK };
    assert!(state.request(id, a));
    assert!(state.request(id, b));

    reader::dispatch(&ctx, &mut state, id, Message::Choke).unwrap();
    assert_eq!(state.peer(id).unwrap().requests_out.len(), 2);
    assert_eq!(state.pending_requests.len(), 2);

    reader::dispatch(&ctx, &mut state, id, Message::Reject(a)).unwrap();
    assert_eq!(state.peer(id).unwrap().requests_out.len(), 1);
    assert!(state.peer(id).unwrap().requests_out.contains(&b));
    assert_eq!(state.pending_requests.len(), 1);
}

// Without fast, a choke wipes the in-flight set wholesale.
#[test]
fn test_choke_without_fast_drops_requests() {
    let (ctx, id) = fixture(4, false);
    let mut state = ctx.state();
    state.peer_mut(id).unwrap().peer_choking = false;
    state.peer_mut(id).unwrap().max_blocks_received_between_updates = 4;

    let a = BlockInfo { piece_idx: 1, offset: 0, len: BLOCK };
    assert!(state.request(id, a));

    reader::dispatch(&ctx, &mut state, id, Message::Choke).unwrap();
    assert!(state.peer(id).unwrap().requests_out.is_empty());
    assert!(state.pending_requests.is_empty());
}

// Availability mirrors per-peer piece sets across every transition form,
// and a close subtracts a peer's contribution exactly once.
#[test]
fn test_availability_tracks_transitions() {
    let ctx = ctx_with_pieces(8);
    let a = ctx.insert_peer(conn("10.0.0.1:6881", true, false));
    let b = ctx.insert_peer(conn("10.0.0.2:6881", true, false));
    let mut state = ctx.state();

    reader::dispatch(&ctx, &mut state, a, Message::HaveAll).unwrap();
    assert!(state.availability.iter().all(|&c| c == 1));

    reader::dispatch(&ctx, &mut state, b, Message::Have { idx: 3 }).unwrap();
    assert_eq!(state.availability(3), 2);
    assert_eq!(state.availability(4), 1);

    reader::dispatch(&ctx, &mut state, b, Message::HaveNone).unwrap();
    assert_eq!(state.availability(3), 1);

    // Closing twice must subtract once.
    state.close_peer_inner(a);
    assert!(state.availability.iter().all(|&c| c == 0));
    assert!(!state.close_peer_inner(a));
    assert!(state.availability.iter().all(|&c| c == 0));
}

// A bitfield and the equivalent run of Have messages land in the same
// state.
#[test]
fn test_bitfield_equals_haves() {
    let ctx_a = ctx_with_pieces(16);
    let ctx_b = ctx_with_pieces(16);
    let a = ctx_a.insert_peer(conn("10.0.0.1:6881", true, false));
    let b = ctx_b.insert_peer(conn("10.0.0.1:6881", true, false));

    let mut bits = crate::Bitfield::new();
    bits.resize(16, false);
    for piece_idx in [0, 3, 7, 11, 15] {
        bits.set(piece_idx, true);
    }

    let mut state_a = ctx_a.state();
    reader::dispatch(&ctx_a, &mut state_a, a, Message::Bitfield(bits.clone())).unwrap();

    let mut state_b = ctx_b.state();
    for piece_idx in [0usize, 3, 7, 11, 15] {
        reader::dispatch(&ctx_b, &mut state_b, b, Message::Have { idx: piece_idx as u32 })
            .unwrap();
    }

    assert_eq!(state_a.peer(a).unwrap().bitfield, state_b.peer(b).unwrap().bitfield);
    assert_eq!(state_a.availability, state_b.availability);
    assert_eq!(
        state_a.peer(a).unwrap().piece_order.len(),
        state_b.peer(b).unwrap().piece_order.len(),
    );
}

// Pre-info messages must not trip index validation; the implied piece
// count floor tracks the highest thing seen.
#[test]
fn test_pre_info_messages_raise_min_pieces() {
    let ctx = test_ctx(None);
    let id = ctx.insert_peer(conn("10.0.0.1:6881", true, false));
    let mut state = ctx.state();

    reader::dispatch(&ctx, &mut state, id, Message::Have { idx: 500 }).unwrap();
    assert_eq!(state.peer(id).unwrap().peer_min_pieces, 501);
    assert!(state.peer(id).unwrap().peer_has(500));

    let mut bits = crate::Bitfield::new();
    bits.resize(600, false);
    bits.set(599, true);
    reader::dispatch(&ctx, &mut state, id, Message::Bitfield(bits)).unwrap();
    assert_eq!(state.peer(id).unwrap().peer_min_pieces, 600);
}

// Fast-extension traffic on a connection that never negotiated it is
// fatal.
#[test]
fn test_fast_message_without_fast_is_fatal() {
    let ctx = ctx_with_pieces(4);
    let id = ctx.insert_peer(conn("10.0.0.1:6881", false, false));
    let mut state = ctx.state();

    let result = reader::dispatch(&ctx, &mut state, id, Message::HaveAll);
    assert!(matches!(result, Err(crate::p2p::PeerError::FastDisabled)));
}

// An oversized or undersized bitfield against known info is fatal.
#[test]
fn test_short_bitfield_is_fatal() {
    let ctx = ctx_with_pieces(16);
    let id = ctx.insert_peer(conn("10.0.0.1:6881", true, false));
    let mut state = ctx.state();

    let mut bits = crate::Bitfield::new();
    bits.resize(8, true);
    let result = reader::dispatch(&ctx, &mut state, id, Message::Bitfield(bits));
    assert!(matches!(
        result,
        Err(crate::p2p::PeerError::BadBitfieldLength { .. }),
    ));
}

// Zero-length torrents are born complete.
#[test]
fn test_zero_length_torrent_is_complete() {
    for piece_len in [0usize, 262_144] {
        let ctx = test_ctx(Some(PieceTable::new(0, piece_len)));
        let state = ctx.state();
        assert!(state.is_complete());
        assert_eq!(state.left(), 0);
        assert_eq!(state.num_pieces(), 0);
    }
}

// Full recompute across a large torrent: every peer's order is rebuilt in
// one pass and identical inclinations yield identical orders.
#[test]
fn test_update_all_piece_priorities_deterministic() {
    let num_pieces = 13_410;
    let ctx = test_ctx(Some(PieceTable::new(
        num_pieces as u64 * 262_144,
        262_144,
    )));

    let ids: Vec<PeerId> = (0..7)
        .map(|i| add_seed_peer(&ctx, &format!("10.0.0.{}:6881", i + 1), true))
        .collect();

    let mut state = ctx.state();
    for piece_idx in (0..num_pieces).step_by(3) {
        state.completed.set(piece_idx, true);
    }
    // Readahead window ahead of a playback position.
    for piece_idx in 1_000..1_128 {
        state.priorities[piece_idx] = Priority::Readahead;
    }

    // Pin two peers to one inclination so their orders must agree.
    let shared: Vec<u32> = (0..num_pieces as u32).rev().collect();
    state
        .peer_mut(ids[0])
        .unwrap()
        .piece_order
        .assign_inclination(shared.clone());
    state
        .peer_mut(ids[1])
        .unwrap()
        .piece_order
        .assign_inclination(shared);

    state.update_all_piece_priorities();

    let wanted = num_pieces - (num_pieces + 2) / 3;
    for &id in &ids {
        assert_eq!(state.peer(id).unwrap().piece_order.len(), wanted);
    }

    let order_a: Vec<usize> = state.peer(ids[0]).unwrap().piece_order.iter().collect();
    let order_b: Vec<usize> = state.peer(ids[1]).unwrap().piece_order.iter().collect();
    assert_eq!(order_a, order_b);

    // The readahead band sorts ahead of everything normal.
    let readahead_count = (1_000..1_128).filter(|i| i % 3 != 0).count();
    assert!(order_a[..readahead_count]
        .iter()
        .all(|&i| (1_000..1_128).contains(&i)));

    // Recompute is idempotent.
    state.update_all_piece_priorities();
    let order_a2: Vec<usize> = state.peer(ids[0]).unwrap().piece_order.iter().collect();
    assert_eq!(order_a, order_a2);
}

// Two peers race for the same block; the first delivery cancels the
// other's in-flight request and fully drains the shared refcount.
#[tokio::test]
async fn test_cross_peer_cancel_on_receive() {
    let (disk_tx, ctx_tx) = spawn_fake_disk(true);
    let ctx = ctx_with_disk(
        Some(PieceTable::new(4 * 2 * BLOCK as u64, 2 * BLOCK)),
        disk_tx,
    );
    ctx_tx.send(Arc::clone(&ctx)).ok();

    let a = add_seed_peer(&ctx, "10.0.0.1:6881", true);
    let b = add_seed_peer(&ctx, "10.0.0.2:6881", true);
    let r = BlockInfo { piece_idx: 2, offset: 0, len: BLOCK };

    {
        let mut state = ctx.state();
        for id in [a, b] {
            state.peer_mut(id).unwrap().peer_choking = false;
            state.peer_mut(id).unwrap().max_blocks_received_between_updates = 4;
        }
        assert!(state.request(a, r));
        assert!(state.request(b, r));
        state.peer_mut(b).unwrap().out_queue.clear();
        assert_eq!(state.pending_requests.get(&r), Some(&2));
    }

    let data = crate::block::BlockData {
        piece_idx: r.piece_idx,
        offset: r.offset,
        data: vec![0xcd; r.len],
    };
    reader::receive_block(&ctx, a, data).await.unwrap();

    let state = ctx.state();
    assert!(!state.peer(a).unwrap().requests_out.contains(&r));
    assert!(!state.peer(b).unwrap().requests_out.contains(&r));
    assert_eq!(state.pending_requests.get(&r), None);
    assert!(state
        .peer(b)
        .unwrap()
        .out_queue
        .iter()
        .any(|m| matches!(m, Message::Cancel(cancelled) if *cancelled == r)));
    // B's allowance survives: a late duplicate must count as wasted, not
    // unexpected.
    assert_eq!(state.peer(b).unwrap().valid_receive.get(&r), Some(&1));
    assert!(state.have_block(&r));
}

// A delivery with no allowance at all is a protocol violation.
#[tokio::test]
async fn test_unexpected_block_fails_connection() {
    let (ctx, id) = fixture(4, true);
    let data = crate::block::BlockData {
        piece_idx: 1,
        offset: 0,
        data: vec![0; BLOCK],
    };
    let result = reader::receive_block(&ctx, id, data).await;
    assert!(matches!(
        result,
        Err(crate::p2p::PeerError::UnexpectedChunk(_)),
    ));
}

// Full transfer between two live sessions over an in-memory stream: a
// complete side seeds, an empty side downloads, piece by piece, until the
// leech is complete and the now-pointless link is dropped.
#[tokio::test]
async fn test_end_to_end_transfer() {
    let num_pieces = 4usize;
    let table = PieceTable::new(num_pieces as u64 * 2 * BLOCK as u64, 2 * BLOCK);

    // Seed side.
    let (seed_disk, seed_ctx_tx) = spawn_fake_disk(true);
    let seed = ctx_with_disk(Some(table), seed_disk);
    seed_ctx_tx.send(Arc::clone(&seed)).ok();
    seed.state().completed.fill(true);

    // Leech side.
    let (leech_disk, leech_ctx_tx) = spawn_fake_disk(true);
    let leech = ctx_with_disk(Some(table), leech_disk);
    leech_ctx_tx.send(Arc::clone(&leech)).ok();

    let (seed_stream, leech_stream) = tokio::io::duplex(256 * 1024);
    let seed_handle = crate::p2p::session::PeerSession::spawn(
        Arc::clone(&seed),
        conn("10.0.0.2:6881", true, false),
        seed_stream,
    );
    let _leech_handle = crate::p2p::session::PeerSession::spawn(
        Arc::clone(&leech),
        conn("10.0.0.1:6881", true, false),
        leech_stream,
    );

    // Serve whoever asks; choking policy is the owner's job.
    seed.state().unchoke(seed_handle.id);

    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if leech.state().is_complete() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("transfer did not complete");

    let state = leech.state();
    assert!(state.is_complete());
    assert_eq!(state.pending_requests.len(), 0);
}
