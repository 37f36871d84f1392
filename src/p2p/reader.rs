use std::{sync::Arc, time::Instant};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::codec::Framed;
use crate::{
    block::{BlockData, BlockInfo},
    disk::DiskCommand,
    ext::{
        self,
        metadata::MetadataMsg,
        pex::PexMessage,
        ExtendedHandshake,
    },
    torrent::{TorrentContext, TorrentState},
};
use super::{
    message::{Message, MessageCodec},
    PeerError, PeerId, Result,
};

// Client-id prefixes known to ship broken extension handshakes; for these
// a decode failure is tolerated instead of failing the connection.
const BUGGY_EXTENSION_CLIENTS: [&[u8; 3]; 2] = [b"-SD", b"-XL"];

type MessageStream<S> = futures::stream::SplitStream<Framed<S, MessageCodec>>;

// The read half of a connection: one message at a time, decoded with the
// lock released, dispatched with it held. Returns on EOF, shutdown, or a
// fatal protocol error.
pub(crate) async fn run<S>(
    ctx: Arc<TorrentContext>,
    id: PeerId,
    mut stream: MessageStream<S>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let shutdown = match ctx.state().peer(id) {
        Ok(peer) => Arc::clone(&peer.shutdown),
        Err(_) => return Ok(()),
    };

    loop {
        let msg = tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(e),
                // Clean EOF from the remote.
                None => return Ok(()),
            },
            _ = shutdown.notified() => return Ok(()),
            _ = tokio::time::sleep(ctx.config.inbound_timeout) => {
                return Err(PeerError::Timeout);
            }
        };

        handle_message(&ctx, id, msg).await?;
    }
}

pub(crate) async fn handle_message(ctx: &Arc<TorrentContext>, id: PeerId, msg: Message) -> Result<()> {
    tracing::trace!(peer = %id, "read: {}", msg);
    match msg {
        // Block receipt suspends for the storage write, so it owns its
        // own locking discipline.
        Message::Block(data) => receive_block(ctx, id, data).await,
        msg => {
            let mut state = ctx.state();
            dispatch(ctx, &mut state, id, msg)
        }
    }
}

// Per-message state effects. Runs under the torrent lock.
pub(crate) fn dispatch(
    ctx: &Arc<TorrentContext>,
    state: &mut TorrentState,
    id: PeerId,
    msg: Message,
) -> Result<()> {
    let now = Instant::now();
    {
        let peer = match state.peers.get_mut(&id) {
            Some(peer) if !peer.closed => peer,
            _ => return Err(PeerError::Closed),
        };
        peer.last_message_received = now;
        if msg.is_fast() && !peer.conn.fast {
            return Err(PeerError::FastDisabled);
        }
        if matches!(msg, Message::Extended { .. }) && !peer.conn.extended {
            return Err(PeerError::ExtendedDisabled);
        }
    }
    if let Some(cb) = &state.callbacks.read_message {
        cb(&msg);
    }

    match msg {

        Message::KeepAlive => {}

        Message::Choke => {
            let fast = {
                let peer = state.peers.get_mut(&id).unwrap();
                peer.peer_choking = true;
                peer.conn.fast
            };
            // Without fast semantics a choke silently drops everything in
            // flight; with them the peer owes us an explicit Reject each.
            if !fast {
                state.delete_all_requests(id);
            }
            let peer = state.peers.get_mut(&id).unwrap();
            peer.update_expecting(now);
            state.update_requests(id);
        }

        Message::Unchoke => {
            let peer = state.peers.get_mut(&id).unwrap();
            peer.peer_choking = false;
            peer.update_expecting(now);
            state.update_requests(id);
        }

        Message::Interested => {
            let peer = state.peers.get_mut(&id).unwrap();
            peer.peer_interested = true;
            peer.write_notify.notify_one();
        }

        Message::NotInterested => {
            // Queued uploads survive this on purpose; chokes are the only
            // thing that clears them.
            let peer = state.peers.get_mut(&id).unwrap();
            peer.peer_interested = false;
            peer.write_notify.notify_one();
        }

        Message::Have { idx } => {
            let piece_idx = idx as usize;
            if state.have_info() && piece_idx >= state.num_pieces() {
                return Err(PeerError::InvalidPieceIndex(piece_idx));
            }
            let newly_has = {
                let peer = state.peers.get_mut(&id).unwrap();
                peer.peer_min_pieces = peer.peer_min_pieces.max(piece_idx + 1);
                if peer.peer_has(piece_idx) {
                    false
                } else {
                    if peer.bitfield.len() <= piece_idx {
                        peer.bitfield.resize(piece_idx + 1, false);
                    }
                    peer.bitfield.set(piece_idx, true);
                    true
                }
            };
            if newly_has {
                if let Some(count) = state.availability.get_mut(piece_idx) {
                    *count += 1;
                }
                if state.update_piece_priority(id, piece_idx) {
                    state.update_requests(id);
                }
                state.maybe_drop_mutually_complete_peer(id);
            }
        }

        Message::Bitfield(bits) => on_bitfield(state, id, bits)?,

        Message::Request(r) => on_read_request(ctx, state, id, r)?,

        Message::Cancel(r) => {
            let peer = state.peers.get_mut(&id).unwrap();
            if peer.peer_requests.remove(&r).is_some() && peer.conn.fast {
                peer.queue_message(Message::Reject(r));
            }
        }

        Message::Port { port } => {
            let addr = {
                let peer = state.peers.get_mut(&id).unwrap();
                peer.peer_listen_port = Some(port);
                std::net::SocketAddr::new(peer.conn.remote_addr.ip(), port)
            };
            if let Some(cb) = &state.callbacks.dht_ping {
                cb(addr);
            }
        }

        Message::Suggest { idx } => {
            let piece_idx = idx as usize;
            if state.have_info() && piece_idx >= state.num_pieces() {
                return Err(PeerError::InvalidPieceIndex(piece_idx));
            }
            // Advisory only.
            state.update_requests(id);
        }

        Message::HaveAll => {
            let newly: Vec<usize> = {
                let peer = state.peers.get(&id).unwrap();
                (0..state.num_pieces())
                    .filter(|&i| !peer.peer_has(i))
                    .collect()
            };
            for piece_idx in &newly {
                state.availability[*piece_idx] += 1;
            }
            let num_pieces = state.num_pieces();
            let peer = state.peers.get_mut(&id).unwrap();
            peer.sent_have_all = true;
            peer.bitfield.fill(false);
            peer.peer_min_pieces = peer.peer_min_pieces.max(num_pieces);
            state.peer_pieces_changed(id);
        }

        Message::HaveNone => {
            let had: Vec<usize> = {
                let peer = state.peers.get(&id).unwrap();
                if peer.sent_have_all {
                    (0..state.num_pieces()).collect()
                } else {
                    peer.bitfield.iter_ones().collect()
                }
            };
            for piece_idx in had {
                if let Some(count) = state.availability.get_mut(piece_idx) {
                    *count -= 1;
                }
            }
            let peer = state.peers.get_mut(&id).unwrap();
            peer.sent_have_all = false;
            peer.bitfield.fill(false);
            state.peer_pieces_changed(id);
        }

        Message::Reject(r) => {
            state.remote_rejected_request(id, r);
            state.update_requests(id);
        }

        Message::AllowedFast { idx } => {
            let piece_idx = idx as usize;
            if state.have_info() && piece_idx >= state.num_pieces() {
                return Err(PeerError::InvalidPieceIndex(piece_idx));
            }
            state.peers.get_mut(&id).unwrap().allowed_fast.insert(piece_idx);
            state.update_requests(id);
        }

        Message::Extended { id: ext_id, payload } => {
            on_extended(ctx, state, id, ext_id, &payload)?;
        }

        // Handled before dispatch.
        Message::Block(_) => unreachable!("block messages take the receive path"),
    }

    Ok(())
}

fn on_bitfield(state: &mut TorrentState, id: PeerId, mut bits: crate::Bitfield) -> Result<()> {
    if state.have_info() {
        let num_pieces = state.num_pieces();
        if bits.len() < num_pieces {
            return Err(PeerError::BadBitfieldLength {
                got: bits.len(),
                expected: num_pieces,
            });
        }
        // Spare bits pad the final byte.
        bits.truncate(num_pieces);
    }

    // Swap in the new piece set, settling availability by diff.
    let (gained, lost) = {
        let peer = state.peers.get_mut(&id).unwrap();
        let mut gained = Vec::new();
        let mut lost = Vec::new();
        let was_have_all = peer.sent_have_all;
        peer.sent_have_all = false;

        let old = std::mem::replace(&mut peer.bitfield, bits);
        for piece_idx in 0..peer.bitfield.len().max(old.len()) {
            let had = was_have_all || old.get(piece_idx).map(|b| *b).unwrap_or(false);
            let has = peer.bitfield.get(piece_idx).map(|b| *b).unwrap_or(false);
            match (had, has) {
                (false, true) => gained.push(piece_idx),
                (true, false) => lost.push(piece_idx),
                _ => {}
            }
        }
        let highest = peer.bitfield.last_one().map(|i| i + 1).unwrap_or(0);
        peer.peer_min_pieces = peer.peer_min_pieces.max(highest);
        (gained, lost)
    };

    for piece_idx in gained {
        if let Some(count) = state.availability.get_mut(piece_idx) {
            *count += 1;
        }
    }
    for piece_idx in lost {
        if let Some(count) = state.availability.get_mut(piece_idx) {
            *count -= 1;
        }
    }
    state.peer_pieces_changed(id);
    Ok(())
}

// Upload accept path. Misbehaviour short of an out-and-out protocol
// violation is tolerated: duplicates and over-queue requests are dropped
// (rejected under fast), and requests while choked are answered with a
// Reject when fast allows it.
fn on_read_request(
    ctx: &Arc<TorrentContext>,
    state: &mut TorrentState,
    id: PeerId,
    r: BlockInfo,
) -> Result<()> {
    let verdict = {
        let peer = state.peers.get(&id).unwrap();
        if peer.am_choking {
            Some(peer.conn.fast)
        } else if peer.peer_requests.contains_key(&r) {
            Some(false)
        } else if peer.peer_requests.len() >= ctx.config.local_reqq {
            Some(peer.conn.fast)
        } else {
            None
        }
    };
    if let Some(reject) = verdict {
        tracing::debug!(peer = %id, "dropping request {}", r);
        if reject {
            state.peers.get_mut(&id).unwrap().queue_message(Message::Reject(r));
        }
        return Ok(());
    }

    if !state.have_piece(r.piece_idx) {
        return Err(PeerError::InvalidPieceIndex(r.piece_idx));
    }
    if r.offset + r.len > state.piece_len(r.piece_idx) {
        return Err(PeerError::BadRequestBounds(r));
    }

    state.peers.get_mut(&id).unwrap().peer_requests.insert(r, None);
    spawn_upload_read(Arc::clone(ctx), id, r);
    Ok(())
}

// Fetches the requested block off storage without the lock, then parks the
// bytes in the request entry for the writer.
fn spawn_upload_read(ctx: Arc<TorrentContext>, id: PeerId, r: BlockInfo) {
    tokio::spawn(async move {
        let (tx, rx) = oneshot::channel();
        if ctx
            .disk_tx
            .send(DiskCommand::ReadBlock { block: r, tx })
            .is_err()
        {
            return;
        }

        match rx.await {
            Ok(Ok(data)) => {
                let mut state = ctx.state();
                if let Ok(peer) = state.peer_mut(id) {
                    if let Some(slot) = peer.peer_requests.get_mut(&r) {
                        *slot = Some(data);
                        peer.write_notify.notify_one();
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(peer = %id, "storage read failed for {}: {}", r, e);
                ctx.state().choke(id);
            }
            // Storage went away; the session is on its way down too.
            Err(_) => {}
        }
    });
}

// A block of piece data arrived. The ledger settles before the lock is
// released for the storage write, so racing receives and cancels from
// other connections cannot double-account.
pub(crate) async fn receive_block(
    ctx: &Arc<TorrentContext>,
    id: PeerId,
    data: BlockData,
) -> Result<()> {
    let r = data.info();

    // Inbound throttle, settled before any state is touched.
    let delay = ctx.down_limiter.reserve(r.len);
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let now = Instant::now();

    {
        let mut guard = ctx.state();
        let state = &mut *guard;

        let peer = match state.peers.get_mut(&id) {
            Some(peer) if !peer.closed => peer,
            _ => return Err(PeerError::Closed),
        };
        peer.last_message_received = now;

        // An arrival with no receive allowance is a protocol violation.
        match peer.valid_receive.get_mut(&r) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    peer.valid_receive.remove(&r);
                }
            }
            _ => return Err(PeerError::UnexpectedChunk(r)),
        }

        if peer.requests_out.contains(&r) {
            if !peer.peer_choking {
                peer.chunks_received_while_expecting += 1;
            }
            peer.blocks_received_since_update += 1;
            if let Some(cb) = &state.callbacks.received_requested {
                cb(r);
            }
            state.delete_request(id, r);
        }

        let peer = state.peers.get_mut(&id).unwrap();
        peer.update_expecting(now);

        // Already have it: account the waste and recycle the buffer.
        if state.have_block(&r) {
            let peer = state.peers.get_mut(&id).unwrap();
            peer.stats.received_block(r.len, false);
            ctx.block_pool.put(data.data);
            state.update_requests(id);
            return Ok(());
        }

        let peer = state.peers.get_mut(&id).unwrap();
        peer.stats.received_block(r.len, true);
        peer.last_useful_chunk_received = Some(now);
        if let Some(cb) = &state.callbacks.received_useful_data {
            cb(r.len);
        }

        // The block is now spoken for; nobody re-requests it while the
        // write is in flight.
        let partial = state.partial_mut(r.piece_idx);
        partial.dirty.set(r.idx_in_piece(), true);
        partial.pending_writes += 1;

        // Everyone else racing for the same block can stop.
        for other in state.peer_ids() {
            if other != id {
                state.cancel(other, r);
            }
        }
    }

    // Lock released across the storage write.
    let (tx, rx) = oneshot::channel();
    let send_ok = ctx
        .disk_tx
        .send(DiskCommand::WriteBlock { block: data, tx })
        .is_ok();
    let result = if send_ok {
        match rx.await {
            Ok((buf, result)) => {
                ctx.block_pool.put(buf);
                result
            }
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "storage task gone",
            )),
        }
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "storage task gone",
        ))
    };

    {
        let mut guard = ctx.state();
        let state = &mut *guard;
        let partial = state.partial_mut(r.piece_idx);
        partial.pending_writes -= 1;

        match result {
            Ok(()) => {
                partial.dirtiers.insert(id);
                let ready = partial.all_dirty() && partial.pending_writes == 0;
                if let Some(peer) = state.peers.get_mut(&id) {
                    peer.touched_pieces.insert(r.piece_idx);
                }
                if ready && !state.queued_for_hash.contains(&r.piece_idx) {
                    state.queued_for_hash.insert(r.piece_idx);
                    let _ = ctx.disk_tx.send(DiskCommand::CheckPiece {
                        piece_idx: r.piece_idx,
                    });
                }
            }
            Err(e) => {
                // Swallowed at the connection level: the chunk goes back
                // to requestable and the torrent owner hears about it.
                tracing::error!(piece = r.piece_idx, "block write failed: {}", e);
                partial.dirty.set(r.idx_in_piece(), false);
                if let Some(cb) = &state.callbacks.write_error {
                    cb(r.piece_idx, &e);
                }
            }
        }

        // Keep the pipeline full.
        state.update_requests(id);
    }

    ctx.event.notify_waiters();
    Ok(())
}

// Extension-protocol envelope: id 0 is the handshake, everything else
// dispatches on the ids we assigned in ours.
fn on_extended(
    ctx: &Arc<TorrentContext>,
    state: &mut TorrentState,
    id: PeerId,
    ext_id: u8,
    payload: &[u8],
) -> Result<()> {
    match ext_id {
        ext::HANDSHAKE_ID => on_extended_handshake(ctx, state, id, payload),
        ext::LOCAL_METADATA_ID => {
            match MetadataMsg::from_bytes(payload) {
                Ok(msg) => on_metadata_msg(ctx, state, id, msg),
                Err(e) => {
                    tracing::warn!(peer = %id, "ignoring bad metadata message: {}", e);
                    Ok(())
                }
            }
        }
        ext::LOCAL_PEX_ID => {
            match PexMessage::from_bytes(payload) {
                Ok(msg) => {
                    if let Some(cb) = &state.callbacks.pex_peers {
                        cb(msg.added_addrs(), msg.dropped_addrs());
                    }
                    Ok(())
                }
                Err(e) => {
                    tracing::warn!(peer = %id, "ignoring bad pex message: {}", e);
                    Ok(())
                }
            }
        }
        other => {
            tracing::debug!(peer = %id, "ignoring extended message with unknown id {}", other);
            Ok(())
        }
    }
}

fn on_extended_handshake(
    ctx: &Arc<TorrentContext>,
    state: &mut TorrentState,
    id: PeerId,
    payload: &[u8],
) -> Result<()> {
    let handshake = match ExtendedHandshake::from_bytes(payload) {
        Ok(handshake) => handshake,
        Err(e) => {
            let remote_id = state.peers.get(&id).unwrap().conn.remote_id;
            if BUGGY_EXTENSION_CLIENTS.iter().any(|p| remote_id.starts_with(*p)) {
                tracing::debug!(peer = %id, "tolerating bad extension handshake: {}", e);
                return Ok(());
            }
            return Err(PeerError::BadExtendedHandshake);
        }
    };
    if let Some(cb) = &state.callbacks.read_extended_handshake {
        cb(&handshake);
    }

    {
        let peer = state.peers.get_mut(&id).unwrap();
        if let Some(m) = &handshake.m {
            for (name, &ext_id) in m {
                if ext_id == 0 {
                    peer.peer_extension_ids.remove(name);
                } else if (1..=255).contains(&ext_id) {
                    peer.peer_extension_ids.insert(name.clone(), ext_id as u8);
                }
            }
        }
        if let Some(reqq) = handshake.reqq {
            if reqq > 0 {
                peer.peer_max_requests = reqq as usize;
            }
        }
        if let Some(v) = handshake.v {
            peer.peer_client_name = Some(v);
        }
        if let Some(p) = handshake.p {
            if (1..=u16::MAX as i64).contains(&p) {
                peer.peer_listen_port = Some(p as u16);
            }
        }
        if handshake.e == Some(1) {
            peer.peer_prefers_encryption = true;
        }
    }

    if let Some(size) = handshake.metadata_size {
        if size > 0 {
            match state.set_metadata_size(size as usize, ctx.config.max_metadata_size) {
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(peer = %id, "rejecting metadata size {}: {}", size, e);
                }
            }
        }
    }

    request_metadata(state, id);

    // A pex-capable peer gets an initial share; the writer picks it up.
    let peer = state.peers.get_mut(&id).unwrap();
    if !ctx.config.disable_pex && peer.supports_extension(ext::PEX_NAME) {
        peer.write_notify.notify_one();
    }
    Ok(())
}

// Queues ut_metadata requests for every piece we lack, in shuffled order
// so a swarm of half-done peers doesn't converge on piece zero.
fn request_metadata(state: &mut TorrentState, id: PeerId) {
    use rand::seq::SliceRandom;

    if state.metadata_complete() || state.metadata.size().is_none() {
        return;
    }
    let mut missing = state.metadata.missing_pieces();
    let piece_count = state.metadata.piece_count();

    let peer = state.peers.get_mut(&id).unwrap();
    let their_id = match peer.peer_extension_ids.get(ext::METADATA_NAME) {
        Some(&their_id) => their_id,
        None => return,
    };
    if peer.metadata_requests.len() < piece_count {
        peer.metadata_requests.resize(piece_count, false);
    }

    missing.shuffle(&mut rand::thread_rng());
    for piece in missing {
        if peer.metadata_requests[piece] {
            continue;
        }
        peer.metadata_requests.set(piece, true);
        peer.queue_message(Message::Extended {
            id: their_id,
            payload: MetadataMsg::Request(piece).to_bytes(),
        });
    }
}

fn on_metadata_msg(
    ctx: &Arc<TorrentContext>,
    state: &mut TorrentState,
    id: PeerId,
    msg: MetadataMsg,
) -> Result<()> {
    match msg {

        // The peer wants a metadata piece from us.
        MetadataMsg::Request(piece) => {
            let response = if state.metadata_complete() {
                state.metadata.piece_data(piece).map(|data| MetadataMsg::Data {
                    piece,
                    total_size: state.metadata.size().unwrap_or(0),
                    payload: data.to_vec(),
                })
            } else {
                None
            };
            let peer = state.peers.get_mut(&id).unwrap();
            if let Some(&their_id) = peer.peer_extension_ids.get(ext::METADATA_NAME) {
                let msg = response.unwrap_or(MetadataMsg::Reject(piece));
                peer.queue_message(Message::Extended {
                    id: their_id,
                    payload: msg.to_bytes(),
                });
            }
        }

        MetadataMsg::Data { piece, total_size, payload } => {
            if state.metadata_complete() {
                return Ok(());
            }
            if total_size > 0 {
                if let Err(e) =
                    state.set_metadata_size(total_size, ctx.config.max_metadata_size)
                {
                    tracing::warn!(peer = %id, "metadata data size rejected: {}", e);
                    return Ok(());
                }
            }
            {
                let peer = state.peers.get_mut(&id).unwrap();
                let requested = peer
                    .metadata_requests
                    .get(piece)
                    .map(|b| *b)
                    .unwrap_or(false);
                if !requested {
                    tracing::debug!(peer = %id, "unsolicited metadata piece {}", piece);
                    return Ok(());
                }
                peer.metadata_requests.set(piece, false);
            }
            if let Err(e) = state.metadata.write_piece(piece, &payload) {
                tracing::warn!(peer = %id, "bad metadata piece {}: {}", piece, e);
                return Ok(());
            }
            if state.metadata.have_all() {
                if state.metadata.verify(ctx.info_hash) {
                    tracing::info!("metadata complete, {} bytes", state.metadata.bytes().len());
                    if let Some(cb) = &state.callbacks.metadata_complete {
                        cb(state.metadata.bytes());
                    }
                } else {
                    // Poisoned assembly; start over from scratch.
                    tracing::warn!("assembled metadata failed info-hash check");
                    for other in state.peer_ids() {
                        if let Ok(peer) = state.peer_mut(other) {
                            peer.metadata_requests.fill(false);
                        }
                    }
                    request_metadata(state, id);
                }
            }
        }

        MetadataMsg::Reject(piece) => {
            let peer = state.peers.get_mut(&id).unwrap();
            if peer.metadata_requests.get(piece).map(|b| *b).unwrap_or(false) {
                peer.metadata_requests.set(piece, false);
            }
        }
    }
    Ok(())
}
