use std::{sync::Arc, time::Instant};
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use crate::{
    block::{BlockData, BlockInfo},
    ext,
    torrent::{TorrentContext, TorrentState},
};
use super::{
    message::{Message, MessageCodec},
    PeerId, Result,
};

type MessageSink<S> = futures::stream::SplitSink<Framed<S, MessageCodec>, Message>;

// One pass of the writer's fill loop, produced under the torrent lock.
pub(crate) struct Filled {

    // Control traffic and freshly issued requests, in order.
    pub msgs: Vec<Message>,

    // A ready upload candidate; sending it waits on the rate limiter, so
    // it leaves the lock as a name, not bytes.
    pub upload: Option<BlockInfo>,

    pub closed: bool,

}

// The write half: a condition-driven loop. Anything that could produce
// outbound traffic notifies the peer; each wakeup drains everything
// currently sendable, then sleeps until the next signal or keepalive.
pub(crate) async fn run<S>(
    ctx: Arc<TorrentContext>,
    id: PeerId,
    mut sink: MessageSink<S>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let notify = match ctx.state().peer(id) {
        Ok(peer) => Arc::clone(&peer.write_notify),
        Err(_) => return Ok(()),
    };
    let mut last_write = Instant::now();

    loop {
        let filled = {
            let mut state = ctx.state();
            fill_write_buffer(&ctx, &mut state, id)
        };

        let wrote = !filled.msgs.is_empty();
        for msg in filled.msgs {
            tracing::trace!(peer = %id, "send: {}", msg);
            sink.send(msg).await?;
        }

        if let Some(r) = filled.upload {
            let delay = ctx.up_limiter.reserve(r.len);
            if delay.is_zero() {
                if let Some(block) = take_upload(&ctx, id, r) {
                    tracing::trace!(peer = %id, "send block {}", r);
                    sink.send(Message::Block(block)).await?;
                    last_write = Instant::now();
                }
                continue;
            }
            // Back off without the lock; retickle when the reservation
            // window opens.
            let retickle = Arc::clone(&notify);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                retickle.notify_one();
            });
        } else if wrote {
            last_write = Instant::now();
            continue;
        }

        if filled.closed {
            return Ok(());
        }

        let keepalive_at = last_write + ctx.config.keep_alive_interval;
        tokio::select! {
            _ = notify.notified() => {}
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(keepalive_at)) => {
                tracing::trace!(peer = %id, "send: keep alive");
                sink.send(Message::KeepAlive).await?;
                last_write = Instant::now();
            }
        }
    }
}

// Gathers everything currently sendable: request-set convergence, the pex
// share if due, queued control messages, and one ready upload.
pub(crate) fn fill_write_buffer(
    ctx: &Arc<TorrentContext>,
    state: &mut TorrentState,
    id: PeerId,
) -> Filled {
    if state.peers.get(&id).map(|p| p.closed).unwrap_or(true) {
        let msgs = state
            .peers
            .get_mut(&id)
            .map(|p| p.out_queue.drain(..).collect())
            .unwrap_or_default();
        return Filled { msgs, upload: None, closed: true };
    }

    state.apply_next_requests(id);
    maybe_share_pex(ctx, state, id);

    let upload = pick_upload(ctx, state, id);
    let peer = state.peers.get_mut(&id).unwrap();
    let msgs = peer.out_queue.drain(..).collect();

    Filled { msgs, upload, closed: false }
}

// Serve-side gate. Upload credit keeps a leech from running more than a
// window ahead of what it has given us; seeding drops the reciprocity
// requirement.
fn upload_allowed(ctx: &Arc<TorrentContext>, state: &TorrentState, id: PeerId) -> bool {
    if ctx.config.no_upload || ctx.config.data_upload_disallowed {
        return false;
    }
    let peer = match state.peers.get(&id) {
        Some(peer) => peer,
        None => return false,
    };
    // Seeding serves unconditionally; a leeching link only earns upload
    // while the peer still has something we want, and within the credit.
    if state.is_complete() {
        return true;
    }
    if peer.piece_order.is_empty() {
        return false;
    }
    peer.stats.bytes_written <= peer.stats.bytes_read + ctx.config.upload_credit
}

// Picks one ready upload, or chokes the peer when serving is no longer
// allowed and it still has requests queued.
fn pick_upload(
    ctx: &Arc<TorrentContext>,
    state: &mut TorrentState,
    id: PeerId,
) -> Option<BlockInfo> {
    let has_pending = state
        .peers
        .get(&id)
        .map(|p| !p.peer_requests.is_empty())
        .unwrap_or(false);
    if !has_pending {
        return None;
    }

    if !upload_allowed(ctx, state, id) {
        state.choke(id);
        return None;
    }

    let peer = state.peers.get(&id).unwrap();
    if peer.am_choking {
        return None;
    }
    peer.peer_requests
        .iter()
        .find(|(r, data)| data.is_some() && state.have_piece(r.piece_idx))
        .map(|(r, _)| *r)
}

// Removes the served entry and hands its bytes out, re-checking the gate
// under the lock since the limiter sleep happened outside it.
fn take_upload(ctx: &Arc<TorrentContext>, id: PeerId, r: BlockInfo) -> Option<BlockData> {
    let mut state = ctx.state();
    let state = &mut *state;
    if !upload_allowed(ctx, state, id) {
        state.choke(id);
        return None;
    }

    let peer = state.peers.get_mut(&id)?;
    if peer.closed || peer.am_choking {
        return None;
    }
    let data = peer.peer_requests.remove(&r)??;

    peer.stats.sent_block(data.len());
    peer.last_chunk_sent = Some(Instant::now());
    Some(BlockData {
        piece_idx: r.piece_idx,
        offset: r.offset,
        data,
    })
}

// Queues the periodic pex delta when the interval has elapsed (or the
// peer has never had a share).
fn maybe_share_pex(ctx: &Arc<TorrentContext>, state: &mut TorrentState, id: PeerId) {
    if ctx.config.disable_pex {
        return;
    }
    let now = Instant::now();
    let due = {
        let peer = match state.peers.get(&id) {
            Some(peer) => peer,
            None => return,
        };
        peer.supports_extension(ext::PEX_NAME)
            && peer
                .last_pex_share
                .map(|at| now.duration_since(at) >= ctx.config.pex_interval)
                .unwrap_or(true)
    };
    if !due {
        return;
    }

    let (cursor, exclude, their_id) = {
        let peer = state.peers.get(&id).unwrap();
        (
            peer.pex_cursor,
            peer.conn.remote_addr,
            peer.peer_extension_ids[ext::PEX_NAME],
        )
    };
    let msg = state.pex.message_since(cursor, exclude);
    let tip = state.pex.tip();

    let peer = state.peers.get_mut(&id).unwrap();
    peer.pex_cursor = tip;
    peer.last_pex_share = Some(now);
    if !msg.is_empty() {
        peer.queue_message(Message::Extended {
            id: their_id,
            payload: msg.to_bytes(),
        });
    }
}

impl TorrentState {

    // Stops serving the peer. With fast semantics every queued request is
    // explicitly rejected; without, the queue just drains away.
    pub fn choke(&mut self, id: PeerId) -> bool {
        let peer = match self.peers.get_mut(&id) {
            Some(peer) if !peer.am_choking && !peer.closed => peer,
            _ => return false,
        };
        peer.am_choking = true;
        peer.queue_message(Message::Choke);

        let pending: Vec<BlockInfo> = peer.peer_requests.drain().map(|(r, _)| r).collect();
        if peer.conn.fast {
            for r in pending {
                peer.queue_message(Message::Reject(r));
            }
        }
        true
    }

    pub fn unchoke(&mut self, id: PeerId) -> bool {
        let peer = match self.peers.get_mut(&id) {
            Some(peer) if peer.am_choking && !peer.closed => peer,
            _ => return false,
        };
        peer.am_choking = false;
        peer.queue_message(Message::Unchoke);
        true
    }

    // Upward-facing interest control; at most one wire message per actual
    // transition.
    pub fn set_interested(&mut self, id: PeerId, interested: bool) -> bool {
        match self.peers.get_mut(&id) {
            Some(peer) if !peer.closed => peer.set_interested(interested, Instant::now()),
            _ => false,
        }
    }
}
