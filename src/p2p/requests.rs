use std::collections::HashSet;
use std::time::Instant;
use crate::{
    block::{block_len, num_blocks, BlockInfo},
    torrent::TorrentState,
    BLOCK_SIZE,
};
use super::{message::Message, PeerId};

// The outbound request ledger. Each entry in a peer's `requests_out` is
// mirrored by one refcount in the torrent's `pending_requests`; receives,
// rejects, cancels and closes all drain through `delete_request` so the
// two can never drift.
impl TorrentState {

    // Puts a request on the wire. Preconditions (closed, peer lacks the
    // piece, piece hashing or queued for hash) are programmer errors, not
    // peer behaviour; callers check observable state first. Re-requesting
    // an in-flight block is a no-op, and a full window refuses.
    pub fn request(&mut self, id: PeerId, r: BlockInfo) -> bool {
        let peer = self.peers.get_mut(&id).expect("request on unknown peer");
        assert!(!peer.closed, "request on closed connection");
        assert!(peer.peer_has(r.piece_idx), "request for piece the peer lacks");
        assert!(
            !self.hashing.contains(&r.piece_idx) && !self.queued_for_hash.contains(&r.piece_idx),
            "request for piece pending verification",
        );

        if peer.requests_out.contains(&r) {
            return true;
        }
        if peer.requests_out.len() >= peer.nominal_max_requests() {
            return false;
        }

        peer.requests_out.insert(r);
        *peer.valid_receive.entry(r).or_insert(0) += 1;
        *self.pending_requests.entry(r).or_insert(0) += 1;

        peer.update_expecting(Instant::now());
        peer.queue_message(Message::Request(r));
        if let Some(cb) = &self.callbacks.sent_request {
            cb(r);
        }
        true
    }

    // Withdraws a request locally and tells the peer. The chunk stays in
    // `valid_receive`: it may already be in flight and must not be called
    // unexpected when it lands.
    pub fn cancel(&mut self, id: PeerId, r: BlockInfo) -> bool {
        let in_flight = self
            .peers
            .get(&id)
            .map(|p| p.requests_out.contains(&r))
            .unwrap_or(false);
        if !in_flight {
            if let Some(peer) = self.peers.get_mut(&id) {
                peer.next_requests.remove(&r);
            }
            return false;
        }

        self.delete_request(id, r);
        let peer = self.peers.get_mut(&id).unwrap();
        peer.queue_message(Message::Cancel(r));
        peer.update_expecting(Instant::now());
        true
    }

    // Drops the ledger entry and its `pending_requests` contribution. A
    // decrement past zero means a double delete somewhere; that is a bug,
    // so it aborts rather than limps.
    pub fn delete_request(&mut self, id: PeerId, r: BlockInfo) -> bool {
        let peer = match self.peers.get_mut(&id) {
            Some(peer) => peer,
            None => return false,
        };
        peer.next_requests.remove(&r);
        if !peer.requests_out.remove(&r) {
            return false;
        }

        let count = self
            .pending_requests
            .get_mut(&r)
            .expect("pending request count underflow");
        assert!(*count > 0, "pending request count underflow");
        *count -= 1;
        if *count == 0 {
            self.pending_requests.remove(&r);
        }

        if let Some(cb) = &self.callbacks.deleted_request {
            cb(r);
        }
        true
    }

    // Remote choked us without the fast extension: every outstanding
    // request is implicitly dropped.
    pub fn delete_all_requests(&mut self, id: PeerId) {
        let outstanding: Vec<BlockInfo> = match self.peers.get(&id) {
            Some(peer) => peer.requests_out.iter().copied().collect(),
            None => return,
        };
        for r in outstanding {
            self.delete_request(id, r);
        }
        let peer = self.peers.get_mut(&id).unwrap();
        debug_assert!(peer.requests_out.is_empty());
        peer.next_requests.clear();
        peer.update_expecting(Instant::now());
    }

    // An explicit Reject: the chunk will never arrive, so its receive
    // allowance goes too. That holds even when the request itself is
    // already gone (the Reject answered our Cancel).
    pub fn remote_rejected_request(&mut self, id: PeerId, r: BlockInfo) {
        self.delete_request(id, r);
        let peer = match self.peers.get_mut(&id) {
            Some(peer) => peer,
            None => return,
        };
        if let Some(count) = peer.valid_receive.get_mut(&r) {
            *count -= 1;
            if *count == 0 {
                peer.valid_receive.remove(&r);
            }
        }
        peer.update_expecting(Instant::now());
    }

    // Rebuilds the tentative request set the writer converges toward:
    // walk the peer's piece order, skip blocks that are spoken for, stop
    // at the in-flight window.
    pub fn update_requests(&mut self, id: PeerId) {
        let next = self.desired_requests(id);
        let peer = match self.peers.get_mut(&id) {
            Some(peer) if !peer.closed => peer,
            _ => return,
        };

        peer.max_blocks_received_between_updates = peer
            .max_blocks_received_between_updates
            .max(peer.blocks_received_since_update);
        peer.blocks_received_since_update = 0;
        peer.next_requests = next;

        let want = !peer.piece_order.is_empty();
        peer.set_interested(want, Instant::now());
        peer.write_notify.notify_one();
    }

    fn desired_requests(&self, id: PeerId) -> HashSet<BlockInfo> {
        let mut next = HashSet::new();
        let peer = match self.peers.get(&id) {
            Some(peer) if !peer.closed => peer,
            _ => return next,
        };
        let info = match &self.info {
            Some(info) => info,
            None => return next,
        };
        let cap = peer.nominal_max_requests();

        'pieces: for piece_idx in peer.piece_order.iter() {
            if self.have_piece(piece_idx)
                || self.hashing.contains(&piece_idx)
                || self.queued_for_hash.contains(&piece_idx)
                || peer.remote_choking_piece(piece_idx)
            {
                continue;
            }
            let piece_len = info.piece_len(piece_idx);
            for block_idx in 0..num_blocks(piece_len) as usize {
                let r = BlockInfo {
                    piece_idx,
                    offset: block_idx * BLOCK_SIZE,
                    len: block_len(piece_len, block_idx),
                };
                if self.have_block(&r) {
                    continue;
                }
                if peer.requests_out.contains(&r) {
                    next.insert(r);
                } else if self.pending_requests.get(&r).copied().unwrap_or(0) == 0 {
                    next.insert(r);
                }
                if next.len() >= cap {
                    break 'pieces;
                }
            }
        }
        next
    }

    // Issues wire requests until `requests_out` matches `next_requests`,
    // within the window. Runs under the lock from the writer's fill pass.
    pub(crate) fn apply_next_requests(&mut self, id: PeerId) {
        let wanted: Vec<BlockInfo> = {
            let peer = match self.peers.get(&id) {
                Some(peer) if !peer.closed => peer,
                _ => return,
            };
            peer.next_requests
                .difference(&peer.requests_out)
                .copied()
                .collect()
        };

        for r in wanted {
            let sendable = {
                let peer = &self.peers[&id];
                peer.peer_has(r.piece_idx)
                    && !peer.remote_choking_piece(r.piece_idx)
                    && !self.hashing.contains(&r.piece_idx)
                    && !self.queued_for_hash.contains(&r.piece_idx)
                    && !self.have_piece(r.piece_idx)
            };
            if !sendable {
                continue;
            }
            if !self.request(id, r) {
                // Window full.
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::util::{fixture, two_peer_fixture, BLOCK};

    #[test]
    fn test_request_is_idempotent() {
        let (ctx, id) = fixture(8, true);
        let mut state = ctx.state();
        let r = BlockInfo { piece_idx: 1, offset: 0, len: BLOCK };
        state.peer_mut(id).unwrap().peer_max_requests = 8;
        state.peer_mut(id).unwrap().max_blocks_received_between_updates = 4;

        assert!(state.request(id, r));
        assert!(state.request(id, r));
        assert_eq!(state.peer(id).unwrap().requests_out.len(), 1);
        assert_eq!(state.pending_requests.get(&r), Some(&1));
        assert_eq!(state.peer(id).unwrap().valid_receive.get(&r), Some(&1));
    }

    #[test]
    fn test_request_refuses_past_window() {
        let (ctx, id) = fixture(8, true);
        let mut state = ctx.state();
        // Window of exactly one.
        state.peer_mut(id).unwrap().max_blocks_received_between_updates = 0;

        let a = BlockInfo { piece_idx: 1, offset: 0, len: BLOCK };
        let b = BlockInfo { piece_idx: 1, offset: BLOCK, len: BLOCK };
        assert!(state.request(id, a));
        assert!(!state.request(id, b));
        assert_eq!(state.peer(id).unwrap().requests_out.len(), 1);
    }

    #[test]
    fn test_duplicate_cancel_is_safe() {
        let (ctx, id) = fixture(8, true);
        let mut state = ctx.state();
        state.peer_mut(id).unwrap().max_blocks_received_between_updates = 4;
        let r = BlockInfo { piece_idx: 1, offset: 0, len: BLOCK };

        assert!(state.request(id, r));
        state.peer_mut(id).unwrap().out_queue.clear();

        assert!(state.cancel(id, r));
        assert!(!state.cancel(id, r));

        let peer = state.peer(id).unwrap();
        let cancels = peer
            .out_queue
            .iter()
            .filter(|m| matches!(m, Message::Cancel(_)))
            .count();
        assert_eq!(cancels, 1);
        assert_eq!(state.pending_requests.get(&r), None);
        // The block may still arrive; it must not be treated as a stranger.
        assert_eq!(state.peer(id).unwrap().valid_receive.get(&r), Some(&1));
    }

    #[test]
    fn test_reject_clears_receive_allowance() {
        let (ctx, id) = fixture(8, true);
        let mut state = ctx.state();
        state.peer_mut(id).unwrap().max_blocks_received_between_updates = 4;
        let r = BlockInfo { piece_idx: 1, offset: 0, len: BLOCK };

        assert!(state.request(id, r));
        state.remote_rejected_request(id, r);

        let peer = state.peer(id).unwrap();
        assert!(peer.requests_out.is_empty());
        assert!(peer.valid_receive.is_empty());
        assert!(state.pending_requests.is_empty());
    }

    #[test]
    fn test_delete_all_requests() {
        let (ctx, id) = fixture(8, true);
        let mut state = ctx.state();
        state.peer_mut(id).unwrap().max_blocks_received_between_updates = 8;

        for block_idx in 0..3usize {
            let r = BlockInfo { piece_idx: 1, offset: block_idx * BLOCK, len: BLOCK };
            assert!(state.request(id, r));
        }
        assert_eq!(state.pending_requests.len(), 3);

        state.delete_all_requests(id);
        assert!(state.peer(id).unwrap().requests_out.is_empty());
        assert!(state.peer(id).unwrap().next_requests.is_empty());
        assert!(state.pending_requests.is_empty());
    }

    #[test]
    fn test_pending_requests_span_peers() {
        let (ctx, a, b) = two_peer_fixture(8);
        let mut state = ctx.state();
        state.peer_mut(a).unwrap().max_blocks_received_between_updates = 4;
        state.peer_mut(b).unwrap().max_blocks_received_between_updates = 4;
        let r = BlockInfo { piece_idx: 1, offset: 0, len: BLOCK };

        assert!(state.request(a, r));
        assert!(state.request(b, r));
        assert_eq!(state.pending_requests.get(&r), Some(&2));

        state.delete_request(a, r);
        assert_eq!(state.pending_requests.get(&r), Some(&1));
        state.delete_request(b, r);
        assert_eq!(state.pending_requests.get(&r), None);
    }

    #[test]
    fn test_desired_requests_skip_other_peers_blocks() {
        let (ctx, a, b) = two_peer_fixture(2);
        let mut state = ctx.state();
        state.peer_mut(a).unwrap().max_blocks_received_between_updates = 64;
        state.peer_mut(b).unwrap().max_blocks_received_between_updates = 64;
        state.peer_mut(a).unwrap().peer_choking = false;
        state.peer_mut(b).unwrap().peer_choking = false;

        state.update_requests(a);
        let next_a = state.peer(a).unwrap().next_requests.clone();
        assert!(!next_a.is_empty());
        for r in &next_a {
            assert!(state.request(a, *r));
        }

        state.update_requests(b);
        let next_b = state.peer(b).unwrap().next_requests.clone();
        assert!(next_a.is_disjoint(&next_b));
    }
}
