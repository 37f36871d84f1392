use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::Notify;
use crate::{
    block::{num_blocks, BlockInfo},
    config::Config,
    disk::DiskTx,
    ext::metadata::{MetadataError, MetadataStore},
    ext::pex::PexHistory,
    ext::ExtendedHandshake,
    limiter::{RateLimiter, Unlimited},
    p2p::message::Message,
    p2p::peer::{ConnInfo, Peer},
    p2p::PeerId,
    picker::Priority,
    pool::{BlockPool, InclinationPool},
    stats::PeerStats,
    Bitfield,
};

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("no such peer: {0}")]
    UnknownPeer(PeerId),

}

pub type Result<T> = std::result::Result<T, TorrentError>;

// Piece geometry of a torrent once the info dictionary is known.
#[derive(Debug, Clone, Copy)]
pub struct PieceTable {

    pub total_len: u64,

    pub piece_len: usize,

}

impl PieceTable {

    pub fn new(total_len: u64, piece_len: usize) -> Self {
        Self { total_len, piece_len }
    }

    pub fn num_pieces(&self) -> usize {
        if self.piece_len == 0 {
            0
        } else {
            ((self.total_len + self.piece_len as u64 - 1) / self.piece_len as u64) as usize
        }
    }

    pub fn piece_len(&self, piece_idx: usize) -> usize {
        let start = piece_idx as u64 * self.piece_len as u64;
        debug_assert!(start < self.total_len);
        self.piece_len.min((self.total_len - start) as usize)
    }
}

// Hooks fired at connection-lifecycle and transfer boundaries. All run
// under the torrent lock and must not call back into it.
#[derive(Default)]
pub struct Callbacks {

    pub sent_request: Option<Box<dyn Fn(BlockInfo) + Send + Sync>>,

    pub deleted_request: Option<Box<dyn Fn(BlockInfo) + Send + Sync>>,

    pub received_requested: Option<Box<dyn Fn(BlockInfo) + Send + Sync>>,

    pub received_useful_data: Option<Box<dyn Fn(usize) + Send + Sync>>,

    pub read_message: Option<Box<dyn Fn(&Message) + Send + Sync>>,

    pub read_extended_handshake: Option<Box<dyn Fn(&ExtendedHandshake) + Send + Sync>>,

    pub peer_closed: Option<Box<dyn Fn(PeerId) + Send + Sync>>,

    pub peer_conn_closed: Option<Box<dyn Fn(PeerId) + Send + Sync>>,

    // A peer advertised a DHT port; the owner may ping it.
    pub dht_ping: Option<Box<dyn Fn(SocketAddr) + Send + Sync>>,

    // A block write failed; the chunk has been made requestable again.
    pub write_error: Option<Box<dyn Fn(usize, &std::io::Error) + Send + Sync>>,

    // PEX delivered peer candidates: (added, dropped).
    pub pex_peers: Option<Box<dyn Fn(Vec<SocketAddr>, Vec<SocketAddr>) + Send + Sync>>,

    // The assembled info dictionary verified against the info-hash.
    pub metadata_complete: Option<Box<dyn Fn(&[u8]) + Send + Sync>>,

}

// A piece some of whose blocks have been written but not yet verified.
#[derive(Debug)]
pub struct PartialPiece {

    // Block written (or mid-write); such blocks are not requestable.
    pub dirty: Bitfield,

    // Storage writes in flight for this piece.
    pub pending_writes: u32,

    // Peers that contributed block data.
    pub dirtiers: HashSet<PeerId>,

}

impl PartialPiece {
    fn new(piece_len: usize) -> Self {
        let mut dirty = Bitfield::new();
        dirty.resize(num_blocks(piece_len) as usize, false);
        Self {
            dirty,
            pending_writes: 0,
            dirtiers: HashSet::new(),
        }
    }

    pub fn all_dirty(&self) -> bool {
        self.dirty.all()
    }
}

// All mutable torrent-wide state, including every peer. One lock guards
// the lot; it is never held across I/O.
pub struct TorrentState {

    pub(crate) info: Option<PieceTable>,

    // Pieces we have and have verified.
    pub(crate) completed: Bitfield,

    // How many connected peers have each piece.
    pub(crate) availability: Vec<u32>,

    // Download urgency per piece, set by the owner's policy.
    pub(crate) priorities: Vec<Priority>,

    pub(crate) partials: HashMap<usize, PartialPiece>,

    pub(crate) queued_for_hash: HashSet<usize>,

    pub(crate) hashing: HashSet<usize>,

    // Request -> number of connections with it in flight. A connection
    // contributes at most one.
    pub(crate) pending_requests: HashMap<BlockInfo, u32>,

    pub(crate) peers: HashMap<PeerId, Peer>,

    next_peer_id: u64,

    pub(crate) inclinations: InclinationPool,

    pub(crate) metadata: MetadataStore,

    pub(crate) pex: PexHistory,

    pub(crate) callbacks: Arc<Callbacks>,

}

// Shared handle to one torrent's connection core. Immutable collaborators
// live here; everything mutable is behind `state`.
pub struct TorrentContext {

    pub info_hash: [u8; 20],

    // Our own peer id, as sent in handshakes.
    pub client_id: [u8; 20],

    pub config: Config,

    pub disk_tx: DiskTx,

    pub up_limiter: Arc<dyn RateLimiter>,

    pub down_limiter: Arc<dyn RateLimiter>,

    // Payload buffers for inbound blocks.
    pub block_pool: Arc<BlockPool>,

    pub callbacks: Arc<Callbacks>,

    state: Mutex<TorrentState>,

    // Broadcast poked whenever observable torrent state changes.
    pub event: Notify,

}

pub struct TorrentParams {

    pub info_hash: [u8; 20],

    pub client_id: [u8; 20],

    pub config: Config,

    pub disk_tx: DiskTx,

    // Piece geometry, when opened from a full metainfo file. Absent for
    // magnet-style opens until ut_metadata completes.
    pub info: Option<PieceTable>,

    // Raw info-dict bytes when already known; lets us serve ut_metadata.
    pub info_bytes: Option<Vec<u8>>,

    pub up_limiter: Option<Arc<dyn RateLimiter>>,

    pub down_limiter: Option<Arc<dyn RateLimiter>>,

    pub callbacks: Callbacks,

}

impl TorrentContext {

    pub fn new(params: TorrentParams) -> Arc<Self> {
        let callbacks = Arc::new(params.callbacks);
        let metadata = match params.info_bytes {
            Some(bytes) => MetadataStore::from_info_bytes(bytes),
            None => MetadataStore::default(),
        };

        let mut state = TorrentState {
            info: None,
            completed: Bitfield::new(),
            availability: Vec::new(),
            priorities: Vec::new(),
            partials: HashMap::new(),
            queued_for_hash: HashSet::new(),
            hashing: HashSet::new(),
            pending_requests: HashMap::new(),
            peers: HashMap::new(),
            next_peer_id: 0,
            inclinations: InclinationPool::default(),
            metadata,
            pex: PexHistory::default(),
            callbacks: Arc::clone(&callbacks),
        };
        if let Some(info) = params.info {
            state.set_info(info);
        }
        tracing::debug!(
            "connection core ready for {}",
            hex::encode(params.info_hash),
        );

        Arc::new(Self {
            info_hash: params.info_hash,
            client_id: params.client_id,
            block_pool: Arc::new(BlockPool::new(params.config.block_size)),
            disk_tx: params.disk_tx,
            up_limiter: params.up_limiter.unwrap_or_else(|| Arc::new(Unlimited)),
            down_limiter: params.down_limiter.unwrap_or_else(|| Arc::new(Unlimited)),
            callbacks,
            state: Mutex::new(state),
            event: Notify::new(),
            config: params.config,
        })
    }

    // The torrent-wide lock. Callers must drop the guard before awaiting.
    pub fn state(&self) -> MutexGuard<'_, TorrentState> {
        self.state.lock().unwrap()
    }

    // Registers a handshaken connection and queues its opening messages.
    pub fn insert_peer(&self, conn: ConnInfo) -> PeerId {
        let mut state = self.state();
        let state = &mut *state;

        let id = PeerId(state.next_peer_id);
        state.next_peer_id += 1;

        let mut peer = Peer::new(conn, self.config.default_peer_reqq);
        if let Some(info) = &state.info {
            let num_pieces = info.num_pieces();
            peer.bitfield.resize(num_pieces, false);
            peer.piece_order
                .assign_inclination(state.inclinations.get(num_pieces));
        }

        // Opening messages: our piece map, then our extension handshake.
        if state.info.is_some() {
            if peer.conn.fast && state.is_complete() {
                peer.queue_message(Message::HaveAll);
            } else if peer.conn.fast && state.completed.not_any() {
                peer.queue_message(Message::HaveNone);
            } else if state.completed.any() {
                peer.queue_message(Message::Bitfield(state.completed.clone()));
            }
        }
        if peer.conn.extended && self.config.supports_extended {
            let handshake = ExtendedHandshake::ours(&self.config, state.metadata.size());
            peer.queue_message(Message::Extended {
                id: crate::ext::HANDSHAKE_ID,
                payload: handshake.to_bytes(),
            });
        }

        state.pex.record_added(peer.conn.remote_addr);
        tracing::debug!(peer = %id, addr = %peer.conn.remote_addr, "peer attached");
        state.peers.insert(id, peer);
        id
    }

    // Tears a connection down. Idempotent; the availability contribution
    // comes off exactly once, on the first call.
    pub fn close_peer(&self, id: PeerId) {
        let mut state = self.state();
        if state.close_peer_inner(id) {
            drop(state);
            self.event.notify_waiters();
        }
    }

    // Drops a closed peer from the arena once its tasks have unwound.
    pub fn remove_peer(&self, id: PeerId) {
        let mut state = self.state();
        if state.peers.get(&id).map(|p| !p.closed).unwrap_or(false) {
            state.close_peer_inner(id);
        }
        if state.peers.remove(&id).is_some() {
            if let Some(cb) = &state.callbacks.peer_conn_closed {
                cb(id);
            }
        }
    }

    // Outcome of an asynchronous hash check queued via CheckPiece.
    pub fn piece_hashed(&self, piece_idx: usize, ok: bool) {
        let mut state = self.state();
        state.piece_hashed(piece_idx, ok);
        drop(state);
        self.event.notify_waiters();
    }

    // Piece geometry became known (metainfo parsed by the owner, possibly
    // from bytes this crate assembled over ut_metadata).
    pub fn set_info(&self, info: PieceTable) {
        let mut state = self.state();
        state.set_info(info);
        drop(state);
        self.event.notify_waiters();
    }

    pub fn set_piece_priority(&self, piece_idx: usize, priority: Priority) {
        let mut state = self.state();
        state.set_piece_priority(piece_idx, priority);
    }

    pub fn peer_stats(&self, id: PeerId) -> Option<PeerStats> {
        self.state().peers.get(&id).map(|p| p.stats)
    }

    // Snapshot of what a peer claims to have, for display.
    pub fn peer_pieces(&self, id: PeerId) -> Option<(Bitfield, bool)> {
        self.state()
            .peers
            .get(&id)
            .map(|p| (p.bitfield.clone(), p.sent_have_all))
    }
}

impl TorrentState {

    pub fn have_info(&self) -> bool {
        self.info.is_some()
    }

    pub fn num_pieces(&self) -> usize {
        self.info.map(|i| i.num_pieces()).unwrap_or(0)
    }

    pub fn piece_len(&self, piece_idx: usize) -> usize {
        self.info.expect("piece_len without info").piece_len(piece_idx)
    }

    pub fn have_piece(&self, piece_idx: usize) -> bool {
        self.completed.get(piece_idx).map(|b| *b).unwrap_or(false)
    }

    // A zero-length torrent is complete the moment its geometry is known.
    pub fn is_complete(&self) -> bool {
        match &self.info {
            Some(info) => info.num_pieces() == 0 || self.completed.all(),
            None => false,
        }
    }

    pub fn left(&self) -> u64 {
        match &self.info {
            Some(info) => {
                (0..info.num_pieces())
                    .filter(|&i| !self.have_piece(i))
                    .map(|i| info.piece_len(i) as u64)
                    .sum()
            }
            None => 0,
        }
    }

    pub fn availability(&self, piece_idx: usize) -> u32 {
        self.availability.get(piece_idx).copied().unwrap_or(0)
    }

    pub fn peer(&self, id: PeerId) -> Result<&Peer> {
        self.peers.get(&id).ok_or(TorrentError::UnknownPeer(id))
    }

    pub fn peer_mut(&mut self, id: PeerId) -> Result<&mut Peer> {
        self.peers.get_mut(&id).ok_or(TorrentError::UnknownPeer(id))
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    // A block is spoken for once the piece has verified or the block has
    // been written (or is mid-write) into a partial piece.
    pub fn have_block(&self, r: &BlockInfo) -> bool {
        if self.have_piece(r.piece_idx) {
            return true;
        }
        self.partials
            .get(&r.piece_idx)
            .and_then(|p| p.dirty.get(r.idx_in_piece()).map(|b| *b))
            .unwrap_or(false)
    }

    pub(crate) fn partial_mut(&mut self, piece_idx: usize) -> &mut PartialPiece {
        let piece_len = self
            .info
            .expect("partial piece without info")
            .piece_len(piece_idx);
        self.partials
            .entry(piece_idx)
            .or_insert_with(|| PartialPiece::new(piece_len))
    }

    pub fn set_info(&mut self, info: PieceTable) {
        debug_assert!(self.info.is_none(), "info set twice");
        let num_pieces = info.num_pieces();
        self.completed.resize(num_pieces, false);
        self.availability = vec![0; num_pieces];
        self.priorities = vec![Priority::Normal; num_pieces];
        self.info = Some(info);
        tracing::info!(num_pieces, "piece table known");

        let ids = self.peer_ids();
        for id in ids {
            let perm = self.inclinations.get(num_pieces);
            let peer = self.peers.get_mut(&id).unwrap();
            peer.bitfield.resize(num_pieces, false);
            peer.piece_order.assign_inclination(perm);
            for piece_idx in 0..num_pieces {
                if peer.peer_has(piece_idx) {
                    self.availability[piece_idx] += 1;
                }
            }
            self.peer_pieces_changed(id);
        }
    }

    pub fn set_piece_priority(&mut self, piece_idx: usize, priority: Priority) {
        if self
            .priorities
            .get(piece_idx)
            .map(|&p| p == priority)
            .unwrap_or(true)
        {
            return;
        }
        self.priorities[piece_idx] = priority;
        let ids = self.peer_ids();
        for id in ids {
            if self.update_piece_priority(id, piece_idx) {
                self.update_requests(id);
            }
        }
    }

    // Recomputes every peer's request order in one pass per peer.
    pub fn update_all_piece_priorities(&mut self) {
        let ids = self.peer_ids();
        for id in ids {
            self.peer_pieces_changed(id);
        }
    }

    // Whether `piece_idx` belongs in this peer's request order, and where.
    pub(crate) fn update_piece_priority(&mut self, id: PeerId, piece_idx: usize) -> bool {
        let desired = {
            let peer = match self.peers.get(&id) {
                Some(peer) => peer,
                None => return false,
            };
            if !self.have_info()
                || peer.closed
                || self.have_piece(piece_idx)
                || !peer.peer_has(piece_idx)
            {
                None
            } else {
                match self.priorities[piece_idx] {
                    Priority::None => None,
                    priority => Some(priority),
                }
            }
        };
        self.peers
            .get_mut(&id)
            .unwrap()
            .piece_order
            .update(piece_idx, desired)
    }

    // Full recompute after a bulk change to what the peer has. Also the
    // point where pointless seed-to-seed links get dropped.
    pub(crate) fn peer_pieces_changed(&mut self, id: PeerId) {
        if !self.have_info() || !self.peers.contains_key(&id) {
            return;
        }
        let mut changed = false;
        for piece_idx in 0..self.num_pieces() {
            changed |= self.update_piece_priority(id, piece_idx);
        }
        if changed {
            self.update_requests(id);
        }
        self.maybe_drop_mutually_complete_peer(id);
    }

    // Best known piece count for the peer: exact once we have the info,
    // otherwise the floor its own messages imply.
    pub fn best_peer_num_pieces(&self, id: PeerId) -> usize {
        match &self.info {
            Some(info) => info.num_pieces(),
            None => self.peers.get(&id).map(|p| p.peer_min_pieces).unwrap_or(0),
        }
    }

    pub fn peer_has_wanted_pieces(&self, id: PeerId) -> bool {
        self.peers
            .get(&id)
            .map(|p| !p.piece_order.is_empty())
            .unwrap_or(false)
    }

    // Is the connection worth keeping at all?
    pub fn useful(&self, id: PeerId) -> bool {
        let peer = match self.peers.get(&id) {
            Some(peer) if !peer.closed => peer,
            _ => return false,
        };
        if !self.have_info() {
            return peer.conn.extended;
        }
        if self.peer_has_wanted_pieces(id) {
            return true;
        }
        self.is_complete() && peer.peer_interested
    }

    // Both sides have everything: nothing will ever flow; shut it down.
    pub(crate) fn maybe_drop_mutually_complete_peer(&mut self, id: PeerId) {
        if !self.is_complete() {
            return;
        }
        let mutually_complete = self
            .peers
            .get(&id)
            .map(|p| !p.closed && (p.sent_have_all || (!p.bitfield.is_empty() && p.bitfield.all())))
            .unwrap_or(false);
        if mutually_complete {
            tracing::debug!(peer = %id, "dropping mutually complete peer");
            self.close_peer_inner(id);
        }
    }

    // The whole close path runs under one lock hold: flag, ledger,
    // availability, ordering state, task wakeups.
    pub(crate) fn close_peer_inner(&mut self, id: PeerId) -> bool {
        match self.peers.get_mut(&id) {
            Some(peer) if !peer.closed => peer.closed = true,
            _ => return false,
        }

        self.delete_all_requests(id);

        let peer = self.peers.get_mut(&id).unwrap();
        if !self.availability.is_empty() {
            if peer.sent_have_all {
                for count in self.availability.iter_mut() {
                    *count -= 1;
                }
            } else {
                for piece_idx in peer.bitfield.iter_ones() {
                    if let Some(count) = self.availability.get_mut(piece_idx) {
                        *count -= 1;
                    }
                }
            }
        }

        peer.piece_order.clear();
        let perm = peer.piece_order.take_inclination();
        self.inclinations.put(perm);

        peer.peer_requests.clear();
        peer.valid_receive.clear();
        let addr = peer.conn.remote_addr;
        // notify_one stores a permit, so a task that has not yet parked
        // still observes the close.
        peer.shutdown.notify_one();
        peer.write_notify.notify_one();

        self.pex.record_dropped(addr);
        if let Some(cb) = &self.callbacks.peer_closed {
            cb(id);
        }
        tracing::debug!(peer = %id, "peer closed");
        true
    }

    pub fn set_metadata_size(&mut self, size: usize, cap: usize) -> Result<bool> {
        Ok(self.metadata.set_size(size, cap)?)
    }

    pub fn metadata_bytes(&self) -> &[u8] {
        self.metadata.bytes()
    }

    pub fn have_all_metadata_pieces(&self) -> bool {
        self.metadata.have_all()
    }

    pub fn metadata_complete(&self) -> bool {
        self.metadata.is_complete()
    }

    // Hash verdict for a piece whose blocks all made it to storage.
    pub fn piece_hashed(&mut self, piece_idx: usize, ok: bool) {
        self.queued_for_hash.remove(&piece_idx);
        self.hashing.remove(&piece_idx);

        if ok {
            if let Some(partial) = self.partials.remove(&piece_idx) {
                for id in partial.dirtiers {
                    if let Some(peer) = self.peers.get_mut(&id) {
                        peer.stats.pieces_dirtied_good += 1;
                        peer.touched_pieces.remove(&piece_idx);
                    }
                }
            }
            self.completed.set(piece_idx, true);
            tracing::info!(piece = piece_idx, "piece verified");

            let ids = self.peer_ids();
            for id in ids {
                // Requests for the piece are moot now.
                let stale: Vec<BlockInfo> = self.peers[&id]
                    .requests_out
                    .iter()
                    .filter(|r| r.piece_idx == piece_idx)
                    .copied()
                    .collect();
                for r in stale {
                    self.cancel(id, r);
                }

                let peer = self.peers.get_mut(&id).unwrap();
                if !peer.closed && peer.sent_haves.insert(piece_idx) {
                    peer.queue_message(Message::Have { idx: piece_idx as u32 });
                }

                if self.update_piece_priority(id, piece_idx) {
                    self.update_requests(id);
                }
                self.maybe_drop_mutually_complete_peer(id);
            }
        } else {
            tracing::warn!(piece = piece_idx, "piece failed verification");
            if let Some(partial) = self.partials.get_mut(&piece_idx) {
                partial.dirty.fill(false);
                let dirtiers = std::mem::take(&mut partial.dirtiers);
                for id in dirtiers {
                    if let Some(peer) = self.peers.get_mut(&id) {
                        peer.stats.pieces_dirtied_bad += 1;
                        peer.touched_pieces.remove(&piece_idx);
                    }
                }
            }
            // Every block of the piece is requestable again.
            let ids = self.peer_ids();
            for id in ids {
                self.update_requests(id);
            }
        }
    }
}
