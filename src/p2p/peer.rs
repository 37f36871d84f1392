use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Notify;
use crate::{
    block::BlockInfo,
    picker::PieceOrder,
    stats::PeerStats,
    Bitfield,
};
use super::message::Message;

// How the connection came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Incoming,
    DhtGetPeers,
    DhtAnnouncePeer,
    Pex,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Utp,
    Ws,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CryptoMethod {
    #[default]
    Plaintext,
    Rc4,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CryptoInfo {

    pub method: CryptoMethod,

    // Whether the handshake header itself was obfuscated.
    pub header_encrypted: bool,

}

// Everything the transport layer learned before handing us the stream.
#[derive(Debug, Clone)]
pub struct ConnInfo {

    pub remote_addr: SocketAddr,

    pub network: Network,

    pub outgoing: bool,

    pub source: PeerSource,

    pub trusted: bool,

    pub crypto: CryptoInfo,

    // The remote's 20-byte id from the handshake.
    pub remote_id: [u8; 20],

    // Both sides advertised the fast extension.
    pub fast: bool,

    // Both sides advertised the extension protocol.
    pub extended: bool,

}

// Full per-connection state. Lives in the torrent's peer arena, under the
// torrent lock; the reader and writer tasks address it by id.
#[derive(Debug)]
pub struct Peer {

    pub conn: ConnInfo,

    // Timestamps and accumulators feeding the owner's churn decisions.
    pub completed_handshake: Instant,
    pub last_message_received: Instant,
    pub last_useful_chunk_received: Option<Instant>,
    pub last_chunk_sent: Option<Instant>,
    pub last_became_interested: Option<Instant>,

    // Set while expecting_chunks() holds; the epoch of the current
    // expectation window.
    pub last_started_expecting: Option<Instant>,

    // Total time we have spent interested, excluding the current stretch.
    pub prior_interest: Duration,

    // Total time spent with live, unchoked requests outstanding.
    pub cumulative_expected_to_receive: Duration,

    pub chunks_received_while_expecting: u64,

    // Our side of the connection.
    pub am_interested: bool,
    pub am_choking: bool,

    // Requests currently on the wire.
    pub requests_out: HashSet<BlockInfo>,

    // Where the scheduler wants requests_out to converge.
    pub next_requests: HashSet<BlockInfo>,

    // Multiset of chunks we will accept without calling them unexpected.
    // Covers requests that were cancelled but may still arrive.
    pub valid_receive: HashMap<BlockInfo, u32>,

    // Metadata pieces we have asked this peer for.
    pub metadata_requests: Bitfield,

    // Pieces we have announced to this peer.
    pub sent_haves: HashSet<usize>,

    // The remote's side.
    pub peer_choking: bool,
    pub peer_interested: bool,

    // Block requests the peer has open against us; data fills in when the
    // storage read lands.
    pub peer_requests: HashMap<BlockInfo, Option<Vec<u8>>>,

    pub peer_listen_port: Option<u16>,
    pub peer_prefers_encryption: bool,
    pub peer_client_name: Option<String>,

    // Extension name -> the id the peer wants us to use when addressing it.
    pub peer_extension_ids: HashMap<String, u8>,

    // Outstanding-request cap the peer advertised (reqq), or our default.
    pub peer_max_requests: usize,

    // What the peer has: explicit bits, or the have-all flag. Never both.
    pub bitfield: Bitfield,
    pub sent_have_all: bool,

    // Lower bound on the number of pieces in the torrent implied by this
    // peer's messages; meaningful before we have the info.
    pub peer_min_pieces: usize,

    // Pieces this peer has contributed unverified data to.
    pub touched_pieces: HashSet<usize>,

    // Pieces we may request even while choked (fast extension).
    pub allowed_fast: HashSet<usize>,

    pub piece_order: PieceOrder,

    // Blocks received since the scheduler last rebuilt next_requests, and
    // the high-water mark used to size the in-flight window.
    pub blocks_received_since_update: u64,
    pub max_blocks_received_between_updates: u64,

    // Control messages waiting for the writer task.
    pub out_queue: VecDeque<Message>,

    // Wakes the writer when out_queue or any sendable state changes.
    pub write_notify: Arc<Notify>,

    // Wakes the reader so it can observe the closed flag.
    pub shutdown: Arc<Notify>,

    // Set exactly once; all teardown happens with the same lock hold.
    pub closed: bool,

    // Position in the torrent's pex history this peer has been told about.
    pub pex_cursor: usize,
    pub last_pex_share: Option<Instant>,

    pub stats: PeerStats,

}

impl Peer {

    pub fn new(conn: ConnInfo, default_reqq: usize) -> Self {
        let now = Instant::now();
        Self {
            conn,
            completed_handshake: now,
            last_message_received: now,
            last_useful_chunk_received: None,
            last_chunk_sent: None,
            last_became_interested: None,
            last_started_expecting: None,
            prior_interest: Duration::ZERO,
            cumulative_expected_to_receive: Duration::ZERO,
            chunks_received_while_expecting: 0,
            am_interested: false,
            am_choking: true,
            requests_out: HashSet::new(),
            next_requests: HashSet::new(),
            valid_receive: HashMap::new(),
            metadata_requests: Bitfield::new(),
            sent_haves: HashSet::new(),
            peer_choking: true,
            peer_interested: false,
            peer_requests: HashMap::new(),
            peer_listen_port: None,
            peer_prefers_encryption: false,
            peer_client_name: None,
            peer_extension_ids: HashMap::new(),
            peer_max_requests: default_reqq,
            bitfield: Bitfield::new(),
            sent_have_all: false,
            peer_min_pieces: 0,
            touched_pieces: HashSet::new(),
            allowed_fast: HashSet::new(),
            piece_order: PieceOrder::new(),
            blocks_received_since_update: 0,
            max_blocks_received_between_updates: 0,
            out_queue: VecDeque::new(),
            write_notify: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
            closed: false,
            pex_cursor: 0,
            last_pex_share: None,
            stats: PeerStats::default(),
        }
    }

    pub fn supports_extension(&self, name: &str) -> bool {
        self.peer_extension_ids.contains_key(name)
    }

    pub fn peer_has(&self, piece_idx: usize) -> bool {
        self.sent_have_all || self.bitfield.get(piece_idx).map(|b| *b).unwrap_or(false)
    }

    pub fn peer_num_pieces(&self) -> usize {
        if self.sent_have_all {
            self.peer_min_pieces
        } else {
            self.bitfield.count_ones()
        }
    }

    // The request for this piece is dead in the water: the peer is choking
    // us and has not allowed the piece through the fast set.
    pub fn remote_choking_piece(&self, piece_idx: usize) -> bool {
        self.peer_choking && !self.allowed_fast.contains(&piece_idx)
    }

    pub fn expecting_chunks(&self) -> bool {
        self.am_interested
            && !self.requests_out.is_empty()
            && self
                .requests_out
                .iter()
                .any(|r| !self.remote_choking_piece(r.piece_idx))
    }

    // Folds expectation-window transitions into the accumulators. Call
    // after any mutation that could flip expecting_chunks().
    pub fn update_expecting(&mut self, now: Instant) {
        let expecting = self.expecting_chunks();
        match (self.last_started_expecting, expecting) {
            (None, true) => self.last_started_expecting = Some(now),
            (Some(since), false) => {
                self.cumulative_expected_to_receive += now.saturating_duration_since(since);
                self.last_started_expecting = None;
            }
            _ => {}
        }
    }

    // In-flight window: twice the best burst observed between scheduler
    // updates, within [1, peer's advertised cap].
    pub fn nominal_max_requests(&self) -> usize {
        (2 * self.max_blocks_received_between_updates as usize)
            .clamp(1, self.peer_max_requests.max(1))
    }

    // Queue a control message for the writer. Callers notify after the
    // lock drops; notifying under it is also fine, Notify never blocks.
    pub fn queue_message(&mut self, msg: Message) {
        self.out_queue.push_back(msg);
        self.write_notify.notify_one();
    }

    // Flips our interest, emitting at most one wire message per actual
    // transition.
    pub fn set_interested(&mut self, interested: bool, now: Instant) -> bool {
        if self.am_interested == interested {
            return false;
        }
        self.am_interested = interested;
        if interested {
            self.last_became_interested = Some(now);
            self.queue_message(Message::Interested);
        } else {
            if let Some(since) = self.last_became_interested {
                self.prior_interest += now.saturating_duration_since(since);
            }
            self.queue_message(Message::NotInterested);
        }
        self.update_expecting(now);
        true
    }

    // Direction-preference for duplicate connections to one peer: the
    // endpoint with the numerically smaller id should be the dialer, then
    // tcp beats utp, then ipv6 beats ipv4.
    fn preference_key(&self, local_id: &[u8; 20]) -> (bool, bool, bool) {
        let should_dial = local_id < &self.conn.remote_id;
        (
            self.conn.outgoing == should_dial,
            self.conn.network != Network::Utp,
            self.conn.remote_addr.is_ipv6(),
        )
    }

    pub fn has_preferred_network_over(&self, other: &Peer, local_id: &[u8; 20]) -> bool {
        self.preference_key(local_id) > other.preference_key(local_id)
    }

    // Retention ordering under churn: trusted first, then by verified
    // contribution.
    pub fn connection_trust(&self) -> (bool, i64) {
        (self.conn.trusted, self.stats.net_good_pieces_dirtied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::message::Message;

    pub(crate) fn conn_info(addr: &str, outgoing: bool) -> ConnInfo {
        ConnInfo {
            remote_addr: addr.parse().unwrap(),
            network: Network::Tcp,
            outgoing,
            source: PeerSource::Tracker,
            trusted: false,
            crypto: CryptoInfo::default(),
            remote_id: [5; 20],
            fast: true,
            extended: true,
        }
    }

    #[test]
    fn test_initial_flags() {
        let peer = Peer::new(conn_info("10.0.0.1:6881", true), 64);
        assert!(peer.am_choking);
        assert!(!peer.am_interested);
        assert!(peer.peer_choking);
        assert!(!peer.peer_interested);
    }

    #[test]
    fn test_peer_has_forms() {
        let mut peer = Peer::new(conn_info("10.0.0.1:6881", true), 64);
        assert!(!peer.peer_has(3));
        peer.bitfield.resize(8, false);
        peer.bitfield.set(3, true);
        assert!(peer.peer_has(3));
        peer.bitfield.fill(false);
        peer.sent_have_all = true;
        assert!(peer.peer_has(7));
        assert!(peer.peer_has(7000));
    }

    #[test]
    fn test_set_interested_emits_once() {
        let mut peer = Peer::new(conn_info("10.0.0.1:6881", true), 64);
        let now = Instant::now();
        assert!(peer.set_interested(true, now));
        assert!(!peer.set_interested(true, now));
        assert_eq!(peer.out_queue.len(), 1);
        assert_eq!(peer.out_queue[0], Message::Interested);

        assert!(peer.set_interested(false, now));
        assert!(!peer.set_interested(false, now));
        assert_eq!(peer.out_queue.len(), 2);
    }

    #[test]
    fn test_expecting_chunks() {
        let mut peer = Peer::new(conn_info("10.0.0.1:6881", true), 64);
        let r = BlockInfo { piece_idx: 1, offset: 0, len: 0x4000 };
        peer.am_interested = true;
        peer.requests_out.insert(r);

        // Choked with no allowed-fast carve-out: not expecting.
        assert!(!peer.expecting_chunks());
        peer.allowed_fast.insert(1);
        assert!(peer.expecting_chunks());
        peer.allowed_fast.clear();
        peer.peer_choking = false;
        assert!(peer.expecting_chunks());
    }

    #[test]
    fn test_expecting_accumulator() {
        let mut peer = Peer::new(conn_info("10.0.0.1:6881", true), 64);
        let r = BlockInfo { piece_idx: 0, offset: 0, len: 0x4000 };
        peer.am_interested = true;
        peer.peer_choking = false;
        peer.requests_out.insert(r);

        let t0 = Instant::now();
        peer.update_expecting(t0);
        assert!(peer.last_started_expecting.is_some());

        peer.requests_out.clear();
        peer.update_expecting(t0 + Duration::from_secs(3));
        assert!(peer.last_started_expecting.is_none());
        assert_eq!(peer.cumulative_expected_to_receive, Duration::from_secs(3));
    }

    #[test]
    fn test_nominal_max_requests_clamps() {
        let mut peer = Peer::new(conn_info("10.0.0.1:6881", true), 64);
        assert_eq!(peer.nominal_max_requests(), 1);
        peer.max_blocks_received_between_updates = 10;
        assert_eq!(peer.nominal_max_requests(), 20);
        peer.peer_max_requests = 16;
        assert_eq!(peer.nominal_max_requests(), 16);
    }

    #[test]
    fn test_connection_preference() {
        let local = [1u8; 20];

        // Remote id is larger, so we should be the dialer.
        let ours = Peer::new(conn_info("10.0.0.1:6881", true), 64);
        let theirs = Peer::new(conn_info("10.0.0.1:6882", false), 64);
        assert!(ours.has_preferred_network_over(&theirs, &local));
        assert!(!theirs.has_preferred_network_over(&ours, &local));

        // Same direction preference; ipv6 breaks the tie.
        let v6 = Peer::new(conn_info("[::1]:6881", true), 64);
        assert!(v6.has_preferred_network_over(&ours, &local));

        // utp loses to tcp ahead of the address family.
        let mut utp6 = Peer::new(conn_info("[::1]:6881", true), 64);
        utp6.conn.network = Network::Utp;
        assert!(ours.has_preferred_network_over(&utp6, &local));
    }
}
