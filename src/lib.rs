#![allow(dead_code)]

mod block;
mod config;
mod disk;
mod ext;
mod limiter;
mod p2p;
mod picker;
mod pool;
mod stats;
mod torrent;

#[cfg(test)]
mod tests;

// Sub-piece transfer unit. Peers may advertise a different maximum request
// size, but every mainstream client requests in 16 KiB blocks.
pub const BLOCK_SIZE: usize = 0x4000;

// Largest wire frame we will accept before failing the connection.
pub const MAX_FRAME_LEN: usize = 0x40000;

pub type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub use block::{block_len, num_blocks, offset_to_request, BlockData, BlockInfo};
pub use config::Config;
pub use disk::{DiskCommand, DiskRx, DiskTx};
pub use limiter::{RateLimiter, Unlimited};
pub use p2p::{
    message::{Message, MessageCodec},
    peer::{ConnInfo, CryptoInfo, CryptoMethod, Network, Peer, PeerSource},
    session::{PeerHandle, PeerSession},
    PeerError, PeerId,
};
pub use picker::Priority;
pub use stats::PeerStats;
pub use torrent::{
    Callbacks, PartialPiece, PieceTable, TorrentContext, TorrentError, TorrentParams,
    TorrentState,
};
