use tokio::sync::{mpsc, oneshot};
use crate::block::{BlockData, BlockInfo};

pub type DiskTx = mpsc::UnboundedSender<DiskCommand>;
pub type DiskRx = mpsc::UnboundedReceiver<DiskCommand>;

pub type ReadResult = std::io::Result<Vec<u8>>;

// The write reply hands the payload buffer back so the connection core can
// return it to the torrent's block pool.
pub type WriteResult = (Vec<u8>, std::io::Result<()>);

// Commands to the storage collaborator. The connection core never touches
// files itself; it round-trips blocks through this channel and gets hash
// verdicts back via `TorrentContext::piece_hashed`.
pub enum DiskCommand {

    // A peer asked us for a block; reply with the bytes.
    ReadBlock {
        block: BlockInfo,
        tx: oneshot::Sender<ReadResult>,
    },

    // A block arrived from a peer and needs to be persisted.
    WriteBlock {
        block: BlockData,
        tx: oneshot::Sender<WriteResult>,
    },

    // Every block of the piece has been written; verify its hash.
    CheckPiece {
        piece_idx: usize,
    },

}
