pub mod message;
pub mod peer;
pub mod reader;
pub mod requests;
pub mod session;
pub mod writer;

pub type Result<T> = std::result::Result<T, PeerError>;

// Arena key for a connection within its torrent. Ids are never reused for
// the life of the torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("piece index {0} out of range")]
    InvalidPieceIndex(usize),

    #[error("bitfield length {got} does not cover {expected} pieces")]
    BadBitfieldLength { got: usize, expected: usize },

    #[error("fast extension message while fast is not enabled")]
    FastDisabled,

    #[error("extended message while extension protocol is not enabled")]
    ExtendedDisabled,

    #[error("request {0} outside piece bounds")]
    BadRequestBounds(crate::block::BlockInfo),

    #[error("chunk {0} was not expected")]
    UnexpectedChunk(crate::block::BlockInfo),

    #[error("malformed extended handshake")]
    BadExtendedHandshake,

    #[error("connection closed")]
    Closed,

    #[error("connection timeout")]
    Timeout,

}
