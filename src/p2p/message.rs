use std::sync::Arc;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{block, pool::BlockPool, Bitfield};
use super::PeerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {

    // Advises the peer the connection is still live even when idle.
    KeepAlive,

    // No further requests from the peer will be satisfied.
    Choke,

    // Requests from the peer will be served again.
    Unchoke,

    // We want to request blocks from the peer.
    Interested,

    // We no longer want to request blocks.
    NotInterested,

    // The sender acquired the piece at this index.
    Have { idx: u32 },

    // Complete piece map, sent once directly after the handshake.
    Bitfield(Bitfield),

    // Ask for one block of a piece.
    Request(block::BlockInfo),

    // One block of piece data.
    Block(block::BlockData),

    // Withdraw an earlier request.
    Cancel(block::BlockInfo),

    // DHT listen port advertisement.
    Port { port: u16 },

    // Fast extension: piece the sender thinks we should fetch.
    Suggest { idx: u32 },

    // Fast extension: replaces an all-ones bitfield.
    HaveAll,

    // Fast extension: replaces an all-zeroes bitfield.
    HaveNone,

    // Fast extension: explicit refusal of a request.
    Reject(block::BlockInfo),

    // Fast extension: piece we may request even while choked.
    AllowedFast { idx: u32 },

    // Extension-protocol envelope: negotiated id plus opaque payload.
    Extended { id: u8, payload: Vec<u8> },

}

impl Message {
    pub fn is_fast(&self) -> bool {
        matches!(
            self,
            Message::Suggest { .. }
                | Message::HaveAll
                | Message::HaveNone
                | Message::Reject(_)
                | Message::AllowedFast { .. }
        )
    }
}

mod id {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
    pub const PORT: u8 = 9;
    pub const SUGGEST: u8 = 13;
    pub const HAVE_ALL: u8 = 14;
    pub const HAVE_NONE: u8 = 15;
    pub const REJECT: u8 = 16;
    pub const ALLOWED_FAST: u8 = 17;
    pub const EXTENDED: u8 = 20;
}

pub struct MessageCodec {

    // Pool for full-size block payloads; short tails allocate.
    pool: Arc<BlockPool>,

    max_frame_len: usize,

}

impl MessageCodec {
    pub fn new(pool: Arc<BlockPool>, max_frame_len: usize) -> Self {
        Self { pool, max_frame_len }
    }
}

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            Message::KeepAlive => dst.put_u32(0),

            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(id::CHOKE);
            },

            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(id::UNCHOKE);
            },

            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(id::INTERESTED);
            },

            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(id::NOT_INTERESTED);
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(id::HAVE);
                dst.put_u32(idx);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.as_raw_slice();
                dst.put_u32(1 + bytes.len() as u32);
                dst.put_u8(id::BITFIELD);
                dst.extend_from_slice(bytes);
            },

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(id::REQUEST);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Block(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(id::PIECE);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(&block.data);
            },

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(id::CANCEL);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // port: <len=0003><id=9><listen-port>
            Message::Port { port } => {
                dst.put_u32(3);
                dst.put_u8(id::PORT);
                dst.put_u16(port);
            },

            Message::Suggest { idx } => {
                dst.put_u32(5);
                dst.put_u8(id::SUGGEST);
                dst.put_u32(idx);
            },

            Message::HaveAll => {
                dst.put_u32(1);
                dst.put_u8(id::HAVE_ALL);
            },

            Message::HaveNone => {
                dst.put_u32(1);
                dst.put_u8(id::HAVE_NONE);
            },

            Message::Reject(block) => {
                dst.put_u32(13);
                dst.put_u8(id::REJECT);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            Message::AllowedFast { idx } => {
                dst.put_u32(5);
                dst.put_u8(id::ALLOWED_FAST);
                dst.put_u32(idx);
            },

            // extended: <len=0002+X><id=20><ext id><payload>
            Message::Extended { id: ext_id, payload } => {
                dst.put_u32(2 + payload.len() as u32);
                dst.put_u8(id::EXTENDED);
                dst.put_u8(ext_id);
                dst.extend_from_slice(&payload);
            },
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        // Can't read message length.
        if src.remaining() < 4 { return Ok(None); }

        let mut peeker = std::io::Cursor::new(&src);
        let msg_len = peeker.get_u32() as usize;

        if msg_len > self.max_frame_len {
            return Err(PeerError::FrameTooLarge(msg_len));
        }

        if src.remaining() >= 4 + msg_len {
            src.advance(4);
            if msg_len == 0 { return Ok(Some(Message::KeepAlive)); }
        } else {
            // Haven't received all of message.
            return Ok(None);
        }

        let type_id = src.get_u8();

        // A frame whose length disagrees with its type would desync the
        // stream; fail the connection instead.
        let length_ok = match type_id {
            id::CHOKE | id::UNCHOKE | id::INTERESTED | id::NOT_INTERESTED
            | id::HAVE_ALL | id::HAVE_NONE => msg_len == 1,
            id::HAVE | id::SUGGEST | id::ALLOWED_FAST => msg_len == 5,
            id::REQUEST | id::CANCEL | id::REJECT => msg_len == 13,
            id::PORT => msg_len == 3,
            id::PIECE => msg_len >= 9,
            id::EXTENDED => msg_len >= 2,
            id::BITFIELD => true,
            _ => true,
        };
        if !length_ok {
            return Err(PeerError::InvalidMessage);
        }

        let msg = match type_id {
            id::CHOKE => Message::Choke,
            id::UNCHOKE => Message::Unchoke,
            id::INTERESTED => Message::Interested,
            id::NOT_INTERESTED => Message::NotInterested,
            id::HAVE => Message::Have { idx: src.get_u32() },
            id::BITFIELD => {
                let mut bitfield = vec![0; msg_len - 1];
                src.copy_to_slice(&mut bitfield);
                Message::Bitfield(Bitfield::from_vec(bitfield))
            },
            id::REQUEST => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Request(block::BlockInfo { piece_idx, offset, len })
            },
            id::PIECE => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let mut data = self.pool.take(msg_len - 9);
                src.copy_to_slice(&mut data);
                Message::Block(block::BlockData { piece_idx, offset, data })
            },
            id::CANCEL => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Cancel(block::BlockInfo { piece_idx, offset, len })
            },
            id::PORT => Message::Port { port: src.get_u16() },
            id::SUGGEST => Message::Suggest { idx: src.get_u32() },
            id::HAVE_ALL => Message::HaveAll,
            id::HAVE_NONE => Message::HaveNone,
            id::REJECT => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Reject(block::BlockInfo { piece_idx, offset, len })
            },
            id::ALLOWED_FAST => Message::AllowedFast { idx: src.get_u32() },
            id::EXTENDED => {
                let ext_id = src.get_u8();
                let mut payload = vec![0; msg_len - 2];
                src.copy_to_slice(&mut payload);
                Message::Extended { id: ext_id, payload }
            },
            other => {
                tracing::warn!("invalid message id: {}", other);
                return Err(PeerError::InvalidMessageId(other));
            }
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece idx: {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(f, "request for block {}", block),
            Message::Block(block) => write!(f, "block data {}", block.info()),
            Message::Cancel(block) => write!(f, "cancel for block {}", block),
            Message::Port { port } => write!(f, "port {}", port),
            Message::Suggest { idx } => write!(f, "suggest piece idx: {}", idx),
            Message::HaveAll => write!(f, "have all"),
            Message::HaveNone => write!(f, "have none"),
            Message::Reject(block) => write!(f, "reject for block {}", block),
            Message::AllowedFast { idx } => write!(f, "allowed fast piece idx: {}", idx),
            Message::Extended { id, payload } => {
                write!(f, "extended msg id: {}, {} bytes", id, payload.len())
            },
        }
    }
}
