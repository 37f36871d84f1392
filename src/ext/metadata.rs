use serde_derive::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use crate::Bitfield;
use super::bencode_len;

// Metadata transfers in fixed 16 KiB pieces regardless of the torrent's
// block size.
pub const METADATA_PIECE_SIZE: usize = 0x4000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetadataError {

    #[error("metadata size {0} exceeds cap {1}")]
    TooLarge(usize, usize),

    #[error("metadata size {0} conflicts with previously set {1}")]
    SizeMismatch(usize, usize),

    #[error("invalid metadata message")]
    InvalidMessage,

    #[error("metadata piece {0} out of range")]
    PieceOutOfRange(usize),

}

// The three ut_metadata message kinds. On the wire each is a bencoded
// dictionary; data messages carry the raw piece bytes immediately after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMsg {
    Request(usize),
    Data {
        piece: usize,
        total_size: usize,
        payload: Vec<u8>,
    },
    Reject(usize),
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataDict {

    msg_type: i64,

    piece: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_size: Option<i64>,

}

impl MetadataMsg {

    pub fn to_bytes(&self) -> Vec<u8> {
        let (dict, payload) = match self {
            MetadataMsg::Request(piece) => (
                MetadataDict { msg_type: 0, piece: *piece as i64, total_size: None },
                None,
            ),
            MetadataMsg::Data { piece, total_size, payload } => (
                MetadataDict {
                    msg_type: 1,
                    piece: *piece as i64,
                    total_size: Some(*total_size as i64),
                },
                Some(payload),
            ),
            MetadataMsg::Reject(piece) => (
                MetadataDict { msg_type: 2, piece: *piece as i64, total_size: None },
                None,
            ),
        };
        let mut buf = serde_bencode::to_bytes(&dict).expect("metadata dict serializes");
        if let Some(payload) = payload {
            buf.extend_from_slice(payload);
        }
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, MetadataError> {
        let dict_len = bencode_len(buf).ok_or(MetadataError::InvalidMessage)?;
        let dict: MetadataDict = serde_bencode::from_bytes(&buf[..dict_len])
            .map_err(|_| MetadataError::InvalidMessage)?;
        if dict.piece < 0 {
            return Err(MetadataError::InvalidMessage);
        }
        let piece = dict.piece as usize;

        match dict.msg_type {
            0 => Ok(MetadataMsg::Request(piece)),
            1 => Ok(MetadataMsg::Data {
                piece,
                total_size: dict.total_size.unwrap_or(0).max(0) as usize,
                payload: buf[dict_len..].to_vec(),
            }),
            2 => Ok(MetadataMsg::Reject(piece)),
            _ => Err(MetadataError::InvalidMessage),
        }
    }
}

// Assembly buffer for an info dictionary arriving over ut_metadata. The
// size is learned from extension handshakes; bytes fill in piece by piece
// and the whole is checked against the info-hash before being surfaced.
#[derive(Debug, Default)]
pub struct MetadataStore {

    size: usize,

    have: Bitfield,

    bytes: Vec<u8>,

    complete: bool,

}

impl MetadataStore {

    // Seeds the store from already-known info bytes (torrent opened from a
    // metainfo file rather than a magnet link).
    pub fn from_info_bytes(bytes: Vec<u8>) -> Self {
        let size = bytes.len();
        let mut have = Bitfield::new();
        have.resize(piece_count(size), true);
        Self { size, have, bytes, complete: true }
    }

    pub fn size(&self) -> Option<usize> {
        if self.size == 0 { None } else { Some(self.size) }
    }

    // First metadata_size observation wins; later ones must agree.
    pub fn set_size(&mut self, size: usize, cap: usize) -> Result<bool, MetadataError> {
        if size == 0 || self.complete {
            return Ok(false);
        }
        if size > cap {
            return Err(MetadataError::TooLarge(size, cap));
        }
        if self.size != 0 {
            if self.size != size {
                return Err(MetadataError::SizeMismatch(size, self.size));
            }
            return Ok(false);
        }
        self.size = size;
        self.bytes = vec![0; size];
        self.have.resize(piece_count(size), false);
        Ok(true)
    }

    pub fn piece_count(&self) -> usize {
        piece_count(self.size)
    }

    pub fn piece_len(&self, piece_idx: usize) -> usize {
        METADATA_PIECE_SIZE.min(self.size - piece_idx * METADATA_PIECE_SIZE)
    }

    pub fn have_piece(&self, piece_idx: usize) -> bool {
        self.have.get(piece_idx).map(|b| *b).unwrap_or(false)
    }

    pub fn have_all(&self) -> bool {
        self.size != 0 && self.have.all()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn missing_pieces(&self) -> Vec<usize> {
        self.have.iter_zeros().collect()
    }

    pub fn piece_data(&self, piece_idx: usize) -> Option<&[u8]> {
        if !self.complete && !self.have_piece(piece_idx) {
            return None;
        }
        let start = piece_idx * METADATA_PIECE_SIZE;
        let end = (start + METADATA_PIECE_SIZE).min(self.size);
        self.bytes.get(start..end)
    }

    pub fn write_piece(&mut self, piece_idx: usize, data: &[u8]) -> Result<(), MetadataError> {
        if piece_idx >= self.piece_count() {
            return Err(MetadataError::PieceOutOfRange(piece_idx));
        }
        if data.len() != self.piece_len(piece_idx) {
            return Err(MetadataError::InvalidMessage);
        }
        let start = piece_idx * METADATA_PIECE_SIZE;
        self.bytes[start..start + data.len()].copy_from_slice(data);
        self.have.set(piece_idx, true);
        Ok(())
    }

    // Once every piece is in, the assembly either matches the info-hash or
    // gets thrown away wholesale.
    pub fn verify(&mut self, info_hash: [u8; 20]) -> bool {
        debug_assert!(self.have_all());
        let digest: [u8; 20] = Sha1::digest(&self.bytes).into();
        if digest == info_hash {
            self.complete = true;
            true
        } else {
            self.have.fill(false);
            self.bytes.iter_mut().for_each(|b| *b = 0);
            false
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

fn piece_count(size: usize) -> usize {
    (size + METADATA_PIECE_SIZE - 1) / METADATA_PIECE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_round_trip() {
        let msgs = [
            MetadataMsg::Request(3),
            MetadataMsg::Reject(0),
            MetadataMsg::Data { piece: 1, total_size: 40_000, payload: vec![0xab; 100] },
        ];
        for msg in msgs {
            let bytes = msg.to_bytes();
            assert_eq!(MetadataMsg::from_bytes(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_store_sizes() {
        let mut store = MetadataStore::default();
        assert!(store.set_size(METADATA_PIECE_SIZE * 2 + 100, 1 << 24).unwrap());
        assert_eq!(store.piece_count(), 3);
        assert_eq!(store.piece_len(0), METADATA_PIECE_SIZE);
        assert_eq!(store.piece_len(2), 100);
        assert_eq!(store.missing_pieces(), vec![0, 1, 2]);

        // Re-observing the same size is a no-op; a different one is not.
        assert!(!store.set_size(METADATA_PIECE_SIZE * 2 + 100, 1 << 24).unwrap());
        assert!(matches!(
            store.set_size(17, 1 << 24),
            Err(MetadataError::SizeMismatch(17, _)),
        ));
    }

    #[test]
    fn test_store_rejects_oversize() {
        let mut store = MetadataStore::default();
        assert!(matches!(
            store.set_size(1 << 25, 1 << 24),
            Err(MetadataError::TooLarge(..)),
        ));
    }

    #[test]
    fn test_verify_failure_resets() {
        let info = vec![7u8; METADATA_PIECE_SIZE + 10];
        let mut store = MetadataStore::default();
        store.set_size(info.len(), 1 << 24).unwrap();
        store.write_piece(0, &info[..METADATA_PIECE_SIZE]).unwrap();
        store.write_piece(1, &info[METADATA_PIECE_SIZE..]).unwrap();
        assert!(store.have_all());

        assert!(!store.verify([0; 20]));
        assert!(!store.have_all());
        assert!(store.bytes().iter().all(|&b| b == 0));

        store.write_piece(0, &info[..METADATA_PIECE_SIZE]).unwrap();
        store.write_piece(1, &info[METADATA_PIECE_SIZE..]).unwrap();
        let digest: [u8; 20] = Sha1::digest(&info).into();
        assert!(store.verify(digest));
        assert!(store.is_complete());
        assert_eq!(store.bytes(), &info[..]);
    }
}
