use crate::BLOCK_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    // Index of piece that the block is contained in.
    pub piece_idx: usize,

    // Offset in bytes of block within piece.
    pub offset: usize,

    // Data of block. May be a pooled buffer; give it back to the torrent's
    // block pool once written out.
    pub data: Vec<u8>,
}

impl BlockData {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            piece_idx: self.piece_idx,
            offset: self.offset,
            len: self.data.len(),
        }
    }
}

#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct BlockInfo {

    pub piece_idx: usize,

    pub offset: usize,

    pub len: usize,

}

impl BlockInfo {
    #[inline]
    pub fn idx_in_piece(&self) -> usize {
        self.offset / BLOCK_SIZE
    }
}

impl std::fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ piece: {}, offset: {}, len: {} }}", self.piece_idx, self.offset, self.len)
    }
}

pub fn block_len(piece_len: usize, block_idx: usize) -> usize {
    BLOCK_SIZE.min(piece_len - (block_idx * BLOCK_SIZE))
}

pub fn num_blocks(piece_len: usize) -> u32 {
    ((piece_len + (BLOCK_SIZE - 1)) / BLOCK_SIZE) as u32
}

// Maps an absolute byte offset within the torrent to the request covering it.
// Out-of-range offsets (negative, or at/past the total length) yield nothing.
pub fn offset_to_request(
    total_len: u64,
    piece_len: usize,
    block_size: usize,
    offset: i64,
) -> Option<BlockInfo> {

    if offset < 0 || offset as u64 >= total_len || piece_len == 0 {
        return None;
    }

    let offset = offset as u64;
    let piece_idx = (offset / piece_len as u64) as usize;
    let in_piece = (offset % piece_len as u64) as usize;
    let begin = in_piece - (in_piece % block_size);

    // The final piece may be short, and its final block shorter still.
    let piece_total_offset = piece_idx as u64 * piece_len as u64;
    let this_piece_len = piece_len.min((total_len - piece_total_offset) as usize);

    Some(BlockInfo {
        piece_idx,
        offset: begin,
        len: block_size.min(this_piece_len - begin),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_len() {
        let normal_piece_len = 32_768;
        let last_piece_len = 24_930;
        let normal_block_len = 16_384;
        let last_block_len = 8546;
        assert_eq!(block_len(normal_piece_len, 0), normal_block_len);
        assert_eq!(block_len(normal_piece_len, 1), normal_block_len);
        assert_eq!(block_len(last_piece_len, 0), normal_block_len);
        assert_eq!(block_len(last_piece_len, 1), last_block_len);
    }

    #[test]
    fn test_num_blocks() {
        (0..12)
            .into_iter()
            .for_each(|i| assert_eq!(num_blocks(BLOCK_SIZE * i), i as u32));
        assert_eq!(num_blocks(BLOCK_SIZE + 500), 2);
        assert_eq!(num_blocks(BLOCK_SIZE * 5 + 1000), 6);
        assert_eq!(num_blocks(0), 0);
    }

    #[test]
    fn test_offset_to_request() {
        let total = 472_183_431;
        let piece = 262_144;
        let block = 16_384;

        assert_eq!(offset_to_request(total, piece, block, -1), None);
        assert_eq!(offset_to_request(total, piece, block, 472 * (1 << 20)), None);
        assert_eq!(
            offset_to_request(total, piece, block, 0),
            Some(BlockInfo { piece_idx: 0, offset: 0, len: 16_384 }),
        );
        assert_eq!(
            offset_to_request(total, piece, block, 16_383),
            Some(BlockInfo { piece_idx: 0, offset: 0, len: 16_384 }),
        );
        assert_eq!(
            offset_to_request(total, piece, block, 16_384),
            Some(BlockInfo { piece_idx: 0, offset: 16_384, len: 16_384 }),
        );
        assert_eq!(
            offset_to_request(total, piece, block, (1 << 18) - 1),
            Some(BlockInfo { piece_idx: 0, offset: (1 << 18) - 16_384, len: 16_384 }),
        );
    }

    #[test]
    fn test_offset_to_request_short_tail() {
        // 472,183,431 bytes at 256 KiB pieces leaves a 62,087 byte final
        // piece whose final block is 12,935 bytes.
        let total: u64 = 472_183_431;
        let piece = 262_144;
        let block = 16_384;

        let last = offset_to_request(total, piece, block, total as i64 - 1).unwrap();
        assert_eq!(last.piece_idx, 1801);
        assert_eq!(last.offset, 3 * 16_384);
        assert_eq!(last.len, 12_935);
    }
}
