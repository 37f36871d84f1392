use std::sync::Mutex;
use rand::seq::SliceRandom;

// Reusable payload buffers for inbound piece data, one pool per torrent.
// The decoder borrows a buffer for each full-size block payload; whoever
// ends up owning the bytes puts them back once written out. Short tail
// blocks use throwaway allocations and never enter the pool.
#[derive(Debug)]
pub struct BlockPool {
    block_size: usize,
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl BlockPool {

    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            bufs: Mutex::new(Vec::new()),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn take(&self, len: usize) -> Vec<u8> {
        if len == self.block_size {
            if let Some(buf) = self.bufs.lock().unwrap().pop() {
                return buf;
            }
        }
        vec![0; len]
    }

    // Accepts the buffer back iff it is exactly one full block.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() == self.block_size {
            self.bufs.lock().unwrap().push(buf);
        }
    }

    #[cfg(test)]
    pub fn pooled(&self) -> usize {
        self.bufs.lock().unwrap().len()
    }
}

// Free list of per-peer piece orderings. Each connected peer holds one
// random-but-stable permutation used to break priority ties, returned here
// on close so churn does not allocate.
#[derive(Debug, Default)]
pub struct InclinationPool {
    free: Vec<Vec<u32>>,
}

impl InclinationPool {

    pub fn get(&mut self, num_pieces: usize) -> Vec<u32> {
        if let Some(perm) = self.free.pop() {
            if perm.len() == num_pieces {
                return perm;
            }
        }
        let mut perm: Vec<u32> = (0..num_pieces as u32).collect();
        perm.shuffle(&mut rand::thread_rng());
        perm
    }

    pub fn put(&mut self, perm: Vec<u32>) {
        if !perm.is_empty() {
            self.free.push(perm);
        }
    }
}
