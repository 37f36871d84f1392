use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

// Download urgency of a piece, as dictated by the owner's policy layer.
// `None` pieces are never entered into any peer's request order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    None,
    #[default]
    Normal,
    Readahead,
    Next,
    Now,
}

type OrderKey = (Reverse<u8>, u32, u32);

// Priority-ordered set of pieces a single peer can usefully serve us.
// Ties within a priority class break on the peer's inclination, a pooled
// random permutation that stays stable for the life of the connection so
// two peers with identical views request different pieces first.
#[derive(Debug, Default)]
pub struct PieceOrder {

    set: BTreeSet<OrderKey>,

    // Current key per piece, so a priority change can remove the stale
    // entry without a scan.
    keys: BTreeMap<u32, OrderKey>,

    inclination: Vec<u32>,

}

impl PieceOrder {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign_inclination(&mut self, perm: Vec<u32>) {
        self.inclination = perm;
    }

    pub fn take_inclination(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.inclination)
    }

    fn key(&self, piece_idx: usize, priority: Priority) -> OrderKey {
        let tie = self
            .inclination
            .get(piece_idx)
            .copied()
            .unwrap_or(piece_idx as u32);
        (Reverse(priority as u8), tie, piece_idx as u32)
    }

    // Sets or clears the piece's membership. Returns true iff membership
    // or position changed.
    pub fn update(&mut self, piece_idx: usize, priority: Option<Priority>) -> bool {
        let piece = piece_idx as u32;
        match priority {
            Some(priority) => {
                let key = self.key(piece_idx, priority);
                match self.keys.insert(piece, key) {
                    Some(old) if old == key => false,
                    Some(old) => {
                        self.set.remove(&old);
                        self.set.insert(key);
                        true
                    }
                    None => {
                        self.set.insert(key);
                        true
                    }
                }
            }
            None => match self.keys.remove(&piece) {
                Some(old) => {
                    self.set.remove(&old);
                    true
                }
                None => false,
            },
        }
    }

    pub fn contains(&self, piece_idx: usize) -> bool {
        self.keys.contains_key(&(piece_idx as u32))
    }

    // Pieces in request order: highest priority first, inclination within.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.set.iter().map(|&(_, _, piece)| piece as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn clear(&mut self) {
        self.set.clear();
        self.keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_classes_order_first() {
        let mut order = PieceOrder::new();
        order.assign_inclination(vec![3, 2, 1, 0]);
        assert!(order.update(0, Some(Priority::Normal)));
        assert!(order.update(1, Some(Priority::Now)));
        assert!(order.update(2, Some(Priority::Normal)));
        assert!(order.update(3, Some(Priority::Readahead)));

        // Now beats readahead beats normal; inclination breaks the
        // normal-class tie in favour of piece 2.
        let got: Vec<usize> = order.iter().collect();
        assert_eq!(got, vec![1, 3, 2, 0]);
    }

    #[test]
    fn test_update_reports_change() {
        let mut order = PieceOrder::new();
        order.assign_inclination(vec![0, 1]);
        assert!(order.update(0, Some(Priority::Normal)));
        assert!(!order.update(0, Some(Priority::Normal)));
        assert!(order.update(0, Some(Priority::Now)));
        assert!(order.update(0, None));
        assert!(!order.update(0, None));
        assert!(order.is_empty());
    }

    #[test]
    fn test_clear_drops_membership() {
        let mut order = PieceOrder::new();
        order.assign_inclination((0..8).collect());
        for i in 0..8 {
            order.update(i, Some(Priority::Normal));
        }
        assert_eq!(order.len(), 8);
        order.clear();
        assert!(order.is_empty());
        assert!(!order.contains(3));
    }
}
