//! Lamport stamps and last-writer-wins registers.
//!
//! Every local mutation ticks the document's Lamport clock and stamps the
//! fields it writes. Remote writes carry their own stamp; a write wins when
//! its lamport is higher, with the replica id as a deterministic tiebreak.

use serde::{Deserialize, Serialize};

use quire_types::ReplicaId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub lamport: u64,
    pub replica: ReplicaId,
}

impl Stamp {
    pub fn new(lamport: u64, replica: ReplicaId) -> Self {
        Self { lamport, replica }
    }

    /// Does a write stamped `self` replace one stamped `other`?
    pub fn wins_over(&self, other: &Stamp) -> bool {
        self.lamport > other.lamport
            || (self.lamport == other.lamport && self.replica > other.replica)
    }
}

/// A value plus the stamp of the write that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lww<T> {
    pub value: T,
    pub stamp: Stamp,
}

impl<T> Lww<T> {
    pub fn new(value: T, stamp: Stamp) -> Self {
        Self { value, stamp }
    }

    pub fn set(&mut self, value: T, stamp: Stamp) {
        self.value = value;
        self.stamp = stamp;
    }

    /// Apply a remote write if it wins. Returns whether the value changed hands.
    pub fn merge(&mut self, value: T, stamp: Stamp) -> bool {
        if stamp.wins_over(&self.stamp) {
            self.value = value;
            self.stamp = stamp;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_lamport_wins() {
        let r = ReplicaId::new();
        let mut reg = Lww::new("a", Stamp::new(5, r));
        assert!(!reg.merge("b", Stamp::new(4, r)));
        assert_eq!(reg.value, "a");
        assert!(reg.merge("c", Stamp::new(6, r)));
        assert_eq!(reg.value, "c");
    }

    #[test]
    fn replica_breaks_ties() {
        let low = ReplicaId::nil();
        let high = ReplicaId::new();
        let mut reg = Lww::new(1, Stamp::new(3, low));
        assert!(reg.merge(2, Stamp::new(3, high)));
        assert!(!reg.merge(3, Stamp::new(3, low)));
        assert_eq!(reg.value, 2);
    }
}
