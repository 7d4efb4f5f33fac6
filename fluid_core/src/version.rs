//! Lamport scalar versions for file revisions.
//!
//! A version is the triple `(pid, scalar, latest)`: `pid` is the replica
//! precedence (unique per replica), `scalar` is the revision counter, and
//! `latest` is the highest scalar this value has observed anywhere. The
//! total order is lexicographic on `(scalar, pid)`; `latest` never
//! participates in comparisons.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Version {
    pub pid: u64,
    pub scalar: u64,
    pub latest: u64,
}

impl Version {
    /// A root (unassigned) version owned by the given replica.
    pub fn new(pid: u64) -> Self {
        Version {
            pid,
            scalar: 0,
            latest: 0,
        }
    }

    /// Increments the observed-latest counter and returns the successor
    /// version. A `pid` of zero keeps the current owner.
    pub fn next(&mut self, pid: u64) -> Version {
        self.latest += 1;
        Version {
            pid: if pid == 0 { self.pid } else { pid },
            scalar: self.latest,
            latest: self.latest,
        }
    }

    /// Symmetric reconciliation: both versions end up with the maximum
    /// observed-latest of the pair.
    pub fn update(&mut self, other: &mut Version) {
        let latest = self.latest.max(other.latest);
        self.latest = latest;
        other.latest = latest;
    }

    /// A scalar of zero marks a version that has never been flushed.
    pub fn is_root(&self) -> bool {
        self.scalar == 0
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.scalar == other.scalar && self.pid == other.pid
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.scalar, self.pid).cmp(&(other.scalar, other.pid))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.scalar, self.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(scalar: u64, pid: u64) -> Version {
        Version {
            pid,
            scalar,
            latest: scalar,
        }
    }

    #[test]
    fn scalar_orders_before_pid() {
        assert!(version(8, 821923) < version(8, 821924));
        assert!(version(8, 821923) < version(9, 821923));
        assert!(version(8, 821923) > version(3, 821924));
    }

    #[test]
    fn equality_ignores_latest() {
        let mut a = version(4, 7);
        a.latest = 12;
        assert_eq!(a, version(4, 7));
        assert_ne!(a, version(4, 8));
    }

    #[test]
    fn next_bumps_latest_and_keeps_owner() {
        let mut v = Version::new(42);
        assert!(v.is_root());
        let first = v.next(0);
        assert_eq!(first.scalar, 1);
        assert_eq!(first.pid, 42);
        assert!(!first.is_root());
        let second = v.next(7);
        assert_eq!(second.scalar, 2);
        assert_eq!(second.pid, 7);
        assert_eq!(v.latest, 2);
    }

    #[test]
    fn update_is_symmetric() {
        let mut a = version(3, 1);
        let mut b = version(9, 2);
        a.update(&mut b);
        assert_eq!(a.latest, 9);
        assert_eq!(b.latest, 9);
        b.update(&mut a);
        assert_eq!(a.latest, 9);
        assert_eq!(b.latest, 9);
    }
}
