//! TS6 UID allocation.

use lattice_proto::ident::ServerId;
use std::sync::atomic::{AtomicU64, Ordering};

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Allocates 9-character user ids: our SID followed by a 6-character
/// base36 counter (`0LTAAAAAA`, `0LTAAAAAB`, ...). Counter wrap is a
/// non-issue: 36^6 sessions outlive any process.
pub struct UidAllocator {
    sid: ServerId,
    next: AtomicU64,
}

impl UidAllocator {
    pub fn new(sid: ServerId) -> Self {
        Self {
            sid,
            next: AtomicU64::new(0),
        }
    }

    pub fn sid(&self) -> &ServerId {
        &self.sid
    }

    /// Hand out the next UID.
    pub fn allocate(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let mut tail = [b'A'; 6];
        let mut n = n;
        for slot in tail.iter_mut().rev() {
            *slot = ALPHABET[(n % 36) as usize];
            n /= 36;
        }
        format!("{}{}", self.sid.as_str(), std::str::from_utf8(&tail).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_sequential_uids() {
        let alloc = UidAllocator::new(ServerId::parse("0LT").unwrap());
        assert_eq!(alloc.allocate(), "0LTAAAAAA");
        assert_eq!(alloc.allocate(), "0LTAAAAAB");
        assert_eq!(alloc.allocate(), "0LTAAAAAC");
    }

    #[test]
    fn base36_carry() {
        let alloc = UidAllocator::new(ServerId::parse("0LT").unwrap());
        for _ in 0..36 {
            alloc.allocate();
        }
        assert_eq!(alloc.allocate(), "0LTAAAABA");
    }
}
