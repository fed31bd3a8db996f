use std::fmt::{Debug, Formatter};
use crc::Crc;

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u64);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x?}", self.0)
    }
}
impl Checksum {
    pub fn new(checksum_base: u64, payload: &[u8]) -> Checksum {
        let hasher = Crc::<u64>::new(&crc::CRC_64_REDIS);
        let mut digest = hasher.digest();

        digest.update(&checksum_base.to_be_bytes());
        digest.update(payload);

        Checksum(
            digest.finalize()
        )
    }
}

/// Every frame sent over a connection carries a different checksum base: a counter that starts
///  at a random value and is incremented per frame.
pub struct ChecksumSequence {
    next: u64,
}
impl ChecksumSequence {
    pub fn new() -> ChecksumSequence {
        Self::starting_at(rand::random())
    }

    pub fn starting_at(next: u64) -> ChecksumSequence {
        ChecksumSequence { next }
    }

    pub fn next_base(&mut self) -> u64 {
        let result = self.next;
        self.next = self.next.wrapping_add(1);
        result
    }
}
