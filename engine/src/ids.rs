//! Time-ordered, lexicographically-sortable ids for entities and events.
//!
//! Entity ids must be "sortable lexicographically by creation time" (spec
//! §3.1). A random v4 UUID does not have that property; UUID6 reorders the
//! UUIDv1 timestamp fields so that string comparison order matches creation
//! order, same shape as a ULID but built on the RFC 4122 UUID layout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uuid6 {
    bytes: [u8; 16],
}

impl Uuid6 {
    fn from_int(mut int_val: u128, version: u8) -> Self {
        int_val &= !(0xC000_u128 << 48);
        int_val |= 0x8000_u128 << 48;
        int_val &= !(0xF000_u128 << 64);
        int_val |= (version as u128) << 76;
        Self {
            bytes: int_val.to_be_bytes(),
        }
    }

    pub fn as_u128(&self) -> u128 {
        u128::from_be_bytes(self.bytes)
    }

    pub fn timestamp(&self) -> u64 {
        let int_val = self.as_u128();
        let time_low = ((int_val >> 64) & 0x0FFF) as u64;
        let time_mid = ((int_val >> 80) & 0xFFFF) as u64;
        let time_high = ((int_val >> 96) & 0xFFFF_FFFF) as u64;
        (time_high << 28) | (time_mid << 12) | time_low
    }
}

impl std::fmt::Display for Uuid6 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3],
            self.bytes[4], self.bytes[5],
            self.bytes[6], self.bytes[7],
            self.bytes[8], self.bytes[9],
            self.bytes[10], self.bytes[11], self.bytes[12], self.bytes[13], self.bytes[14], self.bytes[15]
        )
    }
}

/// Generates a new id: time-ordered, monotonic within a process, unique across processes.
pub fn new_id() -> String {
    uuid6().to_string()
}

fn uuid6() -> Uuid6 {
    let nanoseconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    const UUID_EPOCH_OFFSET: u64 = 0x01b2_1dd2_1381_4000;
    let mut timestamp = nanoseconds / 100 + UUID_EPOCH_OFFSET;

    loop {
        let last = LAST_TIMESTAMP.load(Ordering::SeqCst);
        if timestamp <= last {
            timestamp = last + 1;
        }
        match LAST_TIMESTAMP.compare_exchange(last, timestamp, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => break,
            Err(_) => continue,
        }
    }

    let node = rand_u48();
    let clock_seq = rand_u14();

    let time_high_and_time_mid = (timestamp >> 12) & 0xFFFF_FFFF_FFFF;
    let time_low_and_version = timestamp & 0x0FFF;

    let mut uuid_int: u128 = (time_high_and_time_mid as u128) << 80;
    uuid_int |= (time_low_and_version as u128) << 64;
    uuid_int |= ((clock_seq & 0x3FFF) as u128) << 48;
    uuid_int |= (node & 0xFFFF_FFFF_FFFF) as u128;

    Uuid6::from_int(uuid_int, 6)
}

fn rand_u48() -> u64 {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(42);
    let mut state = seed ^ 0xDEAD_BEEF_CAFE_BABE ^ (std::process::id() as u64);
    state ^= state << 13;
    state ^= state >> 7;
    state ^= state << 17;
    state & 0xFFFF_FFFF_FFFF
}

fn rand_u14() -> u16 {
    (rand_u48() & 0x3FFF) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..500 {
            assert!(seen.insert(new_id()));
        }
    }

    #[test]
    fn ids_sort_lexicographically_by_creation_time() {
        let a = new_id();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let b = new_id();
        assert!(a < b, "{a} should sort before {b}");
    }
}
