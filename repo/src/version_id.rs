use std::time::{SystemTime, UNIX_EPOCH};

// 100-ns intervals between 1582-10-15 and 1970-01-01.
const GREGORIAN_UNIX_OFFSET: u64 = 122_192_928_000_000_000;

/// Generate a fresh time-ordered version ID.
///
/// The value is a 128-bit identifier rendered as
/// `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`: the time fields carry the count
/// of 100-ns ticks since 1582-10-15 (version nibble 1), the variant bits are
/// `10`, and the clock sequence and node are random with the node's first
/// byte LSB forced to 1. Within a process, lexicographic order approximates
/// creation order, which keeps newest-first listings close to insertion
/// order.
pub fn new_version_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default();
    let timestamp = GREGORIAN_UNIX_OFFSET + nanos / 100;

    let time_low = (timestamp & 0xffff_ffff) as u32;
    let time_mid = ((timestamp >> 32) & 0xffff) as u16;
    let time_hi = (((timestamp >> 48) & 0x0fff) as u16) | 0x1000;

    let clock_seq = (rand::random::<u16>() & 0x3fff) | 0x8000;

    let mut node: [u8; 6] = rand::random();
    node[0] |= 0x01;

    format!(
        "{time_low:08x}-{time_mid:04x}-{time_hi:04x}-{clock_seq:04x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        node[0], node[1], node[2], node[3], node[4], node[5],
    )
}
