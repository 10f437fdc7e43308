//! External identifier codec.
//!
//! Node and nodespace uids embed the owning partition and the numeric index:
//! `n00071` is node 71 of partition 0, `s0121` nodespace 1 of partition 12.
//! The partition is always three decimal digits, the index follows without
//! leading zeros, so every live allocation has exactly one spelling.

use crate::error::{NetError, NetResult};

/// Prefix byte of node uids.
pub const NODE_PREFIX: u8 = b'n';
/// Prefix byte of nodespace uids.
pub const NODESPACE_PREFIX: u8 = b's';
/// Largest partition number the three-digit field can carry. Anything above
/// would render four digits and collide with other allocations on decode.
pub const MAX_PARTITION: u16 = 999;

/// Renders the uid of node `index` in partition `partition`.
pub fn node_uid(partition: u16, index: usize) -> String {
    format!("n{partition:03}{index}")
}

/// Renders the uid of nodespace `index` in partition `partition`.
pub fn nodespace_uid(partition: u16, index: usize) -> String {
    format!("s{partition:03}{index}")
}

/// Parses a node uid back into `(partition, index)`.
pub fn parse_node_uid(uid: &str) -> NetResult<(u16, usize)> {
    parse(uid, NODE_PREFIX)
}

/// Parses a nodespace uid back into `(partition, index)`.
pub fn parse_nodespace_uid(uid: &str) -> NetResult<(u16, usize)> {
    parse(uid, NODESPACE_PREFIX)
}

fn parse(uid: &str, prefix: u8) -> NetResult<(u16, usize)> {
    let bytes = uid.as_bytes();
    if bytes.len() < 5 || bytes[0] != prefix {
        return Err(malformed(uid));
    }
    if !bytes[1..].iter().all(u8::is_ascii_digit) {
        return Err(malformed(uid));
    }
    let partition: u16 = uid[1..4].parse().map_err(|_| malformed(uid))?;
    let index_digits = &uid[4..];
    // Index 0 and leading zeros have no encoded form.
    if index_digits.starts_with('0') {
        return Err(malformed(uid));
    }
    let index: usize = index_digits.parse().map_err(|_| malformed(uid))?;
    Ok((partition, index))
}

fn malformed(uid: &str) -> NetError {
    NetError::Identifier(format!("malformed uid {uid:?}"))
}
