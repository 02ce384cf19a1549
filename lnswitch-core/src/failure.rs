//! HTLC failure taxonomy and backward-path obfuscation.
//!
//! Failure reasons travel backward along the payment path as opaque
//! blobs.  Each hop layers a keystream over the blob, so only the origin
//! of the payment, which knows every hop's shared secret, can read the
//! failing hop's code.

use core::fmt;

use bitcoin::hashes::{sha256, Hash, HashEngine};

/// The failing node could not parse the onion
pub const BADONION: u16 = 0x8000;
/// Retrying the same path will fail again
pub const PERM: u16 = 0x4000;
/// The failure concerns the node, not a specific channel
pub const NODE: u16 = 0x2000;
/// The failure carries a channel update the origin should apply
pub const UPDATE: u16 = 0x1000;

/// Failure reason blobs are padded to this length before obfuscation
pub const FAILURE_REASON_LEN: usize = 256;

/// Reason an HTLC could not be fulfilled
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureCode {
    /// The onion payload could not be parsed
    InvalidOnionPayload,
    /// The node is refusing temporarily
    TemporaryNodeFailure,
    /// The node is refusing permanently
    PermanentNodeFailure,
    /// The outgoing channel cannot carry the HTLC right now
    TemporaryChannelFailure,
    /// The outgoing channel is gone
    PermanentChannelFailure,
    /// There is no channel to the requested next peer
    UnknownNextPeer,
    /// The HTLC amount is below the outgoing channel's minimum
    AmountBelowMinimum,
    /// The forwarding fee is below the outgoing channel's policy
    FeeInsufficient,
    /// The outgoing CLTV leaves too little time to claim on-chain
    ExpiryTooSoon,
    /// The outgoing CLTV is too far in the future
    ExpiryTooFar,
    /// The CLTV delta is insufficient for the outgoing hop
    IncorrectCltvExpiry,
    /// A code this node does not recognize
    Unknown(u16),
}

impl FailureCode {
    /// The wire code with its flag bits
    pub fn code(&self) -> u16 {
        match self {
            FailureCode::InvalidOnionPayload => PERM | 22,
            FailureCode::TemporaryNodeFailure => NODE | 2,
            FailureCode::PermanentNodeFailure => PERM | NODE | 2,
            FailureCode::TemporaryChannelFailure => UPDATE | 7,
            FailureCode::PermanentChannelFailure => PERM | 8,
            FailureCode::UnknownNextPeer => PERM | 10,
            FailureCode::AmountBelowMinimum => UPDATE | 11,
            FailureCode::FeeInsufficient => UPDATE | 12,
            FailureCode::ExpiryTooSoon => UPDATE | 14,
            FailureCode::ExpiryTooFar => 21,
            FailureCode::IncorrectCltvExpiry => UPDATE | 13,
            FailureCode::Unknown(code) => *code,
        }
    }

    /// Decode a wire code
    pub fn from_code(code: u16) -> Self {
        match code {
            c if c == PERM | 22 => FailureCode::InvalidOnionPayload,
            c if c == NODE | 2 => FailureCode::TemporaryNodeFailure,
            c if c == PERM | NODE | 2 => FailureCode::PermanentNodeFailure,
            c if c == UPDATE | 7 => FailureCode::TemporaryChannelFailure,
            c if c == PERM | 8 => FailureCode::PermanentChannelFailure,
            c if c == PERM | 10 => FailureCode::UnknownNextPeer,
            c if c == UPDATE | 11 => FailureCode::AmountBelowMinimum,
            c if c == UPDATE | 12 => FailureCode::FeeInsufficient,
            c if c == UPDATE | 14 => FailureCode::ExpiryTooSoon,
            21 => FailureCode::ExpiryTooFar,
            c if c == UPDATE | 13 => FailureCode::IncorrectCltvExpiry,
            other => FailureCode::Unknown(other),
        }
    }

    /// True if the origin should not retry through this node
    pub fn is_permanent(&self) -> bool {
        self.code() & PERM != 0
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}(0x{:04x})", self, self.code())
    }
}

/// Encode a failure into a padded cleartext reason blob.
///
/// Layout is code, data length, data, zero padding to
/// [`FAILURE_REASON_LEN`].
pub fn encode_reason(code: &FailureCode, data: &[u8]) -> Vec<u8> {
    let mut reason = Vec::with_capacity(FAILURE_REASON_LEN);
    reason.extend_from_slice(&code.code().to_be_bytes());
    reason.extend_from_slice(&(data.len() as u16).to_be_bytes());
    reason.extend_from_slice(data);
    reason.resize(FAILURE_REASON_LEN, 0);
    reason
}

/// Decode a cleartext reason blob produced by [`encode_reason`]
pub fn decode_reason(reason: &[u8]) -> Option<(FailureCode, Vec<u8>)> {
    if reason.len() < 4 {
        return None;
    }
    let code = u16::from_be_bytes([reason[0], reason[1]]);
    let len = u16::from_be_bytes([reason[2], reason[3]]) as usize;
    if reason.len() < 4 + len {
        return None;
    }
    Some((FailureCode::from_code(code), reason[4..4 + len].to_vec()))
}

/// Layer one hop's keystream over a reason blob.
///
/// XOR with a hash-counter stream keyed by the hop's shared secret; the
/// operation is its own inverse, so the origin peels layers by applying
/// each hop's stream again in path order.
pub fn obfuscate_reason(shared_secret: &[u8; 32], reason: &mut [u8]) {
    let mut offset = 0usize;
    let mut counter = 0u64;
    while offset < reason.len() {
        let mut engine = sha256::Hash::engine();
        engine.input(shared_secret);
        engine.input(&counter.to_be_bytes());
        let block = sha256::Hash::from_engine(engine).to_byte_array();
        for (byte, key) in reason[offset..].iter_mut().zip(block.iter()) {
            *byte ^= key;
        }
        offset += block.len();
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_flags_test() {
        assert_eq!(FailureCode::TemporaryChannelFailure.code(), 0x1007);
        assert_eq!(FailureCode::UnknownNextPeer.code(), 0x400a);
        assert_eq!(FailureCode::PermanentNodeFailure.code(), 0x6002);
        assert!(FailureCode::UnknownNextPeer.is_permanent());
        assert!(!FailureCode::TemporaryChannelFailure.is_permanent());
    }

    #[test]
    fn reason_roundtrip_test() {
        let reason = encode_reason(&FailureCode::AmountBelowMinimum, b"update-blob");
        assert_eq!(reason.len(), FAILURE_REASON_LEN);
        let (code, data) = decode_reason(&reason).unwrap();
        assert_eq!(code, FailureCode::AmountBelowMinimum);
        assert_eq!(data, b"update-blob");
    }

    #[test]
    fn obfuscation_is_involution_test() {
        let secret = [7u8; 32];
        let mut reason = encode_reason(&FailureCode::TemporaryNodeFailure, &[]);
        let clear = reason.clone();
        obfuscate_reason(&secret, &mut reason);
        assert_ne!(reason, clear);
        obfuscate_reason(&secret, &mut reason);
        assert_eq!(reason, clear);
    }

    #[test]
    fn layered_obfuscation_peels_in_order_test() {
        let hop1 = [1u8; 32];
        let hop2 = [2u8; 32];
        let mut reason = encode_reason(&FailureCode::UnknownNextPeer, &[]);
        let clear = reason.clone();
        // failing hop obfuscates, then the hop before it layers again
        obfuscate_reason(&hop2, &mut reason);
        obfuscate_reason(&hop1, &mut reason);
        // origin peels in path order
        obfuscate_reason(&hop1, &mut reason);
        obfuscate_reason(&hop2, &mut reason);
        assert_eq!(reason, clear);
    }
}
