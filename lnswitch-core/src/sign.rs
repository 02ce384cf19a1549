//! The external signer boundary.
//!
//! The engine never holds channel keys.  Commitment signatures, signature
//! validation and the per-commitment secret schedule are delegated through
//! [`CommitmentSigner`], so the key material can live in a separate
//! hardened process.

use crate::channel::{ChannelId, CommitmentInfo};
use crate::prelude::*;
use crate::util::status::Status;
use crate::wire::{PubKey, Signature};

/// Signs and validates commitment transactions for channels.
///
/// Implementations must be deterministic for a given channel and
/// commitment number, so retransmissions after a reconnect produce
/// identical signatures.
pub trait CommitmentSigner: SendSync {
    /// Sign the counterparty's next commitment
    fn sign_commitment(
        &self,
        channel_id: &ChannelId,
        info: &CommitmentInfo,
    ) -> Result<Signature, Status>;

    /// Validate the counterparty's signature over the holder's next
    /// commitment
    fn validate_counterparty_signature(
        &self,
        channel_id: &ChannelId,
        info: &CommitmentInfo,
        sig: &Signature,
    ) -> Result<(), Status>;

    /// The holder's per-commitment secret for a revoked commitment.
    ///
    /// Only called for commitments that have been superseded by a
    /// validated successor.
    fn revocation_secret(
        &self,
        channel_id: &ChannelId,
        commit_num: u64,
    ) -> Result<[u8; 32], Status>;

    /// The holder's per-commitment point for a commitment number
    fn per_commitment_point(
        &self,
        channel_id: &ChannelId,
        commit_num: u64,
    ) -> Result<PubKey, Status>;
}

#[cfg(any(test, feature = "test_utils"))]
pub use mock::MockSigner;

#[cfg(any(test, feature = "test_utils"))]
mod mock {
    use bitcoin::hashes::{sha256, Hash, HashEngine, Hmac, HmacEngine};
    use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};

    use super::*;
    use crate::util::status::invalid_argument;

    /// Deterministic MAC-based signer for tests.
    ///
    /// Two paired instances share seeds crosswise, so each side can
    /// validate the signatures the other produces without real
    /// transaction construction.
    pub struct MockSigner {
        local_seed: [u8; 32],
        peer_seed: [u8; 32],
        secp: Secp256k1<All>,
    }

    impl SendSync for MockSigner {}

    impl MockSigner {
        /// Create a signer; `peer_seed` is the local seed of the paired
        /// counterparty instance
        pub fn new(local_seed: [u8; 32], peer_seed: [u8; 32]) -> Self {
            MockSigner { local_seed, peer_seed, secp: Secp256k1::new() }
        }

        fn mac(seed: &[u8; 32], channel_id: &ChannelId, info: &CommitmentInfo) -> Signature {
            let digest = info.signing_digest();
            let mut sig = [0u8; 64];
            for half in 0..2u8 {
                let mut engine = HmacEngine::<sha256::Hash>::new(seed);
                engine.input(channel_id.as_slice());
                engine.input(&digest);
                engine.input(&[half]);
                let mac = Hmac::<sha256::Hash>::from_engine(engine).to_byte_array();
                sig[half as usize * 32..(half as usize + 1) * 32].copy_from_slice(&mac);
            }
            Signature(sig)
        }

        fn secret(&self, channel_id: &ChannelId, commit_num: u64) -> SecretKey {
            let mut counter = 0u8;
            loop {
                let mut engine = sha256::Hash::engine();
                engine.input(&self.local_seed);
                engine.input(channel_id.as_slice());
                engine.input(&commit_num.to_be_bytes());
                engine.input(&[counter]);
                let bytes = sha256::Hash::from_engine(engine).to_byte_array();
                if let Ok(sk) = SecretKey::from_slice(&bytes) {
                    return sk;
                }
                counter += 1;
            }
        }
    }

    impl CommitmentSigner for MockSigner {
        fn sign_commitment(
            &self,
            channel_id: &ChannelId,
            info: &CommitmentInfo,
        ) -> Result<Signature, Status> {
            Ok(Self::mac(&self.local_seed, channel_id, info))
        }

        fn validate_counterparty_signature(
            &self,
            channel_id: &ChannelId,
            info: &CommitmentInfo,
            sig: &Signature,
        ) -> Result<(), Status> {
            let expected = Self::mac(&self.peer_seed, channel_id, info);
            if sig != &expected {
                return Err(invalid_argument(format!(
                    "bad signature for commitment {}",
                    info.commit_num
                )));
            }
            Ok(())
        }

        fn revocation_secret(
            &self,
            channel_id: &ChannelId,
            commit_num: u64,
        ) -> Result<[u8; 32], Status> {
            Ok(self.secret(channel_id, commit_num).secret_bytes())
        }

        fn per_commitment_point(
            &self,
            channel_id: &ChannelId,
            commit_num: u64,
        ) -> Result<PubKey, Status> {
            let sk = self.secret(channel_id, commit_num);
            let point = PublicKey::from_secret_key(&self.secp, &sk);
            Ok(PubKey(point.serialize()))
        }
    }
}
