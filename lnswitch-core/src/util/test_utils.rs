//! Shared fixtures for the test suites.

use crate::channel::{Channel, ChannelId, ChannelSetup, PaymentHash, PaymentPreimage};
use crate::circuit::{CircuitEntry, CircuitKey};
use crate::persist::{ChannelEntry, Error, Persist};
use crate::prelude::*;
use crate::sign::{CommitmentSigner, MockSigner};
use crate::switch::{BestBlockSource, ForwardHop, HopInfo, OnionDecoder};
use crate::wire::PubKey;

/// A channel id from a small seed
pub fn test_channel_id(seed: u8) -> ChannelId {
    ChannelId::new([seed; 32])
}

/// A payment hash from a small seed
pub fn test_payment_hash(seed: u8) -> PaymentHash {
    PaymentHash([seed; 32])
}

/// A preimage from a small seed; pair with [`PaymentPreimage::payment_hash`]
pub fn test_preimage(seed: u8) -> PaymentPreimage {
    PaymentPreimage([seed; 32])
}

/// A setup with dummy counterparty points, for tests that never verify
/// a revocation
pub fn test_setup(channel_value_msat: u64, is_outbound: bool) -> ChannelSetup {
    ChannelSetup {
        is_outbound,
        channel_value_msat,
        push_value_msat: 0,
        dust_limit_msat: 354_000,
        max_accepted_htlcs: 483,
        max_fee_exposure_msat: 500_000_000,
        quiescence_supported: true,
        counterparty_commitment_point: PubKey([2; 33]),
        counterparty_next_commitment_point: PubKey([3; 33]),
    }
}

/// Two channels for the same funding, wired crosswise so each side can
/// validate the other's signatures and revocations
pub fn channel_pair(
    channel_id: ChannelId,
    channel_value_msat: u64,
    push_value_msat: u64,
) -> (Channel, Channel) {
    channel_pair_custom(channel_id, channel_value_msat, push_value_msat, |_, _| {})
}

/// [`channel_pair`] with a hook to adjust the setups before the channels
/// are built; the commitment points are filled in afterwards
pub fn channel_pair_custom(
    channel_id: ChannelId,
    channel_value_msat: u64,
    push_value_msat: u64,
    adjust: impl Fn(&mut ChannelSetup, &mut ChannelSetup),
) -> (Channel, Channel) {
    let signer_a = Arc::new(MockSigner::new([0xaa; 32], [0xbb; 32]));
    let signer_b = Arc::new(MockSigner::new([0xbb; 32], [0xaa; 32]));
    let mut setup_a = ChannelSetup {
        is_outbound: true,
        channel_value_msat,
        push_value_msat,
        dust_limit_msat: 354_000,
        max_accepted_htlcs: 483,
        max_fee_exposure_msat: 500_000_000,
        quiescence_supported: true,
        counterparty_commitment_point: PubKey([2; 33]),
        counterparty_next_commitment_point: PubKey([3; 33]),
    };
    let mut setup_b = ChannelSetup { is_outbound: false, ..setup_a.clone() };
    adjust(&mut setup_a, &mut setup_b);
    setup_a.counterparty_commitment_point =
        signer_b.per_commitment_point(&channel_id, 0).unwrap();
    setup_a.counterparty_next_commitment_point =
        signer_b.per_commitment_point(&channel_id, 1).unwrap();
    setup_b.counterparty_commitment_point =
        signer_a.per_commitment_point(&channel_id, 0).unwrap();
    setup_b.counterparty_next_commitment_point =
        signer_a.per_commitment_point(&channel_id, 1).unwrap();
    let chan_a = Channel::new(channel_id, setup_a, signer_a as Arc<dyn CommitmentSigner>);
    let chan_b = Channel::new(channel_id, setup_b, signer_b as Arc<dyn CommitmentSigner>);
    (chan_a, chan_b)
}

#[derive(Default)]
struct MemoryPersisterInner {
    channels: OrderedMap<ChannelId, ChannelEntry>,
    circuits: OrderedMap<CircuitKey, CircuitEntry>,
}

/// In-memory [`Persist`] with create/update semantics, survives across
/// simulated restarts when held behind an `Arc`
pub struct MemoryPersister {
    inner: Mutex<MemoryPersisterInner>,
}

impl MemoryPersister {
    /// Create an empty store
    pub fn new() -> Self {
        MemoryPersister { inner: Mutex::new(MemoryPersisterInner::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryPersisterInner> {
        self.inner.lock().expect("memory persister poisoned")
    }
}

impl Default for MemoryPersister {
    fn default() -> Self {
        Self::new()
    }
}

impl SendSync for MemoryPersister {}

impl Persist for MemoryPersister {
    fn new_channel(&self, id: &ChannelId, entry: &ChannelEntry) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.channels.contains_key(id) {
            return Err(Error::AlreadyExists(format!("channel {}", id)));
        }
        inner.channels.insert(*id, entry.clone());
        Ok(())
    }

    fn update_channel(&self, id: &ChannelId, entry: &ChannelEntry) -> Result<(), Error> {
        self.lock().channels.insert(*id, entry.clone());
        Ok(())
    }

    fn get_channels(&self) -> Result<Vec<(ChannelId, ChannelEntry)>, Error> {
        Ok(self.lock().channels.iter().map(|(id, e)| (*id, e.clone())).collect())
    }

    fn open_circuit(&self, key: &CircuitKey, entry: &CircuitEntry) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.circuits.contains_key(key) {
            return Err(Error::AlreadyExists(format!("circuit {}", key)));
        }
        inner.circuits.insert(*key, entry.clone());
        Ok(())
    }

    fn update_circuit(&self, key: &CircuitKey, entry: &CircuitEntry) -> Result<(), Error> {
        let mut inner = self.lock();
        if !inner.circuits.contains_key(key) {
            return Err(Error::NotFound(format!("circuit {}", key)));
        }
        inner.circuits.insert(*key, entry.clone());
        Ok(())
    }

    fn remove_circuit(&self, key: &CircuitKey) -> Result<(), Error> {
        self.lock()
            .circuits
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("circuit {}", key)))
    }

    fn get_circuits(&self) -> Result<Vec<(CircuitKey, CircuitEntry)>, Error> {
        Ok(self.lock().circuits.iter().map(|(k, e)| (*k, e.clone())).collect())
    }
}

/// A [`BestBlockSource`] pinned to a fixed height
pub struct FixedHeight(pub u32);

impl SendSync for FixedHeight {}

impl BestBlockSource for FixedHeight {
    fn best_height(&self) -> u32 {
        self.0
    }
}

/// Build a test onion instructing a forward hop
pub fn test_onion_forward(next_channel: ChannelId, amount_msat: u64, cltv_expiry: u32) -> Vec<u8> {
    let mut onion = vec![1u8];
    onion.extend_from_slice(&next_channel.0);
    onion.extend_from_slice(&amount_msat.to_be_bytes());
    onion.extend_from_slice(&cltv_expiry.to_be_bytes());
    onion
}

/// Build a test onion marking this node as the exit hop
pub fn test_onion_exit() -> Vec<u8> {
    vec![0u8]
}

/// Decodes the fixture format of [`test_onion_forward`] /
/// [`test_onion_exit`]
pub struct TestOnionDecoder;

impl SendSync for TestOnionDecoder {}

impl OnionDecoder for TestOnionDecoder {
    fn decode(
        &self,
        _payment_hash: &PaymentHash,
        onion: &[u8],
    ) -> Result<HopInfo, crate::failure::FailureCode> {
        let shared_secret = [0x5a; 32];
        match onion.first() {
            Some(0) => Ok(HopInfo { forward: None, shared_secret }),
            Some(1) if onion.len() >= 45 => {
                let mut channel = [0u8; 32];
                channel.copy_from_slice(&onion[1..33]);
                let mut amount = [0u8; 8];
                amount.copy_from_slice(&onion[33..41]);
                let mut cltv = [0u8; 4];
                cltv.copy_from_slice(&onion[41..45]);
                Ok(HopInfo {
                    forward: Some(ForwardHop {
                        next_channel_id: ChannelId::new(channel),
                        amount_msat: u64::from_be_bytes(amount),
                        cltv_expiry: u32::from_be_bytes(cltv),
                        onion: test_onion_exit(),
                    }),
                    shared_secret,
                })
            }
            _ => Err(crate::failure::FailureCode::InvalidOnionPayload),
        }
    }
}
