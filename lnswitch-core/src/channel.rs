//! The per-channel commitment state machine.
//!
//! Maintains the two-sided, append-only ledger of HTLC adds, settles and
//! fails, and drives the signature/revocation handshake that keeps both
//! parties' commitment transactions consistent and enforceable on-chain.
//!
//! Terminology follows the holder/counterparty convention: the holder is
//! this node, the counterparty is the remote peer.

use core::fmt;
use core::fmt::{Debug, Formatter};

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as, Bytes, IfIsHumanReadable};
use log::*;

use crate::prelude::*;
use crate::sign::CommitmentSigner;
use crate::util::status::Status;
use crate::wire::{PubKey, Signature};

/// Weight of a commitment transaction, excluding HTLC outputs
pub const COMMITMENT_TX_BASE_WEIGHT: u64 = 724;
/// Additional commitment weight for each non-dust HTLC output
pub const COMMITMENT_TX_WEIGHT_PER_HTLC: u64 = 172;

/// The first commitment number to be exchanged after funding
pub const INITIAL_COMMITMENT_NUMBER: u64 = 1;

/// Channel identifier, the BOLT 32-byte channel id
#[serde_as]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(#[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")] pub [u8; 32]);

impl ChannelId {
    /// Create an ID
    pub fn new(inner: [u8; 32]) -> Self {
        Self(inner)
    }

    /// Convert to a byte slice
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Payment hash, the SHA256 of the payment preimage
#[serde_as]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PaymentHash(#[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")] pub [u8; 32]);

impl Debug for PaymentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Payment preimage, proof of payment
#[serde_as]
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPreimage(#[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")] pub [u8; 32]);

impl PaymentPreimage {
    /// The payment hash this preimage settles
    pub fn payment_hash(&self) -> PaymentHash {
        PaymentHash(sha256::Hash::hash(&self.0).to_byte_array())
    }
}

impl Debug for PaymentPreimage {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        // don't log secrets
        write!(f, "PaymentPreimage(...)")
    }
}

/// Direction of an HTLC relative to the holder
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HtlcDirection {
    /// Offered by the holder to the counterparty
    Offered,
    /// Received by the holder from the counterparty
    Received,
}

impl HtlcDirection {
    fn flip(&self) -> HtlcDirection {
        match self {
            HtlcDirection::Offered => HtlcDirection::Received,
            HtlcDirection::Received => HtlcDirection::Offered,
        }
    }
}

/// Lifecycle state of an HTLC.
///
/// The HTLC itself is immutable once locked into a commitment; only this
/// tag advances.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HtlcState {
    /// Proposed, not yet in a signed commitment
    PendingAdd,
    /// Irrevocably committed on both sides
    LockedIn,
    /// A settle was proposed, awaiting finalization
    Settling,
    /// A fail was proposed, awaiting finalization
    Failing,
    /// Finalized, about to be garbage collected
    Resolved,
}

/// A hashed time-locked contract
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Htlc {
    /// Per-link sequence id, assigned by the offerer
    pub id: u64,
    /// Amount in millisatoshi
    pub amount_msat: u64,
    /// Payment hash
    pub payment_hash: PaymentHash,
    /// Absolute expiry height
    pub cltv_expiry: u32,
    /// Opaque onion payload for the next hop
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub onion: Vec<u8>,
    /// Direction relative to the holder
    pub direction: HtlcDirection,
    /// Lifecycle state
    pub state: HtlcState,
}

impl Htlc {
    fn is_pending(&self) -> bool {
        matches!(self.state, HtlcState::PendingAdd | HtlcState::LockedIn)
    }
}

/// The negotiated parameters for a [`Channel`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelSetup {
    /// Whether the holder funded the channel and pays the commitment fee
    pub is_outbound: bool,
    /// The total the channel was funded with, in millisatoshi
    pub channel_value_msat: u64,
    /// How much was pushed to the counterparty at funding
    pub push_value_msat: u64,
    /// HTLCs below this amount have no commitment output
    pub dust_limit_msat: u64,
    /// Maximum concurrent HTLCs per direction
    pub max_accepted_htlcs: u16,
    /// Cap on commitment fee plus dust exposure
    pub max_fee_exposure_msat: u64,
    /// Whether both parties negotiated quiescence support
    pub quiescence_supported: bool,
    /// The counterparty's point for the initial commitment
    pub counterparty_commitment_point: PubKey,
    /// The counterparty's point for the first post-funding commitment
    pub counterparty_next_commitment_point: PubKey,
}

/// A pending update in one side's update log
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ChannelUpdate {
    /// Add an HTLC
    Add(Htlc),
    /// Settle a received HTLC with its preimage
    Settle {
        /// Id assigned by the offerer
        id: u64,
        /// Proof of payment
        preimage: PaymentPreimage,
    },
    /// Fail a received HTLC
    Fail {
        /// Id assigned by the offerer
        id: u64,
        /// Obfuscated failure reason, relayed backward
        reason: Vec<u8>,
    },
    /// Change the commitment feerate
    Fee {
        /// New feerate in satoshi per 1000 weight
        feerate_per_kw: u32,
    },
}

/// A frozen snapshot of one party's commitment transaction
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitmentInfo {
    /// Monotonically increasing commitment number
    pub commit_num: u64,
    /// Settled balance of the broadcasting party
    pub to_broadcaster_msat: u64,
    /// Settled balance of the countersigning party
    pub to_countersigner_msat: u64,
    /// Feerate in satoshi per 1000 weight
    pub feerate_per_kw: u32,
    /// Pending HTLCs, direction relative to the broadcaster, in canonical order
    pub htlcs: Vec<Htlc>,
}

impl CommitmentInfo {
    /// Canonical digest over the commitment, the signer boundary input
    pub fn signing_digest(&self) -> [u8; 32] {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.commit_num.to_be_bytes());
        buf.extend_from_slice(&self.to_broadcaster_msat.to_be_bytes());
        buf.extend_from_slice(&self.to_countersigner_msat.to_be_bytes());
        buf.extend_from_slice(&self.feerate_per_kw.to_be_bytes());
        for h in self.htlcs.iter() {
            buf.push(match h.direction {
                HtlcDirection::Offered => 0,
                HtlcDirection::Received => 1,
            });
            buf.extend_from_slice(&h.id.to_be_bytes());
            buf.extend_from_slice(&h.amount_msat.to_be_bytes());
            buf.extend_from_slice(&h.payment_hash.0);
            buf.extend_from_slice(&h.cltv_expiry.to_be_bytes());
        }
        sha256::Hash::hash(&buf).to_byte_array()
    }

    /// The sum of pending HTLC amounts
    pub fn pending_htlc_msat(&self) -> u64 {
        self.htlcs.iter().map(|h| h.amount_msat).sum()
    }
}

/// Result of finalizing an HTLC
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResolutionResult {
    /// Settled with the preimage
    Settled {
        /// Proof of payment
        preimage: PaymentPreimage,
    },
    /// Failed with an obfuscated reason
    Failed {
        /// Obfuscated failure reason
        reason: Vec<u8>,
    },
}

/// An HTLC that reached a terminal state during a revocation exchange
#[derive(Clone, Debug, PartialEq)]
pub struct HtlcResolution {
    /// Direction relative to the holder
    pub direction: HtlcDirection,
    /// Id assigned by the offerer
    pub htlc_id: u64,
    /// Amount in millisatoshi
    pub amount_msat: u64,
    /// Payment hash
    pub payment_hash: PaymentHash,
    /// Terminal outcome
    pub result: ResolutionResult,
}

/// State changes finalized by a revocation
#[derive(Clone, Debug, Default)]
pub struct RevocationOutcome {
    /// Incoming HTLCs now irrevocably committed, ready to forward
    pub locked_in: Vec<Htlc>,
    /// HTLCs that reached a terminal state
    pub resolutions: Vec<HtlcResolution>,
}

/// Token proving the remote signature for a new commitment was validated.
///
/// [`Channel::revoke_previous_commitment`] takes this token, so the
/// revocation of the superseded commitment cannot be released before the
/// new commitment signature has been received and validated.
#[must_use = "the previous commitment must be revoked after accepting a new one"]
#[derive(Debug)]
pub struct RevocationGuard {
    commit_num: u64,
}

/// Channel operation error
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelError {
    /// Available balance or fee/dust exposure cap would be violated
    InsufficientBalance {
        /// Balance available to the proposer
        available_msat: u64,
        /// Amount the proposal needed
        required_msat: u64,
    },
    /// Concurrent in-flight HTLC count would exceed the negotiated limit
    TooManyHtlcs {
        /// The negotiated limit
        limit: u16,
    },
    /// The referenced HTLC is unknown or not settleable by the holder
    UnknownHtlc {
        /// The id that was referenced
        id: u64,
    },
    /// A signed commitment update is already outstanding in this direction
    UpdateInFlight,
    /// The update log is empty, there is nothing to sign
    NoUpdates,
    /// Only the channel funder may change the feerate
    NotChannelFunder,
    /// Updates are paused by a quiescence negotiation
    Quiescent,
    /// Commitment fee exposure cap violated by a counterparty commitment
    FeeExposure {
        /// Computed exposure
        exposure_msat: u64,
        /// Configured cap
        limit_msat: u64,
    },
    /// Fatal protocol violation, the channel must be force-closed
    ProtocolViolation(String),
    /// The external signer failed
    Signer(Status),
}

impl ChannelError {
    /// True if the channel is broken and must be force-closed
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChannelError::ProtocolViolation(_) | ChannelError::FeeExposure { .. })
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for ChannelError {}

impl From<Status> for ChannelError {
    fn from(s: Status) -> Self {
        ChannelError::Signer(s)
    }
}

fn protocol_violation(msg: impl Into<String>) -> ChannelError {
    let s = msg.into();
    error!("PROTOCOL VIOLATION: {}", &s);
    ChannelError::ProtocolViolation(s)
}

/// Serializable commitment machine state.
///
/// This is everything that must survive a restart; see
/// [`crate::persist::model::ChannelEntry`].
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ChannelState {
    // the next commitment number we expect to see signed by the counterparty
    pub next_holder_commit_num: u64,
    // the next commitment number we expect to sign
    pub next_counterparty_commit_num: u64,
    // the next commitment number we expect the counterparty to revoke
    pub next_counterparty_revoke_num: u64,
    // the next commitment number we will revoke ourselves
    pub next_holder_revoke_num: u64,

    // next id for an HTLC we offer
    pub next_holder_htlc_id: u64,
    // next id we will accept for an HTLC the counterparty offers
    pub next_counterparty_htlc_id: u64,

    pub to_holder_msat: u64,
    pub to_counterparty_msat: u64,
    pub feerate_per_kw: u32,

    // keyed by offerer-assigned id
    pub offered_htlcs: OrderedMap<u64, Htlc>,
    pub received_htlcs: OrderedMap<u64, Htlc>,

    // updates we proposed, not yet frozen into a signed commitment
    pub pending_holder: Vec<ChannelUpdate>,
    // updates we signed into the counterparty's next commitment,
    // awaiting their revocation
    pub unacked_holder: Option<Vec<ChannelUpdate>>,
    // updates the counterparty proposed, awaiting their commitment_signed
    pub pending_counterparty: Vec<ChannelUpdate>,
    // counterparty updates frozen by their commitment_signed,
    // finalized when we revoke our previous commitment
    pub unrevoked_counterparty: Option<Vec<ChannelUpdate>>,

    // counterparty per-commitment points: the point for the commitment we
    // will sign next, the currently valid one, and the superseded one
    // awaiting revocation
    pub counterparty_next_point: PubKey,
    pub counterparty_current_point: Option<PubKey>,
    pub counterparty_previous_point: Option<PubKey>,

    // the last revocation secret the counterparty disclosed
    #[serde_as(as = "Option<IfIsHumanReadable<Hex, Bytes>>")]
    pub counterparty_last_secret: Option<[u8; 32]>,

    // updates are paused by a quiescence negotiation
    pub quiescent: bool,
}

impl ChannelState {
    fn new(setup: &ChannelSetup) -> Self {
        let (to_holder_msat, to_counterparty_msat) = if setup.is_outbound {
            (setup.channel_value_msat - setup.push_value_msat, setup.push_value_msat)
        } else {
            (setup.push_value_msat, setup.channel_value_msat - setup.push_value_msat)
        };
        ChannelState {
            next_holder_commit_num: INITIAL_COMMITMENT_NUMBER,
            next_counterparty_commit_num: INITIAL_COMMITMENT_NUMBER,
            next_counterparty_revoke_num: 0,
            next_holder_revoke_num: 0,
            next_holder_htlc_id: 0,
            next_counterparty_htlc_id: 0,
            to_holder_msat,
            to_counterparty_msat,
            feerate_per_kw: 253,
            offered_htlcs: OrderedMap::new(),
            received_htlcs: OrderedMap::new(),
            pending_holder: Vec::new(),
            unacked_holder: None,
            pending_counterparty: Vec::new(),
            unrevoked_counterparty: None,
            counterparty_next_point: setup.counterparty_next_commitment_point.clone(),
            counterparty_current_point: Some(setup.counterparty_commitment_point.clone()),
            counterparty_previous_point: None,
            counterparty_last_secret: None,
            quiescent: false,
        }
    }
}

/// Action required to reconcile commitment state after a reconnect
#[derive(Clone, Debug, PartialEq)]
pub enum ReestablishAction {
    /// Both sides agree, resume normal traffic
    Resume,
    /// The peer lost our last commitment_signed, retransmit it
    RetransmitCommitment,
    /// The peer lost our last revoke_and_ack, retransmit it
    RetransmitRevocation,
}

/// A channel and its commitment state machine.
///
/// Owned exclusively by one [`crate::link::Link`] task; all mutation goes
/// through that task.
pub struct Channel {
    /// The channel id
    pub id: ChannelId,
    /// Negotiated parameters, immutable after funding
    pub setup: ChannelSetup,
    state: ChannelState,
    signer: Arc<dyn CommitmentSigner>,
    secp: Secp256k1<All>,
}

impl Debug for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).field("state", &self.state).finish()
    }
}

impl Channel {
    /// Create a channel at the initial commitment state
    pub fn new(id: ChannelId, setup: ChannelSetup, signer: Arc<dyn CommitmentSigner>) -> Self {
        let state = ChannelState::new(&setup);
        Channel { id, setup, state, signer, secp: Secp256k1::new() }
    }

    /// Restore a channel from persisted state
    pub fn restore(
        id: ChannelId,
        setup: ChannelSetup,
        state: ChannelState,
        signer: Arc<dyn CommitmentSigner>,
    ) -> Self {
        Channel { id, setup, state, signer, secp: Secp256k1::new() }
    }

    /// The serializable state, for persistence
    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    /// Settled balance available to the holder
    pub fn to_holder_msat(&self) -> u64 {
        self.state.to_holder_msat
    }

    /// Settled balance available to the counterparty
    pub fn to_counterparty_msat(&self) -> u64 {
        self.state.to_counterparty_msat
    }

    /// Current feerate in satoshi per 1000 weight
    pub fn feerate_per_kw(&self) -> u32 {
        self.state.feerate_per_kw
    }

    /// True if no updates are pending or in flight in either direction
    pub fn is_clean(&self) -> bool {
        self.state.pending_holder.is_empty()
            && self.state.unacked_holder.is_none()
            && self.state.pending_counterparty.is_empty()
            && self.state.unrevoked_counterparty.is_none()
    }

    /// Number of unsigned holder updates, the batching input
    pub fn pending_update_count(&self) -> usize {
        self.state.pending_holder.len()
    }

    /// Whether a holder-signed commitment is awaiting the counterparty's
    /// revocation
    pub fn awaiting_counterparty_revoke(&self) -> bool {
        self.state.unacked_holder.is_some()
    }

    /// Pause or resume updates for quiescence
    pub fn set_quiescent(&mut self, quiescent: bool) {
        self.state.quiescent = quiescent;
    }

    /// Look up a pending HTLC
    pub fn get_htlc(&self, direction: HtlcDirection, id: u64) -> Option<&Htlc> {
        match direction {
            HtlcDirection::Offered => self.state.offered_htlcs.get(&id),
            HtlcDirection::Received => self.state.received_htlcs.get(&id),
        }
    }

    // Sum of HTLC amounts not yet finalized
    fn pending_htlc_msat(&self) -> u64 {
        self.state
            .offered_htlcs
            .values()
            .chain(self.state.received_htlcs.values())
            .filter(|h| h.state != HtlcState::Resolved)
            .map(|h| h.amount_msat)
            .sum()
    }

    /// Conservation invariant: settled balances plus pending HTLCs always
    /// equal the channel capacity
    pub fn check_conservation(&self) -> Result<(), ChannelError> {
        let total = self.state.to_holder_msat + self.state.to_counterparty_msat
            + self.pending_htlc_msat();
        if total != self.setup.channel_value_msat {
            return Err(protocol_violation(format!(
                "conservation violated: {} != {}",
                total, self.setup.channel_value_msat
            )));
        }
        Ok(())
    }

    // Commitment fee plus dust exposure for a hypothetical HTLC set
    fn fee_exposure_msat(&self, feerate_per_kw: u32, extra_htlc_msat: Option<u64>) -> u64 {
        let mut untrimmed = 0usize;
        let mut dust_msat = 0u64;
        let pending = self
            .state
            .offered_htlcs
            .values()
            .chain(self.state.received_htlcs.values())
            .filter(|h| h.is_pending())
            .map(|h| h.amount_msat)
            .chain(extra_htlc_msat);
        for amount_msat in pending {
            if amount_msat < self.setup.dust_limit_msat {
                dust_msat += amount_msat;
            } else {
                untrimmed += 1;
            }
        }
        let weight = COMMITMENT_TX_BASE_WEIGHT + untrimmed as u64 * COMMITMENT_TX_WEIGHT_PER_HTLC;
        let fee_msat = (feerate_per_kw as u64 * weight / 1000) * 1000;
        fee_msat + dust_msat
    }

    fn check_not_quiescent(&self) -> Result<(), ChannelError> {
        if self.state.quiescent {
            return Err(ChannelError::Quiescent);
        }
        Ok(())
    }

    /// Propose adding an offered HTLC, assigning the next holder id.
    ///
    /// The holder's settled balance is debited immediately; it is refunded
    /// if the HTLC ultimately fails.
    pub fn propose_add(
        &mut self,
        amount_msat: u64,
        payment_hash: PaymentHash,
        cltv_expiry: u32,
        onion: Vec<u8>,
    ) -> Result<&Htlc, ChannelError> {
        self.check_not_quiescent()?;
        let in_flight = self.state.offered_htlcs.values().filter(|h| h.is_pending()).count();
        if in_flight >= self.setup.max_accepted_htlcs as usize {
            return Err(ChannelError::TooManyHtlcs { limit: self.setup.max_accepted_htlcs });
        }
        let exposure = self.fee_exposure_msat(self.state.feerate_per_kw, Some(amount_msat));
        let reserve = if self.setup.is_outbound { exposure } else { 0 };
        let available = self.state.to_holder_msat.saturating_sub(reserve);
        if amount_msat > available {
            return Err(ChannelError::InsufficientBalance {
                available_msat: available,
                required_msat: amount_msat,
            });
        }
        if exposure > self.setup.max_fee_exposure_msat {
            return Err(ChannelError::InsufficientBalance {
                available_msat: available,
                required_msat: amount_msat,
            });
        }
        let id = self.state.next_holder_htlc_id;
        self.state.next_holder_htlc_id += 1;
        let htlc = Htlc {
            id,
            amount_msat,
            payment_hash,
            cltv_expiry,
            onion,
            direction: HtlcDirection::Offered,
            state: HtlcState::PendingAdd,
        };
        self.state.to_holder_msat -= amount_msat;
        self.state.offered_htlcs.insert(id, htlc.clone());
        self.state.pending_holder.push(ChannelUpdate::Add(htlc));
        debug!("{} propose_add htlc {} amount {}", self.id, id, amount_msat);
        Ok(self.state.offered_htlcs.get(&id).expect("just inserted"))
    }

    /// Propose settling a received HTLC with its preimage
    pub fn propose_settle(
        &mut self,
        id: u64,
        preimage: PaymentPreimage,
    ) -> Result<(), ChannelError> {
        self.check_not_quiescent()?;
        let htlc = self
            .state
            .received_htlcs
            .get_mut(&id)
            .filter(|h| h.state == HtlcState::LockedIn)
            .ok_or(ChannelError::UnknownHtlc { id })?;
        if preimage.payment_hash() != htlc.payment_hash {
            return Err(protocol_violation(format!("invalid preimage for htlc {}", id)));
        }
        htlc.state = HtlcState::Settling;
        self.state.pending_holder.push(ChannelUpdate::Settle { id, preimage });
        debug!("{} propose_settle htlc {}", self.id, id);
        Ok(())
    }

    /// Propose failing a received HTLC
    pub fn propose_fail(&mut self, id: u64, reason: Vec<u8>) -> Result<(), ChannelError> {
        self.check_not_quiescent()?;
        let htlc = self
            .state
            .received_htlcs
            .get_mut(&id)
            .filter(|h| h.state == HtlcState::LockedIn)
            .ok_or(ChannelError::UnknownHtlc { id })?;
        htlc.state = HtlcState::Failing;
        self.state.pending_holder.push(ChannelUpdate::Fail { id, reason });
        debug!("{} propose_fail htlc {}", self.id, id);
        Ok(())
    }

    /// Propose a feerate change, allowed for the funder only
    pub fn propose_fee(&mut self, feerate_per_kw: u32) -> Result<(), ChannelError> {
        self.check_not_quiescent()?;
        if !self.setup.is_outbound {
            return Err(ChannelError::NotChannelFunder);
        }
        self.state.pending_holder.push(ChannelUpdate::Fee { feerate_per_kw });
        Ok(())
    }

    // Snapshot the commitment as seen by one side. `broadcaster_is_holder`
    // selects whose commitment transaction this is.
    //
    // The transcript covers every update of the countersigning party but
    // only those broadcaster updates the countersigner has acked with a
    // revocation.  A broadcaster add still awaiting that ack stays out of
    // the transcript and its value stays with the broadcaster, so both
    // sides compute the same transcript even when updates cross on the
    // wire with the signature.
    fn build_commitment(
        &self,
        commit_num: u64,
        feerate_per_kw: u32,
        broadcaster_is_holder: bool,
    ) -> CommitmentInfo {
        let (mut to_broadcaster_msat, to_countersigner_msat) = if broadcaster_is_holder {
            (self.state.to_holder_msat, self.state.to_counterparty_msat)
        } else {
            (self.state.to_counterparty_msat, self.state.to_holder_msat)
        };
        let mut htlcs: Vec<Htlc> = Vec::new();
        for h in self.state.offered_htlcs.values().chain(self.state.received_htlcs.values()) {
            if !h.is_pending() {
                continue;
            }
            let mut h = h.clone();
            if !broadcaster_is_holder {
                h.direction = h.direction.flip();
            }
            // direction is now relative to the broadcaster
            if h.direction == HtlcDirection::Offered && h.state == HtlcState::PendingAdd {
                to_broadcaster_msat += h.amount_msat;
                continue;
            }
            htlcs.push(h);
        }
        htlcs.sort_by_key(|h| (h.direction, h.id));
        CommitmentInfo {
            commit_num,
            to_broadcaster_msat,
            to_countersigner_msat,
            feerate_per_kw,
            htlcs,
        }
    }

    // Apply the feerate effect of a frozen batch.  Adds moved value at
    // propose/receive time; settles and fails move value later, when the
    // finalizing revocation retires their HTLC entries.
    fn apply_batch_fee(&mut self, batch: &[ChannelUpdate]) {
        for upd in batch {
            if let ChannelUpdate::Fee { feerate_per_kw } = upd {
                self.state.feerate_per_kw = *feerate_per_kw;
            }
        }
    }

    /// Freeze the holder update log into the counterparty's next
    /// commitment and sign it.
    ///
    /// At most one un-revoked commitment update may be outstanding per
    /// direction; call again after [`Channel::receive_revocation`].
    pub fn sign_next_commitment(&mut self) -> Result<(CommitmentInfo, Signature), ChannelError> {
        if self.state.unacked_holder.is_some() {
            return Err(ChannelError::UpdateInFlight);
        }
        if self.state.pending_holder.is_empty() {
            return Err(ChannelError::NoUpdates);
        }
        let batch = std::mem::take(&mut self.state.pending_holder);
        self.apply_batch_fee(&batch);

        let commit_num = self.state.next_counterparty_commit_num;
        let info = self.build_commitment(commit_num, self.state.feerate_per_kw, false);
        self.check_conservation()?;

        let sig = self.signer.sign_commitment(&self.id, &info)?;

        // rotate the counterparty per-commitment points
        self.state.counterparty_previous_point = self.state.counterparty_current_point.take();
        self.state.counterparty_current_point =
            Some(self.state.counterparty_next_point.clone());

        self.state.unacked_holder = Some(batch);
        self.state.next_counterparty_commit_num = commit_num + 1;
        debug!("{} signed counterparty commitment {}", self.id, commit_num);
        Ok((info, sig))
    }

    /// Accept an HTLC offered by the counterparty.
    ///
    /// Violations on this path are fatal: the peer broke the negotiated
    /// limits and the channel cannot be trusted.
    pub fn receive_add(
        &mut self,
        id: u64,
        amount_msat: u64,
        payment_hash: PaymentHash,
        cltv_expiry: u32,
        onion: Vec<u8>,
    ) -> Result<(), ChannelError> {
        if id != self.state.next_counterparty_htlc_id {
            return Err(protocol_violation(format!(
                "htlc id {} out of order, expected {}",
                id, self.state.next_counterparty_htlc_id
            )));
        }
        let in_flight = self.state.received_htlcs.values().filter(|h| h.is_pending()).count();
        if in_flight >= self.setup.max_accepted_htlcs as usize {
            return Err(protocol_violation(format!(
                "too many received htlcs: {}",
                in_flight + 1
            )));
        }
        if amount_msat > self.state.to_counterparty_msat {
            return Err(protocol_violation(format!(
                "received htlc {} overspends: {} > {}",
                id, amount_msat, self.state.to_counterparty_msat
            )));
        }
        self.state.next_counterparty_htlc_id += 1;
        let htlc = Htlc {
            id,
            amount_msat,
            payment_hash,
            cltv_expiry,
            onion,
            direction: HtlcDirection::Received,
            state: HtlcState::PendingAdd,
        };
        self.state.to_counterparty_msat -= amount_msat;
        self.state.received_htlcs.insert(id, htlc.clone());
        self.state.pending_counterparty.push(ChannelUpdate::Add(htlc));
        debug!("{} receive_add htlc {} amount {}", self.id, id, amount_msat);
        Ok(())
    }

    /// Accept a settle of an HTLC the holder offered
    pub fn receive_settle(
        &mut self,
        id: u64,
        preimage: PaymentPreimage,
    ) -> Result<(), ChannelError> {
        let htlc = self
            .state
            .offered_htlcs
            .get_mut(&id)
            .filter(|h| h.is_pending())
            .ok_or_else(|| protocol_violation(format!("settle of unknown offered htlc {}", id)))?;
        if preimage.payment_hash() != htlc.payment_hash {
            return Err(protocol_violation(format!("invalid preimage for htlc {}", id)));
        }
        htlc.state = HtlcState::Settling;
        self.state.pending_counterparty.push(ChannelUpdate::Settle { id, preimage });
        Ok(())
    }

    /// Accept a fail of an HTLC the holder offered
    pub fn receive_fail(&mut self, id: u64, reason: Vec<u8>) -> Result<(), ChannelError> {
        let htlc = self
            .state
            .offered_htlcs
            .get_mut(&id)
            .filter(|h| h.is_pending())
            .ok_or_else(|| protocol_violation(format!("fail of unknown offered htlc {}", id)))?;
        htlc.state = HtlcState::Failing;
        self.state.pending_counterparty.push(ChannelUpdate::Fail { id, reason });
        Ok(())
    }

    /// Accept a feerate change from the counterparty, funder only
    pub fn receive_fee(&mut self, feerate_per_kw: u32) -> Result<(), ChannelError> {
        if self.setup.is_outbound {
            return Err(protocol_violation("update_fee from non-funder"));
        }
        self.state.pending_counterparty.push(ChannelUpdate::Fee { feerate_per_kw });
        Ok(())
    }

    /// Validate the counterparty's signature over our next commitment.
    ///
    /// On success the frozen updates advance the holder commitment number
    /// and a [`RevocationGuard`] is returned; the guard is the only path
    /// to [`Channel::revoke_previous_commitment`].  A signature mismatch
    /// is fatal to the channel and is never retried.
    pub fn receive_commitment_signed(
        &mut self,
        sig: &Signature,
    ) -> Result<RevocationGuard, ChannelError> {
        if self.state.unrevoked_counterparty.is_some() {
            return Err(protocol_violation("commitment_signed before our revoke_and_ack"));
        }
        if self.state.pending_counterparty.is_empty() {
            return Err(protocol_violation("commitment_signed with no updates"));
        }
        let batch = std::mem::take(&mut self.state.pending_counterparty);
        self.apply_batch_fee(&batch);

        let commit_num = self.state.next_holder_commit_num;
        let new_feerate = self.state.feerate_per_kw;
        let info = self.build_commitment(commit_num, new_feerate, true);
        self.check_conservation()?;

        let exposure = self.fee_exposure_msat(new_feerate, None);
        if exposure > self.setup.max_fee_exposure_msat {
            return Err(ChannelError::FeeExposure {
                exposure_msat: exposure,
                limit_msat: self.setup.max_fee_exposure_msat,
            });
        }

        self.signer.validate_counterparty_signature(&self.id, &info, sig).map_err(|s| {
            protocol_violation(format!("commitment {} signature invalid: {}", commit_num, s))
        })?;

        self.state.unrevoked_counterparty = Some(batch);
        self.state.next_holder_commit_num = commit_num + 1;
        debug!("{} accepted holder commitment {}", self.id, commit_num);
        Ok(RevocationGuard { commit_num })
    }

    /// Release the revocation for the superseded holder commitment.
    ///
    /// This is the irreversible step; once the secret is released the
    /// superseded commitment can never be broadcast safely.
    pub fn revoke_previous_commitment(
        &mut self,
        guard: RevocationGuard,
    ) -> Result<([u8; 32], PubKey, RevocationOutcome), ChannelError> {
        let revoked_num = guard.commit_num - 1;
        let secret = self.signer.revocation_secret(&self.id, revoked_num)?;
        let next_point = self.signer.per_commitment_point(&self.id, guard.commit_num + 1)?;
        let batch = self
            .state
            .unrevoked_counterparty
            .take()
            .ok_or_else(|| protocol_violation("no commitment to revoke"))?;
        let outcome = self.finalize_batch(&batch, false);
        self.state.next_holder_revoke_num = guard.commit_num;
        debug!("{} revoked holder commitment {}", self.id, revoked_num);
        Ok((secret, next_point, outcome))
    }

    /// Accept the counterparty's revocation of their superseded
    /// commitment, finalizing the holder-initiated batch.
    pub fn receive_revocation(
        &mut self,
        secret: [u8; 32],
        next_point: PubKey,
    ) -> Result<RevocationOutcome, ChannelError> {
        let expected = self
            .state
            .counterparty_previous_point
            .as_ref()
            .ok_or_else(|| protocol_violation("unexpected revoke_and_ack"))?;
        let sk = SecretKey::from_slice(&secret)
            .map_err(|_| protocol_violation("malformed revocation secret"))?;
        let point = PublicKey::from_secret_key(&self.secp, &sk);
        if point.serialize() != expected.0 {
            return Err(protocol_violation("revocation secret does not match commitment point"));
        }
        let batch = self
            .state
            .unacked_holder
            .take()
            .ok_or_else(|| protocol_violation("revoke_and_ack with no outstanding commitment"))?;
        self.state.counterparty_previous_point = None;
        self.state.counterparty_last_secret = Some(secret);
        self.state.counterparty_next_point = next_point;
        self.state.next_counterparty_revoke_num += 1;
        let outcome = self.finalize_batch(&batch, true);
        debug!("{} counterparty revoked, revoke_num {}", self.id, self.state.next_counterparty_revoke_num);
        Ok(outcome)
    }

    // Advance HTLC state tags for a finalized batch, move the value of
    // settled and failed HTLCs, and garbage collect the retired entries.
    // The caller must release the matching circuit map entries with the
    // returned resolutions; the two are never collected independently.
    fn finalize_batch(&mut self, batch: &[ChannelUpdate], holder_initiated: bool) -> RevocationOutcome {
        let mut outcome = RevocationOutcome::default();
        for upd in batch {
            match upd {
                ChannelUpdate::Add(h) => {
                    let map = if holder_initiated {
                        &mut self.state.offered_htlcs
                    } else {
                        &mut self.state.received_htlcs
                    };
                    if let Some(htlc) = map.get_mut(&h.id) {
                        if htlc.state == HtlcState::PendingAdd {
                            htlc.state = HtlcState::LockedIn;
                        }
                        if !holder_initiated {
                            outcome.locked_in.push(htlc.clone());
                        }
                    }
                }
                ChannelUpdate::Settle { id, preimage } => {
                    let removed = if holder_initiated {
                        self.state.received_htlcs.remove(id)
                    } else {
                        self.state.offered_htlcs.remove(id)
                    };
                    if let Some(mut htlc) = removed {
                        htlc.state = HtlcState::Resolved;
                        // value moves to the receiver as the entry retires
                        if holder_initiated {
                            self.state.to_holder_msat += htlc.amount_msat;
                        } else {
                            self.state.to_counterparty_msat += htlc.amount_msat;
                        }
                        outcome.resolutions.push(HtlcResolution {
                            direction: htlc.direction,
                            htlc_id: htlc.id,
                            amount_msat: htlc.amount_msat,
                            payment_hash: htlc.payment_hash,
                            result: ResolutionResult::Settled { preimage: *preimage },
                        });
                    }
                }
                ChannelUpdate::Fail { id, reason } => {
                    let removed = if holder_initiated {
                        self.state.received_htlcs.remove(id)
                    } else {
                        self.state.offered_htlcs.remove(id)
                    };
                    if let Some(mut htlc) = removed {
                        htlc.state = HtlcState::Resolved;
                        // value returns to the offerer
                        if holder_initiated {
                            self.state.to_counterparty_msat += htlc.amount_msat;
                        } else {
                            self.state.to_holder_msat += htlc.amount_msat;
                        }
                        outcome.resolutions.push(HtlcResolution {
                            direction: htlc.direction,
                            htlc_id: htlc.id,
                            amount_msat: htlc.amount_msat,
                            payment_hash: htlc.payment_hash,
                            result: ResolutionResult::Failed { reason: reason.clone() },
                        });
                    }
                }
                ChannelUpdate::Fee { .. } => {}
            }
        }
        outcome
    }

    /// The reestablish message to send after a reconnect
    pub fn reestablish(&self) -> Result<crate::wire::ChannelReestablish, ChannelError> {
        let my_point = self.signer.per_commitment_point(&self.id, self.state.next_holder_commit_num)?;
        Ok(crate::wire::ChannelReestablish {
            channel_id: self.id,
            next_commitment_number: self.state.next_holder_commit_num,
            next_revocation_number: self.state.next_counterparty_revoke_num,
            your_last_per_commitment_secret: self
                .state
                .counterparty_last_secret
                .unwrap_or([0; 32]),
            my_current_per_commitment_point: my_point,
        })
    }

    /// Reconcile against the peer's reestablish message
    pub fn check_reestablish(
        &self,
        msg: &crate::wire::ChannelReestablish,
    ) -> Result<ReestablishAction, ChannelError> {
        if msg.next_commitment_number > self.state.next_counterparty_commit_num {
            // they claim a commitment we never signed; we are behind and
            // any action could forfeit funds
            return Err(protocol_violation(format!(
                "peer expects commitment {} but we only signed up to {}",
                msg.next_commitment_number,
                self.state.next_counterparty_commit_num - 1,
            )));
        }
        if msg.next_revocation_number > self.state.next_holder_revoke_num {
            return Err(protocol_violation(format!(
                "peer expects revocation {} but we sent {}",
                msg.next_revocation_number, self.state.next_holder_revoke_num,
            )));
        }
        if msg.next_commitment_number + 1 == self.state.next_counterparty_commit_num
            && self.state.unacked_holder.is_some()
        {
            // they never saw our last commitment_signed
            return Ok(ReestablishAction::RetransmitCommitment);
        }
        if msg.next_revocation_number < self.state.next_holder_revoke_num {
            return Ok(ReestablishAction::RetransmitRevocation);
        }
        Ok(ReestablishAction::Resume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::MockSigner;
    use crate::util::test_utils::*;

    fn make_channel() -> Channel {
        let signer = Arc::new(MockSigner::new([1; 32], [2; 32]));
        Channel::new(test_channel_id(1), test_setup(1_000_000, true), signer)
    }

    #[test]
    fn propose_add_assigns_monotonic_ids_test() {
        let mut chan = make_channel();
        for expected in 0..5u64 {
            let id = chan
                .propose_add(10_000, test_payment_hash(expected as u8), 500_000, vec![])
                .unwrap()
                .id;
            assert_eq!(id, expected);
        }
        chan.check_conservation().unwrap();
    }

    #[test]
    fn propose_add_insufficient_balance_test() {
        let mut chan = make_channel();
        let err = chan
            .propose_add(2_000_000, test_payment_hash(1), 500_000, vec![])
            .unwrap_err();
        assert!(matches!(err, ChannelError::InsufficientBalance { .. }));
    }

    #[test]
    fn propose_add_too_many_htlcs_test() {
        let signer = Arc::new(MockSigner::new([1; 32], [2; 32]));
        let mut setup = test_setup(100_000_000, true);
        setup.max_accepted_htlcs = 3;
        let mut chan = Channel::new(test_channel_id(1), setup, signer);
        for i in 0..3 {
            chan.propose_add(10_000, test_payment_hash(i), 500_000, vec![]).unwrap();
        }
        let err = chan.propose_add(10_000, test_payment_hash(9), 500_000, vec![]).unwrap_err();
        assert_eq!(err, ChannelError::TooManyHtlcs { limit: 3 });
    }

    #[test]
    fn propose_settle_unknown_htlc_test() {
        let mut chan = make_channel();
        let err = chan.propose_settle(42, test_preimage(1)).unwrap_err();
        assert_eq!(err, ChannelError::UnknownHtlc { id: 42 });
    }

    #[test]
    fn sign_requires_updates_test() {
        let mut chan = make_channel();
        assert_eq!(chan.sign_next_commitment().unwrap_err(), ChannelError::NoUpdates);
    }

    #[test]
    fn one_update_in_flight_per_direction_test() {
        let mut chan = make_channel();
        chan.propose_add(10_000, test_payment_hash(1), 500_000, vec![]).unwrap();
        chan.sign_next_commitment().unwrap();
        chan.propose_add(10_000, test_payment_hash(2), 500_000, vec![]).unwrap();
        assert_eq!(chan.sign_next_commitment().unwrap_err(), ChannelError::UpdateInFlight);
    }

    #[test]
    fn receive_add_out_of_order_is_fatal_test() {
        let mut chan = make_channel();
        let err = chan
            .receive_add(5, 10_000, test_payment_hash(1), 500_000, vec![])
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn receive_add_overspend_is_fatal_test() {
        // counterparty has nothing on an outbound channel with no push
        let mut chan = make_channel();
        let err = chan
            .receive_add(0, 10_000, test_payment_hash(1), 500_000, vec![])
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn quiescent_rejects_proposals_test() {
        let mut chan = make_channel();
        chan.set_quiescent(true);
        let err = chan.propose_add(10_000, test_payment_hash(1), 500_000, vec![]).unwrap_err();
        assert_eq!(err, ChannelError::Quiescent);
        chan.set_quiescent(false);
        chan.propose_add(10_000, test_payment_hash(1), 500_000, vec![]).unwrap();
    }

    #[test]
    fn fee_update_non_funder_rejected_test() {
        let signer = Arc::new(MockSigner::new([1; 32], [2; 32]));
        let mut chan =
            Channel::new(test_channel_id(1), test_setup(1_000_000, false), signer);
        assert_eq!(chan.propose_fee(500).unwrap_err(), ChannelError::NotChannelFunder);
    }

    #[test]
    fn conservation_after_proposals_test() {
        let mut chan = make_channel();
        chan.propose_add(10_000, test_payment_hash(1), 500_000, vec![]).unwrap();
        chan.propose_add(20_000, test_payment_hash(2), 500_000, vec![]).unwrap();
        chan.check_conservation().unwrap();
        assert_eq!(chan.to_holder_msat(), 970_000);
    }
}
