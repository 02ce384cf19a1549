//! Routes HTLCs between links.
//!
//! The switch owns the link registry and the [`CircuitMap`].  A forward
//! becomes durable in the circuit map before anything reaches the
//! outgoing link, and a resolution becomes durable before the backward
//! settle or fail reaches the incoming link; those two write barriers
//! are the whole crash-consistency story.

use async_trait::async_trait;
use log::*;
use tokio::time::{timeout, Duration};

use crate::channel::{ChannelId, PaymentHash, ResolutionResult};
use crate::circuit::{CircuitEntry, CircuitKey, CircuitMap, OpenOutcome};
use crate::config::SwitchConfig;
use crate::failure::{encode_reason, obfuscate_reason, FailureCode};
use crate::mailbox::{BackwardResolution, ForwardAdd, Mailbox, Packet};
use crate::persist;
use crate::persist::Persist;
use crate::prelude::*;

/// Source of the current chain height, used for CLTV policy
pub trait BestBlockSource: SendSync {
    /// The current best block height
    fn best_height(&self) -> u32;
}

/// One decoded hop of an onion
#[derive(Clone, Debug, PartialEq)]
pub struct HopInfo {
    /// Forwarding instructions, `None` when this node is the exit hop
    pub forward: Option<ForwardHop>,
    /// The hop's shared secret, keys backward failure obfuscation
    pub shared_secret: [u8; 32],
}

/// Forwarding instructions for a non-exit hop
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardHop {
    /// The channel to forward out on
    pub next_channel_id: ChannelId,
    /// Amount the next hop should receive
    pub amount_msat: u64,
    /// CLTV expiry of the outgoing HTLC
    pub cltv_expiry: u32,
    /// Re-wrapped onion for the next hop
    pub onion: Vec<u8>,
}

/// Decodes onion packets into per-hop instructions.
///
/// Sphinx processing lives outside this crate; links call through this
/// trait for every locked-in HTLC.
pub trait OnionDecoder: SendSync {
    /// Decode the hop addressed to this node
    fn decode(&self, payment_hash: &PaymentHash, onion: &[u8]) -> Result<HopInfo, FailureCode>;
}

/// What an interceptor may do with a forward
#[derive(Clone, Debug, PartialEq)]
pub enum InterceptAction {
    /// Let the forward proceed
    Resume,
    /// Reject it with this code
    Fail(FailureCode),
}

/// Inspection hook invoked before a forward is committed.
///
/// The hook runs under a bounded timeout; an overrun resumes the
/// forward, so a slow interceptor can delay traffic but not strand it.
#[async_trait]
pub trait ForwardInterceptor: SendSync {
    /// Inspect a forward before the circuit is opened
    async fn intercept(&self, forward: &ForwardAdd) -> InterceptAction;
}

/// Bound on interceptor execution
pub const INTERCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a routing decision
#[derive(Debug, PartialEq)]
pub enum RouteOutcome {
    /// The forward was committed and handed to the outgoing link
    Forwarded,
    /// Policy rejected the forward; fail the incoming HTLC with this code
    LocalReject(FailureCode),
    /// No registered link for the requested outgoing channel
    NoRouteLink,
}

/// Switch error
#[derive(Debug)]
pub enum SwitchError {
    /// Persistence failed
    Persist(persist::Error),
    /// The referenced link or circuit is unknown
    NotFound(String),
}

impl core::fmt::Display for SwitchError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for SwitchError {}

impl From<persist::Error> for SwitchError {
    fn from(e: persist::Error) -> Self {
        SwitchError::Persist(e)
    }
}

/// The cross-link HTLC router
pub struct Switch {
    config: SwitchConfig,
    circuits: CircuitMap,
    links: Mutex<Map<ChannelId, Arc<Mailbox>>>,
    height_source: Arc<dyn BestBlockSource>,
    decoder: Arc<dyn OnionDecoder>,
    interceptor: Mutex<Option<Arc<dyn ForwardInterceptor>>>,
}

impl Switch {
    /// Create a switch, restoring in-flight circuits from storage
    pub fn new(
        config: SwitchConfig,
        persister: Arc<dyn Persist>,
        height_source: Arc<dyn BestBlockSource>,
        decoder: Arc<dyn OnionDecoder>,
    ) -> Result<Self, SwitchError> {
        config.validate().map_err(|s| SwitchError::NotFound(s.message().to_string()))?;
        let circuits = CircuitMap::restore(persister)?;
        Ok(Switch {
            config,
            circuits,
            links: Mutex::new(Map::new()),
            height_source,
            decoder,
            interceptor: Mutex::new(None),
        })
    }

    /// The engine configuration
    pub fn config(&self) -> &SwitchConfig {
        &self.config
    }

    /// The onion decoder links use for locked-in HTLCs
    pub fn decoder(&self) -> &dyn OnionDecoder {
        self.decoder.as_ref()
    }

    /// The circuit map
    pub fn circuits(&self) -> &CircuitMap {
        &self.circuits
    }

    /// Install the forward interceptor
    pub fn set_interceptor(&self, interceptor: Arc<dyn ForwardInterceptor>) {
        *self.interceptor.lock().expect("interceptor lock") = Some(interceptor);
    }

    /// Register a link's mailbox under its channel id
    pub fn register_link(&self, channel_id: ChannelId, mailbox: Arc<Mailbox>) {
        info!("registering link for channel {}", channel_id);
        self.links.lock().expect("links lock").insert(channel_id, mailbox);
    }

    /// Remove a link; queued mail is drained by the departing link task
    pub fn unregister_link(&self, channel_id: &ChannelId) {
        info!("unregistering link for channel {}", channel_id);
        self.links.lock().expect("links lock").remove(channel_id);
    }

    fn mailbox(&self, channel_id: &ChannelId) -> Option<Arc<Mailbox>> {
        self.links.lock().expect("links lock").get(channel_id).cloned()
    }

    /// Route a locked-in incoming HTLC to its outgoing link.
    ///
    /// Policy checks run first, then the interceptor, then the circuit
    /// is opened durably, and only then is the forward enqueued for the
    /// outgoing link.  A duplicate open (a retransmission after
    /// reconnect) re-enqueues without a second circuit.
    pub async fn route(
        &self,
        incoming: CircuitKey,
        payment_hash: PaymentHash,
        incoming_amount_msat: u64,
        shared_secret: [u8; 32],
        hop: ForwardHop,
    ) -> Result<RouteOutcome, SwitchError> {
        if hop.amount_msat > incoming_amount_msat {
            // forwarding must earn a non-negative fee
            return Ok(RouteOutcome::LocalReject(FailureCode::FeeInsufficient));
        }
        let height = self.height_source.best_height();
        if hop.cltv_expiry <= height {
            return Ok(RouteOutcome::LocalReject(FailureCode::ExpiryTooSoon));
        }
        if hop.cltv_expiry > height + self.config.max_outgoing_cltv_expiry {
            return Ok(RouteOutcome::LocalReject(FailureCode::ExpiryTooFar));
        }
        if self.circuits.is_closed(&incoming) {
            // the circuit already ran to completion; never reopen, even
            // when the outgoing link is gone
            return Ok(RouteOutcome::LocalReject(FailureCode::TemporaryChannelFailure));
        }
        let mailbox = match self.mailbox(&hop.next_channel_id) {
            Some(m) => m,
            None => return Ok(RouteOutcome::NoRouteLink),
        };

        let forward = ForwardAdd {
            incoming,
            amount_msat: hop.amount_msat,
            payment_hash,
            cltv_expiry: hop.cltv_expiry,
            onion: hop.onion,
        };

        let interceptor = self.interceptor.lock().expect("interceptor lock").clone();
        if let Some(interceptor) = interceptor {
            match timeout(INTERCEPT_TIMEOUT, interceptor.intercept(&forward)).await {
                Ok(InterceptAction::Fail(code)) => {
                    info!("interceptor failed forward {}: {}", incoming, code);
                    return Ok(RouteOutcome::LocalReject(code));
                }
                Ok(InterceptAction::Resume) => {}
                Err(_) => warn!("interceptor timed out, resuming forward {}", incoming),
            }
        }

        let entry = CircuitEntry {
            incoming,
            outgoing: None,
            payment_hash,
            incoming_amount_msat,
            outgoing_amount_msat: forward.amount_msat,
            obfuscation_key: shared_secret,
            resolution: None,
        };
        match self.circuits.open_circuit(entry) {
            Ok(OpenOutcome::Opened) => {}
            Ok(OpenOutcome::Duplicate) => debug!("re-routing existing circuit {}", incoming),
            Err(persist::Error::AlreadyExists(_)) => {
                // the circuit already ran to completion; never reopen
                return Ok(RouteOutcome::LocalReject(FailureCode::TemporaryChannelFailure));
            }
            Err(e) => return Err(e.into()),
        }
        mailbox.enqueue(Packet::ForwardAdd(forward));
        Ok(RouteOutcome::Forwarded)
    }

    /// Record that the outgoing link committed its add under `outgoing`
    pub fn outgoing_committed(
        &self,
        incoming: &CircuitKey,
        outgoing: CircuitKey,
    ) -> Result<(), SwitchError> {
        self.circuits.set_outgoing(incoming, outgoing)?;
        Ok(())
    }

    /// Apply a terminal outcome of an outgoing HTLC.
    ///
    /// Failure reasons pick up this hop's obfuscation layer, the outcome
    /// is recorded durably in the circuit entry, and only then is the
    /// backward packet enqueued for the incoming link.
    pub fn resolve(
        &self,
        outgoing: &CircuitKey,
        mut result: ResolutionResult,
    ) -> Result<(), SwitchError> {
        let incoming = self
            .circuits
            .lookup_incoming(outgoing)
            .ok_or_else(|| SwitchError::NotFound(format!("outgoing {}", outgoing)))?;
        let entry = self
            .circuits
            .get(&incoming)
            .ok_or_else(|| SwitchError::NotFound(format!("circuit {}", incoming)))?;
        if let ResolutionResult::Failed { reason } = &mut result {
            obfuscate_reason(&entry.obfuscation_key, reason);
        }
        let entry = self.circuits.record_resolution(&incoming, result)?;
        self.deliver_backward(&entry)
    }

    /// Fail a forward that never produced an outgoing HTLC, such as a
    /// mailbox expiry or an outgoing-link rejection
    pub fn fail_forward(&self, incoming: &CircuitKey, code: FailureCode) -> Result<(), SwitchError> {
        let entry = self
            .circuits
            .get(incoming)
            .ok_or_else(|| SwitchError::NotFound(format!("circuit {}", incoming)))?;
        let mut reason = encode_reason(&code, &[]);
        obfuscate_reason(&entry.obfuscation_key, &mut reason);
        let entry =
            self.circuits.record_resolution(incoming, ResolutionResult::Failed { reason })?;
        self.deliver_backward(&entry)
    }

    fn deliver_backward(&self, entry: &CircuitEntry) -> Result<(), SwitchError> {
        let incoming = entry.incoming;
        let result = match &entry.resolution {
            Some(r) => r.clone(),
            None => return Err(SwitchError::NotFound(format!("no resolution for {}", incoming))),
        };
        let mailbox = self
            .mailbox(&incoming.channel_id)
            .ok_or_else(|| SwitchError::NotFound(format!("link {}", incoming.channel_id)))?;
        mailbox.enqueue(Packet::Backward(BackwardResolution { incoming, result }));
        Ok(())
    }

    /// The incoming leg's settle or fail was finalized by a revocation;
    /// the circuit is complete
    pub fn circuit_finalized(&self, incoming: &CircuitKey) -> Result<(), SwitchError> {
        self.circuits.close_circuit(incoming)?;
        Ok(())
    }

    /// Replay recorded resolutions to their incoming links after a
    /// restart; each replays to the same outcome it had before the crash
    pub fn replay_unresolved(&self) -> Result<usize, SwitchError> {
        let pending = self.circuits.unresolved_backward();
        let count = pending.len();
        for entry in pending {
            self.deliver_backward(&entry)?;
        }
        if count > 0 {
            info!("replayed {} unresolved circuits", count);
        }
        Ok(count)
    }

    /// Drain every open circuit with a permanent node failure.
    ///
    /// Called on shutdown so upstream peers release their HTLCs instead
    /// of waiting for on-chain timeouts.
    pub fn drain_circuits(&self) -> Result<usize, SwitchError> {
        let open = self.circuits.open_keys();
        let count = open.len();
        for incoming in open {
            if let Err(e) = self.fail_forward(&incoming, FailureCode::PermanentNodeFailure) {
                warn!("failed draining circuit {}: {}", incoming, e);
            }
        }
        Ok(count)
    }
}
