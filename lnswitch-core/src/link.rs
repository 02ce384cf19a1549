//! The per-channel actor.
//!
//! One tokio task per channel owns the [`Channel`] state machine
//! exclusively.  Peer wire traffic, forwards from other links and
//! backward resolutions all arrive through the link's [`Mailbox`]; the
//! host controls the link through a command channel and observes it
//! through an event channel.  Nothing else touches the channel state.

use log::*;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::channel::{
    Channel, ChannelError, ChannelId, Htlc, HtlcResolution, PaymentHash, PaymentPreimage,
    ReestablishAction, ResolutionResult, RevocationOutcome,
};
use crate::circuit::CircuitKey;
use crate::failure::{encode_reason, obfuscate_reason, FailureCode};
use crate::mailbox::{BackwardResolution, Delivery, ForwardAdd, Mailbox, Packet};
use crate::persist;
use crate::persist::{ChannelEntry, Persist};
use crate::prelude::*;
use crate::switch::{RouteOutcome, Switch, SwitchError};
use crate::wire::{
    ChannelReestablish, CommitmentSigned, Message, RevokeAndAck, Stfu, UpdateAddHtlc, UpdateFailHtlc,
    UpdateFee, UpdateFulfillHtlc,
};

/// Lifecycle state of a link
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// Waiting for reestablish reconciliation
    Starting,
    /// Forwarding traffic
    Active,
    /// Updates paused by a quiescence negotiation
    Quiescing,
    /// Draining; no new HTLCs
    ShuttingDown,
}

/// Notifications emitted by a link
#[derive(Clone, Debug, PartialEq)]
pub enum LinkEvent {
    /// The link changed lifecycle state
    LinkStateChanged {
        /// The channel
        channel_id: ChannelId,
        /// The new state
        state: LinkState,
    },
    /// An HTLC was committed on the outgoing channel of a forward
    HtlcForwarded {
        /// The outgoing channel
        channel_id: ChannelId,
        /// The outgoing HTLC id
        htlc_id: u64,
        /// The outgoing amount
        amount_msat: u64,
        /// Payment hash
        payment_hash: PaymentHash,
    },
    /// An HTLC addressed to this node locked in; the host should settle
    /// or fail it by command
    HtlcReceived {
        /// The channel
        channel_id: ChannelId,
        /// The HTLC id
        htlc_id: u64,
        /// The amount
        amount_msat: u64,
        /// Payment hash
        payment_hash: PaymentHash,
    },
    /// An HTLC reached a terminal state
    HtlcResolved {
        /// The channel
        channel_id: ChannelId,
        /// The HTLC id
        htlc_id: u64,
        /// Payment hash
        payment_hash: PaymentHash,
        /// The outcome
        result: ResolutionResult,
    },
    /// The peer violated the protocol; the channel must be force-closed
    ChannelBreached {
        /// The channel
        channel_id: ChannelId,
        /// Human-readable cause
        reason: String,
    },
    /// The peer has not revoked for longer than `pending_commit_interval`
    StuckCommitment {
        /// The channel
        channel_id: ChannelId,
    },
    /// The peer asked for cooperative close
    CloseRequested {
        /// The channel
        channel_id: ChannelId,
    },
}

/// Host instructions to a link
#[derive(Debug)]
pub enum LinkCommand {
    /// Originate an HTLC on this channel
    SendHtlc {
        /// Amount in millisatoshi
        amount_msat: u64,
        /// Payment hash
        payment_hash: PaymentHash,
        /// Absolute expiry height
        cltv_expiry: u32,
        /// Onion for the peer
        onion: Vec<u8>,
    },
    /// Settle a received HTLC, exit-hop flow
    SettleHtlc {
        /// The HTLC id
        htlc_id: u64,
        /// Proof of payment
        preimage: PaymentPreimage,
    },
    /// Fail a received HTLC, exit-hop flow
    FailHtlc {
        /// The HTLC id
        htlc_id: u64,
        /// Why
        code: FailureCode,
    },
    /// Change the feerate, funder only
    UpdateFee {
        /// New feerate in satoshi per 1000 weight
        feerate_per_kw: u32,
    },
    /// Start a quiescence negotiation
    Quiesce,
    /// End quiescence and resume updates
    Resume,
}

/// The switch- and host-facing side of a link
#[derive(Clone)]
pub struct LinkHandle {
    /// The channel this link serves
    pub channel_id: ChannelId,
    /// The link's delivery queue
    pub mailbox: Arc<Mailbox>,
    /// Host command channel
    pub commands: mpsc::UnboundedSender<LinkCommand>,
}

#[derive(Debug)]
enum LinkError {
    Channel(ChannelError),
    Persist(persist::Error),
    Switch(SwitchError),
}

impl From<ChannelError> for LinkError {
    fn from(e: ChannelError) -> Self {
        LinkError::Channel(e)
    }
}

impl From<persist::Error> for LinkError {
    fn from(e: persist::Error) -> Self {
        LinkError::Persist(e)
    }
}

impl From<SwitchError> for LinkError {
    fn from(e: SwitchError) -> Self {
        LinkError::Switch(e)
    }
}

struct Link {
    channel: Channel,
    switch: Arc<Switch>,
    mailbox: Arc<Mailbox>,
    persister: Arc<dyn Persist>,
    outgoing: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedSender<LinkEvent>,
    state: LinkState,
    // oldest unsigned update, drives the batch timer
    batch_deadline: Option<Instant>,
    // set while a signed commitment awaits the peer's revocation
    sig_outstanding_since: Option<Instant>,
    stuck_reported: bool,
    stfu_sent: bool,
    quiesce_deadline: Option<Instant>,
    last_commitment_signed: Option<CommitmentSigned>,
    last_revoke: Option<RevokeAndAck>,
}

/// Spawn a link task for a channel.
///
/// The caller registers the returned handle's mailbox with the switch
/// and wires `outgoing` to the peer transport.
pub fn spawn_link(
    channel: Channel,
    switch: Arc<Switch>,
    persister: Arc<dyn Persist>,
    outgoing: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedSender<LinkEvent>,
    shutdown: triggered::Listener,
) -> LinkHandle {
    let channel_id = channel.id;
    let mailbox =
        Arc::new(Mailbox::new(switch.config().mailbox_delivery_timeout));
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let link = Link {
        channel,
        switch: Arc::clone(&switch),
        mailbox: Arc::clone(&mailbox),
        persister,
        outgoing,
        events,
        state: LinkState::Starting,
        batch_deadline: None,
        sig_outstanding_since: None,
        stuck_reported: false,
        stfu_sent: false,
        quiesce_deadline: None,
        last_commitment_signed: None,
        last_revoke: None,
    };
    switch.register_link(channel_id, Arc::clone(&mailbox));
    tokio::spawn(link.run(command_rx, shutdown));
    LinkHandle { channel_id, mailbox, commands: command_tx }
}

impl Link {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<LinkCommand>,
        shutdown: triggered::Listener,
    ) {
        info!("link {} starting", self.channel.id);
        if let Err(e) = self.start() {
            self.fail_link(e);
            return;
        }
        let mailbox = Arc::clone(&self.mailbox);
        loop {
            let timer = self.next_deadline();
            let result = tokio::select! {
                _ = shutdown.clone() => break,
                delivery = mailbox.next() => match delivery {
                    Some(d) => self.handle_delivery(d).await,
                    None => break,
                },
                cmd = commands.recv() => match cmd {
                    Some(c) => self.handle_command(c).await,
                    None => break,
                },
                _ = async {
                    match timer {
                        Some(t) => sleep_until(t).await,
                        None => std::future::pending().await,
                    }
                } => self.on_timer(),
            };
            if let Err(e) = result {
                self.fail_link(e);
                return;
            }
        }
        self.shutdown_cleanup();
    }

    fn start(&mut self) -> Result<(), LinkError> {
        let reestablish = self.channel.reestablish()?;
        self.send(Message::ChannelReestablish(reestablish));
        self.set_state(LinkState::Starting);
        Ok(())
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            info!("link {} {:?} -> {:?}", self.channel.id, self.state, state);
            self.state = state;
            self.emit(LinkEvent::LinkStateChanged { channel_id: self.channel.id, state });
        }
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn send(&self, msg: Message) {
        if self.outgoing.send(msg).is_err() {
            debug!("link {} peer transport gone", self.channel.id);
        }
    }

    fn persist_channel(&self) -> Result<(), persist::Error> {
        let entry = ChannelEntry {
            setup: self.channel.setup.clone(),
            state: self.channel.state().clone(),
        };
        self.persister.update_channel(&self.channel.id, &entry)
    }

    fn next_deadline(&self) -> Option<Instant> {
        let watchdog = self
            .sig_outstanding_since
            .filter(|_| !self.stuck_reported)
            .map(|t| t + self.switch.config().pending_commit_interval);
        [self.batch_deadline, watchdog, self.quiesce_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    fn on_timer(&mut self) -> Result<(), LinkError> {
        let now = Instant::now();
        if let Some(deadline) = self.quiesce_deadline {
            if now >= deadline {
                warn!("link {} quiescence timed out, resuming", self.channel.id);
                self.end_quiescence();
            }
        }
        if let Some(since) = self.sig_outstanding_since {
            if !self.stuck_reported
                && now >= since + self.switch.config().pending_commit_interval
            {
                warn!("link {} commitment stuck awaiting revocation", self.channel.id);
                self.stuck_reported = true;
                self.emit(LinkEvent::StuckCommitment { channel_id: self.channel.id });
            }
        }
        if let Some(deadline) = self.batch_deadline {
            if now >= deadline {
                self.maybe_sign_commitment()?;
            }
        }
        Ok(())
    }

    // Arm the batch timer, or sign immediately when the batch is full.
    fn schedule_commit(&mut self) -> Result<(), LinkError> {
        let pending = self.channel.pending_update_count();
        if pending == 0 {
            self.batch_deadline = None;
            return Ok(());
        }
        if pending >= self.switch.config().commit_batch_size as usize {
            return self.maybe_sign_commitment();
        }
        if self.batch_deadline.is_none() {
            self.batch_deadline = Some(Instant::now() + self.switch.config().commit_interval);
        }
        Ok(())
    }

    fn maybe_sign_commitment(&mut self) -> Result<(), LinkError> {
        if self.channel.pending_update_count() == 0 {
            self.batch_deadline = None;
            return Ok(());
        }
        if self.channel.awaiting_counterparty_revoke() {
            // will sign right after the revocation lands
            return Ok(());
        }
        let (_info, signature) = match self.channel.sign_next_commitment() {
            Ok(r) => r,
            Err(ChannelError::UpdateInFlight) | Err(ChannelError::NoUpdates) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        // durable before the signature leaves the node
        self.persist_channel()?;
        let msg = CommitmentSigned {
            channel_id: self.channel.id,
            signature,
            htlc_signatures: Vec::new(),
        };
        self.last_commitment_signed = Some(msg.clone());
        self.send(Message::CommitmentSigned(msg));
        self.batch_deadline = None;
        self.sig_outstanding_since = Some(Instant::now());
        self.stuck_reported = false;
        Ok(())
    }

    async fn handle_delivery(&mut self, delivery: Delivery) -> Result<(), LinkError> {
        match delivery {
            Delivery::Packet(Packet::Wire(msg)) => self.handle_wire(msg).await,
            Delivery::Packet(Packet::ForwardAdd(fwd)) => self.handle_forward(fwd),
            Delivery::Packet(Packet::Backward(res)) => self.handle_backward(res),
            Delivery::Expired(fwd) => {
                if let Err(e) =
                    self.switch.fail_forward(&fwd.incoming, FailureCode::TemporaryChannelFailure)
                {
                    warn!("link {} failed expiring forward: {}", self.channel.id, e);
                }
                Ok(())
            }
        }
    }

    // A forward from another link; commit it on this channel.
    fn handle_forward(&mut self, fwd: ForwardAdd) -> Result<(), LinkError> {
        if self.state != LinkState::Active && self.state != LinkState::Starting {
            return self.reject_forward(&fwd);
        }
        match self.channel.propose_add(
            fwd.amount_msat,
            fwd.payment_hash,
            fwd.cltv_expiry,
            fwd.onion.clone(),
        ) {
            Ok(htlc) => {
                let htlc_id = htlc.id;
                let outgoing = CircuitKey { channel_id: self.channel.id, htlc_id };
                self.switch.outgoing_committed(&fwd.incoming, outgoing)?;
                self.persist_channel()?;
                self.send(Message::UpdateAddHtlc(UpdateAddHtlc {
                    channel_id: self.channel.id,
                    htlc_id,
                    amount_msat: fwd.amount_msat,
                    payment_hash: fwd.payment_hash,
                    cltv_expiry: fwd.cltv_expiry,
                    onion_routing_packet: fwd.onion,
                }));
                self.emit(LinkEvent::HtlcForwarded {
                    channel_id: self.channel.id,
                    htlc_id,
                    amount_msat: fwd.amount_msat,
                    payment_hash: fwd.payment_hash,
                });
                self.schedule_commit()
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                info!("link {} cannot carry forward: {}", self.channel.id, e);
                self.reject_forward(&fwd)
            }
        }
    }

    fn reject_forward(&self, fwd: &ForwardAdd) -> Result<(), LinkError> {
        self.switch.fail_forward(&fwd.incoming, FailureCode::TemporaryChannelFailure)?;
        Ok(())
    }

    // A terminal outcome for an HTLC this link accepted earlier.
    fn handle_backward(&mut self, res: BackwardResolution) -> Result<(), LinkError> {
        let htlc_id = res.incoming.htlc_id;
        let result = match res.result {
            ResolutionResult::Settled { preimage } => {
                match self.channel.propose_settle(htlc_id, preimage) {
                    Ok(()) => {
                        self.send(Message::UpdateFulfillHtlc(UpdateFulfillHtlc {
                            channel_id: self.channel.id,
                            htlc_id,
                            payment_preimage: preimage,
                        }));
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            ResolutionResult::Failed { reason } => {
                match self.channel.propose_fail(htlc_id, reason.clone()) {
                    Ok(()) => {
                        self.send(Message::UpdateFailHtlc(UpdateFailHtlc {
                            channel_id: self.channel.id,
                            htlc_id,
                            reason,
                        }));
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        };
        match result {
            Ok(()) => {
                self.persist_channel()?;
                self.schedule_commit()
            }
            // a restart replay of an already-proposed resolution
            Err(ChannelError::UnknownHtlc { id }) => {
                debug!("link {} backward for settled htlc {}", self.channel.id, id);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!("link {} backward resolution failed: {}", self.channel.id, e);
                Ok(())
            }
        }
    }

    async fn handle_wire(&mut self, msg: Message) -> Result<(), LinkError> {
        match msg {
            Message::UpdateAddHtlc(m) => {
                self.channel.receive_add(
                    m.htlc_id,
                    m.amount_msat,
                    m.payment_hash,
                    m.cltv_expiry,
                    m.onion_routing_packet,
                )?;
                self.persist_channel()?;
                Ok(())
            }
            Message::UpdateFulfillHtlc(m) => {
                self.channel.receive_settle(m.htlc_id, m.payment_preimage)?;
                self.persist_channel()?;
                Ok(())
            }
            Message::UpdateFailHtlc(m) => {
                self.channel.receive_fail(m.htlc_id, m.reason)?;
                self.persist_channel()?;
                Ok(())
            }
            Message::UpdateFailMalformedHtlc(m) => {
                let reason =
                    encode_reason(&FailureCode::from_code(m.failure_code), &m.sha256_of_onion);
                self.channel.receive_fail(m.htlc_id, reason)?;
                self.persist_channel()?;
                Ok(())
            }
            Message::UpdateFee(m) => {
                self.channel.receive_fee(m.feerate_per_kw)?;
                self.persist_channel()?;
                Ok(())
            }
            Message::CommitmentSigned(m) => self.handle_commitment_signed(m).await,
            Message::RevokeAndAck(m) => self.handle_revoke_and_ack(m),
            Message::ChannelReestablish(m) => self.handle_reestablish(m),
            Message::Stfu(m) => self.handle_stfu(m),
            Message::Shutdown(_) => {
                self.emit(LinkEvent::CloseRequested { channel_id: self.channel.id });
                self.set_state(LinkState::ShuttingDown);
                Ok(())
            }
            Message::ClosingSigned(_) => {
                self.emit(LinkEvent::CloseRequested { channel_id: self.channel.id });
                Ok(())
            }
        }
    }

    async fn handle_commitment_signed(&mut self, m: CommitmentSigned) -> Result<(), LinkError> {
        let guard = self.channel.receive_commitment_signed(&m.signature)?;
        // the new commitment is durable before the revocation releases
        self.persist_channel()?;
        let (secret, next_point, outcome) = self.channel.revoke_previous_commitment(guard)?;
        self.persist_channel()?;
        let revoke = RevokeAndAck {
            channel_id: self.channel.id,
            per_commitment_secret: secret,
            next_per_commitment_point: next_point,
        };
        self.last_revoke = Some(revoke.clone());
        self.send(Message::RevokeAndAck(revoke));
        self.process_outcome(outcome).await?;
        // our own batch may have been waiting on the exchange
        self.schedule_commit()
    }

    fn handle_revoke_and_ack(&mut self, m: RevokeAndAck) -> Result<(), LinkError> {
        let outcome = self
            .channel
            .receive_revocation(m.per_commitment_secret, m.next_per_commitment_point)?;
        self.persist_channel()?;
        self.sig_outstanding_since = None;
        self.stuck_reported = false;
        for resolution in outcome.resolutions {
            // an HTLC we accepted is finally resolved; its circuit, if
            // any, is complete
            let incoming = CircuitKey { channel_id: self.channel.id, htlc_id: resolution.htlc_id };
            if self.switch.circuits().get(&incoming).is_some() {
                self.switch.circuit_finalized(&incoming)?;
            }
            self.emit(LinkEvent::HtlcResolved {
                channel_id: self.channel.id,
                htlc_id: resolution.htlc_id,
                payment_hash: resolution.payment_hash,
                result: resolution.result,
            });
        }
        self.schedule_commit()
    }

    // Finalized counterparty updates: locked-in adds go to the switch,
    // resolved offered HTLCs flow backward through their circuits.
    async fn process_outcome(&mut self, outcome: RevocationOutcome) -> Result<(), LinkError> {
        for htlc in outcome.locked_in {
            self.dispatch_locked_in(htlc).await?;
        }
        for resolution in outcome.resolutions {
            self.dispatch_resolution(resolution)?;
        }
        Ok(())
    }

    async fn dispatch_locked_in(&mut self, htlc: Htlc) -> Result<(), LinkError> {
        let incoming = CircuitKey { channel_id: self.channel.id, htlc_id: htlc.id };
        let hop = match self.switch.decoder().decode(&htlc.payment_hash, &htlc.onion) {
            Ok(hop) => hop,
            Err(code) => {
                let reason = encode_reason(&code, &[]);
                return self.fail_received(htlc.id, reason);
            }
        };
        match hop.forward {
            None => {
                self.emit(LinkEvent::HtlcReceived {
                    channel_id: self.channel.id,
                    htlc_id: htlc.id,
                    amount_msat: htlc.amount_msat,
                    payment_hash: htlc.payment_hash,
                });
                Ok(())
            }
            Some(next) => {
                let outcome = self
                    .switch
                    .route(incoming, htlc.payment_hash, htlc.amount_msat, hop.shared_secret, next)
                    .await?;
                match outcome {
                    RouteOutcome::Forwarded => Ok(()),
                    RouteOutcome::NoRouteLink => {
                        let reason = encode_reason(&FailureCode::UnknownNextPeer, &[]);
                        self.fail_received(htlc.id, reason)
                    }
                    RouteOutcome::LocalReject(code) => {
                        let mut reason = encode_reason(&code, &[]);
                        obfuscate_reason(&hop.shared_secret, &mut reason);
                        self.fail_received(htlc.id, reason)
                    }
                }
            }
        }
    }

    fn fail_received(&mut self, htlc_id: u64, reason: Vec<u8>) -> Result<(), LinkError> {
        self.channel.propose_fail(htlc_id, reason.clone())?;
        self.persist_channel()?;
        self.send(Message::UpdateFailHtlc(UpdateFailHtlc {
            channel_id: self.channel.id,
            htlc_id,
            reason,
        }));
        self.schedule_commit()
    }

    fn dispatch_resolution(&mut self, resolution: HtlcResolution) -> Result<(), LinkError> {
        let outgoing = CircuitKey { channel_id: self.channel.id, htlc_id: resolution.htlc_id };
        if self.switch.circuits().lookup_incoming(&outgoing).is_some() {
            self.switch.resolve(&outgoing, resolution.result)?;
            return Ok(());
        }
        // not part of a circuit, an HTLC this node originated
        self.emit(LinkEvent::HtlcResolved {
            channel_id: self.channel.id,
            htlc_id: resolution.htlc_id,
            payment_hash: resolution.payment_hash,
            result: resolution.result,
        });
        Ok(())
    }

    fn handle_reestablish(&mut self, m: ChannelReestablish) -> Result<(), LinkError> {
        match self.channel.check_reestablish(&m)? {
            ReestablishAction::Resume => {}
            ReestablishAction::RetransmitCommitment => {
                if let Some(msg) = self.last_commitment_signed.clone() {
                    info!("link {} retransmitting commitment_signed", self.channel.id);
                    self.send(Message::CommitmentSigned(msg));
                }
            }
            ReestablishAction::RetransmitRevocation => {
                if let Some(msg) = self.last_revoke.clone() {
                    info!("link {} retransmitting revoke_and_ack", self.channel.id);
                    self.send(Message::RevokeAndAck(msg));
                }
            }
        }
        self.set_state(LinkState::Active);
        Ok(())
    }

    fn handle_stfu(&mut self, _m: Stfu) -> Result<(), LinkError> {
        if !self.channel.setup.quiescence_supported {
            warn!("link {} peer sent stfu without negotiation", self.channel.id);
            return Ok(());
        }
        self.channel.set_quiescent(true);
        if !self.stfu_sent {
            self.send(Message::Stfu(Stfu { channel_id: self.channel.id, initiator: 0 }));
            self.stfu_sent = true;
        }
        self.quiesce_deadline = Some(Instant::now() + self.switch.config().quiescence_timeout);
        self.set_state(LinkState::Quiescing);
        Ok(())
    }

    fn end_quiescence(&mut self) {
        self.channel.set_quiescent(false);
        self.stfu_sent = false;
        self.quiesce_deadline = None;
        self.set_state(LinkState::Active);
    }

    async fn handle_command(&mut self, cmd: LinkCommand) -> Result<(), LinkError> {
        match cmd {
            LinkCommand::SendHtlc { amount_msat, payment_hash, cltv_expiry, onion } => {
                match self.channel.propose_add(amount_msat, payment_hash, cltv_expiry, onion.clone())
                {
                    Ok(htlc) => {
                        let htlc_id = htlc.id;
                        self.persist_channel()?;
                        self.send(Message::UpdateAddHtlc(UpdateAddHtlc {
                            channel_id: self.channel.id,
                            htlc_id,
                            amount_msat,
                            payment_hash,
                            cltv_expiry,
                            onion_routing_packet: onion,
                        }));
                        self.schedule_commit()
                    }
                    Err(e) if e.is_fatal() => Err(e.into()),
                    Err(e) => {
                        warn!("link {} cannot send htlc: {}", self.channel.id, e);
                        Ok(())
                    }
                }
            }
            LinkCommand::SettleHtlc { htlc_id, preimage } => {
                match self.channel.propose_settle(htlc_id, preimage) {
                    Ok(()) => {
                        self.persist_channel()?;
                        self.send(Message::UpdateFulfillHtlc(UpdateFulfillHtlc {
                            channel_id: self.channel.id,
                            htlc_id,
                            payment_preimage: preimage,
                        }));
                        self.schedule_commit()
                    }
                    Err(e) if e.is_fatal() => Err(e.into()),
                    Err(e) => {
                        warn!("link {} cannot settle htlc {}: {}", self.channel.id, htlc_id, e);
                        Ok(())
                    }
                }
            }
            LinkCommand::FailHtlc { htlc_id, code } => {
                let reason = encode_reason(&code, &[]);
                match self.fail_received(htlc_id, reason) {
                    Err(LinkError::Channel(e)) if !e.is_fatal() => {
                        warn!("link {} cannot fail htlc {}: {}", self.channel.id, htlc_id, e);
                        Ok(())
                    }
                    other => other,
                }
            }
            LinkCommand::UpdateFee { feerate_per_kw } => {
                match self.channel.propose_fee(feerate_per_kw) {
                    Ok(()) => {
                        self.persist_channel()?;
                        self.send(Message::UpdateFee(UpdateFee {
                            channel_id: self.channel.id,
                            feerate_per_kw,
                        }));
                        self.schedule_commit()
                    }
                    Err(e) if e.is_fatal() => Err(e.into()),
                    Err(e) => {
                        warn!("link {} cannot update fee: {}", self.channel.id, e);
                        Ok(())
                    }
                }
            }
            LinkCommand::Quiesce => {
                if !self.channel.setup.quiescence_supported {
                    warn!("link {} quiescence not negotiated", self.channel.id);
                } else if !self.channel.is_clean() {
                    warn!("link {} cannot quiesce with updates in flight", self.channel.id);
                } else {
                    self.send(Message::Stfu(Stfu { channel_id: self.channel.id, initiator: 1 }));
                    self.stfu_sent = true;
                    self.channel.set_quiescent(true);
                    self.quiesce_deadline =
                        Some(Instant::now() + self.switch.config().quiescence_timeout);
                    self.set_state(LinkState::Quiescing);
                }
                Ok(())
            }
            LinkCommand::Resume => {
                if self.state == LinkState::Quiescing {
                    self.end_quiescence();
                }
                Ok(())
            }
        }
    }

    fn fail_link(&mut self, e: LinkError) {
        match &e {
            LinkError::Channel(ce) if ce.is_fatal() => {
                error!("link {} channel failure: {:?}", self.channel.id, ce);
                self.emit(LinkEvent::ChannelBreached {
                    channel_id: self.channel.id,
                    reason: format!("{}", ce),
                });
            }
            other => error!("link {} stopping: {:?}", self.channel.id, other),
        }
        self.shutdown_cleanup();
    }

    // Fail in-flight forwards backward so upstream peers can release
    // their HTLCs instead of waiting for on-chain timeouts.
    fn shutdown_cleanup(&mut self) {
        self.set_state(LinkState::ShuttingDown);
        self.switch.unregister_link(&self.channel.id);
        self.mailbox.close();
        for packet in self.mailbox.drain() {
            if let Packet::ForwardAdd(fwd) = packet {
                if let Err(e) =
                    self.switch.fail_forward(&fwd.incoming, FailureCode::TemporaryChannelFailure)
                {
                    warn!("link {} drain failed for {}: {}", self.channel.id, fwd.incoming, e);
                }
            }
        }
        let offered: Vec<u64> = self
            .channel
            .state()
            .offered_htlcs
            .keys()
            .copied()
            .collect();
        for htlc_id in offered {
            let outgoing = CircuitKey { channel_id: self.channel.id, htlc_id };
            if self.switch.circuits().lookup_incoming(&outgoing).is_some() {
                let reason = encode_reason(&FailureCode::TemporaryChannelFailure, &[]);
                if let Err(e) =
                    self.switch.resolve(&outgoing, ResolutionResult::Failed { reason })
                {
                    warn!("link {} drain failed for {}: {}", self.channel.id, outgoing, e);
                }
            }
        }
        info!("link {} stopped", self.channel.id);
    }
}
