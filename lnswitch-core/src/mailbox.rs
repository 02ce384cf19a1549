//! Per-link delivery queue.
//!
//! The switch never blocks on a link: everything destined for a link
//! goes through its mailbox and the link task drains it at its own pace.
//! Forward adds grow stale while a link is offline and are expired back
//! to the sender; peer wire traffic and backward resolutions are always
//! delivered, because dropping them would strand channel or circuit
//! state.

use std::collections::VecDeque;

use log::*;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

use crate::channel::{PaymentHash, ResolutionResult};
use crate::circuit::CircuitKey;
use crate::prelude::*;
use crate::wire::Message;

/// An add to forward out through this link's channel
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardAdd {
    /// The incoming leg's circuit key
    pub incoming: CircuitKey,
    /// Outgoing amount after the forwarding fee
    pub amount_msat: u64,
    /// Payment hash
    pub payment_hash: PaymentHash,
    /// Outgoing CLTV expiry
    pub cltv_expiry: u32,
    /// Onion for the next hop
    pub onion: Vec<u8>,
}

/// A terminal outcome travelling backward to the incoming link
#[derive(Clone, Debug, PartialEq)]
pub struct BackwardResolution {
    /// The incoming leg this resolves
    pub incoming: CircuitKey,
    /// The outcome
    pub result: ResolutionResult,
}

/// Anything a link can receive
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    /// A wire message from the connected peer
    Wire(Message),
    /// A forward from another link
    ForwardAdd(ForwardAdd),
    /// A resolution for an HTLC this link accepted
    Backward(BackwardResolution),
}

/// What the link gets when it polls its mailbox
#[derive(Clone, Debug, PartialEq)]
pub enum Delivery {
    /// Deliver this packet
    Packet(Packet),
    /// This forward waited too long; fail it backward instead
    Expired(ForwardAdd),
}

struct QueuedPacket {
    packet: Packet,
    enqueued_at: Instant,
}

#[derive(Default)]
struct MailboxInner {
    queue: VecDeque<QueuedPacket>,
    closed: bool,
}

/// The delivery queue for a single link
pub struct Mailbox {
    inner: Mutex<MailboxInner>,
    notify: Notify,
    delivery_timeout: Duration,
}

impl Mailbox {
    /// Create a mailbox; `delivery_timeout` bounds how long a forward
    /// add may wait
    pub fn new(delivery_timeout: Duration) -> Self {
        Mailbox {
            inner: Mutex::new(MailboxInner::default()),
            notify: Notify::new(),
            delivery_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MailboxInner> {
        self.inner.lock().expect("mailbox poisoned")
    }

    /// Queue a packet for the link
    pub fn enqueue(&self, packet: Packet) {
        {
            let mut inner = self.lock();
            if inner.closed {
                debug!("dropping packet for closed mailbox");
                return;
            }
            inner.queue.push_back(QueuedPacket { packet, enqueued_at: Instant::now() });
        }
        self.notify.notify_one();
    }

    /// Dequeue the next delivery, waiting until one is available.
    ///
    /// Returns `None` once the mailbox is closed and drained.
    pub async fn next(&self) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if let Some(queued) = inner.queue.pop_front() {
                    drop(inner);
                    return Some(self.deliver(queued));
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn deliver(&self, queued: QueuedPacket) -> Delivery {
        if let Packet::ForwardAdd(add) = &queued.packet {
            if queued.enqueued_at.elapsed() >= self.delivery_timeout {
                warn!("forward for circuit {} expired in mailbox", add.incoming);
                return Delivery::Expired(add.clone());
            }
        }
        Delivery::Packet(queued.packet)
    }

    /// Close the mailbox; queued packets are still drained
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    /// Remove and return everything still queued, for shutdown cleanup
    pub fn drain(&self) -> Vec<Packet> {
        self.lock().queue.drain(..).map(|q| q.packet).collect()
    }

    /// Number of queued packets
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_utils::*;
    use crate::wire::Stfu;

    fn forward(id: u64) -> ForwardAdd {
        ForwardAdd {
            incoming: CircuitKey { channel_id: test_channel_id(1), htlc_id: id },
            amount_msat: 1000,
            payment_hash: test_payment_hash(1),
            cltv_expiry: 500_000,
            onion: vec![],
        }
    }

    fn wire_packet() -> Packet {
        Packet::Wire(Message::Stfu(Stfu { channel_id: test_channel_id(1), initiator: 1 }))
    }

    #[tokio::test]
    async fn delivers_in_order_test() {
        let mailbox = Mailbox::new(Duration::from_secs(60));
        mailbox.enqueue(wire_packet());
        mailbox.enqueue(Packet::ForwardAdd(forward(0)));
        assert_eq!(mailbox.next().await, Some(Delivery::Packet(wire_packet())));
        assert_eq!(
            mailbox.next().await,
            Some(Delivery::Packet(Packet::ForwardAdd(forward(0))))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_forward_expires_test() {
        let mailbox = Mailbox::new(Duration::from_secs(60));
        mailbox.enqueue(Packet::ForwardAdd(forward(0)));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(mailbox.next().await, Some(Delivery::Expired(forward(0))));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_wire_and_resolutions_still_delivered_test() {
        let mailbox = Mailbox::new(Duration::from_secs(60));
        let backward = Packet::Backward(BackwardResolution {
            incoming: CircuitKey { channel_id: test_channel_id(1), htlc_id: 0 },
            result: ResolutionResult::Failed { reason: vec![] },
        });
        mailbox.enqueue(wire_packet());
        mailbox.enqueue(backward.clone());
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(mailbox.next().await, Some(Delivery::Packet(wire_packet())));
        assert_eq!(mailbox.next().await, Some(Delivery::Packet(backward)));
    }

    #[tokio::test]
    async fn close_drains_then_ends_test() {
        let mailbox = Mailbox::new(Duration::from_secs(60));
        mailbox.enqueue(wire_packet());
        mailbox.close();
        assert!(mailbox.next().await.is_some());
        assert!(mailbox.next().await.is_none());
        // post-close enqueues are dropped
        mailbox.enqueue(wire_packet());
        assert!(mailbox.next().await.is_none());
    }

    #[tokio::test]
    async fn next_wakes_on_enqueue_test() {
        let mailbox = Arc::new(Mailbox::new(Duration::from_secs(60)));
        let waiter = {
            let mailbox = Arc::clone(&mailbox);
            tokio::spawn(async move { mailbox.next().await })
        };
        tokio::task::yield_now().await;
        mailbox.enqueue(wire_packet());
        let delivery = waiter.await.unwrap();
        assert_eq!(delivery, Some(Delivery::Packet(wire_packet())));
    }
}
