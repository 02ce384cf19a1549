//! BOLT #2 channel messages, framed as big-endian type-prefixed records.
//!
//! The byte layout here is the interoperability boundary with remote peers
//! and must match the standardized wire format bit for bit.

use core::fmt;
use core::fmt::{Debug, Formatter};

use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as, Bytes, IfIsHumanReadable};

use crate::channel::{ChannelId, PaymentHash, PaymentPreimage};

/// Length of a sphinx onion routing packet
pub const ONION_PACKET_LEN: usize = 1366;

/// Maximum message size accepted from the wire
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Wire codec error
#[derive(Debug, PartialEq)]
pub enum Error {
    /// The message type is not one we handle
    UnknownType(u16),
    /// The buffer ended before the message did
    ShortRead,
    /// Extra bytes after the message body, with the message type
    TrailingBytes(u16),
    /// A length-prefixed field had an impossible length
    BadLength(usize),
    /// Message exceeds [`MAX_MESSAGE_SIZE`]
    MessageTooLarge,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

/// Wire codec result
pub type Result<T> = core::result::Result<T, Error>;

macro_rules! array_impl {
    ($ty:ident, $len:tt, $doc:expr) => {
        #[doc = $doc]
        #[serde_as]
        #[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $ty(#[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")] pub [u8; $len]);

        impl Debug for $ty {
            fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}({})", stringify!($ty), hex::encode(&self.0[..]))
            }
        }
    };
}

array_impl!(Signature, 64, "An opaque 64-byte compact signature");
array_impl!(PubKey, 33, "An opaque 33-byte compressed point");

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::ShortRead);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.read_bytes(N)?);
        Ok(buf)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    // u16 length prefixed bytes
    fn read_octets(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }
}

fn put_u16(buf: &mut Vec<u8>, val: u16) {
    buf.extend_from_slice(&val.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, val: u32) {
    buf.extend_from_slice(&val.to_be_bytes());
}

fn put_u64(buf: &mut Vec<u8>, val: u64) {
    buf.extend_from_slice(&val.to_be_bytes());
}

fn put_octets(buf: &mut Vec<u8>, val: &[u8]) {
    debug_assert!(val.len() <= u16::MAX as usize);
    put_u16(buf, val.len() as u16);
    buf.extend_from_slice(val);
}

/// Request a pause of channel updates (quiescence)
#[derive(Clone, Debug, PartialEq)]
pub struct Stfu {
    /// The channel
    pub channel_id: ChannelId,
    /// 1 if the sender is the quiescence initiator
    pub initiator: u8,
}

/// Begin cooperative close
#[derive(Clone, Debug, PartialEq)]
pub struct Shutdown {
    /// The channel
    pub channel_id: ChannelId,
    /// Script to pay the sender's balance to
    pub scriptpubkey: Vec<u8>,
}

/// Cooperative close fee negotiation
#[derive(Clone, Debug, PartialEq)]
pub struct ClosingSigned {
    /// The channel
    pub channel_id: ChannelId,
    /// Proposed closing fee
    pub fee_satoshis: u64,
    /// Signature over the closing transaction
    pub signature: Signature,
}

/// Offer an HTLC
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateAddHtlc {
    /// The channel
    pub channel_id: ChannelId,
    /// Sender-assigned, strictly increasing id
    pub htlc_id: u64,
    /// Amount in millisatoshi
    pub amount_msat: u64,
    /// Payment hash
    pub payment_hash: PaymentHash,
    /// Absolute expiry height
    pub cltv_expiry: u32,
    /// Onion routing packet, exactly [`ONION_PACKET_LEN`] bytes
    pub onion_routing_packet: Vec<u8>,
}

/// Settle an HTLC with its preimage
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateFulfillHtlc {
    /// The channel
    pub channel_id: ChannelId,
    /// Id assigned by the HTLC offerer
    pub htlc_id: u64,
    /// Preimage of the payment hash
    pub payment_preimage: PaymentPreimage,
}

/// Fail an HTLC with an obfuscated reason
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateFailHtlc {
    /// The channel
    pub channel_id: ChannelId,
    /// Id assigned by the HTLC offerer
    pub htlc_id: u64,
    /// Onion-encrypted failure reason
    pub reason: Vec<u8>,
}

/// Fail an HTLC whose onion could not be parsed
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateFailMalformedHtlc {
    /// The channel
    pub channel_id: ChannelId,
    /// Id assigned by the HTLC offerer
    pub htlc_id: u64,
    /// Hash of the offending onion
    pub sha256_of_onion: [u8; 32],
    /// BADONION failure code
    pub failure_code: u16,
}

/// Sign the counterparty's next commitment
#[derive(Clone, Debug, PartialEq)]
pub struct CommitmentSigned {
    /// The channel
    pub channel_id: ChannelId,
    /// Signature over the new commitment transaction
    pub signature: Signature,
    /// One signature per non-dust HTLC, in output order
    pub htlc_signatures: Vec<Signature>,
}

/// Revoke the previous commitment
#[derive(Clone, Debug, PartialEq)]
pub struct RevokeAndAck {
    /// The channel
    pub channel_id: ChannelId,
    /// Secret that invalidates the revoked commitment
    pub per_commitment_secret: [u8; 32],
    /// Commitment point for the next commitment
    pub next_per_commitment_point: PubKey,
}

/// Change the commitment feerate, sent by the funder only
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateFee {
    /// The channel
    pub channel_id: ChannelId,
    /// New feerate in satoshi per 1000 weight
    pub feerate_per_kw: u32,
}

/// Reconcile commitment state after a reconnection
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelReestablish {
    /// The channel
    pub channel_id: ChannelId,
    /// Commitment number the sender expects to sign next
    pub next_commitment_number: u64,
    /// Commitment number the sender expects to revoke next
    pub next_revocation_number: u64,
    /// Last revocation secret the sender received
    pub your_last_per_commitment_secret: [u8; 32],
    /// The sender's current commitment point
    pub my_current_per_commitment_point: PubKey,
}

/// A channel message
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum Message {
    Stfu(Stfu),
    Shutdown(Shutdown),
    ClosingSigned(ClosingSigned),
    UpdateAddHtlc(UpdateAddHtlc),
    UpdateFulfillHtlc(UpdateFulfillHtlc),
    UpdateFailHtlc(UpdateFailHtlc),
    CommitmentSigned(CommitmentSigned),
    RevokeAndAck(RevokeAndAck),
    UpdateFee(UpdateFee),
    UpdateFailMalformedHtlc(UpdateFailMalformedHtlc),
    ChannelReestablish(ChannelReestablish),
}

impl Message {
    /// BOLT #1 message type
    pub fn message_type(&self) -> u16 {
        match self {
            Message::Stfu(_) => 2,
            Message::Shutdown(_) => 38,
            Message::ClosingSigned(_) => 39,
            Message::UpdateAddHtlc(_) => 128,
            Message::UpdateFulfillHtlc(_) => 130,
            Message::UpdateFailHtlc(_) => 131,
            Message::CommitmentSigned(_) => 132,
            Message::RevokeAndAck(_) => 133,
            Message::UpdateFee(_) => 134,
            Message::UpdateFailMalformedHtlc(_) => 135,
            Message::ChannelReestablish(_) => 136,
        }
    }

    /// The channel this message belongs to
    pub fn channel_id(&self) -> &ChannelId {
        match self {
            Message::Stfu(m) => &m.channel_id,
            Message::Shutdown(m) => &m.channel_id,
            Message::ClosingSigned(m) => &m.channel_id,
            Message::UpdateAddHtlc(m) => &m.channel_id,
            Message::UpdateFulfillHtlc(m) => &m.channel_id,
            Message::UpdateFailHtlc(m) => &m.channel_id,
            Message::CommitmentSigned(m) => &m.channel_id,
            Message::RevokeAndAck(m) => &m.channel_id,
            Message::UpdateFee(m) => &m.channel_id,
            Message::UpdateFailMalformedHtlc(m) => &m.channel_id,
            Message::ChannelReestablish(m) => &m.channel_id,
        }
    }

    /// Serialize with the type prefix
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u16(&mut buf, self.message_type());
        match self {
            Message::Stfu(m) => {
                buf.extend_from_slice(&m.channel_id.0);
                buf.push(m.initiator);
            }
            Message::Shutdown(m) => {
                buf.extend_from_slice(&m.channel_id.0);
                put_octets(&mut buf, &m.scriptpubkey);
            }
            Message::ClosingSigned(m) => {
                buf.extend_from_slice(&m.channel_id.0);
                put_u64(&mut buf, m.fee_satoshis);
                buf.extend_from_slice(&m.signature.0);
            }
            Message::UpdateAddHtlc(m) => {
                debug_assert_eq!(m.onion_routing_packet.len(), ONION_PACKET_LEN);
                buf.extend_from_slice(&m.channel_id.0);
                put_u64(&mut buf, m.htlc_id);
                put_u64(&mut buf, m.amount_msat);
                buf.extend_from_slice(&m.payment_hash.0);
                put_u32(&mut buf, m.cltv_expiry);
                buf.extend_from_slice(&m.onion_routing_packet);
            }
            Message::UpdateFulfillHtlc(m) => {
                buf.extend_from_slice(&m.channel_id.0);
                put_u64(&mut buf, m.htlc_id);
                buf.extend_from_slice(&m.payment_preimage.0);
            }
            Message::UpdateFailHtlc(m) => {
                buf.extend_from_slice(&m.channel_id.0);
                put_u64(&mut buf, m.htlc_id);
                put_octets(&mut buf, &m.reason);
            }
            Message::CommitmentSigned(m) => {
                buf.extend_from_slice(&m.channel_id.0);
                buf.extend_from_slice(&m.signature.0);
                put_u16(&mut buf, m.htlc_signatures.len() as u16);
                for sig in m.htlc_signatures.iter() {
                    buf.extend_from_slice(&sig.0);
                }
            }
            Message::RevokeAndAck(m) => {
                buf.extend_from_slice(&m.channel_id.0);
                buf.extend_from_slice(&m.per_commitment_secret);
                buf.extend_from_slice(&m.next_per_commitment_point.0);
            }
            Message::UpdateFee(m) => {
                buf.extend_from_slice(&m.channel_id.0);
                put_u32(&mut buf, m.feerate_per_kw);
            }
            Message::UpdateFailMalformedHtlc(m) => {
                buf.extend_from_slice(&m.channel_id.0);
                put_u64(&mut buf, m.htlc_id);
                buf.extend_from_slice(&m.sha256_of_onion);
                put_u16(&mut buf, m.failure_code);
            }
            Message::ChannelReestablish(m) => {
                buf.extend_from_slice(&m.channel_id.0);
                put_u64(&mut buf, m.next_commitment_number);
                put_u64(&mut buf, m.next_revocation_number);
                buf.extend_from_slice(&m.your_last_per_commitment_secret);
                buf.extend_from_slice(&m.my_current_per_commitment_point.0);
            }
        }
        buf
    }

    /// Deserialize a type-prefixed message, rejecting trailing bytes
    pub fn decode(buf: &[u8]) -> Result<Message> {
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge);
        }
        let mut r = Reader::new(buf);
        let message_type = r.read_u16()?;
        let msg = match message_type {
            2 => Message::Stfu(Stfu {
                channel_id: ChannelId::new(r.read_array()?),
                initiator: r.read_u8()?,
            }),
            38 => Message::Shutdown(Shutdown {
                channel_id: ChannelId::new(r.read_array()?),
                scriptpubkey: r.read_octets()?,
            }),
            39 => Message::ClosingSigned(ClosingSigned {
                channel_id: ChannelId::new(r.read_array()?),
                fee_satoshis: r.read_u64()?,
                signature: Signature(r.read_array()?),
            }),
            128 => Message::UpdateAddHtlc(UpdateAddHtlc {
                channel_id: ChannelId::new(r.read_array()?),
                htlc_id: r.read_u64()?,
                amount_msat: r.read_u64()?,
                payment_hash: PaymentHash(r.read_array()?),
                cltv_expiry: r.read_u32()?,
                onion_routing_packet: r.read_bytes(ONION_PACKET_LEN)?.to_vec(),
            }),
            130 => Message::UpdateFulfillHtlc(UpdateFulfillHtlc {
                channel_id: ChannelId::new(r.read_array()?),
                htlc_id: r.read_u64()?,
                payment_preimage: PaymentPreimage(r.read_array()?),
            }),
            131 => Message::UpdateFailHtlc(UpdateFailHtlc {
                channel_id: ChannelId::new(r.read_array()?),
                htlc_id: r.read_u64()?,
                reason: r.read_octets()?,
            }),
            132 => {
                let channel_id = ChannelId::new(r.read_array()?);
                let signature = Signature(r.read_array()?);
                let num_htlcs = r.read_u16()? as usize;
                let mut htlc_signatures = Vec::with_capacity(num_htlcs);
                for _ in 0..num_htlcs {
                    htlc_signatures.push(Signature(r.read_array()?));
                }
                Message::CommitmentSigned(CommitmentSigned {
                    channel_id,
                    signature,
                    htlc_signatures,
                })
            }
            133 => Message::RevokeAndAck(RevokeAndAck {
                channel_id: ChannelId::new(r.read_array()?),
                per_commitment_secret: r.read_array()?,
                next_per_commitment_point: PubKey(r.read_array()?),
            }),
            134 => Message::UpdateFee(UpdateFee {
                channel_id: ChannelId::new(r.read_array()?),
                feerate_per_kw: r.read_u32()?,
            }),
            135 => Message::UpdateFailMalformedHtlc(UpdateFailMalformedHtlc {
                channel_id: ChannelId::new(r.read_array()?),
                htlc_id: r.read_u64()?,
                sha256_of_onion: r.read_array()?,
                failure_code: r.read_u16()?,
            }),
            136 => Message::ChannelReestablish(ChannelReestablish {
                channel_id: ChannelId::new(r.read_array()?),
                next_commitment_number: r.read_u64()?,
                next_revocation_number: r.read_u64()?,
                your_last_per_commitment_secret: r.read_array()?,
                my_current_per_commitment_point: PubKey(r.read_array()?),
            }),
            t => return Err(Error::UnknownType(t)),
        };
        if r.remaining() != 0 {
            return Err(Error::TrailingBytes(message_type));
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chan() -> ChannelId {
        ChannelId::new([0x11; 32])
    }

    #[test]
    fn update_add_htlc_layout_test() {
        let msg = Message::UpdateAddHtlc(UpdateAddHtlc {
            channel_id: chan(),
            htlc_id: 7,
            amount_msat: 10_000,
            payment_hash: PaymentHash([0x22; 32]),
            cltv_expiry: 500_000,
            onion_routing_packet: vec![0x33; ONION_PACKET_LEN],
        });
        let buf = msg.encode();
        // type + channel_id + htlc_id + amount + hash + expiry + onion
        assert_eq!(buf.len(), 2 + 32 + 8 + 8 + 32 + 4 + ONION_PACKET_LEN);
        assert_eq!(&buf[0..2], &[0x00, 0x80]); // type 128
        assert_eq!(&buf[2..34], &[0x11; 32]);
        assert_eq!(&buf[34..42], &7u64.to_be_bytes());
        assert_eq!(&buf[42..50], &10_000u64.to_be_bytes());
        assert_eq!(&buf[50..82], &[0x22; 32]);
        assert_eq!(&buf[82..86], &500_000u32.to_be_bytes());
        assert_eq!(Message::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn fulfill_layout_test() {
        let msg = Message::UpdateFulfillHtlc(UpdateFulfillHtlc {
            channel_id: chan(),
            htlc_id: 1,
            payment_preimage: PaymentPreimage([0x44; 32]),
        });
        let buf = msg.encode();
        assert_eq!(buf.len(), 2 + 32 + 8 + 32);
        assert_eq!(&buf[0..2], &[0x00, 0x82]); // type 130
        assert_eq!(Message::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn fail_reason_length_prefix_test() {
        let msg = Message::UpdateFailHtlc(UpdateFailHtlc {
            channel_id: chan(),
            htlc_id: 3,
            reason: vec![0xab; 292],
        });
        let buf = msg.encode();
        assert_eq!(&buf[42..44], &292u16.to_be_bytes());
        assert_eq!(Message::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn commitment_signed_htlc_sigs_test() {
        let msg = Message::CommitmentSigned(CommitmentSigned {
            channel_id: chan(),
            signature: Signature([0x55; 64]),
            htlc_signatures: vec![Signature([0x66; 64]), Signature([0x77; 64])],
        });
        let buf = msg.encode();
        assert_eq!(buf.len(), 2 + 32 + 64 + 2 + 2 * 64);
        assert_eq!(Message::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn reestablish_roundtrip_test() {
        let msg = Message::ChannelReestablish(ChannelReestablish {
            channel_id: chan(),
            next_commitment_number: 42,
            next_revocation_number: 41,
            your_last_per_commitment_secret: [9; 32],
            my_current_per_commitment_point: PubKey([2; 33]),
        });
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn unknown_type_test() {
        let buf = [0x00u8, 0x01, 0x00];
        assert_eq!(Message::decode(&buf), Err(Error::UnknownType(1)));
    }

    #[test]
    fn trailing_bytes_test() {
        let mut buf = Message::UpdateFee(UpdateFee { channel_id: chan(), feerate_per_kw: 253 })
            .encode();
        buf.push(0);
        assert_eq!(Message::decode(&buf), Err(Error::TrailingBytes(134)));
    }

    #[test]
    fn short_read_test() {
        let buf = Message::UpdateFee(UpdateFee { channel_id: chan(), feerate_per_kw: 253 })
            .encode();
        assert_eq!(Message::decode(&buf[..20]), Err(Error::ShortRead));
    }
}
