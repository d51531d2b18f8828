//! BFD control packet codec (RFC 5880 section 4.1).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Vers |  Diag   |Sta|P|F|C|A|D|M|  Detect Mult  |    Length     |
//! |                       My Discriminator                        |
//! |                      Your Discriminator                       |
//! |                    Desired Min TX Interval                    |
//! |                   Required Min RX Interval                    |
//! |                 Required Min Echo RX Interval                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::io::Cursor;
use std::net::IpAddr;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use thiserror::Error;

use crate::types::BfdSessionState;

/// Protocol version carried in every packet.
pub const BFD_VERSION: u8 = 1;

/// Length of a control packet without authentication section.
pub const BFD_CONTROL_PACKET_LEN: usize = 24;

const FLAG_POLL: u8 = 0x20;
const FLAG_FINAL: u8 = 0x10;
const FLAG_CPI: u8 = 0x08;
const FLAG_AUTH: u8 = 0x04;
const FLAG_DEMAND: u8 = 0x02;
const FLAG_MULTIPOINT: u8 = 0x01;

/// Reasons a received packet is dropped before reaching any session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("packet truncated to {0} bytes")]
    Truncated(usize),

    #[error("unsupported version {0}")]
    BadVersion(u8),

    #[error("length field {length} invalid for {received} received bytes")]
    BadLength { length: u8, received: usize },

    #[error("detect multiplier is zero")]
    ZeroMultiplier,

    #[error("multipoint bit set")]
    Multipoint,

    #[error("my discriminator is zero")]
    ZeroMyDiscriminator,

    /// Your Discriminator may only be zero while the sender is Down or AdminDown.
    #[error("your discriminator is zero in state {0}")]
    MissingYourDiscriminator(BfdSessionState),

    #[error("authentication is not supported")]
    AuthenticationUnsupported,
}

/// Decoded control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub diagnostic: u8,
    pub state: BfdSessionState,
    pub poll: bool,
    pub final_flag: bool,
    pub control_plane_independent: bool,
    pub demand: bool,
    pub multiplier: u8,
    pub my_discriminator: u32,
    pub your_discriminator: u32,
    pub desired_min_tx_us: u32,
    pub required_min_rx_us: u32,
    pub required_min_echo_rx_us: u32,
}

impl Default for ControlPacket {
    fn default() -> Self {
        Self {
            diagnostic: 0,
            state: BfdSessionState::Down,
            poll: false,
            final_flag: false,
            control_plane_independent: false,
            demand: false,
            multiplier: 3,
            my_discriminator: 0,
            your_discriminator: 0,
            desired_min_tx_us: 1_000_000,
            required_min_rx_us: 1_000_000,
            required_min_echo_rx_us: 0,
        }
    }
}

impl ControlPacket {
    /// Decodes and validates a packet per RFC 5880 section 6.8.6.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < BFD_CONTROL_PACKET_LEN {
            return Err(PacketError::Truncated(buf.len()));
        }
        let mut r = Cursor::new(buf);
        let truncated = |_| PacketError::Truncated(buf.len());

        let vers_diag = r.read_u8().map_err(truncated)?;
        let version = vers_diag >> 5;
        if version != BFD_VERSION {
            return Err(PacketError::BadVersion(version));
        }
        let sta_flags = r.read_u8().map_err(truncated)?;
        let multiplier = r.read_u8().map_err(truncated)?;
        let length = r.read_u8().map_err(truncated)?;

        if sta_flags & FLAG_AUTH != 0 {
            return Err(PacketError::AuthenticationUnsupported);
        }
        if (length as usize) < BFD_CONTROL_PACKET_LEN || length as usize > buf.len() {
            return Err(PacketError::BadLength {
                length,
                received: buf.len(),
            });
        }
        if multiplier == 0 {
            return Err(PacketError::ZeroMultiplier);
        }
        if sta_flags & FLAG_MULTIPOINT != 0 {
            return Err(PacketError::Multipoint);
        }

        let packet = Self {
            diagnostic: vers_diag & 0x1f,
            state: BfdSessionState::from_wire(sta_flags >> 6).unwrap_or_default(),
            poll: sta_flags & FLAG_POLL != 0,
            final_flag: sta_flags & FLAG_FINAL != 0,
            control_plane_independent: sta_flags & FLAG_CPI != 0,
            demand: sta_flags & FLAG_DEMAND != 0,
            multiplier,
            my_discriminator: r.read_u32::<BigEndian>().map_err(truncated)?,
            your_discriminator: r.read_u32::<BigEndian>().map_err(truncated)?,
            desired_min_tx_us: r.read_u32::<BigEndian>().map_err(truncated)?,
            required_min_rx_us: r.read_u32::<BigEndian>().map_err(truncated)?,
            required_min_echo_rx_us: r.read_u32::<BigEndian>().map_err(truncated)?,
        };

        if packet.my_discriminator == 0 {
            return Err(PacketError::ZeroMyDiscriminator);
        }
        if packet.your_discriminator == 0
            && !matches!(packet.state, BfdSessionState::Down | BfdSessionState::AdminDown)
        {
            return Err(PacketError::MissingYourDiscriminator(packet.state));
        }
        Ok(packet)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut flags = self.state.wire_value() << 6;
        if self.poll {
            flags |= FLAG_POLL;
        }
        if self.final_flag {
            flags |= FLAG_FINAL;
        }
        if self.control_plane_independent {
            flags |= FLAG_CPI;
        }
        if self.demand {
            flags |= FLAG_DEMAND;
        }

        let mut buf = vec![0u8; BFD_CONTROL_PACKET_LEN];
        buf[0] = (BFD_VERSION << 5) | (self.diagnostic & 0x1f);
        buf[1] = flags;
        buf[2] = self.multiplier;
        buf[3] = BFD_CONTROL_PACKET_LEN as u8;
        BigEndian::write_u32(&mut buf[4..8], self.my_discriminator);
        BigEndian::write_u32(&mut buf[8..12], self.your_discriminator);
        BigEndian::write_u32(&mut buf[12..16], self.desired_min_tx_us);
        BigEndian::write_u32(&mut buf[16..20], self.required_min_rx_us);
        BigEndian::write_u32(&mut buf[20..24], self.required_min_echo_rx_us);
        buf
    }
}

/// A control packet together with how it arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub packet: ControlPacket,
    pub source: IpAddr,
    /// Received TTL / hop limit; `None` when the transport did not report it.
    pub ttl: Option<u8>,
    /// Arrived on the multihop port.
    pub multihop: bool,
}

impl InboundPacket {
    pub fn new(packet: ControlPacket, source: IpAddr, ttl: Option<u8>) -> Self {
        Self {
            packet,
            source,
            ttl,
            multihop: false,
        }
    }

    pub fn with_multihop(mut self, multihop: bool) -> Self {
        self.multihop = multihop;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn up_packet() -> ControlPacket {
        ControlPacket {
            state: BfdSessionState::Up,
            poll: true,
            multiplier: 5,
            my_discriminator: 200,
            your_discriminator: 100,
            desired_min_tx_us: 300_000,
            required_min_rx_us: 250_000,
            ..Default::default()
        }
    }

    #[test]
    fn test_wire_layout() {
        let bytes = up_packet().encode();
        assert_eq!(bytes.len(), BFD_CONTROL_PACKET_LEN);
        assert_eq!(bytes[0], 0x20);
        // Up (3) in the top bits plus P
        assert_eq!(bytes[1], 0xc0 | 0x20);
        assert_eq!(bytes[2], 5);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 200]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 100]);

        assert_eq!(ControlPacket::decode(&bytes).unwrap(), up_packet());
    }

    #[test]
    fn test_rejects_malformed() {
        let good = up_packet().encode();

        assert_eq!(
            ControlPacket::decode(&good[..20]),
            Err(PacketError::Truncated(20))
        );

        let mut bad = good.clone();
        bad[0] = 0x40;
        assert_eq!(ControlPacket::decode(&bad), Err(PacketError::BadVersion(2)));

        let mut bad = good.clone();
        bad[2] = 0;
        assert_eq!(ControlPacket::decode(&bad), Err(PacketError::ZeroMultiplier));

        let mut bad = good.clone();
        bad[1] |= FLAG_MULTIPOINT;
        assert_eq!(ControlPacket::decode(&bad), Err(PacketError::Multipoint));

        let mut bad = good.clone();
        bad[3] = 40;
        assert!(matches!(
            ControlPacket::decode(&bad),
            Err(PacketError::BadLength { length: 40, .. })
        ));

        let mut bad = good;
        bad[1] |= FLAG_AUTH;
        assert_eq!(
            ControlPacket::decode(&bad),
            Err(PacketError::AuthenticationUnsupported)
        );
    }

    #[test]
    fn test_your_discriminator_required_once_past_down() {
        let first_contact = ControlPacket {
            my_discriminator: 100,
            ..Default::default()
        };
        assert!(ControlPacket::decode(&first_contact.encode()).is_ok());

        let premature = ControlPacket {
            state: BfdSessionState::Init,
            ..first_contact
        };
        assert_eq!(
            ControlPacket::decode(&premature.encode()),
            Err(PacketError::MissingYourDiscriminator(BfdSessionState::Init))
        );

        let anonymous = ControlPacket::default();
        assert_eq!(
            ControlPacket::decode(&anonymous.encode()),
            Err(PacketError::ZeroMyDiscriminator)
        );
    }
}
