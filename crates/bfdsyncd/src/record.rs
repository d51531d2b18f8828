//! BFD session record as stored in the shared segment.
//!
//! # Encoding
//!
//! Fixed 96 bytes, little endian:
//!
//! ```text
//!  0  local discriminator   u32     40  peer address   [u8; 16]
//!  4  remote discriminator  u32     56  source address [u8; 16]
//!  8  state u8, mult u8, remote mult u8, tos u8
//! 12  flags u8, peer family u8, source family u8, reserved u8
//! 16  min tx  20  min rx  24  remote min tx         72  tx handle u64
//! 28  remote min rx  32  remote min echo rx  36 -   80  rx handle u64
//!                                                   88  reserved
//! ```
//!
//! IPv4 addresses occupy the first four bytes of their field; family 0
//! means no address.

use std::io::{self, Cursor, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sonic_sai::api::BfdOffloadSession;
use sonic_sai::{BfdRxSessionOid, BfdTxSessionOid};
use sonic_shm_arena::{ArenaObject, ObjectType};

use crate::types::{BfdSessionConfig, BfdSessionState};

/// Arena type holding BFD sessions.
pub const BFD_SESSION: ObjectType = ObjectType::new(1);

/// Encoded size of [`BfdSessionRecord`].
pub const BFD_SESSION_RECORD_LEN: usize = 96;

const FLAG_MULTIHOP: u8 = 0x01;
const FLAG_POLL_PENDING: u8 = 0x02;
const FLAG_FINAL_PENDING: u8 = 0x04;

const FAMILY_NONE: u8 = 0;
const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// One BFD session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BfdSessionRecord {
    pub local_discriminator: u32,
    /// Learned from the peer; 0 while unknown.
    pub remote_discriminator: u32,
    pub state: BfdSessionState,
    /// Local detect multiplier.
    pub multiplier: u8,
    /// Detect multiplier last advertised by the peer.
    pub remote_multiplier: u8,
    pub tos: u8,
    pub multihop: bool,
    /// A poll sequence is outstanding; transmitted packets carry P.
    pub poll_pending: bool,
    /// A poll is being answered; transmitted packets carry F.
    pub final_pending: bool,
    pub min_tx_us: u32,
    pub min_rx_us: u32,
    pub remote_min_tx_us: u32,
    pub remote_min_rx_us: u32,
    pub remote_min_echo_rx_us: u32,
    pub peer_addr: IpAddr,
    pub src_addr: Option<IpAddr>,
    pub tx_session: BfdTxSessionOid,
    pub rx_session: BfdRxSessionOid,
}

impl BfdSessionRecord {
    /// Fresh record in `Down` with nothing learned from the peer.
    pub fn new(config: &BfdSessionConfig) -> Self {
        Self {
            local_discriminator: config.local_discriminator,
            remote_discriminator: 0,
            state: BfdSessionState::Down,
            multiplier: config.multiplier,
            remote_multiplier: 0,
            tos: config.tos,
            multihop: config.multihop,
            poll_pending: false,
            final_pending: false,
            min_tx_us: config.min_tx_us,
            min_rx_us: config.min_rx_us,
            remote_min_tx_us: 0,
            remote_min_rx_us: 0,
            remote_min_echo_rx_us: 0,
            peer_addr: config.peer_addr,
            src_addr: config.src_addr,
            tx_session: BfdTxSessionOid::NULL,
            rx_session: BfdRxSessionOid::NULL,
        }
    }

    /// Time without a qualifying packet after which the session goes Down.
    ///
    /// `None` until the peer has advertised its multiplier.
    pub fn detection_time(&self) -> Option<Duration> {
        if self.remote_multiplier == 0 {
            return None;
        }
        let interval = self.min_rx_us.max(self.remote_min_tx_us);
        Some(Duration::from_micros(
            u64::from(self.remote_multiplier) * u64::from(interval),
        ))
    }

    /// Parameters handed to the offload adapter.
    pub fn offload_view(&self) -> BfdOffloadSession {
        BfdOffloadSession {
            local_discriminator: self.local_discriminator,
            remote_discriminator: self.remote_discriminator,
            state: self.state.to_sai(),
            multiplier: self.multiplier,
            remote_multiplier: self.remote_multiplier,
            min_tx_us: self.min_tx_us,
            min_rx_us: self.min_rx_us,
            remote_min_tx_us: self.remote_min_tx_us,
            remote_min_rx_us: self.remote_min_rx_us,
            remote_min_echo_rx_us: self.remote_min_echo_rx_us,
            poll: self.poll_pending,
            final_flag: self.final_pending,
            multihop: self.multihop,
            peer_addr: Some(self.peer_addr),
            src_addr: self.src_addr,
            tos: self.tos,
            tx_session: self.tx_session,
            rx_session: self.rx_session,
        }
    }
}

fn write_addr(w: &mut impl Write, addr: Option<IpAddr>) -> io::Result<()> {
    let mut raw = [0u8; 16];
    match addr {
        Some(IpAddr::V4(v4)) => raw[..4].copy_from_slice(&v4.octets()),
        Some(IpAddr::V6(v6)) => raw.copy_from_slice(&v6.octets()),
        None => {}
    }
    w.write_all(&raw)
}

fn family(addr: Option<IpAddr>) -> u8 {
    match addr {
        Some(IpAddr::V4(_)) => FAMILY_V4,
        Some(IpAddr::V6(_)) => FAMILY_V6,
        None => FAMILY_NONE,
    }
}

fn read_addr(r: &mut impl Read, family: u8) -> io::Result<Option<IpAddr>> {
    let mut raw = [0u8; 16];
    r.read_exact(&mut raw)?;
    match family {
        FAMILY_NONE => Ok(None),
        FAMILY_V4 => Ok(Some(IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])))),
        FAMILY_V6 => Ok(Some(IpAddr::V6(Ipv6Addr::from(raw)))),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown address family {}", other),
        )),
    }
}

impl ArenaObject for BfdSessionRecord {
    const OBJECT_TYPE: ObjectType = BFD_SESSION;
    const ENCODED_LEN: usize = BFD_SESSION_RECORD_LEN;

    fn encode(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut w = Cursor::new(buf);
        w.write_u32::<LittleEndian>(self.local_discriminator)?;
        w.write_u32::<LittleEndian>(self.remote_discriminator)?;
        w.write_u8(self.state.wire_value())?;
        w.write_u8(self.multiplier)?;
        w.write_u8(self.remote_multiplier)?;
        w.write_u8(self.tos)?;

        let mut flags = 0;
        if self.multihop {
            flags |= FLAG_MULTIHOP;
        }
        if self.poll_pending {
            flags |= FLAG_POLL_PENDING;
        }
        if self.final_pending {
            flags |= FLAG_FINAL_PENDING;
        }
        w.write_u8(flags)?;
        w.write_u8(family(Some(self.peer_addr)))?;
        w.write_u8(family(self.src_addr))?;
        w.write_u8(0)?;

        w.write_u32::<LittleEndian>(self.min_tx_us)?;
        w.write_u32::<LittleEndian>(self.min_rx_us)?;
        w.write_u32::<LittleEndian>(self.remote_min_tx_us)?;
        w.write_u32::<LittleEndian>(self.remote_min_rx_us)?;
        w.write_u32::<LittleEndian>(self.remote_min_echo_rx_us)?;
        w.write_u32::<LittleEndian>(0)?;

        write_addr(&mut w, Some(self.peer_addr))?;
        write_addr(&mut w, self.src_addr)?;
        w.write_u64::<LittleEndian>(self.tx_session.as_raw())?;
        w.write_u64::<LittleEndian>(self.rx_session.as_raw())?;
        w.write_u64::<LittleEndian>(0)
    }

    fn decode(buf: &[u8]) -> io::Result<Self> {
        let mut r = Cursor::new(buf);
        let local_discriminator = r.read_u32::<LittleEndian>()?;
        let remote_discriminator = r.read_u32::<LittleEndian>()?;
        let raw_state = r.read_u8()?;
        let state = BfdSessionState::from_wire(raw_state).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, format!("bad state {}", raw_state))
        })?;
        let multiplier = r.read_u8()?;
        let remote_multiplier = r.read_u8()?;
        let tos = r.read_u8()?;
        let flags = r.read_u8()?;
        let peer_family = r.read_u8()?;
        let src_family = r.read_u8()?;
        let _reserved = r.read_u8()?;

        let min_tx_us = r.read_u32::<LittleEndian>()?;
        let min_rx_us = r.read_u32::<LittleEndian>()?;
        let remote_min_tx_us = r.read_u32::<LittleEndian>()?;
        let remote_min_rx_us = r.read_u32::<LittleEndian>()?;
        let remote_min_echo_rx_us = r.read_u32::<LittleEndian>()?;
        let _reserved = r.read_u32::<LittleEndian>()?;

        let peer_addr = read_addr(&mut r, peer_family)?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "session without peer address")
        })?;
        let src_addr = read_addr(&mut r, src_family)?;
        let tx_session = BfdTxSessionOid::from_raw_unchecked(r.read_u64::<LittleEndian>()?);
        let rx_session = BfdRxSessionOid::from_raw_unchecked(r.read_u64::<LittleEndian>()?);

        Ok(Self {
            local_discriminator,
            remote_discriminator,
            state,
            multiplier,
            remote_multiplier,
            tos,
            multihop: flags & FLAG_MULTIHOP != 0,
            poll_pending: flags & FLAG_POLL_PENDING != 0,
            final_pending: flags & FLAG_FINAL_PENDING != 0,
            min_tx_us,
            min_rx_us,
            remote_min_tx_us,
            remote_min_rx_us,
            remote_min_echo_rx_us,
            peer_addr,
            src_addr,
            tx_session,
            rx_session,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record() -> BfdSessionRecord {
        let config = BfdSessionConfig::new(100, "fc00::2".parse().unwrap())
            .with_src_addr("fc00::1".parse().unwrap())
            .with_multihop(true);
        BfdSessionRecord::new(&config)
    }

    #[test]
    fn test_encoding_fills_exactly_the_slot() {
        let mut rec = record();
        rec.state = BfdSessionState::Up;
        rec.remote_discriminator = 200;
        rec.poll_pending = true;
        rec.tx_session = BfdTxSessionOid::from_raw_unchecked(0x11);

        let mut buf = [0xffu8; BFD_SESSION_RECORD_LEN];
        rec.encode(&mut buf).unwrap();
        assert_eq!(BfdSessionRecord::decode(&buf).unwrap(), rec);

        let mut short = [0u8; BFD_SESSION_RECORD_LEN - 1];
        assert!(rec.encode(&mut short).is_err());
    }

    #[test]
    fn test_zeroed_slot_does_not_decode() {
        // A freshly allocated, zero-filled payload has no peer
        let err = BfdSessionRecord::decode(&[0u8; BFD_SESSION_RECORD_LEN]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_detection_time() {
        let mut rec = record();
        assert_eq!(rec.detection_time(), None);

        rec.min_rx_us = 300_000;
        rec.remote_min_tx_us = 500_000;
        rec.remote_multiplier = 3;
        assert_eq!(rec.detection_time(), Some(Duration::from_millis(1500)));

        rec.remote_min_tx_us = 100_000;
        assert_eq!(rec.detection_time(), Some(Duration::from_millis(900)));
    }

    #[test]
    fn test_offload_view_carries_handles_and_flags() {
        let mut rec = record();
        rec.final_pending = true;
        rec.rx_session = BfdRxSessionOid::from_raw_unchecked(0x22);

        let view = rec.offload_view();
        assert!(view.final_flag);
        assert!(!view.poll);
        assert!(view.multihop);
        assert_eq!(view.rx_session.as_raw(), 0x22);
        assert_eq!(view.peer_addr, Some(rec.peer_addr));
    }
}
