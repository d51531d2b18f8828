//! UDP control packet listener.
//!
//! Single-hop sessions receive on port 3784 with the kernel enforcing a
//! minimum TTL of 255 (GTSM), so every packet read from that socket is
//! reported with TTL 255. Multi-hop sessions receive on 4784 where the TTL
//! is not checked. If the minimum TTL cannot be set the TTL is reported as
//! unknown and the state machine drops single-hop packets.

use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::AsRawFd;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::intake::IntakeSender;
use crate::packet::{ControlPacket, InboundPacket};
use crate::types::{BFD_MULTIHOP_PORT, BFD_SINGLE_HOP_PORT, BFD_SINGLE_HOP_TTL};

// Linux socket option numbers
const IP_MINTTL: libc::c_int = 21;
const IPV6_MINHOPCOUNT: libc::c_int = 73;

/// Largest datagram read; control packets with auth sections are larger
/// than 24 bytes but are rejected by the decoder anyway.
const RECV_BUFFER_LEN: usize = 512;

/// Listener counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub received: u64,
    pub malformed: u64,
    pub forwarded: u64,
    pub dropped: u64,
}

pub struct PacketListener {
    socket: UdpSocket,
    multihop: bool,
    gtsm: bool,
    stats: ListenerStats,
}

impl PacketListener {
    /// Binds the well-known port for the hop mode.
    pub async fn bind_default(addr: IpAddr, multihop: bool) -> Result<Self> {
        let port = if multihop {
            BFD_MULTIHOP_PORT
        } else {
            BFD_SINGLE_HOP_PORT
        };
        Self::bind(SocketAddr::new(addr, port), multihop).await
    }

    pub async fn bind(addr: SocketAddr, multihop: bool) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let gtsm = !multihop && set_min_ttl(&socket, addr.is_ipv6());
        info!(
            addr = %socket.local_addr()?,
            multihop,
            gtsm,
            "BFD listener bound"
        );
        Ok(Self {
            socket,
            multihop,
            gtsm,
            stats: ListenerStats::default(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// True if the kernel drops single-hop packets with TTL below 255.
    pub fn gtsm_enforced(&self) -> bool {
        self.gtsm
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Receives one datagram. Malformed packets yield `None`.
    pub async fn recv_one(&mut self) -> Result<Option<InboundPacket>> {
        let mut buf = [0u8; RECV_BUFFER_LEN];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        self.stats.received += 1;

        match ControlPacket::decode(&buf[..len]) {
            Ok(packet) => {
                let ttl = if self.gtsm {
                    Some(BFD_SINGLE_HOP_TTL)
                } else {
                    None
                };
                Ok(Some(
                    InboundPacket::new(packet, from.ip(), ttl).with_multihop(self.multihop),
                ))
            }
            Err(e) => {
                self.stats.malformed += 1;
                debug!(from = %from, error = %e, "dropping malformed BFD packet");
                Ok(None)
            }
        }
    }

    /// Forwards packets to the intake until shutdown or until the intake
    /// goes away.
    pub async fn run(
        mut self,
        sender: IntakeSender,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ListenerStats> {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = self.recv_one() => match received {
                    Ok(Some(inbound)) => {
                        if sender.send_packet(inbound).await.is_err() {
                            break;
                        }
                        self.stats.forwarded += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.stats.dropped += 1;
                        warn!(multihop = self.multihop, error = %e, "BFD receive failed");
                    }
                },
            }
        }
        info!(multihop = self.multihop, stats = ?self.stats, "BFD listener stopped");
        Ok(self.stats)
    }
}

fn set_min_ttl(socket: &UdpSocket, ipv6: bool) -> bool {
    let (level, option) = if ipv6 {
        (libc::IPPROTO_IPV6, IPV6_MINHOPCOUNT)
    } else {
        (libc::IPPROTO_IP, IP_MINTTL)
    };
    let value = libc::c_int::from(BFD_SINGLE_HOP_TTL);
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            option,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        warn!(
            error = %std::io::Error::last_os_error(),
            "failed to set minimum TTL, single-hop packets will be dropped"
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BfdSessionState;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn down_packet() -> Vec<u8> {
        ControlPacket {
            state: BfdSessionState::Down,
            my_discriminator: 200,
            ..Default::default()
        }
        .encode()
    }

    async fn sender_socket(ttl: u32) -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.set_ttl(ttl).unwrap();
        socket
    }

    #[tokio::test]
    async fn test_single_hop_reports_ttl_255() {
        let mut listener = PacketListener::bind("127.0.0.1:0".parse().unwrap(), false)
            .await
            .unwrap();
        let to = listener.local_addr().unwrap();

        let peer = sender_socket(255).await;
        peer.send_to(&down_packet(), to).await.unwrap();

        let inbound = listener.recv_one().await.unwrap().unwrap();
        assert_eq!(inbound.packet.my_discriminator, 200);
        assert_eq!(inbound.source, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert!(!inbound.multihop);
        if listener.gtsm_enforced() {
            assert_eq!(inbound.ttl, Some(255));
        } else {
            assert_eq!(inbound.ttl, None);
        }
    }

    #[tokio::test]
    async fn test_single_hop_drops_low_ttl_in_kernel() {
        let mut listener = PacketListener::bind("127.0.0.1:0".parse().unwrap(), false)
            .await
            .unwrap();
        if !listener.gtsm_enforced() {
            return;
        }
        let to = listener.local_addr().unwrap();

        let peer = sender_socket(64).await;
        peer.send_to(&down_packet(), to).await.unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(100), listener.recv_one()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_multihop_and_malformed() {
        let mut listener = PacketListener::bind("127.0.0.1:0".parse().unwrap(), true)
            .await
            .unwrap();
        assert!(!listener.gtsm_enforced());
        let to = listener.local_addr().unwrap();

        let peer = sender_socket(64).await;
        peer.send_to(&[0x20, 0x40], to).await.unwrap();
        peer.send_to(&down_packet(), to).await.unwrap();

        assert!(listener.recv_one().await.unwrap().is_none());
        let inbound = listener.recv_one().await.unwrap().unwrap();
        assert_eq!(inbound.ttl, None);
        assert!(inbound.multihop);
        assert_eq!(
            listener.stats(),
            &ListenerStats {
                received: 2,
                malformed: 1,
                ..Default::default()
            }
        );
    }
}
