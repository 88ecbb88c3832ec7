//! ARP probing for IPv4 addresses already in use on a link
//!
//! Probes follow RFC 5227: the sender protocol address is 0.0.0.0, so
//! stations hearing the probe do not learn a binding for the address under
//! test. Anyone answering for it, or probing for it at the same time, holds
//! a claim.

use std::io::{self, Read};
use std::mem;
use std::net::Ipv4Addr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, SockAddrStorage, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::time::Instant;
use tracing::debug;

use crate::error::RouterError;
use crate::network::AddressProber;
use crate::routing::{LinkInfo, MacAddr};

const ETH_P_ARP: u16 = 0x0806;
const ARPHRD_ETHER: u16 = 1;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ARPOP_REQUEST: u16 = 1;
const ARPOP_REPLY: u16 = 2;
const ARP_PACKET_LEN: usize = 28;
const BROADCAST: [u8; 6] = [0xff; 6];

/// ARP request for `target` sent from `sender` without a protocol address
pub fn probe_request(sender: MacAddr, target: Ipv4Addr) -> [u8; ARP_PACKET_LEN] {
    let mut packet = [0u8; ARP_PACKET_LEN];
    packet[0..2].copy_from_slice(&ARPHRD_ETHER.to_be_bytes());
    packet[2..4].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
    packet[4] = 6;
    packet[5] = 4;
    packet[6..8].copy_from_slice(&ARPOP_REQUEST.to_be_bytes());
    packet[8..14].copy_from_slice(&sender.0);
    // sender IP and target MAC stay zero
    packet[24..28].copy_from_slice(&target.octets());
    packet
}

/// MAC of a station other than `own` claiming `target` in an ARP payload
pub fn foreign_claim(packet: &[u8], target: Ipv4Addr, own: MacAddr) -> Option<MacAddr> {
    if packet.len() < ARP_PACKET_LEN
        || u16::from_be_bytes([packet[0], packet[1]]) != ARPHRD_ETHER
        || u16::from_be_bytes([packet[2], packet[3]]) != ETHERTYPE_IPV4
        || packet[4] != 6
        || packet[5] != 4
    {
        return None;
    }

    let op = u16::from_be_bytes([packet[6], packet[7]]);
    let sender = MacAddr::from_bytes(&packet[8..14])?;
    let sender_ip = Ipv4Addr::new(packet[14], packet[15], packet[16], packet[17]);
    let target_ip = Ipv4Addr::new(packet[24], packet[25], packet[26], packet[27]);
    if sender == own {
        return None;
    }

    let claimed = match op {
        ARPOP_REPLY | ARPOP_REQUEST if sender_ip == target => true,
        // a concurrent probe for the same address
        ARPOP_REQUEST => sender_ip.is_unspecified() && target_ip == target,
        _ => false,
    };
    claimed.then_some(sender)
}

/// Link-layer socket address on `link_index` for ARP frames to `dest`
fn link_layer_addr(link_index: u32, dest: [u8; 6]) -> SockAddr {
    let mut storage = SockAddrStorage::zeroed();
    // SAFETY: sockaddr_ll is one of the platform sockaddr types
    let sll = unsafe { storage.view_as::<libc::sockaddr_ll>() };
    sll.sll_family = libc::AF_PACKET as libc::c_ushort;
    sll.sll_protocol = ETH_P_ARP.to_be();
    sll.sll_ifindex = link_index as libc::c_int;
    sll.sll_halen = 6;
    sll.sll_addr[..6].copy_from_slice(&dest);

    let len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
    // SAFETY: the storage holds an initialized sockaddr_ll of `len` bytes
    unsafe { SockAddr::new(storage, len) }
}

/// Non-blocking ARP packet socket bound to `link_index`
///
/// The socket belongs to the namespace current at creation time.
pub fn packet_socket(link_index: u32) -> io::Result<Socket> {
    let protocol = Protocol::from(libc::c_int::from(ETH_P_ARP.to_be()));
    let socket = Socket::new(Domain::PACKET, Type::DGRAM, Some(protocol))?;
    socket.set_nonblocking(true)?;
    socket.bind(&link_layer_addr(link_index, BROADCAST))?;
    Ok(socket)
}

/// ARP prober on one pod interface
pub struct ArpProber {
    socket: AsyncFd<Socket>,
    interface: String,
    link_index: u32,
    mac: MacAddr,
}

impl ArpProber {
    pub fn new(socket: Socket, link: &LinkInfo) -> Result<Self, RouterError> {
        let failed = |source: io::Error| RouterError::ProbeFailed {
            interface: link.name.clone(),
            source,
        };
        let mac = link.mac.ok_or_else(|| {
            failed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "link has no hardware address",
            ))
        })?;

        Ok(Self {
            socket: AsyncFd::new(socket).map_err(failed)?,
            interface: link.name.clone(),
            link_index: link.index,
            mac,
        })
    }

    fn failed(&self, source: io::Error) -> RouterError {
        RouterError::ProbeFailed {
            interface: self.interface.clone(),
            source,
        }
    }

    async fn send(&self, packet: &[u8], dest: &SockAddr) -> io::Result<()> {
        loop {
            let mut guard = self.socket.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to(packet, dest)) {
                Ok(result) => return result.map(|_| ()),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AddressProber for ArpProber {
    async fn probe(&self, ip: Ipv4Addr, wait: Duration) -> Result<Option<MacAddr>, RouterError> {
        let request = probe_request(self.mac, ip);
        self.send(&request, &link_layer_addr(self.link_index, BROADCAST))
            .await
            .map_err(|e| self.failed(e))?;
        debug!("Sent ARP probe for {} on {}", ip, self.interface);

        let deadline = Instant::now() + wait;
        let mut buf = [0u8; 64];
        loop {
            let Ok(ready) = tokio::time::timeout_at(deadline, self.socket.readable()).await else {
                return Ok(None);
            };
            let mut guard = ready.map_err(|e| self.failed(e))?;

            let read = guard.try_io(|inner| {
                let mut socket = inner.get_ref();
                socket.read(&mut buf)
            });
            match read {
                Ok(Ok(n)) => {
                    if let Some(mac) = foreign_claim(&buf[..n], ip, self.mac) {
                        return Ok(Some(mac));
                    }
                }
                Ok(Err(e)) => return Err(self.failed(e)),
                Err(_would_block) => continue,
            }
        }
    }
}
