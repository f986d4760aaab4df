//! Ethernet framing and the network-interface contract the drivers
//! satisfy.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::types::{Ipv4Addr, MacAddr};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

pub const ETH_HEADER_LEN: usize = 14;

/// A frame queued for transmission or just received.
pub struct Packet {
    pub data: Vec<u8>,
}

impl Packet {
    pub fn with_header(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Packet {
        let mut data = Vec::with_capacity(ETH_HEADER_LEN + payload.len());
        data.extend_from_slice(&dst.0);
        data.extend_from_slice(&src.0);
        data.extend_from_slice(&ethertype.to_be_bytes());
        data.extend_from_slice(payload);
        Packet { data }
    }

    pub fn dst(&self) -> MacAddr {
        MacAddr(self.data[0..6].try_into().unwrap())
    }

    pub fn src(&self) -> MacAddr {
        MacAddr(self.data[6..12].try_into().unwrap())
    }

    pub fn ethertype(&self) -> u16 {
        u16::from_be_bytes([self.data[12], self.data[13]])
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[ETH_HEADER_LEN..]
    }

    /// Patch the destination and source of an already-built frame (used
    /// when a queued packet finally resolves).
    pub fn set_addrs(&mut self, dst: MacAddr, src: MacAddr) {
        self.data[0..6].copy_from_slice(&dst.0);
        self.data[6..12].copy_from_slice(&src.0);
    }
}

/// What the generic network stack needs from a driver.
pub trait NetDriver: Send + Sync {
    /// Hand a complete frame to the hardware.
    fn transmit(&self, frame: &Packet);
}

/// One configured interface.
pub struct NetIf {
    pub name: String,
    pub mac: MacAddr,
    pub ip: Mutex<Ipv4Addr>,
    pub netmask: Mutex<Ipv4Addr>,
    pub driver: Arc<dyn NetDriver>,
}

impl NetIf {
    pub fn new(name: &str, mac: MacAddr, driver: Arc<dyn NetDriver>) -> Arc<NetIf> {
        Arc::new(NetIf {
            name: String::from(name),
            mac,
            ip: Mutex::new(Ipv4Addr::ANY),
            netmask: Mutex::new(Ipv4Addr::ANY),
            driver,
        })
    }

    pub fn transmit(&self, frame: &Packet) {
        self.driver.transmit(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_layout() {
        let dst = MacAddr([1, 2, 3, 4, 5, 6]);
        let src = MacAddr([7, 8, 9, 10, 11, 12]);
        let p = Packet::with_header(dst, src, ETHERTYPE_ARP, b"xyz");
        assert_eq!(p.dst(), dst);
        assert_eq!(p.src(), src);
        assert_eq!(p.ethertype(), ETHERTYPE_ARP);
        assert_eq!(p.payload(), b"xyz");
        assert_eq!(p.data.len(), ETH_HEADER_LEN + 3);
    }
}
