//! ARP: IPv4-to-Ethernet resolution with a fixed aging cache and a
//! bounded queue of packets waiting on resolution.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::time::HZ;

use super::ethernet::{NetIf, Packet, ETHERTYPE_ARP};
use super::types::{Ipv4Addr, MacAddr};

/// Cache slots.
pub const NR_ARP: usize = 32;
/// Entry lifetime: 20 minutes.
pub const ARP_MAXAGE_TICKS: u64 = 1200 * HZ;
/// Pruner period: 5 minutes.
pub const ARP_PRUNE_TICKS: u64 = 300 * HZ;
/// At most one REQUEST reply per second per interface.
const REPLY_RATE_TICKS: u64 = HZ;
/// Pending-packet queue bound.
pub const MAX_ARP_PACKETS: usize = 128;
/// How long a queued packet may wait for resolution.
const PENDING_TICKS: u64 = 10 * HZ;

const ARP_HW_ETHERNET: u16 = 1;
const ARP_PROTO_IPV4: u16 = 0x0800;
const ARP_OP_REQUEST: u16 = 1;
const ARP_OP_REPLY: u16 = 2;
pub const ARP_PACKET_LEN: usize = 28;

#[derive(Debug, Clone)]
pub struct ArpEntry {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub expiry: u64,
    pub ifname: String,
}

struct Pending {
    packet: Packet,
    ip: Ipv4Addr,
    expiry: u64,
    ifp: Arc<NetIf>,
}

pub struct ArpState {
    entries: [Option<ArpEntry>; NR_ARP],
    out_queue: Vec<Pending>,
    /// Last REQUEST reply tick, per interface.
    last_reply: BTreeMap<String, u64>,
}

impl ArpState {
    pub fn new() -> Self {
        const NONE: Option<ArpEntry> = None;
        ArpState {
            entries: [NONE; NR_ARP],
            out_queue: Vec::new(),
            last_reply: BTreeMap::new(),
        }
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.entries
            .iter()
            .flatten()
            .find(|e| e.ip == ip)
            .map(|e| e.mac)
    }

    /// Insert or refresh; a full table evicts the entry closest to
    /// expiry.
    pub fn insert(&mut self, ip: Ipv4Addr, mac: MacAddr, ifname: &str, now: u64) {
        let entry = ArpEntry {
            ip,
            mac,
            expiry: now + ARP_MAXAGE_TICKS,
            ifname: String::from(ifname),
        };
        if let Some(slot) = self.entries.iter_mut().flatten().find(|e| e.ip == ip) {
            *slot = entry;
            return;
        }
        if let Some(slot) = self.entries.iter_mut().find(|s| s.is_none()) {
            *slot = Some(entry);
            return;
        }
        let victim = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.as_ref().map(|e| e.expiry).unwrap_or(0))
            .map(|(i, _)| i)
            .unwrap_or(0);
        self.entries[victim] = Some(entry);
    }

    /// Drop entries whose lifetime ran out.
    pub fn prune(&mut self, now: u64) {
        for slot in self.entries.iter_mut() {
            if slot.as_ref().map_or(false, |e| e.expiry <= now) {
                *slot = None;
            }
        }
        self.out_queue.retain(|p| p.expiry > now);
    }

    pub fn entries(&self) -> Vec<ArpEntry> {
        self.entries.iter().flatten().cloned().collect()
    }

    pub fn queued(&self) -> usize {
        self.out_queue.len()
    }

    /// Resolve `ip` for transmission on `ifp` without touching the
    /// wire: broadcast and multicast map algebraically, everything else
    /// comes from the cache.
    pub fn resolve(&self, ifp: &NetIf, ip: Ipv4Addr) -> Option<MacAddr> {
        let netmask = *ifp.netmask.lock();
        if ip == Ipv4Addr::ANY || ip.is_broadcast(netmask) {
            return Some(MacAddr::BROADCAST);
        }
        if ip.is_multicast() {
            return Some(MacAddr([
                0x01,
                0x00,
                0x5E,
                ip.0[1] & 0x7F,
                ip.0[2],
                ip.0[3],
            ]));
        }
        self.lookup(ip)
    }

    /// Park `packet` until `ip` resolves and broadcast a REQUEST for
    /// it. A full queue first sheds expired entries, then the oldest.
    pub fn queue_packet(&mut self, ifp: &Arc<NetIf>, packet: Packet, ip: Ipv4Addr, now: u64) {
        if self.out_queue.len() >= MAX_ARP_PACKETS {
            self.out_queue.retain(|p| p.expiry > now);
        }
        if self.out_queue.len() >= MAX_ARP_PACKETS {
            self.out_queue.remove(0);
        }
        self.out_queue.push(Pending {
            packet,
            ip,
            expiry: now + PENDING_TICKS,
            ifp: ifp.clone(),
        });
        self.send_request(ifp, ip);
    }

    fn send_request(&self, ifp: &NetIf, target: Ipv4Addr) {
        let our_ip = *ifp.ip.lock();
        let payload = build_arp(
            ARP_OP_REQUEST,
            ifp.mac,
            our_ip,
            MacAddr::ZERO,
            target,
        );
        let frame = Packet::with_header(MacAddr::BROADCAST, ifp.mac, ETHERTYPE_ARP, &payload);
        ifp.transmit(&frame);
    }

    /// Release every parked packet whose destination now resolves,
    /// handing each to its interface exactly once.
    pub fn check_delayed_packets(&mut self, now: u64) {
        let mut remaining: Vec<Pending> = Vec::new();
        for mut pending in core::mem::take(&mut self.out_queue) {
            if pending.expiry <= now {
                continue;
            }
            match self.lookup(pending.ip) {
                Some(mac) => {
                    pending.packet.set_addrs(mac, pending.ifp.mac);
                    pending.ifp.transmit(&pending.packet);
                }
                None => remaining.push(pending),
            }
        }
        self.out_queue = remaining;
    }

    /// Ingest a received ARP payload (Ethernet header already
    /// stripped).
    pub fn receive(&mut self, ifp: &Arc<NetIf>, payload: &[u8], now: u64) {
        if payload.len() < ARP_PACKET_LEN {
            return;
        }
        let hwtype = u16::from_be_bytes([payload[0], payload[1]]);
        let proto = u16::from_be_bytes([payload[2], payload[3]]);
        let hwlen = payload[4];
        let protolen = payload[5];
        let op = u16::from_be_bytes([payload[6], payload[7]]);
        if hwtype != ARP_HW_ETHERNET || proto != ARP_PROTO_IPV4 || hwlen != 6 || protolen != 4 {
            return;
        }

        let sender_mac = MacAddr(payload[8..14].try_into().unwrap());
        let sender_ip = Ipv4Addr(payload[14..18].try_into().unwrap());
        let target_ip = Ipv4Addr(payload[24..28].try_into().unwrap());

        // A host never legitimately claims a group address.
        if sender_mac.is_broadcast() || sender_mac.is_multicast() {
            return;
        }

        let our_ip = *ifp.ip.lock();

        let already_existed = if let Some(existing) = self
            .entries
            .iter_mut()
            .flatten()
            .find(|e| e.ip == sender_ip)
        {
            existing.mac = sender_mac;
            existing.expiry = now + ARP_MAXAGE_TICKS;
            true
        } else {
            false
        };

        if target_ip == our_ip && !already_existed {
            self.insert(sender_ip, sender_mac, &ifp.name, now);
        }

        match op {
            ARP_OP_REQUEST if target_ip == our_ip => {
                let last = self.last_reply.get(&ifp.name).copied().unwrap_or(0);
                if last == 0 || now.saturating_sub(last) >= REPLY_RATE_TICKS {
                    self.last_reply.insert(ifp.name.clone(), now);
                    // Build the reply in place: swap the sender and
                    // target fields, filling in our own addresses.
                    let payload =
                        build_arp(ARP_OP_REPLY, ifp.mac, our_ip, sender_mac, sender_ip);
                    let frame =
                        Packet::with_header(sender_mac, ifp.mac, ETHERTYPE_ARP, &payload);
                    ifp.transmit(&frame);
                }
            }
            ARP_OP_REPLY => {
                crate::net::dhcp_notify(sender_ip);
            }
            _ => {}
        }

        self.check_delayed_packets(now);
    }
}

fn build_arp(
    op: u16,
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> [u8; ARP_PACKET_LEN] {
    let mut p = [0u8; ARP_PACKET_LEN];
    p[0..2].copy_from_slice(&ARP_HW_ETHERNET.to_be_bytes());
    p[2..4].copy_from_slice(&ARP_PROTO_IPV4.to_be_bytes());
    p[4] = 6;
    p[5] = 4;
    p[6..8].copy_from_slice(&op.to_be_bytes());
    p[8..14].copy_from_slice(&sender_mac.0);
    p[14..18].copy_from_slice(&sender_ip.0);
    p[18..24].copy_from_slice(&target_mac.0);
    p[24..28].copy_from_slice(&target_ip.0);
    p
}

lazy_static! {
    pub static ref ARP: Mutex<ArpState> = Mutex::new(ArpState::new());
}

/// `/proc/net/arp` rows: (ip, mac, interface).
pub fn entries_snapshot() -> Vec<(String, String, String)> {
    ARP.lock()
        .entries()
        .into_iter()
        .map(|e| {
            (
                alloc::format!("{}", e.ip),
                alloc::format!("{}", e.mac),
                e.ifname,
            )
        })
        .collect()
}

/// Kernel task body: reap expired entries every five minutes.
pub fn arp_pruner() {
    let chan = crate::scheduler::channel_of(&*ARP);
    loop {
        {
            let mut arp = ARP.lock();
            let now = crate::time::ticks();
            arp.prune(now);
        }
        crate::scheduler::block_task2(chan, ARP_PRUNE_TICKS);
    }
}

/// Resolve-or-queue for an outgoing IPv4 frame. On a cache miss the
/// packet is parked and a REQUEST goes out; the reply path flushes the
/// queue.
pub fn resolve_or_queue(
    ifp: &Arc<NetIf>,
    packet: Packet,
    ip: Ipv4Addr,
    now: u64,
) -> Option<MacAddr> {
    let mut arp = ARP.lock();
    match arp.resolve(ifp, ip) {
        Some(mac) => Some(mac),
        None => {
            arp.queue_packet(ifp, packet, ip, now);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ethernet::{NetDriver, ETHERTYPE_IPV4};
    use std::sync::Mutex as StdMutex;

    struct RecordingDriver {
        frames: StdMutex<Vec<Vec<u8>>>,
    }

    impl RecordingDriver {
        fn new() -> Arc<RecordingDriver> {
            Arc::new(RecordingDriver {
                frames: StdMutex::new(Vec::new()),
            })
        }
        fn sent(&self) -> Vec<Vec<u8>> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl NetDriver for RecordingDriver {
        fn transmit(&self, frame: &Packet) {
            self.frames.lock().unwrap().push(frame.data.clone());
        }
    }

    fn test_if(driver: &Arc<RecordingDriver>) -> Arc<NetIf> {
        let ifp = NetIf::new("eth0", MacAddr([2, 0, 0, 0, 0, 1]), driver.clone());
        *ifp.ip.lock() = Ipv4Addr([10, 0, 0, 1]);
        *ifp.netmask.lock() = Ipv4Addr([255, 255, 255, 0]);
        ifp
    }

    fn reply_from(ip: Ipv4Addr, mac: MacAddr, our_ip: Ipv4Addr) -> [u8; ARP_PACKET_LEN] {
        build_arp(ARP_OP_REPLY, mac, ip, MacAddr([2, 0, 0, 0, 0, 1]), our_ip)
    }

    /// Scenario: send to an unresolved IP, the packet waits, the reply
    /// releases it with the right addresses, exactly once.
    #[test]
    fn queued_packet_released_by_reply() {
        let driver = RecordingDriver::new();
        let ifp = test_if(&driver);
        let mut arp = ArpState::new();
        let dst = Ipv4Addr([10, 0, 0, 5]);

        assert_eq!(arp.resolve(&ifp, dst), None);
        let ip_frame = Packet::with_header(
            MacAddr::ZERO,
            ifp.mac,
            ETHERTYPE_IPV4,
            b"payload-bytes",
        );
        arp.queue_packet(&ifp, ip_frame, dst, 100);
        assert_eq!(arp.queued(), 1);

        // The REQUEST went out broadcast.
        let sent = driver.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][0..6], &[0xFF; 6]);

        let peer_mac = MacAddr([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        arp.receive(&ifp, &reply_from(dst, peer_mac, Ipv4Addr([10, 0, 0, 1])), 150);

        // Cache learned the peer with a fresh lifetime.
        let entry = arp
            .entries()
            .into_iter()
            .find(|e| e.ip == dst)
            .expect("entry learned");
        assert_eq!(entry.mac, peer_mac);
        assert_eq!(entry.expiry, 150 + ARP_MAXAGE_TICKS);

        // The queued frame was retargeted and transmitted exactly once.
        let sent = driver.sent();
        assert_eq!(sent.len(), 2);
        let released = &sent[1];
        assert_eq!(&released[0..6], &peer_mac.0);
        assert_eq!(&released[6..12], &ifp.mac.0);
        assert_eq!(
            u16::from_be_bytes([released[12], released[13]]),
            ETHERTYPE_IPV4
        );
        assert_eq!(arp.queued(), 0);
    }

    #[test]
    fn broadcast_and_multicast_resolve_algebraically() {
        let driver = RecordingDriver::new();
        let ifp = test_if(&driver);
        let arp = ArpState::new();

        assert_eq!(
            arp.resolve(&ifp, Ipv4Addr([10, 0, 0, 255])),
            Some(MacAddr::BROADCAST)
        );
        assert_eq!(
            arp.resolve(&ifp, Ipv4Addr([224, 1, 2, 3])),
            Some(MacAddr([0x01, 0x00, 0x5E, 1, 2, 3]))
        );
    }

    #[test]
    fn request_for_our_ip_is_answered_and_rate_limited() {
        let driver = RecordingDriver::new();
        let ifp = test_if(&driver);
        let mut arp = ArpState::new();
        let asker_mac = MacAddr([4, 4, 4, 4, 4, 4]);
        let asker_ip = Ipv4Addr([10, 0, 0, 9]);

        let request = build_arp(
            ARP_OP_REQUEST,
            asker_mac,
            asker_ip,
            MacAddr::ZERO,
            Ipv4Addr([10, 0, 0, 1]),
        );
        arp.receive(&ifp, &request, 1000);
        let sent = driver.sent();
        assert_eq!(sent.len(), 1);
        // Unicast reply straight back to the asker.
        assert_eq!(&sent[0][0..6], &asker_mac.0);
        let payload = &sent[0][14..];
        assert_eq!(u16::from_be_bytes([payload[6], payload[7]]), ARP_OP_REPLY);

        // A second request inside the same second is ignored.
        arp.receive(&ifp, &request, 1000 + HZ / 2);
        assert_eq!(driver.sent().len(), 1);

        // After a full second it is answered again.
        arp.receive(&ifp, &request, 1000 + 2 * HZ);
        assert_eq!(driver.sent().len(), 2);
    }

    #[test]
    fn group_source_macs_are_dropped() {
        let driver = RecordingDriver::new();
        let ifp = test_if(&driver);
        let mut arp = ArpState::new();
        let bad = build_arp(
            ARP_OP_REPLY,
            MacAddr::BROADCAST,
            Ipv4Addr([10, 0, 0, 7]),
            ifp.mac,
            Ipv4Addr([10, 0, 0, 1]),
        );
        arp.receive(&ifp, &bad, 50);
        assert!(arp.entries().is_empty());
    }

    #[test]
    fn aging_prunes_stale_entries() {
        let driver = RecordingDriver::new();
        let ifp = test_if(&driver);
        let mut arp = ArpState::new();
        arp.insert(Ipv4Addr([10, 0, 0, 2]), MacAddr([1; 6]), &ifp.name, 0);
        arp.insert(
            Ipv4Addr([10, 0, 0, 3]),
            MacAddr([2; 6]),
            &ifp.name,
            ARP_MAXAGE_TICKS / 2,
        );

        arp.prune(ARP_MAXAGE_TICKS + 1);
        let left = arp.entries();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].ip, Ipv4Addr([10, 0, 0, 3]));
    }

    #[test]
    fn full_table_evicts_soonest_expiry() {
        let driver = RecordingDriver::new();
        let ifp = test_if(&driver);
        let mut arp = ArpState::new();
        for i in 0..NR_ARP as u8 {
            arp.insert(
                Ipv4Addr([10, 0, 1, i]),
                MacAddr([i; 6]),
                &ifp.name,
                i as u64,
            );
        }
        // Entry inserted at tick 0 expires first; it is the victim.
        arp.insert(Ipv4Addr([10, 0, 2, 1]), MacAddr([9; 6]), &ifp.name, 500);
        assert!(arp.lookup(Ipv4Addr([10, 0, 1, 0])).is_none());
        assert!(arp.lookup(Ipv4Addr([10, 0, 2, 1])).is_some());
        assert_eq!(arp.entries().len(), NR_ARP);
    }

    #[test]
    fn refresh_updates_instead_of_duplicating() {
        let driver = RecordingDriver::new();
        let ifp = test_if(&driver);
        let mut arp = ArpState::new();
        let ip = Ipv4Addr([10, 0, 0, 4]);
        arp.insert(ip, MacAddr([1; 6]), &ifp.name, 0);
        arp.insert(ip, MacAddr([2; 6]), &ifp.name, 100);
        assert_eq!(arp.entries().len(), 1);
        assert_eq!(arp.lookup(ip), Some(MacAddr([2; 6])));
    }

    #[test]
    fn pending_queue_is_bounded() {
        let driver = RecordingDriver::new();
        let ifp = test_if(&driver);
        let mut arp = ArpState::new();
        for i in 0..MAX_ARP_PACKETS + 10 {
            let frame = Packet::with_header(
                MacAddr::ZERO,
                ifp.mac,
                ETHERTYPE_IPV4,
                &[i as u8],
            );
            arp.queue_packet(&ifp, frame, Ipv4Addr([10, 0, 3, (i % 200) as u8]), 0);
        }
        assert!(arp.queued() <= MAX_ARP_PACKETS);
    }
}
