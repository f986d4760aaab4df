//! Networking core: interface registry, ethernet framing and the ARP
//! resolver. Higher protocols ride on top of `resolve_or_queue`.

pub mod arp;
pub mod ethernet;
pub mod types;

use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use ethernet::{NetIf, Packet, ETHERTYPE_ARP};
use types::Ipv4Addr;

lazy_static! {
    static ref INTERFACES: Mutex<Vec<Arc<NetIf>>> = Mutex::new(Vec::new());
}

pub fn register_interface(ifp: Arc<NetIf>) {
    crate::log_info!("net: interface {} ({}) up", ifp.name, ifp.mac);
    INTERFACES.lock().push(ifp);
}

pub fn interfaces() -> Vec<Arc<NetIf>> {
    INTERFACES.lock().clone()
}

pub fn interface_by_name(name: &str) -> Option<Arc<NetIf>> {
    INTERFACES.lock().iter().find(|i| i.name == name).cloned()
}

/// Inbound frame dispatch from the drivers' receive paths.
pub fn receive_frame(ifp: &Arc<NetIf>, frame: &Packet) {
    match frame.ethertype() {
        ETHERTYPE_ARP => {
            arp::ARP
                .lock()
                .receive(ifp, frame.payload(), crate::time::ticks());
        }
        _ => {
            // IPv4 and friends are outside the concurrency core; frames
            // for them are dropped here.
        }
    }
}

/// DHCP probe hook: the client may be waiting on an ARP reply to verify
/// a candidate address. Nothing registers today; the ARP reply path
/// still calls through here.
pub fn dhcp_notify(_sender: Ipv4Addr) {}

/// Spawn the ARP pruner once the scheduler runs.
pub fn init() {
    crate::scheduler::spawn_kernel_task(arp::arp_pruner, "arp");
    crate::log_info!("net: arp resolver online");
}
