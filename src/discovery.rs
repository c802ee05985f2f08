//! Component E — Discovery Engine (spec §4.5).
//!
//! Periodic UDP beacon plus a TCP handshake for service-list exchange. No
//! suspension points (spec §5): beacon send/receive and the handshake are
//! driven entirely from `poll_*` calls on non-blocking sockets, invoked by
//! the dispatch loop (`dispatch.rs`).

use std::net::{IpAddr, SocketAddr, UdpSocket};

use serde::{Deserialize, Serialize};

use crate::config::NetworkConfig;
use crate::error::RuntimeError;
use crate::log_debug;
use crate::message::Timestamp;
use crate::peer::{PeerId, PeerState, PeerTable};

/// Beacon payload. Spec §4.5/§6: "a small fixed-schema record... the exact
/// bit layout is unspecified here but must be symmetric between sender and
/// receiver" — encoded as JSON over UDP rather than a hand-rolled binary
/// layout, since nothing about this record is performance-sensitive and the
/// crate already depends on `serde_json` for config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beacon {
    pub application_name: String,
    pub process_id: u64,
    pub discovery_port: u16,
    pub tcp_port: u16,
    pub udp_port: u16,
    /// `true` if the sender called `set_clock` and is acting as master
    /// (spec §4.6: election is static — this just advertises the outcome so
    /// clients know which peer to ping).
    pub is_master: bool,
}

/// Secondary discovery mode for networks without broadcast (spec_full §B):
/// an explicit unicast peer list to beacon at directly.
pub enum DiscoveryMode {
    Broadcast,
    Hub(Vec<SocketAddr>),
}

pub struct DiscoveryEngine {
    socket: UdpSocket,
    application_name: String,
    process_id: u64,
    mode: DiscoveryMode,
    broadcast_addr: SocketAddr,
    last_beacon: Timestamp,
    local_tcp_port: u16,
    local_udp_port: u16,
    is_master: bool,
}

impl DiscoveryEngine {
    pub fn bind(
        application_name: String,
        process_id: u64,
        config: &NetworkConfig,
        local_tcp_port: u16,
        local_udp_port: u16,
    ) -> Result<Self, RuntimeError> {
        let socket = UdpSocket::bind(("0.0.0.0", config.discovery_port)).map_err(RuntimeError::from)?;
        socket.set_nonblocking(true).map_err(RuntimeError::from)?;
        socket.set_broadcast(true).map_err(RuntimeError::from)?;
        let broadcast_addr: SocketAddr = format!("{}:{}", config.broadcast_addr, config.discovery_port)
            .parse()
            .map_err(|_| RuntimeError::Protocol("invalid broadcast_addr in config".into()))?;

        Ok(DiscoveryEngine {
            socket,
            application_name,
            process_id,
            mode: DiscoveryMode::Broadcast,
            broadcast_addr,
            last_beacon: f64::NEG_INFINITY,
            local_tcp_port,
            local_udp_port,
            is_master: false,
        })
    }

    pub fn set_mode(&mut self, mode: DiscoveryMode) {
        self.mode = mode;
    }

    /// Called once this process becomes master (spec §4.6 "election is
    /// static"), so subsequent beacons advertise it.
    pub fn announce_as_master(&mut self) {
        self.is_master = true;
    }

    fn beacon_payload(&self) -> Beacon {
        Beacon {
            application_name: self.application_name.clone(),
            process_id: self.process_id,
            discovery_port: self.broadcast_addr.port(),
            tcp_port: self.local_tcp_port,
            udp_port: self.local_udp_port,
            is_master: self.is_master,
        }
    }

    /// Emits a beacon if `discovery_interval_ms` has elapsed (spec §4.7 step
    /// 5). Beacons continue after connection so late joiners still discover
    /// existing peers (spec §4.5).
    pub fn maybe_beacon(&mut self, now: Timestamp, interval: Timestamp) {
        if now - self.last_beacon < interval {
            return;
        }
        self.last_beacon = now;
        let payload = match serde_json::to_vec(&self.beacon_payload()) {
            Ok(p) => p,
            Err(_) => return,
        };
        let targets: Vec<SocketAddr> = match &self.mode {
            DiscoveryMode::Broadcast => vec![self.broadcast_addr],
            DiscoveryMode::Hub(peers) => peers.clone(),
        };
        for target in targets {
            let _ = self.socket.send_to(&payload, target);
        }
    }

    /// Drains pending beacon datagrams. For each beacon from a matching
    /// application whose process id differs from ours, returns the parsed
    /// beacon and sender address; the caller (discovery integration in
    /// `dispatch.rs`) decides whether to initiate a connection based on the
    /// symmetry-breaking rule (lower id connects).
    pub fn poll_beacons(&mut self) -> Vec<(Beacon, SocketAddr)> {
        let mut received = Vec::new();
        let mut buf = [0u8; 2048];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    if let Ok(beacon) = serde_json::from_slice::<Beacon>(&buf[..n]) {
                        if beacon.application_name == self.application_name
                            && beacon.process_id != self.process_id
                        {
                            log_debug!("beacon from {from} (pid {})", beacon.process_id);
                            received.push((beacon, from));
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        received
    }

    /// `true` if the local process should be the one to dial out, per spec
    /// §4.5's symmetry-breaking rule: "the listener with the lexicographically
    /// lower id initiates".
    pub fn should_initiate(&self, remote_process_id: u64) -> bool {
        self.process_id < remote_process_id
    }
}

/// Registers or refreshes a peer entry on receipt of a beacon, advancing its
/// state machine (spec §4.5: `Announced -> Connecting -> ...`).
pub fn admit_peer(
    table: &mut PeerTable,
    beacon: &Beacon,
    from: SocketAddr,
    now: Timestamp,
) -> PeerId {
    let host: IpAddr = from.ip();
    match table.find_by_process_id(beacon.process_id) {
        Some(id) => {
            if let Some(peer) = table.get_mut(id) {
                peer.last_seen = now;
                peer.udp_port = beacon.udp_port;
                peer.tcp_port = beacon.tcp_port;
                peer.is_master = beacon.is_master;
            }
            id
        }
        None => {
            let id = table.insert(beacon.process_id, host, beacon.discovery_port);
            if let Some(peer) = table.get_mut(id) {
                peer.udp_port = beacon.udp_port;
                peer.tcp_port = beacon.tcp_port;
                peer.last_seen = now;
                peer.state = PeerState::Announced;
                peer.is_master = beacon.is_master;
            }
            id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn should_initiate_uses_lexicographic_comparison() {
        let config = NetworkConfig {
            discovery_port: 0,
            discovery_interval_ms: 500,
            broadcast_addr: "127.255.255.255".to_string(),
            tcp_port: 0,
            udp_port: 0,
            peer_idle_timeout_ms: 5_000,
        };
        let engine = DiscoveryEngine::bind("app".into(), 10, &config, 0, 0).unwrap();
        assert!(engine.should_initiate(20));
        assert!(!engine.should_initiate(5));
    }

    #[test]
    fn admit_peer_creates_then_refreshes() {
        let mut table = PeerTable::new();
        let beacon = Beacon {
            application_name: "app".into(),
            process_id: 7,
            discovery_port: 45_678,
            tcp_port: 9000,
            udp_port: 9001,
            is_master: false,
        };
        let from = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 45_678);
        let id1 = admit_peer(&mut table, &beacon, from, 1.0);
        let id2 = admit_peer(&mut table, &beacon, from, 2.0);
        assert_eq!(id1, id2);
        assert_eq!(table.get(id1).unwrap().last_seen, 2.0);
    }
}
