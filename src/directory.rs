//! Component D — Service Directory & Status (spec §4.4).

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::error::RuntimeError;
use crate::peer::{PeerId, PeerTable};
use crate::trie::Trie;

/// The observable status of a service. Ordering matches spec §4.4 exactly —
/// callers rely on `>= LOCAL_NOTIME` ("deliverable immediately") and
/// `>= LOCAL` ("timed-deliverable") tests, so the discriminant order here is
/// load-bearing, not cosmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i8)]
pub enum ServiceStatus {
    Fail = -1,
    LocalNotime = 0,
    RemoteNotime = 1,
    BridgeNotime = 2,
    ToOscNotime = 3,
    Local = 4,
    Remote = 5,
    Bridge = 6,
    ToOsc = 7,
}

/// One directory entry. `Bridge` carries no concrete transport (spec §9
/// Open Questions: "implementers may leave bridge variants as stubs without
/// losing conformance") — it exists so the status ordering and directory
/// plumbing are exercised even though nothing sends over it.
pub enum ServiceEntry {
    Local { trie: Trie, synced: bool },
    Remote { peer: PeerId, synced: bool },
    OscDelegate { addr: SocketAddr, reliable: bool, synced: bool },
    Bridge { synced: bool },
}

impl ServiceEntry {
    pub fn status(&self) -> ServiceStatus {
        match self {
            ServiceEntry::Local { synced: true, .. } => ServiceStatus::Local,
            ServiceEntry::Local { synced: false, .. } => ServiceStatus::LocalNotime,
            ServiceEntry::Remote { synced: true, .. } => ServiceStatus::Remote,
            ServiceEntry::Remote { synced: false, .. } => ServiceStatus::RemoteNotime,
            ServiceEntry::OscDelegate { synced: true, .. } => ServiceStatus::ToOsc,
            ServiceEntry::OscDelegate { synced: false, .. } => ServiceStatus::ToOscNotime,
            ServiceEntry::Bridge { synced: true } => ServiceStatus::Bridge,
            ServiceEntry::Bridge { synced: false } => ServiceStatus::BridgeNotime,
        }
    }

    fn set_synced(&mut self, value: bool) {
        match self {
            ServiceEntry::Local { synced, .. }
            | ServiceEntry::Remote { synced, .. }
            | ServiceEntry::OscDelegate { synced, .. }
            | ServiceEntry::Bridge { synced } => *synced = value,
        }
    }
}

/// Maps service names to entries. Invariant: a name appears at most once
/// (spec §3 invariant 5, §8 "the directory contains at most one entry").
#[derive(Default)]
pub struct Directory {
    entries: HashMap<String, ServiceEntry>,
}

impl Directory {
    pub fn new() -> Self {
        Directory::default()
    }

    pub fn add_local(&mut self, name: impl Into<String>) -> Result<(), RuntimeError> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(RuntimeError::State(format!("service '{name}' already registered")));
        }
        self.entries.insert(name, ServiceEntry::Local { trie: Trie::new(), synced: false });
        Ok(())
    }

    pub fn add_remote(&mut self, name: impl Into<String>, peer: PeerId) -> Result<(), RuntimeError> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(RuntimeError::State(format!("service '{name}' already registered")));
        }
        self.entries.insert(name, ServiceEntry::Remote { peer, synced: false });
        Ok(())
    }

    pub fn add_osc_delegate(
        &mut self,
        name: impl Into<String>,
        addr: SocketAddr,
        reliable: bool,
    ) -> Result<(), RuntimeError> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(RuntimeError::State(format!("service '{name}' already registered")));
        }
        self.entries.insert(name, ServiceEntry::OscDelegate { addr, reliable, synced: false });
        Ok(())
    }

    pub fn status(&self, name: &str) -> ServiceStatus {
        self.entries.get(name).map(ServiceEntry::status).unwrap_or(ServiceStatus::Fail)
    }

    pub fn get(&self, name: &str) -> Option<&ServiceEntry> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ServiceEntry> {
        self.entries.get_mut(name)
    }

    /// Names of every locally-registered service, in no particular order —
    /// used to build the peer handshake payload (spec §4.5: "exchange the
    /// complete local service list").
    pub fn local_service_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| matches!(e, ServiceEntry::Local { .. }))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn local_trie_mut(&mut self, name: &str) -> Option<&mut Trie> {
        match self.entries.get_mut(name) {
            Some(ServiceEntry::Local { trie, .. }) => Some(trie),
            _ => None,
        }
    }

    /// Updates sync state for every entry owned by `peer`, or for the local
    /// entries when `peer` is `None` (this process's own sync transition).
    pub fn set_synced_for_peer(&mut self, peer: Option<PeerId>, synced: bool) {
        for entry in self.entries.values_mut() {
            let owned = match (entry, peer) {
                (ServiceEntry::Remote { peer: p, .. }, Some(target)) => *p == target,
                (ServiceEntry::Local { .. }, None) => true,
                _ => false,
            };
            if owned {
                entry.set_synced(synced);
            }
        }
    }

    /// Removes every entry owned by a dropped peer, returning their names so
    /// callers can purge queued timed messages for them (spec §4.4: "On
    /// drop, the service disappears... any queued timed messages to it are
    /// discarded and reported").
    pub fn drop_peer_services(&mut self, peer: PeerId) -> Vec<String> {
        let dead: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| matches!(e, ServiceEntry::Remote { peer: p, .. } if *p == peer))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &dead {
            self.entries.remove(name);
        }
        dead
    }

    /// Splits a full address (`/service/rest...` or `!service/rest...`) into
    /// the service name and the remainder of the path.
    pub fn split_service<'a>(path: &'a str) -> (bool, &'a str, &'a str) {
        let (literal, rest) = match path.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, path.strip_prefix('/').unwrap_or(path)),
        };
        match rest.split_once('/') {
            Some((service, tail)) => (literal, service, tail),
            None => (literal, rest, ""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_orders_as_spec_requires() {
        assert!(ServiceStatus::Fail < ServiceStatus::LocalNotime);
        assert!(ServiceStatus::LocalNotime < ServiceStatus::Local);
        assert!(ServiceStatus::Local < ServiceStatus::Remote);
        assert!(ServiceStatus::Remote < ServiceStatus::Bridge);
        assert!(ServiceStatus::Bridge < ServiceStatus::ToOsc);
        assert!(ServiceStatus::ToOscNotime < ServiceStatus::Local);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut dir = Directory::new();
        dir.add_local("chat").unwrap();
        assert!(dir.add_local("chat").is_err());
    }

    #[test]
    fn unregistered_service_reports_fail() {
        let dir = Directory::new();
        assert_eq!(dir.status("nope"), ServiceStatus::Fail);
    }

    #[test]
    fn local_sync_transition_updates_status() {
        let mut dir = Directory::new();
        dir.add_local("chat").unwrap();
        assert_eq!(dir.status("chat"), ServiceStatus::LocalNotime);
        dir.set_synced_for_peer(None, true);
        assert_eq!(dir.status("chat"), ServiceStatus::Local);
    }

    #[test]
    fn dropping_a_peer_fails_its_services() {
        let mut table = PeerTable::new();
        let peer = table.insert(1, std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 45_678);
        let mut dir = Directory::new();
        dir.add_remote("bridge_svc", peer).unwrap();
        let dropped = dir.drop_peer_services(peer);
        assert_eq!(dropped, vec!["bridge_svc".to_string()]);
        assert_eq!(dir.status("bridge_svc"), ServiceStatus::Fail);
    }

    #[test]
    fn split_service_parses_literal_and_pattern_addresses() {
        assert_eq!(Directory::split_service("/chat/text"), (false, "chat", "text"));
        assert_eq!(Directory::split_service("!chat/text"), (true, "chat", "text"));
        assert_eq!(Directory::split_service("/chat"), (false, "chat", ""));
    }
}
