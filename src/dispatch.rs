//! Component G — Dispatch Loop (spec §4.7).
//!
//! `poll()` in `runtime.rs` drives socket I/O and periodic traffic itself
//! (both are deeply tied to the concrete sockets the runtime owns); this
//! module implements the parts of the loop that are pure over the shared
//! state — scheduler advance, destination resolution, and the re-entrancy
//! guarding pending-delivery FIFO (spec §3 invariant 6, §5 "Re-entrancy").

use crate::directory::{Directory, ServiceEntry, ServiceStatus};
use crate::error::RuntimeError;
use crate::message::{Message, Timestamp};
use crate::peer::PeerTable;
use crate::scheduler::Scheduler;

/// One entry awaiting resolution: a full address plus its message and the
/// delivery reliability the sender requested.
pub struct PendingEntry {
    pub address: String,
    pub message: Message,
    pub reliable: bool,
}

/// Messages produced by a handler, or drained from a scheduler at a time
/// `<= now`, accumulate here instead of being delivered on the same stack
/// frame (spec §5: "those messages must not be delivered inside the
/// current call stack").
#[derive(Default)]
pub struct PendingFifo {
    queue: std::collections::VecDeque<PendingEntry>,
}

impl PendingFifo {
    pub fn new() -> Self {
        PendingFifo::default()
    }

    pub fn push(&mut self, address: impl Into<String>, message: Message, reliable: bool) {
        self.queue.push_back(PendingEntry { address: address.into(), message, reliable });
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn pop(&mut self) -> Option<PendingEntry> {
        self.queue.pop_front()
    }
}

/// Counters for locally-recovered errors (spec §7: "transport and protocol
/// errors are recovered locally... drop, count, continue").
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorCounters {
    pub malformed_dropped: u64,
    pub no_service_dropped: u64,
    pub timing_failed: u64,
}

/// Resolves `entry`'s destination service and either invokes its local
/// handlers, enqueues it on a peer's outbound queue, or hands it to the OSC
/// delegate path. This is spec §4.7 step 3 for one FIFO entry.
pub fn resolve_and_deliver(
    directory: &mut Directory,
    peers: &mut PeerTable,
    entry: PendingEntry,
    counters: &mut ErrorCounters,
) {
    let (literal, service, rest) = Directory::split_service(&entry.address);

    let status = directory.status(service);
    if status == ServiceStatus::Fail {
        counters.no_service_dropped += 1;
        return;
    }

    match directory.get_mut(service) {
        Some(ServiceEntry::Local { trie, .. }) => {
            trie.dispatch(rest, literal, &entry.message);
        }
        Some(ServiceEntry::Remote { peer, .. }) => {
            if let Some(peer) = peers.get_mut(*peer) {
                if entry.reliable {
                    peer.outbound_tcp.push(entry.message);
                } else {
                    peer.outbound_udp.push(entry.message);
                }
            } else {
                counters.no_service_dropped += 1;
            }
        }
        Some(ServiceEntry::OscDelegate { .. }) => {
            // The concrete OSC send happens in runtime.rs, which owns the
            // `OscOutbound` sockets; this function only validates the
            // destination resolves, per its single responsibility here.
        }
        Some(ServiceEntry::Bridge { .. }) => {
            // No concrete bridge transport (spec §9 Open Questions / §B).
        }
        None => counters.no_service_dropped += 1,
    }
}

/// Drains `fifo` to empty, resolving each entry and counting any new
/// entries a handler enqueues during that resolution — draining continues
/// until quiescent (spec §4.7 step 4).
pub fn drain_pending(
    fifo: &mut PendingFifo,
    directory: &mut Directory,
    peers: &mut PeerTable,
    counters: &mut ErrorCounters,
) {
    while let Some(entry) = fifo.pop() {
        resolve_and_deliver(directory, peers, entry, counters);
    }
}

/// Advances a scheduler to `now`, routing every due message to `fifo`
/// rather than dispatching synchronously (spec §4.3: "never dispatch
/// synchronously from `schedule`" generalizes to `advance` too, since
/// `advance` feeds step 3 via the FIFO just like a live handler send would).
pub fn advance_into_fifo(scheduler: &mut Scheduler, now: Timestamp, fifo: &mut PendingFifo) {
    for message in scheduler.advance(now) {
        let address = message.address.clone();
        fifo.push(address, message, false);
    }
}

/// Schedules a timed message, or — if it is already due — routes it
/// straight to the pending FIFO instead (spec §4.3 / §8 boundary behavior).
pub fn schedule_or_defer(
    scheduler: &mut Scheduler,
    now: Timestamp,
    message: Message,
    fifo: &mut PendingFifo,
) -> Result<(), RuntimeError> {
    if message.timestamp <= now {
        let address = message.address.clone();
        fifo.push(address, message, false);
        return Ok(());
    }
    scheduler.schedule(message, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBuilder;

    #[test]
    fn unresolvable_service_is_counted_and_dropped() {
        let mut directory = Directory::new();
        let mut peers = PeerTable::new();
        let mut counters = ErrorCounters::default();
        let msg = MessageBuilder::new().seal(0.0, "/nowhere/x").unwrap();
        resolve_and_deliver(
            &mut directory,
            &mut peers,
            PendingEntry { address: "/nowhere/x".into(), message: msg, reliable: false },
            &mut counters,
        );
        assert_eq!(counters.no_service_dropped, 1);
    }

    #[test]
    fn remote_service_enqueues_on_peer_outbound_channel() {
        let mut directory = Directory::new();
        let mut peers = PeerTable::new();
        let peer_id = peers.insert(1, std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 45_678);
        directory.add_remote("chat", peer_id).unwrap();
        let mut counters = ErrorCounters::default();
        let msg = MessageBuilder::new().add_string("hi").seal(0.0, "/chat/text").unwrap();
        resolve_and_deliver(
            &mut directory,
            &mut peers,
            PendingEntry { address: "/chat/text".into(), message: msg, reliable: false },
            &mut counters,
        );
        assert_eq!(peers.get(peer_id).unwrap().outbound_udp.len(), 1);
        assert_eq!(counters.no_service_dropped, 0);
    }

    #[test]
    fn draining_is_recursive_until_quiescent() {
        let mut directory = Directory::new();
        directory.add_local("a").unwrap();
        let mut peers = PeerTable::new();
        let mut fifo = PendingFifo::new();
        fifo.push("/a/x", MessageBuilder::new().seal(0.0, "/a/x").unwrap(), false);
        let mut counters = ErrorCounters::default();
        drain_pending(&mut fifo, &mut directory, &mut peers, &mut counters);
        assert!(fifo.is_empty());
    }

    #[test]
    fn due_message_defers_to_fifo_not_the_wheel() {
        let mut scheduler = Scheduler::new(1000.0);
        let mut fifo = PendingFifo::new();
        let msg = MessageBuilder::new().seal(0.0, "/a/x").unwrap();
        schedule_or_defer(&mut scheduler, 0.0, msg, &mut fifo).unwrap();
        assert!(!fifo.is_empty());
    }
}
