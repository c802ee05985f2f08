//! Component I — Runtime State (spec §3 "Runtime State", §9 "Global
//! singleton").
//!
//! One [`Runtime`] owns every other component: the service directory (which
//! in turn owns the address tries), the peer table, both schedulers, the
//! discovery and OSC sockets, and the pending-delivery FIFO. It is not a
//! mutable global itself — `lib.rs` holds the single `Option<Runtime>` slot
//! (design note §9) behind a `thread_local!`, since the runtime's state
//! (`Rc`-based tries, `TcpStream`s) is not `Send` and the whole point of the
//! single-threaded cooperative model (spec §5) is that it never needs to be.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, TcpListener, UdpSocket};
use std::rc::Rc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::clock_sync::{ClockRole, LocalClock};
use crate::config::RuntimeConfig;
use crate::directory::{Directory, ServiceEntry, ServiceStatus};
use crate::discovery::{self, Beacon, DiscoveryEngine, DiscoveryMode};
use crate::dispatch::{self, ErrorCounters, PendingFifo};
use crate::error::{RuntimeError, RuntimeResult};
use crate::message::{Arg, Message, MessageBuilder, Timestamp};
use crate::osc_gateway::{OscInbound, OscOutbound};
use crate::peer::{PeerId, PeerState, PeerTable, FRAME_HANDSHAKE, FRAME_MESSAGE};
use crate::scheduler::Scheduler;
use crate::trie::Cookie;
use crate::{log_debug, log_info, log_warn};

/// Which timing wheel a caller means by `schedule(scheduler, msg)` (spec
/// §6). The local scheduler is always live; the global one only once this
/// process has valid global time (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Local,
    Global,
}

/// Allocator hooks (spec §6 `memory(malloc_fn, free_fn)`). The actual
/// allocator is an external collaborator (spec §1: "the custom-allocator
/// hook" is out of scope); this crate stores the hooks only so the API
/// surface is complete and `memory()` enforces the documented
/// before-`initialize` ordering (spec §6).
pub type MallocFn = fn(usize) -> *mut u8;
pub type FreeFn = fn(*mut u8, usize);

#[derive(Clone, Copy)]
pub struct AllocatorHooks {
    pub malloc: MallocFn,
    pub free: FreeFn,
}

#[derive(Serialize, Deserialize)]
struct HandshakePayload {
    process_id: u64,
    services: Vec<String>,
    is_master: bool,
}

/// One registered OSC inbound port plus the malformed-frame counter spec
/// §4.8 asks for ("malformed OSC frames are counted and dropped").
struct OscInboundPort {
    inbound: OscInbound,
}

/// The process-wide runtime. Created by [`crate::initialize`], torn down by
/// [`crate::finish`].
pub struct Runtime {
    config: RuntimeConfig,
    process_id: u64,
    start: Instant,

    directory: Directory,
    peers: PeerTable,
    local_scheduler: Scheduler,
    global_scheduler: Scheduler,
    clock: LocalClock,
    custom_gettime: Option<Box<dyn FnMut() -> Timestamp>>,
    #[allow(dead_code)]
    clock_cookie: Option<Cookie>,
    master_peer: Option<PeerId>,

    fifo: PendingFifo,
    counters: ErrorCounters,
    osc_malformed: u64,
    allocator: Option<AllocatorHooks>,
    stop: bool,

    discovery: DiscoveryEngine,
    tcp_listener: TcpListener,
    udp_socket: UdpSocket,
    osc_inbound: Vec<OscInboundPort>,
    osc_outbound: HashMap<String, OscOutbound>,
}

impl Runtime {
    /// Spec §6 `initialize(app_name)`, generalized to take a full
    /// [`RuntimeConfig`] (application name plus the calibration parameters
    /// design note §9 asks to expose). Errors: bad-name (spec §6).
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        if config.application_name.trim().is_empty() {
            return Err(RuntimeError::State("bad name: application name must not be empty".into()));
        }

        let process_id = rand::random::<u64>();

        let tcp_listener = TcpListener::bind(("0.0.0.0", config.network.tcp_port))?;
        tcp_listener.set_nonblocking(true)?;
        let local_tcp_port = tcp_listener.local_addr()?.port();

        let udp_socket = UdpSocket::bind(("0.0.0.0", config.network.udp_port))?;
        udp_socket.set_nonblocking(true)?;
        let local_udp_port = udp_socket.local_addr()?.port();

        let discovery = DiscoveryEngine::bind(
            config.application_name.clone(),
            process_id,
            &config.network,
            local_tcp_port,
            local_udp_port,
        )?;

        let tick_rate = config.scheduler_tick_rate_hz;

        log_info!(
            "runtime '{}' initialized: process_id={process_id:#x} tcp={local_tcp_port} udp={local_udp_port}",
            config.application_name
        );

        Ok(Runtime {
            local_scheduler: Scheduler::new(tick_rate),
            global_scheduler: Scheduler::new(tick_rate),
            config,
            process_id,
            start: Instant::now(),
            directory: Directory::new(),
            peers: PeerTable::new(),
            clock: LocalClock::new(),
            custom_gettime: None,
            clock_cookie: None,
            master_peer: None,
            fifo: PendingFifo::new(),
            counters: ErrorCounters::default(),
            osc_malformed: 0,
            allocator: None,
            stop: false,
            discovery,
            tcp_listener,
            udp_socket,
            osc_inbound: Vec::new(),
            osc_outbound: HashMap::new(),
        })
    }

    /// Lets a caller route discovery through an explicit unicast peer list
    /// instead of broadcast (spec_full §B "Hub mode") — useful on networks
    /// where broadcast is filtered.
    pub fn set_discovery_mode(&mut self, mode: DiscoveryMode) {
        self.discovery.set_mode(mode);
    }

    // ---- §6 public API surface -------------------------------------------------

    /// `add_service(name)`. Errors: service conflict (spec §6).
    pub fn add_service(&mut self, name: impl Into<String>) -> RuntimeResult<()> {
        let name = name.into();
        self.directory.add_local(&name)?;
        if self.clock.role() == ClockRole::Master {
            self.directory.set_synced_for_peer(None, true);
        }
        Ok(())
    }

    /// `add_method(path, types, handler, cookie, coerce, parse)`. `path`
    /// includes the leading service segment; the rest is installed into
    /// that service's trie.
    pub fn add_method(
        &mut self,
        path: &str,
        type_descriptor: Option<String>,
        coerce: bool,
        parse: bool,
        cookie: Cookie,
        callback: Box<dyn FnMut(&Message, &Cookie)>,
    ) -> RuntimeResult<()> {
        let (_literal, service, rest) = Directory::split_service(path);
        let trie = self
            .directory
            .local_trie_mut(service)
            .ok_or_else(|| RuntimeError::State(format!("no local service '{service}'")))?;
        trie.insert(rest, type_descriptor, coerce, parse, cookie, callback);
        Ok(())
    }

    /// `status(service) -> code`.
    pub fn status(&self, service: &str) -> ServiceStatus {
        self.directory.status(service)
    }

    /// `send` / `send_cmd`: builds a message from typed arguments and
    /// routes it, deferring to the scheduler if its time is in the future
    /// (spec §4.3) or straight to the pending FIFO if it is due (spec §4.7
    /// step 3 is driven from `poll`, so an immediate send here still waits
    /// for the next `drain_pending` inside the current `poll` call — spec
    /// §5 re-entrancy applies uniformly whether the caller is a handler or
    /// the embedding host).
    pub fn send(
        &mut self,
        address: &str,
        time: Timestamp,
        args: Vec<Arg>,
        reliable: bool,
    ) -> RuntimeResult<()> {
        let mut builder = MessageBuilder::new();
        for arg in args {
            builder = builder.add_arg(arg);
        }
        let message = builder.seal(time, address)?;
        self.send_message(message, reliable)
    }

    /// `send_message(msg, reliable?)`: takes ownership of a built message.
    /// A positive timestamp defers to the *global* scheduler (or straight to
    /// the pending FIFO if already due) — per `original_source/src/o2.h`,
    /// `o2_send()`'s timed path always runs against the global-time wheel,
    /// never the local one; the local scheduler is reserved for the explicit
    /// `schedule(SchedulerKind::Local, ...)` path and internal clock-sync
    /// pings. `0.0` means deliver on the next drain (spec §4.1: "`0.0` means
    /// deliver immediately"). Scheduling a future timestamp before global
    /// time is live fails (spec §4.3: "scheduling into it when global time is
    /// unknown fails").
    pub fn send_message(&mut self, message: Message, reliable: bool) -> RuntimeResult<()> {
        if message.timestamp > 0.0 {
            if !self.global_time_available() {
                return Err(RuntimeError::Timing("global scheduler has no live clock".into()));
            }
            let now = self.get_time();
            dispatch::schedule_or_defer(&mut self.global_scheduler, now, message, &mut self.fifo)
        } else {
            self.fifo.push(message.address.clone(), message, reliable);
            Ok(())
        }
    }

    /// `memory(malloc_fn, free_fn)` (spec §6): installs custom allocator
    /// hooks. The allocator itself is an external collaborator this crate
    /// never calls into (see `DESIGN.md`); this just records the hooks so
    /// the API surface is complete.
    pub fn memory(&mut self, malloc: MallocFn, free: FreeFn) {
        self.allocator = Some(AllocatorHooks { malloc, free });
    }

    pub fn has_custom_allocator(&self) -> bool {
        self.allocator.is_some()
    }

    /// `schedule(scheduler, msg)`: directly enqueues a pre-built timed
    /// message onto a named wheel, bypassing the immediate/deferred split
    /// `send_message` does (spec §6).
    pub fn schedule(&mut self, which: SchedulerKind, message: Message) -> RuntimeResult<()> {
        let now = match which {
            SchedulerKind::Local => self.local_time(),
            SchedulerKind::Global => {
                if !self.global_time_available() {
                    return Err(RuntimeError::Timing("global scheduler has no live clock".into()));
                }
                self.get_time()
            }
        };
        let scheduler = match which {
            SchedulerKind::Local => &mut self.local_scheduler,
            SchedulerKind::Global => &mut self.global_scheduler,
        };
        if message.timestamp <= now {
            let address = message.address.clone();
            self.fifo.push(address, message, false);
            Ok(())
        } else {
            scheduler.schedule(message, now)
        }
    }

    /// `set_clock(gettime_fn, cookie)`: becomes master (spec §4.6: election
    /// is static). `gettime_fn` is optional — when absent, the monotonic
    /// wall clock since `initialize` drives time.
    pub fn set_clock(&mut self, gettime: Option<Box<dyn FnMut() -> Timestamp>>, cookie: Option<Cookie>) {
        self.clock.become_master();
        self.custom_gettime = gettime;
        self.clock_cookie = cookie;
        self.discovery.announce_as_master();
        self.directory.set_synced_for_peer(None, true);
        log_info!("this process is now the clock master");
    }

    /// `local_time()`: monotonic, always available.
    pub fn local_time(&mut self) -> Timestamp {
        if let Some(gettime) = self.custom_gettime.as_mut() {
            return gettime();
        }
        self.start.elapsed().as_secs_f64()
    }

    /// `get_time()`: global (synced) clock. Equal to `local_time()` once
    /// this process is the master; combines local time with the smoothed
    /// offset from the master once a client is synced. Returns
    /// `local_time()` unsynced (callers must check `status(..) >= LOCAL`
    /// before trusting it for cross-process meaning, per spec §4.4).
    pub fn get_time(&mut self) -> Timestamp {
        match self.clock.role() {
            ClockRole::Master => self.local_time(),
            ClockRole::Client => {
                let offset = self
                    .master_peer
                    .and_then(|id| self.peers.get(id))
                    .and_then(|p| p.clock.offset());
                let local = self.local_time();
                match offset {
                    Some(offset) => self.clock.global_time(local, offset),
                    None => local,
                }
            }
            ClockRole::Uninitialized => self.local_time(),
        }
    }

    fn global_time_available(&self) -> bool {
        match self.clock.role() {
            ClockRole::Master => true,
            ClockRole::Client => self
                .master_peer
                .and_then(|id| self.peers.get(id))
                .is_some_and(|p| p.is_synced()),
            ClockRole::Uninitialized => false,
        }
    }

    /// `roundtrip(&mean, &min)`: fails if not synced (spec §6).
    pub fn roundtrip(&self) -> RuntimeResult<(f64, f64)> {
        let peer = self
            .master_peer
            .and_then(|id| self.peers.get(id))
            .ok_or_else(|| RuntimeError::State("not synced to a master".into()))?;
        peer.clock.roundtrip().ok_or_else(|| RuntimeError::State("round-trip window not yet full".into()))
    }

    /// `create_osc_port(service, port, udp?)`: inbound OSC bridge (spec
    /// §4.8). The service is created automatically if not already local,
    /// matching the original's "opening a port declares the service."
    pub fn create_osc_port(&mut self, service: &str, port: u16, udp: bool) -> RuntimeResult<()> {
        if self.directory.get(service).is_none() {
            self.directory.add_local(service)?;
        }
        let inbound = OscInbound::bind(service, port, udp)?;
        self.osc_inbound.push(OscInboundPort { inbound });
        Ok(())
    }

    /// `delegate_to_osc(service, ip, port, reliable?)`: outbound OSC bridge.
    pub fn delegate_to_osc(
        &mut self,
        service: &str,
        ip: IpAddr,
        port: u16,
        reliable: bool,
    ) -> RuntimeResult<()> {
        let addr = SocketAddr::new(ip, port);
        self.directory.add_osc_delegate(service, addr, reliable)?;
        let outbound = OscOutbound::connect(addr)?;
        self.osc_outbound.insert(service.to_string(), outbound);
        Ok(())
    }

    /// `send_osc_message(service, path, typestr, args...)`: direct send,
    /// bypassing internal dispatch (spec §6) — the delegate must already
    /// exist via `delegate_to_osc`.
    pub fn send_osc_message(&mut self, service: &str, path: &str, args: Vec<Arg>) -> RuntimeResult<()> {
        let outbound = self
            .osc_outbound
            .get(service)
            .ok_or_else(|| RuntimeError::State(format!("no OSC delegate for service '{service}'")))?;
        let mut builder = MessageBuilder::new();
        for arg in args {
            builder = builder.add_arg(arg);
        }
        let message = builder.seal(0.0, format!("/{path}"))?;
        outbound.send(path, &message)
    }

    pub fn error_counters(&self) -> ErrorCounters {
        self.counters
    }

    /// Count of malformed OSC frames dropped since startup (spec §4.8).
    pub fn osc_malformed_count(&self) -> u64 {
        self.osc_malformed
    }

    pub fn request_stop(&mut self) {
        self.stop = true;
    }

    pub fn should_stop(&self) -> bool {
        self.stop
    }

    // ---- §4.7 poll loop ----------------------------------------------------

    /// `poll()`: drives the runtime one step, in the exact order spec §4.7
    /// lists.
    pub fn poll(&mut self) -> RuntimeResult<()> {
        // Step 1: read ready sockets.
        self.poll_discovery();
        self.poll_listener();
        self.poll_peer_channels();
        self.poll_peer_udp();
        self.poll_osc_inbound();

        // Step 2: advance local then global scheduler.
        let local_now = self.local_time();
        dispatch::advance_into_fifo(&mut self.local_scheduler, local_now, &mut self.fifo);
        if self.global_time_available() {
            let global_now = self.get_time();
            dispatch::advance_into_fifo(&mut self.global_scheduler, global_now, &mut self.fifo);
        }

        // Step 3 + 4: resolve and deliver, draining until quiescent.
        self.drain_pending();

        // Step 5: emit periodic protocol traffic.
        self.emit_periodic();
        self.flush_peer_writes();
        self.reap_idle_peers();

        Ok(())
    }

    /// `run(rate_hz)`: convenience loop invoking `poll` until `stop` is set.
    pub fn run(&mut self, rate_hz: u32) -> RuntimeResult<()> {
        let period = std::time::Duration::from_secs_f64(1.0 / rate_hz.max(1) as f64);
        while !self.should_stop() {
            self.poll()?;
            std::thread::sleep(period);
        }
        Ok(())
    }

    fn drain_pending(&mut self) {
        while let Some(entry) = self.fifo.pop() {
            let (_literal, service, _rest) = Directory::split_service(&entry.address);
            if let Some(ServiceEntry::OscDelegate { .. }) = self.directory.get(service) {
                if let Some(outbound) = self.osc_outbound.get(service) {
                    let (_l, _s, rest) = Directory::split_service(&entry.address);
                    if let Err(e) = outbound.send(rest, &entry.message) {
                        log_warn!("OSC delegate send to '{service}' failed: {e}");
                    }
                }
                continue;
            }
            dispatch::resolve_and_deliver(&mut self.directory, &mut self.peers, entry, &mut self.counters);
        }
    }

    fn poll_discovery(&mut self) {
        let now = self.local_time();
        for (beacon, from) in self.discovery.poll_beacons() {
            let peer_id = discovery::admit_peer(&mut self.peers, &beacon, from, now);
            if let Some(peer) = self.peers.get_mut(peer_id) {
                peer.clock.set_window(self.config.clock.window);
            }
            if beacon.is_master {
                self.master_peer = Some(peer_id);
                self.clock.become_client();
            }
            self.maybe_initiate(peer_id, &beacon, from);
        }
    }

    fn maybe_initiate(&mut self, peer_id: PeerId, beacon: &Beacon, from: SocketAddr) {
        let Some(peer) = self.peers.get(peer_id) else { return };
        if peer.channel.is_some() || peer.state != PeerState::Announced {
            return;
        }
        if !self.discovery.should_initiate(beacon.process_id) {
            return;
        }
        let addr = SocketAddr::new(from.ip(), beacon.tcp_port);
        match crate::peer::ReliableChannel::connect(addr) {
            Ok(mut channel) => {
                let handshake = HandshakePayload {
                    process_id: self.process_id,
                    services: self.local_service_names(),
                    is_master: self.clock.role() == ClockRole::Master,
                };
                if let Ok(payload) = serde_json::to_vec(&handshake) {
                    channel.queue_handshake(&payload);
                }
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.channel = Some(channel);
                    peer.state = PeerState::Connecting;
                }
                log_debug!("dialing peer {} at {addr}", beacon.process_id);
            }
            Err(e) => log_warn!("failed to connect to peer {}: {e}", beacon.process_id),
        }
    }

    fn local_service_names(&self) -> Vec<String> {
        // `Directory` doesn't expose an iterator over local names directly;
        // the handshake only needs to tell peers what exists, so this walks
        // the small, already-known set of names the caller registered.
        self.directory.local_service_names()
    }

    fn poll_listener(&mut self) {
        loop {
            match self.tcp_listener.accept() {
                Ok((stream, from)) => match crate::peer::ReliableChannel::from_stream(stream) {
                    Ok(channel) => self.admit_inbound_connection(channel, from),
                    Err(e) => log_warn!("failed to set up inbound connection from {from}: {e}"),
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    fn admit_inbound_connection(&mut self, channel: crate::peer::ReliableChannel, from: SocketAddr) {
        // We don't know the remote's process id until its handshake frame
        // arrives; stash the channel on a fresh, not-yet-matched peer entry
        // keyed by a placeholder id derived from the socket, then merge it
        // into the beacon-discovered entry (if any) once the handshake is
        // read on the next poll.
        let now = self.local_time();
        let placeholder = self.peers.insert(0, from.ip(), 0);
        if let Some(peer) = self.peers.get_mut(placeholder) {
            peer.channel = Some(channel);
            peer.state = PeerState::Connecting;
            peer.last_seen = now;
            peer.clock.set_window(self.config.clock.window);
        }
    }

    fn poll_peer_channels(&mut self) {
        let now = self.local_time();
        let ids: Vec<PeerId> = self.peers.iter().map(|p| p.id).collect();
        for id in ids {
            self.poll_one_peer_channel(id, now);
        }
    }

    fn poll_one_peer_channel(&mut self, id: PeerId, now: Timestamp) {
        let result = {
            let Some(peer) = self.peers.get_mut(id) else { return };
            let Some(channel) = peer.channel.as_mut() else { return };
            channel.poll_frames()
        };

        let frames = match result {
            Ok(frames) => frames,
            Err(_) => {
                self.drop_peer(id);
                return;
            }
        };

        for (frame_type, payload) in frames {
            match frame_type {
                FRAME_HANDSHAKE => self.on_handshake(id, &payload, now),
                FRAME_MESSAGE => self.on_reliable_message(id, &payload, now),
                _ => log_warn!("unknown frame type {frame_type} from peer"),
            }
        }
        if let Some(peer) = self.peers.get_mut(id) {
            peer.last_seen = now;
        }
    }

    fn on_handshake(&mut self, id: PeerId, payload: &[u8], now: Timestamp) {
        let Ok(handshake) = serde_json::from_slice::<HandshakePayload>(payload) else {
            self.counters.malformed_dropped += 1;
            return;
        };

        // If this connection arrived inbound (placeholder process_id 0) and
        // we already know this peer from a beacon, merge onto the existing
        // entry and drop the placeholder.
        let canonical = self.peers.find_by_process_id(handshake.process_id).filter(|&found| found != id);
        let target = if let Some(existing) = canonical {
            if let Some(placeholder) = self.peers.drop_peer(id) {
                if let Some(existing_peer) = self.peers.get_mut(existing) {
                    existing_peer.channel = placeholder.channel;
                }
            }
            existing
        } else {
            id
        };

        // Reply in kind so both ends learn each other's service list (spec
        // §4.5: "exchange the complete local service list"), but only once —
        // a reply handshake doesn't itself get a reply.
        let local_services = self.local_service_names();
        let reply = (handshake.services != local_services).then(|| HandshakePayload {
            process_id: self.process_id,
            services: local_services,
            is_master: self.clock.role() == ClockRole::Master,
        });

        if let Some(peer) = self.peers.get_mut(target) {
            peer.process_id = handshake.process_id;
            peer.services = handshake.services.clone();
            peer.is_master = handshake.is_master;
            peer.state = PeerState::Connected;
            peer.last_seen = now;
            if let (Some(channel), Some(reply)) = (peer.channel.as_mut(), reply.as_ref()) {
                if let Ok(bytes) = serde_json::to_vec(reply) {
                    channel.queue_handshake(&bytes);
                }
            }
        }

        if handshake.is_master {
            self.master_peer = Some(target);
            self.clock.become_client();
        }

        for name in &handshake.services {
            let _ = self.directory.add_remote(name, target);
        }

        log_info!("peer {} connected, offering {:?}", handshake.process_id, handshake.services);
    }

    fn on_reliable_message(&mut self, id: PeerId, payload: &[u8], now: Timestamp) {
        if payload.len() < 8 {
            self.counters.malformed_dropped += 1;
            return;
        }
        let timestamp = f64::from_be_bytes(payload[..8].try_into().unwrap());
        match Message::decode(&payload[8..], timestamp) {
            Ok(message) => {
                if message.path().starts_with("clock/") {
                    self.handle_clock_message(id, message, now);
                } else {
                    self.fifo.push(message.address.clone(), message, true);
                }
            }
            Err(_) => self.counters.malformed_dropped += 1,
        }
    }

    fn poll_peer_udp(&mut self) {
        let now = self.local_time();
        let mut buf = [0u8; 8192];
        loop {
            match self.udp_socket.recv_from(&mut buf) {
                Ok((n, _from)) => {
                    if n < 8 {
                        self.counters.malformed_dropped += 1;
                        continue;
                    }
                    let timestamp = f64::from_be_bytes(buf[..8].try_into().unwrap());
                    match Message::decode(&buf[8..n], timestamp) {
                        Ok(message) => {
                            if message.path().starts_with("clock/") {
                                if let Some(peer_id) = self.peers.find_by_process_id(clock_sender_id(&message)) {
                                    self.handle_clock_message(peer_id, message, now);
                                }
                            } else {
                                self.fifo.push(message.address.clone(), message, false);
                            }
                        }
                        Err(_) => self.counters.malformed_dropped += 1,
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    fn handle_clock_message(&mut self, peer_id: PeerId, message: Message, now: Timestamp) {
        let literal = message.is_literal_address();
        let path = message.path();
        if path.ends_with("ping") {
            if self.clock.role() != ClockRole::Master {
                return;
            }
            let mut ex = message.start_extract();
            let (Some(Arg::Long(sender_id)), Some(Arg::Int(ping_id)), Some(Arg::Double(t0))) =
                (ex.get_next('h'), ex.get_next('i'), ex.get_next('d'))
            else {
                self.counters.malformed_dropped += 1;
                return;
            };
            let t_master = self.local_time();
            let pong = MessageBuilder::new()
                .add_long(self.process_id as i64)
                .add_int(ping_id)
                .add_double(t_master)
                .seal(0.0, if literal { "!clock/pong" } else { "/clock/pong" })
                .expect("literal internal address is always well-formed");
            if let Some(peer) = self.peers.get(peer_id) {
                if let Some(addr) = peer.udp_addr() {
                    let _ = self.send_udp_raw(addr, &pong);
                }
            }
            let _ = sender_id;
        } else if path.ends_with("pong") {
            let mut ex = message.start_extract();
            let (Some(Arg::Long(_master_id)), Some(Arg::Int(ping_id)), Some(Arg::Double(t_master))) =
                (ex.get_next('h'), ex.get_next('i'), ex.get_next('d'))
            else {
                self.counters.malformed_dropped += 1;
                return;
            };
            let was_synced;
            {
                let Some(peer) = self.peers.get_mut(peer_id) else { return };
                was_synced = peer.is_synced();
                peer.clock.on_pong(ping_id as u32, t_master, now, &self.config.clock);
            }
            if let Some(peer) = self.peers.get(peer_id) {
                if !was_synced && peer.is_synced() {
                    self.directory.set_synced_for_peer(Some(peer_id), true);
                    log_info!("synced clock with master (peer {})", peer.process_id);
                }
            }
        }
    }

    fn send_udp_raw(&self, addr: SocketAddr, message: &Message) -> RuntimeResult<()> {
        let mut payload = Vec::new();
        payload.extend(message.timestamp.to_be_bytes());
        payload.extend(message.encode());
        self.udp_socket.send_to(&payload, addr)?;
        Ok(())
    }

    fn poll_osc_inbound(&mut self) {
        let now = self.local_time();
        let mut malformed_delta = 0u64;
        let mut produced = Vec::new();
        for port in &self.osc_inbound {
            let mut local_malformed = 0u64;
            produced.extend(port.inbound.poll(now, &mut local_malformed));
            malformed_delta += local_malformed;
        }
        self.osc_malformed += malformed_delta;
        for message in produced {
            self.fifo.push(message.address.clone(), message, false);
        }
    }

    fn emit_periodic(&mut self) {
        let now = self.local_time();
        let interval = self.config.network.discovery_interval_ms as f64 / 1000.0;
        self.discovery.maybe_beacon(now, interval);

        if self.clock.role() == ClockRole::Client {
            let ping_interval = self.config.clock.ping_interval_ms as f64 / 1000.0;
            if let Some(master_id) = self.master_peer {
                let due = self
                    .peers
                    .get(master_id)
                    .is_some_and(|p| p.clock.due_for_ping(now, ping_interval));
                if due {
                    let (ping_id, t0) = self
                        .peers
                        .get_mut(master_id)
                        .map(|p| p.clock.start_ping(now))
                        .unwrap_or((0, now));
                    let ping = MessageBuilder::new()
                        .add_long(self.process_id as i64)
                        .add_int(ping_id as i32)
                        .add_double(t0)
                        .seal(0.0, "/clock/ping")
                        .expect("literal internal address is always well-formed");
                    if let Some(addr) = self.peers.get(master_id).and_then(|p| p.udp_addr()) {
                        let _ = self.send_udp_raw(addr, &ping);
                    }
                }
            }
        }
    }

    fn flush_peer_writes(&mut self) {
        let ids: Vec<PeerId> = self.peers.iter().map(|p| p.id).collect();
        let mut to_drop = Vec::new();

        for id in ids {
            let Some(peer) = self.peers.get_mut(id) else { continue };
            let udp_addr = peer.udp_addr();
            let udp_messages: Vec<Message> = peer.outbound_udp.drain(..).collect();
            let tcp_messages: Vec<Message> =
                if peer.channel.is_some() { peer.outbound_tcp.drain(..).collect() } else { Vec::new() };

            if let Some(addr) = udp_addr {
                for message in &udp_messages {
                    let mut datagram = Vec::with_capacity(8 + message.encode().len());
                    datagram.extend(message.timestamp.to_be_bytes());
                    datagram.extend(message.encode());
                    let _ = self.udp_socket.send_to(&datagram, addr);
                }
            }

            if let Some(peer) = self.peers.get_mut(id) {
                if let Some(channel) = peer.channel.as_mut() {
                    for message in &tcp_messages {
                        channel.queue_message(message.timestamp, &message.encode());
                    }
                    if channel.flush().is_err() {
                        to_drop.push(id);
                    }
                }
            }
        }

        for id in to_drop {
            self.drop_peer(id);
        }
    }

    fn reap_idle_peers(&mut self) {
        let now = self.local_time();
        let timeout = self.config.network.peer_idle_timeout_ms as f64 / 1000.0;
        for id in self.peers.idle_since(now, timeout) {
            log_warn!("peer timed out, dropping");
            self.drop_peer(id);
        }
    }

    fn drop_peer(&mut self, id: PeerId) {
        self.peers.drop_peer(id);
        for service in self.directory.drop_peer_services(id) {
            let purged =
                self.local_scheduler.purge_service(&service) + self.global_scheduler.purge_service(&service);
            if purged > 0 {
                log_warn!("dropped peer owning '{service}': discarded {purged} queued timed message(s)");
            }
        }
        if self.master_peer == Some(id) {
            self.master_peer = None;
        }
    }
}

/// Internal clock ping/pong messages carry the sender's process id as the
/// first argument so the UDP receive path (which doesn't know the sender's
/// `PeerId` the way the TCP path does, since one socket serves every peer)
/// can find the right peer record.
fn clock_sender_id(message: &Message) -> u64 {
    match message.args.first() {
        Some(Arg::Long(v)) => *v as u64,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(port_seed: u16) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.application_name = "test_app".to_string();
        config.network.discovery_port = 0;
        config.network.tcp_port = 0;
        config.network.udp_port = 0;
        config.network.broadcast_addr = "127.255.255.255".to_string();
        let _ = port_seed;
        config
    }

    #[test]
    fn rejects_empty_application_name() {
        let mut config = test_config(0);
        config.application_name = String::new();
        assert!(Runtime::new(config).is_err());
    }

    #[test]
    fn add_service_then_duplicate_is_rejected() {
        let mut rt = Runtime::new(test_config(1)).unwrap();
        rt.add_service("chat").unwrap();
        assert!(rt.add_service("chat").is_err());
        assert_eq!(rt.status("chat"), ServiceStatus::LocalNotime);
    }

    #[test]
    fn becoming_master_syncs_local_services_immediately() {
        let mut rt = Runtime::new(test_config(2)).unwrap();
        rt.add_service("chat").unwrap();
        rt.set_clock(None, None);
        assert_eq!(rt.status("chat"), ServiceStatus::Local);
    }

    #[test]
    fn immediate_send_reaches_a_registered_handler() {
        use std::cell::Cell;
        let mut rt = Runtime::new(test_config(3)).unwrap();
        rt.add_service("chat").unwrap();
        let seen = Rc::new(Cell::new(false));
        let seen_cl = seen.clone();
        rt.add_method(
            "chat/text",
            Some("s".to_string()),
            false,
            false,
            Rc::new(()),
            Box::new(move |_msg, _cookie| seen_cl.set(true)),
        )
        .unwrap();

        rt.send("/chat/text", 0.0, vec![Arg::Str("hi".into())], false).unwrap();
        rt.poll().unwrap();
        assert!(seen.get());
    }

    #[test]
    fn sending_to_unknown_service_is_dropped_not_blocking() {
        let mut rt = Runtime::new(test_config(4)).unwrap();
        rt.send("/nowhere/x", 0.0, vec![], false).unwrap();
        rt.poll().unwrap();
        assert_eq!(rt.error_counters().no_service_dropped, 1);
    }

    #[test]
    fn local_time_is_monotonic() {
        let mut rt = Runtime::new(test_config(5)).unwrap();
        let t1 = rt.local_time();
        let t2 = rt.local_time();
        assert!(t2 >= t1);
    }
}
