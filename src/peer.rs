//! Peer Record and peer table (spec §3, §9 "Cyclic references").
//!
//! Peers and services reference each other cyclically (a directory entry
//! names its owning peer; a peer lists the service names it offers). The
//! design note resolves this with an arena plus integer ids rather than
//! `Rc`-cycles: the directory stores a [`PeerId`], the [`PeerTable`] is the
//! arena, and dropping a peer simply invalidates the id — dependents
//! discover this lazily via a `FAIL` status and purge (see `directory.rs`).

use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};

use crate::clock_sync::ClockSyncState;
use crate::message::Timestamp;

/// Frame tag for the reliable channel's length-delimited framing.
pub const FRAME_HANDSHAKE: u8 = 0;
pub const FRAME_MESSAGE: u8 = 1;

/// The TCP reliable channel to one peer (spec §4.5 "keep-alive over the TCP
/// channel"). Framing is `[4-byte BE length][1-byte frame type][payload]`;
/// length counts the type byte plus payload. Reads and writes are
/// non-blocking and back-pressured through in-memory buffers so a single
/// slow peer can never stall the poll loop (spec §5: "no suspension points").
#[derive(Debug)]
pub struct ReliableChannel {
    stream: TcpStream,
    read_buf: Vec<u8>,
    write_buf: VecDeque<u8>,
}

impl ReliableChannel {
    /// Dials a peer's TCP service port. The connect itself is the one place
    /// in this crate that accepts a brief blocking call — std offers no
    /// portable nonblocking connect without an extra crate, and a peer
    /// handshake happens at most once per peer (see `DESIGN.md`).
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true).ok();
        Ok(ReliableChannel { stream, read_buf: Vec::new(), write_buf: VecDeque::new() })
    }

    fn queue_frame(&mut self, frame_type: u8, payload: &[u8]) {
        let len = (payload.len() + 1) as u32;
        self.write_buf.extend(len.to_be_bytes());
        self.write_buf.push_back(frame_type);
        self.write_buf.extend(payload);
    }

    pub fn queue_handshake(&mut self, payload: &[u8]) {
        self.queue_frame(FRAME_HANDSHAKE, payload);
    }

    pub fn queue_message(&mut self, timestamp: Timestamp, encoded: &[u8]) {
        let mut payload = Vec::with_capacity(8 + encoded.len());
        payload.extend(timestamp.to_be_bytes());
        payload.extend(encoded);
        self.queue_frame(FRAME_MESSAGE, &payload);
    }

    /// Writes as much of the queued bytes as the socket accepts right now.
    pub fn flush(&mut self) -> io::Result<()> {
        while let Some(&byte) = self.write_buf.front() {
            let chunk: Vec<u8> = self.write_buf.iter().copied().take(4096).collect();
            match self.stream.write(&chunk) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
                Ok(n) => {
                    for _ in 0..n {
                        self.write_buf.pop_front();
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
            let _ = byte;
        }
        Ok(())
    }

    /// Drains whatever bytes are available and returns every complete frame
    /// as `(frame_type, payload)`. Partial frames remain buffered for the
    /// next poll.
    pub fn poll_frames(&mut self) -> io::Result<Vec<(u8, Vec<u8>)>> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(io::Error::from(ErrorKind::UnexpectedEof)),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        let mut frames = Vec::new();
        let mut consumed = 0;
        loop {
            if self.read_buf.len() - consumed < 4 {
                break;
            }
            let len = u32::from_be_bytes(self.read_buf[consumed..consumed + 4].try_into().unwrap()) as usize;
            if self.read_buf.len() - consumed - 4 < len {
                break;
            }
            let frame_type = self.read_buf[consumed + 4];
            let payload = self.read_buf[consumed + 5..consumed + 4 + len].to_vec();
            frames.push((frame_type, payload));
            consumed += 4 + len;
        }
        self.read_buf.drain(..consumed);
        Ok(frames)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Announced,
    Connecting,
    Connected,
    Syncing,
    Synced,
    Dropped,
}

/// Remote process identity and everything the local process tracks about it.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub process_id: u64,
    pub host: IpAddr,
    pub discovery_port: u16,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub state: PeerState,
    pub last_seen: Timestamp,
    pub services: Vec<String>,
    pub clock: ClockSyncState,
    pub reliable_connected: bool,
    /// `true` if this peer advertised itself as the application's master
    /// (spec §4.6). At most one peer should ever have this set; the local
    /// process pings only its master for clock sync.
    pub is_master: bool,
    /// Outbound queues drained by the runtime's socket-writing step (spec
    /// §4.7 step 3): best-effort over UDP, reliable over TCP.
    pub outbound_udp: Vec<crate::message::Message>,
    pub outbound_tcp: Vec<crate::message::Message>,
    /// `None` until the TCP handshake (spec §4.5) completes in either
    /// direction.
    pub channel: Option<ReliableChannel>,
}

impl Peer {
    pub fn new(id: PeerId, process_id: u64, host: IpAddr, discovery_port: u16) -> Self {
        Peer {
            id,
            process_id,
            host,
            discovery_port,
            udp_port: 0,
            tcp_port: 0,
            state: PeerState::Announced,
            last_seen: 0.0,
            services: Vec::new(),
            clock: ClockSyncState::new(),
            reliable_connected: false,
            is_master: false,
            outbound_udp: Vec::new(),
            outbound_tcp: Vec::new(),
            channel: None,
        }
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        if self.udp_port == 0 {
            None
        } else {
            Some(SocketAddr::new(self.host, self.udp_port))
        }
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        if self.tcp_port == 0 {
            None
        } else {
            Some(SocketAddr::new(self.host, self.tcp_port))
        }
    }

    pub fn is_synced(&self) -> bool {
        self.clock.is_synced()
    }
}

/// The arena owning every known peer, keyed by [`PeerId`].
#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<PeerId, Peer>,
    next_id: u64,
}

impl PeerTable {
    pub fn new() -> Self {
        PeerTable { peers: HashMap::new(), next_id: 1 }
    }

    pub fn insert(&mut self, process_id: u64, host: IpAddr, discovery_port: u16) -> PeerId {
        let id = PeerId(self.next_id);
        self.next_id += 1;
        self.peers.insert(id, Peer::new(id, process_id, host, discovery_port));
        id
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub fn find_by_process_id(&self, process_id: u64) -> Option<PeerId> {
        self.peers.iter().find(|(_, p)| p.process_id == process_id).map(|(id, _)| *id)
    }

    /// Removes a peer outright. Callers are responsible for walking the
    /// directory and turning any entries that named this peer into `FAIL`
    /// (spec §4.4: "On drop, the service disappears").
    pub fn drop_peer(&mut self, id: PeerId) -> Option<Peer> {
        self.peers.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    /// Peers whose `last_seen` is older than `timeout` relative to `now`,
    /// candidates for re-announce-then-drop (spec §4.5).
    pub fn idle_since(&self, now: Timestamp, timeout: Timestamp) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|p| p.state != PeerState::Dropped && now - p.last_seen > timeout)
            .map(|p| p.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn insert_and_lookup() {
        let mut table = PeerTable::new();
        let id = table.insert(42, IpAddr::V4(Ipv4Addr::LOCALHOST), 45_678);
        assert_eq!(table.find_by_process_id(42), Some(id));
        assert!(table.get(id).is_some());
    }

    #[test]
    fn drop_invalidates_id() {
        let mut table = PeerTable::new();
        let id = table.insert(1, IpAddr::V4(Ipv4Addr::LOCALHOST), 45_678);
        table.drop_peer(id);
        assert!(table.get(id).is_none());
    }

    #[test]
    fn idle_peers_are_found() {
        let mut table = PeerTable::new();
        let id = table.insert(1, IpAddr::V4(Ipv4Addr::LOCALHOST), 45_678);
        table.get_mut(id).unwrap().last_seen = 0.0;
        assert_eq!(table.idle_since(10.0, 5.0), vec![id]);
    }

    #[test]
    fn reliable_channel_frames_survive_a_loopback_round_trip() {
        use std::net::TcpListener;
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut dialer = ReliableChannel::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let mut listener_side = ReliableChannel::from_stream(accepted).unwrap();

        dialer.queue_handshake(b"hello");
        dialer.queue_message(1.5, b"encoded-message");

        let mut frames = Vec::new();
        for _ in 0..50 {
            dialer.flush().unwrap();
            if let Ok(more) = listener_side.poll_frames() {
                frames.extend(more);
            }
            if frames.len() == 2 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], (FRAME_HANDSHAKE, b"hello".to_vec()));
        assert_eq!(frames[1].0, FRAME_MESSAGE);
        assert_eq!(&frames[1].1[..8], &1.5f64.to_be_bytes());
        assert_eq!(&frames[1].1[8..], b"encoded-message");
    }
}
