//! Connection-oriented unreliable datagrams over UDP.
//!
//! The layer gives the game exactly what it needs and nothing more: a
//! handshake that assigns a fixed player slot, per-peer best-effort packet
//! delivery with transparent fragmentation (newest message wins, partial
//! messages are dropped whole), RTT and RTT-variance estimates from a
//! lightweight ping exchange, and disconnect notifications with a reason
//! code. There is no retransmission: the protocol above achieves
//! reliability by redundantly resending its whole input queue.
//!
//! Sockets are non-blocking; both endpoints drain events from their
//! simulation thread, never from a background task.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::constants::{
    CONNECT_TIMEOUT, FRAGMENT_SIZE, IDLE_TIMEOUT, MAX_PLAYERS, MAX_SERVER_TO_CLIENT,
    PING_INTERVAL, PROTOCOL_VERSION,
};

const CTRL_HELLO: u8 = 0;
const CTRL_WELCOME: u8 = 1;
const CTRL_DENY: u8 = 2;
const CTRL_DATA: u8 = 3;
const CTRL_PING: u8 = 4;
const CTRL_PONG: u8 = 5;
const CTRL_DISCONNECT: u8 = 6;

/// Raw datagrams are at most one fragment plus the data header.
const RECV_BUFFER_SIZE: usize = FRAGMENT_SIZE + DATA_HEADER_LEN;
const DATA_HEADER_LEN: usize = 1 + 4 + 2 + 2;
const MAX_FRAGMENTS: usize = MAX_SERVER_TO_CLIENT / FRAGMENT_SIZE + 1;

/// Why a peer went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    Timeout,
    VersionMismatch,
    /// Every player slot is taken. Kept at its historical wire value.
    ServerFull,
    Unknown(u8),
}

impl DisconnectReason {
    pub fn to_u8(self) -> u8 {
        match self {
            DisconnectReason::Requested => 0,
            DisconnectReason::Timeout => 1,
            DisconnectReason::VersionMismatch => 2,
            DisconnectReason::ServerFull => 69,
            DisconnectReason::Unknown(code) => code,
        }
    }

    pub fn from_u8(code: u8) -> Self {
        match code {
            0 => DisconnectReason::Requested,
            1 => DisconnectReason::Timeout,
            2 => DisconnectReason::VersionMismatch,
            69 => DisconnectReason::ServerFull,
            other => DisconnectReason::Unknown(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not connected")]
    NotConnected,
    #[error("payload of {0} bytes exceeds the send budget")]
    PayloadTooLarge(usize),
}

/// What the poll loop hands back to the game.
#[derive(Debug)]
pub enum TransportEvent {
    /// Server: a peer completed the handshake into `slot`.
    /// Client: the handshake finished and `slot` is ours.
    Connected { slot: usize },
    /// A whole (possibly reassembled) packet arrived.
    Packet { slot: usize, data: Vec<u8> },
    Disconnected { slot: usize, reason: DisconnectReason },
}

/// RFC 6298-style smoothed RTT tracking.
#[derive(Debug, Default, Clone)]
struct RttEstimator {
    srtt: Option<f64>,
    rttvar: f64,
}

impl RttEstimator {
    fn sample(&mut self, rtt: f64) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2.0;
            }
            Some(srtt) => {
                self.rttvar = 0.75 * self.rttvar + 0.25 * (srtt - rtt).abs();
                self.srtt = Some(0.875 * srtt + 0.125 * rtt);
            }
        }
    }

    fn rtt(&self) -> f64 {
        self.srtt.unwrap_or(0.0)
    }

    fn variance(&self) -> f64 {
        self.rttvar
    }
}

/// In-progress reassembly of one fragmented message.
#[derive(Debug)]
struct Reassembly {
    seq: u32,
    fragments: Vec<Option<Vec<u8>>>,
    received: usize,
}

impl Reassembly {
    fn new(seq: u32, frag_count: usize) -> Self {
        Self {
            seq,
            fragments: (0..frag_count).map(|_| None).collect(),
            received: 0,
        }
    }

    /// Returns the whole message once every fragment landed.
    fn accept(&mut self, index: usize, payload: &[u8]) -> Option<Vec<u8>> {
        if index >= self.fragments.len() {
            return None;
        }
        if self.fragments[index].is_none() {
            self.fragments[index] = Some(payload.to_vec());
            self.received += 1;
        }
        if self.received == self.fragments.len() {
            let mut whole = Vec::new();
            for fragment in &self.fragments {
                whole.extend_from_slice(fragment.as_deref().unwrap_or(&[]));
            }
            Some(whole)
        } else {
            None
        }
    }
}

/// `a` is newer than `b` in sequence space (wraparound-safe).
fn seq_newer(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < u32::MAX / 2
}

fn send_control(socket: &UdpSocket, addr: SocketAddr, bytes: &[u8]) {
    // Unreliable by contract: a lost control packet is retried by the
    // surrounding state machine or the peer's timeout.
    if let Err(err) = socket.send_to(bytes, addr) {
        debug!(%err, "datagram send failed");
    }
}

fn hello_packet(token: u64) -> Vec<u8> {
    let mut out = vec![CTRL_HELLO];
    out.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    out.extend_from_slice(&token.to_le_bytes());
    out
}

fn data_packets(seq: u32, payload: &[u8]) -> Vec<Vec<u8>> {
    let frag_count = payload.len().div_ceil(FRAGMENT_SIZE).max(1);
    let mut out = Vec::with_capacity(frag_count);
    for (index, chunk) in payload.chunks(FRAGMENT_SIZE).enumerate() {
        let mut packet = Vec::with_capacity(DATA_HEADER_LEN + chunk.len());
        packet.push(CTRL_DATA);
        packet.extend_from_slice(&seq.to_le_bytes());
        packet.extend_from_slice(&(index as u16).to_le_bytes());
        packet.extend_from_slice(&(frag_count as u16).to_le_bytes());
        packet.extend_from_slice(chunk);
        out.push(packet);
    }
    if payload.is_empty() {
        let mut packet = Vec::with_capacity(DATA_HEADER_LEN);
        packet.push(CTRL_DATA);
        packet.extend_from_slice(&seq.to_le_bytes());
        packet.extend_from_slice(&0u16.to_le_bytes());
        packet.extend_from_slice(&1u16.to_le_bytes());
        out.push(packet);
    }
    out
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

fn read_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

/// A parsed data fragment, shared by both endpoints.
struct DataFragment<'a> {
    seq: u32,
    index: usize,
    count: usize,
    payload: &'a [u8],
}

fn parse_data(bytes: &[u8]) -> Option<DataFragment<'_>> {
    if bytes.len() < DATA_HEADER_LEN {
        return None;
    }
    let seq = read_u32(&bytes[1..5]);
    let index = read_u16(&bytes[5..7]) as usize;
    let count = read_u16(&bytes[7..9]) as usize;
    if count == 0 || count > MAX_FRAGMENTS || index >= count {
        return None;
    }
    Some(DataFragment {
        seq,
        index,
        count,
        payload: &bytes[DATA_HEADER_LEN..],
    })
}

/// Feed a fragment through a peer's reassembly slot; newest message wins.
fn accept_fragment(
    reassembly: &mut Option<Reassembly>,
    fragment: DataFragment<'_>,
) -> Option<Vec<u8>> {
    if fragment.count == 1 {
        *reassembly = None;
        return Some(fragment.payload.to_vec());
    }
    let stale = reassembly
        .as_ref()
        .is_some_and(|r| seq_newer(fragment.seq, r.seq));
    if stale || reassembly.is_none() {
        *reassembly = Some(Reassembly::new(fragment.seq, fragment.count));
    }
    let current = reassembly.as_mut()?;
    if current.seq != fragment.seq || current.fragments.len() != fragment.count {
        return None; // older or inconsistent message: drop the fragment
    }
    let whole = current.accept(fragment.index, fragment.payload);
    if whole.is_some() {
        *reassembly = None;
    }
    whole
}

// ── Server side ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct Peer {
    addr: SocketAddr,
    token: u64,
    last_recv: Instant,
    last_ping: Instant,
    ping_nonce: u64,
    ping_sent: Option<(u64, Instant)>,
    next_seq: u32,
    reassembly: Option<Reassembly>,
    rtt: RttEstimator,
}

/// Server endpoint: owns the socket and the fixed slot table.
pub struct ServerTransport {
    socket: UdpSocket,
    by_addr: HashMap<SocketAddr, usize>,
    slots: [Option<Peer>; MAX_PLAYERS],
    buf: [u8; RECV_BUFFER_SIZE],
}

impl ServerTransport {
    pub fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        info!(local = %socket.local_addr()?, "server transport bound");
        Ok(Self {
            socket,
            by_addr: HashMap::new(),
            slots: std::array::from_fn(|_| None),
            buf: [0; RECV_BUFFER_SIZE],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn connected_slots(&self) -> Vec<usize> {
        (0..MAX_PLAYERS).filter(|i| self.slots[*i].is_some()).collect()
    }

    pub fn rtt(&self, slot: usize) -> f64 {
        self.slots
            .get(slot)
            .and_then(|p| p.as_ref())
            .map(|p| p.rtt.rtt())
            .unwrap_or(0.0)
    }

    pub fn rtt_variance(&self, slot: usize) -> f64 {
        self.slots
            .get(slot)
            .and_then(|p| p.as_ref())
            .map(|p| p.rtt.variance())
            .unwrap_or(0.0)
    }

    /// Drain the socket and the peer timers into `events`.
    pub fn service(&mut self, events: &mut Vec<TransportEvent>) {
        loop {
            match self.socket.recv_from(&mut self.buf) {
                Ok((len, addr)) => {
                    let bytes: Vec<u8> = self.buf[..len].to_vec();
                    self.handle_datagram(&bytes, addr, events);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(%err, "server socket recv error");
                    break;
                }
            }
        }

        let now = Instant::now();
        for slot in 0..MAX_PLAYERS {
            let Some(peer) = &mut self.slots[slot] else { continue };
            if now.duration_since(peer.last_recv).as_secs_f64() > IDLE_TIMEOUT {
                let addr = peer.addr;
                self.by_addr.remove(&addr);
                self.slots[slot] = None;
                events.push(TransportEvent::Disconnected {
                    slot,
                    reason: DisconnectReason::Timeout,
                });
                continue;
            }
            if now.duration_since(peer.last_ping).as_secs_f64() > PING_INTERVAL {
                peer.last_ping = now;
                peer.ping_nonce = peer.ping_nonce.wrapping_add(1);
                peer.ping_sent = Some((peer.ping_nonce, now));
                let mut packet = vec![CTRL_PING];
                packet.extend_from_slice(&peer.ping_nonce.to_le_bytes());
                send_control(&self.socket, peer.addr, &packet);
            }
        }
    }

    fn handle_datagram(
        &mut self,
        bytes: &[u8],
        addr: SocketAddr,
        events: &mut Vec<TransportEvent>,
    ) {
        if bytes.is_empty() {
            return;
        }
        match bytes[0] {
            CTRL_HELLO => self.handle_hello(bytes, addr, events),
            CTRL_DATA => {
                let Some(slot) = self.by_addr.get(&addr).copied() else { return };
                let Some(peer) = &mut self.slots[slot] else { return };
                peer.last_recv = Instant::now();
                let Some(fragment) = parse_data(bytes) else { return };
                if let Some(data) = accept_fragment(&mut peer.reassembly, fragment) {
                    events.push(TransportEvent::Packet { slot, data });
                }
            }
            CTRL_PING if bytes.len() >= 9 => {
                if self.by_addr.contains_key(&addr) {
                    let mut packet = vec![CTRL_PONG];
                    packet.extend_from_slice(&bytes[1..9]);
                    send_control(&self.socket, addr, &packet);
                }
            }
            CTRL_PONG if bytes.len() >= 9 => {
                let Some(slot) = self.by_addr.get(&addr).copied() else { return };
                let Some(peer) = &mut self.slots[slot] else { return };
                peer.last_recv = Instant::now();
                let nonce = read_u64(&bytes[1..9]);
                if let Some((expected, sent)) = peer.ping_sent {
                    if expected == nonce {
                        peer.rtt.sample(sent.elapsed().as_secs_f64());
                        peer.ping_sent = None;
                    }
                }
            }
            CTRL_DISCONNECT => {
                let reason = bytes
                    .get(1)
                    .map(|b| DisconnectReason::from_u8(*b))
                    .unwrap_or(DisconnectReason::Requested);
                if let Some(slot) = self.by_addr.remove(&addr) {
                    self.slots[slot] = None;
                    events.push(TransportEvent::Disconnected { slot, reason });
                }
            }
            other => debug!(other, "unknown control byte"),
        }
    }

    fn handle_hello(&mut self, bytes: &[u8], addr: SocketAddr, events: &mut Vec<TransportEvent>) {
        if bytes.len() < 13 {
            return;
        }
        let version = read_u32(&bytes[1..5]);
        let token = read_u64(&bytes[5..13]);
        if version != PROTOCOL_VERSION {
            warn!(version, %addr, "rejecting peer with mismatched protocol");
            send_control(
                &self.socket,
                addr,
                &[CTRL_DENY, DisconnectReason::VersionMismatch.to_u8()],
            );
            return;
        }
        // Duplicate Hello from a connected peer: re-send the Welcome.
        if let Some(slot) = self.by_addr.get(&addr).copied() {
            if let Some(peer) = &self.slots[slot] {
                if peer.token == token {
                    self.send_welcome(addr, token, slot);
                    return;
                }
            }
        }
        let Some(slot) = (0..MAX_PLAYERS).find(|i| self.slots[*i].is_none()) else {
            info!(%addr, "rejecting peer: server full");
            send_control(
                &self.socket,
                addr,
                &[CTRL_DENY, DisconnectReason::ServerFull.to_u8()],
            );
            return;
        };
        let now = Instant::now();
        self.slots[slot] = Some(Peer {
            addr,
            token,
            last_recv: now,
            last_ping: now,
            ping_nonce: 0,
            ping_sent: None,
            next_seq: 0,
            reassembly: None,
            rtt: RttEstimator::default(),
        });
        self.by_addr.insert(addr, slot);
        self.send_welcome(addr, token, slot);
        info!(%addr, slot, "peer connected");
        events.push(TransportEvent::Connected { slot });
    }

    fn send_welcome(&self, addr: SocketAddr, token: u64, slot: usize) {
        let mut packet = vec![CTRL_WELCOME];
        packet.extend_from_slice(&token.to_le_bytes());
        packet.push(slot as u8);
        send_control(&self.socket, addr, &packet);
    }

    /// Best-effort send to one slot, fragmenting as needed.
    pub fn send(&mut self, slot: usize, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > MAX_SERVER_TO_CLIENT {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }
        let Some(peer) = self.slots.get_mut(slot).and_then(|p| p.as_mut()) else {
            return Err(TransportError::NotConnected);
        };
        let seq = peer.next_seq;
        peer.next_seq = peer.next_seq.wrapping_add(1);
        let addr = peer.addr;
        for packet in data_packets(seq, payload) {
            send_control(&self.socket, addr, &packet);
        }
        Ok(())
    }

    /// Actively drop a peer with a reason code.
    pub fn disconnect(&mut self, slot: usize, reason: DisconnectReason) {
        if let Some(peer) = self.slots.get_mut(slot).and_then(|p| p.take()) {
            self.by_addr.remove(&peer.addr);
            send_control(
                &self.socket,
                peer.addr,
                &[CTRL_DISCONNECT, reason.to_u8()],
            );
        }
    }
}

// ── Client side ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientPhase {
    Connecting,
    Connected { slot: usize },
    Disconnected,
}

/// Client endpoint: one connection to one server.
pub struct ClientTransport {
    socket: UdpSocket,
    server: SocketAddr,
    phase: ClientPhase,
    token: u64,
    started: Instant,
    last_hello: Instant,
    last_recv: Instant,
    last_ping: Instant,
    ping_nonce: u64,
    ping_sent: Option<(u64, Instant)>,
    next_seq: u32,
    reassembly: Option<Reassembly>,
    rtt: RttEstimator,
    buf: [u8; RECV_BUFFER_SIZE],
}

impl ClientTransport {
    /// Bind an ephemeral socket and start the handshake.
    pub fn connect(server: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_nonblocking(true)?;
        let token: u64 = rand::random();
        let now = Instant::now();
        send_control(&socket, server, &hello_packet(token));
        Ok(Self {
            socket,
            server,
            phase: ClientPhase::Connecting,
            token,
            started: now,
            last_hello: now,
            last_recv: now,
            last_ping: now,
            ping_nonce: 0,
            ping_sent: None,
            next_seq: 0,
            reassembly: None,
            rtt: RttEstimator::default(),
            buf: [0; RECV_BUFFER_SIZE],
        })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.phase, ClientPhase::Connected { .. })
    }

    pub fn slot(&self) -> Option<usize> {
        match self.phase {
            ClientPhase::Connected { slot } => Some(slot),
            _ => None,
        }
    }

    pub fn rtt(&self) -> f64 {
        self.rtt.rtt()
    }

    pub fn rtt_variance(&self) -> f64 {
        self.rtt.variance()
    }

    /// Drain socket and timers into `events`.
    pub fn service(&mut self, events: &mut Vec<TransportEvent>) {
        loop {
            match self.socket.recv_from(&mut self.buf) {
                Ok((len, addr)) => {
                    if addr != self.server {
                        continue;
                    }
                    let bytes: Vec<u8> = self.buf[..len].to_vec();
                    self.handle_datagram(&bytes, events);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(%err, "client socket recv error");
                    break;
                }
            }
        }

        let now = Instant::now();
        match self.phase {
            ClientPhase::Connecting => {
                if now.duration_since(self.started).as_secs_f64() > CONNECT_TIMEOUT {
                    self.phase = ClientPhase::Disconnected;
                    events.push(TransportEvent::Disconnected {
                        slot: 0,
                        reason: DisconnectReason::Timeout,
                    });
                } else if now.duration_since(self.last_hello) > Duration::from_millis(250) {
                    self.last_hello = now;
                    send_control(&self.socket, self.server, &hello_packet(self.token));
                }
            }
            ClientPhase::Connected { slot } => {
                if now.duration_since(self.last_recv).as_secs_f64() > IDLE_TIMEOUT {
                    self.phase = ClientPhase::Disconnected;
                    events.push(TransportEvent::Disconnected {
                        slot,
                        reason: DisconnectReason::Timeout,
                    });
                } else if now.duration_since(self.last_ping).as_secs_f64() > PING_INTERVAL {
                    self.last_ping = now;
                    self.ping_nonce = self.ping_nonce.wrapping_add(1);
                    self.ping_sent = Some((self.ping_nonce, now));
                    let mut packet = vec![CTRL_PING];
                    packet.extend_from_slice(&self.ping_nonce.to_le_bytes());
                    send_control(&self.socket, self.server, &packet);
                }
            }
            ClientPhase::Disconnected => {}
        }
    }

    fn handle_datagram(&mut self, bytes: &[u8], events: &mut Vec<TransportEvent>) {
        if bytes.is_empty() {
            return;
        }
        self.last_recv = Instant::now();
        match bytes[0] {
            CTRL_WELCOME if bytes.len() >= 10 => {
                let token = read_u64(&bytes[1..9]);
                let slot = bytes[9] as usize;
                if token != self.token || slot >= MAX_PLAYERS {
                    return;
                }
                if self.phase == ClientPhase::Connecting {
                    self.phase = ClientPhase::Connected { slot };
                    info!(slot, "connected to server");
                    events.push(TransportEvent::Connected { slot });
                }
            }
            CTRL_DENY if bytes.len() >= 2 => {
                let reason = DisconnectReason::from_u8(bytes[1]);
                warn!(?reason, "connection denied");
                self.phase = ClientPhase::Disconnected;
                events.push(TransportEvent::Disconnected { slot: 0, reason });
            }
            CTRL_DATA => {
                let ClientPhase::Connected { slot } = self.phase else { return };
                let Some(fragment) = parse_data(bytes) else { return };
                if let Some(data) = accept_fragment(&mut self.reassembly, fragment) {
                    events.push(TransportEvent::Packet { slot, data });
                }
            }
            CTRL_PING if bytes.len() >= 9 => {
                let mut packet = vec![CTRL_PONG];
                packet.extend_from_slice(&bytes[1..9]);
                send_control(&self.socket, self.server, &packet);
            }
            CTRL_PONG if bytes.len() >= 9 => {
                let nonce = read_u64(&bytes[1..9]);
                if let Some((expected, sent)) = self.ping_sent {
                    if expected == nonce {
                        self.rtt.sample(sent.elapsed().as_secs_f64());
                        self.ping_sent = None;
                    }
                }
            }
            CTRL_DISCONNECT => {
                let reason = bytes
                    .get(1)
                    .map(|b| DisconnectReason::from_u8(*b))
                    .unwrap_or(DisconnectReason::Requested);
                let slot = self.slot().unwrap_or(0);
                self.phase = ClientPhase::Disconnected;
                events.push(TransportEvent::Disconnected { slot, reason });
            }
            other => debug!(other, "unknown control byte"),
        }
    }

    /// Best-effort send to the server, fragmenting as needed.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if payload.len() > MAX_SERVER_TO_CLIENT {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        for packet in data_packets(seq, payload) {
            send_control(&self.socket, self.server, &packet);
        }
        Ok(())
    }

    /// Tell the server we are leaving, then stop.
    pub fn disconnect(&mut self) {
        if self.is_connected() {
            send_control(
                &self.socket,
                self.server,
                &[CTRL_DISCONNECT, DisconnectReason::Requested.to_u8()],
            );
        }
        self.phase = ClientPhase::Disconnected;
    }
}
