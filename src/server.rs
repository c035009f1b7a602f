//! The authoritative server loop.
//!
//! Single-threaded and cooperative: drain transport events, merge received
//! input queues into per-slot buffers, step the fixed-timestep simulation
//! as far as accumulated wall time allows (clamped against death spirals),
//! persist the world on a timer, then fan a compressed snapshot out to
//! every connected peer and route their voice packets to each other.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::SeedableRng;
use tracing::{error, info, warn};

use crate::constants::{
    MAX_ACCUMULATED_TIME, MAX_PLAYERS, MAX_SERVER_TO_CLIENT, SNAPSHOT_SUBSAMPLE,
    TIME_BETWEEN_WORLD_SAVE, TIMESTEP,
};
use crate::simulation::GameState;
use crate::transport::{DisconnectReason, ServerTransport, TransportError, TransportEvent};
use crate::voice::VoiceQueue;
use crate::wire_format::{
    compress_snapshot, decode_client_to_server, decode_snapshot, encode_snapshot,
};

pub struct ServerConfig {
    pub addr: std::net::SocketAddr,
    /// World persistence file; `None` disables saving and loading.
    pub save_path: Option<PathBuf>,
}

pub struct Server {
    transport: ServerTransport,
    gs: GameState,
    save_path: Option<PathBuf>,
    /// Freshest input id adopted per slot; anything older is a retransmit.
    latest_id_processed: [u64; MAX_PLAYERS],
    /// Voice packets waiting to go out to each slot.
    voice_out: [VoiceQueue; MAX_PLAYERS],
    accumulator: f64,
    last_update: Instant,
    last_save: Instant,
    events: Vec<TransportEvent>,
    snapshot_buf: Vec<u8>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self, TransportError> {
        let transport = ServerTransport::bind(config.addr)?;
        let mut gs = GameState::new();

        let loaded = config
            .save_path
            .as_deref()
            .and_then(|path| match std::fs::read(path) {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    info!(%err, ?path, "no readable save file, starting fresh");
                    None
                }
            })
            .and_then(|bytes| match decode_snapshot(&bytes) {
                Ok(decoded) => Some(decoded.gs),
                Err(err) => {
                    error!(%err, "save file failed to decode, starting fresh");
                    None
                }
            });

        match loaded {
            Some(mut saved) => {
                // Nobody is connected to a freshly started server; release
                // every slot and the bodies that went with them.
                for slot in 0..MAX_PLAYERS {
                    if let Some(id) = saved.players[slot].entity.take() {
                        saved.arena.destroy(id, &mut saved.physics);
                    }
                    saved.players[slot].connected = false;
                    saved.input_buffers[slot].clear();
                }
                info!(tick = saved.tick, "world loaded from save");
                gs = saved;
            }
            None => {
                let mut rng = rand::rngs::StdRng::seed_from_u64(0x5ad_d217);
                gs.bootstrap(&mut rng);
            }
        }

        Ok(Self {
            transport,
            gs,
            save_path: config.save_path,
            latest_id_processed: [0; MAX_PLAYERS],
            voice_out: std::array::from_fn(|_| VoiceQueue::new()),
            accumulator: 0.0,
            last_update: Instant::now(),
            last_save: Instant::now(),
            events: Vec::new(),
            snapshot_buf: vec![0u8; MAX_SERVER_TO_CLIENT],
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, TransportError> {
        self.transport.local_addr()
    }

    /// Authoritative state, for in-process embedding and tests.
    pub fn game_state(&self) -> &GameState {
        &self.gs
    }

    /// Mutable authoritative state, for in-process embedding and tests.
    pub fn game_state_mut(&mut self) -> &mut GameState {
        &mut self.gs
    }

    /// Run until `shutdown` flips. The in-process host thread of a client
    /// uses this; the dedicated binary passes a flag that never flips.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        info!("server loop starting");
        while !shutdown.load(Ordering::Relaxed) {
            self.tick_once();
            std::thread::sleep(Duration::from_millis(1));
        }
        self.save_world();
        info!("server loop stopped");
    }

    /// One cooperative loop iteration; separated out so tests can drive
    /// the server deterministically.
    pub fn tick_once(&mut self) {
        let mut events = std::mem::take(&mut self.events);
        events.clear();
        self.transport.service(&mut events);
        for event in events.drain(..) {
            self.handle_event(event);
        }
        self.events = events;

        // Fixed-timestep catch-up, clamped so a stall cannot death-spiral.
        let now = Instant::now();
        self.accumulator += now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        if self.accumulator > MAX_ACCUMULATED_TIME {
            warn!(
                behind = self.accumulator,
                "falling behind real time, clamping"
            );
            self.accumulator = MAX_ACCUMULATED_TIME;
        }
        let mut stepped = false;
        while self.accumulator >= TIMESTEP {
            self.gs.step(TIMESTEP);
            self.accumulator -= TIMESTEP;
            stepped = true;
        }

        if self.save_path.is_some()
            && self.last_save.elapsed().as_secs_f64() > TIME_BETWEEN_WORLD_SAVE
        {
            self.last_save = Instant::now();
            self.save_world();
        }

        if stepped && self.gs.tick % SNAPSHOT_SUBSAMPLE == 0 {
            self.broadcast_snapshots();
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { slot } => {
                info!(slot, "player connected");
                self.gs.players[slot].connected = true;
                self.gs.players[slot].entity = None;
                self.gs.players[slot].build_failed = false;
                self.gs.respawn_squads[slot] = Default::default();
                self.gs.input_buffers[slot].clear();
                self.latest_id_processed[slot] = 0;
                self.voice_out[slot].clear();
            }
            TransportEvent::Packet { slot, data } => self.handle_packet(slot, &data),
            TransportEvent::Disconnected { slot, reason } => {
                info!(slot, ?reason, "player disconnected");
                if let Some(id) = self.gs.players[slot].entity.take() {
                    self.gs.arena.destroy(id, &mut self.gs.physics);
                }
                self.gs.players[slot].connected = false;
                self.gs.input_buffers[slot].clear();
                self.latest_id_processed[slot] = 0;
                self.voice_out[slot].clear();
            }
        }
    }

    /// Merge one ClientToServer packet: adopt every frame fresher than the
    /// slot's high-water id (event flags OR-merge inside the queue), then
    /// advance the high-water mark. Stale retransmits fall out here.
    fn handle_packet(&mut self, slot: usize, data: &[u8]) {
        let msg = match decode_client_to_server(data) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(slot, %err, "bad packet from client");
                return;
            }
        };

        let mut newest_id = self.latest_id_processed[slot];
        for frame in &msg.inputs {
            if frame.id <= self.latest_id_processed[slot] {
                continue;
            }
            newest_id = newest_id.max(frame.id);
            if frame.tick < self.gs.tick {
                continue; // too late to matter, but the id still advances
            }
            self.gs.input_buffers[slot].merge(frame.clone());
        }
        self.latest_id_processed[slot] = newest_id;

        // Route this player's voice to everyone else.
        for packet in msg.voice {
            for other in 0..MAX_PLAYERS {
                if other != slot && self.gs.players[other].connected {
                    self.voice_out[other].push(packet.clone());
                }
            }
        }
    }

    fn broadcast_snapshots(&mut self) {
        for slot in self.transport.connected_slots() {
            if !self.gs.players[slot].connected {
                continue;
            }
            let mut voice = self.voice_out[slot].drain();
            let len = match encode_snapshot(
                &mut self.gs,
                slot as i32,
                &mut voice,
                &mut self.snapshot_buf,
            ) {
                Ok(len) => len,
                Err(err) => {
                    error!(slot, %err, "failed to serialize snapshot");
                    continue;
                }
            };
            let compressed = compress_snapshot(&self.snapshot_buf[..len]);
            match self.transport.send(slot, &compressed) {
                Ok(()) => {
                    // The capacity report made it into this snapshot.
                    self.gs.players[slot].build_failed = false;
                }
                Err(err) => warn!(slot, %err, "snapshot send failed"),
            }
        }
    }

    /// Serialize the whole world (spectator view, uncompressed) and swap
    /// it into place atomically. Best effort: failures are logged, never
    /// retried.
    fn save_world(&mut self) {
        let Some(path) = self.save_path.clone() else { return };
        let mut voice = Vec::new();
        let len = match encode_snapshot(&mut self.gs, -1, &mut voice, &mut self.snapshot_buf) {
            Ok(len) => len,
            Err(err) => {
                error!(%err, "failed to serialize world for saving");
                return;
            }
        };
        let tmp = path.with_extension("tmp");
        let result = std::fs::write(&tmp, &self.snapshot_buf[..len])
            .and_then(|()| std::fs::rename(&tmp, &path));
        match result {
            Ok(()) => info!(?path, bytes = len, tick = self.gs.tick, "world saved"),
            Err(err) => error!(%err, ?path, "world save failed"),
        }
    }

    /// Actively kick a peer (tests use this; the game itself only kicks by
    /// timeout).
    pub fn kick(&mut self, slot: usize, reason: DisconnectReason) {
        self.transport.disconnect(slot, reason);
        self.handle_event(TransportEvent::Disconnected { slot, reason });
    }

    /// RTT estimate for a slot, exposed for diagnostics.
    pub fn rtt(&self, slot: usize) -> f64 {
        self.transport.rtt(slot)
    }
}
