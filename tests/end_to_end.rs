//! End-to-end scenarios: real client and server objects wired over the UDP
//! transport on loopback, plus object-level reconciliation and persistence
//! round trips where sockets would only add noise.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use stardrift::client::ClientGame;
use stardrift::components::{BoxKind, EntityKind, InputFrame};
use stardrift::constants::{BOX_SIZE, MAX_CLIENT_TO_SERVER, MAX_SERVER_TO_CLIENT, TIMESTEP};
use stardrift::math::V2;
use stardrift::server::{Server, ServerConfig};
use stardrift::simulation::GameState;
use stardrift::transport::{ClientTransport, TransportEvent};
use stardrift::wire_format::{
    decode_client_to_server, decode_snapshot, decompress_snapshot, encode_client_to_server,
    encode_snapshot,
};

fn start_server() -> Server {
    let config = ServerConfig {
        addr: "127.0.0.1:0".parse().unwrap(),
        save_path: None,
    };
    Server::new(config).expect("server should bind an ephemeral port")
}

struct TestClient {
    transport: ClientTransport,
    game: ClientGame,
    last_frame: Instant,
    events: Vec<TransportEvent>,
    packet_buf: Vec<u8>,
}

impl TestClient {
    fn connect(addr: SocketAddr) -> Self {
        Self {
            transport: ClientTransport::connect(addr).expect("client socket"),
            game: ClientGame::new(),
            last_frame: Instant::now(),
            events: Vec::new(),
            packet_buf: vec![0u8; MAX_CLIENT_TO_SERVER],
        }
    }

    fn apply_incoming(&mut self) {
        self.events.clear();
        self.transport.service(&mut self.events);
        for event in self.events.drain(..) {
            if let TransportEvent::Packet { data, .. } = event {
                let Some(raw) = decompress_snapshot(&data) else { continue };
                let Ok(snapshot) = decode_snapshot(&raw) else { continue };
                self.game
                    .on_snapshot(snapshot, self.transport.rtt(), self.transport.rtt_variance());
            }
        }
    }

    fn pump(&mut self) {
        self.apply_incoming();

        let now = Instant::now();
        let wall_dt = now.duration_since(self.last_frame).as_secs_f64();
        self.last_frame = now;
        self.game.advance(wall_dt);

        if self.transport.is_connected() {
            let mut msg = self.game.make_input_packet(Vec::new());
            if let Ok(len) = encode_client_to_server(&mut msg, &mut self.packet_buf) {
                let _ = self.transport.send(&self.packet_buf[..len]);
            }
        }
    }
}

/// Pump server and clients until `done` holds or the deadline passes.
fn pump_until(
    server: &mut Server,
    clients: &mut [&mut TestClient],
    timeout: Duration,
    mut done: impl FnMut(&Server, &[&mut TestClient]) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        server.tick_once();
        for client in clients.iter_mut() {
            client.pump();
        }
        if done(server, clients) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

fn grid_and_box_count(gs: &GameState) -> (usize, usize) {
    (
        gs.arena.iter_kind(EntityKind::Grid).count(),
        gs.arena.iter_kind(EntityKind::Box).count(),
    )
}

#[test]
fn solo_client_builds_then_loses_the_box() {
    let mut server = start_server();
    let addr = server.local_addr().unwrap();
    let mut client = TestClient::connect(addr);

    // Warm up: connected, snapshot applied, predicting comfortably ahead.
    let ready = pump_until(
        &mut server,
        &mut [&mut client],
        Duration::from_secs(10),
        |server, clients| {
            clients[0].game.my_slot.is_some()
                && clients[0].game.gs.tick > server.game_state().tick + 2
        },
    );
    assert!(ready, "client never reached a healthy prediction lead");

    // One build action: a hullpiece at arm's length.
    let mut build = InputFrame::default();
    build.dobuild = true;
    build.build_type = BoxKind::Hullpiece;
    build.hand_pos = V2::new(0.5, 0.0);
    client.game.latch_input(&build);

    let built = pump_until(
        &mut server,
        &mut [&mut client],
        Duration::from_secs(10),
        |server, clients| {
            grid_and_box_count(server.game_state()) == (1, 1)
                && grid_and_box_count(&clients[0].game.gs) == (1, 1)
        },
    );
    assert!(built, "the built box never appeared on both ends");

    // Damage the box to destruction; the grid must go with it, and the
    // client must observe the teardown through snapshots.
    {
        let gs = server.game_state_mut();
        let boxes = gs.arena.ids_of_kind(EntityKind::Box);
        gs.arena.get_mut(boxes[0]).unwrap().damage = 1.0;
    }
    let gone = pump_until(
        &mut server,
        &mut [&mut client],
        Duration::from_secs(10),
        |server, clients| {
            grid_and_box_count(server.game_state()) == (0, 0)
                && grid_and_box_count(&clients[0].game.gs) == (0, 0)
        },
    );
    assert!(gone, "destroyed grid/box still visible somewhere");
}

#[test]
fn second_client_observes_builder_and_states_converge() {
    let mut server = start_server();
    let addr = server.local_addr().unwrap();
    let mut alice = TestClient::connect(addr);
    let mut bob = TestClient::connect(addr);

    let ready = pump_until(
        &mut server,
        &mut [&mut alice, &mut bob],
        Duration::from_secs(10),
        |server, clients| {
            clients.iter().all(|c| {
                c.game.my_slot.is_some() && c.game.gs.tick > server.game_state().tick + 2
            })
        },
    );
    assert!(ready, "clients never reached a healthy prediction lead");

    // Alice builds three boxes: cockpit, gyroscope, battery. All placements
    // stay inside hand reach of her spawn position.
    let placements = [
        (BoxKind::Cockpit, V2::new(0.4, 0.0)),
        (BoxKind::Gyroscope, V2::new(0.4 + BOX_SIZE, 0.0)),
        (BoxKind::Battery, V2::new(0.4, BOX_SIZE)),
    ];
    for (i, (kind, hand)) in placements.into_iter().enumerate() {
        let mut build = InputFrame::default();
        build.dobuild = true;
        build.build_type = kind;
        build.hand_pos = hand;
        alice.game.latch_input(&build);
        let placed = pump_until(
            &mut server,
            &mut [&mut alice, &mut bob],
            Duration::from_secs(10),
            |server, _| grid_and_box_count(server.game_state()).1 == i + 1,
        );
        assert!(placed, "box {i} never landed on the server");
    }

    // Bob sees the whole row through snapshots.
    let observed = pump_until(
        &mut server,
        &mut [&mut alice, &mut bob],
        Duration::from_secs(10),
        |_, clients| grid_and_box_count(&clients[1].game.gs) == (1, 3),
    );
    assert!(observed, "observer never saw the built row");

    // Alice seats in the cockpit and holds rotation; Bob should observe
    // the grid spinning within a couple of snapshots.
    let mut seat = InputFrame::default();
    seat.seat_action = true;
    seat.hand_pos = V2::new(0.4, 0.0);
    alice.game.latch_input(&seat);

    let seated = pump_until(
        &mut server,
        &mut [&mut alice, &mut bob],
        Duration::from_secs(10),
        |server, _| {
            server
                .game_state()
                .arena
                .iter_kind(EntityKind::Box)
                .any(|(_, e)| {
                    e.box_kind == BoxKind::Cockpit && e.player_who_is_inside_of_me.is_some()
                })
        },
    );
    assert!(seated, "pilot never made it into the cockpit");

    // Hold the rotation key until the observer sees the ship spin.
    let observer_sees_spin = |gs: &GameState| {
        gs.arena.iter_kind(EntityKind::Grid).any(|(_, g)| {
            g.body
                .map(|b| gs.physics.body_angvel(b).abs() > 1e-4)
                .unwrap_or(false)
        })
    };
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut spinning = false;
    while Instant::now() < deadline && !spinning {
        let mut rotate = InputFrame::default();
        rotate.rotation = 1.0;
        alice.game.latch_input(&rotate);
        server.tick_once();
        alice.pump();
        bob.pump();
        spinning = observer_sees_spin(&bob.game.gs);
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(spinning, "observer never saw the grid rotate");

    // Go idle: stop advancing (and thus committing inputs), only apply
    // snapshots, until the server has passed both predicted ticks and the
    // two reconciled states sit on the same snapshot.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut aligned = false;
    while Instant::now() < deadline && !aligned {
        server.tick_once();
        alice.apply_incoming();
        bob.apply_incoming();
        let server_tick = server.game_state().tick;
        aligned = alice.game.gs.tick == bob.game.gs.tick
            && server_tick >= alice.game.gs.tick
            && server_tick >= bob.game.gs.tick;
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(aligned, "client states never settled on one snapshot");

    let (mut a, mut b) = (alice.game.gs, bob.game.gs);
    let mut buf_a = vec![0u8; MAX_SERVER_TO_CLIENT];
    let mut buf_b = vec![0u8; MAX_SERVER_TO_CLIENT];
    let len_a = encode_snapshot(&mut a, -1, &mut Vec::new(), &mut buf_a).unwrap();
    let len_b = encode_snapshot(&mut b, -1, &mut Vec::new(), &mut buf_b).unwrap();
    assert_eq!(&buf_a[..len_a], &buf_b[..len_b], "idle client states diverged");
}

/// Object-level reconciliation under 50% snapshot loss: the predicted
/// position must land within 0.1 world units of the authoritative one
/// shortly after snapshots resume.
#[test]
fn reconciliation_recovers_from_snapshot_loss() {
    let mut server_gs = GameState::new();
    server_gs.players[0].connected = true;

    let mut client = ClientGame::new();
    let mut latest_id_processed = 0u64;
    let mut snapshot_buf = vec![0u8; MAX_SERVER_TO_CLIENT];

    let mut deliver_snapshot = |server_gs: &mut GameState, client: &mut ClientGame| {
        let len = encode_snapshot(server_gs, 0, &mut Vec::new(), &mut snapshot_buf).unwrap();
        let decoded = decode_snapshot(&snapshot_buf[..len]).unwrap();
        client.on_snapshot(decoded, 0.05, 0.0);
    };

    // Initial sync, then run the client a few ticks ahead like the time
    // dilation controller would.
    server_gs.step(TIMESTEP);
    deliver_snapshot(&mut server_gs, &mut client);
    client.advance(TIMESTEP * 5.0);

    let mut input_buf = vec![0u8; MAX_CLIENT_TO_SERVER];
    for round in 0u64..240 {
        // Client thrusts the whole time.
        let mut thrust = InputFrame::default();
        thrust.movement = V2::new(1.0, 0.0);
        client.latch_input(&thrust);
        client.advance(TIMESTEP);

        // Inputs always arrive (input redundancy is the reliability
        // mechanism); snapshots do not.
        let mut msg = client.make_input_packet(Vec::new());
        let len = encode_client_to_server(&mut msg, &mut input_buf).unwrap();
        let decoded = decode_client_to_server(&input_buf[..len]).unwrap();
        for frame in &decoded.inputs {
            if frame.id <= latest_id_processed {
                continue;
            }
            latest_id_processed = latest_id_processed.max(frame.id);
            if frame.tick >= server_gs.tick {
                server_gs.input_buffers[0].merge(frame.clone());
            }
        }

        server_gs.step(TIMESTEP);

        let loss_window = (60..180).contains(&round);
        let dropped = loss_window && round % 2 == 0;
        if !dropped {
            deliver_snapshot(&mut server_gs, &mut client);
        }
    }

    // One second of quiet convergence after the loss window.
    for _ in 0..60 {
        client.advance(TIMESTEP);
        server_gs.step(TIMESTEP);
        deliver_snapshot(&mut server_gs, &mut client);
    }

    // Compare at the same tick: the predicted position must match the
    // authoritative one once the server catches up to the predicted tick.
    while server_gs.tick < client.gs.tick {
        server_gs.step(TIMESTEP);
    }
    let server_pos = server_gs
        .players[0]
        .entity
        .and_then(|id| server_gs.entity_pos(id))
        .expect("server player");
    let client_pos = client.my_player_pos().expect("client player");
    assert!(
        server_pos.distance(client_pos) < 0.1,
        "client {client_pos:?} never converged to server {server_pos:?}"
    );
}

/// Record a local session's committed inputs, replay them into a fresh
/// state, and confirm the end states encode byte-for-byte identically.
#[test]
fn recorded_inputs_replay_deterministically() {
    let dir = std::env::temp_dir().join(format!("stardrift-replay-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("inputs.rec");

    let ticks = 120u64;
    let mut recorded = ClientGame::new();
    recorded.my_slot = Some(0);
    recorded.gs.players[0].connected = true;
    recorded.record_inputs_to(std::fs::File::create(&path).unwrap());
    for round in 0..ticks {
        let mut raw = InputFrame::default();
        // Wander in a deterministic little spiral, build once on the way.
        raw.movement = V2::new((round as f64 * 0.1).cos(), (round as f64 * 0.1).sin());
        if round == 30 {
            raw.dobuild = true;
            raw.build_type = BoxKind::Medbay;
            raw.hand_pos = V2::new(0.5, 0.0);
        }
        recorded.latch_input(&raw);
        recorded.advance(TIMESTEP);
    }

    let mut replayed = ClientGame::new();
    replayed.my_slot = Some(0);
    replayed.gs.players[0].connected = true;
    replayed.replay_inputs_from(std::fs::File::open(&path).unwrap());
    for _ in 0..ticks {
        replayed.advance(TIMESTEP);
    }

    let mut buf_a = vec![0u8; MAX_SERVER_TO_CLIENT];
    let mut buf_b = vec![0u8; MAX_SERVER_TO_CLIENT];
    let len_a = encode_snapshot(&mut recorded.gs, -1, &mut Vec::new(), &mut buf_a).unwrap();
    let len_b = encode_snapshot(&mut replayed.gs, -1, &mut Vec::new(), &mut buf_b).unwrap();
    assert_eq!(
        &buf_a[..len_a],
        &buf_b[..len_b],
        "replayed session diverged from the recorded one"
    );

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn save_and_load_round_trip_preserves_the_encoding() {
    let mut gs = GameState::new();
    let grid = gs.create_grid(V2::new(2.0, 3.0), 0.5).unwrap();
    gs.create_box_on_grid(grid, BoxKind::Cockpit, V2::ZERO, 0)
        .unwrap();
    gs.create_box_on_grid(grid, BoxKind::Battery, V2::new(BOX_SIZE, 0.0), 1)
        .unwrap();
    gs.create_orb(V2::new(-3.0, 1.0)).unwrap();
    for _ in 0..10 {
        gs.step(TIMESTEP);
    }

    // The save file is exactly a spectator snapshot, uncompressed.
    let mut buf = vec![0u8; MAX_SERVER_TO_CLIENT];
    let len = encode_snapshot(&mut gs, -1, &mut Vec::new(), &mut buf).unwrap();
    let saved = buf[..len].to_vec();

    let dir = std::env::temp_dir().join(format!("stardrift-save-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("world.save");
    std::fs::write(&path, &saved).unwrap();

    let mut server = Server::new(ServerConfig {
        addr: "127.0.0.1:0".parse().unwrap(),
        save_path: Some(path.clone()),
    })
    .unwrap();

    // Load, step zero ticks, re-encode: byte identical.
    let mut reencoded = vec![0u8; MAX_SERVER_TO_CLIENT];
    let len2 = encode_snapshot(
        server.game_state_mut(),
        -1,
        &mut Vec::new(),
        &mut reencoded,
    )
    .unwrap();
    assert_eq!(saved, &reencoded[..len2]);

    let _ = std::fs::remove_dir_all(&dir);
}
