//! Client binary.
//!
//! Headless by design: rendering and input devices live outside this
//! crate, so the live-input path latches nothing and the interesting modes
//! are hosting (`host=yes`), input recording, and deterministic replay.
//!
//! Arguments are `key=value` pairs:
//! - `host=yes`               run an in-process server thread
//! - `server=<addr>`          connect somewhere other than localhost
//! - `record_inputs_to=<p>`   append every committed frame to a file
//! - `replay_inputs_from=<p>` drive the session from a recorded file

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use stardrift::client::ClientGame;
use stardrift::constants::{SERVER_PORT, TIME_BETWEEN_INPUT_PACKETS};
use stardrift::server::{Server, ServerConfig};
use stardrift::transport::{ClientTransport, TransportEvent};
use stardrift::voice::VoiceQueue;
use stardrift::wire_format::{decode_snapshot, decompress_snapshot, encode_client_to_server};

struct Args {
    host: bool,
    server: Option<String>,
    record_inputs_to: Option<String>,
    replay_inputs_from: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        host: false,
        server: None,
        record_inputs_to: None,
        replay_inputs_from: None,
    };
    for arg in std::env::args().skip(1) {
        let Some((key, value)) = arg.split_once('=') else {
            return Err(format!("expected key=value, got `{arg}`"));
        };
        match key {
            "host" => args.host = value == "yes",
            "server" => args.server = Some(value.to_string()),
            "record_inputs_to" => args.record_inputs_to = Some(value.to_string()),
            "replay_inputs_from" => args.replay_inputs_from = Some(value.to_string()),
            other => return Err(format!("unknown argument `{other}`")),
        }
    }
    Ok(args)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(err) => {
            error!(%err, "bad command line");
            return ExitCode::FAILURE;
        }
    };

    // Optional in-process server, joined on the way out.
    let shutdown = Arc::new(AtomicBool::new(false));
    let host_thread = if args.host {
        let flag = Arc::clone(&shutdown);
        let config = ServerConfig {
            addr: SocketAddr::from(([127, 0, 0, 1], SERVER_PORT)),
            save_path: None,
        };
        let mut server = match Server::new(config) {
            Ok(server) => server,
            Err(err) => {
                error!(%err, "could not start the hosted server");
                return ExitCode::FAILURE;
            }
        };
        Some(std::thread::spawn(move || server.run(&flag)))
    } else {
        None
    };

    let server_addr: SocketAddr = {
        let text = args
            .server
            .unwrap_or_else(|| format!("127.0.0.1:{SERVER_PORT}"));
        match text.parse() {
            Ok(addr) => addr,
            Err(err) => {
                error!(%err, %text, "bad server address");
                return ExitCode::FAILURE;
            }
        }
    };

    let mut game = ClientGame::new();
    if let Some(path) = &args.record_inputs_to {
        match std::fs::File::create(path) {
            Ok(file) => game.record_inputs_to(file),
            Err(err) => {
                error!(%err, %path, "could not open input recording file");
                return ExitCode::FAILURE;
            }
        }
    }
    if let Some(path) = &args.replay_inputs_from {
        match std::fs::File::open(path) {
            Ok(file) => game.replay_inputs_from(file),
            Err(err) => {
                error!(%err, %path, "could not open input replay file");
                return ExitCode::FAILURE;
            }
        }
    }

    let exit = run_client(server_addr, &mut game);
    shutdown.store(true, Ordering::Relaxed);
    if let Some(thread) = host_thread {
        let _ = thread.join();
    }
    exit
}

fn run_client(server_addr: SocketAddr, game: &mut ClientGame) -> ExitCode {
    let mut transport = match ClientTransport::connect(server_addr) {
        Ok(transport) => transport,
        Err(err) => {
            error!(%err, "could not open a client socket");
            return ExitCode::FAILURE;
        }
    };
    info!(%server_addr, "connecting");

    // Voice capture/playback run on audio threads out of scope here; the
    // queues still exist so the packet plumbing is exercised end to end.
    let capture_queue = VoiceQueue::new();
    let playback_queue = VoiceQueue::new();

    let mut events = Vec::new();
    let mut last_frame = Instant::now();
    let mut last_input_send = Instant::now();
    let mut packet_buf = vec![0u8; stardrift::constants::MAX_CLIENT_TO_SERVER];

    loop {
        events.clear();
        transport.service(&mut events);
        for event in &events {
            match event {
                TransportEvent::Connected { slot } => {
                    info!(slot, "joined");
                }
                TransportEvent::Packet { data, .. } => {
                    let Some(raw) = decompress_snapshot(data) else {
                        continue; // transient: drop and move on
                    };
                    match decode_snapshot(&raw) {
                        Ok(snapshot) => {
                            for packet in &snapshot.voice {
                                playback_queue.push(packet.clone());
                            }
                            game.on_snapshot(snapshot, transport.rtt(), transport.rtt_variance());
                        }
                        Err(err) => warn!(%err, "snapshot dropped"),
                    }
                }
                TransportEvent::Disconnected { reason, .. } => {
                    error!(?reason, "disconnected from server");
                    return ExitCode::FAILURE;
                }
            }
        }

        let now = Instant::now();
        let wall_dt = now.duration_since(last_frame).as_secs_f64();
        last_frame = now;
        game.advance(wall_dt);

        if game.replay_finished {
            transport.disconnect();
            return if game.in_medbay() {
                info!("replay complete, parked in a medbay");
                ExitCode::SUCCESS
            } else {
                error!("replay ended away from a medbay");
                ExitCode::FAILURE
            };
        }

        if transport.is_connected()
            && last_input_send.elapsed().as_secs_f64() > TIME_BETWEEN_INPUT_PACKETS
        {
            last_input_send = Instant::now();
            let mut msg = game.make_input_packet(capture_queue.drain());
            match encode_client_to_server(&mut msg, &mut packet_buf) {
                Ok(len) => {
                    if let Err(err) = transport.send(&packet_buf[..len]) {
                        warn!(%err, "input packet send failed");
                    }
                }
                Err(err) => warn!(%err, "input packet failed to serialize"),
            }
        }

        std::thread::sleep(Duration::from_millis(2));
    }
}
