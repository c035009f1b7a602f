//! Stardrift: cooperative multiplayer space-flight simulation.
//!
//! Players build, pilot, and fight with modular grid ships. The server owns
//! the truth: a fixed-timestep deterministic simulation stepped at 60 Hz.
//! Clients predict locally from a committed-input queue and reconcile
//! against authoritative snapshots received over a lossy datagram transport.
//!
//! Module map:
//! - [`math`], [`physics`]: geometry primitives and the rigid-body facade
//! - [`arena`], [`components`]: generational entity storage and entity data
//! - [`simulation`]: `GameState` and the ordered per-tick step function
//! - [`ser`], [`wire_format`]: the dual-mode binary codec and messages
//! - [`transport`]: connection-oriented unreliable datagrams over UDP
//! - [`client`], [`server`]: prediction/reconciliation and the server loop
//! - [`voice`]: bounded queues for opaque voice payloads

pub mod arena;
pub mod client;
pub mod components;
pub mod constants;
pub mod math;
pub mod physics;
pub mod ser;
pub mod server;
pub mod simulation;
pub mod transport;
pub mod voice;
pub mod wire_format;

/// Simulation assertion: fatal in debug builds, logged and skipped in
/// release so a live server degrades instead of dying mid-match.
#[macro_export]
macro_rules! sim_assert {
    ($cond:expr) => {
        if !$cond {
            if cfg!(debug_assertions) {
                panic!("simulation assertion failed: {}", stringify!($cond));
            } else {
                tracing::error!("simulation assertion failed: {}", stringify!($cond));
            }
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            if cfg!(debug_assertions) {
                panic!($($arg)+);
            } else {
                tracing::error!($($arg)+);
            }
        }
    };
}
