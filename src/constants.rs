//! Centralised simulation and protocol constants.
//!
//! Everything under "Protocol compatibility" must match on both ends of a
//! connection; the version gate in the codec rejects packets from builds
//! where any of them drifted.

// ── Protocol compatibility ────────────────────────────────────────────────

/// Bumped whenever any wire-visible layout or constant changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Seconds per simulation tick.
pub const TIMESTEP: f64 = 1.0 / 60.0;

/// Side length of one ship cell (world units).
pub const BOX_SIZE: f64 = 0.5;

/// Hard cap on live entities in the arena.
pub const MAX_ENTITIES: usize = 4096;

/// Server player slot count.
pub const MAX_PLAYERS: usize = 16;

/// Committed-input frames kept client side and retransmitted in every
/// client→server packet. About one second of history at 60 Hz.
pub const LOCAL_INPUT_QUEUE_MAX: usize = 64;

/// How far from a player's body the build/interact hand can reach.
pub const MAX_HAND_REACH: f64 = 1.0;

/// Voice capture sample rate (Hz). The codec payloads are opaque here, but
/// both ends must agree on the stream parameters.
pub const VOIP_SAMPLE_RATE: u32 = 24_000;
/// Samples per voice packet: 20 ms at [`VOIP_SAMPLE_RATE`].
pub const VOIP_EXPECTED_FRAME_COUNT: usize = 480;
/// Largest accepted encoded voice payload, in bytes.
pub const VOIP_PACKET_MAX_SIZE: usize = 4000;
/// Voice packets buffered per direction before the oldest is dropped.
pub const VOIP_PACKET_BUFFER_SIZE: usize = 10;

/// Longest accepted player display name on the wire, in bytes.
pub const MAX_PLAYER_NAME_LEN: usize = 32;

/// Scanner sweep pickup radius for nearby returns.
pub const SCANNER_RADIUS: f64 = 25.0;
/// Nearby returns kept per scanner.
pub const SCANNER_MAX_POINTS: usize = 32;
/// Platonic contacts tracked per scanner, at unlimited range.
pub const SCANNER_MAX_PLATONICS: usize = 3;

/// Launchers only fire at targets within this range.
pub const MISSILE_RANGE: f64 = 30.0;

/// Seconds an explosion lives.
pub const EXPLOSION_TIME: f64 = 0.5;

/// Entities farther than this from the origin are destroyed outright.
pub const INSTANT_DEATH_DISTANCE_FROM_CENTER: f64 = 2000.0;

/// Energy one battery box stores.
pub const BATTERY_CAPACITY: f64 = 1.0;

/// Snapshot budget after compression; also bounds decompression output.
pub const MAX_SERVER_TO_CLIENT: usize = 1024 * 1024;
/// Client→server packets are small: the input queue plus voice.
pub const MAX_CLIENT_TO_SERVER: usize = 1024 * 16;

// ── Gameplay tuning ───────────────────────────────────────────────────────

/// Mass of one hull cell; other box kinds share it.
pub const BOX_MASS: f64 = 1.0;
/// Player body mass.
pub const PLAYER_MASS: f64 = 0.5;
/// Player collision half-extent.
pub const PLAYER_HALF_SIZE: f64 = BOX_SIZE * 0.4;
/// Force applied for full movement input on an unseated player.
pub const PLAYER_MOVE_FORCE: f64 = 4.0;

/// Force of one thruster at full burn.
pub const THRUSTER_FORCE: f64 = 12.0;
/// Energy drawn by one thruster at full burn, per second.
pub const THRUSTER_ENERGY_PER_SECOND: f64 = 0.05;

/// Torque of one gyroscope at full deflection.
pub const GYROSCOPE_TORQUE: f64 = 4.0;
/// Energy drawn by a gyroscope while rotating, per second.
pub const GYROSCOPE_ENERGY_PER_SECOND: f64 = 0.02;
/// Passive gyroscope angular-velocity damping factor, per second.
pub const GYROSCOPE_PROPORTIONAL_DAMPING: f64 = 0.7;

/// Energy a solar panel in full sunlight feeds its grid, per second.
pub const SOLAR_ENERGY_PER_SECOND: f64 = 0.09;

/// Damage healed per second on a player inside a medbay.
pub const MEDBAY_HEAL_PER_SECOND: f64 = 0.1;

/// Energy drawn by an active cloaking device, per second.
pub const CLOAKING_ENERGY_PER_SECOND: f64 = 0.1;
/// Cloaking field radius around the device.
pub const CLOAKING_RADIUS: f64 = 4.0;
/// How fast `cloaking_power` approaches 1 with energy available, per second.
pub const CLOAKING_SPIN_UP_PER_SECOND: f64 = 0.5;

/// Missile construction charge gained per second at full energy.
pub const MISSILE_CHARGE_PER_SECOND: f64 = 0.25;
/// Energy drawn by a charging launcher, per second.
pub const MISSILE_LAUNCHER_ENERGY_PER_SECOND: f64 = 0.08;
/// Seconds of missile burn.
pub const MISSILE_BURN_TIME: f64 = 4.0;
/// Missile thrust while burning.
pub const MISSILE_THRUST: f64 = 6.0;
/// Missile body mass.
pub const MISSILE_MASS: f64 = 0.2;
/// Proximity at which a missile detonates against a foreign shape.
pub const MISSILE_CONTACT_DIST: f64 = BOX_SIZE * 0.6;
/// Seconds before an unspent missile detonates on its own.
pub const MISSILE_LIFETIME: f64 = 12.0;

/// Radius an explosion reaches at full progress.
pub const EXPLOSION_RADIUS: f64 = 1.4;
/// Damage applied per second to entities inside an explosion.
pub const EXPLOSION_DAMAGE_PER_SECOND: f64 = 2.5;
/// Impulse magnitude pushing entities out of an explosion.
pub const EXPLOSION_PUSH_STRENGTH: f64 = 5.0;

/// Scanner head revolutions per second.
pub const SCANNER_HEAD_TURNS_PER_SECOND: f64 = 0.5;
/// Energy drawn by a scanner, per second.
pub const SCANNER_ENERGY_PER_SECOND: f64 = 0.02;

/// Landing gear locks when a foreign shape is within this distance.
pub const LANDING_GEAR_LOCK_DIST: f64 = BOX_SIZE * 0.8;
/// ... and the relative speed is below this.
pub const LANDING_GEAR_MAX_LOCK_SPEED: f64 = 0.6;
/// Ticks after a release before the gear may lock again.
pub const LANDING_GEAR_REARM_TICKS: u64 = 60;

/// Merge boxes fuse grids when their faces are within this distance.
pub const MERGE_MAX_DIST: f64 = BOX_SIZE * 0.6;
/// ... and the grids' merge faces are aligned within this angle (radians).
pub const MERGE_ALIGN_EPSILON: f64 = 0.35;

/// Gravitational constant for sun attraction.
pub const SUN_GRAVITY_CONSTANT: f64 = 3.0;
/// Suns only pull on bodies within this many of their radii.
pub const SUN_GRAVITY_REACH_FACTOR: f64 = 40.0;
/// Damage ramp per second at the surface of a lethal sun.
pub const SUN_DAMAGE_PER_SECOND: f64 = 1.5;

/// Default sun parameters for a bootstrap world.
pub const DEFAULT_SUN_RADIUS: f64 = 10.0;
pub const DEFAULT_SUN_MASS: f64 = 100.0;

/// Orbs scattered into a bootstrap world.
pub const BOOTSTRAP_ORB_COUNT: usize = 40;
pub const ORB_RADIUS: f64 = BOX_SIZE * 0.3;
pub const ORB_MASS: f64 = 0.1;

/// Hand positions snap onto a grid when a box of it is within this range.
pub const BUILD_SNAP_DIST: f64 = BOX_SIZE * 0.75;

// ── Networking cadence ────────────────────────────────────────────────────

/// Default server UDP port.
pub const SERVER_PORT: u16 = 2551;

/// Seconds between client→server input packets; the whole committed queue
/// rides in each one, which is the only reliability mechanism.
pub const TIME_BETWEEN_INPUT_PACKETS: f64 = 0.05;

/// Seconds between periodic world saves when persistence is enabled.
pub const TIME_BETWEEN_WORLD_SAVE: f64 = 30.0;

/// Server accumulator clamp: never try to catch up more than this.
pub const MAX_ACCUMULATED_TIME: f64 = 5.0 * TIMESTEP;

/// Snapshots are sent every Nth simulated tick.
pub const SNAPSHOT_SUBSAMPLE: u64 = 1;

/// Handshake must complete within this many seconds.
pub const CONNECT_TIMEOUT: f64 = 5.0;
/// Peers silent for this long are dropped.
pub const IDLE_TIMEOUT: f64 = 10.0;
/// Seconds between transport-level pings for RTT estimation.
pub const PING_INTERVAL: f64 = 1.0;

/// Datagram payload bytes per fragment, headroom under a 1500 MTU.
pub const FRAGMENT_SIZE: usize = 1184;

// ── Prediction tuning ─────────────────────────────────────────────────────

/// Reconciliation replay budget per snapshot, in milliseconds.
pub const MAX_MS_SPENT_REPREDICTING: f64 = 30.0;

/// Snap (instead of dilating) when further behind the healthy lead than
/// this many ticks.
pub const TICKS_BEHIND_DO_SNAP: i64 = 9;

/// Weight of RTT variance when sizing the healthy prediction lead.
pub const CAUTIOUS_MULTIPLIER: f64 = 1.5;

/// Extra ticks of lead on top of the RTT-derived minimum.
pub const HEALTHY_MARGIN_TICKS: i64 = 6;
