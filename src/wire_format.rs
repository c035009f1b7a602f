//! Wire format for network messages and the save file.
//!
//! Three top-level messages share the dual-mode codec in [`crate::ser`]:
//! input frames (also the replay-file record), client→server input packets,
//! and server→client snapshots. Every message starts with the protocol
//! version; a mismatch fails the whole decode and the packet is dropped.
//!
//! Snapshot decoding rebuilds the physics side as entities are visited and
//! then runs a fix-up pass that validates every stored entity reference,
//! so a hostile packet can never leave dangling ids in the arena.

use tracing::warn;

use crate::arena::EntityId;
use crate::components::{
    BoxKind, DetectedPlatonic, Entity, EntityKind, InputFrame, ScannerCategory, ScannerPoint,
    Squad,
};
use crate::constants::{
    BOX_MASS, BOX_SIZE, LOCAL_INPUT_QUEUE_MAX, MAX_ENTITIES, MAX_PLAYERS, MAX_PLAYER_NAME_LEN,
    MAX_SERVER_TO_CLIENT, MISSILE_MASS, ORB_MASS, ORB_RADIUS, PLAYER_HALF_SIZE, PLAYER_MASS,
    PROTOCOL_VERSION, SCANNER_MAX_PLATONICS, SCANNER_MAX_POINTS, VOIP_PACKET_BUFFER_SIZE,
    VOIP_PACKET_MAX_SIZE,
};
use crate::math::V2;
use crate::physics::BodyKind;
use crate::ser::{SerError, SerResult, SerState};
use crate::ser_check;
use crate::simulation::GameState;
use crate::voice::VoicePacket;

/// Everything a client sends: its whole committed input queue (newest
/// first) plus captured voice packets.
#[derive(Debug, Default)]
pub struct ClientToServer {
    pub inputs: Vec<InputFrame>,
    pub voice: Vec<VoicePacket>,
}

/// A decoded server→client snapshot.
pub struct DecodedSnapshot {
    /// Slot of the addressed player, -1 for a spectator/save file.
    pub your_player: i32,
    pub gs: GameState,
    pub voice: Vec<VoicePacket>,
}

// ── Shared field visitors ─────────────────────────────────────────────────

fn ser_version(s: &mut SerState) -> SerResult {
    let mut version = PROTOCOL_VERSION;
    s.u32(&mut version)?;
    ser_check!(version == PROTOCOL_VERSION);
    Ok(())
}

fn ser_squad(s: &mut SerState, squad: &mut Squad) -> SerResult {
    let mut tag = squad.to_u8();
    s.u8(&mut tag)?;
    let parsed = Squad::from_u8(tag);
    ser_check!(parsed.is_some());
    if let Some(parsed) = parsed {
        *squad = parsed;
    }
    Ok(())
}

/// One input frame. Fixed-size on purpose: replay files are a flat run of
/// these records.
pub fn ser_input_frame(s: &mut SerState, f: &mut InputFrame) -> SerResult {
    s.u64(&mut f.tick)?;
    s.u64(&mut f.id)?;
    s.v2(&mut f.movement)?;
    s.f64(&mut f.rotation)?;
    s.v2(&mut f.hand_pos)?;
    s.bool(&mut f.dobuild)?;
    let mut build_tag = f.build_type.to_u8();
    s.u8(&mut build_tag)?;
    let build_type = BoxKind::from_u8(build_tag);
    ser_check!(build_type.is_some());
    if let Some(build_type) = build_type {
        f.build_type = build_type;
    }
    s.u8(&mut f.build_rotation)?;
    ser_check!(f.build_rotation <= 3);
    s.bool(&mut f.seat_action)?;
    s.bool(&mut f.interact_action)?;
    s.opt_entity_id(&mut f.invite_this_player)?;
    s.bool(&mut f.accept_squad_invite)?;
    s.bool(&mut f.reject_squad_invite)?;
    s.i8(&mut f.take_over_squad)?;
    ser_check!(f.take_over_squad >= -1 && (f.take_over_squad as i64) < Squad::COUNT as i64);
    Ok(())
}

/// Byte length of one serialized input frame record.
pub fn serialized_input_frame_len() -> usize {
    let mut buf = [0u8; 256];
    let mut s = SerState::writing(&mut buf);
    let mut frame = InputFrame::default();
    match ser_input_frame(&mut s, &mut frame) {
        Ok(()) => s.size(),
        Err(_) => 0,
    }
}

fn ser_voice_queue(s: &mut SerState, packets: &mut Vec<VoicePacket>) -> SerResult {
    let mut count = packets.len() as u32;
    s.u32(&mut count)?;
    ser_check!(count as usize <= VOIP_PACKET_BUFFER_SIZE);
    if s.is_writing() {
        for packet in packets.iter_mut() {
            s.bytes(&mut packet.data, VOIP_PACKET_MAX_SIZE)?;
        }
    } else {
        packets.clear();
        for _ in 0..count {
            let mut packet = VoicePacket::default();
            s.bytes(&mut packet.data, VOIP_PACKET_MAX_SIZE)?;
            packets.push(packet);
        }
    }
    Ok(())
}

// ── ClientToServer ────────────────────────────────────────────────────────

pub fn ser_client_to_server(s: &mut SerState, msg: &mut ClientToServer) -> SerResult {
    ser_version(s)?;
    let mut count = msg.inputs.len() as u32;
    s.u32(&mut count)?;
    ser_check!(count as usize <= LOCAL_INPUT_QUEUE_MAX);
    if s.is_writing() {
        for frame in msg.inputs.iter_mut() {
            ser_input_frame(s, frame)?;
        }
    } else {
        msg.inputs.clear();
        for _ in 0..count {
            let mut frame = InputFrame::default();
            ser_input_frame(s, &mut frame)?;
            msg.inputs.push(frame);
        }
    }
    ser_voice_queue(s, &mut msg.voice)
}

pub fn encode_client_to_server(msg: &mut ClientToServer, buf: &mut [u8]) -> Result<usize, SerError> {
    let mut s = SerState::writing(buf);
    ser_client_to_server(&mut s, msg)?;
    Ok(s.size())
}

pub fn decode_client_to_server(bytes: &[u8]) -> Result<ClientToServer, SerError> {
    let mut s = SerState::reading(bytes);
    let mut msg = ClientToServer::default();
    ser_client_to_server(&mut s, &mut msg)?;
    Ok(msg)
}

// ── Input frame records (replay files) ────────────────────────────────────

pub fn encode_input_frame(frame: &InputFrame, buf: &mut [u8]) -> Result<usize, SerError> {
    let mut s = SerState::writing(buf);
    let mut copy = frame.clone();
    ser_input_frame(&mut s, &mut copy)?;
    Ok(s.size())
}

pub fn decode_input_frame(bytes: &[u8]) -> Result<InputFrame, SerError> {
    let mut s = SerState::reading(bytes);
    let mut frame = InputFrame::default();
    ser_input_frame(&mut s, &mut frame)?;
    Ok(frame)
}

// ── ServerToClient snapshot ───────────────────────────────────────────────

/// Visit one entity. `write_id` carries the id when writing; when reading,
/// the id comes off the wire and the entity is materialized in the arena
/// (including its physics body) as its fields arrive.
fn ser_entity(s: &mut SerState, gs: &mut GameState, write_id: Option<EntityId>) -> SerResult {
    let (mut id, mut kind_tag) = match write_id {
        Some(id) => {
            let kind = gs.arena.get(id).map(|e| e.kind);
            ser_check!(kind.is_some());
            (id, kind.map(EntityKind::to_u8).unwrap_or(0))
        }
        None => (EntityId::default(), 0),
    };
    s.entity_id(&mut id)?;
    s.u8(&mut kind_tag)?;
    let kind = EntityKind::from_u8(kind_tag);
    ser_check!(kind.is_some());
    let Some(kind) = kind else {
        return Ok(()); // unreachable past the check
    };
    if !s.is_writing() {
        ser_check!(gs.arena.restore(id, Entity::new(kind)));
    }

    // Common fields.
    {
        let entity = gs.arena.get_mut(id);
        ser_check!(entity.is_some());
        if let Some(entity) = entity {
            ser_squad(s, &mut entity.squad)?;
            s.f64(&mut entity.damage)?;
            ser_check!(entity.damage.is_finite());
        }
    }

    match kind {
        EntityKind::Grid | EntityKind::Player | EntityKind::Missile | EntityKind::Orb => {
            ser_bodied_entity(s, gs, id, kind)?;
        }
        EntityKind::Box => {
            ser_box_entity(s, gs, id)?;
        }
        EntityKind::Sun => {
            if let Some(e) = gs.arena.get_mut(id) {
                s.v2(&mut e.pos)?;
                s.f64(&mut e.sun_radius)?;
                s.f64(&mut e.sun_mass)?;
                s.bool(&mut e.sun_is_safe)?;
                ser_check!(e.sun_radius.is_finite() && e.sun_radius >= 0.0);
            }
        }
        EntityKind::Explosion => {
            if let Some(e) = gs.arena.get_mut(id) {
                s.v2(&mut e.pos)?;
                s.v2(&mut e.vel)?;
                s.f64(&mut e.explosion_progress)?;
                s.f64(&mut e.explosion_radius)?;
            }
        }
    }
    Ok(())
}

/// Pose and velocity ride the wire for every body-backed kind; reading
/// recreates the body (and for non-grids, the shape) immediately.
fn ser_bodied_entity(
    s: &mut SerState,
    gs: &mut GameState,
    id: EntityId,
    kind: EntityKind,
) -> SerResult {
    let body = gs.arena.get(id).and_then(|e| e.body);
    if s.is_writing() {
        ser_check!(body.is_some());
    }
    let (mut pos, mut rot, mut vel, mut angvel) = match body {
        Some(b) if s.is_writing() => (
            gs.physics.body_position(b),
            gs.physics.body_rotation(b),
            gs.physics.body_linvel(b),
            gs.physics.body_angvel(b),
        ),
        _ => (V2::ZERO, 0.0, V2::ZERO, 0.0),
    };
    s.v2(&mut pos)?;
    s.f64(&mut rot)?;
    s.v2(&mut vel)?;
    s.f64(&mut angvel)?;
    ser_check!(pos.x.is_finite() && pos.y.is_finite() && rot.is_finite());

    // Kind-specific trailing fields.
    match kind {
        EntityKind::Player => {
            if let Some(e) = gs.arena.get_mut(id) {
                s.opt_entity_id(&mut e.currently_inside_of_box)?;
                ser_squad(s, &mut e.squad_invited_to)?;
                s.u16(&mut e.unlocked_boxes)?;
                ser_input_frame(s, &mut e.input)?;
                s.str(&mut e.name, MAX_PLAYER_NAME_LEN)?;
            }
        }
        EntityKind::Missile => {
            if let Some(e) = gs.arena.get_mut(id) {
                s.f64(&mut e.burn_remaining)?;
            }
        }
        _ => {}
    }

    if !s.is_writing() {
        let (mass, moment, half) = match kind {
            EntityKind::Player => (
                PLAYER_MASS,
                PLAYER_MASS * PLAYER_HALF_SIZE * PLAYER_HALF_SIZE,
                Some(V2::new(PLAYER_HALF_SIZE, PLAYER_HALF_SIZE)),
            ),
            EntityKind::Missile => (
                MISSILE_MASS,
                MISSILE_MASS * BOX_SIZE * BOX_SIZE / 24.0,
                Some(V2::new(BOX_SIZE / 4.0, BOX_SIZE / 8.0)),
            ),
            EntityKind::Orb => (
                ORB_MASS,
                ORB_MASS * ORB_RADIUS * ORB_RADIUS,
                Some(V2::new(ORB_RADIUS, ORB_RADIUS)),
            ),
            // Grid mass is recomputed from its boxes in the fix-up pass;
            // this placeholder only matters for a (transient) empty hull.
            _ => (BOX_MASS, BOX_MASS * BOX_SIZE * BOX_SIZE / 6.0, None),
        };
        let handle = gs.physics.create_body(
            BodyKind::Dynamic,
            pos,
            rot,
            mass,
            moment,
            id.to_user_data(),
        );
        gs.physics.set_body_linvel(handle, vel);
        gs.physics.set_body_angvel(handle, angvel);
        let shape = half.map(|half| {
            gs.physics
                .attach_box_shape(handle, half, V2::ZERO, 0.0, id.to_user_data())
        });
        if let Some(e) = gs.arena.get_mut(id) {
            e.body = Some(handle);
            e.shape = shape;
        }
    }
    Ok(())
}

fn ser_box_entity(s: &mut SerState, gs: &mut GameState, id: EntityId) -> SerResult {
    let mut parent = gs
        .arena
        .get(id)
        .and_then(|e| e.parent_grid)
        .unwrap_or_default();
    if s.is_writing() {
        ser_check!(parent != EntityId::default());
    }
    s.entity_id(&mut parent)?;

    // The parent grid rides earlier in the table, so it must exist by now.
    let parent_body = gs
        .arena
        .get(parent)
        .filter(|g| g.kind == EntityKind::Grid)
        .and_then(|g| g.body);
    ser_check!(parent_body.is_some());

    if let Some(e) = gs.arena.get_mut(id) {
        s.v2(&mut e.local_pos)?;
        s.u8(&mut e.compass_rotation)?;
        ser_check!(e.compass_rotation <= 3);
        let mut box_tag = e.box_kind.to_u8();
        s.u8(&mut box_tag)?;
        let parsed = BoxKind::from_u8(box_tag);
        ser_check!(parsed.is_some());
        if let Some(parsed) = parsed {
            e.box_kind = parsed;
        }
        s.f64(&mut e.energy_used)?;
        s.f64(&mut e.thrust)?;
        s.f64(&mut e.sun_amount)?;
        s.f64(&mut e.cloaking_power)?;
        s.f64(&mut e.scanner_head_rotate)?;
        s.f64(&mut e.missile_construction_charge)?;
        s.opt_entity_id(&mut e.player_who_is_inside_of_me)?;
        s.bool(&mut e.indestructible)?;
        s.bool(&mut e.is_platonic)?;
        s.u64(&mut e.landing_rearm_tick)?;

        let mut points = e.scanner_points.len() as u32;
        s.u32(&mut points)?;
        ser_check!(points as usize <= SCANNER_MAX_POINTS);
        if !s.is_writing() {
            e.scanner_points = vec![ScannerPoint::default(); points as usize];
        }
        for point in e.scanner_points.iter_mut() {
            s.v2(&mut point.relative_pos)?;
            let mut tag = point.category.to_u8();
            s.u8(&mut tag)?;
            let parsed = ScannerCategory::from_u8(tag);
            ser_check!(parsed.is_some());
            if let Some(parsed) = parsed {
                point.category = parsed;
            }
        }

        let mut platonics = e.detected_platonics.len() as u32;
        s.u32(&mut platonics)?;
        ser_check!(platonics as usize <= SCANNER_MAX_PLATONICS);
        if !s.is_writing() {
            e.detected_platonics = vec![DetectedPlatonic::default(); platonics as usize];
        }
        for detected in e.detected_platonics.iter_mut() {
            s.v2(&mut detected.direction)?;
            s.f64(&mut detected.intensity)?;
        }
    }

    if !s.is_writing() {
        let (local_pos, parent_body) = match (gs.arena.get(id), parent_body) {
            (Some(e), Some(b)) => (e.local_pos, b),
            _ => return Ok(()),
        };
        let shape = gs.physics.attach_box_shape(
            parent_body,
            V2::new(BOX_SIZE / 2.0, BOX_SIZE / 2.0),
            local_pos,
            0.0,
            id.to_user_data(),
        );
        if let Some(e) = gs.arena.get_mut(id) {
            e.parent_grid = Some(parent);
            e.shape = Some(shape);
        }
        if let Some(grid) = gs.arena.get_mut(parent) {
            grid.boxes.push(id);
        }
    }
    Ok(())
}

/// The full snapshot body: version, addressed slot, tick, slot table,
/// entity table, voice queue.
pub fn ser_server_to_client(
    s: &mut SerState,
    your_player: &mut i32,
    gs: &mut GameState,
    voice: &mut Vec<VoicePacket>,
) -> SerResult {
    ser_version(s)?;
    s.i32(your_player)?;
    ser_check!(*your_player >= -1 && (*your_player as i64) < MAX_PLAYERS as i64);
    s.u64(&mut gs.tick)?;

    for slot in 0..MAX_PLAYERS {
        let mut respawn_squad = gs.respawn_squads[slot];
        {
            let ps = &mut gs.players[slot];
            s.bool(&mut ps.connected)?;
            s.opt_entity_id(&mut ps.entity)?;
            s.bool(&mut ps.build_failed)?;
        }
        ser_squad(s, &mut respawn_squad)?;
        gs.respawn_squads[slot] = respawn_squad;
    }

    let mut count = gs.arena.live_count() as u32;
    s.u32(&mut count)?;
    ser_check!(count as usize <= MAX_ENTITIES);

    if s.is_writing() {
        // Grids go first so box rows can attach to their parent body;
        // each grid's boxes follow in membership order so the lists
        // rebuild exactly.
        let grids = gs.arena.ids_of_kind(EntityKind::Grid);
        for grid_id in &grids {
            ser_entity(s, gs, Some(*grid_id))?;
        }
        for grid_id in &grids {
            let boxes = gs.arena.get(*grid_id).map(|g| g.boxes.clone());
            ser_check!(boxes.is_some());
            for box_id in boxes.unwrap_or_default() {
                ser_entity(s, gs, Some(box_id))?;
            }
        }
        let rest: Vec<EntityId> = gs
            .arena
            .iter()
            .filter(|(_, e)| !matches!(e.kind, EntityKind::Grid | EntityKind::Box))
            .map(|(id, _)| id)
            .collect();
        for id in rest {
            ser_entity(s, gs, Some(id))?;
        }
    } else {
        for _ in 0..count {
            ser_entity(s, gs, None)?;
        }
        fixup_references(gs)?;
    }

    ser_voice_queue(s, voice)
}

/// Reference resolution after all entities are read: every stored id must
/// point at a live entity of the right kind, seat references must be
/// mutual, and derived state (free list, grid masses) is rebuilt.
fn fixup_references(gs: &mut GameState) -> SerResult {
    gs.arena.rebuild_free_list();

    for slot in 0..MAX_PLAYERS {
        if let Some(id) = gs.players[slot].entity {
            let live_player = gs
                .arena
                .get(id)
                .is_some_and(|e| e.kind == EntityKind::Player);
            ser_check!(live_player);
        }
    }

    let ids = gs.arena.ids();
    for id in ids {
        let Some(e) = gs.arena.get(id) else { continue };
        match e.kind {
            EntityKind::Player => {
                if let Some(seat_id) = e.currently_inside_of_box {
                    let mutual = gs
                        .arena
                        .get(seat_id)
                        .is_some_and(|seat| {
                            seat.kind == EntityKind::Box
                                && seat.player_who_is_inside_of_me == Some(id)
                        });
                    ser_check!(mutual);
                }
            }
            EntityKind::Box => {
                if let Some(player_id) = e.player_who_is_inside_of_me {
                    let mutual = gs
                        .arena
                        .get(player_id)
                        .is_some_and(|p| {
                            p.kind == EntityKind::Player
                                && p.currently_inside_of_box == Some(id)
                        });
                    ser_check!(mutual);
                }
            }
            _ => {}
        }
    }

    for grid_id in gs.arena.ids_of_kind(EntityKind::Grid) {
        gs.recalc_grid_mass(grid_id);
    }

    // Seated players ride inside their hull without contacts.
    for id in gs.arena.ids_of_kind(EntityKind::Player) {
        let seated_shape = gs
            .arena
            .get(id)
            .filter(|e| e.currently_inside_of_box.is_some())
            .and_then(|e| e.shape);
        if let Some(shape) = seated_shape {
            gs.physics.set_shape_sensor(shape, true);
        }
    }
    Ok(())
}

pub fn encode_snapshot(
    gs: &mut GameState,
    your_player: i32,
    voice: &mut Vec<VoicePacket>,
    buf: &mut [u8],
) -> Result<usize, SerError> {
    let mut s = SerState::writing(buf);
    let mut your_player = your_player;
    ser_server_to_client(&mut s, &mut your_player, gs, voice)?;
    Ok(s.size())
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<DecodedSnapshot, SerError> {
    let mut s = SerState::reading(bytes);
    let mut gs = GameState::new();
    let mut your_player = -1;
    let mut voice = Vec::new();
    ser_server_to_client(&mut s, &mut your_player, &mut gs, &mut voice)?;
    Ok(DecodedSnapshot {
        your_player,
        gs,
        voice,
    })
}

// ── Compression ───────────────────────────────────────────────────────────

/// Compress an encoded snapshot for the wire (size-prepended LZ4 block).
pub fn compress_snapshot(raw: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(raw)
}

/// Decompress a snapshot into a bounded buffer. Returns `None` (and logs)
/// on malformed data or anything claiming to exceed the snapshot budget.
pub fn decompress_snapshot(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < 4 {
        return None;
    }
    let claimed = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if claimed > MAX_SERVER_TO_CLIENT {
        warn!(claimed, "snapshot claims to exceed the decompression budget");
        return None;
    }
    match lz4_flex::decompress_size_prepended(data) {
        Ok(raw) => Some(raw),
        Err(err) => {
            warn!(%err, "snapshot decompression failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TIMESTEP;
    use crate::simulation::GameState;

    fn sample_state() -> GameState {
        let mut gs = GameState::new();
        gs.players[0].connected = true;
        gs.create_player_body(0).unwrap();
        let grid = gs.create_grid(V2::new(3.0, 1.0), 0.3).unwrap();
        gs.create_box_on_grid(grid, BoxKind::Cockpit, V2::ZERO, 0)
            .unwrap();
        gs.create_box_on_grid(grid, BoxKind::Thruster, V2::new(BOX_SIZE, 0.0), 2)
            .unwrap();
        gs.create_orb(V2::new(-4.0, 2.0)).unwrap();
        for _ in 0..3 {
            gs.step(TIMESTEP);
        }
        gs
    }

    fn encode(gs: &mut GameState) -> Vec<u8> {
        let mut buf = vec![0u8; MAX_SERVER_TO_CLIENT];
        let mut voice = Vec::new();
        let len = encode_snapshot(gs, 0, &mut voice, &mut buf).unwrap();
        buf.truncate(len);
        buf
    }

    #[test]
    fn input_frame_record_is_fixed_size() {
        let len = serialized_input_frame_len();
        assert!(len > 0);

        let mut full = InputFrame::default();
        full.invite_this_player = Some(EntityId {
            index: 5,
            generation: 2,
        });
        full.dobuild = true;
        let mut buf = [0u8; 256];
        let written = encode_input_frame(&full, &mut buf).unwrap();
        assert_eq!(written, len);
        let decoded = decode_input_frame(&buf[..written]).unwrap();
        assert_eq!(decoded, full);
    }

    #[test]
    fn client_to_server_round_trip() {
        let mut msg = ClientToServer::default();
        for i in 0..5u64 {
            msg.inputs.push(InputFrame {
                tick: 10 - i,
                id: 20 - i,
                movement: V2::new(1.0, 0.0),
                ..InputFrame::default()
            });
        }
        msg.voice.push(VoicePacket::new(vec![1, 2, 3]));

        let mut buf = [0u8; 4096];
        let len = encode_client_to_server(&mut msg, &mut buf).unwrap();
        let decoded = decode_client_to_server(&buf[..len]).unwrap();
        assert_eq!(decoded.inputs.len(), 5);
        assert_eq!(decoded.inputs[0].tick, 10);
        assert_eq!(decoded.voice.len(), 1);
        assert_eq!(decoded.voice[0].data, vec![1, 2, 3]);
    }

    #[test]
    fn snapshot_round_trip_is_stable() {
        let mut gs = sample_state();
        let first = encode(&mut gs);
        let mut decoded = decode_snapshot(&first).unwrap();
        let second = encode(&mut decoded.gs);
        assert_eq!(first, second, "decode then re-encode must be identical");
    }

    #[test]
    fn snapshot_stepping_stays_in_sync() {
        let mut gs = sample_state();
        let bytes = encode(&mut gs);
        let mut decoded = decode_snapshot(&bytes).unwrap();

        gs.step(TIMESTEP);
        decoded.gs.step(TIMESTEP);
        assert_eq!(encode(&mut gs), encode(&mut decoded.gs));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut gs = sample_state();
        let mut bytes = encode(&mut gs);
        bytes[0] ^= 0xff;
        assert!(decode_snapshot(&bytes).is_err());
    }

    #[test]
    fn truncated_snapshot_is_rejected() {
        let mut gs = sample_state();
        let bytes = encode(&mut gs);
        assert!(decode_snapshot(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn dangling_seat_reference_is_rejected() {
        let mut gs = sample_state();
        // Fabricate a one-sided seat reference.
        let player = gs.players[0].entity.unwrap();
        let boxes = gs.arena.ids_of_kind(EntityKind::Box);
        gs.arena.get_mut(player).unwrap().currently_inside_of_box = Some(boxes[0]);
        let bytes = encode(&mut gs);
        assert!(decode_snapshot(&bytes).is_err());
    }

    #[test]
    fn compression_round_trip_and_bound() {
        let mut gs = sample_state();
        let raw = encode(&mut gs);
        let compressed = compress_snapshot(&raw);
        assert_eq!(decompress_snapshot(&compressed), Some(raw));

        // A packet claiming an absurd size is refused outright.
        let mut huge = compressed.clone();
        huge[..4].copy_from_slice(&(u32::MAX).to_le_bytes());
        assert_eq!(decompress_snapshot(&huge), None);
    }

    #[test]
    fn voice_packets_ride_the_snapshot() {
        let mut gs = sample_state();
        let mut voice = vec![VoicePacket::new(vec![9; 10])];
        let mut buf = vec![0u8; MAX_SERVER_TO_CLIENT];
        let len = encode_snapshot(&mut gs, 0, &mut voice, &mut buf).unwrap();
        let decoded = decode_snapshot(&buf[..len]).unwrap();
        assert_eq!(decoded.voice, voice);
    }
}
