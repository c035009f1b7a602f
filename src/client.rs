//! Client-side prediction and reconciliation.
//!
//! The client runs the same [`GameState::step`] as the server, ahead of it
//! by a few ticks. Raw input is latched into a pending frame; whenever the
//! accumulated (dilated) wall time crosses a timestep, the frame is
//! committed with the next tick number, queued for redundant
//! retransmission, fed to the local step, and reset. Authoritative
//! snapshots replace the local state wholesale, after which every queued
//! input newer than the snapshot is replayed. A small controller nudges the
//! local clock by ±10% (or snaps outright) to hold a healthy lead over the
//! server.

use std::fs::File;
use std::io::{Read, Write};
use std::time::Instant;

use tracing::{info, warn};

use crate::components::{BoxKind, InputFrame, InputQueue};
use crate::constants::{
    CAUTIOUS_MULTIPLIER, HEALTHY_MARGIN_TICKS, LOCAL_INPUT_QUEUE_MAX, MAX_MS_SPENT_REPREDICTING,
    TICKS_BEHIND_DO_SNAP, TIMESTEP,
};
use crate::simulation::GameState;
use crate::voice::VoicePacket;
use crate::wire_format::{
    encode_input_frame, serialized_input_frame_len, ClientToServer, DecodedSnapshot,
};

/// How many ticks the client should run ahead of the last snapshot so its
/// inputs arrive at the server just in time.
pub fn healthy_ticks_ahead(rtt: f64, rtt_variance: f64) -> i64 {
    ((rtt + rtt_variance * CAUTIOUS_MULTIPLIER) / TIMESTEP).ceil() as i64 + HEALTHY_MARGIN_TICKS
}

/// Local-clock controller: compares the observed lead over the server with
/// the healthy lead and outputs a dilation factor, or a snap when the gap
/// is beyond dilating away.
#[derive(Debug, Clone)]
pub struct TimeDilation {
    pub factor: f64,
}

impl Default for TimeDilation {
    fn default() -> Self {
        Self { factor: 1.0 }
    }
}

impl TimeDilation {
    /// Returns `Some(ticks)` when the client should snap forward by
    /// stepping that many ticks instead of easing.
    pub fn update(&mut self, ticks_ahead: i64, healthy: i64) -> Option<i64> {
        if ticks_ahead < healthy - 1 {
            self.factor = 1.1;
        } else if ticks_ahead > healthy + 1 {
            self.factor = 0.9;
        } else {
            self.factor = 1.0;
        }
        if healthy >= TICKS_BEHIND_DO_SNAP && ticks_ahead < healthy - TICKS_BEHIND_DO_SNAP {
            Some(healthy)
        } else {
            None
        }
    }
}

/// The predicted world plus everything needed to keep it honest.
pub struct ClientGame {
    pub gs: GameState,
    /// Our slot, once the first snapshot told us.
    pub my_slot: Option<usize>,
    pub dilation: TimeDilation,
    /// True once a replay file ran dry.
    pub replay_finished: bool,
    cur_input_frame: InputFrame,
    input_queue: InputQueue,
    last_committed_tick: u64,
    next_input_id: u64,
    time_to_process: f64,
    last_applied_server_tick: u64,
    record_to: Option<File>,
    replay_from: Option<File>,
}

impl Default for ClientGame {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientGame {
    pub fn new() -> Self {
        Self {
            gs: GameState::new(),
            my_slot: None,
            dilation: TimeDilation::default(),
            replay_finished: false,
            cur_input_frame: InputFrame::default(),
            input_queue: InputQueue::new(),
            last_committed_tick: 0,
            next_input_id: 0,
            time_to_process: 0.0,
            last_applied_server_tick: 0,
            record_to: None,
            replay_from: None,
        }
    }

    /// Record every committed frame to `file` as fixed-size records.
    pub fn record_inputs_to(&mut self, file: File) {
        self.record_to = Some(file);
    }

    /// Commit frames from `file` instead of live input.
    pub fn replay_inputs_from(&mut self, file: File) {
        self.replay_from = Some(file);
    }

    /// Fold one frame of raw input into the pending frame. Level fields
    /// overwrite; edge-triggered actions latch until the next commit.
    pub fn latch_input(&mut self, raw: &InputFrame) {
        let pending = &mut self.cur_input_frame;
        pending.movement = raw.movement;
        pending.rotation = raw.rotation;
        pending.hand_pos = raw.hand_pos;
        if raw.dobuild {
            pending.dobuild = true;
            pending.build_type = raw.build_type;
            pending.build_rotation = raw.build_rotation;
        }
        pending.seat_action |= raw.seat_action;
        pending.interact_action |= raw.interact_action;
        if raw.invite_this_player.is_some() {
            pending.invite_this_player = raw.invite_this_player;
        }
        pending.accept_squad_invite |= raw.accept_squad_invite;
        pending.reject_squad_invite |= raw.reject_squad_invite;
        if raw.take_over_squad >= 0 {
            pending.take_over_squad = raw.take_over_squad;
        }
    }

    /// Advance the dilated local clock and step the predicted world.
    pub fn advance(&mut self, wall_dt: f64) {
        self.time_to_process += wall_dt * self.dilation.factor;
        while self.time_to_process >= TIMESTEP {
            self.commit_pending_inputs();
            self.gs.step(TIMESTEP);
            self.time_to_process -= TIMESTEP;
        }
    }

    /// Commit one frame per tick until the committed sequence catches the
    /// current simulation tick; each commit lands in the retransmission
    /// queue and in the local step's input buffer.
    fn commit_pending_inputs(&mut self) {
        while self.gs.tick > self.last_committed_tick {
            if self.replay_from.is_some() {
                if !self.read_replay_frame() {
                    self.replay_finished = true;
                    return;
                }
            } else {
                // A long stall must not make us commit an unbounded run of
                // stale ticks; skip ahead so the queue stays meaningful.
                if self.gs.tick - self.last_committed_tick > LOCAL_INPUT_QUEUE_MAX as u64 {
                    self.last_committed_tick = self.gs.tick - LOCAL_INPUT_QUEUE_MAX as u64;
                }
                self.next_input_id += 1;
                self.cur_input_frame.tick = self.last_committed_tick + 1;
                self.cur_input_frame.id = self.next_input_id;
            }
            self.last_committed_tick = self.cur_input_frame.tick;

            if let Some(file) = &mut self.record_to {
                let mut buf = [0u8; 256];
                match encode_input_frame(&self.cur_input_frame, &mut buf) {
                    Ok(len) => {
                        if let Err(err) = file.write_all(&buf[..len]) {
                            warn!(%err, "input recording failed, disabling");
                            self.record_to = None;
                        }
                    }
                    Err(err) => warn!(%err, "could not encode input frame for recording"),
                }
            }

            self.input_queue.push(self.cur_input_frame.clone());
            if let Some(slot) = self.my_slot {
                self.gs.input_buffers[slot].merge(self.cur_input_frame.clone());
            }

            self.cur_input_frame = InputFrame::default();
        }
    }

    /// Pull the next fixed-size frame record off the replay file.
    fn read_replay_frame(&mut self) -> bool {
        let len = serialized_input_frame_len();
        let mut buf = vec![0u8; len];
        let Some(file) = &mut self.replay_from else {
            return false;
        };
        match file.read_exact(&mut buf) {
            Ok(()) => match crate::wire_format::decode_input_frame(&buf) {
                Ok(frame) => {
                    self.cur_input_frame = frame;
                    true
                }
                Err(err) => {
                    warn!(%err, "corrupt replay record, stopping replay");
                    false
                }
            },
            Err(_) => false, // end of recording
        }
    }

    /// Apply an authoritative snapshot, then replay newer queued inputs.
    pub fn on_snapshot(&mut self, snapshot: DecodedSnapshot, rtt: f64, rtt_variance: f64) {
        if snapshot.gs.tick <= self.last_applied_server_tick {
            return; // stale or duplicate: snapshots are idempotent
        }
        let predicted_to_tick = self.gs.tick;
        self.last_applied_server_tick = snapshot.gs.tick;
        self.my_slot = (snapshot.your_player >= 0).then_some(snapshot.your_player as usize);
        self.gs = snapshot.gs;

        let server_tick = self.gs.tick;
        let ticks_should_repredict = predicted_to_tick as i64 - server_tick as i64;
        let healthy = healthy_ticks_ahead(rtt, rtt_variance);
        let snap = self.dilation.update(ticks_should_repredict, healthy);
        let mut ticks_to_repredict = match snap {
            Some(target) => {
                info!(
                    behind = healthy - ticks_should_repredict,
                    "snapping the local clock forward"
                );
                self.time_to_process = 0.0;
                target
            }
            None => ticks_should_repredict.max(0),
        };

        // Re-feed every committed input the server has not applied yet.
        if let Some(slot) = self.my_slot {
            let newer: Vec<InputFrame> = self
                .input_queue
                .iter()
                .filter(|f| f.tick > server_tick)
                .cloned()
                .collect();
            for frame in newer {
                self.gs.input_buffers[slot].merge(frame);
            }
        }

        let started = Instant::now();
        while ticks_to_repredict > 0 {
            if started.elapsed().as_secs_f64() * 1000.0 > MAX_MS_SPENT_REPREDICTING {
                warn!(
                    remaining = ticks_to_repredict,
                    "reprediction budget exhausted, catching up visibly"
                );
                break;
            }
            self.commit_pending_inputs();
            self.gs.step(TIMESTEP);
            ticks_to_repredict -= 1;
        }
    }

    /// The whole committed queue, newest first, ready for the wire.
    pub fn make_input_packet(&self, voice: Vec<VoicePacket>) -> ClientToServer {
        ClientToServer {
            inputs: self.input_queue.iter_newest_first().cloned().collect(),
            voice,
        }
    }

    /// World position of our player's body, when we have one.
    pub fn my_player_pos(&self) -> Option<crate::math::V2> {
        let slot = self.my_slot?;
        let id = self.gs.players[slot].entity?;
        self.gs.entity_pos(id)
    }

    /// Is our player sitting in a medbay right now?
    pub fn in_medbay(&self) -> bool {
        let Some(slot) = self.my_slot else { return false };
        let Some(player_id) = self.gs.players[slot].entity else {
            return false;
        };
        let Some(player) = self.gs.arena.get(player_id) else {
            return false;
        };
        let Some(seat_id) = player.currently_inside_of_box else {
            return false;
        };
        self.gs
            .arena
            .get(seat_id)
            .is_some_and(|seat| seat.box_kind == BoxKind::Medbay)
    }

    /// Forget all prediction state; used after a disconnect so a
    /// reconnection starts from a clean queue.
    pub fn reset(&mut self) {
        let record_to = self.record_to.take();
        let replay_from = self.replay_from.take();
        *self = Self::new();
        self.record_to = record_to;
        self.replay_from = replay_from;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_lead_grows_with_rtt() {
        let base = healthy_ticks_ahead(0.0, 0.0);
        assert_eq!(base, HEALTHY_MARGIN_TICKS);
        assert!(healthy_ticks_ahead(0.1, 0.02) > base);
    }

    #[test]
    fn dilation_bands() {
        let mut controller = TimeDilation::default();
        assert_eq!(controller.update(10, 10), None);
        assert!((controller.factor - 1.0).abs() < f64::EPSILON);

        controller.update(5, 10);
        assert!((controller.factor - 1.1).abs() < f64::EPSILON);

        controller.update(15, 10);
        assert!((controller.factor - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn far_behind_triggers_snap() {
        let mut controller = TimeDilation::default();
        let healthy = TICKS_BEHIND_DO_SNAP + 2;
        let snap = controller.update(0, healthy);
        assert_eq!(snap, Some(healthy));
    }

    #[test]
    fn advance_commits_one_frame_per_tick() {
        let mut client = ClientGame::new();
        client.my_slot = Some(0);
        client.gs.players[0].connected = true;
        client.advance(TIMESTEP * 4.0);
        assert_eq!(client.gs.tick, 4);
        // The commit sequence trails the stepped tick by one: nothing is
        // committed for the very first tick.
        assert_eq!(client.input_queue.len(), 3);
        let ticks: Vec<u64> = client.input_queue.iter().map(|f| f.tick).collect();
        assert_eq!(ticks, vec![1, 2, 3]);
    }

    #[test]
    fn latched_event_survives_until_commit() {
        let mut client = ClientGame::new();
        client.my_slot = Some(0);
        client.gs.players[0].connected = true;
        let mut raw = InputFrame::default();
        raw.seat_action = true;
        client.latch_input(&raw);
        // Later frames without the flag do not clear it.
        client.latch_input(&InputFrame::default());
        client.advance(TIMESTEP * 2.0);
        let committed = client.input_queue.most_recent().unwrap();
        assert!(committed.seat_action);
        // After the commit the pending frame is clean again.
        client.advance(TIMESTEP);
        assert!(!client.input_queue.most_recent().unwrap().seat_action);
    }

    #[test]
    fn stale_snapshot_is_discarded() {
        let mut client = ClientGame::new();
        client.advance(TIMESTEP * 10.0);

        let mut old = GameState::new(); // tick 0
        old.tick = 0;
        let decoded = DecodedSnapshot {
            your_player: -1,
            gs: old,
            voice: Vec::new(),
        };
        let tick_before = client.gs.tick;
        client.on_snapshot(decoded, 0.0, 0.0);
        assert_eq!(client.gs.tick, tick_before, "tick-0 snapshot must be ignored");
    }
}
