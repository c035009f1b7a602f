//! Voice packet plumbing.
//!
//! Voice payloads are opaque encoded frames produced and consumed by audio
//! device threads that live outside this crate. The simulation side only
//! routes them: each client context owns one outgoing and one incoming
//! [`VoiceQueue`], and the server copies packets between peers' queues.
//! Queues are bounded and drop the oldest packet on overflow, so a stalled
//! consumer costs latency, never memory.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::constants::{VOIP_PACKET_BUFFER_SIZE, VOIP_PACKET_MAX_SIZE};

/// One encoded voice frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VoicePacket {
    pub data: Vec<u8>,
}

impl VoicePacket {
    /// Packets above the wire bound are truncated at the source rather
    /// than rejected downstream.
    pub fn new(data: Vec<u8>) -> Self {
        let mut data = data;
        data.truncate(VOIP_PACKET_MAX_SIZE);
        Self { data }
    }
}

/// Bounded single-producer/single-consumer packet queue shared with an
/// audio callback thread.
#[derive(Debug, Default)]
pub struct VoiceQueue {
    inner: Mutex<VecDeque<VoicePacket>>,
}

impl VoiceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a packet, dropping the oldest when the queue is full.
    pub fn push(&self, packet: VoicePacket) {
        let mut queue = self.lock();
        if queue.len() >= VOIP_PACKET_BUFFER_SIZE {
            queue.pop_front();
        }
        queue.push_back(packet);
    }

    /// Take every queued packet, oldest first.
    pub fn drain(&self) -> Vec<VoicePacket> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<VoicePacket>> {
        // A panicked audio thread must not silence the game thread.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_oldest() {
        let queue = VoiceQueue::new();
        for i in 0..(VOIP_PACKET_BUFFER_SIZE + 3) {
            queue.push(VoicePacket::new(vec![i as u8]));
        }
        let drained = queue.drain();
        assert_eq!(drained.len(), VOIP_PACKET_BUFFER_SIZE);
        assert_eq!(drained[0].data, vec![3u8]);
    }

    #[test]
    fn oversized_packet_is_truncated() {
        let packet = VoicePacket::new(vec![0u8; VOIP_PACKET_MAX_SIZE + 100]);
        assert_eq!(packet.data.len(), VOIP_PACKET_MAX_SIZE);
    }
}
