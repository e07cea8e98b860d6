//! Active-message demux: routes an arrived message to the per-op slot
//! that is waiting for it, or stages it if no receiver is posted yet.
//!
//! The original design stages descriptors either by reference (transport
//! keeps ownership, `FLAG_DESC`) or by copy into a pool/heap allocation.
//! This crate's `Transport` trait hands the demux a borrowed `&[u8]`
//! payload slice with no ownership-transfer signal, so every staged
//! descriptor here is an owned copy; the reference-counted fast path is
//! an optimization this safe-buffer model doesn't need to reproduce.

use std::collections::VecDeque;

use crate::wire::WireHeader;

/// Upper bound on live concurrent ops per group, and so the slot table
/// size (`coll_id mod MAX_CONCURRENT_OPS` selects a slot).
pub const MAX_CONCURRENT_OPS: usize = 256;

/// One arrived message that could not be matched to a waiting receiver
/// yet, or that was matched and is being handed to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDescriptor {
    /// The message's header.
    pub header: WireHeader,
    /// Owned payload bytes.
    pub payload: Vec<u8>,
}

/// Per-concurrent-op-id slot: a FIFO of staged arrivals plus the
/// currently-expected match key, if a receiver is posted.
#[derive(Debug, Clone, Default)]
pub struct CompSlot {
    /// [`WireHeader::match_key`] the posted receiver is waiting for,
    /// `None` when idle. Deliberately excludes `remote_offset` so that
    /// every fragment of a step's expected arrivals matches the same
    /// posted receiver, not just the one whose offset happened to be
    /// posted first.
    pub expected: Option<u32>,
    /// Staged descriptors that arrived before (or after) their match key
    /// stopped being expected.
    pub msg_head: VecDeque<MessageDescriptor>,
}

/// Per-group table of [`CompSlot`]s, indexed by `coll_id mod
/// MAX_CONCURRENT_OPS`.
#[derive(Debug, Clone)]
pub struct SlotTable {
    slots: Vec<CompSlot>,
}

impl Default for SlotTable {
    fn default() -> Self {
        SlotTable::new()
    }
}

impl SlotTable {
    /// An empty table with `MAX_CONCURRENT_OPS` slots.
    pub fn new() -> Self {
        SlotTable {
            slots: vec![CompSlot::default(); MAX_CONCURRENT_OPS],
        }
    }

    fn index(coll_id: u8) -> usize {
        coll_id as usize % MAX_CONCURRENT_OPS
    }

    /// The slot for `coll_id`.
    pub fn slot_mut(&mut self, coll_id: u8) -> &mut CompSlot {
        &mut self.slots[Self::index(coll_id)]
    }

    /// The slot for `coll_id`, read-only.
    pub fn slot(&self, coll_id: u8) -> &CompSlot {
        &self.slots[Self::index(coll_id)]
    }

    /// Marks the slot for `coll_id` as expecting `match_key`
    /// ([`WireHeader::match_key`]), and returns any already-staged
    /// descriptor that matches it (the arrival raced ahead of the
    /// receiver being posted).
    pub fn post_receiver(&mut self, coll_id: u8, match_key: u32) -> Option<MessageDescriptor> {
        let slot = self.slot_mut(coll_id);
        slot.expected = Some(match_key);
        if let Some(pos) = slot.msg_head.iter().position(|d| d.header.match_key() == match_key) {
            tracing::trace!(coll_id, "demux: draining staged arrival for freshly posted receiver");
            slot.msg_head.remove(pos)
        } else {
            None
        }
    }

    /// Clears the expected match key, e.g. once a step's receive side has
    /// been fully satisfied.
    pub fn clear_receiver(&mut self, coll_id: u8) {
        self.slot_mut(coll_id).expected = None;
    }
}

/// Outcome of one arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxOutcome {
    /// The slot had a posted receiver expecting this arrival's match key;
    /// the descriptor should be handed to it immediately. `header.remote_offset`
    /// tells the consumer where in its logical buffer this fragment lands.
    Matched(MessageDescriptor),
    /// No receiver was expecting this message yet; it was staged.
    Staged,
}

/// Handles one arrived message: `(group_id, coll_id, step_idx,
/// remote_offset)` are carried in `header`; `payload` is the message
/// body. Matches base §4.5.5's demux procedure, steps 2-4 (step 1,
/// growing the group table on an unseen `group_id`, is the caller's
/// responsibility since slot tables are per-group here).
///
/// Matching excludes `remote_offset`: a step with more than one
/// concurrently-outstanding fragment posts one receiver for the whole
/// step, and every fragment's arrival — whatever offset it carries — must
/// reach that same receiver.
pub fn on_arrival(table: &mut SlotTable, header: WireHeader, payload: &[u8]) -> DemuxOutcome {
    let slot = table.slot_mut(header.coll_id);
    if slot.expected == Some(header.match_key()) {
        tracing::trace!(coll_id = header.coll_id, step_idx = header.step_idx, "demux: arrival matched posted receiver");
        DemuxOutcome::Matched(MessageDescriptor {
            header,
            payload: payload.to_vec(),
        })
    } else {
        slot.msg_head.push_back(MessageDescriptor {
            header,
            payload: payload.to_vec(),
        });
        tracing::trace!(coll_id = header.coll_id, step_idx = header.step_idx, staged = slot.msg_head.len(), "demux: arrival staged, no receiver posted yet");
        DemuxOutcome::Staged
    }
}

/// Performs the commutativity-preserving swap: when `is_swap` is set on
/// a phase, the local contribution and the incoming payload trade places
/// before reducing, so that the reduction always applies `(lower-rank,
/// higher-rank)` in the same order regardless of arrival order.
pub fn swap_for_reduce(incoming: &mut [u8], local: &mut [u8]) {
    let n = incoming.len().min(local.len());
    incoming[..n].swap_with_slice(&mut local[..n]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(coll_id: u8, offset: u32) -> WireHeader {
        WireHeader {
            group_id: 1,
            coll_id,
            step_idx: 0,
            remote_offset: offset,
        }
    }

    #[test]
    fn arrival_before_post_is_staged_then_matched_on_post() {
        let mut table = SlotTable::new();
        let h = header(5, 0);
        assert_eq!(on_arrival(&mut table, h, &[1, 2, 3]), DemuxOutcome::Staged);
        let matched = table.post_receiver(5, h.match_key());
        assert!(matched.is_some());
        assert_eq!(matched.unwrap().payload, vec![1, 2, 3]);
    }

    #[test]
    fn arrival_after_post_matches_immediately() {
        let mut table = SlotTable::new();
        let h = header(9, 0);
        table.post_receiver(9, h.match_key());
        match on_arrival(&mut table, h, &[9, 9]) {
            DemuxOutcome::Matched(desc) => assert_eq!(desc.payload, vec![9, 9]),
            DemuxOutcome::Staged => panic!("expected a match"),
        }
    }

    #[test]
    fn distinct_coll_ids_use_distinct_slots() {
        let mut table = SlotTable::new();
        table.post_receiver(3, 42);
        table.post_receiver(200, 99);
        assert_eq!(table.slot(3).expected, Some(42));
        assert_eq!(table.slot(200).expected, Some(99));
    }

    #[test]
    fn every_fragment_of_a_step_matches_the_same_posted_receiver() {
        let mut table = SlotTable::new();
        let posted = header(5, 0);
        table.post_receiver(5, posted.match_key());
        for offset in [0u32, 64, 128] {
            match on_arrival(&mut table, header(5, offset), &[offset as u8]) {
                DemuxOutcome::Matched(desc) => assert_eq!(desc.header.remote_offset, offset),
                DemuxOutcome::Staged => panic!("fragment at offset {offset} should match the posted receiver"),
            }
        }
    }

    #[test]
    fn swap_exchanges_bytes_in_place() {
        let mut incoming = vec![1, 2, 3];
        let mut local = vec![9, 8, 7];
        swap_for_reduce(&mut incoming, &mut local);
        assert_eq!(incoming, vec![9, 8, 7]);
        assert_eq!(local, vec![1, 2, 3]);
    }
}
