//! Shared harness for the scenario tests: an in-process `Transport` that
//! delivers active messages through a mailbox keyed by destination rank,
//! plus a helper for building single-node `Group`s.
//!
//! Capacities are deliberately oversized so every payload these tests
//! send resolves to `SendMode::Short` (see `executor::fragment`), keeping
//! the pump loops in `scenarios.rs` free of bcopy/zcopy branching.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::os::raw::c_void;
use std::rc::Rc;

use ucg_core::error::Result;
use ucg_core::group::{BalanceFlags, Group, GroupId, Rank};
use ucg_core::transport::{AccessMode, EndpointCaps, IoSlice, MdCaps, SendOutcome, Transport};
use ucg_core::wire::WireHeader;

/// One delivered active message, as a receiver would see it off the wire.
#[derive(Debug, Clone)]
pub struct Arrival {
    pub header: WireHeader,
    pub payload: Vec<u8>,
}

type Mailbox = Rc<RefCell<HashMap<Rank, VecDeque<Arrival>>>>;

const HUGE: usize = 1 << 20;

/// A `Transport` that delivers directly into a shared in-process mailbox,
/// one queue per destination rank. Clones share the same mailbox, so one
/// instance per simulated rank behaves like independent NICs on a single
/// switch.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    mailbox: Mailbox,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        LoopbackTransport::default()
    }

    /// Drains every message currently queued for `rank`.
    pub fn drain(&self, rank: Rank) -> Vec<Arrival> {
        self.mailbox.borrow_mut().remove(&rank).map(Into::into).unwrap_or_default()
    }

    fn deliver(&self, dest: Rank, header: WireHeader, payload: Vec<u8>) {
        self.mailbox.borrow_mut().entry(dest).or_default().push_back(Arrival { header, payload });
    }
}

impl Transport for LoopbackTransport {
    type Endpoint = Rank;
    type MemoryHandle = ();

    fn connect(&mut self, _group: GroupId, rank: Rank) -> Result<(Rank, EndpointCaps, MdCaps)> {
        Ok((
            rank,
            EndpointCaps { max_short: HUGE, max_bcopy: HUGE, max_zcopy: HUGE },
            MdCaps { max_reg: HUGE, need_memh: false },
        ))
    }

    fn am_short(&mut self, ep: Rank, _am_id: u8, header: &[u8], payload: &[u8]) -> Result<()> {
        let mut h = [0u8; 8];
        h.copy_from_slice(header);
        self.deliver(ep, WireHeader::from_bytes(h), payload.to_vec());
        Ok(())
    }

    fn am_bcopy(&mut self, ep: Rank, _am_id: u8, header: &[u8], pack: &mut dyn FnMut(&mut [u8]) -> usize) -> Result<usize> {
        let mut scratch = vec![0u8; 65536];
        let n = pack(&mut scratch);
        let mut h = [0u8; 8];
        h.copy_from_slice(header);
        self.deliver(ep, WireHeader::from_bytes(h), scratch[..n].to_vec());
        Ok(n)
    }

    fn am_zcopy(&mut self, ep: Rank, _am_id: u8, header: &[u8], iov: &[IoSlice]) -> Result<SendOutcome> {
        let mut payload = Vec::new();
        for slice in iov {
            // Test-only transport: the caller (the step executor) guarantees
            // every slice stays valid for the duration of this call.
            let bytes = unsafe { std::slice::from_raw_parts(slice.ptr.cast::<u8>(), slice.len) };
            payload.extend_from_slice(bytes);
        }
        let mut h = [0u8; 8];
        h.copy_from_slice(header);
        self.deliver(ep, WireHeader::from_bytes(h), payload);
        Ok(SendOutcome::Done)
    }

    fn mem_reg(&mut self, _buf: *mut c_void, _len: usize, _access: AccessMode) -> Result<()> {
        Ok(())
    }

    fn mem_dereg(&mut self, _memh: ()) -> Result<()> {
        Ok(())
    }
}

/// Builds one `Group` handle per rank of a `size`-member, single-node,
/// single-socket group sharing `id`.
pub fn single_node_groups(id: GroupId, size: usize) -> Vec<Group> {
    let members: Vec<Rank> = (0..size as Rank).collect();
    let node_index = vec![0u32; size];
    let socket_index = vec![0u32; size];
    (0..size)
        .map(|i| Group::new(id, members.clone(), i, node_index.clone(), socket_index.clone(), BalanceFlags::default()).unwrap())
        .collect()
}
