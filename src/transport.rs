//! The transport / active-message collaborator contract.
//!
//! Everything in this module is a trait or a plain-data capability
//! descriptor: the reliable-messaging transport itself (registration,
//! active-message send paths) is out of scope for this crate and is
//! supplied by the embedder. What lives here is the exact shape of that
//! contract, and the derivation of per-phase send/receive thresholds from
//! a connected endpoint's capabilities.

use std::fmt;
use std::os::raw::c_void;

use crate::error::Result;
use crate::group::Rank;
use crate::wire::CollectiveKind;

/// Wire-visible group identifier, re-exported here for convenience at the
/// transport boundary.
pub use crate::group::GroupId;

/// Capabilities of a connected endpoint, as returned by [`Transport::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointCaps {
    /// Maximum payload size for an inline ("short") send.
    pub max_short: usize,
    /// Maximum payload size for a single buffered-copy send.
    pub max_bcopy: usize,
    /// Maximum payload size for a single zero-copy send.
    pub max_zcopy: usize,
}

/// Capabilities of the memory domain backing an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MdCaps {
    /// Maximum registerable region size.
    pub max_reg: usize,
    /// Whether a memory handle must be attached to zero-copy sends.
    pub need_memh: bool,
}

/// Per-endpoint send/receive cutover points, derived from
/// [`EndpointCaps`]/[`MdCaps`] minus the active-message header size, then
/// aligned down to a 16-byte multiple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Largest payload sent as a single inline short message.
    pub max_short_one: usize,
    /// Largest payload sent as short messages, possibly fragmented.
    pub max_short_max: usize,
    /// Largest payload sent as a single buffered-copy message.
    pub max_bcopy_one: usize,
    /// Largest payload sent as buffered-copy messages, possibly fragmented.
    pub max_bcopy_max: usize,
    /// Largest payload sent as a single zero-copy message.
    pub max_zcopy_one: usize,
    /// Largest region the memory domain can register for zero-copy.
    pub md_max_reg: usize,
}

/// Active-message header size assumed when deriving thresholds from raw
/// endpoint capabilities. Matches the fixed-size header in
/// [`crate::wire::WireHeader`].
pub const AM_HEADER_SIZE: usize = 8;

/// Alignment, in bytes, thresholds are rounded down to.
const THRESHOLD_ALIGN: usize = 16;

fn align_down(value: usize, align: usize) -> usize {
    if value < align {
        0
    } else {
        value - (value % align)
    }
}

impl Thresholds {
    /// Derives per-endpoint thresholds from connection capabilities, per
    /// the step executor's fragmentation rule: subtract the header size,
    /// then align down to 16 bytes.
    pub fn derive(ep_caps: EndpointCaps, md_caps: MdCaps, header_size: usize) -> Self {
        let short = ep_caps.max_short.saturating_sub(header_size);
        let bcopy = ep_caps.max_bcopy.saturating_sub(header_size);
        let zcopy = ep_caps.max_zcopy.saturating_sub(header_size);
        Thresholds {
            max_short_one: align_down(short, THRESHOLD_ALIGN),
            max_short_max: align_down(short, THRESHOLD_ALIGN),
            max_bcopy_one: align_down(bcopy, THRESHOLD_ALIGN),
            max_bcopy_max: align_down(bcopy, THRESHOLD_ALIGN),
            max_zcopy_one: align_down(zcopy, THRESHOLD_ALIGN),
            md_max_reg: md_caps.max_reg,
        }
    }
}

/// Access-mode flags requested of a memory registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessMode {
    /// Region may be the local source of a zero-copy send.
    pub local_read: bool,
    /// Region may be the local target of a zero-copy receive.
    pub local_write: bool,
}

/// Outcome of a zero-copy send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The send completed synchronously.
    Done,
    /// The send was accepted and will complete asynchronously; the
    /// supplied completion token will be signalled later.
    InProgress,
}

/// A contiguous or strided region to be sent/received via zero-copy.
#[derive(Debug, Clone, Copy)]
pub struct IoSlice {
    /// Pointer to the first byte.
    pub ptr: *const c_void,
    /// Length in bytes.
    pub len: usize,
}

/// The reliable-messaging transport collaborator. Implementors guarantee
/// per-endpoint in-order, lossless delivery (base spec non-goal: this
/// crate never compensates for reordering or loss at the transport
/// level).
pub trait Transport {
    /// Opaque per-rank endpoint handle.
    type Endpoint: Copy + Eq + fmt::Debug;
    /// Opaque memory-registration handle.
    type MemoryHandle: Copy + fmt::Debug;

    /// Resolves `rank` within `group` to a connected endpoint and its
    /// capabilities.
    fn connect(
        &mut self,
        group: GroupId,
        rank: Rank,
    ) -> Result<(Self::Endpoint, EndpointCaps, MdCaps)>;

    /// Sends `payload` inline, prefixed by `header`. The active-message id
    /// `am_id` is opaque to this crate and chosen by the embedder.
    fn am_short(&mut self, ep: Self::Endpoint, am_id: u8, header: &[u8], payload: &[u8]) -> Result<()>;

    /// Packs and sends a buffered-copy message, prefixed by `header`.
    /// `pack` writes the payload into the scratch buffer it is given and
    /// returns the number of bytes written.
    fn am_bcopy(
        &mut self,
        ep: Self::Endpoint,
        am_id: u8,
        header: &[u8],
        pack: &mut dyn FnMut(&mut [u8]) -> usize,
    ) -> Result<usize>;

    /// Sends `iov` zero-copy, prefixed by `header`.
    fn am_zcopy(
        &mut self,
        ep: Self::Endpoint,
        am_id: u8,
        header: &[u8],
        iov: &[IoSlice],
    ) -> Result<SendOutcome>;

    /// Registers a region for zero-copy access.
    fn mem_reg(&mut self, buf: *mut c_void, len: usize, access: AccessMode) -> Result<Self::MemoryHandle>;

    /// Releases a registration made by [`Transport::mem_reg`].
    fn mem_dereg(&mut self, memh: Self::MemoryHandle) -> Result<()>;
}

/// Supplies per-rank topology and reduction-backend facts the planner
/// cannot derive on its own: the bootstrap / group-factory collaborator.
pub trait GroupFactory {
    /// Total number of members.
    fn member_count(&self) -> usize;
    /// My own rank.
    fn my_rank(&self) -> Rank;
    /// Node index of each member, in member-list order.
    fn node_index(&self) -> &[u32];
    /// Socket index of each member, in member-list order.
    fn socket_index(&self) -> &[u32];
    /// Whether node occupancy is unbalanced across the group.
    fn ppn_unbalanced(&self) -> bool;
    /// Whether socket occupancy is unbalanced across the group.
    fn pps_unbalanced(&self) -> bool;
    /// Whether ranks on the same node are contiguous in rank order.
    fn node_ranks_contiguous(&self) -> bool;
    /// Whether ranks on the same socket are contiguous in rank order.
    fn socket_ranks_contiguous(&self) -> bool;
    /// Whether process binding information (needed for NAP-aware
    /// algorithms) is available.
    fn bound_to_core(&self) -> bool;
}

/// Identifies which active-message id space a collective's messages use,
/// so a demux implementation backed by a single AM id per kind can route
/// without decoding the payload first.
pub fn am_id_for(kind: CollectiveKind) -> u8 {
    match kind {
        CollectiveKind::Barrier => 0,
        CollectiveKind::Bcast => 1,
        CollectiveKind::Reduce => 2,
        CollectiveKind::Allreduce => 3,
        CollectiveKind::Scatterv => 4,
        CollectiveKind::Gatherv => 5,
        CollectiveKind::Allgatherv => 6,
        CollectiveKind::Alltoallv => 7,
    }
}
