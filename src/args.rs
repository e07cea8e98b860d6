//! Collective argument records: one variant per collective kind, each
//! carrying buffers, counts, a datatype descriptor, and the optional
//! operator/root the kind needs.
//!
//! This crate sits below the user-facing MPI binding (out of scope here),
//! so buffers arrive as already-resolved raw pointers rather than typed
//! slices — the binding is responsible for the unsafe-to-safe boundary
//! with the caller's actual arrays.

use std::os::raw::c_void;

use crate::datatype::Datatype;
use crate::group::Rank;
use crate::wire::CollectiveKind;

/// A possibly-absent send buffer: `None` represents `MPI_IN_PLACE`.
///
/// Per the source this crate is grounded on, a non-root rank passing
/// `IN_PLACE` to a rooted varying-count collective causes the local copy
/// into the receive buffer to be skipped entirely, rather than treated as
/// an error or a degenerate self-copy — that behavior is reproduced
/// verbatim here.
pub type InPlaceBuffer = Option<*const c_void>;

/// Variable per-peer counts and byte offsets, indexed by member index.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Element count for each peer.
    pub counts: Vec<usize>,
    /// Element displacement for each peer.
    pub displs: Vec<usize>,
}

impl Partition {
    /// Builds a partition, asserting `counts` and `displs` have the same
    /// length (one entry per group member).
    pub fn new(counts: Vec<usize>, displs: Vec<usize>) -> Self {
        assert_eq!(counts.len(), displs.len());
        Partition { counts, displs }
    }

    /// Number of peers this partition covers.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether the partition covers zero peers.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Total element count across all peers.
    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }
}

/// One variant per collective kind, matching [`CollectiveKind`] one-to-one.
pub enum CollectiveArgs<'a> {
    /// `MPI_Barrier`: no buffers.
    Barrier,
    /// `MPI_Bcast`: `buffer` is read on `root`, written elsewhere.
    Bcast {
        /// The buffer being broadcast.
        buffer: *mut c_void,
        /// Element count.
        count: usize,
        /// Element datatype.
        dtype: Datatype,
        /// Broadcasting rank.
        root: Rank,
    },
    /// `MPI_Reduce`: result lands only on `root`.
    Reduce {
        /// Local contribution.
        sendbuf: *const c_void,
        /// Result buffer, meaningful only on `root`.
        recvbuf: *mut c_void,
        /// Element count.
        count: usize,
        /// Element datatype.
        dtype: Datatype,
        /// Reduction operator.
        op: &'a dyn crate::datatype::ReductionOperator,
        /// Receiving rank.
        root: Rank,
    },
    /// `MPI_Allreduce`: result lands on every rank.
    Allreduce {
        /// Local contribution.
        sendbuf: *const c_void,
        /// Result buffer.
        recvbuf: *mut c_void,
        /// Element count.
        count: usize,
        /// Element datatype.
        dtype: Datatype,
        /// Reduction operator.
        op: &'a dyn crate::datatype::ReductionOperator,
    },
    /// `MPI_Scatterv`: `root`'s `sendbuf` is sliced per `send_partition`.
    Scatterv {
        /// Send buffer, meaningful only on `root`.
        sendbuf: *const c_void,
        /// Per-peer send slices, meaningful only on `root`.
        send_partition: Partition,
        /// This rank's receive buffer, or `None` for `IN_PLACE` on `root`.
        recvbuf: InPlaceBuffer,
        /// This rank's receive element count.
        recv_count: usize,
        /// Element datatype.
        dtype: Datatype,
        /// Scattering rank.
        root: Rank,
    },
    /// `MPI_Gatherv`: every rank's `sendbuf` lands in `root`'s `recvbuf`
    /// per `recv_partition`.
    Gatherv {
        /// This rank's send buffer, or `None` for `IN_PLACE` on `root`.
        sendbuf: InPlaceBuffer,
        /// This rank's send element count.
        send_count: usize,
        /// Receive buffer, meaningful only on `root`.
        recvbuf: *mut c_void,
        /// Per-peer receive slices, meaningful only on `root`.
        recv_partition: Partition,
        /// Element datatype.
        dtype: Datatype,
        /// Gathering rank.
        root: Rank,
    },
    /// `MPI_Allgatherv`: every rank's `sendbuf` lands in every rank's
    /// `recvbuf` per `recv_partition`.
    Allgatherv {
        /// This rank's send buffer.
        sendbuf: *const c_void,
        /// This rank's send element count.
        send_count: usize,
        /// Receive buffer.
        recvbuf: *mut c_void,
        /// Per-peer receive slices.
        recv_partition: Partition,
        /// Element datatype.
        dtype: Datatype,
    },
    /// `MPI_Alltoallv`: every rank sends a distinct slice to every other rank.
    Alltoallv {
        /// Send buffer.
        sendbuf: *const c_void,
        /// Per-peer send slices.
        send_partition: Partition,
        /// Receive buffer.
        recvbuf: *mut c_void,
        /// Per-peer receive slices.
        recv_partition: Partition,
        /// Element datatype.
        dtype: Datatype,
    },
}

impl<'a> CollectiveArgs<'a> {
    /// The collective kind this argument record carries.
    pub fn kind(&self) -> CollectiveKind {
        match self {
            CollectiveArgs::Barrier => CollectiveKind::Barrier,
            CollectiveArgs::Bcast { .. } => CollectiveKind::Bcast,
            CollectiveArgs::Reduce { .. } => CollectiveKind::Reduce,
            CollectiveArgs::Allreduce { .. } => CollectiveKind::Allreduce,
            CollectiveArgs::Scatterv { .. } => CollectiveKind::Scatterv,
            CollectiveArgs::Gatherv { .. } => CollectiveKind::Gatherv,
            CollectiveArgs::Allgatherv { .. } => CollectiveKind::Allgatherv,
            CollectiveArgs::Alltoallv { .. } => CollectiveKind::Alltoallv,
        }
    }

    /// The root rank, for collectives that have one.
    pub fn root(&self) -> Option<Rank> {
        match self {
            CollectiveArgs::Bcast { root, .. }
            | CollectiveArgs::Reduce { root, .. }
            | CollectiveArgs::Scatterv { root, .. }
            | CollectiveArgs::Gatherv { root, .. } => Some(*root),
            _ => None,
        }
    }

    /// The datatype used by this invocation, where one is shared by every
    /// buffer in the args (true of every kind in this crate).
    pub fn datatype(&self) -> &Datatype {
        match self {
            CollectiveArgs::Barrier => unreachable!("barrier carries no datatype"),
            CollectiveArgs::Bcast { dtype, .. }
            | CollectiveArgs::Reduce { dtype, .. }
            | CollectiveArgs::Allreduce { dtype, .. }
            | CollectiveArgs::Scatterv { dtype, .. }
            | CollectiveArgs::Gatherv { dtype, .. }
            | CollectiveArgs::Allgatherv { dtype, .. }
            | CollectiveArgs::Alltoallv { dtype, .. } => dtype,
        }
    }
}
