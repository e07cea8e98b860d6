//! Wire-level identifiers: the collective kind/algorithm id space and the
//! 8-byte (or 12-byte, for variable-length ops) header every active
//! message begins with.

use std::os::raw::c_int;

/// Which MPI-style group collective is being planned or executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectiveKind {
    /// `MPI_Barrier`
    Barrier,
    /// `MPI_Bcast`
    Bcast,
    /// `MPI_Reduce`
    Reduce,
    /// `MPI_Allreduce`
    Allreduce,
    /// `MPI_Scatterv`
    Scatterv,
    /// `MPI_Gatherv`
    Gatherv,
    /// `MPI_Allgatherv`
    Allgatherv,
    /// `MPI_Alltoallv`
    Alltoallv,
}

impl CollectiveKind {
    /// Whether a plan for this kind may be memoized in the plan cache.
    ///
    /// Alltoallv plans embed per-invocation `(counts, displs)` pairs and
    /// so are rebuilt on every trigger.
    pub fn is_cacheable(self) -> bool {
        !matches!(self, CollectiveKind::Alltoallv)
    }
}

/// Algorithm id space, one enum per collective kind rather than a bare
/// integer: the original C source indexes a flat table of `int`s, but a
/// tagged enum per collective rules out cross-kind id confusion at
/// compile time and is cheap to reproduce in Rust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgoId {
    /// Barrier algorithms.
    Barrier(BarrierAlgo),
    /// Broadcast algorithms.
    Bcast(BcastAlgo),
    /// Reduce / allreduce algorithms (shared id space; reduce degrades the
    /// waypoint/terminal roles of the same trees allreduce uses).
    Allreduce(AllreduceAlgo),
    /// Gatherv / scatterv / allgatherv algorithms.
    Gather(GatherAlgo),
    /// Alltoallv algorithms.
    Alltoallv(AlltoallvAlgo),
}

/// Barrier algorithm ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierAlgo {
    /// Binomial tree fan-in followed by fan-out.
    Binomial,
    /// K-nomial tree, degree from config.
    Knomial,
    /// Recursive doubling.
    RecursiveDoubling,
}

/// Broadcast algorithm ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BcastAlgo {
    /// K-nomial tree fan-out, left-most tree.
    KnomialTree,
    /// Bruck-style scatter-allgather (used for large messages / high PPN).
    Bruck,
}

/// Allreduce / reduce algorithm ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllreduceAlgo {
    /// Binomial tree fan-in/fan-out (reduce only; small messages).
    BinomialTree,
    /// Recursive doubling with proxy/extra handling for non-power-of-two sizes.
    RecursiveDoubling,
    /// Ring reduce-scatter + allgather.
    Ring,
    /// Rabenseifner: binary-block reduce-scatter + allgather.
    Rabenseifner,
    /// Node-aware hybrid: intra-node k-nomial tree, inter-node binary-block.
    NodeAwareRecursiveAndBmtree,
}

/// Gatherv / scatterv / allgatherv algorithm ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatherAlgo {
    /// Linear: root exchanges directly with every other rank.
    Linear,
    /// K-nomial tree scatter/gather.
    KnomialTree,
    /// Recursive-doubling allgather (allgatherv only).
    RecursiveDoubling,
    /// Ring allgather (allgatherv only).
    Ring,
}

/// Alltoallv algorithm ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlltoallvAlgo {
    /// Direct linear all-pairs exchange ("Ladd").
    Ladd,
    /// Hierarchical gather/alltoallv/scatter ("Plummer").
    Plummer,
    /// Randomized-schedule scatter bounded by a throttle factor.
    ThrottledScatter,
}

/// 8-byte header prefixing every fixed-size-collective active message,
/// packed on the wire as a single 64-bit `local_id` but matched by the
/// demux on the narrower [`WireHeader::match_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    /// Wire-visible group identifier.
    pub group_id: u16,
    /// Low 8 bits of the op's circular `coll_id` counter.
    pub coll_id: u8,
    /// Step index within the plan.
    pub step_idx: u8,
    /// Byte offset of this fragment within the step's logical buffer.
    pub remote_offset: u32,
}

impl WireHeader {
    /// Packs the header into its wire-exact 64-bit representation.
    pub fn local_id(&self) -> u64 {
        (u64::from(self.group_id) << 48)
            | (u64::from(self.coll_id) << 40)
            | (u64::from(self.step_idx) << 32)
            | u64::from(self.remote_offset)
    }

    /// The demux matching key: `group_id`, `coll_id`, and `step_idx`,
    /// excluding `remote_offset`.
    ///
    /// `remote_offset` varies per fragment of a pipelined/zcopy receive and
    /// is placement data, not part of what identifies which step an
    /// arrival belongs to — a slot waiting on one step must match every
    /// fragment of that step's messages, not just the first one posted.
    pub fn match_key(&self) -> u32 {
        (u32::from(self.group_id) << 16) | (u32::from(self.coll_id) << 8) | u32::from(self.step_idx)
    }

    /// Unpacks a 64-bit `local_id` back into its fields.
    pub fn from_local_id(local_id: u64) -> Self {
        WireHeader {
            group_id: (local_id >> 48) as u16,
            coll_id: (local_id >> 40) as u8,
            step_idx: (local_id >> 32) as u8,
            remote_offset: local_id as u32,
        }
    }

    /// Serializes to 8 little-endian bytes, as placed on the wire.
    pub fn to_bytes(self) -> [u8; 8] {
        self.local_id().to_le_bytes()
    }

    /// Parses 8 little-endian bytes back into a header.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self::from_local_id(u64::from_le_bytes(bytes))
    }
}

/// 12-byte header variant used by variable-length collectives
/// (alltoallv), prepending the sender's absolute rank to the fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeaderV2 {
    /// The fixed-size header fields.
    pub base: WireHeader,
    /// Absolute rank of the sender, needed because alltoallv messages are
    /// not necessarily matched by step index alone.
    pub sender_rank: c_int,
}

impl WireHeaderV2 {
    /// Serializes to 12 little-endian bytes: the 8-byte base header
    /// followed by the 4-byte sender rank.
    pub fn to_bytes(self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[..8].copy_from_slice(&self.base.to_bytes());
        out[8..].copy_from_slice(&self.sender_rank.to_le_bytes());
        out
    }

    /// Parses 12 little-endian bytes back into a header.
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        let mut base_bytes = [0u8; 8];
        base_bytes.copy_from_slice(&bytes[..8]);
        let mut rank_bytes = [0u8; 4];
        rank_bytes.copy_from_slice(&bytes[8..]);
        WireHeaderV2 {
            base: WireHeader::from_bytes(base_bytes),
            sender_rank: c_int::from_le_bytes(rank_bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_bit_exact() {
        let header = WireHeader {
            group_id: 0xBEEF,
            coll_id: 0x42,
            step_idx: 7,
            remote_offset: 0xC0FF_EE00,
        };
        let bytes = header.to_bytes();
        assert_eq!(WireHeader::from_bytes(bytes), header);
        assert_eq!(WireHeader::from_local_id(header.local_id()), header);
    }

    #[test]
    fn match_key_ignores_remote_offset() {
        let a = WireHeader { group_id: 9, coll_id: 3, step_idx: 1, remote_offset: 0 };
        let b = WireHeader { group_id: 9, coll_id: 3, step_idx: 1, remote_offset: 4096 };
        assert_eq!(a.match_key(), b.match_key());
        assert_ne!(a.local_id(), b.local_id());
    }

    #[test]
    fn match_key_distinguishes_step_idx() {
        let a = WireHeader { group_id: 9, coll_id: 3, step_idx: 1, remote_offset: 0 };
        let b = WireHeader { group_id: 9, coll_id: 3, step_idx: 2, remote_offset: 0 };
        assert_ne!(a.match_key(), b.match_key());
    }

    #[test]
    fn header_v2_roundtrips_bit_exact() {
        let header = WireHeaderV2 {
            base: WireHeader {
                group_id: 3,
                coll_id: 200,
                step_idx: 1,
                remote_offset: 128,
            },
            sender_rank: 17,
        };
        assert_eq!(WireHeaderV2::from_bytes(header.to_bytes()), header);
    }

    #[test]
    fn alltoallv_plans_are_never_cacheable() {
        assert!(!CollectiveKind::Alltoallv.is_cacheable());
        assert!(CollectiveKind::Allreduce.is_cacheable());
    }
}
