//! Topology discovery and the rank map.
//!
//! A [`Group`] is an ordered set of ranks participating in a communicator.
//! Its topology metadata (node/socket id per member) is supplied once by
//! the bootstrap collaborator and is immutable for the group's lifetime;
//! everything derivable from it (`num_local_procs`, `pps`, leader lists)
//! is computed in one linear pass at construction, mirroring
//! `ucg_builtin_query_topo` in the original source.

use std::os::raw::c_int;

use smallvec::SmallVec;

use crate::error::{CoreError, Result};

/// Identifies a certain process within a context. Absolute, never
/// relative to a sub-group.
pub type Rank = c_int;

/// Distance classification between two members of a group, from closest
/// to farthest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Distance {
    /// The member is myself.
    SelfRank,
    /// Same socket.
    Socket,
    /// Same NUMA / L3 domain, different socket.
    L3,
    /// Same host, neither socket nor L3 local.
    Host,
    /// Different host, same socket index (rare, but representable).
    SocketRemote,
    /// Different host entirely.
    HostRemote,
}

/// Per-rank balance/continuity flags supplied by the bootstrap
/// collaborator; consumed only by the feasibility checker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceFlags {
    /// Not every node hosts the same number of processes.
    pub ppn_unbalance: bool,
    /// Not every socket hosts the same number of processes.
    pub pps_unbalance: bool,
    /// Ranks on the same node are not contiguous in rank order.
    pub nrank_uncontinue: bool,
    /// Ranks on the same socket are not contiguous in rank order.
    pub srank_uncontinue: bool,
}

/// Wire-visible group identifier, used in [`crate::wire::WireHeader`].
pub type GroupId = u16;

/// Topology metadata and membership for one communicator-like group.
///
/// `my_rank` is always a valid index into every per-member array.
/// Topology arrays never change after construction.
#[derive(Debug, Clone)]
pub struct Group {
    id: GroupId,
    my_rank: Rank,
    members: Vec<Rank>,
    node_index: Vec<u32>,
    socket_index: Vec<u32>,
    balance: BalanceFlags,

    num_local_procs: usize,
    node_cnt: usize,
    pps: usize,
    local_socket_cnt: usize,
    local_members: Vec<usize>,
    socket_members: Vec<usize>,
    node_leaders: Vec<usize>,
    socket_leaders: Vec<usize>,
}

impl Group {
    /// Builds a group's topology from flat `node_index`/`socket_index`
    /// arrays (one entry per member, in member-list order) plus my own
    /// position. `members[i]` is the absolute rank of member index `i`.
    ///
    /// All derived fields are computed in one linear pass, as in
    /// `ucg_builtin_query_topo`.
    pub fn new(
        id: GroupId,
        members: Vec<Rank>,
        my_index: usize,
        node_index: Vec<u32>,
        socket_index: Vec<u32>,
        balance: BalanceFlags,
    ) -> Result<Self> {
        if members.len() != node_index.len() || members.len() != socket_index.len() {
            return Err(CoreError::InvalidParam(
                "group topology arrays must match member count".into(),
            ));
        }
        if my_index >= members.len() {
            return Err(CoreError::InvalidParam(
                "my_index out of range for group".into(),
            ));
        }
        let my_rank = members[my_index];
        let my_node = node_index[my_index];
        let my_socket = socket_index[my_index];

        let mut num_local_procs = 0usize;
        let mut pps = 0usize;
        let mut max_node = 0u32;
        let mut local_members = Vec::new();
        let mut socket_members = Vec::new();

        for (idx, (&node, &socket)) in node_index.iter().zip(socket_index.iter()).enumerate() {
            max_node = max_node.max(node);
            if node == my_node {
                num_local_procs += 1;
                local_members.push(idx);
                if socket == my_socket {
                    pps += 1;
                    socket_members.push(idx);
                }
            }
        }
        let node_cnt = (max_node + 1) as usize;
        let local_socket_cnt = if pps > 0 { num_local_procs / pps } else { 0 };

        // Leaders are the lowest-indexed member of each partition.
        let mut node_leaders = vec![usize::MAX; node_cnt];
        for (idx, &node) in node_index.iter().enumerate() {
            let slot = &mut node_leaders[node as usize];
            if *slot == usize::MAX {
                *slot = idx;
            }
        }
        let mut socket_leaders = Vec::new();
        if pps > 0 {
            let mut seen = SmallVec::<[u32; 32]>::new();
            for &idx in &local_members {
                let socket = socket_index[idx];
                if !seen.contains(&socket) {
                    seen.push(socket);
                    socket_leaders.push(idx);
                }
            }
        }

        Ok(Group {
            id,
            my_rank,
            members,
            node_index,
            socket_index,
            balance,
            num_local_procs,
            node_cnt,
            pps,
            local_socket_cnt,
            local_members,
            socket_members,
            node_leaders,
            socket_leaders,
        })
    }

    /// Wire-visible group id.
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Number of members in the group.
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// My absolute rank.
    pub fn my_rank(&self) -> Rank {
        self.my_rank
    }

    /// My index within the member list (`my_rank() == members()[my_index()]`).
    pub fn my_index(&self) -> usize {
        self.members
            .iter()
            .position(|&r| r == self.my_rank)
            .expect("my_rank is always present in members")
    }

    /// The member list, in logical-rank order.
    pub fn members(&self) -> &[Rank] {
        &self.members
    }

    /// Ranks sharing my node.
    pub fn num_local_procs(&self) -> usize {
        self.num_local_procs
    }

    /// Distinct node ids in the group.
    pub fn node_cnt(&self) -> usize {
        self.node_cnt
    }

    /// Ranks sharing my node and my socket.
    pub fn pps(&self) -> usize {
        self.pps
    }

    /// `num_local_procs / pps`, or 0 when `pps == 0`.
    pub fn local_socket_cnt(&self) -> usize {
        self.local_socket_cnt
    }

    /// Member indices sharing my node.
    pub fn local_members(&self) -> &[usize] {
        &self.local_members
    }

    /// Member indices sharing my socket.
    pub fn socket_members(&self) -> &[usize] {
        &self.socket_members
    }

    /// Lowest-indexed member of each node.
    pub fn node_leaders(&self) -> &[usize] {
        &self.node_leaders
    }

    /// Lowest-indexed member of each socket on my node.
    pub fn socket_leaders(&self) -> &[usize] {
        &self.socket_leaders
    }

    /// Balance/continuity flags, consumed by the feasibility checker.
    pub fn balance(&self) -> BalanceFlags {
        self.balance
    }

    /// Distance between two member indices, derived purely from the
    /// node/socket arrays.
    pub fn distance(&self, a: usize, b: usize) -> Distance {
        if a == b {
            return Distance::SelfRank;
        }
        let same_node = self.node_index[a] == self.node_index[b];
        let same_socket = self.socket_index[a] == self.socket_index[b];
        match (same_node, same_socket) {
            (true, true) => Distance::Socket,
            (true, false) => Distance::L3,
            (false, true) => Distance::SocketRemote,
            (false, false) => Distance::HostRemote,
        }
    }
}

/// A reversible mapping between the logical rank space of a sub-group
/// (e.g. node leaders, socket leaders) and the absolute member indices of
/// a parent group.
///
/// Topology sub-groups are themselves plan inputs and have their own
/// logical rank space distinct from the parent group's, so algorithms
/// built over a sub-group must translate back before resolving transport
/// endpoints.
#[derive(Debug, Clone)]
pub struct RankMap {
    /// `members[vgroup_rank]` is the absolute member index in the parent group.
    members: Vec<usize>,
}

impl RankMap {
    /// Builds a rank map from an ordered list of parent-group member indices.
    pub fn new(members: Vec<usize>) -> Self {
        RankMap { members }
    }

    /// Number of ranks in the sub-group.
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// `vgroup_rank -> group member index`. O(1).
    pub fn eval(&self, vgroup_rank: usize) -> Option<usize> {
        self.members.get(vgroup_rank).copied()
    }

    /// `group member index -> vgroup_rank`. O(members), as the base spec
    /// requires no reverse index be maintained.
    pub fn invert(&self, member_index: usize) -> Option<usize> {
        self.members.iter().position(|&m| m == member_index)
    }

    /// The underlying member-index list, in vgroup-rank order.
    pub fn members(&self) -> &[usize] {
        &self.members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_group() -> Group {
        // 2 nodes x 2 sockets x 2 ranks = 8 ranks.
        let node_index = vec![0, 0, 0, 0, 1, 1, 1, 1];
        let socket_index = vec![0, 0, 1, 1, 0, 0, 1, 1];
        let members: Vec<Rank> = (0..8).collect();
        Group::new(7, members, 5, node_index, socket_index, BalanceFlags::default()).unwrap()
    }

    #[test]
    fn derives_topology_in_one_pass() {
        let g = two_node_group();
        assert_eq!(g.my_rank(), 5);
        assert_eq!(g.num_local_procs(), 4);
        assert_eq!(g.node_cnt(), 2);
        assert_eq!(g.pps(), 2);
        assert_eq!(g.local_socket_cnt(), 2);
        assert_eq!(g.node_leaders(), &[0, 4]);
        assert_eq!(g.socket_leaders(), &[4, 6]);
    }

    #[test]
    fn distance_classifies_pairs() {
        let g = two_node_group();
        assert_eq!(g.distance(5, 5), Distance::SelfRank);
        assert_eq!(g.distance(4, 5), Distance::Socket);
        assert_eq!(g.distance(4, 6), Distance::L3);
        assert_eq!(g.distance(4, 0), Distance::HostRemote);
    }

    #[test]
    fn rank_map_roundtrips() {
        let map = RankMap::new(vec![0, 4, 6]);
        assert_eq!(map.eval(1), Some(4));
        assert_eq!(map.invert(6), Some(2));
        assert_eq!(map.invert(3), None);
    }

    #[test]
    fn rejects_mismatched_topology_arrays() {
        let err = Group::new(
            0,
            vec![0, 1],
            0,
            vec![0],
            vec![0, 0],
            BalanceFlags::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidParam(_)));
    }
}
