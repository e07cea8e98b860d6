//! Recursive doubling, with the proxy/extra split for non-power-of-two
//! group sizes.
//!
//! For `p = 2^n + r` with `0 <= r < 2^n`, the `2r` low ranks form `r`
//! (proxy, extra) pairs: `extra` relays its contribution to `proxy`,
//! `proxy` runs the power-of-two core on `extra`'s behalf, then relays the
//! final result back. Every other rank already sits in the power-of-two
//! core. At core step `s` a rank's peer is its own translated rank XOR
//! `1 << s`.

use smallvec::smallvec;

use crate::args::CollectiveArgs;
use crate::config::Config;
use crate::error::Result;
use crate::group::Group;
use crate::plan::builder::{thresholds_for, BuilderTable, EndpointSource, PlanBuilder};
use crate::plan::{EpCounts, Method, Phase, Plan};
use crate::transport::Thresholds;
use crate::wire::{AlgoId, AllreduceAlgo, BarrierAlgo, CollectiveKind, GatherAlgo};

/// This rank's place in a recursive-doubling schedule over `size` ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdRole {
    /// Not part of the power-of-two core; relays through `proxy`.
    Extra {
        /// The rank this one relays through.
        proxy: usize,
    },
    /// Part of the core on behalf of `extra`.
    Proxy {
        /// The rank relaying through this one.
        extra: usize,
        /// This rank's index within the power-of-two core.
        new_rank: usize,
    },
    /// Already part of the power-of-two core.
    Base {
        /// This rank's index within the power-of-two core.
        new_rank: usize,
    },
}

fn pow2_core(size: usize) -> usize {
    if size.is_power_of_two() {
        size
    } else {
        size.next_power_of_two() / 2
    }
}

/// Classifies `rank` among `size` ranks.
pub fn classify(rank: usize, size: usize) -> RdRole {
    assert!(size > 0 && rank < size);
    let pow2 = pow2_core(size);
    let r = size - pow2;
    if rank < 2 * r {
        if rank % 2 == 0 {
            RdRole::Proxy {
                extra: rank + 1,
                new_rank: rank / 2,
            }
        } else {
            RdRole::Extra { proxy: rank - 1 }
        }
    } else {
        RdRole::Base { new_rank: rank - r }
    }
}

/// Number of core (power-of-two) exchange steps.
pub fn core_steps(size: usize) -> u32 {
    pow2_core(size).trailing_zeros()
}

/// Translates a core-local rank back to an absolute member index.
pub fn untranslate(new_rank: usize, size: usize) -> usize {
    let r = size - pow2_core(size);
    if new_rank < r {
        new_rank * 2
    } else {
        new_rank + r
    }
}

fn single_peer_phase(step_index: u8, method: Method, peer: usize, send: usize, recv: usize, thresh: Thresholds) -> Phase {
    let mut phase = Phase::new(step_index, method, thresh);
    phase.peers = smallvec![peer];
    phase.ep_counts = EpCounts { total: 1, send, recv };
    phase
}

/// Builds the phase sequence for one rank, parameterized by the method
/// used for the relay legs (send-to-proxy, receive-from-proxy) and for
/// the symmetric core exchanges.
fn build_phases(my: usize, size: usize, relay: (Method, Method), core: Method, thresh: Thresholds) -> Vec<Phase> {
    let mut phases = Vec::new();
    let mut idx = 0u8;
    match classify(my, size) {
        RdRole::Extra { proxy } => {
            phases.push(single_peer_phase(idx, relay.0, proxy, 1, 0, thresh));
            idx += 1;
            phases.push(single_peer_phase(idx, relay.1, proxy, 0, 1, thresh));
        }
        RdRole::Proxy { extra, new_rank } => {
            phases.push(single_peer_phase(idx, relay.1, extra, 0, 1, thresh));
            idx += 1;
            for s in 0..core_steps(size) {
                let peer = untranslate(new_rank ^ (1 << s), size);
                phases.push(single_peer_phase(idx, core, peer, 1, 1, thresh));
                idx += 1;
            }
            phases.push(single_peer_phase(idx, relay.0, extra, 1, 0, thresh));
        }
        RdRole::Base { new_rank } => {
            for s in 0..core_steps(size) {
                let peer = untranslate(new_rank ^ (1 << s), size);
                phases.push(single_peer_phase(idx, core, peer, 1, 1, thresh));
                idx += 1;
            }
        }
    }
    phases
}

struct BarrierRecursiveBuilder;

impl PlanBuilder for BarrierRecursiveBuilder {
    fn build(
        &self,
        group: &Group,
        _args: &CollectiveArgs<'_>,
        _config: &Config,
        endpoints: &mut dyn EndpointSource,
    ) -> Result<Plan> {
        let size = group.size();
        let my = group.my_index();
        let thresh = thresholds_for(endpoints, group.id(), group.members()[my])?;
        let phases = build_phases(my, size, (Method::SendTerminal, Method::RecvTerminal), Method::Exchange, thresh);
        Ok(Plan {
            kind: CollectiveKind::Barrier,
            algo: AlgoId::Barrier(BarrierAlgo::RecursiveDoubling),
            endpoint_count: size.saturating_sub(1),
            phases,
        })
    }
}

struct AllreduceRecursiveBuilder;

impl PlanBuilder for AllreduceRecursiveBuilder {
    fn build(
        &self,
        group: &Group,
        _args: &CollectiveArgs<'_>,
        _config: &Config,
        endpoints: &mut dyn EndpointSource,
    ) -> Result<Plan> {
        let size = group.size();
        let my = group.my_index();
        let thresh = thresholds_for(endpoints, group.id(), group.members()[my])?;
        let phases = build_phases(
            my,
            size,
            (Method::SendTerminal, Method::ReduceTerminal),
            Method::ReduceRecursive,
            thresh,
        );
        Ok(Plan {
            kind: CollectiveKind::Allreduce,
            algo: AlgoId::Allreduce(AllreduceAlgo::RecursiveDoubling),
            endpoint_count: size.saturating_sub(1),
            phases,
        })
    }
}

struct AllgatherRecursiveBuilder;

impl PlanBuilder for AllgatherRecursiveBuilder {
    fn build(
        &self,
        group: &Group,
        _args: &CollectiveArgs<'_>,
        _config: &Config,
        endpoints: &mut dyn EndpointSource,
    ) -> Result<Plan> {
        let size = group.size();
        let my = group.my_index();
        let thresh = thresholds_for(endpoints, group.id(), group.members()[my])?;
        let phases = build_phases(
            my,
            size,
            (Method::SendTerminal, Method::RecvTerminal),
            Method::AllgatherRecursive,
            thresh,
        );
        Ok(Plan {
            kind: CollectiveKind::Allgatherv,
            algo: AlgoId::Gather(GatherAlgo::RecursiveDoubling),
            endpoint_count: size.saturating_sub(1),
            phases,
        })
    }
}

/// Registers recursive-doubling builders for barrier, allreduce, and
/// allgatherv.
pub fn register(table: &mut BuilderTable) {
    table.register(
        CollectiveKind::Barrier,
        AlgoId::Barrier(BarrierAlgo::RecursiveDoubling),
        Box::new(BarrierRecursiveBuilder),
    );
    table.register(
        CollectiveKind::Allreduce,
        AlgoId::Allreduce(AllreduceAlgo::RecursiveDoubling),
        Box::new(AllreduceRecursiveBuilder),
    );
    table.register(
        CollectiveKind::Allgatherv,
        AlgoId::Gather(GatherAlgo::RecursiveDoubling),
        Box::new(AllgatherRecursiveBuilder),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_of_two_has_no_extras() {
        for rank in 0..8 {
            assert!(matches!(classify(rank, 8), RdRole::Base { .. }));
        }
        assert_eq!(core_steps(8), 3);
    }

    #[test]
    fn non_power_of_two_splits_low_ranks_into_pairs() {
        // size=11: pow2=8, r=3, ranks 0..6 pair up, 6..11 are base.
        assert!(matches!(classify(0, 11), RdRole::Proxy { extra: 1, new_rank: 0 }));
        assert!(matches!(classify(1, 11), RdRole::Extra { proxy: 0 }));
        assert!(matches!(classify(6, 11), RdRole::Base { new_rank: 3 }));
        assert_eq!(core_steps(11), 3);
    }

    #[test]
    fn untranslate_inverts_classify_for_base_ranks() {
        let size = 13;
        for rank in 6..size {
            if let RdRole::Base { new_rank } = classify(rank, size) {
                assert_eq!(untranslate(new_rank, size), rank);
            }
        }
    }

    #[test]
    fn every_core_step_pairs_symmetrically() {
        let size = 16;
        for rank in 0..size {
            if let RdRole::Base { new_rank } = classify(rank, size) {
                for s in 0..core_steps(size) {
                    let peer = untranslate(new_rank ^ (1 << s), size);
                    if let RdRole::Base { new_rank: peer_new } = classify(peer, size) {
                        assert_eq!(peer_new ^ (1 << s), new_rank);
                    }
                }
            }
        }
    }
}
