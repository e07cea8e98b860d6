//! Bruck-style broadcast: `ceil(log2(p))` steps, each exchanging the
//! blocks whose bit `s` is set with the peer at distance `2^s`.
//!
//! Base §4.2.5 describes Bruck for allgather/alltoall generally; this
//! crate's algorithm-id space (see [`crate::wire::BcastAlgo`]) exposes it
//! as a broadcast algorithm for large messages or high PPN, where it
//! amortizes fan-out better than a k-nomial tree. The executor treats the
//! broadcast payload as a single block that every rank forwards along the
//! same doubling-distance schedule used for allgather.

use smallvec::smallvec;

use crate::args::CollectiveArgs;
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::group::Group;
use crate::plan::builder::{thresholds_for, BuilderTable, EndpointSource, PlanBuilder};
use crate::plan::{EpCounts, Method, Phase, PhaseExtra, Plan};
use crate::wire::{AlgoId, BcastAlgo, CollectiveKind};

fn log2_ceil(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        (usize::BITS - (n - 1).leading_zeros()).max(1)
    }
}

struct BcastBruckBuilder;

impl PlanBuilder for BcastBruckBuilder {
    fn build(
        &self,
        group: &Group,
        args: &CollectiveArgs<'_>,
        _config: &Config,
        endpoints: &mut dyn EndpointSource,
    ) -> Result<Plan> {
        let root = args
            .root()
            .and_then(|r| group.members().iter().position(|&m| m == r))
            .ok_or_else(|| CoreError::InvalidParam("bcast requires a root".into()))?;
        let size = group.size();
        let my = group.my_index();
        let thresh = thresholds_for(endpoints, group.id(), group.members()[my])?;
        // Rotate so the root is rank 0 for the doubling schedule.
        let rotated = (my + size - root) % size;
        let steps = log2_ceil(size);
        let mut phases = Vec::with_capacity(steps as usize);
        for s in 0..steps {
            let dist = 1usize << s;
            if dist >= size {
                break;
            }
            let send_to = (rotated + size - dist % size) % size;
            let recv_from = (rotated + dist) % size;
            let mut phase = Phase::new(s as u8, Method::AllgatherBruck, thresh);
            let send_target = (send_to + root) % size;
            let recv_source = (recv_from + root) % size;
            phase.peers = smallvec![send_target, recv_source];
            phase.ep_counts = EpCounts { total: 2, send: 1, recv: 1 };
            phase.extra = PhaseExtra {
                packed_rank: Some(dist),
                ..PhaseExtra::default()
            };
            phases.push(phase);
        }
        Ok(Plan {
            kind: CollectiveKind::Bcast,
            algo: AlgoId::Bcast(BcastAlgo::Bruck),
            endpoint_count: 2.min(size.saturating_sub(1)),
            phases,
        })
    }
}

/// Registers the Bruck broadcast builder.
pub fn register(table: &mut BuilderTable) {
    table.register(CollectiveKind::Bcast, AlgoId::Bcast(BcastAlgo::Bruck), Box::new(BcastBruckBuilder));
}
