//! Ring reduce-scatter and allgather.
//!
//! `count` is split into `p` blocks (the low `count mod p` blocks get one
//! extra element). Each rank sends block `(me - s) mod p` and receives
//! block `(me - s - 1) mod p` from its left neighbor at reduce-scatter
//! step `s`; the allgather phase runs `p - 1` more steps rotating the
//! opposite direction. Block sizes depend on the live element count, so
//! block indices here are relative (rotation offsets); absolute lengths
//! are resolved by the step executor from the live
//! [`crate::args::CollectiveArgs`].

use smallvec::smallvec;

use crate::args::CollectiveArgs;
use crate::config::Config;
use crate::error::Result;
use crate::group::Group;
use crate::plan::builder::{thresholds_for, BuilderTable, EndpointSource, PlanBuilder};
use crate::plan::{EpCounts, Method, Phase, PhaseExtra, Plan};
use crate::transport::Thresholds;
use crate::wire::{AlgoId, AllreduceAlgo, CollectiveKind, GatherAlgo};

fn ring_neighbors(my: usize, size: usize) -> (usize, usize) {
    let left = (my + size - 1) % size;
    let right = (my + 1) % size;
    (left, right)
}

fn ring_phase(
    step_index: u8,
    method: Method,
    left: usize,
    right: usize,
    block_index: usize,
    size: usize,
    thresh: Thresholds,
    block_bytes: Option<(usize, usize)>,
) -> Phase {
    let mut phase = Phase::new(step_index, method, thresh);
    phase.peers = smallvec![right, left];
    phase.ep_counts = EpCounts { total: 2, send: 1, recv: 1 };
    phase.extra = PhaseExtra {
        block_index,
        block_count: 1,
        total_blocks: size,
        is_variable_len: block_bytes.is_some(),
        ..PhaseExtra::default()
    };
    if let Some(bytes) = block_bytes {
        phase.per_peer_send_bytes = smallvec![bytes];
    }
    phase
}

struct RingAllreduceBuilder;

impl PlanBuilder for RingAllreduceBuilder {
    fn build(
        &self,
        group: &Group,
        _args: &CollectiveArgs<'_>,
        _config: &Config,
        endpoints: &mut dyn EndpointSource,
    ) -> Result<Plan> {
        let size = group.size();
        let my = group.my_index();
        let (left, right) = ring_neighbors(my, size);
        let thresh = thresholds_for(endpoints, group.id(), group.members()[my])?;
        let mut phases = Vec::with_capacity(2 * (size - 1));
        for s in 0..size.saturating_sub(1) {
            let block = (my + size - s) % size;
            phases.push(ring_phase(s as u8, Method::ReduceScatterRing, left, right, block, size, thresh, None));
        }
        for s in 0..size.saturating_sub(1) {
            let block = (my + 1 + size - s) % size;
            phases.push(ring_phase(
                (size - 1 + s) as u8,
                Method::AllgatherRing,
                left,
                right,
                block,
                size,
                thresh,
                None,
            ));
        }
        Ok(Plan {
            kind: CollectiveKind::Allreduce,
            algo: AlgoId::Allreduce(AllreduceAlgo::Ring),
            endpoint_count: 2.min(size.saturating_sub(1)),
            phases,
        })
    }
}

struct RingAllgatherBuilder;

impl PlanBuilder for RingAllgatherBuilder {
    fn build(
        &self,
        group: &Group,
        args: &CollectiveArgs<'_>,
        _config: &Config,
        endpoints: &mut dyn EndpointSource,
    ) -> Result<Plan> {
        let recv_partition = match args {
            CollectiveArgs::Allgatherv { recv_partition, dtype, .. } => Some((recv_partition, dtype.extent())),
            _ => None,
        };
        let size = group.size();
        let my = group.my_index();
        let (left, right) = ring_neighbors(my, size);
        let thresh = thresholds_for(endpoints, group.id(), group.members()[my])?;
        let mut phases = Vec::with_capacity(size.saturating_sub(1));
        for s in 0..size.saturating_sub(1) {
            let block = (my + size - s) % size;
            let block_bytes = recv_partition.map(|(p, elem)| (p.displs[block] * elem, p.counts[block] * elem));
            phases.push(ring_phase(s as u8, Method::AllgatherRing, left, right, block, size, thresh, block_bytes));
        }
        Ok(Plan {
            kind: CollectiveKind::Allgatherv,
            algo: AlgoId::Gather(GatherAlgo::Ring),
            endpoint_count: 2.min(size.saturating_sub(1)),
            phases,
        })
    }
}

/// Registers the ring allreduce and ring allgatherv builders.
pub fn register(table: &mut BuilderTable) {
    table.register(CollectiveKind::Allreduce, AlgoId::Allreduce(AllreduceAlgo::Ring), Box::new(RingAllreduceBuilder));
    table.register(CollectiveKind::Allgatherv, AlgoId::Gather(GatherAlgo::Ring), Box::new(RingAllgatherBuilder));
}
