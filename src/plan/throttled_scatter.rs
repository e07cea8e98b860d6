//! Direct ("Ladd") and throttled-scatter alltoallv.
//!
//! Ladd is the naive baseline: every rank exchanges directly with every
//! other rank in a single phase. Throttled scatter caps how many peers
//! are contacted at once, batching the remaining exchanges into
//! successive phases so that a rank never has more than
//! `config.ladd_throttled_factor` outstanding sends — useful once alltoallv
//! fan-out would otherwise blow past the transport's unexpected-message
//! budget. The per-rank peer order is shuffled by a small deterministic
//! hash of the rank so that concurrent ranks don't all throttle against
//! the same neighbor first.

use smallvec::SmallVec;

use crate::args::{CollectiveArgs, Partition};
use crate::config::Config;
use crate::datatype::Datatype;
use crate::error::{CoreError, Result};
use crate::group::Group;
use crate::plan::builder::{thresholds_for, BuilderTable, EndpointSource, PlanBuilder};
use crate::plan::{EpCounts, Method, Phase, PhaseExtra, Plan};
use crate::transport::Thresholds;
use crate::wire::{AlgoId, AlltoallvAlgo, CollectiveKind};

fn require_alltoallv<'a>(args: &'a CollectiveArgs<'_>) -> Result<(&'a Partition, &'a Datatype)> {
    match args {
        CollectiveArgs::Alltoallv { send_partition, dtype, .. } => Ok((send_partition, dtype)),
        _ => Err(CoreError::InvalidParam("expected alltoallv args".into())),
    }
}

/// Deterministic xorshift-style mix, used only to vary the batch order
/// per rank. Not cryptographic, not seeded from entropy: two runs with
/// the same group layout always produce the same schedule, which keeps
/// plans reproducible for testing.
fn mix(rank: usize, salt: usize) -> usize {
    let mut x = (rank as u64).wrapping_add(salt as u64).wrapping_mul(0x9E3779B97F4A7C15);
    x ^= x >> 33;
    x = x.wrapping_mul(0xFF51AFD7ED558CCD);
    x ^= x >> 33;
    x as usize
}

fn shuffled_peers(my: usize, size: usize) -> Vec<usize> {
    let mut peers: Vec<usize> = (0..size).filter(|&p| p != my).collect();
    peers.sort_by_key(|&p| mix(my, p));
    peers
}

fn batch_phase(
    step_index: u8,
    peers: &[usize],
    thresh: Thresholds,
    batch_index: usize,
    batch_count: usize,
    send_partition: &Partition,
    dtype: &Datatype,
) -> Phase {
    let mut phase = Phase::new(step_index, Method::AlltoallvLadd, thresh);
    phase.peers = peers.iter().copied().collect::<SmallVec<[usize; 8]>>();
    let n = peers.len();
    phase.ep_counts = EpCounts { total: n, send: n, recv: n };
    phase.extra = PhaseExtra {
        block_index: batch_index,
        block_count: 1,
        total_blocks: batch_count,
        is_variable_len: true,
        ..PhaseExtra::default()
    };
    let elem = dtype.extent();
    phase.per_peer_send_bytes = peers
        .iter()
        .map(|&idx| (send_partition.displs[idx] * elem, send_partition.counts[idx] * elem))
        .collect();
    phase
}

struct LaddBuilder;

impl PlanBuilder for LaddBuilder {
    fn build(
        &self,
        group: &Group,
        args: &CollectiveArgs<'_>,
        _config: &Config,
        endpoints: &mut dyn EndpointSource,
    ) -> Result<Plan> {
        let (send_partition, dtype) = require_alltoallv(args)?;
        let size = group.size();
        let my = group.my_index();
        let thresh = thresholds_for(endpoints, group.id(), group.members()[my])?;
        let peers: Vec<usize> = (0..size).filter(|&p| p != my).collect();
        let mut phases = Vec::new();
        if !peers.is_empty() {
            phases.push(batch_phase(0, &peers, thresh, 0, 1, send_partition, dtype));
        }
        Ok(Plan {
            kind: CollectiveKind::Alltoallv,
            algo: AlgoId::Alltoallv(AlltoallvAlgo::Ladd),
            endpoint_count: size.saturating_sub(1),
            phases,
        })
    }
}

struct ThrottledScatterBuilder;

impl PlanBuilder for ThrottledScatterBuilder {
    fn build(
        &self,
        group: &Group,
        args: &CollectiveArgs<'_>,
        config: &Config,
        endpoints: &mut dyn EndpointSource,
    ) -> Result<Plan> {
        let (send_partition, dtype) = require_alltoallv(args)?;
        let size = group.size();
        let my = group.my_index();
        let thresh = thresholds_for(endpoints, group.id(), group.members()[my])?;
        let peers = shuffled_peers(my, size);
        let throttle = if config.ladd_throttled_factor == 0 {
            peers.len().max(1)
        } else {
            config.ladd_throttled_factor as usize
        };
        let batches: Vec<&[usize]> = peers.chunks(throttle).collect();
        let batch_count = batches.len();
        let mut phases = Vec::with_capacity(batch_count);
        for (i, batch) in batches.into_iter().enumerate() {
            phases.push(batch_phase(i as u8, batch, thresh, i, batch_count, send_partition, dtype));
        }
        Ok(Plan {
            kind: CollectiveKind::Alltoallv,
            algo: AlgoId::Alltoallv(AlltoallvAlgo::ThrottledScatter),
            endpoint_count: throttle.min(size.saturating_sub(1)),
            phases,
        })
    }
}

/// Registers the direct and throttled alltoallv builders.
pub fn register(table: &mut BuilderTable) {
    table.register(CollectiveKind::Alltoallv, AlgoId::Alltoallv(AlltoallvAlgo::Ladd), Box::new(LaddBuilder));
    table.register(
        CollectiveKind::Alltoallv,
        AlgoId::Alltoallv(AlltoallvAlgo::ThrottledScatter),
        Box::new(ThrottledScatterBuilder),
    );
}
