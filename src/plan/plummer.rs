//! Plummer: hierarchical alltoallv in three stages — intra-node gather of
//! per-peer counts and buffers to the node leader, an inter-node
//! alltoallv among node leaders, then an intra-node scatter back.
//!
//! Alltoallv plans are never cached (`CollectiveKind::is_cacheable`), so
//! every field here, including the partition-derived `extra` block
//! counts, is computed fresh per invocation from `args`.

use smallvec::smallvec;

use crate::args::{CollectiveArgs, Partition};
use crate::config::Config;
use crate::datatype::Datatype;
use crate::error::{CoreError, Result};
use crate::group::Group;
use crate::plan::builder::{thresholds_for, BuilderTable, EndpointSource, PlanBuilder};
use crate::plan::{EpCounts, Method, Phase, PhaseExtra, Plan};
use crate::wire::{AlgoId, AlltoallvAlgo, CollectiveKind};

fn require_alltoallv<'a>(args: &'a CollectiveArgs<'_>) -> Result<(&'a Partition, &'a Partition, &'a Datatype)> {
    match args {
        CollectiveArgs::Alltoallv {
            send_partition,
            recv_partition,
            dtype,
            ..
        } => Ok((send_partition, recv_partition, dtype)),
        _ => Err(CoreError::InvalidParam("expected alltoallv args".into())),
    }
}

struct PlummerBuilder;

impl PlanBuilder for PlummerBuilder {
    fn build(
        &self,
        group: &Group,
        args: &CollectiveArgs<'_>,
        _config: &Config,
        endpoints: &mut dyn EndpointSource,
    ) -> Result<Plan> {
        let (send_partition, recv_partition, dtype) = require_alltoallv(args)?;
        let elem = dtype.extent();
        let my = group.my_index();
        let thresh = thresholds_for(endpoints, group.id(), group.members()[my])?;
        let local = group.local_members();
        let leader = local.first().copied().unwrap_or(my);
        let node_leaders = group.node_leaders();

        let mut phases = Vec::new();

        // Stage 1: intra-node gather to the leader.
        let mut gather = if my == leader {
            let mut peers = smallvec::SmallVec::<[usize; 8]>::new();
            for &m in local {
                if m != leader {
                    peers.push(m);
                }
            }
            let mut phase = Phase::new(0, Method::GatherWaypoint, thresh);
            let n = peers.len();
            phase.peers = peers;
            phase.ep_counts = EpCounts { total: n, send: 0, recv: n };
            phase
        } else {
            let mut phase = Phase::new(0, Method::SendTerminal, thresh);
            phase.peers = smallvec![leader];
            phase.ep_counts = EpCounts { total: 1, send: 1, recv: 0 };
            phase
        };
        gather.extra = PhaseExtra {
            total_blocks: send_partition.len(),
            is_variable_len: true,
            ..PhaseExtra::default()
        };
        phases.push(gather);

        // Stage 2: inter-node alltoallv among node leaders, run only by leaders.
        if my == leader {
            let mut peers = smallvec::SmallVec::<[usize; 8]>::new();
            for &l in node_leaders {
                if l != leader {
                    peers.push(l);
                }
            }
            let mut phase = Phase::new(1, Method::AlltoallvLadd, thresh);
            let n = peers.len();
            phase.peers = peers;
            phase.ep_counts = EpCounts { total: n, send: n, recv: n };
            phase.extra = PhaseExtra {
                total_blocks: recv_partition.len(),
                is_variable_len: true,
                ..PhaseExtra::default()
            };
            // Each peer leader's slice is this leader's own send range for
            // that rank; shared-memory staging of local members' data into
            // this leader's send buffer happens in the gather stage above.
            phase.per_peer_send_bytes = phase
                .peers
                .iter()
                .map(|&idx| (send_partition.displs[idx] * elem, send_partition.counts[idx] * elem))
                .collect();
            phases.push(phase);
        }

        // Stage 3: intra-node scatter back.
        let next = phases.len() as u8;
        let mut scatter = if my == leader {
            let mut peers = smallvec::SmallVec::<[usize; 8]>::new();
            for &m in local {
                if m != leader {
                    peers.push(m);
                }
            }
            let mut phase = Phase::new(next, Method::ScatterTerminal, thresh);
            let n = peers.len();
            phase.peers = peers;
            phase.ep_counts = EpCounts { total: n, send: n, recv: 0 };
            // The leader scatters each local member's share of the data it
            // received for the whole node in stage 2, keyed by that
            // member's own recv range.
            phase.per_peer_send_bytes = phase
                .peers
                .iter()
                .map(|&idx| (recv_partition.displs[idx] * elem, recv_partition.counts[idx] * elem))
                .collect();
            phase
        } else {
            let mut phase = Phase::new(next, Method::RecvTerminal, thresh);
            phase.peers = smallvec![leader];
            phase.ep_counts = EpCounts { total: 1, send: 0, recv: 1 };
            phase
        };
        scatter.extra = PhaseExtra {
            total_blocks: recv_partition.len(),
            is_variable_len: true,
            ..PhaseExtra::default()
        };
        phases.push(scatter);

        Ok(Plan {
            kind: CollectiveKind::Alltoallv,
            algo: AlgoId::Alltoallv(AlltoallvAlgo::Plummer),
            endpoint_count: group.size().saturating_sub(1),
            phases,
        })
    }
}

/// Registers the Plummer alltoallv builder.
pub fn register(table: &mut BuilderTable) {
    table.register(CollectiveKind::Alltoallv, AlgoId::Alltoallv(AlltoallvAlgo::Plummer), Box::new(PlummerBuilder));
}
