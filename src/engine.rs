//! The engine: owns the plan cache, the builder table, and per-group
//! executor state, and is the entry point an embedder drives a
//! collective through.
//!
//! One `Engine` wraps one `Transport` connection. Per-group state (the
//! active-message slot table and the resend list) lives here rather than
//! on `Group` itself, since `Group` is pure topology data shared freely
//! while slots and resend lists are executor-private and group-id-keyed.

use std::collections::HashMap;
use std::sync::Arc;

use crate::args::CollectiveArgs;
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::executor::demux::SlotTable;
use crate::executor::progress::ResendList;
use crate::executor::{execute_step, on_completion, Op, StepOutcome};
use crate::group::{Group, GroupId};
use crate::plan::builder::BuilderTable;
use crate::plan::feasibility::{run_to_fixed_point, FallbackTable};
use crate::plan::select;
use crate::plan::{Plan, PlanCache, PlanKey};
use crate::transport::Transport;
use crate::wire::{AlgoId, AllreduceAlgo, BarrierAlgo, CollectiveKind};
use tracing::{debug, trace, warn};

/// Per-group executor-private state: the AM slot table and the resend
/// list for sends deferred on `NO_RESOURCE`.
#[derive(Debug, Default)]
struct GroupState {
    slots: SlotTable,
    resend: ResendList<u8>,
    next_coll_id: u8,
}

impl GroupState {
    fn alloc_coll_id(&mut self) -> u8 {
        let id = self.next_coll_id;
        self.next_coll_id = self.next_coll_id.wrapping_add(1);
        id
    }
}

/// Owns the plan cache, the algorithm-builder table, the feasibility
/// fallback table, and one `Transport` connection, and drives collective
/// triggers end to end.
pub struct Engine<T: Transport> {
    transport: T,
    config: Config,
    builders: BuilderTable,
    fallback: FallbackTable,
    cache: PlanCache,
    groups: HashMap<GroupId, GroupState>,
}

impl<T: Transport> Engine<T> {
    /// Builds an engine over `transport`, with the default builder table
    /// and fallback edges, and the given tuning configuration.
    pub fn new(transport: T, config: Config) -> Self {
        Engine {
            transport,
            config,
            builders: BuilderTable::with_defaults(),
            fallback: FallbackTable::with_defaults(),
            cache: PlanCache::new(),
            groups: HashMap::new(),
        }
    }

    /// The transport this engine drives, for the embedder to register
    /// memory or query connection state directly.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Current tuning configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn group_state(&mut self, group: GroupId) -> &mut GroupState {
        self.groups.entry(group).or_default()
    }

    fn auto_select(&self, group: &Group, args: &CollectiveArgs<'_>) -> AlgoId {
        if let Some(forced) = forced_algorithm(&self.config, args.kind()) {
            return forced;
        }
        let bytes = message_bytes(args);
        let ppn = group.num_local_procs();
        let nodes = group.node_cnt();
        match args.kind() {
            CollectiveKind::Barrier => AlgoId::Barrier(BarrierAlgo::Binomial),
            CollectiveKind::Bcast => AlgoId::Bcast(select::select_bcast(bytes, ppn)),
            CollectiveKind::Reduce => AlgoId::Allreduce(AllreduceAlgo::BinomialTree),
            CollectiveKind::Allreduce => AlgoId::Allreduce(select::select_allreduce(bytes, ppn, nodes)),
            CollectiveKind::Scatterv | CollectiveKind::Gatherv => AlgoId::Gather(select::select_gather(bytes, nodes, false)),
            CollectiveKind::Allgatherv => AlgoId::Gather(select::select_gather(bytes, nodes, true)),
            CollectiveKind::Alltoallv => AlgoId::Alltoallv(crate::wire::AlltoallvAlgo::Ladd),
        }
    }

    /// Resolves the algorithm for this invocation: a user override if the
    /// config names one, else auto-selection, then feasibility fallback
    /// to a fixed point.
    fn resolve_algorithm(&self, group: &Group, args: &CollectiveArgs<'_>) -> Result<AlgoId> {
        let chosen = self.auto_select(group, args);
        let resolved = run_to_fixed_point(chosen, group, args, &self.config, &self.fallback).map_err(|(algo, check)| {
            warn!(kind = ?args.kind(), ?algo, check = check_name(check), "no fallback registered, algorithm refused");
            CoreError::Unsupported {
                kind: args.kind(),
                algo,
                reason: check_name(check),
            }
        })?;
        if resolved != chosen {
            debug!(kind = ?args.kind(), from = ?chosen, to = ?resolved, "feasibility fallback rewrote algorithm");
        }
        Ok(resolved)
    }

    fn plan_for(&mut self, group: &Group, args: &CollectiveArgs<'_>) -> Result<Arc<Plan>> {
        let algo = self.resolve_algorithm(group, args)?;
        let key = PlanKey {
            kind: args.kind(),
            algo,
            root: args.root(),
            dtype_contig: !matches!(args, CollectiveArgs::Barrier) && args.datatype().is_contiguous(),
        };
        if let Some(plan) = self.cache.get(&key) {
            return Ok(plan);
        }
        let builder = self
            .builders
            .get(key.kind, algo)
            .ok_or(CoreError::Unsupported { kind: key.kind, algo, reason: "no builder registered" })?;
        let plan = Arc::new(builder.build(group, args, &self.config, &mut self.transport)?);
        self.cache.insert(key, plan.clone());
        Ok(plan)
    }

    /// Builds (or fetches) a plan and schedules a fresh op for it. The
    /// returned op has not executed any steps yet; drive it with
    /// [`Engine::drive`] and [`Engine::progress`].
    pub fn trigger(&mut self, group: &Group, args: &CollectiveArgs<'_>) -> Result<Op> {
        let plan = self.plan_for(group, args)?;
        let bytes = message_bytes(args);
        let dtype_size = if matches!(args, CollectiveArgs::Barrier) { 0 } else { args.datatype().extent() };
        let coll_id = self.group_state(group.id()).alloc_coll_id();
        let _span = tracing::span!(tracing::Level::DEBUG, "collective", kind = ?args.kind(), coll_id, group = group.id(), phases = plan.phases.len()).entered();
        trace!("op scheduled");
        Ok(Op::new(coll_id, plan, bytes, dtype_size))
    }

    /// Drives `op`'s current step's send side once. `am_id` is the
    /// active-message id the embedder chose for this collective kind
    /// (typically [`crate::transport::am_id_for`]); `payload` is the
    /// bytes to send this step, already sliced by the caller from the
    /// user's buffer.
    pub fn drive(&mut self, group_id: GroupId, am_id: u8, op: &mut Op, payload: &[u8], endpoints: &[T::Endpoint]) -> Result<StepOutcome> {
        match execute_step(&mut self.transport, endpoints, group_id, am_id, op, payload) {
            Ok(outcome) => Ok(outcome),
            Err(CoreError::NoResource { endpoint_index, step_index }) => {
                trace!(coll_id = op.request.coll_id, endpoint_index, step_index, "deferring send, no transport resource");
                self.group_state(group_id).resend.push(op.request.coll_id);
                Ok(StepOutcome::InProgress)
            }
            Err(e) => Err(e),
        }
    }

    /// Records that one expected receive or zero-copy send completion
    /// landed for `op`'s current step.
    pub fn complete_one(&mut self, op: &mut Op) -> StepOutcome {
        on_completion(op)
    }

    /// Marks `group_id`'s demux slot for `coll_id` as expecting
    /// `match_key` ([`crate::wire::WireHeader::match_key`], excluding
    /// `remote_offset` so every fragment of the step matches the same
    /// posted receiver), returning any arrival that was already staged
    /// ahead of this post.
    pub fn post_receiver(&mut self, group_id: GroupId, coll_id: u8, match_key: u32) -> Option<crate::executor::demux::MessageDescriptor> {
        self.group_state(group_id).slots.post_receiver(coll_id, match_key)
    }

    /// Clears the expected match key for `coll_id`'s slot, once its
    /// receive side has been fully satisfied.
    pub fn clear_receiver(&mut self, group_id: GroupId, coll_id: u8) {
        self.group_state(group_id).slots.clear_receiver(coll_id);
    }

    /// Routes one arrived active message to the posted receiver for its
    /// `(coll_id, step_idx)`, or stages it if none is posted yet. The
    /// caller reads `header.remote_offset` off the returned descriptor to
    /// place the payload — it is never part of the match itself.
    pub fn on_message(&mut self, group_id: GroupId, header: crate::wire::WireHeader, payload: &[u8]) -> crate::executor::demux::DemuxOutcome {
        crate::executor::demux::on_arrival(&mut self.group_state(group_id).slots, header, payload)
    }

    /// Runs one progress tick for `group_id`: retries every deferred
    /// send, bounded by `config.max_msg_list_size`. `retry` re-attempts
    /// one op's current step and returns whether it still needs another
    /// resend pass.
    pub fn progress<F>(&mut self, group_id: GroupId, mut retry: F)
    where
        F: FnMut(u8) -> bool,
    {
        let max = self.config.max_msg_list_size;
        let pending_before = self.group_state(group_id).resend.len();
        let progressed = self.group_state(group_id).resend.tick(max, |coll_id| if retry(coll_id) { Some(coll_id) } else { None });
        if pending_before > 0 {
            debug!(group = group_id, pending_before, progressed, "progress tick");
        }
    }

    /// Drops cached plans and per-group executor state for `group_id`, as
    /// happens on group destroy.
    pub fn destroy_group(&mut self, group_id: GroupId) {
        self.groups.remove(&group_id);
    }
}

fn forced_algorithm(config: &Config, kind: CollectiveKind) -> Option<AlgoId> {
    match kind {
        CollectiveKind::Barrier => config.barrier_algorithm.map(AlgoId::Barrier),
        CollectiveKind::Bcast => config.bcast_algorithm.map(AlgoId::Bcast),
        CollectiveKind::Allreduce => config.allreduce_algorithm.map(AlgoId::Allreduce),
        _ => None,
    }
}

fn message_bytes(args: &CollectiveArgs<'_>) -> usize {
    match args {
        CollectiveArgs::Barrier => 0,
        CollectiveArgs::Bcast { count, dtype, .. } => count * dtype.extent(),
        CollectiveArgs::Reduce { count, dtype, .. } | CollectiveArgs::Allreduce { count, dtype, .. } => count * dtype.extent(),
        CollectiveArgs::Scatterv { recv_count, dtype, .. } => recv_count * dtype.extent(),
        CollectiveArgs::Gatherv { send_count, dtype, .. } => send_count * dtype.extent(),
        CollectiveArgs::Allgatherv { send_count, dtype, .. } => send_count * dtype.extent(),
        CollectiveArgs::Alltoallv { send_partition, dtype, .. } => send_partition.total() * dtype.extent(),
    }
}

fn check_name(check: crate::plan::feasibility::Check) -> &'static str {
    use crate::plan::feasibility::Check::*;
    match check {
        AlgoMissing => "algo-missing",
        NonContigDtype => "non-contig-dt",
        NonCommutative => "non-commutative",
        NapUnsupported => "NAP-unsupported",
        RabenseifnerUnsupported => "Rabenseifner-unsupported",
        NodeAwareRabenseifnerUnsupported => "node-aware-Raben-unsupported",
        SocketAwareRabenseifnerUnsupported => "socket-aware-Raben-unsupported",
        BindToNone => "bind-to-none",
        PpnUnbalanced => "ppn-unbalanced",
        NodeRanksNoncontiguous => "node-ranks-noncontiguous",
        PpsUnbalanced => "pps-unbalanced",
        SocketRanksNoncontiguous => "socket-ranks-noncontiguous",
        DtypeExceedsThreshold => "dtype-exceeds-threshold",
        PhaseSegmentationRequired => "phase-segmentation-required",
        IncUnavailable => "INC-unavailable",
        InPlaceUnsupported => "in-place-unsupported",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_barrier_algorithm_bypasses_selection() {
        let mut config = Config::default();
        config.barrier_algorithm = Some(BarrierAlgo::Knomial);
        assert_eq!(forced_algorithm(&config, CollectiveKind::Barrier), Some(AlgoId::Barrier(BarrierAlgo::Knomial)));
    }

    #[test]
    fn unforced_kind_returns_none() {
        let config = Config::default();
        assert_eq!(forced_algorithm(&config, CollectiveKind::Reduce), None);
    }
}
