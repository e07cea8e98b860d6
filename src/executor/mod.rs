//! The step executor: drives one `Op` (a scheduled collective instance)
//! through its plan's phases, fragment by fragment, until every step
//! completes or a fatal error is hit.
//!
//! The executor never touches a caller's raw buffers directly — that
//! unsafe boundary belongs to [`crate::engine`], which slices
//! [`crate::datatype::DynBuffer`]/`DynBufferMut` into the `&[u8]` this
//! module sends and the `&mut [u8]` [`demux`] writes into. Keeping the
//! state machine itself free of raw pointers makes it plain safe Rust,
//! the same split the teacher draws between `DynBuffer::from_raw`'s
//! narrow unsafe block and the safe reduction/collective APIs built on it.

pub mod demux;
pub mod fragment;
pub mod progress;

use smallvec::SmallVec;

use crate::error::{CoreError, Result};
use crate::executor::fragment::{plan_fragments, FragmentPlan, SendMode};
use crate::group::GroupId;
use crate::plan::{Method, Phase, Plan};
use crate::transport::{IoSlice, Transport};
use crate::wire::WireHeader;

use std::sync::Arc;

/// Direction/shape flags carried by a step, reproduced as plain booleans
/// rather than a C-style bit field — each flag is independently
/// meaningful and Rust has no packing concern forcing them into one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepFlags {
    /// First step of the op.
    pub first_step: bool,
    /// Last step of the op.
    pub last_step: bool,
    /// Send runs, then a receive is expected afterward (symmetric exchange).
    pub recv_after_send: bool,
    /// Must wait for every expected receive before sending upward.
    pub recv_before_send1: bool,
    /// Must wait for one specific receive before any send.
    pub recv1_before_send: bool,
    /// Each endpoint gets a distinct slice length (scatter-shaped).
    pub length_per_request: bool,
    /// Only one endpoint is touched this step.
    pub single_endpoint: bool,
    /// The payload spans more than one fragment.
    pub fragmented: bool,
    /// Fragments are forwarded as they arrive rather than after the whole
    /// buffer lands.
    pub pipelined: bool,
}

/// Derives the flag set implied by a phase's method. A handful of methods
/// genuinely need no flags (e.g. `SendTerminal`); this is a lookup, not a
/// callback, mirroring the "tagged `Method`, not dynamic dispatch" design.
fn flags_for(method: Method, fragment: &FragmentPlan) -> StepFlags {
    let fragmented = fragment.is_fragmented();
    let base = StepFlags {
        fragmented,
        ..StepFlags::default()
    };
    match method {
        Method::SendTerminal | Method::ScatterTerminal => StepFlags {
            length_per_request: matches!(method, Method::ScatterTerminal),
            ..base
        },
        Method::RecvTerminal | Method::ReduceTerminal => base,
        Method::BcastWaypoint | Method::ScatterWaypoint => StepFlags {
            recv1_before_send: true,
            pipelined: matches!(method, Method::BcastWaypoint),
            ..base
        },
        Method::GatherWaypoint | Method::ReduceWaypoint => StepFlags {
            recv_before_send1: true,
            ..base
        },
        Method::ReduceRecursive
        | Method::ReduceScatterRecursive
        | Method::AllgatherRecursive
        | Method::ReduceScatterRing
        | Method::AllgatherRing
        | Method::Exchange => StepFlags {
            recv_after_send: true,
            single_endpoint: true,
            ..base
        },
        Method::AllgatherBruck | Method::AlltoallBruck => StepFlags {
            recv_after_send: true,
            ..base
        },
        Method::AlltoallvLadd | Method::AlltoallvPlummer => StepFlags {
            length_per_request: true,
            ..base
        },
    }
}

/// Outstanding-completion counter: the combined count of expected
/// receive callbacks and, for zero-copy sends, send-completion
/// callbacks. The step is done exactly when this reaches zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingCounter(pub u32);

impl PendingCounter {
    /// Decrements by one, returning whether the counter just reached zero.
    pub fn decrement(&mut self) -> bool {
        self.0 = self.0.saturating_sub(1);
        self.0 == 0
    }

    /// Whether the counter is already at zero.
    pub fn is_done(self) -> bool {
        self.0 == 0
    }
}

/// Per-step state, restartable at `iter_ep`/`iter_offset` after a
/// transient back-pressure return.
#[derive(Debug, Clone)]
pub struct Step {
    /// Index into the plan's phase list this step executes.
    pub phase_index: usize,
    /// Flags derived from the phase's method.
    pub flags: StepFlags,
    /// Fragmentation decision for the send side.
    pub send_fragment: FragmentPlan,
    /// Fragmentation decision for the receive side.
    pub recv_fragment: FragmentPlan,
    /// Next endpoint index to send to, resumed after `NO_RESOURCE`.
    pub iter_ep: usize,
    /// Next fragment offset to send within the current endpoint.
    pub iter_offset: usize,
    /// Outstanding completions before this step is done.
    pub pending: PendingCounter,
    /// Per-fragment resend state for pipelined steps: `true` means the
    /// fragment still needs a resend attempt.
    pub fragment_pending: SmallVec<[bool; 8]>,
    /// Whether the send side has finished iterating every endpoint.
    pub send_done: bool,
}

impl Step {
    /// Builds step state for `phase`, given the logical buffer length and
    /// element size that will be sent/received this step.
    pub fn new(phase_index: usize, phase: &Phase, buffer_length: usize, dtype_size: usize, first_step: bool, last_step: bool) -> Self {
        let send_fragment = plan_fragments(buffer_length, dtype_size, phase.send_thresh);
        let recv_fragment = plan_fragments(buffer_length, dtype_size, phase.recv_thresh);
        let mut flags = flags_for(phase.method, &send_fragment);
        flags.first_step = first_step;
        flags.last_step = last_step;

        let recv_units = recv_fragment.fragments.max(1) * phase.ep_counts.recv;
        let send_completions = if send_fragment.mode == SendMode::Zcopy {
            send_fragment.fragments.max(1) * phase.ep_counts.send
        } else {
            0
        };
        let pending = PendingCounter((recv_units + send_completions) as u32);

        Step {
            phase_index,
            flags,
            send_fragment,
            recv_fragment,
            iter_ep: 0,
            iter_offset: 0,
            pending,
            fragment_pending: SmallVec::from_elem(false, send_fragment.fragments.max(1)),
            send_done: phase.ep_counts.send == 0,
        }
    }

    /// Whether this step has nothing left to wait for.
    pub fn is_complete(&self) -> bool {
        self.send_done && self.pending.is_done()
    }
}

/// In-flight handle for a running op, carrying the counter every send
/// completion and receive callback decrements.
#[derive(Debug, Clone)]
pub struct Request {
    /// Low 8 bits of the circular op-id counter (`coll_id mod 256`).
    pub coll_id: u8,
    /// Index of the step currently executing.
    pub current_step: usize,
    /// Whether the current step's expected receive has arrived.
    pub recv_comp: bool,
}

/// Outcome of one `execute_step` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step (and, if it was the last, the whole op) completed.
    StepComplete,
    /// The op has no more steps: it is fully complete.
    OpComplete,
    /// The step is still waiting on a send retry or an arrival.
    InProgress,
}

/// A scheduled collective instance: the plan reference plus per-step
/// state and the circular op id used to demux arrivals.
#[derive(Debug, Clone)]
pub struct Op {
    /// The plan being executed. Shared with the plan cache, never mutated.
    pub plan: Arc<Plan>,
    /// Request bookkeeping.
    pub request: Request,
    /// Per-step state, indexed the same as `plan.phases`.
    pub steps: Vec<Step>,
}

impl Op {
    /// Builds an op for `plan`, given the logical buffer length and
    /// element size in effect for the whole collective (variable-length
    /// collectives override this per step via `init_phase`).
    pub fn new(coll_id: u8, plan: Arc<Plan>, buffer_length: usize, dtype_size: usize) -> Self {
        let n = plan.phases.len();
        let steps = plan
            .phases
            .iter()
            .enumerate()
            .map(|(i, phase)| Step::new(i, phase, buffer_length, dtype_size, i == 0, i + 1 == n))
            .collect();
        Op {
            plan,
            request: Request {
                coll_id,
                current_step: 0,
                recv_comp: false,
            },
            steps,
        }
    }

    /// Whether every step has completed.
    pub fn is_complete(&self) -> bool {
        self.request.current_step >= self.steps.len()
    }

    /// The phase driving the current step.
    fn current_phase(&self) -> &Phase {
        &self.plan.phases[self.steps[self.request.current_step].phase_index]
    }
}

/// Drives the send side of the op's current step: for each endpoint from
/// `iter_ep` onward, issues one active-message send matching the step's
/// fragmentation plan. On `CoreError::NoResource`, the cursor is saved on
/// the step and `StepOutcome::InProgress` is returned so a later progress
/// tick resumes from the same endpoint and offset (base §4.5.4 step 4).
pub fn execute_step<T: Transport>(
    transport: &mut T,
    endpoints: &[T::Endpoint],
    group_id: GroupId,
    am_id: u8,
    op: &mut Op,
    payload: &[u8],
) -> Result<StepOutcome> {
    if op.is_complete() {
        return Ok(StepOutcome::OpComplete);
    }
    let current = op.request.current_step;
    let phase = op.current_phase().clone();
    let step = &mut op.steps[current];

    if step.flags.recv1_before_send && !op.request.recv_comp {
        return Ok(StepOutcome::InProgress);
    }
    if step.flags.recv_before_send1 && !step.pending.is_done() {
        return Ok(StepOutcome::InProgress);
    }

    while step.iter_ep < phase.ep_counts.send {
        let peer_member = phase.peers.get(step.iter_ep).copied().unwrap_or(step.iter_ep);
        let ep = *endpoints
            .get(peer_member)
            .ok_or_else(|| CoreError::Fatal("phase peer has no resolved endpoint".into()))?;

        // Phases with `length_per_request` set carry a distinct
        // `(offset, length)` window per peer; every other phase sends the
        // same `payload` to every peer, so the window defaults to the
        // whole buffer.
        let (peer_start, peer_len) = phase
            .per_peer_send_bytes
            .get(step.iter_ep)
            .copied()
            .unwrap_or((0, payload.len()));

        let frag_len = step.send_fragment.fragment_length.max(1);
        let local_start = step.iter_offset;
        let local_end = (local_start + frag_len).min(peer_len);
        let abs_start = (peer_start + local_start).min(payload.len());
        let abs_end = (peer_start + local_end).min(payload.len()).max(abs_start);
        let chunk = &payload[abs_start..abs_end];

        let header = WireHeader {
            group_id,
            coll_id: op.request.coll_id,
            step_idx: phase.step_index,
            remote_offset: local_start as u32,
        };

        let send_result = match step.send_fragment.mode {
            SendMode::Short => transport.am_short(ep, am_id, &header.to_bytes(), chunk).map(|_| ()),
            SendMode::Bcopy => transport
                .am_bcopy(ep, am_id, &header.to_bytes(), &mut |scratch: &mut [u8]| {
                    let n = chunk.len().min(scratch.len());
                    scratch[..n].copy_from_slice(&chunk[..n]);
                    n
                })
                .map(|_| ()),
            SendMode::Zcopy => {
                let iov = [IoSlice {
                    ptr: chunk.as_ptr() as *const _,
                    len: chunk.len(),
                }];
                // `SendOutcome::InProgress` still counts as accepted here;
                // its eventual completion is tracked by `step.pending`,
                // not by this send loop.
                transport.am_zcopy(ep, am_id, &header.to_bytes(), &iov).map(|_outcome| ())
            }
        };

        match send_result {
            Ok(()) => {
                if local_end >= peer_len {
                    step.iter_ep += 1;
                    step.iter_offset = 0;
                } else {
                    step.iter_offset = local_end;
                }
            }
            Err(CoreError::NoResource { .. }) => {
                return Err(CoreError::NoResource {
                    endpoint_index: step.iter_ep,
                    step_index: phase.step_index,
                });
            }
            Err(e) => return Err(e),
        }
    }
    step.send_done = true;

    if step.is_complete() {
        Ok(advance(op))
    } else {
        Ok(StepOutcome::InProgress)
    }
}

/// Records one arrived/landed receive or send-completion for the current
/// step, advancing the op when the step's pending counter reaches zero.
pub fn on_completion(op: &mut Op) -> StepOutcome {
    let current = op.request.current_step;
    let step = &mut op.steps[current];
    let just_finished = step.pending.decrement();
    op.request.recv_comp = true;
    if just_finished && step.is_complete() {
        advance(op)
    } else {
        StepOutcome::InProgress
    }
}

fn advance(op: &mut Op) -> StepOutcome {
    op.request.current_step += 1;
    op.request.recv_comp = false;
    if op.is_complete() {
        StepOutcome::OpComplete
    } else {
        StepOutcome::StepComplete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{EpCounts, Phase};
    use crate::transport::Thresholds;

    fn thresh() -> Thresholds {
        Thresholds {
            max_short_one: 64,
            max_short_max: 256,
            max_bcopy_one: 1024,
            max_bcopy_max: 8192,
            max_zcopy_one: 4096,
            md_max_reg: 1 << 20,
        }
    }

    #[test]
    fn send_terminal_step_needs_no_receive() {
        let mut phase = Phase::new(0, Method::SendTerminal, thresh());
        phase.ep_counts = EpCounts { total: 1, send: 1, recv: 0 };
        let step = Step::new(0, &phase, 32, 4, true, true);
        assert_eq!(step.pending, PendingCounter(0));
    }

    #[test]
    fn recv_terminal_pending_counts_fragments_times_endpoints() {
        let mut phase = Phase::new(0, Method::RecvTerminal, thresh());
        phase.ep_counts = EpCounts { total: 3, send: 0, recv: 3 };
        let step = Step::new(0, &phase, 32, 4, true, true);
        assert_eq!(step.pending, PendingCounter(3));
    }

    #[test]
    fn completion_counter_reaches_zero_exactly_once() {
        let mut counter = PendingCounter(2);
        assert!(!counter.decrement());
        assert!(counter.decrement());
        assert!(counter.is_done());
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent_to: Vec<usize>,
        sent_payloads: Vec<Vec<u8>>,
    }

    impl Transport for RecordingTransport {
        type Endpoint = usize;
        type MemoryHandle = ();

        fn connect(&mut self, _group: GroupId, rank: crate::group::Rank) -> Result<(usize, crate::transport::EndpointCaps, crate::transport::MdCaps)> {
            Ok((
                rank as usize,
                crate::transport::EndpointCaps { max_short: 256, max_bcopy: 4096, max_zcopy: 1 << 20 },
                crate::transport::MdCaps { max_reg: 1 << 20, need_memh: false },
            ))
        }

        fn am_short(&mut self, ep: usize, _am_id: u8, _header: &[u8], payload: &[u8]) -> Result<()> {
            self.sent_to.push(ep);
            self.sent_payloads.push(payload.to_vec());
            Ok(())
        }

        fn am_bcopy(&mut self, ep: usize, _am_id: u8, _header: &[u8], pack: &mut dyn FnMut(&mut [u8]) -> usize) -> Result<usize> {
            let mut scratch = [0u8; 64];
            let n = pack(&mut scratch);
            self.sent_to.push(ep);
            Ok(n)
        }

        fn am_zcopy(&mut self, ep: usize, _am_id: u8, _header: &[u8], _iov: &[crate::transport::IoSlice]) -> Result<crate::transport::SendOutcome> {
            self.sent_to.push(ep);
            Ok(crate::transport::SendOutcome::Done)
        }

        fn mem_reg(&mut self, _buf: *mut std::os::raw::c_void, _len: usize, _access: crate::transport::AccessMode) -> Result<()> {
            Ok(())
        }

        fn mem_dereg(&mut self, _memh: ()) -> Result<()> {
            Ok(())
        }
    }

    fn waypoint_plan(recv: usize) -> std::sync::Arc<Plan> {
        let mut phase = Phase::new(0, Method::GatherWaypoint, thresh());
        // Parent (the send target) occupies peers[0]; children (recv sources) follow.
        phase.peers = SmallVec::from_vec(std::iter::once(recv).chain(0..recv).collect());
        phase.ep_counts = EpCounts { total: recv + 1, send: 1, recv };
        std::sync::Arc::new(Plan {
            kind: crate::wire::CollectiveKind::Barrier,
            algo: crate::wire::AlgoId::Barrier(crate::wire::BarrierAlgo::Binomial),
            endpoint_count: recv + 1,
            phases: vec![phase],
        })
    }

    #[test]
    fn gather_waypoint_defers_send_until_every_child_arrives() {
        let plan = waypoint_plan(2);
        let mut op = Op::new(0, plan, 0, 0);
        let mut transport = RecordingTransport::default();
        let endpoints: Vec<usize> = (0..3).collect();

        // No children have arrived yet: the send to the parent must not fire.
        let outcome = execute_step(&mut transport, &endpoints, 1, 0, &mut op, &[]).unwrap();
        assert_eq!(outcome, StepOutcome::InProgress);
        assert!(transport.sent_to.is_empty());

        // One of two expected children arrives: still not enough.
        assert_eq!(on_completion(&mut op), StepOutcome::InProgress);
        let outcome = execute_step(&mut transport, &endpoints, 1, 0, &mut op, &[]).unwrap();
        assert_eq!(outcome, StepOutcome::InProgress);
        assert!(transport.sent_to.is_empty());

        // The second child arrives: now the waypoint may forward to its parent.
        assert_eq!(on_completion(&mut op), StepOutcome::InProgress);
        let outcome = execute_step(&mut transport, &endpoints, 1, 0, &mut op, &[]).unwrap();
        assert_eq!(outcome, StepOutcome::OpComplete);
        assert_eq!(transport.sent_to, vec![2]);
    }

    fn scatter_plan(per_peer: &[(usize, usize)]) -> std::sync::Arc<Plan> {
        let n = per_peer.len();
        let mut phase = Phase::new(0, Method::ScatterTerminal, thresh());
        phase.peers = SmallVec::from_vec((0..n).collect());
        phase.ep_counts = EpCounts { total: n, send: n, recv: 0 };
        phase.per_peer_send_bytes = per_peer.iter().copied().collect();
        std::sync::Arc::new(Plan {
            kind: crate::wire::CollectiveKind::Scatterv,
            algo: crate::wire::AlgoId::Gather(crate::wire::GatherAlgo::Linear),
            endpoint_count: n,
            phases: vec![phase],
        })
    }

    #[test]
    fn scatter_terminal_sends_a_distinct_slice_to_each_peer() {
        // Peer 0 gets bytes [0..2), peer 1 gets [2..5), peer 2 gets [5..6).
        let plan = scatter_plan(&[(0, 2), (2, 3), (5, 1)]);
        let mut op = Op::new(0, plan, 6, 1);
        let mut transport = RecordingTransport::default();
        let endpoints: Vec<usize> = (0..3).collect();
        let payload = [10u8, 11, 20, 21, 22, 30];

        let outcome = execute_step(&mut transport, &endpoints, 1, 0, &mut op, &payload).unwrap();
        assert_eq!(outcome, StepOutcome::OpComplete);
        assert_eq!(transport.sent_to, vec![0, 1, 2]);
        assert_eq!(transport.sent_payloads, vec![vec![10, 11], vec![20, 21, 22], vec![30]]);
    }

    #[test]
    fn phase_with_no_per_peer_ranges_sends_the_same_payload_to_every_peer() {
        let mut phase = Phase::new(0, Method::SendTerminal, thresh());
        phase.peers = SmallVec::from_vec(vec![0, 1]);
        phase.ep_counts = EpCounts { total: 2, send: 2, recv: 0 };
        let plan = std::sync::Arc::new(Plan {
            kind: crate::wire::CollectiveKind::Bcast,
            algo: crate::wire::AlgoId::Bcast(crate::wire::BcastAlgo::KnomialTree),
            endpoint_count: 2,
            phases: vec![phase],
        });
        let mut op = Op::new(0, plan, 3, 1);
        let mut transport = RecordingTransport::default();
        let endpoints: Vec<usize> = (0..2).collect();
        let payload = [1u8, 2, 3];

        execute_step(&mut transport, &endpoints, 1, 0, &mut op, &payload).unwrap();
        assert_eq!(transport.sent_payloads, vec![vec![1, 2, 3], vec![1, 2, 3]]);
    }
}
