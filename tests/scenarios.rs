//! End-to-end scenario tests driving `Engine` over the loopback harness in
//! `support`, plus a handful of lighter plan-shape / selection / fallback
//! checks for the heavier collectives where a full wire-level simulation
//! would mostly re-test the unit suites already covering those algorithms.

mod support;

use std::sync::Arc;

use ucg_core::args::{CollectiveArgs, Partition};
use ucg_core::config::Config;
use ucg_core::datatype::{sum_i32, Datatype, DynBuffer, DynBufferMut, PredefinedDatatype, ReductionOperator};
use ucg_core::engine::Engine;
use ucg_core::executor::demux::DemuxOutcome;
use ucg_core::executor::Op;
use ucg_core::group::{BalanceFlags, Group, GroupId, Rank};
use ucg_core::plan::builder::BuilderTable;
use ucg_core::plan::feasibility::{run_to_fixed_point, FallbackTable};
use ucg_core::plan::select::select_allreduce;
use ucg_core::plan::Method;
use ucg_core::transport::am_id_for;
use ucg_core::wire::{AlgoId, AllreduceAlgo, AlltoallvAlgo, BcastAlgo, CollectiveKind, WireHeader};

use support::{single_node_groups, LoopbackTransport};

const MAX_ROUNDS: usize = 64;

fn current_match_key(op: &Op, group_id: GroupId) -> u32 {
    let step = &op.steps[op.request.current_step];
    let phase = &op.plan.phases[step.phase_index];
    WireHeader {
        group_id,
        coll_id: op.request.coll_id,
        step_idx: phase.step_index,
        remote_offset: 0,
    }
    .match_key()
}

// S1: four-rank barrier, round-based pump over the loopback transport.
// Exercises the binomial fan-in/fan-out tree and the gather-waypoint gate
// that waits for every child before forwarding. Each round posts a
// receiver for the current step first (catching anything already staged
// from a prior round), then drives the send side, then drains whatever
// just arrived.
#[test]
fn s1_four_rank_barrier_completes_and_drains_every_message() {
    let transport = LoopbackTransport::new();
    let groups = single_node_groups(7, 4);
    let group_id = groups[0].id();
    let am_id = am_id_for(CollectiveKind::Barrier);
    let endpoints: Vec<Rank> = groups[0].members().to_vec();

    let mut engines: Vec<Engine<LoopbackTransport>> = (0..4).map(|_| Engine::new(transport.clone(), Config::default())).collect();
    let mut ops: Vec<Op> = engines
        .iter_mut()
        .zip(&groups)
        .map(|(engine, group)| engine.trigger(group, &CollectiveArgs::Barrier).unwrap())
        .collect();

    for _ in 0..MAX_ROUNDS {
        if ops.iter().all(|op| op.is_complete()) {
            break;
        }
        for i in 0..ops.len() {
            if ops[i].is_complete() {
                continue;
            }
            let match_key = current_match_key(&ops[i], group_id);
            if engines[i].post_receiver(group_id, ops[i].request.coll_id, match_key).is_some() {
                engines[i].complete_one(&mut ops[i]);
            }
        }
        for i in 0..ops.len() {
            if !ops[i].is_complete() {
                engines[i].drive(group_id, am_id, &mut ops[i], &[], &endpoints).unwrap();
            }
        }
        for i in 0..ops.len() {
            if ops[i].is_complete() {
                continue;
            }
            let rank = groups[i].my_rank();
            for arrival in transport.drain(rank) {
                if let DemuxOutcome::Matched(_) = engines[i].on_message(group_id, arrival.header, &arrival.payload) {
                    engines[i].complete_one(&mut ops[i]);
                }
            }
        }
    }

    assert!(ops.iter().all(|op| op.is_complete()), "all four barrier ops must complete within {MAX_ROUNDS} rounds");
    for group in &groups {
        assert!(transport.drain(group.my_rank()).is_empty(), "no arrival should remain undelivered after completion");
    }
}

fn fold_into(local: &mut i32, incoming: &[u8], dtype: &Datatype) {
    let incoming = i32::from_le_bytes(incoming[..4].try_into().unwrap());
    unsafe {
        let inbuf = DynBuffer::from_raw((&incoming as *const i32).cast(), 1, dtype);
        let inoutbuf = DynBufferMut::from_raw((local as *mut i32).cast(), 1, dtype);
        sum_i32().reduce(inbuf, inoutbuf);
    }
}

// S2: eight-rank allreduce SUM of consecutive integers via recursive
// doubling, forced explicitly since auto-selection would otherwise pick
// the binomial tree for a message this small on a single node. Eight is
// a power of two, so every rank sits at the core of the exchange with no
// relay phases, and each of the three steps is a single XOR-partner swap
// that the test folds into its running accumulator by hand.
#[test]
fn s2_eight_rank_allreduce_sums_via_recursive_doubling() {
    let transport = LoopbackTransport::new();
    let groups = single_node_groups(11, 8);
    let group_id = groups[0].id();
    let am_id = am_id_for(CollectiveKind::Allreduce);
    let endpoints: Vec<Rank> = groups[0].members().to_vec();
    let dtype = Datatype::Predefined(PredefinedDatatype::packed(4));

    let mut config = Config::default();
    config.allreduce_algorithm = Some(AllreduceAlgo::RecursiveDoubling);

    let mut engines: Vec<Engine<LoopbackTransport>> = (0..8).map(|_| Engine::new(transport.clone(), config)).collect();
    let mut accum: Vec<i32> = (1..=8).collect();
    let op_ref = sum_i32();

    let mut ops: Vec<Op> = Vec::with_capacity(8);
    for (i, (engine, group)) in engines.iter_mut().zip(&groups).enumerate() {
        let args = CollectiveArgs::Allreduce {
            sendbuf: (&accum[i] as *const i32).cast(),
            recvbuf: (&mut accum[i] as *mut i32).cast(),
            count: 1,
            dtype: dtype.clone(),
            op: &op_ref,
        };
        ops.push(engine.trigger(group, &args).unwrap());
    }

    for _ in 0..MAX_ROUNDS {
        if ops.iter().all(|op| op.is_complete()) {
            break;
        }
        for i in 0..ops.len() {
            if ops[i].is_complete() {
                continue;
            }
            let match_key = current_match_key(&ops[i], group_id);
            if let Some(desc) = engines[i].post_receiver(group_id, ops[i].request.coll_id, match_key) {
                fold_into(&mut accum[i], &desc.payload, &dtype);
                engines[i].complete_one(&mut ops[i]);
            }
        }
        for i in 0..ops.len() {
            if ops[i].is_complete() {
                continue;
            }
            let payload = accum[i].to_le_bytes();
            engines[i].drive(group_id, am_id, &mut ops[i], &payload, &endpoints).unwrap();
        }
        for i in 0..ops.len() {
            if ops[i].is_complete() {
                continue;
            }
            let rank = groups[i].my_rank();
            for arrival in transport.drain(rank) {
                if let DemuxOutcome::Matched(desc) = engines[i].on_message(group_id, arrival.header, &arrival.payload) {
                    fold_into(&mut accum[i], &desc.payload, &dtype);
                    engines[i].complete_one(&mut ops[i]);
                }
            }
        }
    }

    assert!(ops.iter().all(|op| op.is_complete()), "all eight allreduce ops must complete within {MAX_ROUNDS} rounds");
    for &value in &accum {
        assert_eq!(value, 36, "sum of 1..=8 must land on every rank");
    }
}

// S3: the node-aware allreduce selection path, which requires only one
// bucket past the smallest on both the node and PPN axes.
#[test]
fn s3_multi_node_allreduce_selects_node_aware_hybrid() {
    assert_eq!(select_allreduce(1024, 8, 8), AllreduceAlgo::NodeAwareRecursiveAndBmtree);
    assert_eq!(select_allreduce(64, 1, 1), AllreduceAlgo::BinomialTree, "single-node small jobs stay on the binomial tree");
}

// S4: a four-rank broadcast resolves to the k-nomial fan-out tree, with
// the root sending to every other rank in one phase and leaves each
// waiting on exactly one arrival.
#[test]
fn s4_four_rank_bcast_builds_single_phase_fanout_tree() {
    let transport = LoopbackTransport::new();
    let groups = single_node_groups(3, 4);
    let mut engine = Engine::new(transport, Config::default());
    let mut buf = [0u8; 4];
    let dtype = Datatype::Predefined(PredefinedDatatype::packed(4));

    let root_args = CollectiveArgs::Bcast {
        buffer: buf.as_mut_ptr().cast(),
        count: 1,
        dtype: dtype.clone(),
        root: 0,
    };
    let root_op = engine.trigger(&groups[0], &root_args).unwrap();
    assert_eq!(root_op.plan.algo, AlgoId::Bcast(BcastAlgo::KnomialTree));
    assert_eq!(root_op.plan.phases.len(), 1);
    let root_phase = &root_op.plan.phases[0];
    assert_eq!(root_phase.method, Method::BcastWaypoint);
    assert_eq!(root_phase.ep_counts.send, 3);
    assert_eq!(root_phase.ep_counts.recv, 0);
    assert_eq!(root_phase.peers.to_vec(), vec![1, 2, 3]);

    let leaf_args = CollectiveArgs::Bcast {
        buffer: buf.as_mut_ptr().cast(),
        count: 1,
        dtype,
        root: 0,
    };
    let leaf_op = engine.trigger(&groups[1], &leaf_args).unwrap();
    let leaf_phase = &leaf_op.plan.phases[0];
    assert_eq!(leaf_phase.ep_counts.send, 0);
    assert_eq!(leaf_phase.ep_counts.recv, 1);
    assert_eq!(leaf_phase.peers.to_vec(), vec![0]);
}

fn two_node_group(id: GroupId, my_index: usize) -> Group {
    let members: Vec<Rank> = (0..4).collect();
    let node_index = vec![0u32, 0, 1, 1];
    let socket_index = vec![0u32, 0, 0, 0];
    Group::new(id, members, my_index, node_index, socket_index, BalanceFlags::default()).unwrap()
}

// S5: Plummer's three-stage shape on a two-node, two-ranks-per-node
// group, plus confirmation that alltoallv plans are never reused across
// triggers (they embed per-invocation partitions).
#[test]
fn s5_plummer_alltoallv_builds_three_stage_shape_and_is_never_cached() {
    let table = BuilderTable::with_defaults();
    let builder = table.get(CollectiveKind::Alltoallv, AlgoId::Alltoallv(AlltoallvAlgo::Plummer)).unwrap();
    let config = Config::default();
    let dtype = Datatype::Predefined(PredefinedDatatype::packed(1));
    let mut buf = [0u8; 16];
    let send_ptr = buf.as_ptr();
    let recv_ptr = buf.as_mut_ptr();

    let build_args = |dtype: Datatype| CollectiveArgs::Alltoallv {
        sendbuf: send_ptr.cast(),
        send_partition: Partition::new(vec![1, 1, 1, 1], vec![0, 1, 2, 3]),
        recvbuf: recv_ptr.cast(),
        recv_partition: Partition::new(vec![1, 1, 1, 1], vec![0, 1, 2, 3]),
        dtype,
    };

    let mut leader_transport = LoopbackTransport::new();
    let leader_group = two_node_group(20, 0);
    let leader_args = build_args(dtype.clone());
    let leader_plan = builder.build(&leader_group, &leader_args, &config, &mut leader_transport).unwrap();
    assert_eq!(
        leader_plan.phases.iter().map(|p| p.method).collect::<Vec<_>>(),
        vec![Method::GatherWaypoint, Method::AlltoallvLadd, Method::ScatterTerminal]
    );

    let mut peer_transport = LoopbackTransport::new();
    let peer_group = two_node_group(20, 1);
    let peer_args = build_args(dtype.clone());
    let peer_plan = builder.build(&peer_group, &peer_args, &config, &mut peer_transport).unwrap();
    assert_eq!(
        peer_plan.phases.iter().map(|p| p.method).collect::<Vec<_>>(),
        vec![Method::SendTerminal, Method::RecvTerminal]
    );

    let transport = LoopbackTransport::new();
    let mut engine = Engine::new(transport, config);
    let group = two_node_group(21, 0);
    let first = engine.trigger(&group, &build_args(dtype.clone())).unwrap();
    let second = engine.trigger(&group, &build_args(dtype)).unwrap();
    assert!(!Arc::ptr_eq(&first.plan, &second.plan), "alltoallv plans must be rebuilt, never reused from the cache");
}

// S6: Rabenseifner is infeasible below two ranks, and the default
// fallback table rewrites it to recursive doubling rather than refusing
// the collective outright.
#[test]
fn s6_rabenseifner_falls_back_to_recursive_doubling_below_two_ranks() {
    let group = Group::new(9, vec![0], 0, vec![0], vec![0], BalanceFlags::default()).unwrap();
    let dtype = Datatype::Predefined(PredefinedDatatype::packed(4));
    let op_ref = sum_i32();
    let mut value = 1i32;
    let args = CollectiveArgs::Allreduce {
        sendbuf: (&value as *const i32).cast(),
        recvbuf: (&mut value as *mut i32).cast(),
        count: 1,
        dtype,
        op: &op_ref,
    };
    let config = Config::default();
    let table = FallbackTable::with_defaults();

    let resolved = run_to_fixed_point(AlgoId::Allreduce(AllreduceAlgo::Rabenseifner), &group, &args, &config, &table);
    assert_eq!(resolved, Ok(AlgoId::Allreduce(AllreduceAlgo::RecursiveDoubling)));
}
