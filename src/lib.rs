#![deny(missing_docs)]
#![warn(missing_copy_implementations)]
#![warn(trivial_casts)]
#![warn(trivial_numeric_casts)]
#![warn(unused_extern_crates)]
#![warn(unused_import_braces)]
#![warn(unused_qualifications)]

//! `ucg-core`: the planner and step executor for RDMA-style group
//! collectives (barrier, broadcast, reduce, allreduce, scatterv, gatherv,
//! allgatherv, alltoallv).
//!
//! This crate is the core of a collective-communication engine for
//! tightly-coupled HPC clusters, scoped to the three tightly-coupled
//! subsystems that hold the engineering depth:
//!
//! - The **planner** ([`plan`]) turns `(group topology, collective args,
//!   config)` into an immutable [`plan::Plan`]: a totally-ordered
//!   sequence of [`plan::Phase`]s, each naming peers and a [`plan::Method`].
//! - The **step executor** ([`executor`]) drives a plan to completion:
//!   fragmenting buffers, choosing between short/buffered-copy/zero-copy
//!   sends, pipelining fragments, and staging out-of-order arrivals.
//! - The **algorithm library** (the submodules of [`plan`] other than
//!   `builder`, `select`, and `feasibility`) supplies the topology-aware
//!   algorithms the planner composes from: k-nomial and binomial trees,
//!   recursive doubling, ring, Bruck, Rabenseifner, Plummer, and
//!   throttled-scatter alltoallv.
//!
//! Everything outside this core — the reliable-messaging transport, the
//! user-facing MPI-style binding, the bootstrap that publishes rank
//! topology, the reduction-operator implementations themselves,
//! environment parsing, and logging sinks — is an external collaborator,
//! reached only through the traits in [`transport`] and the reduction
//! contract in [`datatype`]. [`engine::Engine`] is the seam where an
//! embedder plugs a concrete [`transport::Transport`] and
//! [`transport::GroupFactory`] in and drives collectives through it.

pub mod args;
pub mod config;
pub mod datatype;
pub mod engine;
pub mod error;
pub mod executor;
pub mod group;
pub mod plan;
pub mod transport;
pub mod wire;

/// Re-exports of the types most embedders need at the call boundary.
pub mod prelude {
    pub use crate::args::{CollectiveArgs, InPlaceBuffer, Partition};
    pub use crate::config::Config;
    pub use crate::datatype::{Datatype, DynBuffer, DynBufferMut, ReductionOperator};
    pub use crate::engine::Engine;
    pub use crate::error::{CoreError, Result};
    pub use crate::group::{Group, GroupId, Rank};
    pub use crate::plan::{Plan, PlanCache};
    pub use crate::transport::{GroupFactory, Transport};
    pub use crate::wire::CollectiveKind;
}
