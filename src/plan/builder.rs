//! The two-level plan builder table: `(collective kind, algorithm id) ->
//! builder`, populated once and consulted on every plan-cache miss.
//!
//! Mirrors `builtin_algo_mgr.c`'s static registration table, but as
//! runtime registration into a `HashMap` rather than a compiled-in C
//! table — there is no reason in Rust to hand-roll what `HashMap::insert`
//! already gives us, and runtime registration is what the first REDESIGN
//! FLAG (no process-wide mutable algorithm state) asks for: the table
//! lives on the `Engine`, not in a global.

use std::collections::HashMap;

use crate::args::CollectiveArgs;
use crate::config::Config;
use crate::error::Result;
use crate::group::{Group, GroupId, Rank};
use crate::plan::Plan;
use crate::transport::{EndpointCaps, MdCaps, Thresholds, Transport, AM_HEADER_SIZE};
use crate::wire::{AlgoId, CollectiveKind};

/// Everything a builder needs from the transport collaborator: per-peer
/// capabilities, used only to derive [`Thresholds`]. Deliberately narrower
/// than [`Transport`] itself — builders never send messages, only probe
/// capabilities — so a builder can run against any transport without
/// being generic over its associated `Endpoint`/`MemoryHandle` types.
pub trait EndpointSource {
    /// Resolves `rank`'s capabilities within `group`.
    fn caps_for(&mut self, group: GroupId, rank: Rank) -> Result<(EndpointCaps, MdCaps)>;
}

impl<T: Transport> EndpointSource for T {
    fn caps_for(&mut self, group: GroupId, rank: Rank) -> Result<(EndpointCaps, MdCaps)> {
        let (_ep, ep_caps, md_caps) = self.connect(group, rank)?;
        Ok((ep_caps, md_caps))
    }
}

/// Derives a phase's send/receive thresholds for `rank`, per base §4.3
/// step 4: subtract the active-message header, align down to 16 bytes.
pub fn thresholds_for(endpoints: &mut dyn EndpointSource, group: GroupId, rank: Rank) -> Result<Thresholds> {
    let (ep_caps, md_caps) = endpoints.caps_for(group, rank)?;
    Ok(Thresholds::derive(ep_caps, md_caps, AM_HEADER_SIZE))
}

/// A pure function from `(group, args, config)` to a fully-resolved
/// [`Plan`], consulting `endpoints` only to derive per-phase thresholds.
pub trait PlanBuilder: Send + Sync {
    /// Builds the plan. Implementors append phases in step order; the
    /// caller (the [`BuilderTable`]) does not reorder or post-process them.
    fn build(
        &self,
        group: &Group,
        args: &CollectiveArgs<'_>,
        config: &Config,
        endpoints: &mut dyn EndpointSource,
    ) -> Result<Plan>;
}

impl<F> PlanBuilder for F
where
    F: Fn(&Group, &CollectiveArgs<'_>, &Config, &mut dyn EndpointSource) -> Result<Plan> + Send + Sync,
{
    fn build(
        &self,
        group: &Group,
        args: &CollectiveArgs<'_>,
        config: &Config,
        endpoints: &mut dyn EndpointSource,
    ) -> Result<Plan> {
        self(group, args, config, endpoints)
    }
}

/// The `(collective kind, algorithm id) -> builder` registry. Built once
/// by [`crate::engine::Engine::new`] via [`BuilderTable::with_defaults`].
#[derive(Default)]
pub struct BuilderTable {
    builders: HashMap<(CollectiveKind, AlgoId), Box<dyn PlanBuilder>>,
}

impl BuilderTable {
    /// An empty table; use [`BuilderTable::register`] to populate it, or
    /// [`BuilderTable::with_defaults`] to get the built-in algorithm
    /// library pre-registered.
    pub fn new() -> Self {
        BuilderTable::default()
    }

    /// Registers (or replaces) the builder for `(kind, algo)`. The same
    /// `AlgoId` (e.g. `GatherAlgo::Linear`) is shared across several
    /// collective kinds (gatherv, scatterv, allgatherv), so the table is
    /// keyed on the pair, not the algorithm id alone.
    pub fn register(&mut self, kind: CollectiveKind, algo: AlgoId, builder: Box<dyn PlanBuilder>) {
        self.builders.insert((kind, algo), builder);
    }

    /// Looks up the builder for `(kind, algo)`, if one is registered.
    pub fn get(&self, kind: CollectiveKind, algo: AlgoId) -> Option<&dyn PlanBuilder> {
        self.builders.get(&(kind, algo)).map(|b| b.as_ref())
    }

    /// Builds a table with every algorithm in this crate's library
    /// registered under its natural id.
    pub fn with_defaults() -> Self {
        let mut table = BuilderTable::new();
        crate::plan::trees::register(&mut table);
        crate::plan::recursive::register(&mut table);
        crate::plan::ring::register(&mut table);
        crate::plan::bruck::register(&mut table);
        crate::plan::rabenseifner::register(&mut table);
        crate::plan::plummer::register(&mut table);
        crate::plan::throttled_scatter::register(&mut table);
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{BarrierAlgo, CollectiveKind};

    struct FakeEndpoints;
    impl EndpointSource for FakeEndpoints {
        fn caps_for(&mut self, _group: GroupId, _rank: Rank) -> Result<(EndpointCaps, MdCaps)> {
            Ok((
                EndpointCaps {
                    max_short: 256,
                    max_bcopy: 4096,
                    max_zcopy: 1 << 20,
                },
                MdCaps {
                    max_reg: 1 << 30,
                    need_memh: false,
                },
            ))
        }
    }

    #[test]
    fn default_table_covers_every_barrier_algo() {
        let table = BuilderTable::with_defaults();
        assert!(table
            .get(CollectiveKind::Barrier, AlgoId::Barrier(BarrierAlgo::Binomial))
            .is_some());
        assert!(table
            .get(CollectiveKind::Barrier, AlgoId::Barrier(BarrierAlgo::Knomial))
            .is_some());
        assert!(table
            .get(CollectiveKind::Barrier, AlgoId::Barrier(BarrierAlgo::RecursiveDoubling))
            .is_some());
    }

    #[test]
    fn thresholds_subtract_header() {
        let mut endpoints = FakeEndpoints;
        let t = thresholds_for(&mut endpoints, 0, 0).unwrap();
        assert_eq!(t.max_short_one, 240);
        let _ = CollectiveKind::Barrier;
    }
}
