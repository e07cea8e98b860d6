//! Flat key/value configuration, with the documented defaults.
//!
//! Parsing the key/value pairs out of the process environment or a file
//! is the embedder's job; this crate only turns already-extracted pairs
//! into a typed [`Config`].

use crate::wire::{AllreduceAlgo, BarrierAlgo, BcastAlgo};

/// Degree configuration for k-nomial trees, separated by whether the
/// exchange crosses node boundaries (inter) or stays within a node
/// (intra), and by direction (fanout for broadcast-shaped trees, fanin
/// for reduce-shaped trees).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnomialDegrees {
    /// Degree for inter-node fan-out trees (broadcast-shaped).
    pub inter_fanout: u32,
    /// Degree for inter-node fan-in trees (reduce-shaped).
    pub inter_fanin: u32,
    /// Degree for intra-node fan-out trees.
    pub intra_fanout: u32,
    /// Degree for intra-node fan-in trees.
    pub intra_fanin: u32,
}

impl Default for KnomialDegrees {
    fn default() -> Self {
        KnomialDegrees {
            inter_fanout: 8,
            inter_fanin: 8,
            intra_fanout: 2,
            intra_fanin: 2,
        }
    }
}

/// Engine-wide tuning configuration. Every field has a documented default
/// and may be overridden from a flat key/value source via
/// [`Config::from_pairs`].
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Force a specific barrier algorithm; `None` means auto-select.
    pub barrier_algorithm: Option<BarrierAlgo>,
    /// Force a specific broadcast algorithm; `None` means auto-select.
    pub bcast_algorithm: Option<BcastAlgo>,
    /// Force a specific allreduce algorithm; `None` means auto-select.
    pub allreduce_algorithm: Option<AllreduceAlgo>,
    /// K-nomial tree degrees.
    pub bmtree_degree: KnomialDegrees,
    /// Cutover from short (inline) sends to buffered-copy sends, in bytes.
    pub short_max_tx_size: usize,
    /// Cutover from buffered-copy sends to zero-copy sends, in bytes.
    pub bcopy_max_tx_size: usize,
    /// Datatype extent above which a non-contiguous datatype forces a
    /// fallback algorithm.
    pub large_datatype_threshold: usize,
    /// Bound on the progress-tick inner loop over already-staged messages.
    pub max_msg_list_size: u32,
    /// Enforce a deterministic reduction order even when the operator is
    /// commutative (trades performance for bit-reproducibility).
    pub reduce_consistency: bool,
    /// In-flight cap for throttled-scatter alltoallv; 0 means unbounded.
    pub ladd_throttled_factor: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            barrier_algorithm: None,
            bcast_algorithm: None,
            allreduce_algorithm: None,
            bmtree_degree: KnomialDegrees::default(),
            short_max_tx_size: 176,
            bcopy_max_tx_size: 32 * 1024,
            large_datatype_threshold: 32,
            max_msg_list_size: 40,
            reduce_consistency: false,
            ladd_throttled_factor: 0,
        }
    }
}

impl Config {
    /// Builds a `Config` from flat key/value pairs, leaving any key not
    /// present at its documented default. Unknown keys are ignored;
    /// malformed values for a known key are also ignored (the last
    /// successfully parsed value for a key wins), mirroring the
    /// permissive style of the original key/value loader.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Config::default();
        for (key, value) in pairs {
            match key {
                "SHORT_MAX_TX_SIZE" => {
                    if let Ok(v) = value.parse() {
                        config.short_max_tx_size = v;
                    }
                }
                "BCOPY_MAX_TX_SIZE" => {
                    if let Ok(v) = value.parse() {
                        config.bcopy_max_tx_size = v;
                    }
                }
                "LARGE_DATATYPE_THRESHOLD" => {
                    if let Ok(v) = value.parse() {
                        config.large_datatype_threshold = v;
                    }
                }
                "MAX_MSG_LIST_SIZE" => {
                    if let Ok(v) = value.parse() {
                        config.max_msg_list_size = v;
                    }
                }
                "REDUCE_CONSISTENCY" => {
                    config.reduce_consistency = value == "true" || value == "1";
                }
                "LADD_THROTTLED_FACTOR" => {
                    if let Ok(v) = value.parse() {
                        config.ladd_throttled_factor = v;
                    }
                }
                "BMTREE_DEGREE_INTER_FANOUT" => {
                    if let Ok(v) = value.parse() {
                        config.bmtree_degree.inter_fanout = v;
                    }
                }
                "BMTREE_DEGREE_INTER_FANIN" => {
                    if let Ok(v) = value.parse() {
                        config.bmtree_degree.inter_fanin = v;
                    }
                }
                "BMTREE_DEGREE_INTRA_FANOUT" => {
                    if let Ok(v) = value.parse() {
                        config.bmtree_degree.intra_fanout = v;
                    }
                }
                "BMTREE_DEGREE_INTRA_FANIN" => {
                    if let Ok(v) = value.parse() {
                        config.bmtree_degree.intra_fanin = v;
                    }
                }
                _ => {}
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.short_max_tx_size, 176);
        assert_eq!(config.bcopy_max_tx_size, 32 * 1024);
        assert_eq!(config.large_datatype_threshold, 32);
        assert_eq!(config.max_msg_list_size, 40);
        assert!(!config.reduce_consistency);
        assert_eq!(config.ladd_throttled_factor, 0);
        assert_eq!(config.bmtree_degree, KnomialDegrees::default());
    }

    #[test]
    fn overrides_known_keys_and_ignores_unknown() {
        let config = Config::from_pairs([
            ("SHORT_MAX_TX_SIZE", "256"),
            ("REDUCE_CONSISTENCY", "true"),
            ("SOME_FUTURE_KEY", "whatever"),
        ]);
        assert_eq!(config.short_max_tx_size, 256);
        assert!(config.reduce_consistency);
    }

    #[test]
    fn malformed_value_keeps_default() {
        let config = Config::from_pairs([("SHORT_MAX_TX_SIZE", "not-a-number")]);
        assert_eq!(config.short_max_tx_size, Config::default().short_max_tx_size);
    }
}
