//! Send-mode selection and fragmentation math.
//!
//! Given a buffer length, an element size, and a phase's thresholds,
//! decides whether the payload goes out as one or more inline ("short"),
//! buffered-copy ("bcopy"), or zero-copy ("zcopy") active messages.
//! `SendMode` is a plain enum rather than a bitmask: exactly one mode is
//! ever active for a step, so Rust's enum already encodes the "exactly
//! one" invariant the original bit-field comment called out explicitly.

use crate::transport::Thresholds;

/// Which active-message path a step uses to move its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Inline message, payload copied into the AM header frame.
    Short,
    /// Buffered copy into a transport-owned scratch region.
    Bcopy,
    /// Zero-copy, backed by a memory registration.
    Zcopy,
}

/// The fragmentation decision for one buffer: how to send it and in how
/// many pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentPlan {
    /// Send mode used for every fragment of this buffer.
    pub mode: SendMode,
    /// Length in bytes of one fragment (the last fragment may be shorter).
    pub fragment_length: usize,
    /// Number of fragments, `ceil(buffer_length / fragment_length)`.
    pub fragments: usize,
}

impl FragmentPlan {
    /// Whether this buffer needs more than one active message.
    pub fn is_fragmented(&self) -> bool {
        self.fragments > 1
    }
}

fn ceil_div(a: usize, b: usize) -> usize {
    if b == 0 {
        0
    } else {
        (a + b - 1) / b
    }
}

/// Largest multiple of `dtype_size` not exceeding `cap`, or `cap` itself
/// when a single element already exceeds it.
fn largest_aligned_fragment(cap: usize, dtype_size: usize) -> usize {
    if dtype_size == 0 || dtype_size > cap {
        cap
    } else {
        (cap / dtype_size) * dtype_size
    }
}

/// Decides send mode and fragment size for a buffer of `buffer_length`
/// bytes, made of elements of `dtype_size` bytes, under `thresh`.
pub fn plan_fragments(buffer_length: usize, dtype_size: usize, thresh: Thresholds) -> FragmentPlan {
    if buffer_length == 0 {
        return FragmentPlan {
            mode: SendMode::Short,
            fragment_length: 0,
            fragments: 0,
        };
    }
    if buffer_length <= thresh.max_short_one {
        return FragmentPlan {
            mode: SendMode::Short,
            fragment_length: buffer_length,
            fragments: 1,
        };
    }
    if buffer_length <= thresh.max_short_max {
        let frag_len = largest_aligned_fragment(thresh.max_short_one, dtype_size).max(1);
        return FragmentPlan {
            mode: SendMode::Short,
            fragment_length: frag_len,
            fragments: ceil_div(buffer_length, frag_len),
        };
    }
    if buffer_length > thresh.max_bcopy_max && buffer_length <= thresh.md_max_reg {
        if buffer_length < thresh.max_zcopy_one {
            return FragmentPlan {
                mode: SendMode::Zcopy,
                fragment_length: buffer_length,
                fragments: 1,
            };
        }
        let frag_len = thresh.max_zcopy_one.max(1);
        return FragmentPlan {
            mode: SendMode::Zcopy,
            fragment_length: frag_len,
            fragments: ceil_div(buffer_length, frag_len),
        };
    }
    if buffer_length <= thresh.max_bcopy_one {
        return FragmentPlan {
            mode: SendMode::Bcopy,
            fragment_length: buffer_length,
            fragments: 1,
        };
    }
    let frag_len = thresh.max_bcopy_one.max(1);
    FragmentPlan {
        mode: SendMode::Bcopy,
        fragment_length: frag_len,
        fragments: ceil_div(buffer_length, frag_len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn tiny_buffer_is_one_short_send() {
        let p = plan_fragments(32, 4, thresh());
        assert_eq!(p.mode, SendMode::Short);
        assert_eq!(p.fragments, 1);
        assert!(!p.is_fragmented());
    }

    #[test]
    fn mid_size_short_buffer_fragments_on_element_boundary() {
        let p = plan_fragments(200, 8, thresh());
        assert_eq!(p.mode, SendMode::Short);
        assert_eq!(p.fragment_length, 64);
        assert_eq!(p.fragments, ceil_div(200, 64));
    }

    #[test]
    fn zero_copy_kicks_in_above_bcopy_max_and_within_registration_limit() {
        let p = plan_fragments(10_000, 8, thresh());
        assert_eq!(p.mode, SendMode::Zcopy);
        assert_eq!(p.fragments, ceil_div(10_000, 4096));
    }

    #[test]
    fn bcopy_covers_the_gap_below_bcopy_max() {
        let p = plan_fragments(800, 8, thresh());
        assert_eq!(p.mode, SendMode::Bcopy);
        assert_eq!(p.fragments, 1);
    }

    #[test]
    fn empty_buffer_needs_no_fragments() {
        let p = plan_fragments(0, 8, thresh());
        assert_eq!(p.fragments, 0);
    }

    #[test]
    fn fragment_coverage_sums_to_at_least_the_buffer_length() {
        let t = thresh();
        for len in [1usize, 17, 63, 64, 65, 300, 2000, 9000, 50_000] {
            let p = plan_fragments(len, 8, t);
            if p.fragments > 0 {
                assert!(p.fragment_length * p.fragments >= len);
                assert!(p.fragment_length * (p.fragments - 1) < len);
            }
        }
    }
}
