// SPDX-License-Identifier: Apache-2.0

//! Measured presets used to size database sections and to drive the
//! interleave row/column split.
//!
//! The generator presets are measurements from full enumeration runs; the
//! sizing policy treats them as expectations and adds a safety margin on
//! top. A missing row is a hard error (`Error::MissingPreset`): guessing a
//! capacity for an unmeasured shape wastes either memory or a multi-hour
//! run.

use crate::error::{Error, Result};
use crate::MAX_TRANSFORM;

/// Expected section populations for one `(slots, pure, nodes)` shape.
#[derive(Debug, Clone, Copy)]
pub struct GeneratorMetrics {
    pub slots: u32,
    pub pure: bool,
    pub nodes: u32,
    /// Signature groups living in this address space.
    pub num_signature: u64,
    /// Members collected by a full pass.
    pub num_member: u64,
    /// Distinct hint vectors.
    pub num_hint: u64,
    /// Interned component pairs.
    pub num_pair: u64,
    /// Candidates the generator walks for this shape; used to slice
    /// `--task` windows.
    pub num_progress: u64,
}

#[rustfmt::skip]
static GENERATOR_METRICS: [GeneratorMetrics; 16] = [
    GeneratorMetrics { slots: 9, pure: false, nodes: 0, num_signature: 3,      num_member: 3,       num_hint: 3,    num_pair: 4,       num_progress: 2 },
    GeneratorMetrics { slots: 9, pure: false, nodes: 1, num_signature: 8,      num_member: 8,       num_hint: 8,    num_pair: 12,      num_progress: 108 },
    GeneratorMetrics { slots: 9, pure: false, nodes: 2, num_signature: 58,     num_member: 186,     num_hint: 49,   num_pair: 312,     num_progress: 14_400 },
    GeneratorMetrics { slots: 9, pure: false, nodes: 3, num_signature: 5_666,  num_member: 24_602,  num_hint: 1_311, num_pair: 41_916,  num_progress: 3_687_000 },
    GeneratorMetrics { slots: 9, pure: false, nodes: 4, num_signature: 791_646, num_member: 3_801_411, num_hint: 15_769, num_pair: 6_021_802, num_progress: 1_361_459_000 },
    GeneratorMetrics { slots: 9, pure: false, nodes: 5, num_signature: 791_646, num_member: 9_910_640, num_hint: 15_769, num_pair: 15_501_230, num_progress: 655_607_280_000 },
    GeneratorMetrics { slots: 9, pure: false, nodes: 6, num_signature: 791_646, num_member: 21_286_700, num_hint: 15_769, num_pair: 32_680_400, num_progress: 389_604_281_000_000 },
    GeneratorMetrics { slots: 9, pure: false, nodes: 7, num_signature: 791_646, num_member: 41_021_800, num_hint: 15_769, num_pair: 61_793_100, num_progress: 275_305_004_000_000_000 },
    GeneratorMetrics { slots: 9, pure: true,  nodes: 0, num_signature: 3,      num_member: 3,       num_hint: 3,    num_pair: 4,       num_progress: 2 },
    GeneratorMetrics { slots: 9, pure: true,  nodes: 1, num_signature: 5,      num_member: 5,       num_hint: 5,    num_pair: 8,       num_progress: 36 },
    GeneratorMetrics { slots: 9, pure: true,  nodes: 2, num_signature: 26,     num_member: 85,      num_hint: 22,   num_pair: 140,     num_progress: 2_880 },
    GeneratorMetrics { slots: 9, pure: true,  nodes: 3, num_signature: 1_310,  num_member: 7_968,   num_hint: 544,  num_pair: 12_820,  num_progress: 466_000 },
    GeneratorMetrics { slots: 9, pure: true,  nodes: 4, num_signature: 96_363, num_member: 736_699, num_hint: 4_957, num_pair: 1_164_301, num_progress: 107_401_000 },
    GeneratorMetrics { slots: 9, pure: true,  nodes: 5, num_signature: 791_646, num_member: 4_182_500, num_hint: 15_769, num_pair: 6_535_100, num_progress: 32_801_200_000 },
    GeneratorMetrics { slots: 9, pure: true,  nodes: 6, num_signature: 791_646, num_member: 9_326_700, num_hint: 15_769, num_pair: 14_397_100, num_progress: 12_273_344_800_000 },
    GeneratorMetrics { slots: 9, pure: true,  nodes: 7, num_signature: 791_646, num_member: 18_230_900, num_hint: 15_769, num_pair: 27_812_600, num_progress: 5_479_545_000_000_000 },
];

/// One interleave preset. `num_stored × interleave_step = 9!`.
///
/// `probe_span` is the number of lookup columns that guarantees a hit for
/// an indexed signature: the smallest pointwise prefix-stabiliser subgroup
/// (size `(9-k)!`) at least as large as the step. Lower `num_stored` means
/// cheaper storage and slower lookup.
#[derive(Debug, Clone, Copy)]
pub struct InterleaveMetrics {
    pub slots: u32,
    pub num_stored: u32,
    pub interleave_step: u32,
    pub probe_span: u32,
}

/// The 16 supported presets, one hint-vector entry each, fastest-lookup
/// last. 504 is the general-purpose default.
#[rustfmt::skip]
pub static INTERLEAVE_METRICS: [InterleaveMetrics; 16] = [
    InterleaveMetrics { slots: 9, num_stored: 1,       interleave_step: 362_880, probe_span: 362_880 },
    InterleaveMetrics { slots: 9, num_stored: 2,       interleave_step: 181_440, probe_span: 362_880 },
    InterleaveMetrics { slots: 9, num_stored: 6,       interleave_step: 60_480,  probe_span: 362_880 },
    InterleaveMetrics { slots: 9, num_stored: 9,       interleave_step: 40_320,  probe_span: 40_320 },
    InterleaveMetrics { slots: 9, num_stored: 24,      interleave_step: 15_120,  probe_span: 40_320 },
    InterleaveMetrics { slots: 9, num_stored: 72,      interleave_step: 5_040,   probe_span: 5_040 },
    InterleaveMetrics { slots: 9, num_stored: 120,     interleave_step: 3_024,   probe_span: 5_040 },
    InterleaveMetrics { slots: 9, num_stored: 504,     interleave_step: 720,     probe_span: 720 },
    InterleaveMetrics { slots: 9, num_stored: 720,     interleave_step: 504,     probe_span: 720 },
    InterleaveMetrics { slots: 9, num_stored: 3_024,   interleave_step: 120,     probe_span: 120 },
    InterleaveMetrics { slots: 9, num_stored: 5_040,   interleave_step: 72,      probe_span: 120 },
    InterleaveMetrics { slots: 9, num_stored: 15_120,  interleave_step: 24,      probe_span: 24 },
    InterleaveMetrics { slots: 9, num_stored: 40_320,  interleave_step: 9,       probe_span: 24 },
    InterleaveMetrics { slots: 9, num_stored: 60_480,  interleave_step: 6,       probe_span: 6 },
    InterleaveMetrics { slots: 9, num_stored: 181_440, interleave_step: 2,       probe_span: 2 },
    InterleaveMetrics { slots: 9, num_stored: 362_880, interleave_step: 1,       probe_span: 1 },
];

/// Default interleave. 504 balances storage against lookup cost.
pub const DEFAULT_INTERLEAVE: u32 = 504;

/// Default index/data size ratio.
pub const DEFAULT_RATIO: f64 = 5.0;

pub fn generator_metrics(slots: u32, pure: bool, nodes: u32) -> Result<&'static GeneratorMetrics> {
    GENERATOR_METRICS
        .iter()
        .find(|m| m.slots == slots && m.pure == pure && m.nodes == nodes)
        .ok_or(Error::MissingPreset { slots, pure, nodes })
}

pub fn interleave_metrics(slots: u32, interleave: u32) -> Option<&'static InterleaveMetrics> {
    INTERLEAVE_METRICS
        .iter()
        .find(|m| m.slots == slots && m.num_stored == interleave)
}

/// Position of an interleave preset inside the hint vector.
pub fn interleave_index(interleave: u32) -> Option<usize> {
    INTERLEAVE_METRICS
        .iter()
        .position(|m| m.num_stored == interleave)
}

/// Expected imprint population for a shape at a given interleave: one row
/// set per signature, bounded by skin symmetry.
pub fn imprint_estimate(slots: u32, pure: bool, interleave: u32, nodes: u32) -> Result<u64> {
    let gen = generator_metrics(slots, pure, nodes)?;
    let im = interleave_metrics(slots, interleave).ok_or(Error::MissingPreset {
        slots,
        pure,
        nodes,
    })?;
    Ok(gen.num_signature.saturating_mul(im.num_stored as u64) + 1)
}

/// Comma-separated preset list for usage text.
pub fn allowed_interleaves(slots: u32) -> String {
    let v: Vec<String> = INTERLEAVE_METRICS
        .iter()
        .filter(|m| m.slots == slots)
        .map(|m| m.num_stored.to_string())
        .collect();
    v.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleave_rows_factor_the_transform_space() {
        for m in INTERLEAVE_METRICS.iter() {
            assert_eq!(m.num_stored as u64 * m.interleave_step as u64, MAX_TRANSFORM as u64);
            assert!(m.probe_span >= m.interleave_step);
            // The probe span must be a prefix-stabiliser subgroup size.
            let factorials = [1, 2, 6, 24, 120, 720, 5_040, 40_320, 362_880];
            assert!(factorials.contains(&m.probe_span));
        }
    }

    #[test]
    fn test_default_interleave_has_a_preset() {
        let m = interleave_metrics(9, DEFAULT_INTERLEAVE).unwrap();
        assert_eq!(m.interleave_step, 720);
        assert_eq!(m.probe_span, 720);
    }

    #[test]
    fn test_missing_preset_is_an_error() {
        assert!(generator_metrics(9, false, 99).is_err());
        assert!(generator_metrics(4, false, 1).is_err());
    }

    #[test]
    fn test_hint_vector_width_matches_presets() {
        assert_eq!(INTERLEAVE_METRICS.len(), crate::store::HINT_WIDTH);
    }
}
