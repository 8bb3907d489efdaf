//! Memory-aware compatibility and context sizing.
//!
//! Everything here is a pure function over (variant, host memory, context
//! tokens); the only side effect lives in [`host_memory_mb`], the sysinfo
//! probe. Callers that cache the probe value keep the rest deterministic and
//! trivially testable.

use std::fmt;

use sysinfo::System;

use crate::catalog::ModelVariant;

/// The engine launches with a 4096-token context; anything smaller is
/// unusable regardless of memory.
pub const MIN_CONTEXT_TOKENS: u32 = 4096;

/// Hosts at or above 128 GiB get a 75% budget, everything else 50%.
pub const LARGE_HOST_THRESHOLD_MB: u64 = 131_072;

const BYTES_PER_MB: f64 = 1_048_576.0;

/// Outcome of a compatibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Compatible,
    /// The variant's maximum context is below the 4096-token launch floor.
    ContextBelowFloor,
    /// The requested context exceeds what the variant supports.
    ContextExceedsMax,
    /// The memory probe returned 0; fail closed rather than guess.
    UnknownHostMemory,
    /// The estimated runtime footprint exceeds the host budget.
    InsufficientMemory { required_gb: u64 },
}

impl Verdict {
    #[must_use]
    pub fn is_compatible(&self) -> bool {
        matches!(self, Verdict::Compatible)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Compatible => write!(f, "compatible"),
            Verdict::ContextBelowFloor => {
                write!(f, "maximum context below the {MIN_CONTEXT_TOKENS}-token launch floor")
            }
            Verdict::ContextExceedsMax => write!(f, "requested context exceeds the model maximum"),
            Verdict::UnknownHostMemory => write!(f, "host memory could not be determined"),
            Verdict::InsufficientMemory { required_gb } => {
                write!(f, "requires ~{required_gb} GB of memory")
            }
        }
    }
}

/// Fraction of physical memory the engine may claim on this host.
#[must_use]
pub fn budget_fraction(host_mb: u64) -> f64 {
    if host_mb >= LARGE_HOST_THRESHOLD_MB {
        0.75
    } else {
        0.5
    }
}

/// Memory budget in MB for a host with `host_mb` of physical memory.
#[must_use]
pub fn memory_budget_mb(host_mb: u64) -> u64 {
    (host_mb as f64 * budget_fraction(host_mb)) as u64
}

/// Estimated resident memory in MB for running `variant` at `ctx_tokens`:
/// weights (file size × overhead) plus KV cache scaled by context length.
#[must_use]
pub fn runtime_memory_mb(variant: &ModelVariant, ctx_tokens: u32) -> u64 {
    let weights_mb = variant.file_size_mb() * variant.overhead_multiplier;
    let kv_mb = (f64::from(ctx_tokens) / 1000.0) * (variant.kv_bytes_per_1k as f64 / BYTES_PER_MB);
    (weights_mb + kv_mb).ceil() as u64
}

/// Full compatibility check at an explicit context length.
#[must_use]
pub fn check(variant: &ModelVariant, host_mb: u64, ctx_tokens: u32) -> Verdict {
    if variant.max_context < MIN_CONTEXT_TOKENS {
        return Verdict::ContextBelowFloor;
    }
    if ctx_tokens > variant.max_context {
        return Verdict::ContextExceedsMax;
    }
    if host_mb == 0 {
        return Verdict::UnknownHostMemory;
    }

    let required_mb = runtime_memory_mb(variant, ctx_tokens);
    if required_mb <= memory_budget_mb(host_mb) {
        Verdict::Compatible
    } else {
        // Human-readable figure: the physical memory a host would need for
        // this footprint under the applicable budget fraction.
        let required_gb =
            (required_mb as f64 / budget_fraction(host_mb) / 1024.0).ceil() as u64;
        Verdict::InsufficientMemory { required_gb }
    }
}

/// Compatibility at the engine's default launch context.
#[must_use]
pub fn is_compatible(variant: &ModelVariant, host_mb: u64) -> bool {
    check(variant, host_mb, MIN_CONTEXT_TOKENS).is_compatible()
}

/// Largest usable context window for `variant` on this host, at most
/// `desired_tokens`, floored to a 1024-token multiple. `None` when even
/// 4096 tokens do not fit.
#[must_use]
pub fn usable_context_window(
    variant: &ModelVariant,
    host_mb: u64,
    desired_tokens: u32,
) -> Option<u32> {
    if variant.max_context < MIN_CONTEXT_TOKENS || host_mb == 0 {
        return None;
    }
    let desired = desired_tokens.clamp(MIN_CONTEXT_TOKENS, variant.max_context);

    let budget_mb = memory_budget_mb(host_mb) as f64;
    let weights_mb = variant.file_size_mb() * variant.overhead_multiplier;
    let headroom_mb = budget_mb - weights_mb;

    let affordable = if variant.kv_bytes_per_1k == 0 {
        // No per-token cost on record: the weights bound is the only one.
        if headroom_mb < 0.0 {
            0
        } else {
            variant.max_context
        }
    } else if headroom_mb <= 0.0 {
        0
    } else {
        let tokens = headroom_mb * BYTES_PER_MB / variant.kv_bytes_per_1k as f64 * 1000.0;
        tokens.min(f64::from(u32::MAX)) as u32
    };

    if affordable < MIN_CONTEXT_TOKENS {
        return None;
    }

    let bound = variant.max_context.min(desired).min(affordable);
    let floored = bound / 1024 * 1024;
    Some(floored.clamp(MIN_CONTEXT_TOKENS, variant.max_context))
}

/// Physical host memory in MB. Returns 0 when the probe fails, which every
/// caller treats as "unknown, fail closed".
#[must_use]
pub fn host_memory_mb() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory() / 1_048_576
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(file_size_mb: u64, kv_bytes_per_1k: u64, max_context: u32) -> ModelVariant {
        ModelVariant {
            id: "t".to_string(),
            family: "t".to_string(),
            size_label: "t".to_string(),
            max_context,
            file_size_bytes: file_size_mb * 1_048_576,
            kv_bytes_per_1k,
            overhead_multiplier: 1.05,
            quantization: "Q4_K_M".to_string(),
            full_precision: false,
            sha256: None,
            launch_args: vec![],
            main_url: "https://host/t.gguf".to_string(),
            shard_urls: vec![],
            projection_url: None,
        }
    }

    #[test]
    fn test_budget_is_half_below_threshold() {
        assert_eq!(memory_budget_mb(16_384), 8_192);
        assert_eq!(memory_budget_mb(65_536), 32_768);
        assert_eq!(memory_budget_mb(131_071), 65_535);
    }

    #[test]
    fn test_budget_is_three_quarters_at_threshold() {
        assert_eq!(memory_budget_mb(131_072), 98_304);
        assert_eq!(memory_budget_mb(262_144), 196_608);
    }

    #[test]
    fn test_runtime_memory_worked_scenario() {
        // 3000 MB file, 1.05 overhead, 3 MiB KV per 1k tokens, 4096 tokens:
        // ceil(3150 + 4.096 * 3) = ceil(3162.288) = 3163.
        let v = variant(3000, 3_145_728, 32_768);
        assert_eq!(runtime_memory_mb(&v, 4096), 3163);
    }

    #[test]
    fn test_worked_scenario_is_compatible_on_16gb() {
        let v = variant(3000, 3_145_728, 32_768);
        assert_eq!(check(&v, 16_384, 4096), Verdict::Compatible);
    }

    #[test]
    fn test_context_floor_beats_memory() {
        // Tiny model, huge host: still rejected below the launch floor.
        let v = variant(100, 0, 2048);
        assert_eq!(check(&v, 262_144, 2048), Verdict::ContextBelowFloor);
        assert!(!is_compatible(&v, 262_144));
    }

    #[test]
    fn test_requested_context_above_max() {
        let v = variant(3000, 3_145_728, 8192);
        assert_eq!(check(&v, 16_384, 16_384), Verdict::ContextExceedsMax);
    }

    #[test]
    fn test_unknown_host_memory_fails_closed() {
        let v = variant(10, 0, 8192);
        assert_eq!(check(&v, 0, 4096), Verdict::UnknownHostMemory);
        assert_eq!(usable_context_window(&v, 0, 8192), None);
    }

    #[test]
    fn test_insufficient_memory_reports_required_gb() {
        // 20000 MB weights on an 8 GiB host (4096 MB budget).
        let v = variant(20_000, 0, 8192);
        match check(&v, 8_192, 4096) {
            Verdict::InsufficientMemory { required_gb } => {
                // ceil(21000 / 0.5 / 1024) = ceil(41.01) = 42
                assert_eq!(required_gb, 42);
            }
            other => panic!("expected InsufficientMemory, got {other:?}"),
        }
        assert!(format!("{}", check(&v, 8_192, 4096)).contains("requires ~42 GB"));
    }

    #[test]
    fn test_usable_context_within_bounds() {
        let v = variant(3000, 3_145_728, 32_768);
        let ctx = usable_context_window(&v, 16_384, 65_536).unwrap();
        assert!(ctx >= MIN_CONTEXT_TOKENS);
        assert!(ctx <= v.max_context);
        assert_eq!(ctx % 1024, 0);
    }

    #[test]
    fn test_usable_context_clamps_to_desired() {
        let v = variant(3000, 3_145_728, 131_072);
        assert_eq!(usable_context_window(&v, 131_072, 8192), Some(8192));
    }

    #[test]
    fn test_usable_context_memory_bound() {
        // Budget 8192 MB, weights 3150 MB -> 5042 MB headroom.
        // 5042 MiB / 3 MiB per 1k tokens * 1000 = ~1_680_666 tokens,
        // clamped by max_context.
        let v = variant(3000, 3_145_728, 16_384);
        assert_eq!(usable_context_window(&v, 16_384, 1_000_000), Some(16_384));

        // Now with a brutal KV cost the memory bound dominates:
        // headroom 5042 MiB / 512 MiB per 1k * 1000 = ~9847 -> floor 9216.
        let v = variant(3000, 512 * 1_048_576, 131_072);
        assert_eq!(usable_context_window(&v, 16_384, 131_072), Some(9216));
    }

    #[test]
    fn test_usable_context_none_when_4096_does_not_fit() {
        // Weights alone exceed the budget.
        let v = variant(20_000, 3_145_728, 32_768);
        assert_eq!(usable_context_window(&v, 16_384, 4096), None);
    }

    #[test]
    fn test_usable_context_zero_kv_cost_uses_variant_max() {
        let v = variant(1000, 0, 32_768);
        assert_eq!(usable_context_window(&v, 16_384, 1_000_000), Some(32_768));
    }
}
