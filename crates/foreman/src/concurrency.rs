//! The concurrency governor (§4.5): maps a batch's `base_concurrency` and
//! `max_concurrency` cap onto an effective dispatch ceiling using the host's
//! current CPU/memory bands. Decided ordering from the Open Questions
//! (§9): **memory wins floor** — a `high` memory reading forces the floor
//! of 1 before the CPU-band table is even consulted.

use foreman_environment::{HostSample, MemoryPressure};
use foreman_types::{Batch, ConcurrencyConfig};

/// Compute the effective concurrency for `batch` given a fresh `sample`.
/// Admission is strictly at dispatch time (§4.5): callers must not cache
/// this across a "peek next N queued" loop, which would reintroduce the
/// stale-count TOCTOU the spec calls out.
pub fn effective_concurrency(batch: &Batch, sample: &HostSample, cpu_bands: &ConcurrencyConfig) -> u32 {
    let cap = batch.effective_cap(sample.logical_cpus);
    let base = batch.base_concurrency.max(1);

    if sample.memory_pressure == MemoryPressure::High {
        return 1.min(cap);
    }

    let effective = if sample.cpu_busy_pct > cpu_bands.cpu_high_pct {
        1
    } else if sample.cpu_busy_pct > cpu_bands.cpu_medium_pct {
        base.div_ceil(2)
    } else if sample.cpu_busy_pct > cpu_bands.cpu_low_pct {
        base
    } else {
        2 * base
    };

    effective.min(cap).max(1)
}

/// Whether admitting one more task would exceed the effective concurrency,
/// given `running_count` freshly queried at dispatch time.
pub fn has_admission_slot(batch: &Batch, sample: &HostSample, cpu_bands: &ConcurrencyConfig, running_count: u32) -> bool {
    running_count < effective_concurrency(batch, sample, cpu_bands)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu_busy_pct: f64, memory_pressure: MemoryPressure) -> HostSample {
        HostSample {
            logical_cpus: 8,
            cpu_busy_pct,
            memory_pressure,
            total_processes: 100,
        }
    }

    fn batch(base: u32) -> Batch {
        Batch::new("b", base)
    }

    #[test]
    fn high_memory_floors_regardless_of_low_cpu() {
        let cfg = ConcurrencyConfig::default();
        let s = sample(10.0, MemoryPressure::High);
        assert_eq!(effective_concurrency(&batch(4), &s, &cfg), 1);
    }

    #[test]
    fn high_cpu_floors_to_one() {
        let cfg = ConcurrencyConfig::default();
        let s = sample(90.0, MemoryPressure::Low);
        assert_eq!(effective_concurrency(&batch(4), &s, &cfg), 1);
    }

    #[test]
    fn mid_high_cpu_band_halves_base_rounding_up() {
        let cfg = ConcurrencyConfig::default();
        let s = sample(75.0, MemoryPressure::Low);
        assert_eq!(effective_concurrency(&batch(5), &s, &cfg), 3);
    }

    #[test]
    fn mid_band_uses_base_unchanged() {
        let cfg = ConcurrencyConfig::default();
        let s = sample(50.0, MemoryPressure::Low);
        assert_eq!(effective_concurrency(&batch(4), &s, &cfg), 4);
    }

    #[test]
    fn low_cpu_doubles_base_capped_by_max_concurrency() {
        let cfg = ConcurrencyConfig::default();
        let s = sample(10.0, MemoryPressure::Low);
        let mut b = batch(4);
        b.max_concurrency = 5;
        assert_eq!(effective_concurrency(&b, &s, &cfg), 5);
    }

    #[test]
    fn low_cpu_doubles_base_uncapped_by_logical_cpus_when_explicit_cap_set() {
        let cfg = ConcurrencyConfig::default();
        let s = sample(10.0, MemoryPressure::Low);
        let mut b = batch(4);
        b.max_concurrency = 20;
        assert_eq!(effective_concurrency(&b, &s, &cfg), 8);
    }

    #[test]
    fn admission_slot_respects_running_count() {
        let cfg = ConcurrencyConfig::default();
        let s = sample(50.0, MemoryPressure::Low);
        let b = batch(2);
        assert!(has_admission_slot(&b, &s, &cfg, 1));
        assert!(!has_admission_slot(&b, &s, &cfg, 2));
    }
}
