//! Statistics collection and reporting.
//!
//! This module tracks counters for the JIT pipeline: how many blocks were
//! compiled, how the block cache performed, and how often the fastmem path
//! had to fall back to slowmem. Mirrors the role of a `SimStats`-style
//! counters struct: plain public fields updated in place by the components
//! that own the events, plus a `report()` for human-readable output.

use std::time::Instant;

/// JIT core statistics.
#[derive(Clone)]
pub struct Stats {
    start_time: Instant,

    /// Number of blocks translated from guest code into host code.
    pub blocks_compiled: u64,
    /// Number of `BlockCache::lookup` calls that found a resident block.
    pub cache_hits: u64,
    /// Number of `BlockCache::lookup` calls that missed (compile required).
    pub cache_misses: u64,
    /// Number of blocks dropped by `invalidate_range` (self-modifying code).
    pub cache_invalidations: u64,
    /// Number of times the executable arena overflowed and was reset.
    pub cache_resets: u64,
    /// Number of fastmem sites patched to slowmem by the fault handler.
    pub fastmem_faults_patched: u64,
    /// Number of slowmem thunk invocations (patched sites plus MMIO regions).
    pub slowmem_calls: u64,
    /// Number of instructions the frontend routed to the interpreter
    /// fallback because of `UnsupportedOpcode`.
    pub interpreter_fallbacks: u64,
}

impl Stats {
    /// Creates a zeroed statistics block, starting the wall-clock timer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            blocks_compiled: 0,
            cache_hits: 0,
            cache_misses: 0,
            cache_invalidations: 0,
            cache_resets: 0,
            fastmem_faults_patched: 0,
            slowmem_calls: 0,
            interpreter_fallbacks: 0,
        }
    }

    /// Returns the block cache hit rate as a fraction in `[0.0, 1.0]`.
    ///
    /// Returns `0.0` if no lookups have been recorded yet.
    #[must_use]
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Formats a human-readable summary, the way the CLI prints it on exit.
    #[must_use]
    pub fn report(&self) -> String {
        format!(
            "blocks_compiled={} cache_hits={} cache_misses={} hit_rate={:.2}% \
             invalidations={} resets={} fastmem_patches={} slowmem_calls={} \
             interpreter_fallbacks={} elapsed={:.3}s",
            self.blocks_compiled,
            self.cache_hits,
            self.cache_misses,
            self.cache_hit_rate() * 100.0,
            self.cache_invalidations,
            self.cache_resets,
            self.fastmem_faults_patched,
            self.slowmem_calls,
            self.interpreter_fallbacks,
            self.start_time.elapsed().as_secs_f64(),
        )
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
