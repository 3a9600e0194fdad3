#![allow(clippy::cast_possible_truncation)]

use crate::error::GpuResult;
use std::fs;
use std::path::Path;

pub const SZ_4K: u64 = 4 << 10;
pub const SZ_64K: u64 = 64 << 10;
pub const SZ_128K: u64 = 128 << 10;
pub const SZ_1G: u64 = 1 << 30;

/// Platform and chip constants consumed by the core.
///
/// Defaults describe a GM20B-like integrated GPU. Individual values are
/// adjusted with the `with_*` setters or loaded from a `key value`
/// properties file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuConfig {
    pub num_channels: u32,
    pub num_tsgs: u32,
    pub num_runlists: u32,
    pub num_runlist_entries: u32,

    pub big_pages: bool,
    pub big_page_size: u64,
    pub compressible_page_size: u64,
    pub compression_page_size: u64,

    pub comptag_lines: u32,
    pub comptags_per_cacheline: u32,
    pub cacheline_size: u32,
    pub slices_per_ltc: u32,
    pub ltc_count: u32,

    pub va_limit: u64,
    pub low_hole: u64,
    pub small_page_va_limit: u64,
    pub kernel_reserved: u64,

    pub gr_idle_timeout_ms: u32,
    pub watchdog_timeout_ms: u32,
    pub ctxsw_timeout_period_ms: u32,
    pub timeouts_enabled: bool,
    pub wdt_enabled: bool,

    pub has_syncpoints: bool,
    pub num_syncpoints: u32,
    pub semaphore_pool_count: u32,

    pub can_railgate: bool,
    pub runlist_interleave: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            num_channels: 512,
            num_tsgs: 512,
            num_runlists: 1,
            num_runlist_entries: 512,

            big_pages: true,
            big_page_size: SZ_64K,
            compressible_page_size: SZ_64K,
            compression_page_size: SZ_128K,

            comptag_lines: 8192,
            comptags_per_cacheline: 4,
            cacheline_size: 512,
            slices_per_ltc: 2,
            ltc_count: 1,

            va_limit: 1 << 38,
            low_hole: SZ_128K,
            small_page_va_limit: 56 * SZ_1G,
            kernel_reserved: 4 * SZ_1G,

            gr_idle_timeout_ms: 3000,
            watchdog_timeout_ms: 5000,
            ctxsw_timeout_period_ms: 100,
            timeouts_enabled: true,
            wdt_enabled: true,

            has_syncpoints: true,
            num_syncpoints: 192,
            semaphore_pool_count: 16,

            can_railgate: true,
            runlist_interleave: true,
        }
    }

    #[must_use]
    pub const fn with_channels(mut self, n: u32) -> Self {
        self.num_channels = n;
        self.num_tsgs = n;
        self.num_runlist_entries = n;
        self
    }

    #[must_use]
    pub const fn with_runlist_entries(mut self, n: u32) -> Self {
        self.num_runlist_entries = n;
        self
    }

    #[must_use]
    pub const fn with_syncpoints(mut self, enabled: bool) -> Self {
        self.has_syncpoints = enabled;
        self
    }

    #[must_use]
    pub const fn with_semaphore_pools(mut self, n: u32) -> Self {
        self.semaphore_pool_count = n;
        self
    }

    #[must_use]
    pub const fn with_comptag_lines(mut self, n: u32) -> Self {
        self.comptag_lines = n;
        self
    }

    #[must_use]
    pub const fn with_big_pages(mut self, enabled: bool) -> Self {
        self.big_pages = enabled;
        self
    }

    #[must_use]
    pub const fn with_railgate(mut self, enabled: bool) -> Self {
        self.can_railgate = enabled;
        self
    }

    #[must_use]
    pub const fn with_interleave(mut self, enabled: bool) -> Self {
        self.runlist_interleave = enabled;
        self
    }

    #[must_use]
    pub const fn with_watchdog(mut self, enabled: bool, timeout_ms: u32) -> Self {
        self.wdt_enabled = enabled;
        self.watchdog_timeout_ms = timeout_ms;
        self
    }

    #[must_use]
    pub const fn with_idle_timeout(mut self, ms: u32) -> Self {
        self.gr_idle_timeout_ms = ms;
        self
    }

    #[must_use]
    pub const fn with_timeouts(mut self, enabled: bool) -> Self {
        self.timeouts_enabled = enabled;
        self
    }

    /// Bytes of comptag backing covered by one cacheline across all slices and LTCs.
    #[must_use]
    pub const fn aggregate_cacheline_size(&self) -> u64 {
        self.cacheline_size as u64 * self.slices_per_ltc as u64 * self.ltc_count as u64
    }

    /// Idle timeout honoured by preempt polling, or effectively infinite when
    /// timeouts are disabled.
    #[must_use]
    pub const fn idle_timeout_ms(&self) -> u32 {
        if self.timeouts_enabled {
            self.gr_idle_timeout_ms
        } else {
            u32::MAX
        }
    }

    /// Reads a `key value` properties file on top of the defaults.
    ///
    /// # Errors
    /// Returns an `Io` error if the file cannot be read.
    pub fn from_properties_file(path: &Path) -> GpuResult<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::from_properties(&content))
    }

    /// Parses `key value` lines. Unknown keys are ignored and malformed
    /// values keep the default.
    #[must_use]
    pub fn from_properties(content: &str) -> Self {
        let mut c = Self::new();
        let d = Self::new();

        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let (Some(k), Some(v)) = (parts.next(), parts.next()) else {
                continue;
            };
            let flag = |default: bool| match v {
                "1" | "true" => true,
                "0" | "false" => false,
                _ => default,
            };
            match k {
                "num_channels" => c.num_channels = v.parse().unwrap_or(d.num_channels),
                "num_tsgs" => c.num_tsgs = v.parse().unwrap_or(d.num_tsgs),
                "num_runlists" => c.num_runlists = v.parse().unwrap_or(d.num_runlists),
                "num_runlist_entries" => {
                    c.num_runlist_entries = v.parse().unwrap_or(d.num_runlist_entries);
                }
                "big_pages" => c.big_pages = flag(d.big_pages),
                "big_page_size" => c.big_page_size = v.parse().unwrap_or(d.big_page_size),
                "compressible_page_size" => {
                    c.compressible_page_size = v.parse().unwrap_or(d.compressible_page_size);
                }
                "compression_page_size" => {
                    c.compression_page_size = v.parse().unwrap_or(d.compression_page_size);
                }
                "comptag_lines" => c.comptag_lines = v.parse().unwrap_or(d.comptag_lines),
                "comptags_per_cacheline" => {
                    c.comptags_per_cacheline = v.parse().unwrap_or(d.comptags_per_cacheline);
                }
                "cacheline_size" => c.cacheline_size = v.parse().unwrap_or(d.cacheline_size),
                "slices_per_ltc" => c.slices_per_ltc = v.parse().unwrap_or(d.slices_per_ltc),
                "ltc_count" => c.ltc_count = v.parse().unwrap_or(d.ltc_count),
                "va_limit" => c.va_limit = v.parse().unwrap_or(d.va_limit),
                "low_hole" => c.low_hole = v.parse().unwrap_or(d.low_hole),
                "kernel_reserved" => c.kernel_reserved = v.parse().unwrap_or(d.kernel_reserved),
                "gr_idle_timeout_ms" => {
                    c.gr_idle_timeout_ms = v.parse().unwrap_or(d.gr_idle_timeout_ms);
                }
                "watchdog_timeout_ms" => {
                    c.watchdog_timeout_ms = v.parse().unwrap_or(d.watchdog_timeout_ms);
                }
                "ctxsw_timeout_period_ms" => {
                    c.ctxsw_timeout_period_ms = v.parse().unwrap_or(d.ctxsw_timeout_period_ms);
                }
                "timeouts_enabled" => c.timeouts_enabled = flag(d.timeouts_enabled),
                "wdt_enabled" => c.wdt_enabled = flag(d.wdt_enabled),
                "has_syncpoints" => c.has_syncpoints = flag(d.has_syncpoints),
                "num_syncpoints" => c.num_syncpoints = v.parse().unwrap_or(d.num_syncpoints),
                "semaphore_pool_count" => {
                    c.semaphore_pool_count = v.parse().unwrap_or(d.semaphore_pool_count);
                }
                "can_railgate" => c.can_railgate = flag(d.can_railgate),
                "runlist_interleave" => c.runlist_interleave = flag(d.runlist_interleave),
                _ => {}
            }
        }

        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_override_defaults() {
        let c = GpuConfig::from_properties(
            "num_channels 64\nhas_syncpoints 0\nbogus_key 7\ncomptag_lines abc\n",
        );
        assert_eq!(c.num_channels, 64);
        assert!(!c.has_syncpoints);
        assert_eq!(c.comptag_lines, GpuConfig::new().comptag_lines);
    }

    #[test]
    fn builders_chain() {
        let c = GpuConfig::new().with_channels(8).with_interleave(false);
        assert_eq!(c.num_runlist_entries, 8);
        assert!(!c.runlist_interleave);
        assert_eq!(c.aggregate_cacheline_size(), 1024);
    }

    #[test]
    fn properties_file_is_read() {
        let path = std::env::temp_dir().join(format!("nvgpu-core-props-{}", std::process::id()));
        fs::write(&path, "semaphore_pool_count 2\nrunlist_interleave false\n").unwrap();
        let c = GpuConfig::from_properties_file(&path).unwrap();
        fs::remove_file(&path).ok();
        assert_eq!(c.semaphore_pool_count, 2);
        assert!(!c.runlist_interleave);
    }
}
