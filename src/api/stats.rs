//! Tracker statistics and the leak report.

use std::fmt;

use crate::core::ChainCounters;

/// Aggregated tracker statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    /// Execution contexts registered in the current fork epoch.
    pub contexts: usize,

    /// Blocks currently alive.
    pub live_blocks: usize,

    /// Requested bytes of the live blocks.
    pub live_bytes: usize,

    /// Total number of allocations performed.
    pub allocations: u64,

    /// Total number of releases performed.
    pub releases: u64,
}

impl TrackerStats {
    /// Create empty stats.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn absorb(&mut self, chain: ChainCounters) {
        self.contexts += 1;
        self.live_blocks += chain.blocks;
        self.live_bytes += chain.bytes;
        self.allocations += chain.allocations;
        self.releases += chain.releases;
    }
}

impl fmt::Display for TrackerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Heap Statistics:")?;
        writeln!(f, "  Contexts:    {}", self.contexts)?;
        writeln!(f, "  Live blocks: {}", self.live_blocks)?;
        writeln!(f, "  Live bytes:  {} bytes", self.live_bytes)?;
        writeln!(f, "  Allocations: {}", self.allocations)?;
        writeln!(f, "  Releases:    {}", self.releases)?;
        Ok(())
    }
}

/// What the shutdown sweep found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeakReport {
    /// Blocks still alive.
    pub blocks: usize,
    /// Requested bytes of those blocks.
    pub bytes: usize,
    /// Whether the blocks were freed by the sweep.
    pub reclaimed: bool,
}

impl LeakReport {
    /// True when nothing leaked.
    pub fn is_clean(&self) -> bool {
        self.blocks == 0
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} blocks / {} bytes leaked", self.blocks, self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_sums_chains() {
        let mut stats = TrackerStats::new();
        stats.absorb(ChainCounters { blocks: 2, bytes: 96, allocations: 5, releases: 3 });
        stats.absorb(ChainCounters { blocks: 1, bytes: 8, allocations: 1, releases: 0 });

        assert_eq!(
            stats,
            TrackerStats { contexts: 2, live_blocks: 3, live_bytes: 104, allocations: 6, releases: 3 }
        );
    }

    #[test]
    fn test_leak_report_display() {
        let report = LeakReport { blocks: 1, bytes: 64, reclaimed: true };
        assert_eq!(report.to_string(), "1 blocks / 64 bytes leaked");
        assert!(!report.is_clean());
        assert!(LeakReport::default().is_clean());
    }
}
