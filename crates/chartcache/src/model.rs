//! Shared cache-facing types: libraries, coverages, chunk keys, priorities.

/// One library of one database, with bounds already projected into cache
/// coordinates. The library number is its row in the cache's `libraries`
/// table, stable for the life of the cache directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Library {
    pub library_num: i32,
    pub database_num: i32,
    pub name: String,
    pub x_min: f32,
    pub x_max: f32,
    pub y_min: f32,
    pub y_max: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coverage {
    pub coverage_num: i32,
    pub name: String,
}

/// Identifies one chunk of one cache: all features of one coverage of one
/// library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub library_num: i32,
    pub coverage_num: i32,
}

/// Caller-supplied urgency for a chunk conversion. Re-evaluated at dequeue
/// time, so a chunk that has scrolled off screen can be deferred or dropped
/// without ever being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChunkPriority {
    /// Not wanted; an enqueued job re-evaluating to Skip is abandoned.
    Skip,
    Nice,
    Default,
    Soon,
    Immediate,
}

impl ChunkPriority {
    pub fn rank(self) -> i32 {
        match self {
            ChunkPriority::Skip => -2,
            ChunkPriority::Nice => -1,
            ChunkPriority::Default => 0,
            ChunkPriority::Soon => 1,
            ChunkPriority::Immediate => 2,
        }
    }

    /// High-urgency levels serve newest-first; the rest oldest-first.
    pub fn lifo(self) -> bool {
        matches!(self, ChunkPriority::Soon | ChunkPriority::Immediate)
    }
}

/// Coverages that dominate what a chart viewer shows convert first. Unlisted
/// coverages rank after all listed ones, ties broken by name.
const COVERAGE_SIGNIFICANCE: &[&str] = &[
    "ecr", "lcr", "hyd", "iwy", "env", "rel", "coa", "por", "lim", "obs", "nav", "cul", "dqy",
];

pub fn coverage_significance(coverage_name: &str) -> usize {
    COVERAGE_SIGNIFICANCE
        .iter()
        .position(|&c| c == coverage_name)
        .unwrap_or(COVERAGE_SIGNIFICANCE.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ranks_and_lifo() {
        assert_eq!(ChunkPriority::Skip.rank(), -2);
        assert_eq!(ChunkPriority::Immediate.rank(), 2);
        assert!(ChunkPriority::Skip < ChunkPriority::Nice);
        assert!(ChunkPriority::Soon < ChunkPriority::Immediate);
        assert!(!ChunkPriority::Default.lifo());
        assert!(ChunkPriority::Soon.lifo());
        assert!(ChunkPriority::Immediate.lifo());
    }

    #[test]
    fn unknown_coverages_rank_last() {
        assert!(coverage_significance("ecr") < coverage_significance("nav"));
        assert!(coverage_significance("nav") < coverage_significance("zzz"));
    }
}
