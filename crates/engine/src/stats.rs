use std::fmt;

/// Counters of one engine run. Work done inside rolled back loop tests is
/// counted as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub functions_cloned: usize,
    pub calls_skipped: usize,

    pub loops_seen: usize,
    pub loops_unrolled: usize,
    pub loops_passed: usize,
    /// Tests that ran past the last unrolled copy.
    pub loops_failed: usize,
    /// Every test undone, for any reason.
    pub loops_rolled_back: usize,

    pub insts_folded: usize,
    pub blocks_removed: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "cloned {} functions, skipped {} calls; loops: {} seen, {} unrolled, {} passed, \
             {} failed, {} rolled back; folded {} insts, removed {} blocks",
            self.functions_cloned,
            self.calls_skipped,
            self.loops_seen,
            self.loops_unrolled,
            self.loops_passed,
            self.loops_failed,
            self.loops_rolled_back,
            self.insts_folded,
            self.blocks_removed,
        )
    }
}
