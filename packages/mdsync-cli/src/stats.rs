// Run statistics
use std::fmt;

/// Counters for one run. Only the aggregator mutates them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStatistics {
    /// Documents discovered
    pub files_total: usize,
    /// Documents scanned
    pub files_processed: usize,
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Documents whose links were rewritten
    pub files_changed: usize,
}

impl RunStatistics {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

impl fmt::Display for RunStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Upload Statistics:")?;
        writeln!(f, "  Total Files Processed: {}", self.files_processed)?;
        writeln!(f, "  Images Uploaded: {}", self.uploaded)?;
        writeln!(f, "  Images Skipped: {}", self.skipped)?;
        writeln!(f, "  Failed Uploads: {}", self.failed)?;
        write!(f, "  Files Changed: {}", self.files_changed)
    }
}
