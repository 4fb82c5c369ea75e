//! Log aggregator: two append-only sequences, one per phase. They are never merged.

use botforge_sdk::LogEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Build,
    Runtime,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Build => write!(f, "build"),
            Phase::Runtime => write!(f, "runtime"),
        }
    }
}

#[derive(Debug, Default)]
pub struct LogAggregator {
    build: Vec<LogEntry>,
    runtime: Vec<LogEntry>,
    /// Length of the build log at the first entry into `BUILDING`. Entries
    /// before it come from planning and generation.
    build_boundary: Option<usize>,
}

impl LogAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, phase: Phase, entry: LogEntry) {
        match phase {
            Phase::Build => self.build.push(entry),
            Phase::Runtime => self.runtime.push(entry),
        }
    }

    pub fn entries(&self, phase: Phase) -> &[LogEntry] {
        match phase {
            Phase::Build => &self.build,
            Phase::Runtime => &self.runtime,
        }
    }

    /// Record the generation/build boundary. Only the first call has an effect.
    pub fn mark_build_boundary(&mut self) {
        if self.build_boundary.is_none() {
            self.build_boundary = Some(self.build.len());
        }
    }

    pub fn build_boundary(&self) -> Option<usize> {
        self.build_boundary
    }

    /// Drop build-attempt entries, keeping everything logged before the first
    /// build. Without a boundary every entry predates building and is kept.
    pub fn clear_build(&mut self) {
        let keep = self.build_boundary.unwrap_or(self.build.len());
        self.build.truncate(keep);
    }

    pub fn clear_runtime(&mut self) {
        self.runtime.clear();
    }

    /// Empty both logs and forget the boundary.
    pub fn clear_all(&mut self) {
        self.build.clear();
        self.runtime.clear();
        self.build_boundary = None;
    }
}
