use std::path::PathBuf;

/// Default byte budget for the in-memory buffer (64MB).
pub const DEFAULT_BUFFER_BUDGET: usize = 64 * 1024 * 1024;

/// Configuration for an LSM tree instance.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Byte budget for the active memory buffer before it is rotated
    /// out for flushing (default: 64MB)
    pub buffer_budget: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cinderdb"),
            buffer_budget: DEFAULT_BUFFER_BUDGET,
        }
    }
}

impl TreeConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the memory buffer byte budget
    pub fn buffer_budget(mut self, budget: usize) -> Self {
        self.buffer_budget = budget;
        self
    }
}
