//! Batch count guard

/// Caps the number of fetches issued for one descriptor.
///
/// Evaluated before every fetch, so a reached cap prevents the next
/// round-trip instead of discarding its result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchLimiter {
    max_batches: Option<u32>,
}

impl BatchLimiter {
    /// Create a limiter; `None` never stops
    pub fn new(max_batches: Option<u32>) -> Self {
        Self { max_batches }
    }

    /// Whether another fetch may be issued after `batches_emitted` batches
    pub fn permits(&self, batches_emitted: u32) -> bool {
        match self.max_batches {
            Some(max) => batches_emitted < max,
            None => true,
        }
    }
}
