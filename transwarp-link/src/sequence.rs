use std::sync::atomic::{AtomicI32, Ordering};

/// Per-link monotonic sequence allocator. Single writer per direction; wrap
/// is not expected within a session.
#[derive(Debug, Default)]
pub struct Sequencer(AtomicI32);

impl Sequencer {
    pub fn new() -> Self {
        Self(AtomicI32::new(0))
    }

    pub fn next(&self) -> i32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictly_increasing_from_zero() {
        let sequencer = Sequencer::new();
        for expected in 0..100 {
            assert_eq!(sequencer.next(), expected);
        }
    }
}
