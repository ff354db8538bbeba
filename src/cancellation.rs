//! Cancellation framework: CancellationToken + generation guard.
//! Each new session advances the generation and cancels the previous token,
//! so a superseded stream can neither keep reading nor publish output.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Issues one token per generation; advancing cancels the previous one.
pub struct TaskGeneration {
    current_token: Mutex<CancellationToken>,
    generation: Arc<AtomicU64>,
}

impl TaskGeneration {
    pub fn new() -> Self {
        Self {
            current_token: Mutex::new(CancellationToken::new()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cancel the current generation and start the next one.
    pub fn cancel_and_advance(&self) -> GenerationGuard {
        let mut token = self.current_token.lock();
        token.cancel();
        *token = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        GenerationGuard {
            generation: Arc::clone(&self.generation),
            my_generation: generation,
            token: token.child_token(),
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

impl Default for TaskGeneration {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by a running session; checked at every chunk boundary.
#[derive(Clone)]
pub struct GenerationGuard {
    generation: Arc<AtomicU64>,
    my_generation: u64,
    token: CancellationToken,
}

impl GenerationGuard {
    /// Returns true if no newer generation has started.
    #[inline]
    pub fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.my_generation
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Not cancelled and still current.
    #[inline]
    pub fn should_continue(&self) -> bool {
        !self.is_cancelled() && self.is_current()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn my_generation(&self) -> u64 {
        self.my_generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advancing_cancels_the_previous_guard() {
        let generations = TaskGeneration::new();
        let first = generations.cancel_and_advance();
        assert_eq!(first.my_generation(), 1);
        assert!(first.should_continue());

        let second = generations.cancel_and_advance();
        assert!(first.is_cancelled());
        assert!(!first.is_current());
        assert!(!first.should_continue());
        assert!(second.should_continue());
        assert_eq!(generations.current_generation(), 2);
    }

    #[test]
    fn guard_cancel_is_local() {
        let generations = TaskGeneration::new();
        let guard = generations.cancel_and_advance();
        guard.cancel();
        assert!(!guard.should_continue());
        let next = generations.cancel_and_advance();
        assert!(next.should_continue());
    }
}
