//! Progress reporting and the cancellable sleep it's built on top of.
//!
//! The callback is the only cancellation channel the driver has: it's consulted on every
//! tick, and a tick happens at every tangible unit of work (one block transferred, one erase
//! completed, one 4ms slice of a mandated delay). There is no separate cancellation token.

use std::thread::sleep;
use std::time::Duration;

use crate::error::Cancelled;

pub const MIN_PROGRESS: u32 = 0;
pub const MAX_PROGRESS: u32 = 1_000_000;

/// A single 4ms tick of [`sleep_ms`]. Kept small and constant so a long SPI erase wait still
/// gives the caller's callback a chance to cancel within a bounded latency.
const SLEEP_QUANTUM_MS: u64 = 4;

/// Callback invoked on every progress tick with the running counter in `[0, MAX_PROGRESS]`.
/// Returning `Err` cancels the in-flight operation.
pub type ProgressCallback<'a> = Box<dyn FnMut(u32) -> Result<(), Cancelled> + 'a>;

/// Holds the optional progress callback and the monotone counter it drives. Not `Clone`:
/// a callback is a function value scoped to a single operation, not long-lived shared state.
#[derive(Default)]
pub struct ProgressState<'a> {
    callback: Option<ProgressCallback<'a>>,
    counter: u32,
    increment: u32,
}

impl<'a> ProgressState<'a> {
    pub fn new() -> Self {
        Self {
            callback: None,
            counter: MIN_PROGRESS,
            increment: 0,
        }
    }

    pub fn set_callback(&mut self, callback: Option<ProgressCallback<'a>>) {
        self.callback = callback;
    }

    /// Prepare for `count` ticks spread evenly across `[0, MAX_PROGRESS]` and reset the
    /// counter to zero. `count` of `0` disables the increment (only `final_progress` will
    /// move the counter).
    pub fn set_max_progress(&mut self, count: u32) {
        self.counter = MIN_PROGRESS;
        self.increment = if count == 0 { 0 } else { MAX_PROGRESS / count };
    }

    /// Advance the counter by one increment and invoke the callback.
    pub fn tick(&mut self) -> Result<(), Cancelled> {
        self.counter = self.counter.saturating_add(self.increment).min(MAX_PROGRESS);
        self.invoke()
    }

    /// Clamp the counter to `MAX_PROGRESS` and fire a final callback invocation.
    pub fn final_progress(&mut self) -> Result<(), Cancelled> {
        self.counter = MAX_PROGRESS;
        self.invoke()
    }

    fn invoke(&mut self) -> Result<(), Cancelled> {
        match &mut self.callback {
            Some(cb) => cb(self.counter),
            None => Ok(()),
        }
    }

    /// Wait out a nominal `n` milliseconds as `n` quanta of (tick, sleep `SLEEP_QUANTUM_MS`).
    /// Actual wall time is therefore `n * SLEEP_QUANTUM_MS` ms, not `n` ms: every call site in
    /// this crate (the 100ms post-command delay, the 2000ms programming-mode delay, the 500ms
    /// SPI erase wait) passes its nominal millisecond count straight through and ends up
    /// waiting four times as long. This is intentional — it dilates progress granularity over
    /// long SPI operations — and is preserved rather than "fixed" without hardware to test
    /// against.
    pub fn sleep_ms(&mut self, n: u32) -> Result<(), Cancelled> {
        for _ in 0..n {
            self.tick()?;
            sleep(Duration::from_millis(SLEEP_QUANTUM_MS));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn counter_is_non_decreasing_and_final_progress_clamps_to_max() {
        let seen = RefCell::new(Vec::new());
        let mut state = ProgressState::new();
        state.set_callback(Some(Box::new(|counter| {
            seen.borrow_mut().push(counter);
            Ok(())
        })));
        state.set_max_progress(7);

        for _ in 0..7 {
            state.tick().unwrap();
        }
        state.final_progress().unwrap();

        let observed = seen.into_inner();
        assert!(observed.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(*observed.last().unwrap(), MAX_PROGRESS);
    }

    #[test]
    fn zero_count_disables_ticks_but_final_progress_still_clamps() {
        let mut state = ProgressState::new();
        state.set_max_progress(0);
        state.tick().unwrap();
        assert_eq!(state.counter, MIN_PROGRESS);
        state.final_progress().unwrap();
        assert_eq!(state.counter, MAX_PROGRESS);
    }

    #[test]
    fn callback_error_cancels_and_sleep_ms_stops_sleeping() {
        let mut state = ProgressState::new();
        let calls = RefCell::new(0u32);
        state.set_callback(Some(Box::new(|_counter| {
            *calls.borrow_mut() += 1;
            if *calls.borrow() == 2 {
                Err(Cancelled)
            } else {
                Ok(())
            }
        })));

        assert!(state.sleep_ms(10).is_err());
        assert_eq!(*calls.borrow(), 2);
    }
}
