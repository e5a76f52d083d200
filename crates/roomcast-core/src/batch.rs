//! Batched notification scheduler.
//!
//! Coalesces every call made within one scheduling window into a single
//! invocation of the bound handler, which receives all values in call order.
//!
//! There are no timer threads. A batch records when it was armed and reports a
//! deadline; the owning state machine fires it from its `poll(now)`. A batch in
//! the [`Window::Yield`] mode is due on the very next poll, which the drivers
//! run once per scheduling pass, before any deadline-based work.
//!
//! ```text
//! push(a) ──┐
//! push(b) ──┼──► [a, b, c] ── armed ──► poll/flush ──► handler(owner, [a, b, c])
//! push(c) ──┘
//! ```

use std::{ops::Add, time::Duration};

/// How long a batch collects values before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Window {
    /// Fire as soon as the current scheduling pass yields.
    #[default]
    Yield,
    /// Fire once the given delay has elapsed since the batch was armed.
    Delay(Duration),
}

/// A stateful batched call bound to a handler.
///
/// The handler is a plain function taking the owner explicitly, so the batch
/// can live beside the state it operates on without borrowing it.
pub struct Batched<S, T, I> {
    window: Window,
    values: Vec<T>,
    armed_at: Option<I>,
    handler: fn(&mut S, Vec<T>),
}

impl<S, T, I> Batched<S, T, I>
where
    I: Copy + Ord + Add<Duration, Output = I>,
{
    /// Wrap `handler` in a batch with the given window.
    pub fn new(window: Window, handler: fn(&mut S, Vec<T>)) -> Self {
        Self { window, values: Vec::new(), armed_at: None, handler }
    }

    /// Queue a value, arming the batch if it is not armed yet.
    pub fn push(&mut self, value: T, now: I) {
        self.values.push(value);
        if self.armed_at.is_none() {
            self.armed_at = Some(now);
        }
    }

    /// Whether a fire is pending.
    pub fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }

    /// Values collected so far.
    pub fn pending(&self) -> &[T] {
        &self.values
    }

    /// Configured window.
    pub fn window(&self) -> Window {
        self.window
    }

    /// When the batch becomes due. `None` while disarmed.
    pub fn deadline(&self) -> Option<I> {
        let armed_at = self.armed_at?;
        Some(match self.window {
            Window::Yield => armed_at,
            Window::Delay(delay) => armed_at + delay,
        })
    }

    /// Whether the batch would fire on a poll at `now`.
    pub fn is_due(&self, now: I) -> bool {
        match self.window {
            Window::Yield => self.is_armed(),
            Window::Delay(_) => self.deadline().is_some_and(|deadline| deadline <= now),
        }
    }

    /// Fire the batch if it is due. Returns whether the handler ran.
    pub fn fire_if_due(&mut self, owner: &mut S, now: I) -> bool {
        if self.is_due(now) { self.flush(owner) } else { false }
    }

    /// Run any pending batch immediately. No-op when disarmed.
    ///
    /// The buffer is swapped out and the batch disarmed before the handler
    /// runs, so a value pushed from within the handler arms a fresh batch.
    pub fn flush(&mut self, owner: &mut S) -> bool {
        if self.armed_at.take().is_none() {
            return false;
        }
        let values = std::mem::take(&mut self.values);
        (self.handler)(owner, values);
        true
    }
}

impl<S, T: std::fmt::Debug, I: std::fmt::Debug> std::fmt::Debug for Batched<S, T, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batched")
            .field("window", &self.window)
            .field("values", &self.values)
            .field("armed_at", &self.armed_at)
            .finish_non_exhaustive()
    }
}
