//! Property-based tests for the batched scheduler

use std::time::Duration;

use proptest::prelude::*;
use roomcast_core::{Batched, Window};

#[derive(Default)]
struct Sink {
    calls: Vec<Vec<u32>>,
}

fn collect(sink: &mut Sink, values: Vec<u32>) {
    sink.calls.push(values);
}

proptest! {
    /// Property: N calls within one window produce exactly one invocation
    /// carrying all N values in call order
    #[test]
    fn prop_window_coalesces_in_order(
        values in prop::collection::vec(any::<u32>(), 1..50),
        delay_ms in 0u64..1_000,
    ) {
        let delay = Duration::from_millis(delay_ms);
        let mut sink = Sink::default();
        let mut batch = Batched::new(Window::Delay(delay), collect);

        for value in &values {
            batch.push(*value, Duration::ZERO);
        }
        prop_assert!(batch.fire_if_due(&mut sink, delay));
        prop_assert!(!batch.fire_if_due(&mut sink, delay));
        prop_assert_eq!(sink.calls, vec![values]);
    }

    /// Property: repeated flushes run the handler at most once per arming
    #[test]
    fn prop_flush_is_idempotent(values in prop::collection::vec(any::<u32>(), 0..10), flushes in 1usize..5) {
        let mut sink = Sink::default();
        let mut batch = Batched::new(Window::Yield, collect);
        for value in &values {
            batch.push(*value, Duration::ZERO);
        }

        let ran = (0..flushes).filter(|_| batch.flush(&mut sink)).count();
        prop_assert_eq!(ran, usize::from(!values.is_empty()));
        prop_assert_eq!(sink.calls.len(), ran);
    }
}
