//! Runtime counters.
//!
//! Exposed through [`metriken`] statics so embedders can register them with
//! whatever exposition layer they already run.

use metriken::{Counter, metric};

#[metric(
    name = "pollring/tasks/spawned",
    description = "Root tasks spawned onto an event loop"
)]
pub static TASKS_SPAWNED: Counter = Counter::new();

#[metric(
    name = "pollring/waiters/armed",
    description = "Readiness waiters registered with a reactor"
)]
pub static WAITERS_ARMED: Counter = Counter::new();

#[metric(
    name = "pollring/waiters/timed_out",
    description = "Waiters whose deadline fired before readiness"
)]
pub static WAITERS_TIMED_OUT: Counter = Counter::new();

#[metric(
    name = "pollring/loop/cross_thread_wakes",
    description = "Wake-ups observed on the wake eventfd"
)]
pub static CROSS_THREAD_WAKES: Counter = Counter::new();

#[metric(
    name = "pollring/resolver/jobs",
    description = "Resolve jobs handed to the worker thread"
)]
pub static RESOLVER_JOBS: Counter = Counter::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let before = TASKS_SPAWNED.value();
        TASKS_SPAWNED.increment();
        assert!(TASKS_SPAWNED.value() > before);
    }
}
