//! Integration tests: scheduler behaviour. Readiness ordering, waiter
//! exclusivity, deadlock detection, and cross-thread stop.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use pollring::{
    Backend, CancelToken, Engine, async_sleep, close, wait_readable, wait_readable_for,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn make_engine(backend: Backend) -> Option<Engine> {
    match Engine::new(backend) {
        Ok(engine) => Some(engine),
        Err(err) => {
            assert_eq!(
                backend,
                Backend::CompletionPoll,
                "readiness-poll engine must build: {err}"
            );
            eprintln!("skipping completion-poll run: {err}");
            None
        }
    }
}

fn make_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

// ── Pipe readiness ordering ─────────────────────────────────────────

/// A task parked on readability must not progress past the await until the
/// paired end is written from another thread.
fn pipe_readiness(backend: Backend) {
    let Some(mut engine) = make_engine(backend) else {
        return;
    };
    let (read_fd, write_fd) = make_pipe();
    let stage = Arc::new(AtomicU32::new(0));

    let writer = {
        let stage = stage.clone();
        thread::spawn(move || {
            while stage.load(Ordering::Acquire) != 1 {
                thread::sleep(Duration::from_millis(1));
            }
            stage.store(2, Ordering::Release);
            let byte = 1u8;
            let written = unsafe { libc::write(write_fd, (&raw const byte).cast(), 1) };
            assert_eq!(written, 1);
        })
    };

    engine.spawn({
        let stage = stage.clone();
        async move {
            stage.store(1, Ordering::Release);
            wait_readable(read_fd).await.unwrap();
            assert_eq!(stage.load(Ordering::Acquire), 2);
            stage.store(3, Ordering::Release);
        }
    });

    engine.run().unwrap();
    writer.join().unwrap();
    assert_eq!(stage.load(Ordering::Acquire), 3);

    close(read_fd).unwrap();
    close(write_fd).unwrap();
}

#[test]
fn pipe_readiness_readiness_poll() {
    pipe_readiness(Backend::ReadinessPoll);
}

#[test]
fn pipe_readiness_completion_poll() {
    pipe_readiness(Backend::CompletionPoll);
}

// ── Waiter exclusivity ──────────────────────────────────────────────

/// A second waiter in the same direction for the same descriptor is
/// refused with `EBUSY`; the first keeps its registration.
fn double_waiter_refused(backend: Backend) {
    let Some(mut engine) = make_engine(backend) else {
        return;
    };
    let (read_fd, write_fd) = make_pipe();
    let outcomes = Rc::new(RefCell::new(Vec::new()));

    engine.spawn({
        let outcomes = outcomes.clone();
        async move {
            let err = wait_readable_for(read_fd, Duration::from_millis(100))
                .await
                .unwrap_err();
            outcomes.borrow_mut().push(("first", err.value()));
        }
    });

    engine.spawn({
        let outcomes = outcomes.clone();
        async move {
            let err = wait_readable(read_fd).await.unwrap_err();
            outcomes.borrow_mut().push(("second", err.value()));
        }
    });

    engine.run().unwrap();

    let outcomes = outcomes.borrow();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.contains(&("second", libc::EBUSY)));
    assert!(outcomes.contains(&("first", libc::ETIMEDOUT)));

    close(read_fd).unwrap();
    close(write_fd).unwrap();
}

#[test]
fn double_waiter_refused_readiness_poll() {
    double_waiter_refused(Backend::ReadinessPoll);
}

#[test]
fn double_waiter_refused_completion_poll() {
    double_waiter_refused(Backend::CompletionPoll);
}

// ── Deadlock detection ──────────────────────────────────────────────

/// An active task with no pending waiters and nothing ready can never make
/// progress; `run` surfaces `EDEADLK` instead of blocking forever.
fn deadlock_detected(backend: Backend) {
    let Some(mut engine) = make_engine(backend) else {
        return;
    };
    engine.spawn(std::future::pending::<()>());
    let err = engine.run().unwrap_err();
    assert_eq!(err.value(), libc::EDEADLK);
}

#[test]
fn deadlock_detected_readiness_poll() {
    deadlock_detected(Backend::ReadinessPoll);
}

#[test]
fn deadlock_detected_completion_poll() {
    deadlock_detected(Backend::CompletionPoll);
}

// ── Cross-thread stop ───────────────────────────────────────────────

/// `stop()` from another thread must unblock a reactor wait promptly and
/// leave no latched loop error.
fn stop_unblocks_run(backend: Backend) {
    let Some(mut engine) = make_engine(backend) else {
        return;
    };
    let handle = engine.stop_handle();

    engine.spawn(async {
        let _ = async_sleep(Duration::from_secs(5), CancelToken::default()).await;
    });

    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.stop();
    });

    let started = Instant::now();
    engine.run().unwrap();
    let elapsed = started.elapsed();

    stopper.join().unwrap();
    assert!(
        elapsed < Duration::from_millis(500),
        "stop took {elapsed:?}"
    );
}

#[test]
fn stop_unblocks_run_readiness_poll() {
    stop_unblocks_run(Backend::ReadinessPoll);
}

#[test]
fn stop_unblocks_run_completion_poll() {
    stop_unblocks_run(Backend::CompletionPoll);
}

// ── Spawn ordering ──────────────────────────────────────────────────

/// Freshly spawned tasks are queued, not run inline, and resume FIFO.
fn spawn_is_deferred(backend: Backend) {
    let Some(mut engine) = make_engine(backend) else {
        return;
    };
    let order = Rc::new(RefCell::new(Vec::new()));

    for label in 0..4 {
        let order = order.clone();
        engine.spawn(async move {
            order.borrow_mut().push(label);
        });
    }

    assert!(order.borrow().is_empty(), "spawn must not run tasks inline");
    engine.run().unwrap();
    assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
}

#[test]
fn spawn_is_deferred_readiness_poll() {
    spawn_is_deferred(Backend::ReadinessPoll);
}

#[test]
fn spawn_is_deferred_completion_poll() {
    spawn_is_deferred(Backend::CompletionPoll);
}
