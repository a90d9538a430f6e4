//! Integration tests: endpoint parsing and worker-thread resolution.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use pollring::{
    Backend, CancelSource, CancelToken, Engine, async_resolve, format_endpoint,
    parse_ipv4_endpoint,
};

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

// ── Endpoint parsing ────────────────────────────────────────────────

#[test]
fn parse_round_trips_through_format() {
    let endpoint = parse_ipv4_endpoint("127.0.0.1:8080").unwrap();
    assert_eq!(format_endpoint(&endpoint), "127.0.0.1:8080");
}

#[test]
fn parse_rejects_malformed_endpoints() {
    for input in ["127.0.0.1", "bad-ip:80", "127.0.0.1:70000"] {
        let err = parse_ipv4_endpoint(input).unwrap_err();
        assert_eq!(err.value(), libc::EINVAL, "input: {input:?}");
    }
}

// ── Resolution ──────────────────────────────────────────────────────

/// `localhost` resolves to at least one endpoint carrying the requested
/// port.
fn resolve_localhost(backend: Backend) {
    let Some(mut engine) = make_engine(backend) else {
        return;
    };
    let resolved = Rc::new(RefCell::new(Vec::new()));

    engine.spawn({
        let resolved = resolved.clone();
        async move {
            let endpoints = async_resolve("localhost", "80", CancelToken::default())
                .await
                .unwrap();
            *resolved.borrow_mut() = endpoints;
        }
    });

    engine.run().unwrap();

    let resolved = resolved.borrow();
    assert!(!resolved.is_empty());
    for endpoint in resolved.iter() {
        assert_eq!(endpoint.port, 80);
    }
}

#[test]
fn resolve_localhost_readiness_poll() {
    resolve_localhost(Backend::ReadinessPoll);
}

#[test]
fn resolve_localhost_completion_poll() {
    resolve_localhost(Backend::CompletionPoll);
}

#[test]
fn pre_cancelled_resolve_skips_the_worker() {
    let mut engine = Engine::new(Backend::ReadinessPoll).unwrap();
    let source = CancelSource::new();
    source.request_stop();
    let token = source.token();

    engine.spawn(async move {
        let err = async_resolve("localhost", "80", token).await.unwrap_err();
        assert_eq!(err.value(), libc::ECANCELED);
    });

    let started = Instant::now();
    engine.run().unwrap();
    assert!(started.elapsed() < Duration::from_millis(50));
}

#[test]
fn invalid_resolve_arguments_are_rejected() {
    let mut engine = Engine::new(Backend::ReadinessPoll).unwrap();

    engine.spawn(async {
        let err = async_resolve("", "80", CancelToken::default())
            .await
            .unwrap_err();
        assert_eq!(err.value(), libc::EINVAL);

        let err = async_resolve("localhost", "70000", CancelToken::default())
            .await
            .unwrap_err();
        assert_eq!(err.value(), libc::EINVAL);
    });

    engine.run().unwrap();
}

#[test]
fn unresolvable_name_surfaces_errno_code() {
    let mut engine = Engine::new(Backend::ReadinessPoll).unwrap();

    engine.spawn(async {
        let err = async_resolve("name.invalid", "80", CancelToken::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.value(),
            libc::ENOENT | libc::EAGAIN | libc::EHOSTUNREACH
        ));
    });

    engine.run().unwrap();
}
