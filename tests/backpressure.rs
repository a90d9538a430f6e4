//! Integration tests: queued-writer backpressure state machine and
//! graceful shutdown over a live loopback connection.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use pollring::{
    Backend, BackpressureState, CancelToken, Endpoint, Engine, QueuedWriter, TcpListener,
    Watermarks, async_accept, async_connect, async_read_some,
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

/// Full watermark sequence: normal → high watermark → refusal → drained →
/// normal again → graceful shutdown, with the peer seeing every byte.
fn backpressure_sequence(backend: Backend) {
    let Some(mut engine) = make_engine(backend) else {
        return;
    };
    let listener = TcpListener::bind(&Endpoint::loopback(0), 8).unwrap();
    let port = listener.local_port().unwrap();
    let server_total = Rc::new(Cell::new(0usize));

    engine.spawn({
        let server_total = server_total.clone();
        async move {
            let peer = async_accept(&listener).await.unwrap();
            let mut buf = [0u8; 4096];
            loop {
                let count = async_read_some(&peer, &mut buf).await.unwrap();
                if count == 0 {
                    break;
                }
                server_total.set(server_total.get() + count);
            }
        }
    });

    engine.spawn(async move {
        let stream = async_connect(&Endpoint::loopback(port)).await.unwrap();
        let mut writer = QueuedWriter::new(
            stream,
            Watermarks {
                low: 4096,
                high: 8192,
            },
        );

        assert_eq!(
            writer.enqueue(&vec![1u8; 6000]).unwrap(),
            BackpressureState::Normal
        );
        assert_eq!(
            writer.enqueue(&vec![2u8; 6000]).unwrap(),
            BackpressureState::HighWatermark
        );
        assert!(writer.high_watermark_active());

        let err = writer.enqueue(&[3u8; 64]).unwrap_err();
        assert_eq!(err.value(), libc::EWOULDBLOCK);

        writer
            .flush(Duration::from_secs(2), CancelToken::default())
            .await
            .unwrap();
        assert_eq!(writer.queued_bytes(), 0);
        assert!(!writer.high_watermark_active());

        assert_eq!(
            writer.enqueue(&[4u8; 64]).unwrap(),
            BackpressureState::Normal
        );
        writer
            .graceful_shutdown(Duration::from_secs(2), CancelToken::default())
            .await
            .unwrap();
    });

    engine.run().unwrap();
    assert_eq!(server_total.get(), 6000 + 6000 + 64);
}

#[test]
fn backpressure_sequence_readiness_poll() {
    backpressure_sequence(Backend::ReadinessPoll);
}

#[test]
fn backpressure_sequence_completion_poll() {
    backpressure_sequence(Backend::CompletionPoll);
}

/// Flushing against a peer that never reads runs out of time once the
/// socket buffers fill.
fn flush_times_out_against_stalled_peer(backend: Backend) {
    let Some(mut engine) = make_engine(backend) else {
        return;
    };
    let listener = TcpListener::bind(&Endpoint::loopback(0), 8).unwrap();
    let port = listener.local_port().unwrap();
    let held_peer = Rc::new(std::cell::RefCell::new(None));

    engine.spawn({
        let held_peer = held_peer.clone();
        async move {
            // Accept, then never read so the kernel buffers back up.
            let peer = async_accept(&listener).await.unwrap();
            *held_peer.borrow_mut() = Some(peer);
        }
    });

    engine.spawn(async move {
        let stream = async_connect(&Endpoint::loopback(port)).await.unwrap();
        stream.set_send_buffer_size(8 * 1024).unwrap();
        let mut writer = QueuedWriter::new(
            stream,
            Watermarks {
                low: 1 << 20,
                high: 8 << 20,
            },
        );

        // Far more than the send buffer can absorb.
        for _ in 0..64 {
            writer.enqueue(&vec![0u8; 64 * 1024]).unwrap();
        }

        let err = writer
            .flush(Duration::from_millis(200), CancelToken::default())
            .await
            .unwrap_err();
        assert_eq!(err.value(), libc::ETIMEDOUT);
        assert!(writer.queued_bytes() > 0);
    });

    engine.run().unwrap();
}

#[test]
fn flush_times_out_against_stalled_peer_readiness_poll() {
    flush_times_out_against_stalled_peer(Backend::ReadinessPoll);
}

#[test]
fn flush_times_out_against_stalled_peer_completion_poll() {
    flush_times_out_against_stalled_peer(Backend::CompletionPoll);
}
