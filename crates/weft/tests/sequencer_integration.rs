//! Sequencer Integration Tests
//!
//! Tests validate:
//! - Same-key tasks run in submission order, disjoint keys run concurrently
//! - Multi-key and universal submissions
//! - Failures unblock successors and reach the exception callback
//! - Key collection, statistics and drain
//!
//! # Running Tests
//! ```bash
//! cargo test --test sequencer_integration
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use weft::{Configuration, Dispatcher, Error, Sequencer, SequencerConfiguration};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn setup(coro_threads: usize) -> (Dispatcher, Sequencer<u32>) {
    init_logging();
    let dispatcher =
        Dispatcher::new(Configuration::default().with_coro_threads(coro_threads)).unwrap();
    let sequencer = dispatcher.sequencer(SequencerConfiguration::default());
    (dispatcher, sequencer)
}

// ===== Ordering =====

#[test]
fn test_same_key_runs_in_submission_order() {
    let (_dispatcher, sequencer) = setup(4);
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut futures = Vec::new();
    for seq in 0..40u32 {
        let key = seq % 4;
        let log = log.clone();
        futures.push(
            sequencer
                .enqueue(key, move |ctx| async move {
                    // Uneven work so later tasks would overtake without ordering
                    if seq % 3 == 0 {
                        ctx.sleep(Duration::from_millis(2)).await;
                    } else {
                        ctx.yield_now().await;
                    }
                    log.lock().push((key, seq));
                    Ok(())
                })
                .unwrap(),
        );
    }
    for future in futures {
        future.get().unwrap();
    }

    let log = log.lock();
    assert_eq!(log.len(), 40);
    for key in 0..4 {
        let seqs: Vec<u32> = log.iter().filter(|(k, _)| *k == key).map(|(_, s)| *s).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted, "key {} ran out of order", key);
    }
}

#[test]
fn test_disjoint_keys_do_not_wait() {
    let (_dispatcher, sequencer) = setup(2);
    let (promise, blocker) = weft::channel::<()>();

    // Key 1 is stuck until the promise is set
    let stuck = sequencer
        .enqueue(1, move |ctx| async move { ctx.wait(&blocker).await })
        .unwrap();
    let other = sequencer.enqueue(2, |_| async { Ok("free") }).unwrap();
    assert_eq!(other.get().unwrap(), "free");

    let behind = sequencer.enqueue(1, |_| async { Ok("after") }).unwrap();
    assert!(!behind.is_ready());
    promise.set_value(()).unwrap();
    stuck.get().unwrap();
    assert_eq!(behind.get().unwrap(), "after");
}

#[test]
fn test_multi_key_waits_for_every_key() {
    let (_dispatcher, sequencer) = setup(2);
    let order = Arc::new(Mutex::new(Vec::new()));
    let (release_a, gate_a) = weft::channel::<()>();
    let (release_b, gate_b) = weft::channel::<()>();

    let log = order.clone();
    let a = sequencer
        .enqueue(10, move |ctx| async move {
            ctx.wait(&gate_a).await?;
            log.lock().push("a");
            Ok(())
        })
        .unwrap();
    let log = order.clone();
    let b = sequencer
        .enqueue(20, move |ctx| async move {
            ctx.wait(&gate_b).await?;
            log.lock().push("b");
            Ok(())
        })
        .unwrap();
    let log = order.clone();
    let both = sequencer
        .enqueue_multi(vec![10, 20, 10], move |_| async move {
            log.lock().push("both");
            Ok(())
        })
        .unwrap();

    release_b.set_value(()).unwrap();
    b.get().unwrap();
    assert!(!both.is_ready());
    release_a.set_value(()).unwrap();
    a.get().unwrap();
    both.get().unwrap();
    assert_eq!(*order.lock(), vec!["b", "a", "both"]);
}

#[test]
fn test_universal_key_orders_everything() {
    let (_dispatcher, sequencer) = setup(4);
    let finished = Arc::new(AtomicUsize::new(0));

    let before: Vec<_> = (0..8u32)
        .map(|key| {
            let finished = finished.clone();
            sequencer
                .enqueue(key, move |ctx| async move {
                    ctx.sleep(Duration::from_millis(5)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap()
        })
        .collect();

    let seen_by_barrier = {
        let finished = finished.clone();
        sequencer
            .enqueue_all(move |_| async move { Ok(finished.load(Ordering::SeqCst)) })
            .unwrap()
    };
    let seen_after = {
        let finished = finished.clone();
        sequencer
            .enqueue(99, move |_| async move { Ok(finished.load(Ordering::SeqCst)) })
            .unwrap()
    };

    assert_eq!(seen_by_barrier.get().unwrap(), 8);
    assert_eq!(seen_after.get().unwrap(), 8);
    for future in before {
        future.get().unwrap();
    }
    assert_eq!(sequencer.universal_statistics().posted, 1);
}

// ===== Failures =====

#[test]
fn test_failure_unblocks_successor_and_reports() {
    init_logging();
    let dispatcher = Dispatcher::new(Configuration::default().with_coro_threads(2)).unwrap();
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = reported.clone();
    let sequencer: Sequencer<&'static str> = dispatcher.sequencer(
        SequencerConfiguration::default()
            .with_exception_callback(move |error| sink.lock().push(error.to_string())),
    );

    let failing = sequencer
        .enqueue("acct", |_| async { Err::<(), _>(Error::msg("declined")) })
        .unwrap();
    let panicking = sequencer
        .enqueue("acct", |_| async {
            if true {
                panic!("ledger corrupted");
            }
            Ok(())
        })
        .unwrap();
    let next = sequencer.enqueue("acct", |_| async { Ok(3) }).unwrap();

    assert!(matches!(failing.get(), Err(Error::Message(_))));
    assert!(matches!(panicking.get(), Err(Error::Panicked(_))));
    assert_eq!(next.get().unwrap(), 3);

    let reported = reported.lock();
    assert_eq!(reported.len(), 2);
    assert!(reported[0].contains("declined"));
    assert!(reported[1].contains("ledger corrupted"));
}

// ===== Bookkeeping =====

#[test]
fn test_statistics_and_key_collection() {
    let (_dispatcher, sequencer) = setup(2);
    let (promise, blocker) = weft::channel::<()>();

    let first = sequencer
        .enqueue(7, move |ctx| async move { ctx.wait(&blocker).await })
        .unwrap();
    let second = sequencer.enqueue(7, |_| async { Ok(()) }).unwrap();

    let stats = sequencer.statistics(&7).unwrap();
    assert_eq!(stats.posted, 2);
    assert_eq!(stats.pending, 2);
    assert_eq!(sequencer.sequence_key_count(), 1);
    assert!(sequencer.statistics(&8).is_none());

    promise.set_value(()).unwrap();
    first.get().unwrap();
    second.get().unwrap();

    assert!(sequencer.drain(Some(Duration::from_secs(5)), false));
    assert_eq!(sequencer.sequence_key_count(), 0);
    assert_eq!(sequencer.trim_sequence_keys(), 0);
    assert!(sequencer.statistics(&7).is_none());

    let totals = sequencer.task_statistics();
    // Two keyed tasks plus the drain marker
    assert_eq!(totals.posted, 3);
    assert_eq!(totals.pending, 0);
    assert!(totals.max_wait <= totals.total_wait);
}

#[test]
fn test_final_drain_rejects_enqueue() {
    let (_dispatcher, sequencer) = setup(2);
    let done = sequencer
        .enqueue(1, |ctx| async move {
            ctx.sleep(Duration::from_millis(10)).await;
            Ok(())
        })
        .unwrap();

    assert!(sequencer.drain(None, true));
    assert!(done.is_ready());
    assert!(sequencer.is_draining());
    assert!(matches!(
        sequencer.enqueue(1, |_| async { Ok(()) }),
        Err(Error::Draining)
    ));
}

#[test]
fn test_enqueue_from_coroutine_while_draining() {
    let (dispatcher, sequencer) = setup(2);
    let inner = sequencer.clone();
    let (promise, blocker) = weft::channel::<()>();

    let outer = sequencer
        .enqueue(1, move |ctx| async move {
            ctx.wait(&blocker).await?;
            // Workers may still submit while the sequencer drains
            inner.enqueue(2, |_| async { Ok(5) })
        })
        .unwrap();

    let drainer = {
        let sequencer = sequencer.clone();
        std::thread::spawn(move || sequencer.drain(Some(Duration::from_secs(5)), false))
    };
    while !sequencer.is_draining() {
        std::thread::yield_now();
    }
    promise.set_value(()).unwrap();
    let child = outer.get().unwrap();
    assert_eq!(child.get().unwrap(), 5);
    assert!(drainer.join().unwrap());
    assert!(!sequencer.is_draining());
    drop(dispatcher);
}
