//! End-to-end scenarios through the assembled runtime
//!
//! Each test plays out one realistic host workload against a running
//! CorrelationRuntime: dispatcher fans work out, workers link and expire
//! on their own threads, and the runtime's reaper cleans up whatever is
//! abandoned.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use tracelink::{
    names, ActivityKey, CorrelationConfig, CorrelationRuntime, CountingMetricsSink,
    ExecutionContext, TimeoutCause, TracerHandle, TransactionContext, TransactionListener,
    TransactionState,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn wait_for_close(txn: &TransactionContext, within: Duration) {
    let deadline = Instant::now() + within;
    while txn.state() != TransactionState::Closed && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn fan_out_fan_in_closes_after_the_last_worker() {
    init_tracing();
    const WORKERS: usize = 6;

    let runtime = CorrelationRuntime::start(CorrelationConfig::new()).unwrap();
    let registry = runtime.registry().clone();

    let txn = registry.begin_transaction();
    let barrier = Arc::new(Barrier::new(WORKERS + 1));
    let mut handles = Vec::new();
    for worker in 0..WORKERS {
        let token = registry.create_token(&txn);
        assert!(!token.is_noop());
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let mut ctx = ExecutionContext::detached();
            assert!(token.link(&mut ctx));
            token.set_tracer(TracerHandle::new(worker as u64 + 1).unwrap());
            barrier.wait();
            token.expire();
        }));
    }

    // Dispatcher is done before any worker expires
    txn.finish_dispatch();
    assert_eq!(txn.state(), TransactionState::Active);
    barrier.wait();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(txn.state(), TransactionState::Closed);
    assert_eq!(txn.outstanding(), 0);
    assert!(txn.timeout_cause().is_none());

    runtime.shutdown();
}

#[test]
fn abandoned_work_is_reaped_and_the_cause_is_recorded() {
    init_tracing();
    let metrics = Arc::new(CountingMetricsSink::new());
    let config = CorrelationConfig::new()
        .with_token_timeout(Duration::from_millis(50))
        .with_reaper_interval(Duration::from_millis(20));
    let runtime = CorrelationRuntime::start_with_metrics(config, metrics.clone()).unwrap();
    let registry = runtime.registry().clone();

    let txn = registry.begin_transaction();
    let token = registry.create_token(&txn);
    txn.finish_dispatch();
    // The worker that should have expired this token never runs

    wait_for_close(&txn, Duration::from_secs(3));
    assert_eq!(txn.state(), TransactionState::Closed);
    assert_eq!(txn.timeout_cause(), Some(TimeoutCause::Token));
    assert!(!token.is_active());
    assert_eq!(metrics.count(names::TOKEN_TIMEOUT), 1);
    assert_eq!(metrics.count(names::TOKEN_EXPIRE), 0);

    runtime.shutdown();
}

#[test]
fn long_running_worker_survives_by_refreshing() {
    let config = CorrelationConfig::new()
        .with_token_timeout(Duration::from_millis(250))
        .with_reaper_interval(Duration::from_millis(30));
    let runtime = CorrelationRuntime::start(config).unwrap();
    let registry = runtime.registry().clone();

    let txn = registry.begin_transaction();
    let token = registry.create_token(&txn);
    txn.finish_dispatch();

    let worker = {
        let registry = registry.clone();
        let token = token.clone();
        thread::spawn(move || {
            // Outlive several timeout windows by refreshing
            for _ in 0..6 {
                thread::sleep(Duration::from_millis(100));
                assert!(registry.refresh_token(&token));
            }
            token.expire();
        })
    };
    worker.join().unwrap();

    assert_eq!(txn.state(), TransactionState::Closed);
    assert!(txn.timeout_cause().is_none());

    runtime.shutdown();
}

#[test]
fn activity_registered_before_its_thread_exists() {
    let runtime = CorrelationRuntime::start(CorrelationConfig::new()).unwrap();
    let registry = runtime.registry().clone();

    let txn = registry.begin_transaction();
    let job = Arc::new(String::from("deferred-upload"));
    let key = ActivityKey::new(Arc::clone(&job));
    assert!(registry.register_async_activity(key.clone(), &txn));
    txn.finish_dispatch();
    assert_eq!(txn.state(), TransactionState::Active);

    let worker = {
        let registry = registry.clone();
        let key = key.clone();
        thread::spawn(move || {
            let mut ctx = ExecutionContext::detached();
            let token = registry.start_async_activity(&key, &mut ctx).unwrap();
            assert!(ctx.current_transaction().is_some());
            token.expire();
        })
    };
    worker.join().unwrap();

    assert_eq!(txn.state(), TransactionState::Closed);
    assert!(txn.timeout_cause().is_none());

    runtime.shutdown();
}

#[test]
fn ignored_transaction_still_drains_outstanding_tokens() {
    let runtime = CorrelationRuntime::start(CorrelationConfig::new()).unwrap();
    let registry = runtime.registry().clone();

    let txn = registry.begin_transaction();
    let token = registry.create_token(&txn);
    txn.ignore();

    // New tokens are refused but the one already out must still report in
    assert!(registry.create_token(&txn).is_noop());
    let mut ctx = ExecutionContext::detached();
    assert!(!token.link(&mut ctx));

    txn.finish_dispatch();
    assert_eq!(txn.state(), TransactionState::Active);
    token.expire();
    assert_eq!(txn.state(), TransactionState::Closed);

    runtime.shutdown();
}

#[test]
fn listener_sees_the_closed_transaction_with_its_tracers() {
    struct Capture {
        closes: AtomicUsize,
    }
    impl TransactionListener for Capture {
        fn on_transaction_finished(&self, transaction: &TransactionContext) {
            assert_eq!(transaction.outstanding(), 0);
            assert!(transaction.dispatch_finished());
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    let runtime = CorrelationRuntime::start(CorrelationConfig::new()).unwrap();
    let registry = runtime.registry().clone();
    let capture = Arc::new(Capture {
        closes: AtomicUsize::new(0),
    });
    registry.add_transaction_listener(capture.clone());

    let txn = registry.begin_transaction();
    let token = registry.create_token(&txn);
    token.set_tracer(TracerHandle::new(42).unwrap());
    txn.finish_dispatch();
    token.expire();

    assert_eq!(capture.closes.load(Ordering::SeqCst), 1);
    assert_eq!(token.tracer().unwrap().get(), 42);

    runtime.shutdown();
}

#[test]
fn expire_all_cuts_async_work_loose() {
    let metrics = Arc::new(CountingMetricsSink::new());
    let runtime =
        CorrelationRuntime::start_with_metrics(CorrelationConfig::new(), metrics.clone()).unwrap();
    let registry = runtime.registry().clone();

    let txn = registry.begin_transaction();
    let tokens: Vec<_> = (0..4).map(|_| registry.create_token(&txn)).collect();

    assert_eq!(registry.expire_all_tokens(&txn), 4);
    for token in &tokens {
        assert!(!token.is_active());
    }
    txn.finish_dispatch();
    assert_eq!(txn.state(), TransactionState::Closed);
    assert_eq!(metrics.count(names::TOKEN_EXPIRE), 4);

    runtime.shutdown();
}
