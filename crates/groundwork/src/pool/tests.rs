use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use crossbeam_channel::bounded;

use super::*;
use crate::telemetry;

/// Counter increments trail job completion, so poll with a deadline instead
/// of asserting immediately.
fn eventually(check: impl Fn() -> bool) -> bool {
	let deadline = Instant::now() + Duration::from_secs(5);
	while Instant::now() < deadline {
		if check() {
			return true;
		}
		thread::sleep(Duration::from_millis(5));
	}
	false
}

#[test]
fn rejects_invalid_configuration() {
	assert_eq!(Pool::new(0, 5).err(), Some(PoolError::InvalidWorkerCount));
	assert_eq!(Pool::new(5, 0).err(), Some(PoolError::InvalidQueueSize));
}

#[test]
fn lifecycle_errors() {
	let pool = Pool::new(1, 1).unwrap();
	assert_eq!(pool.stop().err(), Some(PoolError::NotStarted));
	pool.start().unwrap();
	assert_eq!(pool.start().err(), Some(PoolError::AlreadyStarted));
	pool.stop().unwrap();
	assert_eq!(pool.stop().err(), Some(PoolError::NotStarted));

	// start/stop may alternate
	pool.start().unwrap();
	assert!(pool.is_started());
	pool.stop().unwrap();
	assert!(!pool.is_started());
}

#[test]
fn runs_dispatched_jobs() {
	let pool = Pool::new(5, 10).unwrap();
	pool.start().unwrap();

	let counter = Arc::new(AtomicUsize::new(0));
	for _ in 0..100 {
		let counter = counter.clone();
		pool.dispatch(move |_: &ShutdownWatcher| {
			counter.fetch_add(1, Ordering::SeqCst);
		});
	}

	assert!(eventually(|| counter.load(Ordering::SeqCst) == 100));
	assert!(eventually(|| pool.request_count() == 100));
	assert_eq!(pool.queue_len(), 0);
	pool.stop().unwrap();
}

#[test]
fn panicking_job_does_not_kill_the_worker() {
	telemetry::testing::setup_test_logging();

	let pool = Pool::new(1, 5).unwrap();
	pool.start().unwrap();

	pool.dispatch(|_: &ShutdownWatcher| panic!("boom"));
	let ran = Arc::new(AtomicBool::new(false));
	let observed = ran.clone();
	pool.dispatch(move |_: &ShutdownWatcher| {
		observed.store(true, Ordering::SeqCst);
	});

	assert!(eventually(|| ran.load(Ordering::SeqCst)));
	// the panicked run still counts
	assert!(eventually(|| pool.request_count() == 2));
	assert!(eventually(|| {
		!telemetry::testing::find(&[("message", "job panicked"), ("panic", "boom")]).is_empty()
	}));
	pool.stop().unwrap();
}

#[test]
fn try_dispatch_fails_only_when_full() {
	// never started, so nothing drains the queue
	let pool = Pool::new(1, 2).unwrap();
	assert!(pool.try_dispatch(|_: &ShutdownWatcher| {}));
	assert!(pool.try_dispatch(|_: &ShutdownWatcher| {}));
	assert!(!pool.try_dispatch(|_: &ShutdownWatcher| {}));
	assert_eq!(pool.queue_len(), 2);
}

#[test]
fn dispatch_timeout_gives_up_on_a_full_queue() {
	let pool = Pool::new(1, 1).unwrap();
	assert!(pool.dispatch_timeout(|_: &ShutdownWatcher| {}, Duration::from_millis(10)));
	let started = Instant::now();
	assert!(!pool.dispatch_timeout(|_: &ShutdownWatcher| {}, Duration::from_millis(50)));
	assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn dispatch_with_cancel() {
	let pool = Pool::new(1, 1).unwrap();
	let (trigger, watcher) = shutdown::new();

	// space available: accepted regardless of the watcher
	pool
		.dispatch_with_cancel(&watcher, |_: &ShutdownWatcher| {})
		.unwrap();

	// queue full: cancelling unblocks the dispatcher
	let handle = {
		let watcher = watcher.clone();
		let pool = Arc::new(pool);
		let pool2 = pool.clone();
		thread::spawn(move || pool2.dispatch_with_cancel(&watcher, |_: &ShutdownWatcher| {}))
	};
	thread::sleep(Duration::from_millis(20));
	trigger.trigger();
	assert_eq!(handle.join().unwrap(), Err(PoolError::Cancelled));
}

#[test]
fn stop_waits_for_in_flight_jobs_and_drops_queued_ones() {
	let pool = Arc::new(Pool::new(1, 5).unwrap());
	pool.start().unwrap();

	let (release_tx, release_rx) = bounded::<()>(0);
	pool.dispatch(move |_: &ShutdownWatcher| {
		let _ = release_rx.recv();
	});
	// give the worker time to pick the blocking job up
	assert!(eventually(|| pool.queue_len() == 0));

	let leaked = Arc::new(AtomicBool::new(false));
	let observed = leaked.clone();
	pool.dispatch(move |_: &ShutdownWatcher| {
		observed.store(true, Ordering::SeqCst);
	});

	let stopper = {
		let pool = pool.clone();
		thread::spawn(move || pool.stop())
	};
	thread::sleep(Duration::from_millis(20));
	// stop blocks on the in-flight job until it is released
	assert!(!stopper.is_finished());
	release_tx.send(()).unwrap();
	stopper.join().unwrap().unwrap();

	// the queued job never ran
	thread::sleep(Duration::from_millis(20));
	assert!(!leaked.load(Ordering::SeqCst));
}

#[test]
fn jobs_observe_shutdown() {
	let pool = Arc::new(Pool::new(1, 1).unwrap());
	pool.start().unwrap();

	let saw_shutdown = Arc::new(AtomicBool::new(false));
	let observed = saw_shutdown.clone();
	pool.dispatch(move |shutdown: &ShutdownWatcher| {
		shutdown.wait();
		observed.store(true, Ordering::SeqCst);
	});

	thread::sleep(Duration::from_millis(20));
	pool.stop().unwrap();
	assert!(saw_shutdown.load(Ordering::SeqCst));
}
