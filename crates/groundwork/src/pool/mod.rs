//! A fixed-size worker pool over one bounded job queue.
//!
//! Construction allocates the queue; `start` brings the workers up and `stop`
//! tears them down again, waiting for in-flight jobs. Callers pick their
//! back-pressure policy per dispatch call: block, fail fast, bound the wait,
//! or give up when a shutdown watcher fires.

pub mod shutdown;

#[cfg(test)]
mod tests;

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded, select};
use parking_lot::Mutex;
use thiserror::Error;

pub use shutdown::{ShutdownTrigger, ShutdownWatcher};

use crate::*;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
	#[error("worker count must be at least 1")]
	InvalidWorkerCount,
	#[error("queue size must be at least 1")]
	InvalidQueueSize,
	#[error("pool is already started")]
	AlreadyStarted,
	#[error("pool is not started")]
	NotStarted,
	#[error("dispatch cancelled")]
	Cancelled,
}

/// A unit of work. Ownership transfers to the pool at dispatch and ends when
/// `run` returns. The watcher passed to `run` fires when the pool is stopping;
/// long-running jobs should observe it.
pub trait Job: Send {
	fn run(&mut self, shutdown: &ShutdownWatcher);
}

impl<F> Job for F
where
	F: FnMut(&ShutdownWatcher) + Send,
{
	fn run(&mut self, shutdown: &ShutdownWatcher) {
		self(shutdown)
	}
}

pub struct Pool {
	workers: usize,
	jobs_tx: Sender<Box<dyn Job>>,
	jobs_rx: Receiver<Box<dyn Job>>,
	group: Mutex<Option<WorkerGroup>>,
}

struct WorkerGroup {
	trigger: ShutdownTrigger,
	handles: Vec<thread::JoinHandle<()>>,
	counters: Vec<Arc<Mutex<u64>>>,
}

impl Pool {
	/// Allocates a pool with `workers` worker threads and a job queue holding
	/// at most `queue` pending jobs. Workers are not started.
	pub fn new(workers: usize, queue: usize) -> Result<Pool, PoolError> {
		if workers < 1 {
			return Err(PoolError::InvalidWorkerCount);
		}
		if queue < 1 {
			return Err(PoolError::InvalidQueueSize);
		}
		let (jobs_tx, jobs_rx) = bounded(queue);
		Ok(Pool {
			workers,
			jobs_tx,
			jobs_rx,
			group: Mutex::new(None),
		})
	}

	pub fn start(&self) -> Result<(), PoolError> {
		let mut group = self.group.lock();
		if group.is_some() {
			return Err(PoolError::AlreadyStarted);
		}
		let (trigger, watcher) = shutdown::new();
		let mut handles = Vec::with_capacity(self.workers);
		let mut counters = Vec::with_capacity(self.workers);
		for index in 0..self.workers {
			let completed = Arc::new(Mutex::new(0));
			let worker = Worker {
				index,
				jobs: self.jobs_rx.clone(),
				shutdown: watcher.clone(),
				completed: completed.clone(),
			};
			let handle = thread::Builder::new()
				.name(format!("pool-worker-{index}"))
				.spawn(move || worker.run())
				.expect("failed to spawn pool worker thread");
			handles.push(handle);
			counters.push(completed);
		}
		*group = Some(WorkerGroup {
			trigger,
			handles,
			counters,
		});
		Ok(())
	}

	/// Signals shutdown and waits for every worker to exit. Jobs already
	/// running complete; jobs still queued do not run.
	pub fn stop(&self) -> Result<(), PoolError> {
		let Some(group) = self.group.lock().take() else {
			return Err(PoolError::NotStarted);
		};
		group.trigger.trigger();
		for handle in group.handles {
			let _ = handle.join();
		}
		Ok(())
	}

	pub fn is_started(&self) -> bool {
		self.group.lock().is_some()
	}

	/// Enqueues `job`, blocking until queue space is available.
	pub fn dispatch<J: Job + 'static>(&self, job: J) {
		let _ = self.jobs_tx.send(Box::new(job));
	}

	/// Enqueues `job` without blocking; false means the queue was full.
	pub fn try_dispatch<J: Job + 'static>(&self, job: J) -> bool {
		self.jobs_tx.try_send(Box::new(job)).is_ok()
	}

	/// Enqueues `job`, blocking up to `timeout` for queue space.
	pub fn dispatch_timeout<J: Job + 'static>(&self, job: J, timeout: Duration) -> bool {
		self.jobs_tx.send_timeout(Box::new(job), timeout).is_ok()
	}

	/// Enqueues `job`, blocking until queue space is available or `cancel`
	/// fires, whichever happens first.
	pub fn dispatch_with_cancel<J: Job + 'static>(
		&self,
		cancel: &ShutdownWatcher,
		job: J,
	) -> Result<(), PoolError> {
		let boxed: Box<dyn Job> = Box::new(job);
		select! {
			send(self.jobs_tx, boxed) -> res => {
				let _ = res;
				Ok(())
			},
			recv(cancel.receiver()) -> _ => Err(PoolError::Cancelled),
		}
	}

	/// Total jobs completed by the current worker group, panicked runs
	/// included. Counters update after the job returns, so observers may
	/// briefly lag the jobs they synchronized on.
	pub fn request_count(&self) -> u64 {
		self
			.group
			.lock()
			.as_ref()
			.map(|group| group.counters.iter().map(|c| *c.lock()).sum())
			.unwrap_or(0)
	}

	/// Jobs currently waiting in the queue.
	pub fn queue_len(&self) -> usize {
		self.jobs_tx.len()
	}
}

struct Worker {
	index: usize,
	jobs: Receiver<Box<dyn Job>>,
	shutdown: ShutdownWatcher,
	completed: Arc<Mutex<u64>>,
}

impl Worker {
	fn run(self) {
		loop {
			select! {
				recv(self.shutdown.receiver()) -> _ => break,
				recv(self.jobs) -> job => {
					let Ok(mut job) = job else { break };
					// A job dequeued after shutdown was signalled must not run.
					if self.shutdown.is_triggered() {
						break;
					}
					self.run_one(job.as_mut());
				},
			}
		}
	}

	fn run_one(&self, job: &mut dyn Job) {
		let result = catch_unwind(AssertUnwindSafe(|| job.run(&self.shutdown)));
		if let Err(panic) = result {
			warn!(worker = self.index, panic = panic_message(&panic), "job panicked");
		}
		*self.completed.lock() += 1;
	}
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
	if let Some(message) = panic.downcast_ref::<&str>() {
		message
	} else if let Some(message) = panic.downcast_ref::<String>() {
		message
	} else {
		"unknown panic"
	}
}
