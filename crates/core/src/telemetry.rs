use std::env;
use std::str::FromStr;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Layer, Registry, filter, reload};

static LOG_HANDLE: OnceCell<LogHandle> = OnceCell::new();

type BoxLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;
type FilteredLayer = filter::Filtered<BoxLayer, filter::Targets, Registry>;
type LogHandle = reload::Handle<FilteredLayer, Registry>;

/// Installs the process-wide subscriber. Output is plain text unless
/// `LOG_FORMAT=json`; the filter comes from `RUST_LOG` and can be changed at
/// runtime through [`set_level`].
pub fn setup_logging() {
	let use_json = env::var("LOG_FORMAT").unwrap_or_default() == "json";
	tracing_subscriber::registry()
		.with(fmt_layer(use_json))
		.init();
}

fn fmt_layer(use_json: bool) -> BoxLayer {
	let format: BoxLayer = if use_json {
		Box::new(
			tracing_subscriber::fmt::layer()
				.json()
				.flatten_event(true),
		)
	} else {
		Box::new(tracing_subscriber::fmt::layer())
	};
	let (layer, reload) = reload::Layer::new(format.with_filter(default_filter()));
	LOG_HANDLE
		.set(reload)
		.map_or_else(|_| warn!("setup log handler failed"), |_| {});
	Box::new(layer)
}

fn default_filter() -> filter::Targets {
	let var = env::var("RUST_LOG").unwrap_or("info".to_string());
	filter::Targets::from_str(&var).expect("static filter should build")
}

/// set_level dynamically updates the logging level to *include* `level`. If
/// `reset` is true, the configuration is rebuilt from the default first.
pub fn set_level(reset: bool, level: &str) -> Result<(), Error> {
	let Some(handle) = LOG_HANDLE.get() else {
		warn!("failed to get log handle");
		return Err(Error::Uninitialized);
	};
	// new directive is current directive + level; Targets::from_str handles duplicates
	let new_directive = if let Ok(current) = handle.with_current(|f| f.filter().to_string()) {
		if reset {
			if level.is_empty() {
				default_filter().to_string()
			} else {
				format!("{},{}", default_filter(), level)
			}
		} else {
			format!("{current},{level}")
		}
	} else {
		level.to_string()
	};

	let new_filter = filter::Targets::from_str(&new_directive)?;
	info!("new log filter is {new_filter}");

	Ok(handle.modify(|layer| {
		*layer.filter_mut() = new_filter;
	})?)
}

pub fn current_level() -> Result<String, Error> {
	if let Some(handle) = LOG_HANDLE.get() {
		Ok(handle.with_current(|f| f.filter().to_string())?)
	} else {
		Err(Error::Uninitialized)
	}
}

#[derive(Error, Debug)]
pub enum Error {
	#[error("parse failure: {0}")]
	InvalidFilter(#[from] filter::ParseError),
	#[error("reload failure: {0}")]
	Reload(#[from] reload::Error),
	#[error("logging is not initialized")]
	Uninitialized,
}

/// Test support: a subscriber that stores JSON log lines in memory so tests
/// can assert on what was logged.
pub mod testing {
	use std::io;
	use std::sync::{Arc, Mutex, OnceLock};

	use once_cell::sync::Lazy;
	use serde_json::Value;
	use tracing_subscriber::fmt;
	use tracing_subscriber::prelude::*;

	static TRACING: Lazy<()> = Lazy::new(|| {
		let layer = fmt::layer()
			.json()
			.flatten_event(true)
			.with_writer(MockWriter {
				buf: global_buf(),
			});
		let _ = tracing_subscriber::registry().with(layer).try_init();
	});

	pub fn setup_test_logging() {
		Lazy::force(&TRACING);
	}

	/// Returns every captured log line whose fields match all of `want`.
	/// Common keys are "message", "target" and "level"; the rest are custom.
	pub fn find(want: &[(&str, &str)]) -> Vec<Value> {
		let logs = {
			let buf = global_buf();
			let buf = buf.lock().unwrap();
			String::from_utf8(buf.clone()).expect("logs contain invalid UTF-8")
		};
		logs
			.lines()
			.filter_map(|line| serde_json::from_str::<Value>(line).ok())
			.filter(|log| {
				want
					.iter()
					.all(|(k, v)| log.get(*k).and_then(Value::as_str) == Some(*v))
			})
			.collect()
	}

	#[derive(Clone)]
	struct MockWriter {
		buf: Arc<Mutex<Vec<u8>>>,
	}

	impl io::Write for MockWriter {
		fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
			let mut target = self.buf.lock().map_err(|_| io::Error::other("poisoned"))?;
			target.extend_from_slice(buf);
			Ok(buf.len())
		}

		fn flush(&mut self) -> io::Result<()> {
			Ok(())
		}
	}

	impl fmt::MakeWriter<'_> for MockWriter {
		type Writer = Self;

		fn make_writer(&self) -> Self::Writer {
			self.clone()
		}
	}

	fn global_buf() -> Arc<Mutex<Vec<u8>>> {
		static GLOBAL_BUF: OnceLock<Arc<Mutex<Vec<u8>>>> = OnceLock::new();
		GLOBAL_BUF
			.get_or_init(|| Arc::new(Mutex::new(Vec::new())))
			.clone()
	}
}
