use std::env;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Initializes the global tracing subscriber.
///
/// The filter is controlled with `RUST_LOG` (default `info`); `LOG_FORMAT=json`
/// switches to newline-delimited JSON output.
pub fn setup_logging() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let use_json = env::var("LOG_FORMAT").unwrap_or_default() == "json";
	if use_json {
		tracing_subscriber::registry()
			.with(fmt::layer().json().flatten_event(true))
			.with(filter)
			.init();
	} else {
		tracing_subscriber::registry()
			.with(fmt::layer())
			.with(filter)
			.init();
	}
}

pub mod testing {
	use std::sync::Once;

	use tracing_subscriber::prelude::*;
	use tracing_subscriber::{EnvFilter, fmt};

	static INIT: Once = Once::new();

	/// Installs a test subscriber writing to the captured test output.
	/// Safe to call from every test; only the first call takes effect.
	pub fn setup_test_logging() {
		INIT.call_once(|| {
			let filter =
				EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,faros=debug"));
			tracing_subscriber::registry()
				.with(fmt::layer().with_test_writer())
				.with(filter)
				.init();
		});
	}
}
