// Copyright (c) 2026 The netstack developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use log::{Level, LevelFilter, Metadata, Record};

/// Logger writing to stderr, shared by the worker and user tasks.
struct StackLogger;

static LOGGER: StackLogger = StackLogger;

impl log::Log for StackLogger {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		metadata.level() <= log::max_level()
	}

	fn log(&self, record: &Record<'_>) {
		if self.enabled(record.metadata()) {
			eprintln!(
				"[{}][{}] {}",
				record.level(),
				record.target().split("::").last().unwrap_or_default(),
				record.args()
			);
		}
	}

	fn flush(&self) {}
}

/// Install the stack logger.
///
/// The level is taken from the `NETSTACK_LOG` environment variable
/// (`error`, `warn`, `info`, `debug`, `trace`), defaulting to `info`.
/// Installing twice is harmless; the first logger wins.
pub fn init() {
	let level = std::env::var("NETSTACK_LOG")
		.ok()
		.and_then(|level| level.parse::<Level>().ok())
		.map(|level| level.to_level_filter())
		.unwrap_or(LevelFilter::Info);

	if log::set_logger(&LOGGER).is_ok() {
		log::set_max_level(level);
	}
}
