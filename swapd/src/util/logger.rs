// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::Mutex;

use chrono::Utc;
use log::{LevelFilter, Log, Metadata, Record};

/// Logger writing to stderr and, when configured, appending to a log file.
pub struct Logger {
	level: LevelFilter,
	file: Option<Mutex<File>>,
}

impl Logger {
	pub fn init(level: LevelFilter, file_path: Option<&str>) -> io::Result<()> {
		let file = match file_path {
			Some(path) => {
				Some(Mutex::new(OpenOptions::new().create(true).append(true).open(path)?))
			},
			None => None,
		};
		let logger = Box::new(Logger { level, file });
		log::set_boxed_logger(logger)
			.map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))?;
		log::set_max_level(level);
		Ok(())
	}
}

impl Log for Logger {
	fn enabled(&self, metadata: &Metadata) -> bool {
		metadata.level() <= self.level
	}

	fn log(&self, record: &Record) {
		if !self.enabled(record.metadata()) {
			return;
		}
		let line = format!(
			"{} {:<5} [{}] {}",
			Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
			record.level(),
			record.module_path().unwrap_or_default(),
			record.args()
		);
		eprintln!("{line}");
		if let Some(file) = &self.file {
			if let Ok(mut file) = file.lock() {
				let _ = writeln!(file, "{line}");
			}
		}
	}

	fn flush(&self) {
		if let Some(file) = &self.file {
			if let Ok(mut file) = file.lock() {
				let _ = file.flush();
			}
		}
	}
}
