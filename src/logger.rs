// CraftServices - a ground-side MSP position relay for small unmanned aircraft
// Copyright (C) 2018-2019  CraftServices contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Log fan-out: console, one all-log file, and one file per serial port.
//!
//! Every log file name of a run shares a UTC stamp chosen once at process
//! start. Link sessions log with their port name as the record target,
//! which routes a copy of the line into that port's own file; everything
//! also lands in the all-log and on the console.

use std::fmt;
use std::fs::File;
use std::io;
use std::io::Write;
use std::sync::Mutex;

use chrono::prelude::*;
use log;
use log::{LogLevel, LogLevelFilter, LogMetadata, LogRecord};
use time;

/// The stamp shared by every log file of this run: `2019-03-02__14_05_59`.
pub fn run_stamp() -> String {
    let now = time::now_utc();
    time::strftime("%Y-%m-%d__%H_%M_%S", &now).unwrap_or_else(|_| String::from("unknown-time"))
}

pub fn all_log_filename(stamp: &str) -> String {
    format!("{}--CraftServices_AllLog.txt", stamp)
}

pub fn port_log_filename(stamp: &str, port_name: &str) -> String {
    format!("{}--CraftServices_{}.txt", stamp, port_file_label(port_name))
}

/// Device paths make poor file names; flatten the separators.
fn port_file_label(port_name: &str) -> String {
    let flattened: String = port_name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();

    flattened.trim_matches('_').to_string()
}

fn level_label(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

/// `[14:05:59.123] [info] message`
fn format_line(level: LogLevel, args: &fmt::Arguments) -> String {
    let now = UTC::now();
    format!(
        "[{:02}:{:02}:{:02}.{:03}] [{}] {}",
        now.hour(),
        now.minute(),
        now.second(),
        now.nanosecond() / 1_000_000,
        level_label(level),
        args
    )
}

struct RelayLogger {
    level: LogLevelFilter,
    all_log: Mutex<File>,
    port_logs: Vec<(String, Mutex<File>)>,
}

impl RelayLogger {
    fn write_sink(sink: &Mutex<File>, line: &str) {
        let mut file = match sink.lock() {
            Ok(file) => file,
            Err(_) => return,
        };

        let _ = writeln!(file, "{}", line);
        let _ = file.flush();
    }
}

impl log::Log for RelayLogger {
    fn enabled(&self, metadata: &LogMetadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &LogRecord) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = format_line(record.level(), record.args());

        let _ = writeln!(io::stderr(), "{}", line);
        RelayLogger::write_sink(&self.all_log, &line);

        for &(ref port, ref sink) in &self.port_logs {
            if record.target() == *port {
                RelayLogger::write_sink(sink, &line);
                break;
            }
        }
    }
}

/// Open the log file set and install the logger. Called once, before the
/// relay starts.
pub fn init(level: LogLevelFilter, stamp: &str, port_names: &[String]) -> io::Result<()> {
    let all_log = File::create(all_log_filename(stamp))?;

    let mut port_logs = Vec::with_capacity(port_names.len());
    for port_name in port_names {
        let file = File::create(port_log_filename(stamp, port_name))?;
        port_logs.push((port_name.clone(), Mutex::new(file)));
    }

    let logger = RelayLogger {
        level: level,
        all_log: Mutex::new(all_log),
        port_logs: port_logs,
    };

    log::set_logger(move |max_level| {
        max_level.set(level);
        Box::new(logger)
    }).map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{}", e)))
}
