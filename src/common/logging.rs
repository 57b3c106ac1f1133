// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Process-wide tracing setup.
//!
//! Log lines are glog-shaped with the worker's thread name in place of a
//! numeric thread id; every thread the engine spawns is named, so the name
//! is the faster way to tell the sender pump from a task worker in a trace.
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::sync::{Arc, Mutex};

use chrono::Local;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

static INIT: OnceLock<()> = OnceLock::new();

/// Where log lines go. The file variant shares one handle across every
/// subscriber worker so concurrent writes cannot interleave mid-line.
#[derive(Clone)]
enum LogSink {
    File(Arc<Mutex<File>>),
    Stderr,
}

enum SinkWriter {
    File(Arc<Mutex<File>>),
    Stderr(io::Stderr),
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        match self {
            LogSink::File(file) => SinkWriter::File(Arc::clone(file)),
            LogSink::Stderr => SinkWriter::Stderr(io::stderr()),
        }
    }
}

impl io::Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SinkWriter::File(file) => {
                let mut file = file
                    .lock()
                    .map_err(|_| io::Error::other("log file lock poisoned"))?;
                file.write(buf)
            }
            SinkWriter::Stderr(stderr) => stderr.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SinkWriter::File(file) => {
                let mut file = file
                    .lock()
                    .map_err(|_| io::Error::other("log file lock poisoned"))?;
                file.flush()
            }
            SinkWriter::Stderr(stderr) => stderr.flush(),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    let value = std::env::var(name).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// `EMBERSQL_LOG_FILE` wins outright; otherwise the file is
/// `embersql.log` under `EMBERSQL_LOG_DIR`, `LOG_DIR`, or `./log`.
fn resolve_log_file_path() -> PathBuf {
    if let Some(log_path) = non_empty_env("EMBERSQL_LOG_FILE") {
        return PathBuf::from(log_path);
    }

    let log_dir = non_empty_env("EMBERSQL_LOG_DIR")
        .or_else(|| non_empty_env("LOG_DIR"))
        .unwrap_or_else(|| "log".to_string());

    PathBuf::from(log_dir).join("embersql.log")
}

fn open_log_file() -> Option<Arc<Mutex<File>>> {
    let path = resolve_log_file_path();
    if let Some(parent) = path.parent()
        && let Err(err) = fs::create_dir_all(parent)
    {
        eprintln!(
            "failed to create log directory {}: {}, fallback to stderr",
            parent.display(),
            err
        );
        return None;
    }

    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => Some(Arc::new(Mutex::new(file))),
        Err(err) => {
            eprintln!(
                "failed to open log file {}: {}, fallback to stderr",
                path.display(),
                err
            );
            None
        }
    }
}

/// `Lyyyymmdd hh:mm:ss.uuuuuu thread_name file:line] message`
struct EngineLineFormat;

impl<S, N> FormatEvent<S, N> for EngineLineFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();

        let level_char = match *metadata.level() {
            tracing::Level::ERROR => 'E',
            tracing::Level::WARN => 'W',
            tracing::Level::INFO => 'I',
            tracing::Level::DEBUG => 'D',
            tracing::Level::TRACE => 'T',
        };

        let current = std::thread::current();
        write!(
            writer,
            "{}{} {} {}:{}] ",
            level_char,
            Local::now().format("%Y%m%d %H:%M:%S%.6f"),
            current.name().unwrap_or("unnamed"),
            metadata.file().unwrap_or("unknown"),
            metadata.line().unwrap_or(0)
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Installs the process-wide subscriber. `level` is a full `EnvFilter`
/// expression; repeated calls after the first are no-ops, so tests that
/// share a process can all call this safely.
pub fn init_with_level(level: &str) {
    INIT.get_or_init(|| {
        let (sink, ansi) = match open_log_file() {
            Some(file) => (LogSink::File(file), false),
            // colors only when stderr really is a terminal
            None => (LogSink::Stderr, atty::is(atty::Stream::Stderr)),
        };

        let _ = tracing_fmt()
            .with_env_filter(EnvFilter::new(level))
            .with_writer(sink)
            .with_ansi(ansi)
            .event_format(EngineLineFormat)
            .try_init();
    });
}

pub use tracing::{debug, error, info, trace, warn};
