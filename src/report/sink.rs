//! Where fault reports end up.

use std::fmt;

use log::{error, info};

use super::FaultReport;
use crate::util::print::{put_fd, write_fd};

/// Receives the text of a report line by line, plus the structured report
/// once it is complete.
///
/// Implementations are called with the shadow guard possibly held, from inside
/// allocator entry points, so they should avoid allocating where they can.
pub trait ReportSink: Send + Sync {
    /// An error line (banner, diagnosis)
    fn error(&self, args: fmt::Arguments<'_>);

    /// An informational line (shadow details, dump, backtrace)
    fn info(&self, args: fmt::Arguments<'_>);

    /// The finished report
    fn fault(&self, _report: &FaultReport) {}
}

const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const RESET: &str = "\x1b[0m\n";

/// Coloured lines on stderr, formatted on the stack
#[derive(Debug, Default, Clone, Copy)]
pub struct AnsiSink;

impl ReportSink for AnsiSink {
    fn error(&self, args: fmt::Arguments<'_>) {
        put_fd(libc::STDERR_FILENO, RED, args, RESET);
    }

    fn info(&self, args: fmt::Arguments<'_>) {
        put_fd(libc::STDERR_FILENO, GREEN, args, RESET);
    }
}

/// Forwards every line to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn error(&self, args: fmt::Arguments<'_>) {
        error!(target: "hsan::report", "{args}");
    }

    fn info(&self, args: fmt::Arguments<'_>) {
        info!(target: "hsan::report", "{args}");
    }
}

/// One JSON object per fault on stderr. Text lines are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSink;

impl ReportSink for JsonSink {
    fn error(&self, _args: fmt::Arguments<'_>) {}

    fn info(&self, _args: fmt::Arguments<'_>) {}

    fn fault(&self, report: &FaultReport) {
        match serde_json::to_vec(report) {
            Ok(mut line) => {
                line.push(b'\n');
                write_fd(libc::STDERR_FILENO, &line);
            }
            Err(e) => error!("could not serialise fault report: {e}"),
        }
    }
}
