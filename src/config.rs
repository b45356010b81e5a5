//! Runtime configuration, read from `HSAN_*` environment variables.

use std::env;

use crate::error::ConfigError;

pub const HEAP_BASE_VAR: &str = "HSAN_HEAP_BASE";
pub const HEAP_SIZE_VAR: &str = "HSAN_HEAP_SIZE";
pub const CRASH_MODE_VAR: &str = "HSAN_CRASH_MODE";
pub const SINK_VAR: &str = "HSAN_SINK";
pub const STRICT_VAR: &str = "HSAN_STRICT";
pub const CHECK_LOADS_VAR: &str = "HSAN_CHECK_LOADS";
pub const CHECK_STORES_VAR: &str = "HSAN_CHECK_STORES";
pub const BACKTRACE_VAR: &str = "HSAN_BACKTRACE";

/// What to do once a fault has been reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnFault {
    /// Fault the process right there, so a debugger or core dump sees it
    Crash,
    /// Print a backtrace and carry on
    #[default]
    Continue,
}

/// Where fault reports go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkKind {
    #[default]
    Ansi,
    Log,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub heap_base: usize,
    pub heap_size: usize,
    pub on_fault: OnFault,
    pub sink: SinkKind,
    /// Check every byte of a region, not just its first and last
    pub strict: bool,
    pub check_loads: bool,
    pub check_stores: bool,
    /// Print a backtrace after each report in [`OnFault::Continue`] mode
    pub backtrace: bool,
}

impl Config {
    /// Track the heap `heap_base..heap_base + heap_size` with every other
    /// option at its default
    pub fn new(heap_base: usize, heap_size: usize) -> Self {
        Self {
            heap_base,
            heap_size,
            on_fault: OnFault::default(),
            sink: SinkKind::default(),
            strict: false,
            check_loads: true,
            check_stores: true,
            backtrace: true,
        }
    }

    pub fn on_fault(mut self, on_fault: OnFault) -> Self {
        self.on_fault = on_fault;
        self
    }

    pub fn sink(mut self, sink: SinkKind) -> Self {
        self.sink = sink;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn check_loads(mut self, check: bool) -> Self {
        self.check_loads = check;
        self
    }

    pub fn check_stores(mut self, check: bool) -> Self {
        self.check_stores = check;
        self
    }

    pub fn backtrace(mut self, backtrace: bool) -> Self {
        self.backtrace = backtrace;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Build a config from whatever `lookup` says each variable is set to
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |var: &'static str| {
            let value = lookup(var).ok_or(ConfigError::Missing(var))?;
            parse_number(var, &value)
        };
        let flag = |var: &'static str, default: bool| match lookup(var) {
            None => Ok(default),
            Some(value) => parse_flag(var, &value),
        };

        let mut config = Self::new(required(HEAP_BASE_VAR)?, required(HEAP_SIZE_VAR)?);
        config.on_fault = if flag(CRASH_MODE_VAR, false)? {
            OnFault::Crash
        } else {
            OnFault::Continue
        };
        if let Some(value) = lookup(SINK_VAR) {
            config.sink = parse_sink(&value)?;
        }
        config.strict = flag(STRICT_VAR, false)?;
        config.check_loads = flag(CHECK_LOADS_VAR, true)?;
        config.check_stores = flag(CHECK_STORES_VAR, true)?;
        config.backtrace = flag(BACKTRACE_VAR, true)?;
        Ok(config)
    }
}

/// `0x`-prefixed hex, or decimal
fn parse_number(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    let trimmed = value.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => trimmed.parse(),
    };
    parsed.map_err(|_| ConfigError::InvalidNumber {
        var,
        value: value.to_owned(),
    })
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: value.to_owned(),
        }),
    }
}

fn parse_sink(value: &str) -> Result<SinkKind, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "ansi" => Ok(SinkKind::Ansi),
        "log" => Ok(SinkKind::Log),
        "json" => Ok(SinkKind::Json),
        _ => Err(ConfigError::InvalidValue {
            var: SINK_VAR,
            value: value.to_owned(),
        }),
    }
}
