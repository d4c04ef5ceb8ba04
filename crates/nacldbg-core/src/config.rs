//! Session configuration.
//!
//! Every knob has a default matching the stub's expectations; any of them
//! can be overridden through `NACLDBG_*` environment variables via
//! [`SessionConfig::from_env`].

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(50);
const DEFAULT_MAX_FRAMES: usize = 64;
/// SIGTRAP as reported by the stub.
pub const DEFAULT_TRAP_SIGNAL: u8 = 5;

/// Tunables for a [`crate::remote::RemoteSession`] / [`crate::DebugSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig
{
    /// Deadline for each request/reply exchange made while opening
    pub handshake_timeout: Duration,
    /// How long an idle poller sleeps; a continue wakes it early
    pub poll_interval: Duration,
    /// How long each poll waits for a packet while holding the session lock
    pub reply_timeout: Duration,
    /// How long `close` waits for the poller thread before detaching it
    pub join_timeout: Duration,
    /// Signal number that means "single step / breakpoint trap"
    pub trap_signal: u8,
    /// Upper bound on instructions executed by one source-level step
    ///
    /// `None` keeps stepping until the source line changes or the target
    /// stops for another reason.
    pub max_step_instructions: Option<u64>,
    /// Module to load symbols from instead of the path the stub reports
    pub module_path: Option<PathBuf>,
    /// Maximum number of frames produced by call stack unwinding
    pub max_frames: usize,
}

impl Default for SessionConfig
{
    fn default() -> Self
    {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            join_timeout: DEFAULT_POLL_INTERVAL * 8,
            trap_signal: DEFAULT_TRAP_SIGNAL,
            max_step_instructions: None,
            module_path: None,
            max_frames: DEFAULT_MAX_FRAMES,
        }
    }
}

impl SessionConfig
{
    /// Defaults overridden by the environment.
    ///
    /// | Variable | Field | Unit |
    /// |----------|-------|------|
    /// | `NACLDBG_HANDSHAKE_TIMEOUT_MS` | `handshake_timeout` | ms |
    /// | `NACLDBG_POLL_INTERVAL_MS` | `poll_interval` | ms |
    /// | `NACLDBG_REPLY_TIMEOUT_MS` | `reply_timeout` | ms |
    /// | `NACLDBG_JOIN_TIMEOUT_MS` | `join_timeout` | ms |
    /// | `NACLDBG_MAX_STEP_INSTRUCTIONS` | `max_step_instructions` | count |
    /// | `NACLDBG_MAX_FRAMES` | `max_frames` | count |
    /// | `NACLDBG_MODULE_PATH` | `module_path` | path |
    ///
    /// Unparsable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self
    {
        let mut config = Self::default();
        if let Some(ms) = env_number::<u64>("NACLDBG_HANDSHAKE_TIMEOUT_MS") {
            config.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number::<u64>("NACLDBG_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
            config.join_timeout = config.poll_interval * 8;
        }
        if let Some(ms) = env_number::<u64>("NACLDBG_REPLY_TIMEOUT_MS") {
            config.reply_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number::<u64>("NACLDBG_JOIN_TIMEOUT_MS") {
            config.join_timeout = Duration::from_millis(ms);
        }
        if let Some(count) = env_number::<u64>("NACLDBG_MAX_STEP_INSTRUCTIONS") {
            config.max_step_instructions = Some(count);
        }
        if let Some(count) = env_number::<usize>("NACLDBG_MAX_FRAMES") {
            config.max_frames = count;
        }
        if let Some(path) = env::var_os("NACLDBG_MODULE_PATH").filter(|value| !value.is_empty()) {
            config.module_path = Some(PathBuf::from(path));
        }
        config
    }

    /// Replace the poll interval, scaling the join timeout with it.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self
    {
        self.poll_interval = poll_interval;
        self.join_timeout = poll_interval * 8;
        self
    }

    /// Load symbols from `path` instead of the path reported by the stub.
    #[must_use]
    pub fn with_module_path(mut self, path: impl Into<PathBuf>) -> Self
    {
        self.module_path = Some(path.into());
        self
    }
}

fn env_number<T: FromStr>(name: &str) -> Option<T>
{
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparsable configuration value");
            None
        }
    }
}
