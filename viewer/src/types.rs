//! Public types consumed by the application.
//!
//! The application constructs [`ViewerConfig`], observes [`ViewerState`], and
//! receives [`SignalValue`]s. [`SignalQuery`] is the checked boundary between
//! caller-supplied hierarchical paths and the Tcl command text sent to the viewer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_SENTINEL;
use crate::error::{Result, ViewerError};

const fn default_poll_interval_ms() -> u64 {
    500
}

const fn default_shutdown_grace_ms() -> u64 {
    2000
}

const fn default_follow() -> bool {
    true
}

const fn default_sentinel() -> char {
    DEFAULT_SENTINEL
}

fn default_extensions() -> Vec<String> {
    [".vcd", ".fst", ".gtkw", ".ghw"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Configuration for the waveform viewer.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewerConfig {
    /// Viewer executable (e.g. "gtkwave"). Required to construct a controller.
    #[serde(default)]
    pub path: Option<String>,
    /// Launch options. `-W` is added when absent.
    #[serde(default)]
    pub options: Vec<String>,
    /// Forward viewer stderr and log malformed viewer output.
    #[serde(default)]
    pub verbose: bool,
    /// Waveform file extensions the viewer can open (e.g. `[".vcd"]`).
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Period of the time-cursor and selection polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on a single exchange. 0 waits forever.
    #[serde(default)]
    pub exchange_timeout_ms: u64,
    /// How long `close` waits after the exit instruction before killing.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Frame terminator emitted by the viewer after every reply.
    #[serde(default = "default_sentinel")]
    pub sentinel: char,
    /// Tcl script sourced during the startup handshake. The bundled script is
    /// used when unset.
    #[serde(default)]
    pub setup_script: Option<PathBuf>,
    /// Environment overrides for the viewer process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Follow mode applied on the first `open`, if the viewer can report
    /// its selection.
    #[serde(default = "default_follow")]
    pub follow: bool,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            path: None,
            options: Vec::new(),
            verbose: false,
            extensions: default_extensions(),
            poll_interval_ms: default_poll_interval_ms(),
            exchange_timeout_ms: 0,
            shutdown_grace_ms: default_shutdown_grace_ms(),
            sentinel: default_sentinel(),
            setup_script: None,
            env: HashMap::new(),
            follow: default_follow(),
        }
    }
}

impl ViewerConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    #[must_use]
    pub fn exchange_timeout(&self) -> Option<Duration> {
        (self.exchange_timeout_ms > 0).then(|| Duration::from_millis(self.exchange_timeout_ms))
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// The configured executable, if it is set and non-blank.
    #[must_use]
    pub fn executable(&self) -> Option<&str> {
        self.path.as_deref().map(str::trim).filter(|p| !p.is_empty())
    }
}

/// Lifecycle of a [`ViewerController`](crate::ViewerController).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewerState {
    #[default]
    Closed,
    Opening,
    Running,
    Closing,
}

impl ViewerState {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Running => "running",
            Self::Closing => "closing",
        }
    }
}

/// A list of hierarchical signal paths (e.g. `top.dut.clk`).
///
/// Paths are spliced into Tcl command lines, so anything that would break
/// the list syntax is rejected here rather than at the viewer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignalQuery {
    paths: Vec<String>,
}

impl SignalQuery {
    pub fn new<I, S>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths = paths
            .into_iter()
            .map(Into::into)
            .map(|path: String| {
                let bad = path.is_empty()
                    || path
                        .chars()
                        .any(|c| c.is_whitespace() || matches!(c, '{' | '}' | '\\'));
                if bad {
                    Err(ViewerError::InvalidSignalPath(path))
                } else {
                    Ok(path)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { paths })
    }

    #[must_use]
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Value of one signal at the viewer's time cursor.
///
/// `val` is passed through untouched: the viewer may report it as a string,
/// a number, or not at all.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SignalValue {
    pub sig: String,
    #[serde(default)]
    pub val: Option<serde_json::Value>,
    #[serde(default)]
    pub flag: i64,
}

impl SignalValue {
    /// Last component of the hierarchical path (`top.dut.clk` → `clk`).
    #[must_use]
    pub fn leaf_name(&self) -> &str {
        self.sig.rsplit('.').next().unwrap_or(&self.sig)
    }

    /// Display text for `val`, or `None` when the viewer reported nothing.
    #[must_use]
    pub fn value_text(&self) -> Option<String> {
        match self.val.as_ref()? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) if s.is_empty() => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}
