//! Configuration file for wavelink.
//!
//! Read from `~/.wavelink/config.toml`, or from the file named by
//! `WAVELINK_CONFIG`. A missing file yields the defaults. String values may
//! reference environment variables as `${VAR}`.

use std::path::{Path, PathBuf};
use std::{env, fs};

use serde::Deserialize;
use wavelink_viewer::ViewerConfig;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "WAVELINK_CONFIG";

#[derive(Debug, Default, Deserialize)]
pub struct WavelinkConfig {
    #[serde(default)]
    pub viewer: ViewerConfig,
    pub annotations: Option<AnnotationConfig>,
}

/// Signals whose values are printed whenever the time cursor moves.
#[derive(Debug, Default, Deserialize)]
pub struct AnnotationConfig {
    #[serde(default)]
    pub signals: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Replace every `${VAR}` with the variable's value (empty when unset).
/// Unterminated or empty references are kept as written.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(0) => {
                out.push_str("${}");
                rest = &after[1..];
            }
            Some(end) => {
                out.push_str(&env::var(&after[..end]).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

impl WavelinkConfig {
    /// Load the config file, falling back to defaults when there is none.
    pub fn load() -> Result<Self, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => {
                tracing::debug!("No home directory; using default config");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {}; using defaults", path.display());
            return Ok(Self::default());
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str::<Self>(&content) {
            Ok(mut config) => {
                config.expand_env();
                Ok(config)
            }
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// Annotation signals, empty when the section is absent.
    #[must_use]
    pub fn annotation_signals(&self) -> &[String] {
        self.annotations
            .as_ref()
            .map(|a| a.signals.as_slice())
            .unwrap_or_default()
    }

    fn expand_env(&mut self) {
        let viewer = &mut self.viewer;
        if let Some(path) = viewer.path.as_mut() {
            *path = expand_env_vars(path);
        }
        for option in &mut viewer.options {
            *option = expand_env_vars(option);
        }
        for value in viewer.env.values_mut() {
            *value = expand_env_vars(value);
        }
        if let Some(script) = viewer.setup_script.as_mut()
            && let Some(text) = script.to_str()
        {
            *script = PathBuf::from(expand_env_vars(text));
        }
        if let Some(annotations) = self.annotations.as_mut() {
            for signal in &mut annotations.signals {
                *signal = expand_env_vars(signal);
            }
        }
    }
}

/// `$WAVELINK_CONFIG` if set, else `~/.wavelink/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".wavelink").join("config.toml"))
}
