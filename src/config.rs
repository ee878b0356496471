use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::ShellError;
use crate::interp::Options;

/// Default configuration file, relative to the home directory
const CONFIG_FILE: &str = ".moonrc.toml";
/// Default history file, relative to the home directory
const HISTORY_FILE: &str = ".moon_history";

/// User configuration, read from `~/.moonrc.toml` or `--config`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub prompt: String,
    pub continuation_prompt: String,
    /// History file; relative paths are resolved against the home directory
    pub history_file: Option<PathBuf>,
    pub history_size: usize,
    /// VM instructions between interrupt checkpoints
    pub checkpoint_interval: u32,
    /// Engine memory limit in bytes
    pub memory_limit: Option<usize>,
    /// Load the `debug` standard library
    pub debug_library: bool,
}

impl Default for Config {
    fn default() -> Self {
        let options = Options::default();
        Self {
            prompt: "> ".to_string(),
            continuation_prompt: ">> ".to_string(),
            history_file: Some(PathBuf::from(HISTORY_FILE)),
            history_size: 1000,
            checkpoint_interval: options.checkpoint_interval,
            memory_limit: options.memory_limit,
            debug_library: options.debug_library,
        }
    }
}

impl Config {
    /// Load configuration. An explicit path must exist; the default file in
    /// the home directory is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ShellError> {
        match explicit {
            Some(path) => Self::read(path),
            None => match default_path() {
                Some(path) if path.is_file() => Self::read(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    fn read(path: &Path) -> Result<Self, ShellError> {
        let text = std::fs::read_to_string(path).map_err(|source| ShellError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text).map_err(|source| ShellError::Config {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Interpreter options described by this configuration
    pub fn options(&self) -> Options {
        Options {
            checkpoint_interval: self.checkpoint_interval,
            memory_limit: self.memory_limit,
            debug_library: self.debug_library,
        }
    }

    /// Absolute history path, if history is enabled
    pub fn history_path(&self) -> Option<PathBuf> {
        let file = self.history_file.as_ref()?;
        if file.is_absolute() {
            return Some(file.clone());
        }
        match home::home_dir() {
            Some(home) if !home.as_os_str().is_empty() => Some(home.join(file)),
            _ => None,
        }
    }
}

fn default_path() -> Option<PathBuf> {
    home::home_dir()
        .filter(|home| !home.as_os_str().is_empty())
        .map(|home| home.join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_fields_take_defaults() {
        let config = Config::from_toml_str("prompt = \"lua> \"\nmemory_limit = 1048576\n").unwrap();
        assert_eq!(config.prompt, "lua> ");
        assert_eq!(config.memory_limit, Some(1 << 20));
        assert_eq!(config.continuation_prompt, Config::default().continuation_prompt);
        assert_eq!(config.checkpoint_interval, Options::default().checkpoint_interval);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(Config::from_toml_str("promt = \"typo\"").is_err());
    }

    #[test]
    fn options_follow_the_file() {
        let config = Config::from_toml_str(
            "checkpoint_interval = 10\ndebug_library = false\nmemory_limit = 4096\n",
        )
        .unwrap();
        let options = config.options();
        assert_eq!(options.checkpoint_interval, 10);
        assert!(!options.debug_library);
        assert_eq!(options.memory_limit, Some(4096));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("moon-missing-{}.toml", std::process::id()));
        match Config::load(Some(&path)) {
            Err(ShellError::Io { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected an I/O error, got {other:?}"),
        }
    }

    #[test]
    fn explicit_file_is_parsed() {
        let path = std::env::temp_dir().join(format!("moon-config-{}.toml", std::process::id()));
        std::fs::write(&path, "continuation_prompt = \"... \"\nhistory_file = \"/tmp/h\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.continuation_prompt, "... ");
        assert_eq!(config.history_path(), Some(PathBuf::from("/tmp/h")));
    }

    #[test]
    fn history_can_be_disabled() {
        let config = Config {
            history_file: None,
            ..Config::default()
        };
        assert_eq!(config.history_path(), None);
    }
}
