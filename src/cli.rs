use std::path::PathBuf;

use clap::Parser;
use moon_shell::{Config, Options};

/// Run Lua scripts, or explore them interactively
#[derive(Debug, Parser)]
#[command(name = "moon", version)]
pub struct Args {
    /// Execute a string of Lua (repeatable, run in order)
    #[arg(short = 'e', long = "execute", value_name = "CHUNK")]
    pub execute: Vec<String>,

    /// Require library NAME into global NAME (repeatable)
    #[arg(short = 'l', long = "library", value_name = "NAME")]
    pub libraries: Vec<String>,

    /// Enter interactive mode after running the script
    #[arg(short, long)]
    pub interactive: bool,

    /// Ignore the MOON_INIT environment variable
    #[arg(short = 'E', long)]
    pub ignore_env: bool,

    /// Configuration file (default: ~/.moonrc.toml)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Engine memory limit in bytes
    #[arg(long, value_name = "BYTES")]
    pub memory_limit: Option<usize>,

    /// VM instructions between interrupt checkpoints
    #[arg(long, value_name = "N")]
    pub checkpoint_interval: Option<u32>,

    /// Do not load the debug library
    #[arg(long)]
    pub no_debug_library: bool,

    /// Script to run (`-` for standard input) followed by its arguments
    #[arg(value_name = "SCRIPT", trailing_var_arg = true)]
    pub script: Vec<String>,
}

impl Args {
    /// Interpreter options: the configuration file, overridden by flags
    pub fn options(&self, config: &Config) -> Options {
        let mut options = config.options();
        if let Some(limit) = self.memory_limit {
            options.memory_limit = Some(limit);
        }
        if let Some(interval) = self.checkpoint_interval {
            options.checkpoint_interval = interval;
        }
        if self.no_debug_library {
            options.debug_library = false;
        }
        options
    }

    /// The script path and its arguments, if a script was given
    pub fn script(&self) -> Option<(&str, &[String])> {
        let (script, args) = self.script.split_first()?;
        Some((script.as_str(), args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_arguments_are_not_parsed_as_options() {
        let args = Args::parse_from(["moon", "-E", "script.lua", "-e", "x", "--help"]);
        assert!(args.ignore_env);
        assert!(args.execute.is_empty());
        let (script, rest) = args.script().unwrap();
        assert_eq!(script, "script.lua");
        assert_eq!(rest, ["-e", "x", "--help"]);
    }

    #[test]
    fn chunks_keep_their_order() {
        let args = Args::parse_from(["moon", "-e", "a = 1", "-e", "b = a"]);
        assert_eq!(args.execute, ["a = 1", "b = a"]);
        assert!(args.script().is_none());
    }

    #[test]
    fn flags_override_the_configuration() {
        let config = Config {
            checkpoint_interval: 50,
            memory_limit: Some(1),
            ..Config::default()
        };
        let args = Args::parse_from(["moon", "--memory-limit", "4096", "--no-debug-library"]);
        let options = args.options(&config);
        assert_eq!(options.memory_limit, Some(4096));
        assert_eq!(options.checkpoint_interval, 50);
        assert!(!options.debug_library);
    }

    #[test]
    fn version_flag_is_capital_v() {
        let err = Args::try_parse_from(["moon", "-V"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
        let err = Args::try_parse_from(["moon", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn stdin_is_a_script_name() {
        let args = Args::parse_from(["moon", "-", "x"]);
        assert_eq!(args.script(), Some(("-", &["x".to_string()][..])));
    }
}
