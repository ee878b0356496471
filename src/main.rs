mod cli;

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use crossterm::tty::IsTty;
use moon_shell::{Config, Interpreter, ShellError, Status, repl};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use cli::Args;

/// Startup code: `@path` runs a file, anything else runs as a chunk
const INIT_VAR: &str = "MOON_INIT";
/// Chunk name for `-e` strings
const COMMAND_LINE: &str = "=(command line)";

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MOON_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    init_logging();

    let argv: Vec<String> = std::env::args().collect();
    let args = Args::parse_from(&argv);

    match run(&args, &argv) {
        Ok(status) => ExitCode::from(status.exit_code()),
        Err(err) => {
            eprintln!("moon: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run everything the command line asks for. In one-shot mode the first
/// failing step ends the run with its status.
fn run(args: &Args, argv: &[String]) -> Result<Status> {
    let config = Config::load(args.config.as_deref())
        .map_err(host_error)
        .context("loading configuration")?;
    let interp = Interpreter::new(args.options(&config)).map_err(host_error)?;

    let script_index = args.script().map(|_| argv.len() - args.script.len());
    interp
        .set_args(argv, script_index)
        .map_err(host_error)
        .context("setting script arguments")?;

    if !args.ignore_env {
        let status = run_init(&interp);
        if !status.is_ok() {
            return Ok(status);
        }
    }

    for library in &args.libraries {
        let status = interp.require(library);
        if !status.is_ok() {
            return Ok(status);
        }
    }

    for chunk in &args.execute {
        let status = interp.run_named(chunk, COMMAND_LINE);
        if !status.is_ok() {
            return Ok(status);
        }
    }

    if let Some((script, script_args)) = args.script() {
        let status = interp.run_script(Path::new(script), script_args);
        if !status.is_ok() {
            return Ok(status);
        }
    }

    if args.interactive {
        repl::run(&interp, &config)?;
    } else if args.script().is_none() && args.execute.is_empty() {
        if std::io::stdin().is_tty() {
            repl::run(&interp, &config)?;
        } else {
            return Ok(interp.run_stdin());
        }
    }

    interp.close();
    Ok(Status::Ok)
}

/// Engine errors are not `Send`, so they cannot travel inside `anyhow::Error`
/// as a source; keep their rendered message instead
fn host_error(err: ShellError) -> anyhow::Error {
    anyhow!("{err}")
}

fn run_init(interp: &Interpreter) -> Status {
    let Ok(init) = std::env::var(INIT_VAR) else {
        return Status::Ok;
    };
    debug!(init = %init, "running startup code");
    match init.strip_prefix('@') {
        Some(path) => interp.run_file(path),
        None => interp.run_named(&init, &format!("={INIT_VAR}")),
    }
}
