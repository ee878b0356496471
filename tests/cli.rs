//! Drives the `moon` binary end to end. Signal tests live here because a
//! second SIGINT is supposed to kill the process.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use pretty_assertions::assert_eq;

/// Prints a marker once the script is running (and so armed), then spins
const SPIN: &str = "io.write('ready\\n') io.stdout:flush() while true do end";
/// Like SPIN, but survives each interruption and spins again
const STUBBORN: &str =
    "io.write('ready\\n') io.stdout:flush() while true do pcall(function() while true do end end) end";

fn scratch_home() -> PathBuf {
    let home = std::env::temp_dir().join(format!("moon-home-{}", std::process::id()));
    std::fs::create_dir_all(&home).unwrap();
    home
}

fn moon() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_moon"));
    command
        .env("HOME", scratch_home())
        .env_remove("MOON_INIT")
        .env_remove("MOON_LOG");
    command
}

fn run(args: &[&str]) -> Output {
    moon()
        .args(args)
        .stdin(Stdio::null())
        .output()
        .expect("failed to run moon")
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn spawn_ready(script: &str) -> Child {
    let mut child = moon()
        .args(["-e", script])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn moon");

    let mut line = String::new();
    BufReader::new(child.stdout.as_mut().unwrap())
        .read_line(&mut line)
        .unwrap();
    assert_eq!(line, "ready\n");
    child
}

fn interrupt(child: &Child) {
    kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).unwrap();
}

fn wait_with_deadline(child: &mut Child) -> ExitStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() > deadline {
            child.kill().ok();
            panic!("moon did not stop");
        }
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn successful_chunk_is_silent() {
    let output = run(&["-e", "print('hi')"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hi\n");
    assert_eq!(stderr(&output), "");
}

#[test]
fn uncaught_error_exits_with_failure() {
    let output = run(&["-e", "error('boom', 0)"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).starts_with("boom\nstack traceback:\n"), "{}", stderr(&output));
}

#[test]
fn command_line_chunks_are_named() {
    let output = run(&["-e", "error('boom')"]);
    assert!(stderr(&output).starts_with("(command line):1: boom\n"), "{}", stderr(&output));
}

#[test]
fn first_failure_stops_a_one_shot_run() {
    let output = run(&["-e", "x = = 1", "-e", "print('unreachable')"]);
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "");
    assert!(!stderr(&output).contains("stack traceback"));
}

#[test]
fn missing_script_is_reported() {
    let output = run(&["/nonexistent/script.lua"]);
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(
        stderr(&output),
        "cannot open /nonexistent/script.lua: No such file or directory\n"
    );
}

#[test]
fn script_sees_its_arguments() {
    let path = scratch_home().join("args.lua");
    std::fs::write(&path, "print(arg[0] == ..., #arg, ...)\n").unwrap();
    let script = path.to_str().unwrap();

    let output = run(&[script, "one", "two"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "false\t2\tone\ttwo\n");
}

#[test]
fn piped_stdin_runs_as_a_script() {
    let mut child = moon()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(b"print(6 * 7)\n")
        .unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "42\n");
}

#[test]
fn init_variable_runs_first_unless_ignored() {
    let output = moon()
        .env("MOON_INIT", "greeting = 'hello'")
        .args(["-e", "print(greeting)"])
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hello\n");

    let output = moon()
        .env("MOON_INIT", "greeting = 'hello'")
        .args(["-E", "-e", "print(greeting)"])
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&output.stdout), "nil\n");
}

#[test]
fn memory_limit_flag_is_enforced() {
    let output = run(&[
        "--memory-limit",
        "2097152",
        "-e",
        "local t = {} for i = 1, 1e9 do t[i] = i end",
    ]);
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(stderr(&output), "not enough memory\n");
}

#[test]
fn single_interrupt_stops_the_script() {
    let mut child = spawn_ready(SPIN);
    interrupt(&child);

    let status = wait_with_deadline(&mut child);
    assert_eq!(status.code(), Some(1));

    let mut report = String::new();
    child.stderr.take().unwrap().read_to_string(&mut report).unwrap();
    assert_eq!(report.lines().next(), Some("interrupted!"));
    assert!(report.contains("stack traceback:"), "{report}");
}

#[test]
fn second_interrupt_kills_the_process() {
    let mut child = spawn_ready(STUBBORN);
    interrupt(&child);
    // let the first one be delivered on its own, standard signals do not queue
    thread::sleep(Duration::from_millis(300));
    assert!(child.try_wait().unwrap().is_none(), "script should survive the first interrupt");
    interrupt(&child);

    let status = wait_with_deadline(&mut child);
    assert_eq!(status.signal(), Some(Signal::SIGINT as i32));
}

#[test]
fn interrupt_fails_the_run_even_with_interactive_flag() {
    let mut child = moon()
        .args(["-e", SPIN, "-i"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let mut line = String::new();
    BufReader::new(child.stdout.as_mut().unwrap())
        .read_line(&mut line)
        .unwrap();
    assert_eq!(line, "ready\n");
    interrupt(&child);

    // the failing -e chunk ends the run before the interactive loop
    let status = wait_with_deadline(&mut child);
    assert_eq!(status.code(), Some(1));
}

#[test]
fn missing_config_file_is_a_host_error() {
    let path = scratch_home().join("no-such-config.toml");
    let output = run(&["-c", path.to_str().unwrap(), "-e", "print('unreachable')"]);
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "");
    let expected = format!("moon: loading configuration: cannot read {}: ", path.display());
    assert!(stderr(&output).starts_with(&expected), "{}", stderr(&output));
}

#[test]
fn version_flag_names_the_program() {
    let output = run(&["-V"]);
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        format!("moon {}\n", env!("CARGO_PKG_VERSION"))
    );
}
