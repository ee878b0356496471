//! Guarded execution pipeline.
//!
//! Every way of running code funnels through [`Interpreter::protected_call`]:
//! the bridge is armed for exactly the span of the call, errors are caught
//! at the call boundary and decorated by the message handler while the
//! failing stack still exists, and the top-level entry points report any
//! failure to the interpreter's error stream before returning its status.

use std::borrow::Cow;
use std::cell::Cell;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::rc::Rc;

use mlua::{Function, IntoLuaMulti, Lua, MultiValue, Table, Value, Variadic};
use nix::errno::Errno;
use tracing::{debug, warn};

use crate::bridge;
use crate::interp::Interpreter;
use crate::status::{Failure, Status};
use crate::traceback::{self, LiveStack, StackSource};

/// Error object the engine uses when an allocation fails
const MEMORY_ERROR: &str = "not enough memory";
/// Chunk name used for interactive input and standard input
const STDIN_NAME: &str = "=stdin";

/// A line (or lines) of interactive input, compiled
pub enum Compiled {
    /// Compiled as `return <input>`; results are printed
    Expression(Function),
    Statement(Function),
    /// The input ends in the middle of a statement; read more
    Incomplete,
    Invalid(Failure),
}

impl Interpreter {
    /// Run a line of script text; the text doubles as the chunk name
    pub fn run_line(&self, text: &str) -> Status {
        self.run_named(text, text)
    }

    /// Run script text under the given chunk name
    pub fn run_named(&self, text: &str, name: &str) -> Status {
        let chunk = self.load(text.as_bytes(), name);
        self.execute(chunk, MultiValue::new())
    }

    /// Run a script file; `-` reads standard input
    pub fn run_file(&self, path: impl AsRef<Path>) -> Status {
        self.run_script(path.as_ref(), &[])
    }

    /// Run standard input as a script
    pub fn run_stdin(&self) -> Status {
        self.run_file("-")
    }

    /// Run a script file, passing `args` to it as `...`
    pub fn run_script(&self, path: &Path, args: &[String]) -> Status {
        let chunk = self.load_file(path);
        let args = match Variadic::from_iter(args.iter().cloned()).into_lua_multi(self.lua()) {
            Ok(args) => args,
            Err(err) => return self.report(Err(engine_failure(&err))),
        };
        self.execute(chunk, args)
    }

    /// `require` a module and store it in the global of the same name
    pub fn require(&self, name: &str) -> Status {
        let outcome = self
            .lua()
            .globals()
            .get::<Function>("require")
            .map_err(|err| engine_failure(&err))
            .and_then(|require| self.call(&require, name))
            .and_then(|values| {
                let module = values.into_iter().next().unwrap_or(Value::Nil);
                self.lua()
                    .globals()
                    .set(name, module)
                    .map_err(|err| engine_failure(&err))
            });
        self.report(outcome)
    }

    /// Call a function in protected mode with the same interrupt handling
    /// and error decoration as a top-level chunk. Failures are returned,
    /// not reported: the caller decides what to do with them.
    pub fn call(&self, func: &Function, args: impl IntoLuaMulti) -> Result<MultiValue, Failure> {
        let args = args
            .into_lua_multi(self.lua())
            .map_err(|err| engine_failure(&err))?;
        self.protected_call(func, args)
    }

    /// Compile interactive input, preferring to read it as an expression
    pub fn compile_line(&self, input: &str) -> Compiled {
        if let Ok(func) = self.load(format!("return {input}").as_bytes(), STDIN_NAME) {
            return Compiled::Expression(func);
        }
        match self.lua().load(input.as_bytes()).set_name(STDIN_NAME).into_function() {
            Ok(func) => Compiled::Statement(func),
            Err(mlua::Error::SyntaxError {
                incomplete_input: true,
                ..
            }) => Compiled::Incomplete,
            Err(err) => Compiled::Invalid(engine_failure(&err)),
        }
    }

    /// Run compiled interactive input, printing the values of expressions
    pub fn run_compiled(&self, compiled: Compiled) -> Status {
        match compiled {
            Compiled::Expression(func) => {
                let outcome = self
                    .protected_call(&func, MultiValue::new())
                    .and_then(|values| self.print_values(values));
                self.report(outcome)
            }
            Compiled::Statement(func) => self.execute(Ok(func), MultiValue::new()),
            Compiled::Incomplete => self.report(Err(Failure::new(
                Status::SyntaxError,
                "incomplete statement at end of input",
            ))),
            Compiled::Invalid(failure) => self.report(Err(failure)),
        }
    }

    fn load(&self, source: &[u8], name: &str) -> Result<Function, Failure> {
        debug!(interpreter = self.id(), chunk = name, "loading chunk");
        self.lua()
            .load(source)
            .set_name(name)
            .into_function()
            .map_err(|err| engine_failure(&err))
    }

    fn load_file(&self, path: &Path) -> Result<Function, Failure> {
        if path == Path::new("-") {
            let mut source = Vec::new();
            io::stdin()
                .lock()
                .read_to_end(&mut source)
                .map_err(|err| file_failure("read", "stdin", &err))?;
            return self.load(&skip_prefix(&source), STDIN_NAME);
        }

        let display = path.display().to_string();
        let mut file = File::open(path).map_err(|err| file_failure("open", &display, &err))?;
        let mut source = Vec::new();
        file.read_to_end(&mut source)
            .map_err(|err| file_failure("read", &display, &err))?;
        self.load(&skip_prefix(&source), &format!("@{display}"))
    }

    /// Run a loaded chunk (or report why it did not load)
    fn execute(&self, chunk: Result<Function, Failure>, args: MultiValue) -> Status {
        let outcome = chunk.and_then(|func| self.protected_call(&func, args).map(drop));
        self.report(outcome)
    }

    /// Arm the bridge, call `func` through `xpcall` with the message
    /// handler, disarm.
    fn protected_call(&self, func: &Function, args: MultiValue) -> Result<MultiValue, Failure> {
        let guard = bridge::arm(self).map_err(|err| Failure::new(Status::Unrecoverable, err.to_string()))?;

        let mut argv = Vec::with_capacity(args.len() + 2);
        argv.push(Value::Function(func.clone()));
        argv.push(Value::Function(self.handler.clone()));
        argv.extend(args);

        let previous = self.handled.replace(false);
        let outcome = self.xpcall.call::<MultiValue>(MultiValue::from_vec(argv));
        let handled = self.handled.replace(previous);
        drop(guard);

        let mut values = outcome.map_err(|err| engine_failure(&err))?.into_iter();
        match values.next() {
            Some(Value::Boolean(true)) => Ok(values.collect()),
            _ => Err(classify(handled, values.next().unwrap_or(Value::Nil))),
        }
    }

    fn print_values(&self, values: MultiValue) -> Result<(), Failure> {
        if values.is_empty() {
            return Ok(());
        }
        let calling_print = |failure: Failure| {
            Failure::new(failure.status, format!("error calling 'print' ({})", failure.message))
        };
        let print: Function = self
            .lua()
            .globals()
            .get("print")
            .map_err(|err| calling_print(engine_failure(&err)))?;
        self.call(&print, values).map(drop).map_err(calling_print)
    }

    /// Write a failure to the error stream; the status is what callers see
    fn report(&self, outcome: Result<(), Failure>) -> Status {
        let failure = match outcome {
            Ok(()) => return Status::Ok,
            Err(failure) => failure,
        };
        let mut errors = self.errors.borrow_mut();
        if let Err(err) = writeln!(errors, "{}", failure.message).and_then(|()| errors.flush()) {
            warn!(%err, "cannot write error report");
        }
        failure.status
    }
}

/// Build the message handler handed to every protected call. `handled` is
/// set whenever it runs, which tells runtime errors apart from memory errors
/// (the engine does not call the handler for those). `getinfo` is the debug
/// library's, when it is loaded.
pub(crate) fn message_handler(
    lua: &Lua,
    getmetatable: Function,
    getinfo: Option<Function>,
    handled: Rc<Cell<bool>>,
) -> mlua::Result<Function> {
    lua.create_function(move |lua, payload: Value| {
        handled.set(true);
        Ok(decorate(lua, &getmetatable, getinfo.as_ref(), payload))
    })
}

fn decorate(
    lua: &Lua,
    getmetatable: &Function,
    getinfo: Option<&Function>,
    payload: Value,
) -> String {
    let message = match &payload {
        Value::String(text) => String::from(text.to_string_lossy()),
        Value::Integer(_) | Value::Number(_) => match lua.coerce_string(payload.clone()) {
            Ok(Some(text)) => String::from(text.to_string_lossy()),
            _ => format!("(error object is a {} value)", type_name(&payload)),
        },
        Value::Error(err) => describe_error(err),
        _ => match self_description(getmetatable, &payload) {
            Some(text) => return text,
            None => format!("(error object is a {} value)", type_name(&payload)),
        },
    };

    // Level 0 is this handler. The engine's xpcall may interpose an unnamed
    // native trampoline between the handler and the failing frame.
    let stack = LiveStack::new(lua, getinfo);
    let level = match stack.frame(1) {
        Some(frame) if frame.is_anonymous_native() && stack.has_level(2) => 2,
        _ => 1,
    };
    traceback::traceback(&stack, Some(&message), level)
}

/// The payload's own `__tostring`, if it has one that yields a string. The
/// metatable is read raw, so a `__metatable` field does not hide it.
fn self_description(getmetatable: &Function, payload: &Value) -> Option<String> {
    let tostring: Function = match payload {
        Value::Table(table) => table.metatable()?.raw_get("__tostring").ok()?,
        Value::UserData(data) => data.metatable().ok()?.get("__tostring").ok()?,
        other => getmetatable
            .call::<Option<Table>>(other.clone())
            .ok()??
            .raw_get("__tostring")
            .ok()?,
    };
    match tostring.call::<Value>(payload.clone()).ok()? {
        Value::String(text) => Some(String::from(text.to_string_lossy())),
        _ => None,
    }
}

/// Message of an error raised on the host side, without the wrapping
/// added on its way through the engine
pub(crate) fn describe_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(message) | mlua::Error::MemoryError(message) => message.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::CallbackError { cause, .. } => describe_error(cause),
        mlua::Error::ExternalError(err) => err.to_string(),
        other => other.to_string(),
    }
}

/// Type name as the engine spells it
fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Nil => "nil",
        Value::Boolean(_) => "boolean",
        Value::LightUserData(_) | Value::UserData(_) => "userdata",
        Value::Integer(_) | Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Table(_) => "table",
        Value::Function(_) => "function",
        Value::Thread(_) => "thread",
        other => other.type_name(),
    }
}

/// Turn the error object left by a failed `xpcall` into a failure
fn classify(handled: bool, payload: Value) -> Failure {
    let message = match &payload {
        Value::String(text) => String::from(text.to_string_lossy()),
        other => format!("(error object is a {} value)", type_name(other)),
    };
    let status = if !handled && message == MEMORY_ERROR {
        Status::OutOfMemory
    } else {
        Status::RuntimeError
    };
    Failure::new(status, message)
}

/// Failure for an error that surfaced from the engine API itself
fn engine_failure(err: &mlua::Error) -> Failure {
    let status = match err {
        mlua::Error::SyntaxError { .. } => Status::SyntaxError,
        mlua::Error::MemoryError(_) => Status::OutOfMemory,
        _ => Status::RuntimeError,
    };
    Failure::new(status, describe_error(err))
}

fn file_failure(action: &str, name: &str, err: &io::Error) -> Failure {
    let reason = match err.raw_os_error() {
        Some(code) => Errno::from_raw(code).desc().to_string(),
        None => err.to_string(),
    };
    Failure::new(Status::FileError, format!("cannot {action} {name}: {reason}"))
}

/// Skip a UTF-8 byte order mark and blank out a first line starting with
/// `#` (e.g. `#!/usr/bin/env moon`), keeping its newline so line numbers
/// stay put
fn skip_prefix(source: &[u8]) -> Cow<'_, [u8]> {
    let source = source.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(source);
    if !source.starts_with(b"#") {
        return Cow::Borrowed(source);
    }
    match source.iter().position(|&byte| byte == b'\n') {
        Some(newline) => Cow::Borrowed(&source[newline..]),
        None => Cow::Borrowed(&[]),
    }
}
