//! Cancellation bridge: turns an asynchronous SIGINT into a cooperative
//! stop inside the engine.
//!
//! A signal handler cannot touch the engine (there is no synchronization
//! it could use), so the work is split in two. The handler only sets
//! [`PENDING`]. A hook installed on the armed interpreter checks the flag at
//! every call, every return and every `checkpoint_interval` instructions,
//! and when it finds it set it clears it and raises `interrupted!` on the
//! thread that is running the script.
//!
//! Coroutines run on their own engine threads, so the routed
//! `coroutine.resume` carries the hook into each one it resumes.
//!
//! The handler is installed with `SA_RESETHAND`, so the kernel restores the
//! default disposition as soon as the first interrupt is delivered. A second
//! Ctrl-C during the same call therefore kills the process, which keeps a
//! script stuck outside the VM (e.g. in a blocking host call) killable.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use mlua::{Function, HookTriggers, Lua, MultiValue, Table, Thread, Value, VmState};
use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{debug, warn};

use crate::error::ShellError;
use crate::interp::Interpreter;

/// Message of the error raised in the interrupted script
pub const INTERRUPTED: &str = "interrupted!";

/// A stop has been requested and not yet injected
static PENDING: AtomicBool = AtomicBool::new(false);

/// Id of the armed interpreter, 0 when none is armed
static ARMED: AtomicU64 = AtomicU64::new(0);

extern "C" fn on_interrupt(_signal: libc::c_int) {
    PENDING.store(true, Ordering::SeqCst);
}

/// Ask the armed interpreter to stop at its next checkpoint. This is exactly
/// what the signal handler does, so it is safe to call from anywhere.
pub fn request_stop() {
    PENDING.store(true, Ordering::SeqCst);
}

/// Whether a stop has been requested and not yet injected
pub fn stop_requested() -> bool {
    PENDING.load(Ordering::SeqCst)
}

/// Id of the interpreter currently armed, if any
pub fn armed_target() -> Option<u64> {
    match ARMED.load(Ordering::SeqCst) {
        0 => None,
        id => Some(id),
    }
}

/// Keeps an interpreter armed; disarms it when dropped
#[must_use = "the interpreter is disarmed as soon as the guard is dropped"]
pub struct ArmGuard<'a> {
    /// `None` for a nested arm by the interpreter that already holds the slot
    interp: Option<&'a Interpreter>,
}

impl ArmGuard<'_> {
    /// Whether dropping this guard disarms the interpreter
    pub fn is_outermost(&self) -> bool {
        self.interp.is_some()
    }
}

impl Drop for ArmGuard<'_> {
    fn drop(&mut self) {
        if let Some(interp) = self.interp {
            disarm(interp);
        }
    }
}

/// Make `interp` the target of the interrupt signal for the duration of a
/// protected call
pub fn arm(interp: &Interpreter) -> Result<ArmGuard<'_>, ShellError> {
    let id = interp.id();
    if let Err(holder) = ARMED.compare_exchange(0, id, Ordering::SeqCst, Ordering::SeqCst) {
        if holder == id {
            // A host function re-entering the pipeline: the outer call
            // keeps ownership of the handler and the hook.
            return Ok(ArmGuard { interp: None });
        }
        return Err(ShellError::AlreadyArmed { holder });
    }

    PENDING.store(false, Ordering::SeqCst);
    install_checkpoint(interp.lua(), interp.options().checkpoint_interval);

    if let Err(err) = set_disposition(SigHandler::Handler(on_interrupt), SaFlags::SA_RESETHAND) {
        interp.lua().remove_hook();
        ARMED.store(0, Ordering::SeqCst);
        return Err(err.into());
    }

    debug!(interpreter = id, "armed interrupt handler");
    Ok(ArmGuard {
        interp: Some(interp),
    })
}

/// Restore the default SIGINT disposition and drop the checkpoint hook.
/// Does nothing unless `interp` is the armed interpreter.
pub fn disarm(interp: &Interpreter) {
    let id = interp.id();
    if ARMED.load(Ordering::SeqCst) != id {
        return;
    }

    if let Err(err) = set_disposition(SigHandler::SigDfl, SaFlags::empty()) {
        warn!(interpreter = id, %err, "cannot restore default SIGINT disposition");
    }
    interp.lua().remove_hook();
    PENDING.store(false, Ordering::SeqCst);
    ARMED.store(0, Ordering::SeqCst);
    debug!(interpreter = id, "disarmed interrupt handler");
}

fn checkpoint_triggers(interval: u32) -> HookTriggers {
    HookTriggers::new()
        .on_calls()
        .on_returns()
        .every_nth_instruction(interval.max(1))
}

fn checkpoint() -> mlua::Result<VmState> {
    if PENDING.swap(false, Ordering::SeqCst) {
        return Err(mlua::Error::RuntimeError(INTERRUPTED.to_owned()));
    }
    Ok(VmState::Continue)
}

fn install_checkpoint(lua: &Lua, interval: u32) {
    lua.set_hook(checkpoint_triggers(interval), |_lua, _debug| checkpoint());
}

fn install_thread_checkpoint(thread: &Thread, interval: u32) {
    thread.set_hook(checkpoint_triggers(interval), |_lua, _debug| checkpoint());
}

/// Lua source of `coroutine.wrap`, rebuilt on the routed `resume`. String
/// errors get the caller's position prepended, as the native one does.
const WRAP: &str = r#"
local create, resume, close, status, error, type = ...
local function finish(co, ok, ...)
  if ok then return ... end
  local err = ...
  if status(co) == "dead" then close(co) end
  if type(err) == "string" then error(err, 2) end
  error(err, 0)
end
return function(f)
  local co = create(f)
  return function(...)
    return finish(co, resume(co, ...))
  end
end
"#;

/// Replace `coroutine.resume` and `coroutine.wrap` so code running inside a
/// coroutine reaches checkpoints too. The engine keeps a single hook, so
/// while interpreter `id` is armed the hook moves to the resumed thread and
/// back to the resuming one when it yields or dies.
pub(crate) fn route_coroutines(lua: &Lua, id: u64, interval: u32) -> mlua::Result<()> {
    let coroutine: Table = lua.globals().get("coroutine")?;
    let resume: Function = coroutine.get("resume")?;

    let routed = lua.create_function(move |lua, args: MultiValue| {
        let armed = ARMED.load(Ordering::SeqCst) == id;
        let resumer = lua.current_thread();
        if let (true, Some(Value::Thread(thread))) = (armed, args.front()) {
            install_thread_checkpoint(thread, interval);
        }
        let results = resume.call::<MultiValue>(args);
        if ARMED.load(Ordering::SeqCst) == id {
            install_thread_checkpoint(&resumer, interval);
        }
        results
    })?;

    let globals = lua.globals();
    let wrap: Function = lua.load(WRAP).set_name("=coroutine.wrap").call((
        coroutine.get::<Function>("create")?,
        routed.clone(),
        coroutine.get::<Function>("close")?,
        coroutine.get::<Function>("status")?,
        globals.get::<Function>("error")?,
        globals.get::<Function>("type")?,
    ))?;

    coroutine.set("resume", routed)?;
    coroutine.set("wrap", wrap)?;
    Ok(())
}

fn set_disposition(handler: SigHandler, flags: SaFlags) -> nix::Result<SigAction> {
    let action = SigAction::new(handler, flags, SigSet::empty());
    // SAFETY: the only handler ever installed here is `on_interrupt`, which
    // does nothing but store to an atomic.
    unsafe { signal::sigaction(Signal::SIGINT, &action) }
}
