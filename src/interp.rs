use std::cell::{Cell, RefCell};
use std::io::Write;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use mlua::{Function, Lua, LuaOptions, StdLib, Table};
use tracing::debug;

use crate::bridge;
use crate::error::ShellError;
use crate::pipeline;

/// Source of process-unique interpreter ids (0 means "no interpreter")
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Knobs for a new interpreter instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// VM instructions between interrupt checkpoints
    pub checkpoint_interval: u32,
    /// Engine memory limit in bytes
    pub memory_limit: Option<usize>,
    /// Load the `debug` standard library, as a standalone interpreter does
    pub debug_library: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            checkpoint_interval: 1000,
            memory_limit: None,
            debug_library: true,
        }
    }
}

/// An embedded Lua state plus everything the execution pipeline needs
/// to run chunks in it
pub struct Interpreter {
    id: u64,
    lua: Lua,
    options: Options,
    /// The engine's `xpcall`, captured before any script can replace it
    pub(crate) xpcall: Function,
    /// Message handler passed to every protected call
    pub(crate) handler: Function,
    /// Set by the message handler when it runs
    pub(crate) handled: Rc<Cell<bool>>,
    pub(crate) errors: RefCell<Box<dyn Write>>,
}

impl Interpreter {
    /// Create an interpreter with the standard libraries and the `moon`
    /// host table loaded
    pub fn new(options: Options) -> Result<Self, ShellError> {
        let lua = if options.debug_library {
            // SAFETY: `debug` is what makes this constructor unsafe. It lets
            // scripts poke at engine internals, which a standalone
            // interpreter allows too.
            unsafe { Lua::unsafe_new_with(StdLib::ALL_SAFE | StdLib::DEBUG, LuaOptions::new()) }
        } else {
            Lua::new_with(StdLib::ALL_SAFE, LuaOptions::new()).map_err(ShellError::Unrecoverable)?
        };

        if let Some(limit) = options.memory_limit {
            lua.set_memory_limit(limit).map_err(ShellError::Unrecoverable)?;
        }

        let globals = lua.globals();
        let xpcall: Function = globals.get("xpcall").map_err(ShellError::Unrecoverable)?;
        let getmetatable: Function = globals
            .get("getmetatable")
            .map_err(ShellError::Unrecoverable)?;

        let getinfo: Option<Function> = match globals.get::<Option<Table>>("debug") {
            Ok(Some(debug)) => debug.get("getinfo").ok(),
            _ => None,
        };

        let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
        let handled = Rc::new(Cell::new(false));
        let handler = pipeline::message_handler(&lua, getmetatable, getinfo, Rc::clone(&handled))
            .map_err(ShellError::Unrecoverable)?;
        bridge::route_coroutines(&lua, id, options.checkpoint_interval)
            .map_err(ShellError::Unrecoverable)?;
        register_host_table(&lua, &options).map_err(ShellError::Unrecoverable)?;

        debug!(interpreter = id, ?options, "created interpreter");

        Ok(Self {
            id,
            lua,
            options,
            xpcall,
            handler,
            handled,
            errors: RefCell::new(Box::new(std::io::stderr())),
        })
    }

    /// Send error reports to `stream` instead of standard error
    pub fn with_error_stream(self, stream: impl Write + 'static) -> Self {
        *self.errors.borrow_mut() = Box::new(stream);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The underlying engine, for host code that registers more functions
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Build the global `arg` table from the process arguments. `script`
    /// is the index of the script name in `argv`; it lands at `arg[0]`,
    /// its arguments at positive indices and the interpreter's own
    /// arguments at negative ones.
    pub fn set_args(&self, argv: &[String], script: Option<usize>) -> Result<(), ShellError> {
        let base = script.unwrap_or(0) as i64;
        let table = self.lua.create_table()?;
        for (index, value) in argv.iter().enumerate() {
            table.raw_set(index as i64 - base, value.as_str())?;
        }
        self.lua.globals().set("arg", table)?;
        Ok(())
    }

    /// Release the engine. Dropping does the same; this just makes the
    /// end of the scripting lifetime visible at the call site.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        bridge::disarm(self);
        debug!(interpreter = self.id, "closed interpreter");
    }
}

/// Host functions exposed to scripts as the global `moon` table
fn register_host_table(lua: &Lua, options: &Options) -> mlua::Result<()> {
    let moon = lua.create_table()?;
    moon.set("version", env!("CARGO_PKG_VERSION"))?;
    moon.set("checkpoint_interval", options.checkpoint_interval)?;
    moon.set(
        "getenv",
        lua.create_function(|_, name: String| Ok(std::env::var(name).ok()))?,
    )?;
    moon.set(
        "home",
        lua.create_function(|_, ()| {
            Ok(home::home_dir()
                .filter(|path| !path.as_os_str().is_empty())
                .map(|path| path.to_string_lossy().into_owned()))
        })?,
    )?;
    lua.globals().set("moon", moon)?;
    Ok(())
}
