//! Stack tracebacks in the engine's standard format.
//!
//! The message handler runs while the failing call stack still exists, so
//! it walks the stack here and appends a `stack traceback:` block to the
//! error message. Very deep stacks (runaway recursion) keep only their
//! first and last frames.

use std::fmt::{self, Write};

use mlua::{Function, Lua, Table, Value};

/// Frames shown before the skip marker
const LEVELS_HEAD: usize = 10;
/// Frames shown after the skip marker
const LEVELS_TAIL: usize = 11;

/// One activation record, as reported by the engine's debug interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub short_src: String,
    pub current_line: Option<usize>,
    pub name: Option<String>,
    /// How the name was found: "global", "local", "method", "field", ...
    pub name_what: Option<String>,
    /// "Lua", "C" or "main"
    pub what: String,
    pub line_defined: Option<usize>,
    /// Where the function lives among the loaded modules, e.g. `string.rep`
    pub global_name: Option<String>,
    pub tail_call: bool,
}

impl Frame {
    /// A native function nobody called by name (e.g. a C trampoline)
    pub fn is_anonymous_native(&self) -> bool {
        self.what == "C" && self.name.is_none() && self.global_name.is_none()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.current_line {
            Some(line) => write!(f, "{}:{}: in ", self.short_src, line)?,
            None => write!(f, "{}: in ", self.short_src)?,
        }

        if let Some(global) = &self.global_name {
            write!(f, "function '{global}'")?;
        } else {
            match (self.name_what.as_deref(), self.name.as_deref()) {
                (Some("global"), Some(name)) => write!(f, "function '{name}'")?,
                (Some(kind), Some(name)) if !kind.is_empty() => write!(f, "{kind} '{name}'")?,
                _ if self.what == "main" => f.write_str("main chunk")?,
                _ if self.what == "C" => f.write_str("?")?,
                _ => write!(
                    f,
                    "function <{}:{}>",
                    self.short_src,
                    self.line_defined.unwrap_or(0)
                )?,
            }
        }

        if self.tail_call {
            f.write_str("\n\t(...tail calls...)")?;
        }
        Ok(())
    }
}

/// Anything that can describe the call stack level by level (0 = innermost)
pub trait StackSource {
    fn frame(&self, level: usize) -> Option<Frame>;

    fn has_level(&self, level: usize) -> bool {
        self.frame(level).is_some()
    }
}

/// The running engine's stack. The tail-call bit and module-qualified
/// names need `debug.getinfo`; without it frames carry neither.
pub struct LiveStack<'a> {
    lua: &'a Lua,
    getinfo: Option<&'a Function>,
}

impl<'a> LiveStack<'a> {
    pub fn new(lua: &'a Lua, getinfo: Option<&'a Function>) -> Self {
        Self { lua, getinfo }
    }

    /// `debug.getinfo` counts itself as level 0, so every level shifts by one
    fn info(&self, level: usize) -> Option<Table> {
        self.getinfo?.call::<Option<Table>>((level + 1, "ft")).ok()?
    }
}

impl StackSource for LiveStack<'_> {
    fn frame(&self, level: usize) -> Option<Frame> {
        let mut frame = {
            let debug = self.lua.inspect_stack(level)?;
            let names = debug.names();
            let source = debug.source();
            Frame {
                short_src: source.short_src.as_deref().unwrap_or("?").to_owned(),
                current_line: usize::try_from(debug.curr_line()).ok().filter(|line| *line > 0),
                name: names.name.as_deref().map(str::to_owned),
                name_what: names.name_what.as_deref().map(str::to_owned),
                what: source.what.to_string(),
                line_defined: source.line_defined,
                global_name: None,
                tail_call: false,
            }
        };

        if let Some(info) = self.info(level) {
            frame.tail_call = info.get("istailcall").unwrap_or(false);
            if let Ok(func) = info.get::<Function>("func") {
                frame.global_name = loaded_name(self.lua, &func);
            }
        }
        Some(frame)
    }

    fn has_level(&self, level: usize) -> bool {
        self.lua.inspect_stack(level).is_some()
    }
}

/// Name of `func` as a loaded module or a field of one, with the `_G.`
/// prefix dropped for plain globals
fn loaded_name(lua: &Lua, func: &Function) -> Option<String> {
    let loaded: Table = lua.named_registry_value("_LOADED").ok()?;
    let target = Value::Function(func.clone());

    for (module, value) in loaded.pairs::<Value, Value>().flatten() {
        let Value::String(module) = module else {
            continue;
        };
        let module = String::from(module.to_string_lossy());
        if value == target {
            return Some(module);
        }
        let Value::Table(fields) = value else {
            continue;
        };
        for (key, value) in fields.pairs::<Value, Value>().flatten() {
            if let (Value::String(key), true) = (key, value == target) {
                let name = format!("{module}.{}", key.to_string_lossy());
                return Some(match name.strip_prefix("_G.") {
                    Some(global) => global.to_owned(),
                    None => name,
                });
            }
        }
    }
    None
}

impl StackSource for [Frame] {
    fn frame(&self, level: usize) -> Option<Frame> {
        self.get(level).cloned()
    }
}

/// Index of the outermost level, found by exponential then binary search
/// so a huge stack costs a logarithmic number of lookups
fn last_level<S: StackSource + ?Sized>(stack: &S) -> usize {
    let (mut low, mut high) = (1, 1);
    while stack.has_level(high) {
        low = high;
        high *= 2;
    }
    while low < high {
        let mid = (low + high) / 2;
        if stack.has_level(mid) {
            low = mid + 1;
        } else {
            high = mid;
        }
    }
    high - 1
}

/// Render `message` followed by a traceback starting at `level`
pub fn traceback<S: StackSource + ?Sized>(stack: &S, message: Option<&str>, level: usize) -> String {
    let last = last_level(stack);
    let mut head = (last.saturating_sub(level) > LEVELS_HEAD + LEVELS_TAIL).then_some(LEVELS_HEAD);

    let mut out = String::new();
    if let Some(message) = message {
        out.push_str(message);
        out.push('\n');
    }
    out.push_str("stack traceback:");

    let mut level = level;
    while let Some(frame) = stack.frame(level) {
        match head {
            Some(0) => {
                let resume = last + 1 - LEVELS_TAIL;
                let _ = write!(out, "\n\t...\t(skipping {} levels)", resume - level);
                head = None;
                level = resume;
                continue;
            }
            Some(ref mut remaining) => *remaining -= 1,
            None => {}
        }
        let _ = write!(out, "\n\t{frame}");
        level += 1;
    }
    out
}
