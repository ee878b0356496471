//! An embedding shell around Lua: create an interpreter, run lines and
//! files through it, stop runaway scripts on Ctrl-C, and report uncaught
//! errors with a traceback.

pub mod bridge;
pub mod config;
pub mod error;
pub mod interp;
pub mod pipeline;
pub mod repl;
pub mod status;
pub mod traceback;

pub use config::Config;
pub use error::ShellError;
pub use interp::{Interpreter, Options};
pub use pipeline::Compiled;
pub use status::{Failure, Status};
