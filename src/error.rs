use std::path::PathBuf;

/// Host-side errors: everything that goes wrong outside a protected call
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    /// The engine could not be created or initialized
    #[error("cannot create interpreter: {0}")]
    Unrecoverable(#[source] mlua::Error),

    /// A different interpreter already owns the interrupt handler
    #[error("interpreter {holder} is already running a protected call")]
    AlreadyArmed { holder: u64 },

    #[error("cannot install interrupt handler: {0}")]
    Signal(#[from] nix::Error),

    #[error("invalid configuration in {}: {source}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Lua(#[from] mlua::Error),
}
