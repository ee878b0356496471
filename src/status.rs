use std::fmt;

/// Outcome of running a chunk through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    /// The source did not compile
    SyntaxError,
    /// The source file could not be opened or read
    FileError,
    /// An error escaped the chunk, including the synthetic `interrupted!`
    RuntimeError,
    /// The engine ran out of memory (or hit the configured limit)
    OutOfMemory,
    /// Host-side failure: the call never reached the engine
    Unrecoverable,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// Process exit code for a one-shot run that ended with this status
    pub fn exit_code(self) -> u8 {
        match self {
            Status::Ok => 0,
            _ => 1,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "ok",
            Status::SyntaxError => "syntax error",
            Status::FileError => "file error",
            Status::RuntimeError => "runtime error",
            Status::OutOfMemory => "out of memory",
            Status::Unrecoverable => "unrecoverable error",
        };
        f.write_str(name)
    }
}

/// A failed run: its status and the (already decorated) error message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub status: Status,
    pub message: String,
}

impl Failure {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Failure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_ok_exits_cleanly() {
        assert_eq!(Status::Ok.exit_code(), 0);
        for status in [
            Status::SyntaxError,
            Status::FileError,
            Status::RuntimeError,
            Status::OutOfMemory,
            Status::Unrecoverable,
        ] {
            assert!(!status.is_ok());
            assert_eq!(status.exit_code(), 1, "{status}");
        }
    }

    #[test]
    fn failure_displays_its_message() {
        let failure = Failure::new(Status::RuntimeError, "boom\nstack traceback:");
        assert_eq!(failure.to_string(), "boom\nstack traceback:");
    }
}
