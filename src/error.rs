use std::fmt;

/// Top-level error returned from fallible entry points. The controller
/// (`main`) matches on the variant to pick an exit code.
#[derive(Debug)]
pub enum AppError {
    /// Invalid or missing CLI configuration; fatal before any thread starts.
    Config(String),
    /// Packet-source open failure or other fatal capture-thread condition.
    Capture(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AppError::Config(msg) => write!(f, "configuration error: {}", msg),
            AppError::Capture(msg) => write!(f, "capture error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}
