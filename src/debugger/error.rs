use std::str::Utf8Error;

/// Errors produced while loading and replaying a simulation trace.
///
/// Everything here is fatal for the session that hit it: the trace or its
/// sources cannot be interpreted, so the session terminates with a
/// diagnostic. Request-level problems (unknown command, bad arguments,
/// out-of-range evaluate) never reach this enum, they are answered inline
/// by the DAP surface.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),

    #[error("malformed trace: {0}")]
    BadTrace(String),
    #[error("no source for program hash {0}")]
    MissingSource(String),
    #[error("malformed source map for {0}: {1}")]
    BadSourceMap(String, String),
}

impl Error {
    pub fn bad_trace(msg: impl Into<String>) -> Self {
        Error::BadTrace(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
