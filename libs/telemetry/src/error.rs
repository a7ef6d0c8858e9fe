use std::io;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    #[error("io {0}")]
    #[diagnostic(code(telemetry::io))]
    Io(#[from] io::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Uavo(#[from] uavo::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Frame(#[from] uavtalk::Error),

    #[error("can only send or request on handshaking sessions")]
    #[diagnostic(
        code(telemetry::not_bidirectional),
        help("enable `handshaking` in the session config; replayed logs are receive only")
    )]
    NotBidirectional,

    #[error("object {0} is required but missing from the registry")]
    #[diagnostic(code(telemetry::missing_object))]
    MissingObject(&'static str),

    #[error("inline sessions are serviced by their callers and cannot be started")]
    #[diagnostic(code(telemetry::inline_session))]
    InlineSession,

    #[error("session service thread already started")]
    #[diagnostic(code(telemetry::already_started))]
    AlreadyStarted,

    #[error("session closed")]
    #[diagnostic(code(telemetry::closed))]
    Closed,

    #[error("no chunk of file {file_id} at offset {offset} after {attempts} requests")]
    #[diagnostic(code(telemetry::file_transfer))]
    FileTransfer {
        file_id: u32,
        offset: u32,
        attempts: usize,
    },

    #[error("log header: {0}")]
    #[diagnostic(
        code(telemetry::log_header),
        help("logs written by the GCS start with a `dRonin git hash:` line")
    )]
    LogHeader(String),
}

impl Error {
    pub fn is_stream_closed(&self) -> bool {
        match self {
            Error::Closed => true,
            Error::Io(err) => is_closed_io(err),
            _ => false,
        }
    }
}

/// Conditions after which a transport is simply polled again.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

fn is_closed_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}
