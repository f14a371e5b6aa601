// Jackson Coxson

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdeviceError {
    #[error("device socket io failed")]
    Socket(#[from] io::Error),
    #[error("ssl io failed")]
    Ssl(#[from] openssl::ssl::Error),
    #[error("ssl failed to setup")]
    SslSetup(#[from] openssl::error::ErrorStack),
    #[error("io on plist")]
    Plist(#[from] plist::Error),
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Invalid caller input, never retried
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// Peer bytes broke the protocol; the connection is unusable afterwards
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The session was already shutting down when the operation started
    #[error("session is shutting down")]
    GracefulShutdown,
    /// The connection dropped while the session was still meant to be alive
    #[error("connection to device lost")]
    ConnectionLost,
    /// AFC replied with a non-zero status code
    #[error("afc returned status {0}")]
    AfcStatus(u64),
    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("unable to connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("lockdown handshake failed during {step}")]
    Handshake {
        step: &'static str,
        #[source]
        source: Box<IdeviceError>,
    },

    #[error("unexpected response from device")]
    UnexpectedResponse,
    #[error("this request was prohibited")]
    GetProhibited,
    #[error("no SSL session is active")]
    SessionInactive,
    #[error("device does not have pairing file")]
    InvalidHostID,
    #[error("device locked")]
    DeviceLocked,
    #[error("no established connection")]
    NoEstablishedConnection,
    #[error("invalid argument passed")]
    InvalidArgument,
    #[error("unknown error `{0}` returned from device")]
    UnknownErrorType(String),
}

impl IdeviceError {
    pub(crate) fn from_device_error_type(e: &str) -> Option<Self> {
        match e {
            "GetProhibited" => Some(Self::GetProhibited),
            "InvalidHostID" => Some(Self::InvalidHostID),
            "SessionInactive" => Some(Self::SessionInactive),
            "DeviceLocked" => Some(Self::DeviceLocked),
            _ => None,
        }
    }

    /// The only class the retry layer waits out and retries
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost)
    }

    pub(crate) fn during(self, step: &'static str) -> Self {
        Self::Handshake {
            step,
            source: Box::new(self),
        }
    }
}
