// Jackson Coxson

#[cfg(feature = "afc")]
pub mod afc;
pub mod config;
pub mod diagnostics;
mod error;
pub mod heartbeat;
pub mod lockdownd;
pub mod pairing_file;
#[cfg(feature = "retry")]
pub mod retry;
pub mod shutdown;
#[cfg(test)]
mod test_support;
mod util;

use std::sync::Arc;

use log::debug;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use config::ConnectOptions;
#[cfg(feature = "retry")]
pub use config::RetryOptions;
use diagnostics::{DiagnosticSink, Direction, NoopSink};
pub use error::IdeviceError;
pub use lockdownd::LockdownSession;
use pairing_file::ClientIdentity;
pub use shutdown::ShutdownSignal;
pub use util::{pretty_print_dictionary, pretty_print_plist};

pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

pub type IdeviceSocket = Box<dyn ReadWrite>;

/// A service reachable through lockdownd's StartService
pub trait IdeviceService: Sized {
    fn service_name() -> &'static str;
    fn connect(
        session: &LockdownSession,
    ) -> impl std::future::Future<Output = Result<Self, IdeviceError>> + Send;
}

/// Length-prefixed plist transport used by lockdownd and heartbeat
#[derive(Debug)]
pub struct Idevice {
    socket: Option<IdeviceSocket>,
    label: String,
    sink: Arc<dyn DiagnosticSink>,
}

impl Idevice {
    pub fn new(socket: IdeviceSocket, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            label: label.into(),
            sink: Arc::new(NoopSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Sends a plist to the socket
    pub async fn send_plist(&mut self, message: plist::Value) -> Result<(), IdeviceError> {
        let Some(socket) = &mut self.socket else {
            return Err(IdeviceError::NoEstablishedConnection);
        };
        debug!("Sending plist: {}", pretty_print_plist(&message));

        let mut buf = Vec::new();
        message.to_writer_xml(&mut buf)?;
        self.sink.record(Direction::Sent, &self.label, &buf);

        let len = buf.len() as u32;
        socket.write_all(&len.to_be_bytes()).await?;
        socket.write_all(&buf).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Read a plist from the socket
    pub async fn read_plist(&mut self) -> Result<plist::Dictionary, IdeviceError> {
        let Some(socket) = &mut self.socket else {
            return Err(IdeviceError::NoEstablishedConnection);
        };
        debug!("Reading response size");
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await?;
        let len = u32::from_be_bytes(buf);
        let mut buf = vec![0; len as usize];
        socket.read_exact(&mut buf).await?;
        self.sink.record(Direction::Received, &self.label, &buf);

        let res: plist::Dictionary = plist::from_bytes(&buf)?;
        debug!("Received plist: {}", pretty_print_dictionary(&res));

        if let Some(e) = res.get("Error") {
            let e: String = plist::from_value(e)?;
            return Err(IdeviceError::from_device_error_type(e.as_str())
                .unwrap_or(IdeviceError::UnknownErrorType(e)));
        }
        Ok(res)
    }

    /// One request, one response
    pub async fn send_request<T: serde::Serialize>(
        &mut self,
        request: &T,
    ) -> Result<plist::Dictionary, IdeviceError> {
        self.send_plist(plist::to_value(request)?).await?;
        self.read_plist().await
    }

    /// Wraps the current connection in TLS using the paired host identity.
    ///
    /// Chain verification is skipped since trust comes from the pairing, but
    /// the device must present exactly one certificate.
    pub async fn start_tls(&mut self, identity: &ClientIdentity) -> Result<(), IdeviceError> {
        let socket = self
            .socket
            .take()
            .ok_or(IdeviceError::NoEstablishedConnection)?;
        let socket = tls_connect(socket, identity).await?;
        self.socket = Some(socket);
        Ok(())
    }

    /// Hands the raw stream to a service client
    pub fn into_socket(mut self) -> Option<IdeviceSocket> {
        self.socket.take()
    }

    /// Drops the stream after a best-effort shutdown. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.shutdown().await {
                debug!("{}: shutdown failed: {e}", self.label);
            }
        }
    }
}

pub(crate) async fn tls_connect(
    socket: IdeviceSocket,
    identity: &ClientIdentity,
) -> Result<IdeviceSocket, IdeviceError> {
    let mut connector = SslConnector::builder(SslMethod::tls())?;
    connector.set_certificate(&identity.certificate)?;
    connector.set_private_key(&identity.private_key)?;
    connector.set_verify(SslVerifyMode::NONE);

    let ssl = connector
        .build()
        .configure()?
        .verify_hostname(false)
        .use_server_name_indication(false)
        .into_ssl("lockdown")?;

    let mut ssl_stream = tokio_openssl::SslStream::new(ssl, socket)?;
    std::pin::Pin::new(&mut ssl_stream).connect().await?;

    let peer_certs = ssl_stream
        .ssl()
        .peer_cert_chain()
        .map(|chain| chain.len())
        .unwrap_or(0);
    if peer_certs != 1 {
        return Err(IdeviceError::ProtocolViolation(format!(
            "device presented {peer_certs} certificates, expected 1"
        )));
    }
    Ok(Box::new(ssl_stream))
}
