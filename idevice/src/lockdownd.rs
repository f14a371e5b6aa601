// Jackson Coxson
//! Lockdown session: handshake, TLS upgrade and service negotiation.

use std::sync::{Arc, OnceLock};

use log::{debug, info, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::heartbeat;
use crate::pairing_file::{ClientIdentity, PairingFile};
use crate::{
    pretty_print_dictionary, tls_connect, ConnectOptions, Idevice, IdeviceError, IdeviceSocket,
    ShutdownSignal,
};

const PROTOCOL_VERSION: &str = "2";
const LOCKDOWN_TYPE: &str = "com.apple.mobile.lockdown";

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct QueryTypeRequest<'a> {
    label: &'a str,
    protocol_version: &'a str,
    request: &'a str,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct QueryTypeResponse {
    request: Option<String>,
    #[serde(rename = "Type")]
    kind: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct StartSessionRequest<'a> {
    label: &'a str,
    protocol_version: &'a str,
    request: &'a str,
    #[serde(rename = "HostID")]
    host_id: &'a str,
    #[serde(rename = "SystemBUID")]
    system_buid: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StartSessionResponse {
    #[serde(rename = "SessionID")]
    session_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct StartServiceRequest<'a> {
    label: &'a str,
    protocol_version: &'a str,
    request: &'a str,
    service: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StartServiceResponse {
    port: u16,
    #[serde(rename = "EnableServiceSSL", default)]
    enable_service_ssl: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetValueRequest<'a> {
    label: &'a str,
    protocol_version: &'a str,
    request: &'a str,
    key: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetValueResponse {
    value: Option<plist::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct StopSessionRequest<'a> {
    label: &'a str,
    protocol_version: &'a str,
    request: &'a str,
    #[serde(rename = "SessionID")]
    session_id: &'a str,
}

async fn request<Req: Serialize, Res: DeserializeOwned>(
    idevice: &mut Idevice,
    req: &Req,
) -> Result<Res, IdeviceError> {
    let res = idevice.send_request(req).await?;
    Ok(plist::from_value(&plist::Value::Dictionary(res))?)
}

/// A TLS-upgraded lockdownd session.
///
/// Cloning yields another handle to the same session; the heartbeat task
/// holds one so it can stop the session when the device goes quiet.
#[derive(Debug, Clone)]
pub struct LockdownSession {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    host: String,
    session_id: String,
    pairing: PairingFile,
    identity: OnceLock<ClientIdentity>,
    control: Mutex<Idevice>,
    shutdown: ShutdownSignal,
    options: ConnectOptions,
}

impl LockdownSession {
    pub async fn connect(host: &str, pairing: &PairingFile) -> Result<Self, IdeviceError> {
        Self::connect_with(host, pairing, ConnectOptions::default()).await
    }

    /// Handshakes with lockdownd at `host`, upgrades to TLS and starts the
    /// heartbeat. On failure the partial connection is closed.
    pub async fn connect_with(
        host: &str,
        pairing: &PairingFile,
        options: ConnectOptions,
    ) -> Result<Self, IdeviceError> {
        let host = host.trim();
        if host.is_empty() {
            warn!("LOCKDOWN: connect called with empty address");
            return Err(IdeviceError::Configuration(
                "connect called with empty address".into(),
            ));
        }
        info!("LOCKDOWN: connecting to {host}:{}", options.port);

        let tcp = TcpStream::connect((host, options.port))
            .await
            .map_err(|source| IdeviceError::Connect {
                addr: format!("{host}:{}", options.port),
                source,
            })?;
        let mut control =
            Idevice::new(Box::new(tcp), options.label.clone()).with_sink(options.sink.clone());

        let (session_id, identity) = match handshake(&mut control, pairing).await {
            Ok(v) => v,
            Err(e) => {
                control.close().await;
                return Err(e);
            }
        };
        info!("LOCKDOWN: connected, session id {session_id}");

        let session = Self {
            inner: Arc::new(SessionInner {
                host: host.to_string(),
                session_id,
                pairing: pairing.clone(),
                identity: OnceLock::from(identity),
                control: Mutex::new(control),
                shutdown: ShutdownSignal::new(),
                options,
            }),
        };

        if let Err(e) = heartbeat::start(&session).await {
            session.stop_session().await;
            return Err(e.during("Heartbeat"));
        }
        Ok(session)
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    /// The signal every stream of this session observes
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.inner.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_set()
    }

    /// TLS identity from the pairing file, parsed on first use
    fn identity(&self) -> Result<&ClientIdentity, IdeviceError> {
        if let Some(identity) = self.inner.identity.get() {
            return Ok(identity);
        }
        let identity = self.inner.pairing.client_identity()?;
        Ok(self.inner.identity.get_or_init(|| identity))
    }

    /// Asks lockdownd to start `service` and connects to the port it returns
    pub async fn start_service(&self, service: &str) -> Result<IdeviceSocket, IdeviceError> {
        if self.is_shutting_down() {
            return Err(IdeviceError::GracefulShutdown);
        }
        info!("LOCKDOWN: StartService {service}");

        let res: StartServiceResponse = {
            let mut control = self.inner.control.lock().await;
            let label = control.label().to_string();
            request(
                &mut control,
                &StartServiceRequest {
                    label: &label,
                    protocol_version: PROTOCOL_VERSION,
                    request: "StartService",
                    service,
                },
            )
            .await?
        };
        debug!(
            "LOCKDOWN: {service} on port {} (ssl: {})",
            res.port, res.enable_service_ssl
        );

        let tcp = TcpStream::connect((self.host(), res.port))
            .await
            .map_err(|source| IdeviceError::Connect {
                addr: format!("{}:{}", self.host(), res.port),
                source,
            })?;
        let socket: IdeviceSocket = Box::new(tcp);
        if res.enable_service_ssl {
            tls_connect(socket, self.identity()?).await
        } else {
            Ok(socket)
        }
    }

    /// Reads a lockdown property and decodes it into `T`
    pub async fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<T, IdeviceError> {
        if self.is_shutting_down() {
            return Err(IdeviceError::GracefulShutdown);
        }
        let res: GetValueResponse = {
            let mut control = self.inner.control.lock().await;
            let label = control.label().to_string();
            request(
                &mut control,
                &GetValueRequest {
                    label: &label,
                    protocol_version: PROTOCOL_VERSION,
                    request: "GetValue",
                    key,
                },
            )
            .await?
        };
        let value = res.value.ok_or(IdeviceError::UnexpectedResponse)?;
        Ok(plist::from_value(&value)?)
    }

    /// Ends the session. Failures talking to the device are logged, never
    /// returned. Raises the shutdown signal if nobody has yet. Safe to call
    /// more than once.
    pub async fn stop_session(&self) {
        let mut control = self.inner.control.lock().await;
        let was_connected = control.is_connected();

        if was_connected {
            let label = control.label().to_string();
            let req = StopSessionRequest {
                label: &label,
                protocol_version: PROTOCOL_VERSION,
                request: "StopSession",
                session_id: &self.inner.session_id,
            };
            let timeout = self.inner.options.stop_session_timeout;
            match tokio::time::timeout(timeout, control.send_request(&req)).await {
                Ok(Ok(res)) => debug!("LOCKDOWN: StopSession: {}", pretty_print_dictionary(&res)),
                Ok(Err(e)) => warn!("LOCKDOWN: StopSession failed: {e}"),
                Err(_) => warn!("LOCKDOWN: StopSession timed out"),
            }
        }

        if self.inner.shutdown.raise() {
            info!("LOCKDOWN: disconnect");
        }
        control.close().await;
        drop(control);

        if was_connected {
            self.inner.options.sink.flush();
        }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(control: Idevice, pairing: PairingFile, options: ConnectOptions) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                host: "127.0.0.1".into(),
                session_id: "test-session".into(),
                pairing,
                identity: OnceLock::new(),
                control: Mutex::new(control),
                shutdown: ShutdownSignal::new(),
                options,
            }),
        }
    }
}

/// QueryType, StartSession and the TLS upgrade on a fresh control connection
async fn handshake(
    control: &mut Idevice,
    pairing: &PairingFile,
) -> Result<(String, ClientIdentity), IdeviceError> {
    let label = control.label().to_string();

    let res: QueryTypeResponse = request(
        control,
        &QueryTypeRequest {
            label: &label,
            protocol_version: PROTOCOL_VERSION,
            request: "QueryType",
        },
    )
    .await
    .map_err(|e| e.during("QueryType"))?;
    if res.request.as_deref() != Some("QueryType") || res.kind.as_deref() != Some(LOCKDOWN_TYPE) {
        warn!("LOCKDOWN: unexpected QueryType response: {res:?}");
        return Err(IdeviceError::ProtocolViolation(format!(
            "unexpected QueryType response: {res:?}"
        ))
        .during("QueryType"));
    }

    let res: StartSessionResponse = request(
        control,
        &StartSessionRequest {
            label: &label,
            protocol_version: PROTOCOL_VERSION,
            request: "StartSession",
            host_id: &pairing.host_id,
            system_buid: &pairing.system_buid,
        },
    )
    .await
    .map_err(|e| e.during("StartSession"))?;
    let session_id = res.session_id.ok_or_else(|| {
        IdeviceError::ProtocolViolation("StartSession response without SessionID".into())
            .during("StartSession")
    })?;

    let identity = pairing
        .client_identity()
        .map_err(|e| e.during("TLS"))?;
    control
        .start_tls(&identity)
        .await
        .map_err(|e| e.during("TLS"))?;

    Ok((session_id, identity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing_file::test_pairing_file;
    use crate::test_support::{dict, read_plist_frame, write_plist_frame};
    use std::time::Duration;

    fn session_over_duplex() -> (LockdownSession, tokio::io::DuplexStream) {
        let (client, device) = tokio::io::duplex(1 << 16);
        let session = LockdownSession::from_parts(
            Idevice::new(Box::new(client), "test"),
            test_pairing_file(),
            ConnectOptions::default().with_stop_session_timeout(Duration::from_millis(200)),
        );
        (session, device)
    }

    #[derive(Deserialize, Debug, PartialEq)]
    #[serde(rename_all = "PascalCase")]
    struct BatteryInfo {
        battery_current_capacity: u64,
        battery_is_charging: bool,
    }

    #[tokio::test]
    async fn get_value_decodes_into_typed_destination() {
        let (session, mut device) = session_over_duplex();
        let device_task = tokio::spawn(async move {
            let req = read_plist_frame(&mut device).await;
            assert_eq!(req.get("Request").and_then(|v| v.as_string()), Some("GetValue"));
            assert_eq!(req.get("Key").and_then(|v| v.as_string()), Some("BatteryInfo"));

            let mut value = plist::Dictionary::new();
            value.insert("BatteryCurrentCapacity".into(), 87u64.into());
            value.insert("BatteryIsCharging".into(), true.into());
            let mut res = dict(&[("Request", "GetValue"), ("Key", "BatteryInfo")]);
            res.insert("Value".into(), value.into());
            write_plist_frame(&mut device, res).await;
            device
        });

        let info: BatteryInfo = session.get_value("BatteryInfo").await.unwrap();
        assert_eq!(
            info,
            BatteryInfo {
                battery_current_capacity: 87,
                battery_is_charging: true
            }
        );
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn start_service_refused_after_shutdown() {
        let (session, device) = session_over_duplex();
        session.shutdown_signal().raise();
        assert!(matches!(
            session.start_service("com.apple.afc").await,
            Err(IdeviceError::GracefulShutdown)
        ));
        assert!(matches!(
            session.get_value::<String>("DeviceName").await,
            Err(IdeviceError::GracefulShutdown)
        ));
        drop(device);
    }

    #[tokio::test]
    async fn stop_session_sends_request_and_raises_once() {
        let (session, mut device) = session_over_duplex();
        let device_task = tokio::spawn(async move {
            let req = read_plist_frame(&mut device).await;
            write_plist_frame(&mut device, dict(&[("Request", "StopSession")])).await;
            req
        });

        session.stop_session().await;
        let req = device_task.await.unwrap();
        assert_eq!(req.get("Request").and_then(|v| v.as_string()), Some("StopSession"));
        assert_eq!(req.get("SessionID").and_then(|v| v.as_string()), Some("test-session"));
        assert!(session.is_shutting_down());
        assert!(!session.shutdown_signal().raise());

        // second stop has nothing left to talk to
        session.stop_session().await;
        assert!(session.is_shutting_down());
    }

    #[tokio::test]
    async fn stop_session_survives_dead_device() {
        let (session, device) = session_over_duplex();
        drop(device);
        session.stop_session().await;
        assert!(session.is_shutting_down());
    }

    #[tokio::test]
    async fn stop_session_gives_up_on_silent_device() {
        let (session, _device) = session_over_duplex();
        tokio::time::timeout(Duration::from_secs(2), session.stop_session())
            .await
            .unwrap();
        assert!(session.is_shutting_down());
    }

    #[tokio::test]
    async fn identity_needs_valid_pem() {
        let (session, _device) = session_over_duplex();
        assert!(session.identity().is_err());
    }
}
