// Jackson Coxson
//! Keeps a lockdown session alive by answering the device's pings.

use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::{Idevice, IdeviceError, IdeviceService, IdeviceSocket, LockdownSession, ShutdownSignal};

const HEARTBEAT_SERVICE_NAME: &str = "com.apple.mobile.heartbeat";

/// Why the heartbeat loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatExit {
    /// The session signal was raised elsewhere
    ShutdownRequested,
    /// The device said it is going to sleep
    SleepyTime,
    UnknownCommand(String),
    /// No ping arrived within the advertised interval
    Timeout,
    Failed(String),
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct HeartbeatReply<'a> {
    command: &'a str,
}

#[derive(Debug)]
pub struct HeartbeatClient {
    idevice: Idevice,
    shutdown: ShutdownSignal,
    grace: Duration,
}

impl IdeviceService for HeartbeatClient {
    fn service_name() -> &'static str {
        HEARTBEAT_SERVICE_NAME
    }

    async fn connect(session: &LockdownSession) -> Result<Self, IdeviceError> {
        let socket = session.start_service(Self::service_name()).await?;
        let options = session.options();
        let idevice = Idevice::new(socket, options.label.clone()).with_sink(options.sink.clone());
        Ok(Self {
            idevice,
            shutdown: session.shutdown_signal(),
            grace: options.heartbeat_grace,
        })
    }
}

impl HeartbeatClient {
    pub fn new(socket: IdeviceSocket, shutdown: ShutdownSignal) -> Self {
        Self {
            idevice: Idevice::new(socket, HEARTBEAT_SERVICE_NAME),
            shutdown,
            grace: Duration::from_secs(5),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Answers pings until the device sleeps, misbehaves, goes quiet or the
    /// session shuts down. Closes the stream before returning.
    pub async fn run(mut self) -> HeartbeatExit {
        let shutdown = self.shutdown.clone();
        // unknown until the first ping tells us
        let mut wait: Option<Duration> = None;

        let exit = loop {
            if shutdown.is_set() {
                break HeartbeatExit::ShutdownRequested;
            }

            let received = tokio::select! {
                biased;
                _ = shutdown.wait() => break HeartbeatExit::ShutdownRequested,
                r = next_message(&mut self.idevice, wait) => r,
            };
            let msg = match received {
                Ok(msg) => msg,
                Err(exit) => break exit,
            };

            if let Some(interval) = msg.get("Interval").and_then(interval_secs) {
                wait = Some(Duration::from_secs_f64(interval * 2.0) + self.grace);
            }

            let command = msg
                .get("Command")
                .and_then(|c| c.as_string())
                .unwrap_or_default()
                .to_string();
            match command.as_str() {
                "Marco" => {
                    if let Err(e) = self.reply("Polo").await {
                        break HeartbeatExit::Failed(e.to_string());
                    }
                }
                "SleepyTime" => {
                    break match self.reply("NightNight").await {
                        Ok(()) => HeartbeatExit::SleepyTime,
                        Err(e) => HeartbeatExit::Failed(e.to_string()),
                    };
                }
                _ => break HeartbeatExit::UnknownCommand(command),
            }
        };

        self.idevice.close().await;
        exit
    }

    async fn reply(&mut self, command: &str) -> Result<(), IdeviceError> {
        debug!("HEARTBEAT: {command}");
        let reply = plist::to_value(&HeartbeatReply { command })?;
        self.idevice.send_plist(reply).await
    }
}

async fn next_message(
    idevice: &mut Idevice,
    wait: Option<Duration>,
) -> Result<plist::Dictionary, HeartbeatExit> {
    let read = idevice.read_plist();
    let res = match wait {
        Some(wait) => match tokio::time::timeout(wait, read).await {
            Ok(res) => res,
            Err(_) => return Err(HeartbeatExit::Timeout),
        },
        None => read.await,
    };
    res.map_err(|e| HeartbeatExit::Failed(e.to_string()))
}

fn interval_secs(v: &plist::Value) -> Option<f64> {
    v.as_unsigned_integer()
        .map(|i| i as f64)
        .or_else(|| v.as_real())
        .filter(|i| (0.0..=86_400.0).contains(i))
}

/// Runs `client` in the background and stops `session` once it ends, for
/// whatever reason.
pub fn spawn(session: LockdownSession, client: HeartbeatClient) -> JoinHandle<HeartbeatExit> {
    tokio::spawn(async move {
        let exit = client.run().await;
        match &exit {
            HeartbeatExit::ShutdownRequested | HeartbeatExit::SleepyTime => {
                info!("HEARTBEAT: stopped: {exit:?}")
            }
            _ => warn!("HEARTBEAT: stopped: {exit:?}"),
        }
        session.stop_session().await;
        exit
    })
}

/// Starts the heartbeat service for a freshly established session
pub(crate) async fn start(
    session: &LockdownSession,
) -> Result<JoinHandle<HeartbeatExit>, IdeviceError> {
    let client = HeartbeatClient::connect(session).await?;
    Ok(spawn(session.clone(), client))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing_file::test_pairing_file;
    use crate::test_support::{dict, read_plist_frame, write_plist_frame};
    use crate::ConnectOptions;
    use tokio::io::AsyncReadExt;

    fn client() -> (HeartbeatClient, ShutdownSignal, tokio::io::DuplexStream) {
        let (socket, device) = tokio::io::duplex(4096);
        let signal = ShutdownSignal::new();
        (
            HeartbeatClient::new(Box::new(socket), signal.clone()),
            signal,
            device,
        )
    }

    fn command(d: &plist::Dictionary) -> Option<&str> {
        d.get("Command").and_then(|v| v.as_string())
    }

    #[tokio::test]
    async fn marco_gets_exactly_one_polo() {
        let (client, signal, mut device) = client();
        let task = tokio::spawn(client.run());

        for _ in 0..2 {
            write_plist_frame(&mut device, dict(&[("Command", "Marco")])).await;
            let reply = read_plist_frame(&mut device).await;
            assert_eq!(command(&reply), Some("Polo"));
        }

        signal.raise();
        assert_eq!(task.await.unwrap(), HeartbeatExit::ShutdownRequested);

        // nothing else was written before the stream closed
        let mut rest = Vec::new();
        device.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn sleepy_time_says_goodnight_and_stops() {
        let (client, _signal, mut device) = client();
        let task = tokio::spawn(client.run());

        write_plist_frame(&mut device, dict(&[("Command", "SleepyTime")])).await;
        let reply = read_plist_frame(&mut device).await;
        assert_eq!(command(&reply), Some("NightNight"));
        assert_eq!(task.await.unwrap(), HeartbeatExit::SleepyTime);
    }

    #[tokio::test]
    async fn sleepy_time_stops_the_session_once() {
        let (control, mut control_device) = tokio::io::duplex(4096);
        let session = LockdownSession::from_parts(
            Idevice::new(Box::new(control), "test"),
            test_pairing_file(),
            ConnectOptions::default(),
        );
        let stop_seen = tokio::spawn(async move {
            let req = read_plist_frame(&mut control_device).await;
            write_plist_frame(&mut control_device, dict(&[("Request", "StopSession")])).await;
            req
        });

        let (socket, mut device) = tokio::io::duplex(4096);
        let client = HeartbeatClient::new(Box::new(socket), session.shutdown_signal());
        let handle = spawn(session.clone(), client);

        write_plist_frame(&mut device, dict(&[("Command", "SleepyTime")])).await;
        assert_eq!(command(&read_plist_frame(&mut device).await), Some("NightNight"));
        assert_eq!(handle.await.unwrap(), HeartbeatExit::SleepyTime);

        let req = stop_seen.await.unwrap();
        assert_eq!(req.get("Request").and_then(|v| v.as_string()), Some("StopSession"));
        assert!(session.is_shutting_down());
        assert!(!session.shutdown_signal().raise());
    }

    #[tokio::test]
    async fn unknown_command_stops() {
        let (client, _signal, mut device) = client();
        let task = tokio::spawn(client.run());
        write_plist_frame(&mut device, dict(&[("Command", "Hello")])).await;
        assert_eq!(
            task.await.unwrap(),
            HeartbeatExit::UnknownCommand("Hello".into())
        );
    }

    #[tokio::test]
    async fn raised_signal_stops_before_reading() {
        let (client, signal, _device) = client();
        signal.raise();
        assert_eq!(client.run().await, HeartbeatExit::ShutdownRequested);
    }

    #[tokio::test]
    async fn missed_ping_times_out() {
        let (client, _signal, mut device) = client();
        let task = tokio::spawn(client.with_grace(Duration::from_millis(50)).run());

        let mut marco = dict(&[("Command", "Marco")]);
        marco.insert("Interval".into(), 0u64.into());
        write_plist_frame(&mut device, marco).await;
        assert_eq!(command(&read_plist_frame(&mut device).await), Some("Polo"));

        assert_eq!(task.await.unwrap(), HeartbeatExit::Timeout);
    }

    #[tokio::test]
    async fn hang_up_is_a_failure() {
        let (client, _signal, device) = client();
        drop(device);
        assert!(matches!(client.run().await, HeartbeatExit::Failed(_)));
    }
}
