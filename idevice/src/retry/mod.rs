//! AFC access that survives the device dropping off the network.
//!
//! A [`RetryConnection`] owns one lockdown session and its AFC client. When
//! an operation finds the connection lost, the pair is torn down and the
//! caller blocks until a supervisor hands over a replacement through a
//! [`Giver`]; the operation is then retried. Open files are reopened and
//! repositioned transparently.

mod file;
mod handoff;

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::afc::{AfcClient, FileInfo, ListingEntry};
use crate::pairing_file::PairingFile;
use crate::{ConnectOptions, IdeviceError, IdeviceService, LockdownSession, RetryOptions};

pub use file::AfcFile;
use handoff::Handoff;
pub use handoff::{GiveOutcome, Giver};

/// A lockdown session and the AFC client started from it
#[derive(Debug)]
pub struct AfcPair {
    pub afc: AfcClient,
    pub lockdown: LockdownSession,
}

impl AfcPair {
    /// Connects a session and starts AFC on it. The session is stopped if
    /// AFC cannot be started.
    pub async fn connect(
        host: &str,
        pairing: &PairingFile,
        options: &ConnectOptions,
    ) -> Result<Self, IdeviceError> {
        let lockdown = LockdownSession::connect_with(host, pairing, options.clone()).await?;
        match AfcClient::connect(&lockdown).await {
            Ok(afc) => Ok(Self { afc, lockdown }),
            Err(e) => {
                warn!("RETRY: unable to start afc: {e}");
                lockdown.stop_session().await;
                Err(e)
            }
        }
    }

    pub async fn close(self) {
        self.afc.close().await;
        self.lockdown.stop_session().await;
    }
}

#[derive(Debug)]
pub struct RetryConnection {
    live: Option<AfcPair>,
    /// Remote handles of files opened on the live pair, by path
    handles: HashMap<String, u64>,
    handoff: Arc<Handoff>,
    options: RetryOptions,
}

impl RetryConnection {
    pub async fn connect(
        host: &str,
        pairing: &PairingFile,
        options: RetryOptions,
    ) -> Result<Self, IdeviceError> {
        let pair = AfcPair::connect(host, pairing, &options.connect).await?;
        Ok(Self::new(pair, options))
    }

    pub fn new(pair: AfcPair, options: RetryOptions) -> Self {
        Self {
            live: Some(pair),
            handles: HashMap::new(),
            handoff: Arc::new(Handoff::default()),
            options,
        }
    }

    /// Handle for whoever supplies replacement connections
    pub fn giver(&self) -> Giver {
        Giver::new(self.handoff.clone(), self.options.clone())
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    pub async fn get_file_info(&mut self, path: &str) -> Result<FileInfo, IdeviceError> {
        loop {
            let res = match self.afc().await {
                Ok(afc) => afc.get_file_info(path).await,
                Err(e) => Err(e),
            };
            match res {
                Ok(info) => return Ok(info),
                Err(e) => self.recover(e).await?,
            }
        }
    }

    /// Directory entries of `path`, including `.` and `..`
    pub async fn get_directory(&mut self, path: &str) -> Result<Vec<String>, IdeviceError> {
        loop {
            let res = match self.afc().await {
                Ok(afc) => afc.get_directory(path).await,
                Err(e) => Err(e),
            };
            match res {
                Ok(entries) => return Ok(entries),
                Err(e) => self.recover(e).await?,
            }
        }
    }

    /// Walks `dir`, restarting the walk from scratch after a reconnect
    pub async fn recursive_listing(&mut self, dir: &str) -> Result<Vec<ListingEntry>, IdeviceError> {
        loop {
            let res = match self.afc().await {
                Ok(afc) => afc.recursive_listing(dir).await,
                Err(e) => Err(e),
            };
            match res {
                Ok(entries) => return Ok(entries),
                Err(e) => self.recover(e).await?,
            }
        }
    }

    /// Opens `path` for reading at offset 0
    pub async fn open(&mut self, path: &str) -> Result<AfcFile<'_>, IdeviceError> {
        self.open_handle(path, 0).await?;
        Ok(AfcFile::new(self, path))
    }

    /// Reads a whole file
    pub async fn get_file(&mut self, path: &str) -> Result<Vec<u8>, IdeviceError> {
        let mut file = self.open(path).await?;
        let data = file.read_to_end().await?;
        file.close().await?;
        Ok(data)
    }

    /// Tears the live pair down
    pub async fn close(mut self) {
        self.teardown().await;
    }

    /// The live client. With no live pair this enters Draining and waits
    /// for a replacement first.
    async fn afc(&mut self) -> Result<&mut AfcClient, IdeviceError> {
        if self.live.is_none() {
            if !self.handoff.is_draining() {
                info!("RETRY: no live connection, waiting for a new one");
                self.handoff.set_draining(true);
            }
            self.await_replacement().await;
        }
        self.live
            .as_mut()
            .map(|pair| &mut pair.afc)
            .ok_or(IdeviceError::NoEstablishedConnection)
    }

    /// Opens `path` on the live pair and moves to `offset`, retrying across
    /// reconnects. Records the new handle.
    async fn open_handle(&mut self, path: &str, offset: u64) -> Result<u64, IdeviceError> {
        loop {
            match self.open_at(path, offset).await {
                Ok(handle) => return Ok(handle),
                Err(e) => self.recover(e).await?,
            }
        }
    }

    async fn open_at(&mut self, path: &str, offset: u64) -> Result<u64, IdeviceError> {
        let afc = self.afc().await?;
        let handle = afc.file_ref_open(path).await?;
        if offset != 0 {
            afc.file_ref_seek(handle, SeekFrom::Start(offset)).await?;
        }
        debug!("RETRY: {path} open as {handle} at {offset}");
        self.handles.insert(path.to_string(), handle);
        Ok(handle)
    }

    /// Decides what an operation's error means for the connection. Returns
    /// `Ok` once a replacement pair is live and the operation should be
    /// retried.
    ///
    /// Any other error still closes the pair and is handed back unchanged;
    /// the next operation then waits for a replacement.
    async fn recover(&mut self, e: IdeviceError) -> Result<(), IdeviceError> {
        if e.is_connection_lost() {
            warn!("RETRY: {e}, waiting for a new connection");
            self.mark_lost().await;
            self.await_replacement().await;
            return Ok(());
        }
        debug!("RETRY: closing connection after {e}");
        self.teardown().await;
        Err(e)
    }

    async fn mark_lost(&mut self) {
        self.handoff.set_draining(true);
        self.teardown().await;
    }

    async fn await_replacement(&mut self) {
        let pair = self.handoff.wait().await;
        info!(
            "RETRY: new connection to {} (session {})",
            pair.lockdown.host(),
            pair.lockdown.session_id()
        );
        self.live = Some(pair);
        self.handoff.set_draining(false);
    }

    async fn teardown(&mut self) {
        self.handles.clear();
        if let Some(pair) = self.live.take() {
            pair.close().await;
        }
    }
}
