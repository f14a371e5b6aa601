use std::io::SeekFrom;

use log::debug;

use super::RetryConnection;
use crate::IdeviceError;

const READ_CHUNK: u64 = 64 * 1024;

/// Read cursor on a remote file.
///
/// Tracks its own offset so that after a reconnect the file can be reopened
/// and moved back to where the caller left it. Handles are shared by path,
/// so two cursors on one path end up on the same remote handle after a
/// reconnect.
#[derive(Debug)]
pub struct AfcFile<'a> {
    conn: &'a mut RetryConnection,
    path: String,
    offset: u64,
}

impl<'a> AfcFile<'a> {
    pub(super) fn new(conn: &'a mut RetryConnection, path: &str) -> Self {
        Self {
            conn,
            path: path.to_string(),
            offset: 0,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Logical position of the cursor
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads up to `len` bytes. An empty result is end of file.
    pub async fn read(&mut self, len: u64) -> Result<Vec<u8>, IdeviceError> {
        loop {
            let handle = self.handle().await?;
            let res = match self.conn.afc().await {
                Ok(afc) => afc.file_ref_read(handle, len).await,
                Err(e) => Err(e),
            };
            match res {
                Ok(data) => {
                    self.offset += data.len() as u64;
                    return Ok(data);
                }
                Err(e) => self.conn.recover(e).await?,
            }
        }
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, IdeviceError> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read(READ_CHUNK).await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    /// Moves the cursor and returns the new absolute offset
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64, IdeviceError> {
        // checked before touching the connection, which would be closed by
        // any error coming out of the loop
        if let SeekFrom::Current(delta) = pos {
            self.offset
                .checked_add_signed(delta)
                .ok_or(IdeviceError::InvalidArgument)?;
        }
        loop {
            let handle = self.handle().await?;
            match self.seek_once(handle, pos).await {
                Ok(offset) => {
                    self.offset = offset;
                    return Ok(offset);
                }
                Err(e) => self.conn.recover(e).await?,
            }
        }
    }

    async fn seek_once(&mut self, handle: u64, pos: SeekFrom) -> Result<u64, IdeviceError> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.offset.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let size = self.conn.afc().await?.get_file_info(&self.path).await?.size;
                size.checked_add_signed(delta)
            }
        }
        .ok_or(IdeviceError::InvalidArgument)?;

        self.conn.afc().await?.file_ref_seek(handle, pos).await?;
        Ok(target)
    }

    /// Closes the remote handle if this connection still has one. A handle
    /// lost to a reconnect needs no closing.
    pub async fn close(mut self) -> Result<(), IdeviceError> {
        let Some(handle) = self.conn.handles.remove(&self.path) else {
            return Ok(());
        };
        let Some(pair) = self.conn.live.as_mut() else {
            return Ok(());
        };
        match pair.afc.file_ref_close(handle).await {
            Ok(()) | Err(IdeviceError::GracefulShutdown) => Ok(()),
            Err(e) if e.is_connection_lost() => {
                debug!("RETRY: connection lost closing {}", self.path);
                self.conn.mark_lost().await;
                Ok(())
            }
            Err(e) => {
                debug!("RETRY: closing connection after {e}");
                self.conn.teardown().await;
                Err(e)
            }
        }
    }

    /// The remote handle for this path, reopening at the cursor if a
    /// reconnect discarded it
    async fn handle(&mut self) -> Result<u64, IdeviceError> {
        if let Some(&handle) = self.conn.handles.get(&self.path) {
            return Ok(handle);
        }
        debug!("RETRY: reopening {} at {}", self.path, self.offset);
        self.conn.open_handle(&self.path, self.offset).await
    }
}
