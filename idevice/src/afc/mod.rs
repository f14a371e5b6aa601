//! Apple File Connection (AFC) service implementation
//!
//! This module provides functionality to interact with the iOS device's filesystem
//! through the AFC protocol.

pub mod packet;

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_recursion::async_recursion;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::diagnostics::{DiagnosticSink, Direction, NoopSink};
use crate::util::{null_terminated, null_terminated_strings};
use crate::{IdeviceError, IdeviceService, IdeviceSocket, LockdownSession, ShutdownSignal};
use packet::{AfcOpcode, AfcPacket, AfcPacketHeader};

const AFC_SERVICE_NAME: &str = "com.apple.afc";

/// Mode word for FileRefOpen
const AFC_FOPEN_RDONLY: u64 = 1;
/// Status the device answers ReadDir with when the path is a file
const AFC_STATUS_NOT_DIRECTORY: u64 = 4;

const FILE_INFO_KEYS: [&str; 6] = [
    "st_size",
    "st_blocks",
    "st_nlink",
    "st_ifmt",
    "st_mtime",
    "st_birthtime",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    Regular,
}

impl FileKind {
    fn from_ifmt(ifmt: &str) -> Option<Self> {
        match ifmt {
            "S_IFDIR" => Some(Self::Directory),
            "S_IFREG" => Some(Self::Regular),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub blocks: u64,
    pub nlink: u64,
    pub kind: FileKind,
    /// Nanoseconds since the epoch
    pub mtime: u64,
    /// Nanoseconds since the epoch
    pub birthtime: u64,
}

impl FileInfo {
    /// Parses the GetFileInfo key/value list. The device sends the keys in a
    /// fixed order and anything else is rejected.
    pub fn parse(payload: &[u8]) -> Result<Self, IdeviceError> {
        let v = null_terminated_strings(payload);
        let in_order = v.len() == FILE_INFO_KEYS.len() * 2
            && FILE_INFO_KEYS
                .iter()
                .enumerate()
                .all(|(i, key)| v[i * 2] == *key);
        if !in_order {
            return Err(IdeviceError::ProtocolViolation(format!(
                "unexpected file info layout: {v:?}"
            )));
        }

        let number = |i: usize| {
            v[i].parse::<u64>().map_err(|_| {
                IdeviceError::ProtocolViolation(format!("{} is not a number: {}", v[i - 1], v[i]))
            })
        };
        let kind = FileKind::from_ifmt(&v[7])
            .ok_or_else(|| IdeviceError::ProtocolViolation(format!("unknown st_ifmt {}", v[7])))?;

        Ok(Self {
            size: number(1)?,
            blocks: number(3)?,
            nlink: number(5)?,
            kind,
            mtime: number(9)?,
            birthtime: number(11)?,
        })
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn modified(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.mtime)
    }

    pub fn created(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.birthtime)
    }
}

/// One entry of a recursive listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub path: String,
    pub info: FileInfo,
}

/// AFC client for interacting with the iOS device's filesystem
#[derive(Debug)]
pub struct AfcClient {
    socket: IdeviceSocket,
    packet_num: u64,
    shutdown: ShutdownSignal,
    sink: Arc<dyn DiagnosticSink>,
}

impl IdeviceService for AfcClient {
    fn service_name() -> &'static str {
        AFC_SERVICE_NAME
    }

    async fn connect(session: &LockdownSession) -> Result<Self, IdeviceError> {
        let socket = session.start_service(Self::service_name()).await?;
        Ok(Self::new(socket, session.shutdown_signal()).with_sink(session.options().sink.clone()))
    }
}

impl AfcClient {
    /// Wraps a stream already speaking AFC. `shutdown` is the owning session's signal.
    pub fn new(socket: IdeviceSocket, shutdown: ShutdownSignal) -> Self {
        Self {
            socket,
            packet_num: 0,
            shutdown,
            sink: Arc::new(NoopSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sequence number the next request will carry
    pub fn packet_num(&self) -> u64 {
        self.packet_num
    }

    /// Sends one request and reads its response.
    ///
    /// A failed read or write means the stream is gone: if the session was
    /// already shutting down this is [`IdeviceError::GracefulShutdown`],
    /// otherwise the shutdown signal is raised and
    /// [`IdeviceError::ConnectionLost`] is returned.
    pub async fn send_request(
        &mut self,
        operation: AfcOpcode,
        header_payload: &[u8],
        payload: &[u8],
    ) -> Result<AfcPacket, IdeviceError> {
        if self.shutdown.is_set() {
            debug!("AFC: {operation:?} refused, session is shutting down");
            return Err(IdeviceError::GracefulShutdown);
        }

        let header = AfcPacketHeader::new(
            operation as u64,
            self.packet_num,
            header_payload.len(),
            payload.len(),
        );
        debug!("AFC: sending {operation:?} #{}", self.packet_num);
        self.write_part(&header.encode()).await?;
        self.write_part(header_payload).await?;
        self.write_part(payload).await?;
        if let Err(e) = self.socket.flush().await {
            return Err(self.lost(e));
        }

        let res = self.read_packet().await?;
        res.validate()?;
        Ok(res)
    }

    async fn write_part(&mut self, bytes: &[u8]) -> Result<(), IdeviceError> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.sink.record(Direction::Sent, AFC_SERVICE_NAME, bytes);
        if let Err(e) = self.socket.write_all(bytes).await {
            return Err(self.lost(e));
        }
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<AfcPacket, IdeviceError> {
        let mut raw = [0u8; 40];
        if let Err(e) = self.socket.read_exact(&mut raw).await {
            return Err(self.lost(e));
        }
        // spent as soon as the device answers, garbled or not
        self.packet_num += 1;
        let header = AfcPacketHeader::decode(&raw)?;

        let mut body = vec![0u8; header.body_len()];
        if let Err(e) = self.socket.read_exact(&mut body).await {
            return Err(self.lost(e));
        }

        self.sink.record(Direction::Received, AFC_SERVICE_NAME, &raw);
        self.sink.record(Direction::Received, AFC_SERVICE_NAME, &body);
        Ok(AfcPacket::from_parts(&header, body))
    }

    fn lost(&self, e: std::io::Error) -> IdeviceError {
        if self.shutdown.is_set() {
            debug!("AFC: graceful shutdown ({e})");
            IdeviceError::GracefulShutdown
        } else {
            warn!("AFC: connection lost: {e}");
            self.shutdown.raise();
            IdeviceError::ConnectionLost
        }
    }

    pub async fn get_file_info(&mut self, path: &str) -> Result<FileInfo, IdeviceError> {
        let res = self
            .send_request(AfcOpcode::GetFileInfo, &null_terminated(path), &[])
            .await?;
        match res.opcode() {
            Some(AfcOpcode::Data) => FileInfo::parse(&res.payload),
            _ => Err(rejected("GetFileInfo", &res)),
        }
    }

    /// Opens `path` read-only and returns the remote handle
    pub async fn file_ref_open(&mut self, path: &str) -> Result<u64, IdeviceError> {
        let mut header = AFC_FOPEN_RDONLY.to_le_bytes().to_vec();
        header.extend_from_slice(&null_terminated(path));

        let res = self.send_request(AfcOpcode::FileRefOpen, &header, &[]).await?;
        match res.opcode() {
            Some(AfcOpcode::FileRefOpenResult) => Ok(LittleEndian::read_u64(&res.header_payload)),
            _ => Err(rejected("FileRefOpen", &res)),
        }
    }

    /// Reads up to `len` bytes. An empty result is end of file.
    pub async fn file_ref_read(&mut self, handle: u64, len: u64) -> Result<Vec<u8>, IdeviceError> {
        let mut header = [0u8; 16];
        LittleEndian::write_u64(&mut header[..8], handle);
        LittleEndian::write_u64(&mut header[8..], len);

        let res = self.send_request(AfcOpcode::FileRefRead, &header, &[]).await?;
        match res.opcode() {
            Some(AfcOpcode::Data) => Ok(res.payload),
            _ => Err(rejected("FileRefRead", &res)),
        }
    }

    pub async fn file_ref_seek(&mut self, handle: u64, pos: SeekFrom) -> Result<(), IdeviceError> {
        let (offset, whence) = match pos {
            SeekFrom::Start(o) => (
                i64::try_from(o).map_err(|_| IdeviceError::InvalidArgument)?,
                0u64,
            ),
            SeekFrom::Current(o) => (o, 1),
            SeekFrom::End(o) => (o, 2),
        };
        let mut header = [0u8; 24];
        LittleEndian::write_u64(&mut header[..8], handle);
        LittleEndian::write_i64(&mut header[8..16], offset);
        LittleEndian::write_u64(&mut header[16..], whence);

        let res = self.send_request(AfcOpcode::FileRefSeek, &header, &[]).await?;
        match res.status() {
            Some(0) => Ok(()),
            Some(code) => Err(IdeviceError::ProtocolViolation(format!(
                "FileRefSeek on handle {handle} failed with status {code}"
            ))),
            None => Err(rejected("FileRefSeek", &res)),
        }
    }

    pub async fn file_ref_close(&mut self, handle: u64) -> Result<(), IdeviceError> {
        let res = self
            .send_request(AfcOpcode::FileRefClose, &handle.to_le_bytes(), &[])
            .await?;
        match res.status() {
            Some(0) => Ok(()),
            Some(code) => {
                debug!("AFC: close of handle {handle} returned status {code}");
                Ok(())
            }
            None => Err(rejected("FileRefClose", &res)),
        }
    }

    /// Lists a directory. The result includes `.` and `..`.
    pub async fn get_directory(&mut self, path: &str) -> Result<Vec<String>, IdeviceError> {
        let res = self
            .send_request(AfcOpcode::ReadDir, &null_terminated(path), &[])
            .await?;
        match (res.opcode(), res.status()) {
            (Some(AfcOpcode::Data), _) if !res.payload.is_empty() => {
                Ok(null_terminated_strings(&res.payload))
            }
            (_, Some(AFC_STATUS_NOT_DIRECTORY)) => Err(IdeviceError::NotADirectory(path.into())),
            _ => Err(rejected("ReadDir", &res)),
        }
    }

    /// Depth-first walk below `dir`, for inspection
    pub async fn recursive_listing(&mut self, dir: &str) -> Result<Vec<ListingEntry>, IdeviceError> {
        let mut out = Vec::new();
        self.walk(dir, &mut out).await?;
        Ok(out)
    }

    #[async_recursion]
    async fn walk(&mut self, dir: &str, out: &mut Vec<ListingEntry>) -> Result<(), IdeviceError> {
        let base = dir.trim_end_matches('/');
        for name in self.get_directory(dir).await? {
            if name == "." || name == ".." {
                continue;
            }
            let path = format!("{base}/{name}");
            let info = self.get_file_info(&path).await?;
            debug!("{:>10} {:>10} {path}", info.size, info.nlink);

            let is_dir = info.is_dir();
            out.push(ListingEntry {
                path: path.clone(),
                info,
            });
            if is_dir {
                self.walk(&path, out).await?;
            }
        }
        Ok(())
    }

    /// Shuts the stream down
    pub async fn close(mut self) {
        if let Err(e) = self.socket.shutdown().await {
            debug!("AFC: shutdown failed: {e}");
        }
    }
}

/// Error for a response of the wrong shape. A non-zero status is the device
/// refusing the request, anything else is a protocol fault.
fn rejected(request: &str, res: &AfcPacket) -> IdeviceError {
    match res.status() {
        Some(code) if code != 0 => IdeviceError::AfcStatus(code),
        _ => IdeviceError::ProtocolViolation(format!(
            "unexpected {request} response: opcode {:#x}, {} header bytes, {} payload bytes",
            res.operation,
            res.header_payload.len(),
            res.payload.len()
        )),
    }
}
