//! Fake device ends for tests

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Writes one length-prefixed plist the way lockdownd does
pub(crate) async fn write_plist_frame<W: AsyncWrite + Unpin>(w: &mut W, dict: plist::Dictionary) {
    let mut body = Vec::new();
    plist::Value::Dictionary(dict)
        .to_writer_xml(&mut body)
        .unwrap();
    w.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
    w.write_all(&body).await.unwrap();
}

pub(crate) async fn read_plist_frame<R: AsyncRead + Unpin>(r: &mut R) -> plist::Dictionary {
    let mut len = [0u8; 4];
    r.read_exact(&mut len).await.unwrap();
    let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
    r.read_exact(&mut body).await.unwrap();
    plist::from_bytes(&body).unwrap()
}

pub(crate) fn dict(pairs: &[(&str, &str)]) -> plist::Dictionary {
    let mut d = plist::Dictionary::new();
    for (k, v) in pairs {
        d.insert((*k).to_string(), (*v).into());
    }
    d
}

#[cfg(feature = "afc")]
pub(crate) use fake_afc::*;

#[cfg(feature = "afc")]
mod fake_afc {
    use std::collections::{BTreeMap, BTreeSet, HashMap};

    use byteorder::{ByteOrder, LittleEndian};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    use crate::afc::packet::{AfcOpcode, AfcPacketHeader};
    use crate::IdeviceSocket;

    const STATUS_NOT_DIRECTORY: u64 = 4;
    const STATUS_INVALID_ARGUMENT: u64 = 7;
    const STATUS_NOT_FOUND: u64 = 8;

    /// In-memory filesystem served by the fake AFC service
    #[derive(Debug, Clone, Default)]
    pub(crate) struct FakeFs {
        files: BTreeMap<String, Vec<u8>>,
        dirs: BTreeSet<String>,
    }

    impl FakeFs {
        pub(crate) fn new() -> Self {
            let mut fs = Self::default();
            fs.dirs.insert("/".into());
            fs
        }

        pub(crate) fn with_file(mut self, path: &str, contents: &[u8]) -> Self {
            let mut parent = path;
            while let Some(i) = parent.rfind('/') {
                parent = &parent[..i];
                self.dirs
                    .insert(if parent.is_empty() { "/" } else { parent }.to_string());
            }
            self.files.insert(path.to_string(), contents.to_vec());
            self
        }

        fn children(&self, dir: &str) -> Vec<String> {
            let prefix = if dir == "/" {
                "/".to_string()
            } else {
                format!("{dir}/")
            };
            let mut out: BTreeSet<String> = BTreeSet::new();
            for p in self.files.keys().chain(self.dirs.iter()) {
                if let Some(rest) = p.strip_prefix(&prefix) {
                    if !rest.is_empty() && !rest.contains('/') {
                        out.insert(rest.to_string());
                    }
                }
            }
            out.into_iter().collect()
        }
    }

    /// Serves `fs` over an in-memory stream. With `drop_after = Some(n)` the
    /// device hangs up when the n-th request arrives, without answering it.
    pub(crate) fn spawn_fake_afc(
        fs: FakeFs,
        drop_after: Option<usize>,
    ) -> (IdeviceSocket, JoinHandle<()>) {
        let (client, device) = tokio::io::duplex(1 << 16);
        let task = tokio::spawn(serve(fs, device, drop_after));
        (Box::new(client), task)
    }

    struct OpenFile {
        path: String,
        pos: i64,
    }

    async fn serve(fs: FakeFs, mut device: DuplexStream, drop_after: Option<usize>) {
        let mut handles: HashMap<u64, OpenFile> = HashMap::new();
        let mut next_handle = 1u64;
        let mut seen = 0usize;

        loop {
            let mut raw = [0u8; 40];
            if device.read_exact(&mut raw).await.is_err() {
                return;
            }
            let Ok(header) = AfcPacketHeader::decode(&raw) else {
                return;
            };
            let mut body = vec![0u8; header.body_len()];
            if device.read_exact(&mut body).await.is_err() {
                return;
            }
            seen += 1;
            if drop_after == Some(seen) {
                return;
            }
            let vheader = &body[..header.split_at()];

            let (op, rheader, payload): (AfcOpcode, Vec<u8>, Vec<u8>) =
                match AfcOpcode::from_u64(header.operation) {
                    Some(AfcOpcode::GetFileInfo) => {
                        let path = c_str(vheader);
                        let info = if let Some(data) = fs.files.get(&path) {
                            Some((data.len(), "S_IFREG"))
                        } else if fs.dirs.contains(&path) {
                            Some((fs.children(&path).len() + 2, "S_IFDIR"))
                        } else {
                            None
                        };
                        match info {
                            Some((size, ifmt)) => (AfcOpcode::Data, vec![], file_info(size, ifmt)),
                            None => status(STATUS_NOT_FOUND),
                        }
                    }
                    Some(AfcOpcode::ReadDir) => {
                        let path = c_str(vheader);
                        if fs.dirs.contains(&path) {
                            let mut payload = b".\0..\0".to_vec();
                            for c in fs.children(&path) {
                                payload.extend_from_slice(c.as_bytes());
                                payload.push(0);
                            }
                            (AfcOpcode::Data, vec![], payload)
                        } else if fs.files.contains_key(&path) {
                            status(STATUS_NOT_DIRECTORY)
                        } else {
                            status(STATUS_NOT_FOUND)
                        }
                    }
                    Some(AfcOpcode::FileRefOpen) => {
                        let path = c_str(&vheader[8..]);
                        if fs.files.contains_key(&path) {
                            let h = next_handle;
                            next_handle += 1;
                            handles.insert(h, OpenFile { path, pos: 0 });
                            (AfcOpcode::FileRefOpenResult, h.to_le_bytes().to_vec(), vec![])
                        } else {
                            status(STATUS_NOT_FOUND)
                        }
                    }
                    Some(AfcOpcode::FileRefRead) => {
                        let h = LittleEndian::read_u64(&vheader[..8]);
                        let len = LittleEndian::read_u64(&vheader[8..16]) as usize;
                        match handles.get_mut(&h) {
                            Some(f) => {
                                let data = &fs.files[&f.path];
                                let start = (f.pos as usize).min(data.len());
                                let end = (start + len).min(data.len());
                                f.pos = end as i64;
                                (AfcOpcode::Data, vec![], data[start..end].to_vec())
                            }
                            None => status(STATUS_INVALID_ARGUMENT),
                        }
                    }
                    Some(AfcOpcode::FileRefSeek) => {
                        let h = LittleEndian::read_u64(&vheader[..8]);
                        let offset = LittleEndian::read_i64(&vheader[8..16]);
                        let whence = LittleEndian::read_u64(&vheader[16..24]);
                        match handles.get_mut(&h) {
                            Some(f) => {
                                let base = match whence {
                                    0 => 0,
                                    1 => f.pos,
                                    _ => fs.files[&f.path].len() as i64,
                                };
                                if base + offset < 0 {
                                    status(STATUS_INVALID_ARGUMENT)
                                } else {
                                    f.pos = base + offset;
                                    status(0)
                                }
                            }
                            None => status(STATUS_INVALID_ARGUMENT),
                        }
                    }
                    Some(AfcOpcode::FileRefClose) => {
                        let h = LittleEndian::read_u64(&vheader[..8]);
                        match handles.remove(&h) {
                            Some(_) => status(0),
                            None => status(STATUS_INVALID_ARGUMENT),
                        }
                    }
                    _ => status(STATUS_INVALID_ARGUMENT),
                };

            let reply =
                AfcPacketHeader::new(op as u64, header.packet_num, rheader.len(), payload.len());
            if device.write_all(&reply.encode()).await.is_err()
                || device.write_all(&rheader).await.is_err()
                || device.write_all(&payload).await.is_err()
            {
                return;
            }
        }
    }

    fn status(code: u64) -> (AfcOpcode, Vec<u8>, Vec<u8>) {
        (AfcOpcode::Status, code.to_le_bytes().to_vec(), vec![])
    }

    fn c_str(buf: &[u8]) -> String {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    }

    fn file_info(size: usize, ifmt: &str) -> Vec<u8> {
        let fields = [
            ("st_size", size.to_string()),
            ("st_blocks", size.div_ceil(512).to_string()),
            ("st_nlink", "1".to_string()),
            ("st_ifmt", ifmt.to_string()),
            ("st_mtime", "1700000000000000000".to_string()),
            ("st_birthtime", "1600000000000000000".to_string()),
        ];
        let mut out = Vec::new();
        for (k, v) in fields {
            out.extend_from_slice(k.as_bytes());
            out.push(0);
            out.extend_from_slice(v.as_bytes());
            out.push(0);
        }
        out
    }
}
