// Jackson Coxson
// Shared argument handling for the tools

use std::sync::Arc;

use idevice_link::{
    diagnostics::{DiagnosticSink, RingSink},
    pairing_file::PairingFile,
    ConnectOptions,
};

/// Bytes of traffic kept for `--dump-traffic`
const TRAFFIC_CAPTURE_BYTES: usize = 4 * 1024 * 1024;

pub async fn load_pairing_file(path: &str) -> Result<PairingFile, String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| format!("Unable to read pairing file {path}: {e}"))?;
    PairingFile::from_bytes(&bytes).map_err(|e| format!("Unable to parse pairing file {path}: {e}"))
}

pub fn connect_options(label: &str, dump_traffic: Option<&String>) -> ConnectOptions {
    let options = ConnectOptions::default().with_label(label);
    match dump_traffic {
        Some(path) => {
            let sink: Arc<dyn DiagnosticSink> =
                Arc::new(RingSink::new(TRAFFIC_CAPTURE_BYTES).with_dump_path(path));
            options.with_sink(sink)
        }
        None => options,
    }
}
