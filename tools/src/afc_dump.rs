// Jackson Coxson
// Dumps an iOS device's filesystem over AFC, riding out Wi-Fi drops

use std::time::Duration;

use clap::{Arg, Command};
use idevice_link::{
    retry::{GiveOutcome, Giver, RetryConnection},
    RetryOptions,
};
use idevice_link::pairing_file::PairingFile;
use log::{info, warn};

mod common;

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = Command::new("afc_dump")
        .about("Recursively list an iOS device's filesystem over AFC")
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .required(true)
                .help("IP address of the device"),
        )
        .arg(
            Arg::new("pairing_file")
                .long("pairing-file")
                .value_name("PATH")
                .required(true)
                .help("Path to the pairing file"),
        )
        .arg(
            Arg::new("path")
                .long("path")
                .value_name("PATH")
                .default_value("/")
                .help("Directory to list"),
        )
        .arg(
            Arg::new("read")
                .long("read")
                .value_name("PATH")
                .help("Read a whole file through the reconnecting client"),
        )
        .arg(
            Arg::new("out")
                .long("out")
                .value_name("FILE")
                .requires("read")
                .help("Where to save the file given to --read"),
        )
        .arg(
            Arg::new("dump_traffic")
                .long("dump-traffic")
                .value_name("FILE")
                .help("Write captured wire traffic here when the session ends"),
        )
        .get_matches();

    let host = matches
        .get_one::<String>("host")
        .cloned()
        .unwrap_or_default();
    let pairing_path = matches
        .get_one::<String>("pairing_file")
        .cloned()
        .unwrap_or_default();

    let pairing = match common::load_pairing_file(&pairing_path).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };
    if let Some(name) = pairing.instance_name() {
        info!("Pairing record for {name}");
    }

    let options = RetryOptions::default().with_connect_options(common::connect_options(
        "afc-dump",
        matches.get_one::<String>("dump_traffic"),
    ));
    let mut conn = match RetryConnection::connect(&host, &pairing, options).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to connect to AFC service: {e}");
            return;
        }
    };
    tokio::spawn(supervise(conn.giver(), host.clone(), pairing));

    let path = matches
        .get_one::<String>("path")
        .map(String::as_str)
        .unwrap_or("/");
    match conn.recursive_listing(path).await {
        Ok(entries) => {
            for entry in entries {
                let kind = if entry.info.is_dir() { "d" } else { "-" };
                println!(
                    "{kind} {:>12} {:>4} {}",
                    entry.info.size, entry.info.nlink, entry.path
                );
            }
        }
        Err(e) => eprintln!("Failed to list {path}: {e}"),
    }

    if let Some(file) = matches.get_one::<String>("read") {
        match conn.get_file(file).await {
            Ok(data) => {
                println!("Read {} bytes from {file}", data.len());
                if let Some(out) = matches.get_one::<String>("out") {
                    if let Err(e) = tokio::fs::write(out, &data).await {
                        eprintln!("Failed to write {out}: {e}");
                    }
                }
            }
            Err(e) => eprintln!("Failed to read {file}: {e}"),
        }
    }

    conn.close().await;
}

/// Offers a fresh connection whenever the dump is stuck waiting for one
async fn supervise(giver: Giver, host: String, pairing: PairingFile) {
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        match giver.give(&host, &pairing).await {
            Ok(GiveOutcome::NotDraining) => {}
            Ok(outcome) => info!("Reconnect: {outcome:?}"),
            Err(e) => warn!("Reconnect to {host} failed: {e}"),
        }
    }
}
