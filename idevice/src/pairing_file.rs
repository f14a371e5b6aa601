// Jackson Coxson

use std::net::Ipv6Addr;

use openssl::{
    pkey::{PKey, Private},
    x509::X509,
};
use serde::Deserialize;

use crate::IdeviceError;

/// Pre-shared trust material between this host and one device
#[derive(Debug, Clone)]
pub struct PairingFile {
    pub device_certificate: Vec<u8>,
    pub host_certificate: Vec<u8>,
    pub host_private_key: Vec<u8>,
    pub root_private_key: Vec<u8>,
    pub escrow_bag: Option<Vec<u8>>,
    pub host_id: String,
    pub system_buid: String,
    pub wifi_mac_address: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawPairingFile {
    device_certificate: plist::Data,
    host_certificate: plist::Data,
    host_private_key: plist::Data,
    root_private_key: plist::Data,
    escrow_bag: Option<plist::Data>,
    #[serde(rename = "HostID")]
    host_id: String,
    #[serde(rename = "SystemBUID")]
    system_buid: String,
    #[serde(rename = "WiFiMACAddress")]
    wifi_mac_address: Option<String>,
}

impl From<RawPairingFile> for PairingFile {
    fn from(raw: RawPairingFile) -> Self {
        Self {
            device_certificate: raw.device_certificate.into(),
            host_certificate: raw.host_certificate.into(),
            host_private_key: raw.host_private_key.into(),
            root_private_key: raw.root_private_key.into(),
            escrow_bag: raw.escrow_bag.map(Into::into),
            host_id: raw.host_id,
            system_buid: raw.system_buid,
            wifi_mac_address: raw.wifi_mac_address,
        }
    }
}

/// TLS client identity derived from a pairing file
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub certificate: X509,
    pub private_key: PKey<Private>,
}

impl PairingFile {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdeviceError> {
        let raw: RawPairingFile = plist::from_bytes(bytes)?;
        Ok(raw.into())
    }

    /// Parses the PEM host certificate and key
    pub fn client_identity(&self) -> Result<ClientIdentity, IdeviceError> {
        Ok(ClientIdentity {
            certificate: X509::from_pem(&self.host_certificate)?,
            private_key: PKey::private_key_from_pem(&self.host_private_key)?,
        })
    }

    fn mac_bytes(&self) -> Option<[u8; 6]> {
        let mac = self.wifi_mac_address.as_deref()?;
        let mut out = [0u8; 6];
        let mut parts = mac.split(':');
        for byte in out.iter_mut() {
            *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(out)
    }

    /// EUI-64 link-local address the device answers on over Wi-Fi
    pub fn link_local_address(&self) -> Option<Ipv6Addr> {
        let hw = self.mac_bytes()?;
        Some(Ipv6Addr::from([
            0xfe,
            0x80,
            0,
            0,
            0,
            0,
            0,
            0,
            hw[0] ^ 0x02,
            hw[1],
            hw[2],
            0xff,
            0xfe,
            hw[3],
            hw[4],
            hw[5],
        ]))
    }

    /// The mDNS instance name the device advertises, used to key pairing records
    pub fn instance_name(&self) -> Option<String> {
        let hw = self.mac_bytes()?;
        let ip = self.link_local_address()?;
        let mac = hw
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":");
        Some(format!("{mac}@{ip}"))
    }
}

#[cfg(test)]
pub(crate) fn test_pairing_file() -> PairingFile {
    PairingFile {
        device_certificate: Vec::new(),
        host_certificate: Vec::new(),
        host_private_key: Vec::new(),
        root_private_key: Vec::new(),
        escrow_bag: None,
        host_id: "00000000-1111-2222-3333-444444444444".into(),
        system_buid: "55555555-6666-7777-8888-999999999999".into(),
        wifi_mac_address: Some("a4:83:e7:12:34:56".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>DeviceCertificate</key>
	<data>ZGV2aWNl</data>
	<key>HostCertificate</key>
	<data>aG9zdA==</data>
	<key>HostID</key>
	<string>HOST-ID</string>
	<key>HostPrivateKey</key>
	<data>a2V5</data>
	<key>RootPrivateKey</key>
	<data>cm9vdA==</data>
	<key>SystemBUID</key>
	<string>BUID</string>
	<key>WiFiMACAddress</key>
	<string>a4:83:e7:12:34:56</string>
</dict>
</plist>"#;

    #[test]
    fn parses_pairing_record() {
        let p = PairingFile::from_bytes(RECORD.as_bytes()).unwrap();
        assert_eq!(p.host_id, "HOST-ID");
        assert_eq!(p.system_buid, "BUID");
        assert_eq!(p.host_certificate, b"host");
        assert_eq!(p.device_certificate, b"device");
        assert!(p.escrow_bag.is_none());
    }

    #[test]
    fn link_local_flips_universal_bit() {
        let p = test_pairing_file();
        let ip = p.link_local_address().unwrap();
        assert_eq!(ip.to_string(), "fe80::a683:e7ff:fe12:3456");
        assert_eq!(
            p.instance_name().unwrap(),
            "a4:83:e7:12:34:56@fe80::a683:e7ff:fe12:3456"
        );
    }

    #[test]
    fn malformed_mac_has_no_address() {
        let mut p = test_pairing_file();
        p.wifi_mac_address = Some("a4:83:e7".into());
        assert!(p.link_local_address().is_none());
        p.wifi_mac_address = None;
        assert!(p.instance_name().is_none());
    }

    #[test]
    fn empty_certificate_is_rejected() {
        assert!(test_pairing_file().client_identity().is_err());
    }
}
