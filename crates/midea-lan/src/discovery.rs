//! UDP device discovery
//!
//! Appliances answer a fixed 64-byte broadcast probe on UDP 6445 with a
//! `5A 5A` status blob carrying their identity:
//!
//! ```text
//! Offset | Size | Field
//! -------|------|---------------------------
//! 0x00   | 2    | magic 0x5A 0x5A
//! 0x14   | 8    | device id (u64 LE)
//! 0x26   | 1    | appliance type tag
//! 0x28   | 32   | serial, NUL-terminated ASCII
//! 0x48   | 32   | Wi-Fi SSID, NUL-terminated ASCII
//! ```

use crate::error::Result;
use midea_proto::crypto::{DISCOVERY_PROBE, buffer_xor, sha256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

/// UDP port appliances listen on for discovery probes
pub const DISCOVERY_PORT: u16 = 6445;

/// Default TCP control port
pub const CONTROL_PORT: u16 = 6444;

/// Smallest response that carries the full identity block
const MIN_RESPONSE_SIZE: usize = 104;

/// Identity of one discovered appliance; immutable after construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Unique appliance id, also the dedup key during discovery
    pub id: u64,

    /// Product category tag (0xAC, 0xA1, 0xFA, 0xE2, ...)
    pub appliance_type: u8,

    /// Appliance serial number
    pub serial: String,

    /// Wi-Fi network the appliance advertises
    pub ssid: String,

    /// Address the appliance answered from
    pub address: IpAddr,

    /// TCP control port
    pub port: u16,

    /// LAN protocol version (2 or 3)
    pub protocol_version: u8,
}

/// Discovery parameters
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Probe targets; defaults to the limited broadcast address
    pub targets: Vec<SocketAddr>,

    /// How long to collect responses
    pub timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            targets: vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                DISCOVERY_PORT,
            )],
            timeout: Duration::from_secs(5),
        }
    }
}

/// Broadcast the discovery probe and collect answering appliances
///
/// The probe is retransmitted once halfway through the window; responses
/// are deduplicated by device id. Returns when the window elapses.
pub async fn discover(options: &DiscoveryOptions) -> Result<HashMap<u64, DeviceDescriptor>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;

    send_probe(&socket, &options.targets).await;

    let deadline = Instant::now() + options.timeout;
    let mut retransmit_at = Some(Instant::now() + options.timeout / 2);
    let mut devices = HashMap::new();
    let mut buf = [0u8; 512];

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let wake = retransmit_at.unwrap_or(deadline).min(deadline);
        if now >= wake {
            send_probe(&socket, &options.targets).await;
            retransmit_at = None;
            continue;
        }

        match timeout(wake - now, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, addr))) => {
                if let Some(descriptor) = parse_response(&buf[..len], addr.ip()) {
                    debug!(
                        id = descriptor.id,
                        appliance_type = %format_args!("0x{:02x}", descriptor.appliance_type),
                        serial = %descriptor.serial,
                        %addr,
                        "appliance answered"
                    );
                    devices.insert(descriptor.id, descriptor);
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "discovery receive failed");
                break;
            }
            Err(_) => {
                // Window slice elapsed; loop to retransmit or finish
            }
        }
    }

    info!(count = devices.len(), "discovery finished");
    Ok(devices)
}

async fn send_probe(socket: &UdpSocket, targets: &[SocketAddr]) {
    for target in targets {
        if let Err(e) = socket.send_to(&DISCOVERY_PROBE, target).await {
            warn!(%target, error = %e, "failed to send discovery probe");
        }
    }
}

/// Parse one discovery response into a descriptor
fn parse_response(data: &[u8], address: IpAddr) -> Option<DeviceDescriptor> {
    if data.len() < MIN_RESPONSE_SIZE || data[0..2] != [0x5A, 0x5A] {
        return None;
    }

    let id = u64::from_le_bytes(data[20..28].try_into().ok()?);

    Some(DeviceDescriptor {
        id,
        appliance_type: data[38],
        serial: ascii_field(&data[40..72]),
        ssid: ascii_field(&data[72..104]),
        address,
        port: CONTROL_PORT,
        protocol_version: 3,
    })
}

/// NUL-terminated ASCII field
fn ascii_field(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Byte layout fed into the cloud-lookup identity hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpIdVariant {
    /// All 8 id bytes, big-endian, then byte-reversed
    Reversed,
    /// Low 6 id bytes, big-endian
    BigEndian6,
    /// Low 6 id bytes, little-endian
    LittleEndian6,
}

/// Derive the 16-byte cloud-lookup identifier for an appliance id
///
/// Hashes the variant-specific byte layout with SHA-256 and folds the
/// digest halves together; returned as 32 lowercase hex characters.
pub fn udp_id(appliance_id: u64, variant: UdpIdVariant) -> String {
    let be = appliance_id.to_be_bytes();
    let bytes: Vec<u8> = match variant {
        UdpIdVariant::Reversed => {
            let mut b = be.to_vec();
            b.reverse();
            b
        }
        UdpIdVariant::BigEndian6 => be[2..].to_vec(),
        UdpIdVariant::LittleEndian6 => {
            let mut b = be[2..].to_vec();
            b.reverse();
            b
        }
    };

    let digest = sha256(&bytes);
    hex::encode(buffer_xor(&digest[..16], &digest[16..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response() -> Vec<u8> {
        let mut data = vec![0u8; MIN_RESPONSE_SIZE];
        data[0] = 0x5A;
        data[1] = 0x5A;
        data[20..28].copy_from_slice(&123456789u64.to_le_bytes());
        data[38] = 0xAC;
        data[40..46].copy_from_slice(b"ABC123");
        data[72..84].copy_from_slice(b"midea_ac_XYZ");
        data
    }

    #[test]
    fn test_parse_response() {
        let addr: IpAddr = "192.168.1.50".parse().unwrap();
        let descriptor = parse_response(&sample_response(), addr).unwrap();

        assert_eq!(descriptor.id, 123456789);
        assert_eq!(descriptor.appliance_type, 0xAC);
        assert_eq!(descriptor.serial, "ABC123");
        assert_eq!(descriptor.ssid, "midea_ac_XYZ");
        assert_eq!(descriptor.address, addr);
        assert_eq!(descriptor.port, CONTROL_PORT);
        assert_eq!(descriptor.protocol_version, 3);
    }

    #[test]
    fn test_parse_rejects_short_or_foreign_data() {
        let addr: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(parse_response(&[0x5A, 0x5A, 0x00], addr).is_none());

        let mut wrong_magic = sample_response();
        wrong_magic[0] = 0x83;
        assert!(parse_response(&wrong_magic, addr).is_none());
    }

    #[test]
    fn test_udp_id_vectors() {
        assert_eq!(
            udp_id(123456789, UdpIdVariant::Reversed),
            "c0df1eef309df487f3061c8189f35c79"
        );
        assert_eq!(
            udp_id(123456789, UdpIdVariant::BigEndian6),
            "505407553cbc909df7d36b82967ace2e"
        );
        assert_eq!(
            udp_id(123456789, UdpIdVariant::LittleEndian6),
            "8011a3aa5116c19f17161815770eb6e4"
        );
    }

    #[test]
    fn test_udp_id_shape() {
        let id = udp_id(0xFFFF_FFFF_FFFF_FFFF, UdpIdVariant::Reversed);
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }
}
