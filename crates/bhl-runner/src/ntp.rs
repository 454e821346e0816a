// SPDX-License-Identifier: MIT OR Apache-2.0
//! Clock drift probe guarding policy-based retention.
//!
//! A skewed clock (attack or misconfiguration) can make a retention policy
//! wipe recent snapshots. Before a policy forget runs with `ntp_server`
//! configured, the server is queried once over SNTP; if the offset cannot
//! be obtained or exceeds the allowed maximum, the forget is refused.
//! Unreachable deliberately equals too-far-off: when time cannot be
//! verified, the policy must not run.

use std::net::UdpSocket;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_DELTA: f64 = 2_208_988_800.0;

/// Probe abstraction so the forget guard can be exercised without a live
/// NTP server.
pub trait NtpProbe: Send + Sync {
    /// Clock offset in seconds, or `None` when it cannot be determined.
    fn offset_seconds(&self, server: &str) -> Option<f64>;
}

/// Single-exchange SNTPv4 client.
#[derive(Debug, Default)]
pub struct SntpProbe;

impl NtpProbe for SntpProbe {
    fn offset_seconds(&self, server: &str) -> Option<f64> {
        match sntp_query(server) {
            Ok(offset) => Some(offset),
            Err(e) => {
                error!("cannot get NTP offset from {server}: {e}");
                None
            }
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn ntp_timestamp(buf: &[u8], offset: usize) -> f64 {
    let seconds = u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]);
    let fraction =
        u32::from_be_bytes([buf[offset + 4], buf[offset + 5], buf[offset + 6], buf[offset + 7]]);
    seconds as f64 + fraction as f64 / 2f64.powi(32) - NTP_UNIX_DELTA
}

fn sntp_query(server: &str) -> std::io::Result<f64> {
    let address = if server.contains(':') {
        server.to_string()
    } else {
        format!("{server}:123")
    };

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_read_timeout(Some(Duration::from_secs(5)))?;
    socket.connect(address)?;

    // LI = 0, VN = 4, Mode = 3 (client).
    let mut request = [0u8; 48];
    request[0] = 0x23;
    let t1 = unix_now();
    socket.send(&request)?;

    let mut response = [0u8; 48];
    let received = socket.recv(&mut response)?;
    let t4 = unix_now();
    if received < 48 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "short NTP response",
        ));
    }

    // Receive and transmit timestamps from the server.
    let t2 = ntp_timestamp(&response, 32);
    let t3 = ntp_timestamp(&response, 40);
    let offset = ((t2 - t1) + (t3 - t4)) / 2.0;
    debug!("NTP offset from {server}: {offset:.3}s");
    Ok(offset)
}

/// Whether the measured offset allows a policy operation to run.
pub fn offset_allows_policy(offset: Option<f64>, max_allowed: f64) -> bool {
    match offset {
        Some(offset) => offset.abs() <= max_allowed,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Probe returning a canned offset.
    pub struct FixedProbe(pub Option<f64>);

    impl NtpProbe for FixedProbe {
        fn offset_seconds(&self, _server: &str) -> Option<f64> {
            self.0
        }
    }

    #[test]
    fn small_offsets_pass() {
        assert!(offset_allows_policy(Some(0.5), 600.0));
        assert!(offset_allows_policy(Some(-120.0), 600.0));
        assert!(offset_allows_policy(Some(600.0), 600.0));
    }

    #[test]
    fn large_offsets_refuse() {
        assert!(!offset_allows_policy(Some(900.0), 600.0));
        assert!(!offset_allows_policy(Some(-900.0), 600.0));
    }

    #[test]
    fn unknown_offset_fails_closed() {
        assert!(!offset_allows_policy(None, 600.0));
    }

    #[test]
    fn probe_trait_is_mockable() {
        let probe = FixedProbe(Some(900.0));
        assert!(!offset_allows_policy(probe.offset_seconds("pool.ntp.org"), 600.0));
    }

    #[test]
    fn ntp_timestamp_decodes_epoch() {
        let mut buf = [0u8; 48];
        // 1900 + NTP_UNIX_DELTA seconds = Unix epoch.
        buf[40..44].copy_from_slice(&(NTP_UNIX_DELTA as u32).to_be_bytes());
        let ts = ntp_timestamp(&buf, 40);
        assert!((ts - 0.0).abs() < 1e-6);
    }
}
