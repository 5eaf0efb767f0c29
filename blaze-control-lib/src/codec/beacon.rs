//! UDP discovery beacons and time-sync replies.
//!
//! Both are sequences of little-endian `u32` words. Beacons carry
//! `(42, sender_id, device_time)` where the sender id holds the device's
//! IPv4 address bytes; time-sync packets carry
//! `(43, sync_id, now, echoed_sender_id, echoed_sender_time)`.

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::codec::{read_u32_le, CodecError};

pub const DISCOVERY_PORT: u16 = 1889;
pub const BEACON_PACKET: u32 = 42;
pub const TIMESYNC_PACKET: u32 = 43;
pub const DEFAULT_SYNC_ID: u32 = 890;

pub const BEACON_SIZE: usize = 12;
pub const TIMESYNC_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiscoveryBeacon {
    pub packet_type: u32,
    pub sender_id: u32,
    pub device_time: u32,
}

impl DiscoveryBeacon {
    pub fn is_beacon(&self) -> bool {
        self.packet_type == BEACON_PACKET
    }

    pub fn is_time_sync(&self) -> bool {
        self.packet_type == TIMESYNC_PACKET
    }

    /// Address the device announces for itself.
    pub fn ip_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.sender_id.to_le_bytes())
    }
}

/// Decodes the first three words of a discovery datagram.
///
/// Time-sync packets share the leading layout, so `packet_type` tells the
/// two apart.
pub fn decode_discovery_beacon(bytes: &[u8]) -> Result<DiscoveryBeacon, CodecError> {
    if bytes.len() < BEACON_SIZE {
        return Err(CodecError::MalformedFrame(format!(
            "discovery packet is {} bytes, expected at least {}",
            bytes.len(),
            BEACON_SIZE
        )));
    }
    Ok(DiscoveryBeacon {
        packet_type: read_u32_le(bytes, 0)?,
        sender_id: read_u32_le(bytes, 4)?,
        device_time: read_u32_le(bytes, 8)?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeSyncPacket {
    pub sync_id: u32,
    pub now: u32,
    pub sender_id: u32,
    pub sender_time: u32,
}

impl TimeSyncPacket {
    /// Reply to `beacon` claiming `now` as the authoritative time.
    pub fn reply_to(beacon: &DiscoveryBeacon, sync_id: u32, now: u32) -> Self {
        TimeSyncPacket {
            sync_id,
            now,
            sender_id: beacon.sender_id,
            sender_time: beacon.device_time,
        }
    }

    pub fn encode(&self) -> Bytes {
        encode_time_sync_reply(self.sync_id, self.now, self.sender_id, self.sender_time)
    }
}

pub fn encode_time_sync_reply(
    sync_id: u32,
    current_time: u32,
    echoed_sender_id: u32,
    echoed_time: u32,
) -> Bytes {
    let mut buffer = BytesMut::with_capacity(TIMESYNC_SIZE);
    buffer.put_u32_le(TIMESYNC_PACKET);
    buffer.put_u32_le(sync_id);
    buffer.put_u32_le(current_time);
    buffer.put_u32_le(echoed_sender_id);
    buffer.put_u32_le(echoed_time);
    buffer.freeze()
}

pub fn decode_time_sync(bytes: &[u8]) -> Result<TimeSyncPacket, CodecError> {
    if bytes.len() < TIMESYNC_SIZE {
        return Err(CodecError::MalformedFrame(format!(
            "time-sync packet is {} bytes, expected {}",
            bytes.len(),
            TIMESYNC_SIZE
        )));
    }
    let packet_type = read_u32_le(bytes, 0)?;
    if packet_type != TIMESYNC_PACKET {
        return Err(CodecError::UnsupportedVersion {
            found: packet_type,
            expected: TIMESYNC_PACKET.to_string(),
        });
    }
    Ok(TimeSyncPacket {
        sync_id: read_u32_le(bytes, 4)?,
        now: read_u32_le(bytes, 8)?,
        sender_id: read_u32_le(bytes, 12)?,
        sender_time: read_u32_le(bytes, 16)?,
    })
}

/// Low 32 bits of the epoch time in milliseconds, the clock devices use.
pub fn device_time(at: DateTime<Utc>) -> u32 {
    at.timestamp_millis() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon_bytes(ip: [u8; 4], time: u32) -> Vec<u8> {
        let mut bytes = BEACON_PACKET.to_le_bytes().to_vec();
        bytes.extend_from_slice(&ip);
        bytes.extend_from_slice(&time.to_le_bytes());
        bytes
    }

    #[test]
    fn test_decode_beacon() {
        let beacon = decode_discovery_beacon(&beacon_bytes([192, 168, 4, 1], 123_456)).unwrap();
        assert!(beacon.is_beacon());
        assert_eq!(beacon.ip_address(), Ipv4Addr::new(192, 168, 4, 1));
        assert_eq!(beacon.device_time, 123_456);
    }

    #[test]
    fn test_short_beacon_is_rejected() {
        assert!(matches!(
            decode_discovery_beacon(&[42, 0, 0, 0, 1]),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_time_sync_reply_layout() {
        let beacon = decode_discovery_beacon(&beacon_bytes([10, 0, 0, 7], 99)).unwrap();
        let reply = TimeSyncPacket::reply_to(&beacon, DEFAULT_SYNC_ID, 5_000).encode();

        assert_eq!(reply.len(), TIMESYNC_SIZE);
        assert_eq!(&reply[0..4], &43u32.to_le_bytes());
        assert_eq!(&reply[4..8], &890u32.to_le_bytes());
        assert_eq!(&reply[8..12], &5_000u32.to_le_bytes());
        assert_eq!(&reply[12..16], &[10, 0, 0, 7]);
        assert_eq!(&reply[16..20], &99u32.to_le_bytes());

        let decoded = decode_time_sync(&reply).unwrap();
        assert_eq!(decoded.sender_time, 99);
        assert!(decode_discovery_beacon(&reply).unwrap().is_time_sync());
    }

    #[test]
    fn test_device_time_wraps_to_32_bits() {
        let at = DateTime::from_timestamp_millis(0x1_0000_0005).unwrap();
        assert_eq!(device_time(at), 5);
    }
}
