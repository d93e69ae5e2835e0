//! Wire framing: the fixed 10-byte header, command codes, and the
//! fixed-width `StorageBrief` layout (spec §6).

use crate::error::{TrackerError, TrackerResult};
use crate::state::storage::StorageStatus;
use std::net::IpAddr;

pub const HEADER_LEN: usize = 10;
pub const TRACKER_MAX_PACKAGE_SIZE: i64 = 8 * 1024;

pub const GROUP_NAME_FIELD_LEN: usize = 16;
pub const STORAGE_ID_FIELD_LEN: usize = 16;
pub const IP_ADDR_FIELD_LEN: usize = 16;
pub const STORAGE_BRIEF_LEN: usize = 1 + 4 + STORAGE_ID_FIELD_LEN + IP_ADDR_FIELD_LEN;

/// Command codes (spec §6). The full table is preserved here even
/// though only a subset of handlers perform a full state mutation;
/// implementers adding a new command start by naming it here.
pub mod cmd {
    pub const STORAGE_JOIN: u8 = 81;
    pub const STORAGE_BEAT: u8 = 82;
    pub const STORAGE_SYNC_REPORT: u8 = 83;
    pub const STORAGE_REPORT_STATUS: u8 = 84;
    pub const STORAGE_REPLICA_CHG: u8 = 85;
    pub const STORAGE_SYNC_SRC_REQ: u8 = 86;
    pub const STORAGE_SYNC_DEST_REQ: u8 = 87;
    pub const STORAGE_SYNC_NOTIFY: u8 = 88;
    pub const STORAGE_SYNC_DEST_QUERY: u8 = 90;
    pub const STORAGE_REPORT_IP_CHANGED: u8 = 93;
    pub const SERVICE_QUERY_STORE_WITHOUT_GROUP_ONE: u8 = 101;
    pub const SERVICE_QUERY_FETCH_ONE: u8 = 102;
    pub const SERVICE_QUERY_UPDATE: u8 = 103;
    pub const SERVER_LIST_ONE_GROUP: u8 = 104;
    pub const SERVER_LIST_ALL_GROUPS: u8 = 105;
    pub const SERVER_LIST_STORAGE: u8 = 106;
    pub const SERVER_DELETE_STORAGE: u8 = 107;
    pub const SERVER_DELETE_GROUP: u8 = 108;
    pub const SERVER_SET_TRUNK_SERVER: u8 = 109;
    pub const STORAGE_REPORT_DISK_USAGE: u8 = 110;
    pub const STORAGE_FETCH_STORAGE_IDS: u8 = 111;
    pub const STORAGE_GET_STORAGE_ID: u8 = 112;
    pub const STORAGE_GET_GROUP_NAME: u8 = 113;
    pub const STORAGE_GET_MY_IP: u8 = 114;
    pub const STORAGE_CHANGE_STATUS: u8 = 115;
    pub const STORAGE_PARAMETER_REQ: u8 = 116;
    pub const STORAGE_GET_STATUS: u8 = 117;
    pub const STORAGE_CHANGELOG_REQ: u8 = 118;
    pub const SERVICE_QUERY_FETCH_ALL: u8 = 119;
    pub const SERVICE_QUERY_STORE_WITH_GROUP_ONE: u8 = 120;
    pub const SERVICE_QUERY_STORE_WITHOUT_GROUP_ALL: u8 = 121;
    pub const SERVICE_QUERY_STORE_WITH_GROUP_ALL: u8 = 122;
    pub const TRACKER_GET_STATUS: u8 = 123;
    pub const TRACKER_GET_SYS_FILES_START: u8 = 124;
    pub const TRACKER_GET_SYS_FILES_END: u8 = 125;
    pub const TRACKER_GET_ONE_SYS_FILE: u8 = 126;
    pub const TRACKER_PING_LEADER: u8 = 127;
    pub const STORAGE_FETCH_TRUNK_FID: u8 = 128;
    pub const STORAGE_REPORT_TRUNK_FID: u8 = 129;
    pub const STORAGE_REPORT_TRUNK_FREE: u8 = 130;
    pub const TRACKER_NOTIFY_NEXT_LEADER: u8 = 131;
    pub const TRACKER_COMMIT_NEXT_LEADER: u8 = 132;
    pub const TRACKER_NOTIFY_RESELECT_LEADER: u8 = 133;
    pub const RESP: u8 = 100;
    pub const ACTIVE_TEST: u8 = 82;
    pub const QUIT: u8 = 82;
}

/// A parsed 10-byte request/response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub pkg_len: i64,
    pub cmd: u8,
    pub status: u8,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..8].copy_from_slice(&self.pkg_len.to_be_bytes());
        out[8] = self.cmd;
        out[9] = self.status;
        out
    }

    pub fn decode(bytes: &[u8; HEADER_LEN]) -> TrackerResult<Header> {
        let pkg_len = i64::from_be_bytes(bytes[0..8].try_into().unwrap());
        if pkg_len < 0 || pkg_len > TRACKER_MAX_PACKAGE_SIZE {
            return Err(TrackerError::Protocol(format!(
                "invalid pkgLen {} (max {})",
                pkg_len, TRACKER_MAX_PACKAGE_SIZE
            )));
        }
        Ok(Header {
            pkg_len,
            cmd: bytes[8],
            status: bytes[9],
        })
    }

    pub fn response(cmd_req: u8, status: u8, body_len: usize) -> Header {
        let _ = cmd_req;
        Header {
            pkg_len: body_len as i64,
            cmd: cmd::RESP,
            status,
        }
    }
}

/// Zero-pads `s` into a fixed-width field, truncating if too long.
pub fn encode_fixed(s: &str, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Reads a zero-padded fixed-width field back into a string.
pub fn decode_fixed(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

/// The check-and-sync piggyback brief (spec §6 `StorageBrief`).
#[derive(Debug, Clone)]
pub struct StorageBriefWire {
    pub status: StorageStatus,
    pub port: u32,
    pub id: String,
    pub ip: String,
}

impl StorageBriefWire {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(STORAGE_BRIEF_LEN);
        out.push(self.status as u8);
        out.extend_from_slice(&self.port.to_be_bytes());
        out.extend_from_slice(&encode_fixed(&self.id, STORAGE_ID_FIELD_LEN));
        out.extend_from_slice(&encode_fixed(&self.ip, IP_ADDR_FIELD_LEN));
        out
    }

    pub fn decode(bytes: &[u8]) -> TrackerResult<StorageBriefWire> {
        if bytes.len() < STORAGE_BRIEF_LEN {
            return Err(TrackerError::Protocol("short StorageBrief".to_string()));
        }
        let status = StorageStatus::from_u8(bytes[0])
            .ok_or_else(|| TrackerError::Protocol(format!("invalid status byte {}", bytes[0])))?;
        let port = u32::from_be_bytes(bytes[1..5].try_into().unwrap());
        let id = decode_fixed(&bytes[5..5 + STORAGE_ID_FIELD_LEN]);
        let ip = decode_fixed(&bytes[5 + STORAGE_ID_FIELD_LEN..5 + STORAGE_ID_FIELD_LEN + IP_ADDR_FIELD_LEN]);
        Ok(StorageBriefWire { status, port, id, ip })
    }
}

pub fn parse_ip(s: &str) -> TrackerResult<IpAddr> {
    s.parse()
        .map_err(|_| TrackerError::InvalidArgument(format!("invalid ip address: {}", s)))
}

/// Check-and-sync piggyback flags (spec §4.6).
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeFlags {
    pub leader_changed: bool,
    pub trunk_server_changed: bool,
    pub group_membership_changed: bool,
}

impl ChangeFlags {
    pub fn to_byte(self) -> u8 {
        (self.leader_changed as u8) | ((self.trunk_server_changed as u8) << 1) | ((self.group_membership_changed as u8) << 2)
    }

    pub fn from_byte(b: u8) -> ChangeFlags {
        ChangeFlags {
            leader_changed: b & 0b001 != 0,
            trunk_server_changed: b & 0b010 != 0,
            group_membership_changed: b & 0b100 != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = Header {
            pkg_len: 42,
            cmd: cmd::STORAGE_JOIN,
            status: 0,
        };
        let bytes = h.encode();
        assert_eq!(Header::decode(&bytes).unwrap(), h);
    }

    #[test]
    fn header_rejects_oversized_pkg_len() {
        let h = Header {
            pkg_len: TRACKER_MAX_PACKAGE_SIZE + 1,
            cmd: 0,
            status: 0,
        };
        let bytes = h.encode();
        assert!(Header::decode(&bytes).is_err());
    }

    #[test]
    fn header_rejects_negative_pkg_len() {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..8].copy_from_slice(&(-1i64).to_be_bytes());
        assert!(Header::decode(&bytes).is_err());
    }

    #[test]
    fn fixed_field_round_trips_and_truncates() {
        let encoded = encode_fixed("group1", GROUP_NAME_FIELD_LEN);
        assert_eq!(decode_fixed(&encoded), "group1");

        let too_long = "a".repeat(GROUP_NAME_FIELD_LEN + 5);
        let encoded = encode_fixed(&too_long, GROUP_NAME_FIELD_LEN);
        assert_eq!(encoded.len(), GROUP_NAME_FIELD_LEN);
    }

    #[test]
    fn storage_brief_round_trips() {
        let brief = StorageBriefWire {
            status: StorageStatus::Online,
            port: 23000,
            id: "1".to_string(),
            ip: "10.0.0.1".to_string(),
        };
        let bytes = brief.encode();
        assert_eq!(bytes.len(), STORAGE_BRIEF_LEN);
        let decoded = StorageBriefWire::decode(&bytes).unwrap();
        assert_eq!(decoded.id, "1");
        assert_eq!(decoded.port, 23000);
        assert_eq!(decoded.status, StorageStatus::Online);
    }

    #[test]
    fn change_flags_round_trip() {
        let flags = ChangeFlags {
            leader_changed: true,
            trunk_server_changed: false,
            group_membership_changed: true,
        };
        assert_eq!(ChangeFlags::from_byte(flags.to_byte()).leader_changed, true);
        assert_eq!(
            ChangeFlags::from_byte(flags.to_byte()).trunk_server_changed,
            false
        );
    }
}
