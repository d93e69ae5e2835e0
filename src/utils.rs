//! Small helpers shared by a few modules that otherwise have no
//! natural home for them.

use std::net::IpAddr;

/// Formats `ip:port`, matching [`crate::peers::Peer::addr`]'s format so
/// the two stay comparable.
pub fn format_addr(ip: IpAddr, port: u16) -> String {
    format!("{}:{}", ip, port)
}

/// Seconds elapsed since `since`, saturating at zero rather than going
/// negative on clock skew.
pub fn elapsed_secs(since: i64, now: i64) -> i64 {
    (now - since).max(0)
}
