//! Storage identity registry (C1).
//!
//! Parses and indexes the static `storage_ids` table that maps
//! `(group, ip)` and `(ip, port)` pairs onto a logical storage id. The
//! registry is built once at startup from [`IdentityRegistry::load`]
//! and is immutable afterward; lookups are binary searches over the
//! three sorted indexes.

use crate::error::{TrackerError, TrackerResult};
use std::net::IpAddr;

/// Read/write mode recognized for a storage identity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwMode {
    Both,
    ReadOnly,
    WriteOnly,
    None,
}

impl RwMode {
    fn parse(value: &str) -> Option<RwMode> {
        match value {
            "none" => Some(RwMode::None),
            "read" | "readonly" => Some(RwMode::ReadOnly),
            "write" | "writeonly" => Some(RwMode::WriteOnly),
            "both" | "all" => Some(RwMode::Both),
            _ => None,
        }
    }
}

/// Whether an address is reachable only inside the cluster's private
/// network or from the outside (spec §4.1 inner/outer classification).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrScope {
    Inner,
    Outer,
}

fn classify(ip: &IpAddr) -> AddrScope {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            let is_private10 = o[0] == 10;
            let is_private172 = o[0] == 172 && (16..=31).contains(&o[1]);
            let is_private192 = o[0] == 192 && o[1] == 168;
            if is_private10 || is_private172 || is_private192 {
                AddrScope::Inner
            } else {
                AddrScope::Outer
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_unicast_link_local() {
                AddrScope::Inner
            } else {
                AddrScope::Outer
            }
        }
    }
}

/// A single entry of the storage identity table.
#[derive(Debug, Clone)]
pub struct StorageIdentity {
    /// Decimal id, `1 ..= 16_777_215`, first digit non-zero.
    pub id: String,
    pub group: String,
    /// Up to 2 addresses, inner-scope address first if both are present.
    pub ip_addrs: Vec<IpAddr>,
    pub port: u16,
    pub rw_mode: RwMode,
}

impl StorageIdentity {
    fn numeric_id(&self) -> TrackerResult<u32> {
        parse_id(&self.id)
    }
}

/// Parses and validates a decimal storage id per spec §3 (C1 invariants).
pub fn parse_id(s: &str) -> TrackerResult<u32> {
    if s.is_empty() || (s.len() > 1 && s.starts_with('0')) {
        return Err(TrackerError::InvalidArgument(format!(
            "invalid storage id: {}",
            s
        )));
    }
    let n: u32 = s
        .parse()
        .map_err(|_| TrackerError::InvalidArgument(format!("non-decimal storage id: {}", s)))?;
    if n < 1 || n > 16_777_215 {
        return Err(TrackerError::InvalidArgument(format!(
            "storage id out of range: {}",
            s
        )));
    }
    // format(parse(s)) == s is guaranteed because we rejected leading zeros.
    Ok(n)
}

/// Immutable, binary-searchable index over a parsed `storage_ids` table.
pub struct IdentityRegistry {
    by_id: Vec<StorageIdentity>,
    by_group_ip: Vec<(String, IpAddr, usize)>,
    by_ip_port: Vec<(IpAddr, u16, usize)>,
    ports_present: bool,
}

impl IdentityRegistry {
    /// Parses the `storage_ids` text format described in spec §4.1.
    pub fn load(text: &str) -> TrackerResult<IdentityRegistry> {
        let mut entries = Vec::new();
        let mut any_port = false;
        let mut any_no_port = false;

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let id = parts
                .next()
                .ok_or_else(|| TrackerError::InvalidArgument("missing id field".to_string()))?
                .to_string();
            let group = parts
                .next()
                .ok_or_else(|| TrackerError::InvalidArgument("missing group field".to_string()))?
                .to_string();
            let host_field = parts.next().ok_or_else(|| {
                TrackerError::InvalidArgument("missing host field".to_string())
            })?;
            let rw = parts
                .find_map(|tok| tok.strip_prefix("rw="))
                .and_then(RwMode::parse)
                .unwrap_or(RwMode::Both);

            let (hosts, port) = split_host_port(host_field)?;
            if port > 0 {
                any_port = true;
            } else {
                any_no_port = true;
            }

            let mut ip_addrs: Vec<IpAddr> = Vec::with_capacity(hosts.len().min(2));
            for host in hosts.into_iter().take(2) {
                ip_addrs.push(resolve(&host)?);
            }
            if ip_addrs.len() == 2 {
                if classify(&ip_addrs[0]) == AddrScope::Outer
                    && classify(&ip_addrs[1]) == AddrScope::Inner
                {
                    ip_addrs.swap(0, 1);
                }
            }

            parse_id(&id)?;
            entries.push(StorageIdentity {
                id,
                group,
                ip_addrs,
                port,
                rw_mode: rw,
            });
        }

        if any_port && any_no_port {
            return Err(TrackerError::InvalidArgument(
                "storage_ids: port column must be consistently present or absent".to_string(),
            ));
        }

        entries.sort_by(|a, b| a.numeric_id().unwrap_or(0).cmp(&b.numeric_id().unwrap_or(0)));
        for w in entries.windows(2) {
            if w[0].id == w[1].id {
                return Err(TrackerError::Exists(format!("duplicate id: {}", w[0].id)));
            }
        }

        let mut by_group_ip = Vec::new();
        let mut by_ip_port = Vec::new();
        for (idx, e) in entries.iter().enumerate() {
            for ip in &e.ip_addrs {
                by_group_ip.push((e.group.clone(), *ip, idx));
                by_ip_port.push((*ip, e.port, idx));
            }
        }

        by_group_ip.sort_by(|a, b| (a.0.as_str(), a.1).cmp(&(b.0.as_str(), b.1)));
        for w in by_group_ip.windows(2) {
            if w[0].0 == w[1].0 && w[0].1 == w[1].1 {
                return Err(TrackerError::Exists(format!(
                    "duplicate (group, ip): ({}, {})",
                    w[0].0, w[0].1
                )));
            }
        }

        by_ip_port.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        for w in by_ip_port.windows(2) {
            if w[0].0 == w[1].0 && w[0].1 == w[1].1 {
                return Err(TrackerError::Exists(format!(
                    "duplicate (ip, port): ({}, {})",
                    w[0].0, w[0].1
                )));
            }
        }

        Ok(IdentityRegistry {
            by_id: entries,
            by_group_ip,
            by_ip_port,
            ports_present: any_port,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn ports_present(&self) -> bool {
        self.ports_present
    }

    pub fn get_by_id(&self, id: &str) -> Option<&StorageIdentity> {
        let n = parse_id(id).ok()?;
        self.by_id
            .binary_search_by_key(&n, |e| e.numeric_id().unwrap_or(0))
            .ok()
            .map(|idx| &self.by_id[idx])
    }

    pub fn get_by_group_ip(&self, group: &str, ip: &IpAddr) -> Option<&StorageIdentity> {
        let idx = self
            .by_group_ip
            .binary_search_by(|probe| (probe.0.as_str(), probe.1).cmp(&(group, *ip)))
            .ok()?;
        let entry_idx = self.by_group_ip[idx].2;
        Some(&self.by_id[entry_idx])
    }

    /// Looks up `(ip, port)` exactly, falling back to `(ip, 0)`.
    pub fn get_by_ip_port(&self, ip: &IpAddr, port: u16) -> Option<&StorageIdentity> {
        if let Ok(idx) = self
            .by_ip_port
            .binary_search_by(|probe| (probe.0, probe.1).cmp(&(*ip, port)))
        {
            return Some(&self.by_id[self.by_ip_port[idx].2]);
        }
        if port != 0 {
            if let Ok(idx) = self
                .by_ip_port
                .binary_search_by(|probe| (probe.0, probe.1).cmp(&(*ip, 0)))
            {
                return Some(&self.by_id[self.by_ip_port[idx].2]);
            }
        }
        None
    }
}

fn split_host_port(field: &str) -> TrackerResult<(Vec<String>, u16)> {
    // bracketed IPv6 with optional port: [::1]:1234
    if let Some(rest) = field.strip_prefix('[') {
        if let Some(close) = rest.find(']') {
            let host = &rest[..close];
            let after = &rest[close + 1..];
            let port = if let Some(p) = after.strip_prefix(':') {
                p.parse().map_err(|_| {
                    TrackerError::InvalidArgument(format!("invalid port in {}", field))
                })?
            } else {
                0
            };
            return Ok((vec![host.to_string()], port));
        }
        return Err(TrackerError::InvalidArgument(format!(
            "unterminated bracket in host field: {}",
            field
        )));
    }

    // comma-separated list of up to 2 hosts, optionally trailing :port on the whole field
    let (hosts_part, port) = match field.rsplit_once(':') {
        Some((h, p)) if !h.contains(',') || h.matches('.').count() >= 1 => {
            match p.parse::<u16>() {
                Ok(port) => (h, port),
                Err(_) => (field, 0),
            }
        }
        _ => (field, 0),
    };
    let hosts = hosts_part.split(',').map(|s| s.trim().to_string()).collect();
    Ok((hosts, port))
}

fn resolve(host: &str) -> TrackerResult<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    use std::net::ToSocketAddrs;
    (host, 0)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|sa| sa.ip())
        .ok_or_else(|| TrackerError::InvalidArgument(format!("cannot resolve host: {}", host)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_id_round_trips() {
        for s in ["1", "42", "16777215"] {
            let n = parse_id(s).unwrap();
            assert_eq!(n.to_string(), s);
        }
    }

    #[test]
    fn parse_id_rejects_leading_zero_and_out_of_range() {
        assert!(parse_id("01").is_err());
        assert!(parse_id("0").is_err());
        assert!(parse_id("16777216").is_err());
    }

    #[test]
    fn load_builds_indexes_and_detects_duplicates() {
        let text = "1 group1 192.168.0.1:23000\n2 group1 192.168.0.2:23000\n";
        let reg = IdentityRegistry::load(text).unwrap();
        assert!(reg.get_by_id("1").is_some());
        assert!(reg.get_by_id("2").is_some());
        assert!(reg.get_by_id("3").is_none());

        let dup = "1 group1 192.168.0.1:23000\n1 group1 192.168.0.2:23000\n";
        assert!(IdentityRegistry::load(dup).is_err());
    }

    #[test]
    fn ip_port_lookup_falls_back_to_zero_port() {
        let text = "1 group1 192.168.0.1\n";
        let reg = IdentityRegistry::load(text).unwrap();
        let ip: IpAddr = "192.168.0.1".parse().unwrap();
        assert!(reg.get_by_ip_port(&ip, 23000).is_some());
    }

    #[test]
    fn inner_address_is_reordered_first() {
        let text = "1 group1 8.8.8.8,10.0.0.1:23000\n";
        let reg = IdentityRegistry::load(text).unwrap();
        let entry = reg.get_by_id("1").unwrap();
        assert_eq!(classify(&entry.ip_addrs[0]), AddrScope::Inner);
    }

    #[test]
    fn rw_mode_defaults_to_both() {
        let text = "1 group1 10.0.0.1:23000\n2 group1 10.0.0.2:23000 rw=readonly\n";
        let reg = IdentityRegistry::load(text).unwrap();
        assert_eq!(reg.get_by_id("1").unwrap().rw_mode, RwMode::Both);
        assert_eq!(reg.get_by_id("2").unwrap().rw_mode, RwMode::ReadOnly);
    }
}
