//! Remote access heuristics for platforms without a direct "is remote" API.
//!
//! Two kinds of signal are recognised:
//! - environment markers left by SSH or a forwarded X display;
//! - established TCP sockets whose local port belongs to a well-known
//!   remote access service, read from `/proc/net/tcp`-formatted tables.

use crate::error::{LockwatchError, LockwatchResult};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::RangeInclusive;
use tracing::debug;

/// Local ports of remote access services (SSH, RDP, VNC displays :0 to :9).
pub const REMOTE_ACCESS_PORTS: [RangeInclusive<u16>; 3] = [22..=22, 3389..=3389, 5900..=5909];

/// Environment variables set inside an SSH login.
pub const SSH_ENV_VARS: [&str; 3] = ["SSH_CONNECTION", "SSH_CLIENT", "SSH_TTY"];

const TCP_ESTABLISHED: &str = "01";

pub fn is_remote_access_port(port: u16) -> bool {
    REMOTE_ACCESS_PORTS.iter().any(|range| range.contains(&port))
}

/// Return the name of the first environment variable that marks the session
/// as remote, using `lookup` to read variables.
pub fn remote_env_marker<F>(lookup: F) -> Option<&'static str>
where
    F: Fn(&str) -> Option<String>,
{
    for var in SSH_ENV_VARS {
        if lookup(var).is_some_and(|value| !value.trim().is_empty()) {
            return Some(var);
        }
    }

    // "host:0" is a forwarded display; ":0" and "unix:0" are local.
    let display = lookup("DISPLAY")?;
    let host = display.split(':').next().unwrap_or_default();
    if !host.is_empty() && host != "unix" && host != "localhost" {
        return Some("DISPLAY");
    }
    None
}

/// A socket row from a `/proc/net/tcp` or `/proc/net/tcp6` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub established: bool,
}

/// Parse a `/proc/net/tcp` formatted table. Malformed rows are skipped.
pub fn parse_tcp_table(table: &str) -> Vec<SocketEntry> {
    table.lines().skip(1).filter_map(parse_row).collect()
}

fn parse_row(line: &str) -> Option<SocketEntry> {
    let mut fields = line.split_whitespace();
    let _slot = fields.next()?;
    let local = fields.next()?;
    let remote = fields.next()?;
    let state = fields.next()?;

    let (_, local_port) = local.split_once(':')?;
    let (remote_addr, _) = remote.split_once(':')?;

    Some(SocketEntry {
        local_port: u16::from_str_radix(local_port, 16).ok()?,
        remote_addr: parse_hex_addr(remote_addr)?,
        established: state == TCP_ESTABLISHED,
    })
}

/// Addresses are printed as native-endian 32-bit words.
fn parse_hex_addr(hex: &str) -> Option<IpAddr> {
    match hex.len() {
        8 => {
            let word = u32::from_str_radix(hex, 16).ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes())))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
                let word = u32::from_str_radix(&hex[i * 8..i * 8 + 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn is_loopback(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
    }
}

/// Find an established connection from a non-loopback peer to a remote
/// access port.
pub fn find_remote_peer(entries: &[SocketEntry]) -> Option<&SocketEntry> {
    entries.iter().find(|entry| {
        entry.established && is_remote_access_port(entry.local_port) && !is_loopback(&entry.remote_addr)
    })
}

/// Decide whether the session is remote: first from environment markers
/// read through `env`, then from the socket tables named in `tables`, each
/// loaded through `read_table`.
///
/// Unreadable tables are skipped; when none can be read the answer is
/// `InspectionUnavailable` rather than a guess.
pub fn detect_remote<E, R>(env: E, tables: &[&str], read_table: R) -> LockwatchResult<bool>
where
    E: Fn(&str) -> Option<String>,
    R: Fn(&str) -> io::Result<String>,
{
    if let Some(marker) = remote_env_marker(env) {
        debug!(marker, "remote session marker in environment");
        return Ok(true);
    }

    let mut readable = false;
    for &table in tables {
        let content = match read_table(table) {
            Ok(content) => content,
            Err(e) => {
                debug!(table, error = %e, "socket table unreadable");
                continue;
            }
        };
        readable = true;
        let entries = parse_tcp_table(&content);
        if let Some(peer) = find_remote_peer(&entries) {
            debug!(
                table,
                port = peer.local_port,
                remote = %peer.remote_addr,
                "established remote access connection"
            );
            return Ok(true);
        }
    }

    if !readable {
        return Err(LockwatchError::InspectionUnavailable(
            "no socket table could be read".to_string(),
        ));
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode";

    fn table(rows: &[&str]) -> String {
        let mut out = String::from(HEADER);
        for row in rows {
            out.push('\n');
            out.push_str(row);
        }
        out
    }

    #[test]
    fn test_ports() {
        assert!(is_remote_access_port(22));
        assert!(is_remote_access_port(3389));
        assert!(is_remote_access_port(5900));
        assert!(is_remote_access_port(5909));
        assert!(!is_remote_access_port(5910));
        assert!(!is_remote_access_port(80));
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn test_established_ssh_peer_detected() {
        // 192.168.1.20:51514 -> local :22, ESTABLISHED
        let text = table(&[
            "   0: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 1234 1 0000000000000000 100 0 0 10 0",
            "   1: 0201A8C0:0016 1401A8C0:C93A 01 00000000:00000000 02:0009A1F2 00000000     0        0 5678 4 0000000000000000 20 4 30 10 -1",
        ]);
        let entries = parse_tcp_table(&text);
        assert_eq!(entries.len(), 2);

        let peer = find_remote_peer(&entries).expect("remote peer");
        assert_eq!(peer.local_port, 22);
        assert_eq!(peer.remote_addr, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)));
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn test_listening_and_loopback_ignored() {
        let text = table(&[
            // LISTEN on :3389
            "   0: 00000000:0D3D 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 1111 1 0000000000000000 100 0 0 10 0",
            // ESTABLISHED :5900 from 127.0.0.1 (SSH tunnel endpoint)
            "   1: 0100007F:170C 0100007F:D431 01 00000000:00000000 00:00000000 00000000  1000        0 2222 1 0000000000000000 20 4 30 10 -1",
            // ESTABLISHED :443 from outside
            "   2: 0201A8C0:01BB 1401A8C0:C93A 01 00000000:00000000 00:00000000 00000000  1000        0 3333 1 0000000000000000 20 4 30 10 -1",
        ]);
        assert!(find_remote_peer(&parse_tcp_table(&text)).is_none());
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn test_tcp6_rows() {
        // ::1 peer on :22 (loopback), then a global peer on :5901
        let text = table(&[
            "   0: 00000000000000000000000001000000:0016 00000000000000000000000001000000:A1B2 01 00000000:00000000 00:00000000 00000000     0        0 4444 1 0000000000000000 20 4 30 10 -1",
            "   1: 00000000000000000000000001000000:170D 0000802000000000000000000A000000:A1B3 01 00000000:00000000 00:00000000 00000000     0        0 5555 1 0000000000000000 20 4 30 10 -1",
        ]);
        let entries = parse_tcp_table(&text);
        assert_eq!(entries.len(), 2);
        assert!(is_loopback(&entries[0].remote_addr));

        let peer = find_remote_peer(&entries).expect("remote peer");
        assert_eq!(peer.local_port, 5901);
    }

    #[test]
    fn test_malformed_rows_skipped() {
        let text = table(&["garbage", "   0: zz:zz 00000000:0000 01"]);
        assert!(parse_tcp_table(&text).is_empty());
    }

    #[test]
    fn test_env_markers() {
        let env: HashMap<&str, &str> = HashMap::from([("SSH_CONNECTION", "10.0.0.2 50000 10.0.0.1 22")]);
        let lookup = |key: &str| env.get(key).map(|v| v.to_string());
        assert_eq!(remote_env_marker(lookup), Some("SSH_CONNECTION"));

        let env: HashMap<&str, &str> = HashMap::from([("DISPLAY", "workstation:10.0")]);
        let lookup = |key: &str| env.get(key).map(|v| v.to_string());
        assert_eq!(remote_env_marker(lookup), Some("DISPLAY"));

        let env: HashMap<&str, &str> = HashMap::from([("DISPLAY", ":0"), ("SSH_TTY", "")]);
        let lookup = |key: &str| env.get(key).map(|v| v.to_string());
        assert_eq!(remote_env_marker(lookup), None);
    }

    const TABLES: [&str; 2] = ["tcp", "tcp6"];

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn missing(table: &str) -> io::Result<String> {
        Err(io::Error::new(io::ErrorKind::NotFound, table.to_string()))
    }

    #[test]
    fn test_detect_remote_env_marker_skips_tables() {
        let env = |key: &str| (key == "SSH_TTY").then(|| "/dev/pts/3".to_string());
        let read = |table: &str| -> io::Result<String> { panic!("read {table}") };
        assert!(detect_remote(env, &TABLES, read).unwrap());
    }

    #[test]
    fn test_detect_remote_unreadable_tables() {
        let err = detect_remote(no_env, &TABLES, missing).unwrap_err();
        assert!(matches!(err, LockwatchError::InspectionUnavailable(_)));
    }

    #[test]
    fn test_detect_remote_local_session() {
        let read = |name: &str| match name {
            "tcp" => Ok(table(&[])),
            _ => missing(name),
        };
        assert!(!detect_remote(no_env, &TABLES, read).unwrap());
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn test_detect_remote_peer_in_later_table() {
        let read = |name: &str| match name {
            "tcp" => missing(name),
            _ => Ok(table(&[
                "   0: 00000000000000000000000001000000:0D3D 0000802000000000000000000A000000:A1B3 01 00000000:00000000 00:00000000 00000000     0        0 6666 1 0000000000000000 20 4 30 10 -1",
            ])),
        };
        assert!(detect_remote(no_env, &TABLES, read).unwrap());
    }
}
