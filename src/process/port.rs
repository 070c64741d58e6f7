//! Port selection and listening probes.
//!
//! # Responsibilities
//! - Pick the backend's listening port (explicit or random free port)
//! - Detect when a port starts listening, and which process owns it
//!
//! # Design Decisions
//! - The OS socket table (`/proc/net/tcp{,6}`) is preferred: it tells us
//!   whether a port is taken and who owns the listening socket
//! - Without the table, ports are picked at random and readiness is checked
//!   by connecting; connection refused means "still starting"

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;

use crate::config::schema::{MAX_PORT, MIN_PORT};
use crate::error::ProcessError;

/// Random picks attempted before giving up on finding a free port.
const MAX_PORT_PICKS: usize = 64;

/// Bound on a single connect probe.
const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Linux socket state code for LISTEN.
const TCP_LISTEN: &str = "0A";

/// How ports are inspected on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProbe {
    /// Read the OS socket table.
    SocketTable,
    /// Connect to the port; no ownership information.
    Connect,
}

/// Result of a listening probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listening {
    No,
    /// The port accepts connections. `owner` is the pid holding the listening
    /// socket when the probe can tell.
    Yes { owner: Option<u32> },
}

impl PortProbe {
    /// Use the socket table when this host exposes it.
    pub fn detect() -> Self {
        if read_socket_table().is_ok() {
            PortProbe::SocketTable
        } else {
            tracing::info!("Socket table unavailable, falling back to connect probes");
            PortProbe::Connect
        }
    }

    /// Choose the port for a new backend process.
    pub fn select_port(&self, configured: Option<u16>) -> Result<u16, ProcessError> {
        if let Some(port) = configured {
            if !(MIN_PORT..=MAX_PORT).contains(&port) {
                return Err(ProcessError::InvalidConfig(format!(
                    "port {port} is outside {MIN_PORT}..={MAX_PORT}"
                )));
            }
            return Ok(port);
        }

        let mut rng = rand::thread_rng();
        match self {
            PortProbe::Connect => Ok(rng.gen_range(MIN_PORT..=MAX_PORT)),
            PortProbe::SocketTable => {
                let table = read_socket_table()?;
                for _ in 0..MAX_PORT_PICKS {
                    let candidate = rng.gen_range(MIN_PORT..=MAX_PORT);
                    if !table.iter().any(|entry| entry.local_port == candidate) {
                        return Ok(candidate);
                    }
                }
                Err(ProcessError::PortExhausted {
                    min: MIN_PORT,
                    max: MAX_PORT,
                })
            }
        }
    }

    /// Whether something listens on `port` on the loopback interface.
    ///
    /// Connection refused is "not yet"; any other connect failure is an error.
    pub async fn probe(&self, port: u16) -> io::Result<Listening> {
        match self {
            PortProbe::SocketTable => {
                let table = read_socket_table()?;
                let inodes: Vec<u64> = table
                    .iter()
                    .filter(|entry| entry.local_port == port && entry.listening)
                    .map(|entry| entry.inode)
                    .collect();
                if inodes.is_empty() {
                    Ok(Listening::No)
                } else {
                    Ok(Listening::Yes {
                        owner: find_socket_owner(&inodes),
                    })
                }
            }
            PortProbe::Connect => probe_by_connect(port).await,
        }
    }
}

/// Connect-based readiness check.
pub async fn probe_by_connect(port: u16) -> io::Result<Listening> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match tokio::time::timeout(CONNECT_PROBE_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Ok(Listening::Yes { owner: None }),
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(Listening::No),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect probe timed out")),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SocketEntry {
    local_port: u16,
    listening: bool,
    inode: u64,
}

fn read_socket_table() -> io::Result<Vec<SocketEntry>> {
    let v4 = std::fs::read_to_string("/proc/net/tcp")?;
    let mut entries = parse_socket_table(&v4);
    // IPv6 may be disabled; the v4 table alone is still usable.
    if let Ok(v6) = std::fs::read_to_string("/proc/net/tcp6") {
        entries.extend(parse_socket_table(&v6));
    }
    Ok(entries)
}

fn parse_socket_table(text: &str) -> Vec<SocketEntry> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            let (_, port_hex) = fields[1].rsplit_once(':')?;
            Some(SocketEntry {
                local_port: u16::from_str_radix(port_hex, 16).ok()?,
                listening: fields[3] == TCP_LISTEN,
                inode: fields[9].parse().ok()?,
            })
        })
        .collect()
}

/// Find the pid whose file descriptors include one of the socket inodes.
fn find_socket_owner(inodes: &[u64]) -> Option<u32> {
    let targets: Vec<String> = inodes.iter().map(|i| format!("socket:[{i}]")).collect();
    let proc_dir = std::fs::read_dir("/proc").ok()?;

    for entry in proc_dir.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        // Processes we may not inspect are skipped.
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            if let Ok(link) = std::fs::read_link(fd.path()) {
                if targets.iter().any(|t| link.as_os_str() == t.as_str()) {
                    return Some(pid);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 123456 1 0000000000000000 100 0 0 10 0
   1: 0100007F:D431 0100007F:1F90 01 00000000:00000000 00:00000000 00000000  1000        0 654321 1 0000000000000000 20 4 30 10 -1
";

    #[test]
    fn parses_socket_table() {
        let entries = parse_socket_table(SAMPLE);
        assert_eq!(
            entries,
            vec![
                SocketEntry { local_port: 8080, listening: true, inode: 123456 },
                SocketEntry { local_port: 54321, listening: false, inode: 654321 },
            ]
        );
    }

    #[test]
    fn explicit_port_is_validated() {
        assert_eq!(PortProbe::Connect.select_port(Some(5000)).unwrap(), 5000);
        let err = PortProbe::Connect.select_port(Some(80)).unwrap_err();
        assert!(err.is_critical());
    }

    #[test]
    fn random_port_is_in_range() {
        for probe in [PortProbe::Connect, PortProbe::detect()] {
            let port = probe.select_port(None).unwrap();
            assert!((MIN_PORT..=MAX_PORT).contains(&port));
        }
    }

    #[tokio::test]
    async fn connect_probe_treats_refused_as_not_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(matches!(probe_by_connect(port).await.unwrap(), Listening::Yes { .. }));

        drop(listener);
        assert_eq!(probe_by_connect(port).await.unwrap(), Listening::No);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn socket_table_reports_owner() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let listening = PortProbe::SocketTable.probe(port).await.unwrap();
        assert_eq!(listening, Listening::Yes { owner: Some(std::process::id()) });

        drop(listener);
        assert_eq!(PortProbe::SocketTable.probe(port).await.unwrap(), Listening::No);
    }
}
