//! Checks whether the expected players reached a game server

use crate::error::{MatchmakingError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

/// Server connection probe
#[async_trait]
pub trait ServerProbe: Send + Sync {
    /// Human players currently on the server
    async fn connected_players(&self, ip: &str, port: u16) -> Result<usize>;

    async fn are_all_players_connected(&self, ip: &str, port: u16, expected: usize) -> Result<bool> {
        let connected = self.connected_players(ip, port).await?;
        debug!("{}:{} has {}/{} players", ip, port, connected, expected);
        Ok(connected >= expected)
    }
}

const A2S_INFO_REQUEST: &[u8] = b"\xFF\xFF\xFF\xFFTSource Engine Query\0";
const HEADER_SIMPLE: [u8; 4] = [0xFF; 4];
const S2A_INFO: u8 = 0x49;
const S2C_CHALLENGE: u8 = 0x41;

/// Source engine `A2S_INFO` query over UDP
#[derive(Debug, Clone)]
pub struct A2sServerProbe {
    timeout: Duration,
}

impl A2sServerProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exchange(&self, socket: &UdpSocket, request: &[u8]) -> Result<Vec<u8>> {
        socket.send(request).await?;
        let mut buf = vec![0u8; 1400];
        let len = timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| MatchmakingError::HostingApiError {
                message: format!("A2S query timed out after {:?}", self.timeout),
            })??;
        buf.truncate(len);
        Ok(buf)
    }
}

impl Default for A2sServerProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl ServerProbe for A2sServerProbe {
    async fn connected_players(&self, ip: &str, port: u16) -> Result<usize> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((ip, port)).await?;

        let mut response = self.exchange(&socket, A2S_INFO_REQUEST).await?;
        if let Some(challenge) = parse_challenge(&response) {
            // Newer servers answer the first query with a challenge to echo back
            let mut request = A2S_INFO_REQUEST.to_vec();
            request.extend_from_slice(&challenge);
            response = self.exchange(&socket, &request).await?;
        }

        let info = parse_info(&response)?;
        Ok(info.players.saturating_sub(info.bots) as usize)
    }
}

fn parse_challenge(packet: &[u8]) -> Option<[u8; 4]> {
    if packet.len() >= 9 && packet[..4] == HEADER_SIMPLE && packet[4] == S2C_CHALLENGE {
        let mut challenge = [0u8; 4];
        challenge.copy_from_slice(&packet[5..9]);
        Some(challenge)
    } else {
        None
    }
}

/// Player counts from an `A2S_INFO` reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfo {
    pub players: u8,
    pub max_players: u8,
    pub bots: u8,
}

fn malformed(what: &str) -> anyhow::Error {
    MatchmakingError::HostingApiError {
        message: format!("Malformed A2S_INFO reply: {}", what),
    }
    .into()
}

fn parse_info(packet: &[u8]) -> Result<ServerInfo> {
    if packet.len() < 6 || packet[..4] != HEADER_SIMPLE || packet[4] != S2A_INFO {
        return Err(malformed("bad header"));
    }

    // protocol byte, then name, map, folder and game as C strings
    let mut pos = 6;
    for _ in 0..4 {
        let end = packet[pos..]
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| malformed("unterminated string"))?;
        pos += end + 1;
    }

    // app id (u16), players, max players, bots
    let counts = packet
        .get(pos + 2..pos + 5)
        .ok_or_else(|| malformed("truncated player counts"))?;
    Ok(ServerInfo {
        players: counts[0],
        max_players: counts[1],
        bots: counts[2],
    })
}

/// Probe with canned answers, for tests and the simulator
#[derive(Debug, Default)]
pub struct StaticServerProbe {
    default_players: AtomicUsize,
    per_server: Mutex<HashMap<(String, u16), usize>>,
    failing: AtomicBool,
}

impl StaticServerProbe {
    pub fn new(default_players: usize) -> Self {
        Self {
            default_players: AtomicUsize::new(default_players),
            ..Self::default()
        }
    }

    pub fn set_default_players(&self, players: usize) {
        self.default_players.store(players, Ordering::SeqCst);
    }

    pub fn set_players(&self, ip: &str, port: u16, players: usize) {
        if let Ok(mut per_server) = self.per_server.lock() {
            per_server.insert((ip.to_string(), port), players);
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ServerProbe for StaticServerProbe {
    async fn connected_players(&self, ip: &str, port: u16) -> Result<usize> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MatchmakingError::HostingApiError {
                message: format!("{}:{} did not answer", ip, port),
            }
            .into());
        }
        let per_server = self
            .per_server
            .lock()
            .map_err(|_| MatchmakingError::lock_poisoned("probe"))?;
        Ok(per_server
            .get(&(ip.to_string(), port))
            .copied()
            .unwrap_or_else(|| self.default_players.load(Ordering::SeqCst)))
    }
}
