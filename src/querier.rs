//! Probes one server address over the GameSpy1 protocol, with port-23000
//! fallback — spec.md §4.2.
//!
//! The wire decoder itself is out of scope (spec.md §1); `GameSpyClient` is
//! the trait boundary an actual decoder plugs into, and `UdpGameSpyClient`
//! is a socket-backed implementation sufficient to exercise the fallback,
//! timeout, and error-classification behavior this spec cares about.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::model::{Address, RawProbeResult};

const STANDARD_QUERY_PORT: u16 = 23000;

#[derive(Debug, Error)]
pub enum QuerierError {
    #[error("query timed out")]
    Timeout,
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed GameSpy1 response")]
    Protocol,
}

/// The boundary the GameSpy1 wire decoder implements — spec.md §6 "Wire
/// protocol". Kept as a trait so the scheduler and its tests never depend
/// on real UDP I/O.
#[async_trait]
pub trait GameSpyClient: Send + Sync {
    async fn get_status(
        &self,
        ip: IpAddr,
        port: u16,
        timeout: Duration,
    ) -> Result<RawProbeResult, QuerierError>;
}

/// Queries `(ip, port)`, falling back to the standard query port 23000 on
/// failure when the original port wasn't already 23000 — spec.md §4.2.
/// Never retries beyond that single fallback: a missed probe is the unit
/// of failure the Scheduler and Store Adapter account for.
pub struct Querier<C> {
    client: C,
}

impl<C: GameSpyClient> Querier<C> {
    pub fn new(client: C) -> Self {
        Querier { client }
    }

    pub async fn query(&self, addr: Address, total_timeout: Duration) -> Option<RawProbeResult> {
        let per_attempt = total_timeout / 2;

        let primary_err = match self.client.get_status(addr.ip, addr.port, per_attempt).await {
            Ok(result) => return Some(result),
            Err(e) => e,
        };

        if addr.port == STANDARD_QUERY_PORT {
            warn!("query for {} failed with {}: {}", addr, kind(&primary_err), primary_err);
            return None;
        }

        match self
            .client
            .get_status(addr.ip, STANDARD_QUERY_PORT, per_attempt)
            .await
        {
            Ok(result) => {
                info!(
                    "primary query for {} failed with {}; fallback to {} succeeded",
                    addr, kind(&primary_err), STANDARD_QUERY_PORT
                );
                Some(result)
            }
            Err(fallback_err) => {
                warn!(
                    "fallback query failed for {} via {} with {}: {}",
                    addr, STANDARD_QUERY_PORT, kind(&fallback_err), fallback_err
                );
                warn!(
                    "primary query for {} previously failed with {}: {}",
                    addr, kind(&primary_err), primary_err
                );
                None
            }
        }
    }
}

fn kind(e: &QuerierError) -> &'static str {
    match e {
        QuerierError::Timeout => "Timeout",
        QuerierError::Io(_) => "IoError",
        QuerierError::Protocol => "ProtocolError",
    }
}

/// A minimal real client: sends the GameSpy1 `\\status\\` query and parses
/// the `\\key\\value\\...` response into `info`, splitting out
/// `player_N_*`/`team_N_*`-prefixed keys into per-player maps. Good enough
/// to exercise the Querier's retry/timeout contract; a production decoder
/// would replace the parsing here without touching the trait boundary.
pub struct UdpGameSpyClient;

#[async_trait]
impl GameSpyClient for UdpGameSpyClient {
    async fn get_status(
        &self,
        ip: IpAddr,
        port: u16,
        per_attempt: Duration,
    ) -> Result<RawProbeResult, QuerierError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect((ip, port)).await?;
        socket.send(b"\\status\\").await?;

        let mut buf = vec![0u8; 8192];
        let n = timeout(per_attempt, socket.recv(&mut buf))
            .await
            .map_err(|_| QuerierError::Timeout)??;

        parse_gamespy1_status(&buf[..n])
    }
}

fn parse_gamespy1_status(bytes: &[u8]) -> Result<RawProbeResult, QuerierError> {
    let text = String::from_utf8_lossy(bytes);
    let tokens: Vec<&str> = text.split('\\').filter(|s| !s.is_empty()).collect();
    if tokens.len() < 2 || tokens.len() % 2 != 0 {
        return Err(QuerierError::Protocol);
    }

    let mut info = HashMap::new();
    let mut players: HashMap<u32, HashMap<String, String>> = HashMap::new();

    for pair in tokens.chunks(2) {
        let (key, value) = (pair[0], pair[1]);
        if let Some((field, idx)) = split_player_key(key) {
            players.entry(idx).or_default().insert(field, value.to_string());
        } else {
            info.insert(key.to_string(), value.to_string());
        }
    }

    let mut indices: Vec<u32> = players.keys().copied().collect();
    indices.sort_unstable();
    let players = indices
        .into_iter()
        .filter_map(|i| players.remove(&i))
        .collect();

    Ok(RawProbeResult { info, players })
}

/// Splits a GameSpy1 per-player key like `player_3` or `score_3` into its
/// field name and player index.
fn split_player_key(key: &str) -> Option<(String, u32)> {
    let (field, idx) = key.rsplit_once('_')?;
    let idx: u32 = idx.parse().ok()?;
    Some((field.to_string(), idx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedClient {
        calls: AtomicUsize,
        responses: Mutex<Vec<(u16, Result<RawProbeResult, QuerierError>)>>,
    }

    fn success() -> RawProbeResult {
        RawProbeResult {
            info: HashMap::from([("hostname".to_string(), "test".to_string())]),
            players: vec![],
        }
    }

    #[async_trait]
    impl GameSpyClient for ScriptedClient {
        async fn get_status(
            &self,
            _ip: IpAddr,
            port: u16,
            _timeout: Duration,
        ) -> Result<RawProbeResult, QuerierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            let (expected_port, result) = responses.remove(0);
            assert_eq!(expected_port, port);
            result
        }
    }

    fn addr(port: u16) -> Address {
        Address::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), port)
    }

    #[tokio::test]
    async fn primary_success_never_falls_back() {
        let client = ScriptedClient {
            calls: AtomicUsize::new(0),
            responses: Mutex::new(vec![(14567, Ok(success()))]),
        };
        let q = Querier::new(client);
        let result = q.query(addr(14567), Duration::from_secs(4)).await;
        assert!(result.is_some());
        assert_eq!(q.client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn primary_failure_falls_back_to_23000() {
        let client = ScriptedClient {
            calls: AtomicUsize::new(0),
            responses: Mutex::new(vec![
                (14567, Err(QuerierError::Timeout)),
                (23000, Ok(success())),
            ]),
        };
        let q = Querier::new(client);
        let result = q.query(addr(14567), Duration::from_secs(4)).await;
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn port_23000_primary_failure_is_not_retried() {
        let client = ScriptedClient {
            calls: AtomicUsize::new(0),
            responses: Mutex::new(vec![(23000, Err(QuerierError::Timeout))]),
        };
        let q = Querier::new(client);
        let result = q.query(addr(23000), Duration::from_secs(4)).await;
        assert!(result.is_none());
        assert_eq!(q.client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn both_attempts_failing_yields_none() {
        let client = ScriptedClient {
            calls: AtomicUsize::new(0),
            responses: Mutex::new(vec![
                (14567, Err(QuerierError::Timeout)),
                (23000, Err(QuerierError::Protocol)),
            ]),
        };
        let q = Querier::new(client);
        let result = q.query(addr(14567), Duration::from_secs(4)).await;
        assert!(result.is_none());
    }

    #[test]
    fn parses_gamespy1_status_into_info_and_players() {
        let raw = b"\\hostname\\My Server\\mapname\\berlin\\numplayers\\1\\player_0\\Alice\\score_0\\10\\";
        let parsed = parse_gamespy1_status(raw).unwrap();
        assert_eq!(parsed.info.get("hostname").unwrap(), "My Server");
        assert_eq!(parsed.players.len(), 1);
        assert_eq!(parsed.players[0].get("player").unwrap(), "Alice");
        assert_eq!(parsed.players[0].get("score").unwrap(), "10");
    }
}
