//! Transactional persistence of server rows, snapshots, and player
//! sessions — spec.md §4.4/§4.5.
//!
//! Grounded on `original_source/engine/database.py` (pool lifecycle) and
//! `engine/data_processor.py` (upsert/dedup/session logic), executed
//! against a `bb8`-pooled `tokio-postgres` connection — the same pairing
//! `petabi-review-database` uses (`bb8-postgres` + serde_json + chrono
//! features). Schema DDL and the derived `rounds`/materialized-view layer
//! are out of scope (spec.md §1) — this module assumes the tables named in
//! spec.md §6 already exist.

use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use chrono::{DateTime, Utc};
use log::debug;
use thiserror::Error;
use tokio_postgres::NoTls;

use crate::diff::{self, SessionWrite};
use crate::model::{Address, Exclusions, NormalizedPlayer, NormalizedSnapshotData, RawProbeResult, RawSnapshotPayload};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),
    #[error("database pool error: {0}")]
    Pool(#[from] bb8::RunError<tokio_postgres::Error>),
}

pub struct Store {
    pool: Pool<PostgresConnectionManager<NoTls>>,
}

impl Store {
    /// Establishes the connection pool. A failure here is fatal at
    /// startup (spec.md §7 `StoreFatalError`) — the caller is expected to
    /// log and exit rather than retry.
    pub async fn connect(dsn: &str) -> Result<Self, StoreError> {
        let manager = PostgresConnectionManager::new_from_stringlike(dsn, NoTls)
            .map_err(StoreError::Db)?;
        let pool = Pool::builder().build(manager).await.map_err(StoreError::Db)?;
        Ok(Store { pool })
    }

    /// All addresses the store already knows about — used to seed the
    /// scheduler's Known-Set (spec.md §4.1 "Seeding").
    pub async fn known_addresses(&self) -> Result<Vec<Address>, StoreError> {
        let conn = self.pool.get().await?;
        let rows = conn.query("SELECT ip, port FROM servers;", &[]).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let ip: String = row.get("ip");
                let port: i32 = row.get("port");
                Address::new(ip.parse().ok()?, u16::try_from(port).ok()?).into()
            })
            .collect())
    }

    /// Reloads every exclusion row into a fresh `Exclusions` set — spec.md
    /// §4.6.
    pub async fn load_exclusions(&self) -> Result<Exclusions, StoreError> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT type, value, server_ip, server_port FROM exclusions;",
                &[],
            )
            .await?;

        let mut exclusions = Exclusions::default();
        for row in rows {
            let exclusion_type: String = row.get("type");
            let value: String = row.get("value");
            match exclusion_type.as_str() {
                "gametype" => {
                    exclusions.gametype.insert(value);
                }
                "player_name" => {
                    exclusions.player_name.insert(value);
                }
                "server_id" => {
                    let server_ip: Option<String> = row.get("server_ip");
                    let server_port: Option<i32> = row.get("server_port");
                    match (server_ip, server_port) {
                        (Some(ip), Some(port)) => {
                            exclusions.insert_server_id(&format!("{}:{}", ip, port))
                        }
                        _ => exclusions.insert_server_id(&value),
                    }
                }
                _ => {}
            }
        }
        Ok(exclusions)
    }

    /// On-success ingestion path — spec.md §4.4. Returns the `info.*`
    /// fields needed by the scheduler's next-delay policy so the caller
    /// doesn't have to re-parse the raw probe result.
    pub async fn record_success(
        &self,
        addr: Address,
        raw: RawProbeResult,
        exclusions: &Exclusions,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if exclusions.is_server_excluded(addr) {
            debug!("skipping {} because it is excluded by server ID", addr);
            return Ok(());
        }
        let gametype = raw.info.get("gametype").cloned().unwrap_or_else(|| "N/A".to_string());
        if exclusions.is_gametype_excluded(&gametype) {
            debug!("skipping {} due to excluded gametype {:?}", addr, gametype);
            return Ok(());
        }

        let normalized_players: Vec<NormalizedPlayer> = raw
            .players
            .iter()
            .map(NormalizedPlayer::from_raw)
            .collect();
        let normalized_players = diff::filter_excluded_players(&normalized_players, exclusions);

        let hostname = raw.info.get("hostname").cloned().unwrap_or_else(|| "N/A".to_string());
        let mapname = raw.info.get("mapname").cloned().unwrap_or_else(|| "N/A".to_string()).to_lowercase();
        let active_mod = raw.info.get("active_mods").cloned().unwrap_or_else(|| "N/A".to_string());

        let mut info_to_save = serde_json::to_value(&raw.info).unwrap_or(serde_json::Value::Null);
        if let serde_json::Value::Object(ref mut map) = info_to_save {
            map.insert("players".to_string(), serde_json::to_value(&normalized_players).unwrap());
        }

        let mut conn = self.pool.get().await?;
        let txn = conn.transaction().await?;

        let row = txn
            .query_one(
                "INSERT INTO servers (ip, port, hostname, status, last_seen, first_seen, consecutive_failures, active_mod, gametype, info)
                 VALUES ($1, $2, $3, 'online', $4, $4, 0, $5, $6, $7)
                 ON CONFLICT (ip, port) DO UPDATE SET
                    hostname = EXCLUDED.hostname, status = 'online', last_seen = EXCLUDED.last_seen,
                    consecutive_failures = 0, active_mod = EXCLUDED.active_mod,
                    gametype = EXCLUDED.gametype, info = EXCLUDED.info
                 RETURNING id;",
                &[
                    &addr.ip.to_string(),
                    &i32::from(addr.port),
                    &hostname,
                    &timestamp,
                    &active_mod,
                    &gametype,
                    &info_to_save,
                ],
            )
            .await?;
        let server_id: i32 = row.get("id");

        if mapname != "n/a" {
            txn.execute(
                "INSERT INTO unique_maps (id) VALUES ($1) ON CONFLICT DO NOTHING;",
                &[&mapname],
            )
            .await?;
        }

        let prev = txn
            .query_opt(
                "SELECT data, raw FROM server_snapshots WHERE server_id = $1 ORDER BY timestamp DESC LIMIT 1;",
                &[&server_id],
            )
            .await?;

        let (prev_data, prev_raw): (Option<NormalizedSnapshotData>, Option<RawSnapshotPayload>) =
            match prev {
                Some(row) => {
                    let data: serde_json::Value = row.get("data");
                    let raw: serde_json::Value = row.get("raw");
                    (
                        serde_json::from_value(data).ok(),
                        serde_json::from_value(raw).ok(),
                    )
                }
                None => (None, None),
            };

        let prev_players = prev_data.as_ref().map(|d| d.players.clone()).unwrap_or_default();

        // Session writes advance regardless of whether a new snapshot row
        // is inserted below (spec.md §4.4).
        for write in diff::diff_sessions(&prev_players, &normalized_players, timestamp) {
            apply_session_write(&txn, server_id, write).await?;
        }

        let normalized_data = NormalizedSnapshotData {
            mapname,
            players: normalized_players,
        };
        let raw_payload = RawSnapshotPayload {
            info: raw.info,
            players: raw.players,
        };

        let unchanged = prev_data.as_ref() == Some(&normalized_data) && prev_raw.as_ref() == Some(&raw_payload);
        if unchanged {
            debug!("skipping snapshot insert for {}; data unchanged", addr);
        } else {
            txn.execute(
                "INSERT INTO server_snapshots (server_id, timestamp, data, raw) VALUES ($1, $2, $3, $4);",
                &[
                    &server_id,
                    &timestamp,
                    &serde_json::to_value(&normalized_data).unwrap(),
                    &serde_json::to_value(&raw_payload).unwrap(),
                ],
            )
            .await?;
        }

        txn.commit().await?;
        Ok(())
    }

    /// Failure ingestion path — spec.md §4.5.
    pub async fn record_failure(
        &self,
        addr: Address,
        timestamp: DateTime<Utc>,
        threshold: u32,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        let txn = conn.transaction().await?;

        let row = txn
            .query_one(
                "INSERT INTO servers (ip, port, status, last_seen, first_seen, consecutive_failures)
                 VALUES ($1, $2, 'offline', $3, $3, 1)
                 ON CONFLICT (ip, port) DO UPDATE SET
                    last_seen = EXCLUDED.last_seen,
                    consecutive_failures = servers.consecutive_failures + 1,
                    status = CASE
                        WHEN servers.consecutive_failures + 1 >= $4 THEN 'offline'
                        ELSE servers.status
                    END
                 RETURNING id, consecutive_failures, status;",
                &[&addr.ip.to_string(), &i32::from(addr.port), &timestamp, &(threshold as i32)],
            )
            .await?;

        let server_id: i32 = row.get("id");
        let consecutive_failures: i32 = row.get("consecutive_failures");

        if consecutive_failures >= threshold as i32 {
            let prev = txn
                .query_opt(
                    "SELECT data FROM server_snapshots WHERE server_id = $1 ORDER BY timestamp DESC LIMIT 1;",
                    &[&server_id],
                )
                .await?;
            let prev_players: Vec<NormalizedPlayer> = prev
                .and_then(|row| {
                    let data: serde_json::Value = row.get("data");
                    serde_json::from_value::<NormalizedSnapshotData>(data).ok()
                })
                .map(|d| d.players)
                .unwrap_or_default();

            for write in diff::diff_sessions(&prev_players, &[], timestamp) {
                apply_session_write(&txn, server_id, write).await?;
            }
        }

        txn.commit().await?;
        Ok(())
    }

    /// Refreshes the derived analytics view — spec.md §6 "the scheduler's
    /// only interaction is an optional periodic `REFRESH MATERIALIZED VIEW`
    /// call". The view itself lives in the store's own DDL, out of scope
    /// here.
    pub async fn refresh_materialized_views(&self) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        conn.execute("REFRESH MATERIALIZED VIEW mv_player_advanced_stats;", &[])
            .await?;
        Ok(())
    }
}

async fn apply_session_write(
    txn: &tokio_postgres::Transaction<'_>,
    server_id: i32,
    write: SessionWrite,
) -> Result<(), StoreError> {
    match write {
        SessionWrite::Close { name_norm, at } => {
            txn.execute(
                "UPDATE player_sessions SET leave_ts = $1
                 WHERE server_id = $2 AND player_name_norm = $3 AND leave_ts IS NULL;",
                &[&at, &server_id, &name_norm],
            )
            .await?;
        }
        SessionWrite::Open { name, name_norm, keyhash, at } => {
            txn.execute(
                "INSERT INTO player_sessions (server_id, player_name, player_name_norm, join_ts, keyhash)
                 VALUES ($1, $2, $3, $4, $5);",
                &[&server_id, &name, &name_norm, &at, &keyhash],
            )
            .await?;
        }
    }
    Ok(())
}
