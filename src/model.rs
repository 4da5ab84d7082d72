//! The data model shared by the scheduler, diff engine, and store adapter.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The (ip, port) pair that identifies a game server. Serves as the
/// scheduler's identity key; its canonical string form is `"ip:port"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub ip: IpAddr,
    pub port: u16,
}

impl Address {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Address { ip, port }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    /// Parses the canonical `"ip:port"` form. Used by the exclusion cache
    /// to admit both tuple and string forms of `server_id` exclusions.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = s.rsplit_once(':').ok_or(AddressParseError)?;
        let ip: IpAddr = ip.parse().map_err(|_| AddressParseError)?;
        let port: u16 = port.parse().map_err(|_| AddressParseError)?;
        Ok(Address { ip, port })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AddressParseError;

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not a valid \"ip:port\" address")
    }
}

impl std::error::Error for AddressParseError {}

/// The three disjoint exclusion sets of spec.md §3/§4.6. Replaced as a
/// whole; never partially mutated (invariant: atomic replacement).
#[derive(Debug, Default, Clone)]
pub struct Exclusions {
    pub gametype: HashSet<String>,
    pub player_name: HashSet<String>,
    /// Holds both the literal `"ip:port"` string and the parsed `Address`
    /// for every server_id exclusion whose value parses; unparsable
    /// legacy values are kept only as their original string.
    pub server_id: HashSet<ServerIdKey>,
}

/// A `server_id` exclusion may be tested by address or by raw string —
/// see spec.md §4.6. `ServerIdKey` is the union of both admissible forms
/// so a `HashSet<ServerIdKey>` can be probed with either.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerIdKey {
    Addr(Address),
    Raw(String),
}

impl Exclusions {
    pub fn is_gametype_excluded(&self, gametype: &str) -> bool {
        self.gametype.contains(gametype)
    }

    pub fn is_player_excluded(&self, name: &str) -> bool {
        self.player_name.contains(name)
    }

    pub fn is_server_excluded(&self, addr: Address) -> bool {
        self.server_id.contains(&ServerIdKey::Addr(addr))
            || self.server_id.contains(&ServerIdKey::Raw(addr.to_string()))
    }

    /// Inserts a `server_id` exclusion value, admitting it under every form
    /// callers might test it with (spec.md §4.6).
    pub fn insert_server_id(&mut self, value: &str) {
        match value.parse::<Address>() {
            Ok(addr) => {
                self.server_id.insert(ServerIdKey::Addr(addr));
                self.server_id.insert(ServerIdKey::Raw(addr.to_string()));
            }
            Err(_) => {
                self.server_id.insert(ServerIdKey::Raw(value.to_string()));
            }
        }
    }
}

/// The payload of a successful probe attempt — spec.md §3 "Raw Probe
/// Result" success arm. The failure arm is represented by
/// `Err(QuerierError)` at the call site rather than folded into this type,
/// since spec.md §4.2 treats a failed probe as a single, un-detailed unit
/// ("a single missed probe is the failure unit").
#[derive(Debug, Clone)]
pub struct RawProbeResult {
    pub info: std::collections::HashMap<String, String>,
    pub players: Vec<std::collections::HashMap<String, String>>,
}

/// A player record normalized out of a probe's raw player rows. Integer
/// fields are coerced to 0 on missing/empty/non-numeric input (invariant
/// D1 in spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedPlayer {
    pub name: String,
    pub keyhash: Option<String>,
    pub score: i64,
    pub ping: i64,
    pub team: i64,
    pub kills: i64,
    pub deaths: i64,
}

impl NormalizedPlayer {
    pub fn name_norm(&self) -> String {
        self.name.to_lowercase()
    }

    /// Builds a `NormalizedPlayer` from one raw GameSpy1 player row,
    /// coercing missing/empty/non-numeric integer fields to 0 (invariant
    /// D1) and defaulting a missing name to `"N/A"` (spec.md §4.4, mirrors
    /// `original_source/engine/data_processor.py`'s `p.get('player', 'N/A')`).
    pub fn from_raw(raw: &std::collections::HashMap<String, String>) -> Self {
        NormalizedPlayer {
            name: raw.get("player").cloned().unwrap_or_else(|| "N/A".to_string()),
            keyhash: raw.get("keyhash").cloned(),
            score: coerce_int(raw.get("score")),
            ping: coerce_int(raw.get("ping")),
            team: coerce_int(raw.get("team")),
            kills: coerce_int(raw.get("kills")),
            deaths: coerce_int(raw.get("deaths")),
        }
    }
}

/// `normalized_data` persisted alongside every snapshot — spec.md §3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedSnapshotData {
    pub mapname: String,
    pub players: Vec<NormalizedPlayer>,
}

/// `raw_payload` persisted alongside every snapshot, preserved verbatim as
/// received — spec.md §3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSnapshotPayload {
    pub info: std::collections::HashMap<String, String>,
    pub players: Vec<std::collections::HashMap<String, String>>,
}

/// Coerces a possibly-missing, possibly-empty, possibly-non-numeric string
/// field to an integer default of 0 — spec.md §3 invariant D1, §4.1's
/// `numplayers`/`roundtimeremain` parsing.
pub fn coerce_int(value: Option<&String>) -> i64 {
    match value {
        None => 0,
        Some(s) if s.is_empty() => 0,
        Some(s) => s.trim().parse().unwrap_or(0),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Online,
    Offline,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Online => "online",
            ServerStatus::Offline => "offline",
        }
    }
}

/// A timestamp truncated to whole seconds, matching the Python
/// prototype's `datetime.now(timezone.utc).replace(microsecond=0)`.
pub fn now_truncated() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(Utc::now().timestamp(), 0).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_canonical_string() {
        let a: Address = "1.2.3.4:14567".parse().unwrap();
        assert_eq!(a.to_string(), "1.2.3.4:14567");
    }

    #[test]
    fn address_parse_rejects_garbage() {
        assert!("not-an-address".parse::<Address>().is_err());
        assert!("1.2.3.4:notaport".parse::<Address>().is_err());
    }

    #[test]
    fn exclusions_insert_server_id_admits_both_forms() {
        let mut ex = Exclusions::default();
        ex.insert_server_id("1.2.3.4:14567");
        let addr: Address = "1.2.3.4:14567".parse().unwrap();
        assert!(ex.is_server_excluded(addr));
    }

    #[test]
    fn exclusions_insert_server_id_keeps_unparsable_values_as_string_only() {
        let mut ex = Exclusions::default();
        ex.insert_server_id("legacy-entry");
        assert!(ex.server_id.contains(&ServerIdKey::Raw("legacy-entry".to_string())));
    }

    #[test]
    fn coerce_int_defaults_on_missing_empty_or_non_numeric() {
        assert_eq!(coerce_int(None), 0);
        assert_eq!(coerce_int(Some(&"".to_string())), 0);
        assert_eq!(coerce_int(Some(&"not-a-number".to_string())), 0);
        assert_eq!(coerce_int(Some(&"42".to_string())), 42);
    }
}
