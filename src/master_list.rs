//! Fetches the authoritative server address list — spec.md §4.7.
//!
//! Grounded on `original_source/engine/master_list.py` (a single
//! session-reused `aiohttp` GET), translated to the teacher's periodic
//! discovery shape (`resolver.rs`/`namerd.rs`: one client, one URL, called
//! on a cycle by the scheduler).

use std::net::IpAddr;
use std::time::Duration;

use log::warn;
use thiserror::Error;

use crate::model::Address;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum MasterListError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// A thin wrapper over a reused `reqwest::Client`, matching the teacher's
/// "one client, reused across calls" pattern for discovery (and the
/// Python prototype's module-level `aiohttp.ClientSession`).
pub struct MasterListClient {
    http: reqwest::Client,
    url: String,
}

impl MasterListClient {
    pub fn new(url: impl Into<String>) -> Self {
        MasterListClient {
            http: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .expect("reqwest client build is infallible with no TLS config overrides"),
            url: url.into(),
        }
    }

    /// Fetches and parses the master list. A transport/HTTP-level failure
    /// is a `MasterListError` (triggers the scheduler's exponential
    /// backoff); a response that merely contains no valid entries is
    /// `Ok(vec![])`, which is *not* a fetch failure (spec.md §4.7).
    pub async fn fetch_servers(&self) -> Result<Vec<Address>, MasterListError> {
        let body: serde_json::Value = self.http.get(&self.url).send().await?.json().await?;
        Ok(parse_entries(&body))
    }
}

/// Accepts only 2-element `[ip, port]` arrays with a numeric port;
/// anything else (wrong arity, non-array element, non-numeric port) is
/// dropped silently — spec.md §4.7/§7 ParseError.
fn parse_entries(body: &serde_json::Value) -> Vec<Address> {
    let Some(entries) = body.as_array() else {
        warn!("master list response was not a JSON array; treating as empty");
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let pair = entry.as_array()?;
            if pair.len() != 2 {
                return None;
            }
            let ip: IpAddr = pair[0].as_str()?.parse().ok()?;
            let port: u16 = match &pair[1] {
                serde_json::Value::Number(n) => u16::try_from(n.as_u64()?).ok()?,
                serde_json::Value::String(s) => s.parse().ok()?,
                _ => return None,
            };
            Some(Address::new(ip, port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_well_formed_pairs() {
        let body = json!([["1.2.3.4", "14567"], ["5.6.7.8", 14568]]);
        let parsed = parse_entries(&body);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].port, 14567);
        assert_eq!(parsed[1].port, 14568);
    }

    #[test]
    fn drops_malformed_entries_silently() {
        let body = json!([
            ["1.2.3.4", "14567"],
            "not-an-array",
            ["only-one-element"],
            ["1.2.3.4", "not-a-port"],
            ["1.2.3.4", "14567", "extra"],
        ]);
        let parsed = parse_entries(&body);
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn non_array_top_level_yields_empty_not_a_failure() {
        let body = json!({"error": "nope"});
        assert!(parse_entries(&body).is_empty());
    }
}
