//! Computes joined/left player sets between two snapshots and derives the
//! session open/close writes — spec.md §4.3.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::model::{Exclusions, NormalizedPlayer};

/// One session-table mutation derived from a poll's player diff. The
/// Store Adapter executes these inside the same transaction that writes
/// the triggering snapshot/failure row (spec.md §4.4/§4.5, "session
/// update must be committed before or atomically with returning").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionWrite {
    /// Close every open session for `(server, name_norm)` at `at`.
    Close { name_norm: String, at: DateTime<Utc> },
    /// Open a new session for the raw (un-normalized) name.
    Open {
        name: String,
        name_norm: String,
        keyhash: Option<String>,
        at: DateTime<Utc>,
    },
}

/// Indexes a player list by lower-cased name. If two players share a
/// normalized name, the later one in input order wins (arbitrary but
/// deterministic — spec.md §4.3).
fn index_by_name(players: &[NormalizedPlayer]) -> HashMap<String, &NormalizedPlayer> {
    let mut index = HashMap::with_capacity(players.len());
    for player in players {
        index.insert(player.name_norm(), player);
    }
    index
}

/// Filters `player_name` exclusions out of a player list before diffing —
/// spec.md §4.3 "Both lists are filtered through player_name exclusions
/// before diffing".
pub fn filter_excluded_players(
    players: &[NormalizedPlayer],
    exclusions: &Exclusions,
) -> Vec<NormalizedPlayer> {
    players
        .iter()
        .filter(|p| !exclusions.is_player_excluded(&p.name))
        .cloned()
        .collect()
}

/// Diffs two already-exclusion-filtered player lists and returns the
/// session writes, in the mandated close-before-open order (spec.md §4.3:
/// "Close-before-open ensures invariant S1 even if a name leaves and
/// rejoins within one poll cycle").
pub fn diff_sessions(
    prev_players: &[NormalizedPlayer],
    curr_players: &[NormalizedPlayer],
    at: DateTime<Utc>,
) -> Vec<SessionWrite> {
    let prev_index = index_by_name(prev_players);
    let curr_index = index_by_name(curr_players);

    let prev_names: HashSet<&String> = prev_index.keys().collect();
    let curr_names: HashSet<&String> = curr_index.keys().collect();

    let mut writes = Vec::new();

    for name_norm in prev_names.difference(&curr_names) {
        writes.push(SessionWrite::Close {
            name_norm: (*name_norm).clone(),
            at,
        });
    }

    for name_norm in curr_names.difference(&prev_names) {
        let player = curr_index[*name_norm];
        writes.push(SessionWrite::Open {
            name: player.name.clone(),
            name_norm: (*name_norm).clone(),
            keyhash: player.keyhash.clone(),
            at,
        });
    }

    writes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(name: &str) -> NormalizedPlayer {
        NormalizedPlayer {
            name: name.to_string(),
            keyhash: Some("abc".to_string()),
            score: 0,
            ping: 0,
            team: 0,
            kills: 0,
            deaths: 0,
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn new_player_opens_a_session() {
        let writes = diff_sessions(&[], &[player("Alice")], ts(0));
        assert_eq!(
            writes,
            vec![SessionWrite::Open {
                name: "Alice".to_string(),
                name_norm: "alice".to_string(),
                keyhash: Some("abc".to_string()),
                at: ts(0),
            }]
        );
    }

    #[test]
    fn departed_player_closes_a_session() {
        let writes = diff_sessions(&[player("Alice")], &[], ts(0));
        assert_eq!(
            writes,
            vec![SessionWrite::Close {
                name_norm: "alice".to_string(),
                at: ts(0),
            }]
        );
    }

    #[test]
    fn steady_state_produces_no_writes() {
        let writes = diff_sessions(&[player("Alice")], &[player("Alice")], ts(0));
        assert!(writes.is_empty());
    }

    #[test]
    fn rejoin_within_one_cycle_closes_then_opens() {
        // prev=[Alice], curr=[Bob] — Alice left, Bob joined in the same poll.
        let writes = diff_sessions(&[player("Alice")], &[player("Bob")], ts(5));
        assert_eq!(writes.len(), 2);
        assert!(writes.contains(&SessionWrite::Close {
            name_norm: "alice".to_string(),
            at: ts(5),
        }));
        assert!(writes.iter().any(|w| matches!(
            w,
            SessionWrite::Open { name_norm, .. } if name_norm == "bob"
        )));
    }

    #[test]
    fn matching_is_case_insensitive_on_name() {
        let writes = diff_sessions(&[player("Alice")], &[player("ALICE")], ts(0));
        assert!(writes.is_empty());
    }

    #[test]
    fn excluded_players_are_filtered_before_diffing() {
        let mut exclusions = Exclusions::default();
        exclusions.player_name.insert("Bot".to_string());
        let filtered = filter_excluded_players(&[player("Alice"), player("Bot")], &exclusions);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "Alice");
    }
}
