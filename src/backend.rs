//! Backend pools as stored in the registry
//!
//! A pool is the list stored under a lookup key: an info record followed by
//! zero or more backend descriptors, each JSON encoded. Entries that do not
//! decode are kept as raw strings so one bad entry never hides a whole pool.

use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Display name given to every resolved backend
pub const BACKEND_DISPLAY_NAME: &str = "web.1";

/// Backend identifier. The registry stores either numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BackendId {
    Number(u64),
    Text(String),
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendId::Number(n) => write!(f, "{}", n),
            BackendId::Text(s) => f.write_str(s),
        }
    }
}

/// One decoded pool record. The info record and the backend descriptors
/// share this shape; the info record only uses the session fields.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolRecord {
    #[serde(default)]
    pub id: Option<BackendId>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub virtual_host: Option<String>,
    #[serde(default)]
    pub log_session: Option<String>,
    #[serde(default)]
    pub metric_session: Option<String>,
}

/// A pool entry: decoded when the JSON parsed, raw otherwise
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEntry {
    Decoded(PoolRecord),
    Raw(String),
}

impl PoolEntry {
    /// Decode a registry value, keeping the original text when it is not a
    /// JSON pool record
    pub fn parse(raw: String) -> Self {
        match serde_json::from_str::<PoolRecord>(&raw) {
            Ok(record) => PoolEntry::Decoded(record),
            Err(_) => PoolEntry::Raw(raw),
        }
    }

    pub fn as_record(&self) -> Option<&PoolRecord> {
        match self {
            PoolEntry::Decoded(record) => Some(record),
            PoolEntry::Raw(_) => None,
        }
    }
}

/// A resolved pool together with the dead-set read in the same round trip
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pool {
    /// `[info, backend, backend, ...]`
    pub entries: Vec<PoolEntry>,
    /// Quarantined backend ids for the requested frontend
    pub dead: HashSet<String>,
}

impl Pool {
    pub fn new(entries: Vec<PoolEntry>, dead: HashSet<String>) -> Self {
        Self { entries, dead }
    }

    /// Decode raw registry values
    pub fn from_raw(values: Vec<String>, dead: HashSet<String>) -> Self {
        Self::new(values.into_iter().map(PoolEntry::parse).collect(), dead)
    }

    /// The info record, if present and decodable
    pub fn info(&self) -> Option<&PoolRecord> {
        self.entries.first().and_then(PoolEntry::as_record)
    }

    /// Number of entries after the info record
    pub fn real_backend_count(&self) -> usize {
        self.entries.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Backends that can actually be proxied to, with their pool position.
    /// Raw entries and records without a host are skipped.
    pub fn candidates(&self) -> Vec<(usize, &PoolRecord)> {
        self.entries
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(index, entry)| {
                entry
                    .as_record()
                    .filter(|record| record.host.is_some())
                    .map(|record| (index, record))
            })
            .collect()
    }

    /// Candidates not in the dead-set. When every candidate is quarantined,
    /// all of them are returned so the frontend keeps being served.
    pub fn live_candidates(&self) -> Vec<(usize, &PoolRecord)> {
        let all = self.candidates();
        let live: Vec<_> = all
            .iter()
            .filter(|(_, record)| {
                record
                    .id
                    .as_ref()
                    .map(|id| !self.dead.contains(&id.to_string()))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        if live.is_empty() {
            all
        } else {
            live
        }
    }
}

/// A backend chosen for one request
#[derive(Debug, Clone, PartialEq)]
pub struct Backend {
    pub id: String,
    /// Position in the pool; the info record is 0
    pub index: usize,
    pub host: String,
    pub port: u16,
    pub virtual_host: Option<String>,
    /// The lookup key the request resolved from (the Host header)
    pub frontend: String,
    pub log_session: Option<String>,
    pub metric_session: Option<String>,
    pub name: String,
}

impl Backend {
    /// Build a backend from its pool record, decorated with the info
    /// record's metadata. Returns `None` for records without a host.
    pub fn from_record(
        index: usize,
        record: &PoolRecord,
        info: Option<&PoolRecord>,
        frontend: &str,
    ) -> Option<Self> {
        let host = record.host.clone()?;
        Some(Self {
            id: record
                .id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| index.to_string()),
            index,
            host,
            port: record.port.unwrap_or(80),
            virtual_host: info.and_then(|i| i.virtual_host.clone()),
            frontend: frontend.to_string(),
            log_session: info.and_then(|i| i.log_session.clone()),
            metric_session: info.and_then(|i| i.metric_session.clone()),
            name: BACKEND_DISPLAY_NAME.to_string(),
        })
    }

    /// `http://host:port`
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// `host:port`, for raw socket connections
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The first real backend of a pool is never quarantined
    pub fn is_protected(&self) -> bool {
        self.index <= 1
    }
}

/// Shared pool handle stored in the local cache
pub type SharedPool = Arc<Pool>;

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> String {
        r#"{"virtualHost":"shop","logSession":"log-1","metricSession":"metric-1"}"#.to_string()
    }

    #[test]
    fn test_parse_keeps_raw_entries() {
        let entry = PoolEntry::parse("not json".to_string());
        assert_eq!(entry, PoolEntry::Raw("not json".to_string()));

        let entry = PoolEntry::parse(r#"{"id":1,"host":"10.0.0.1","port":80}"#.to_string());
        let record = entry.as_record().unwrap();
        assert_eq!(record.id, Some(BackendId::Number(1)));
        assert_eq!(record.host.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_string_and_numeric_ids() {
        let record: PoolRecord = serde_json::from_str(r#"{"id":"abc","host":"h"}"#).unwrap();
        assert_eq!(record.id.unwrap().to_string(), "abc");

        let record: PoolRecord = serde_json::from_str(r#"{"id":42,"host":"h"}"#).unwrap();
        assert_eq!(record.id.unwrap().to_string(), "42");
    }

    #[test]
    fn test_real_backend_count() {
        let pool = Pool::from_raw(vec![info()], HashSet::new());
        assert_eq!(pool.real_backend_count(), 0);

        let pool = Pool::from_raw(
            vec![info(), r#"{"id":1,"host":"a"}"#.to_string(), "garbage".to_string()],
            HashSet::new(),
        );
        assert_eq!(pool.real_backend_count(), 2);
        // The raw entry counts toward the pool size but is never a candidate
        assert_eq!(pool.candidates().len(), 1);
        assert_eq!(pool.candidates()[0].0, 1);
    }

    #[test]
    fn test_live_candidates_skip_dead_ids() {
        let dead: HashSet<String> = ["2".to_string()].into_iter().collect();
        let pool = Pool::from_raw(
            vec![
                info(),
                r#"{"id":1,"host":"a"}"#.to_string(),
                r#"{"id":2,"host":"b"}"#.to_string(),
            ],
            dead,
        );
        let live = pool.live_candidates();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].1.host.as_deref(), Some("a"));
    }

    #[test]
    fn test_live_candidates_fall_back_when_all_dead() {
        let dead: HashSet<String> = ["1".to_string(), "2".to_string()].into_iter().collect();
        let pool = Pool::from_raw(
            vec![
                info(),
                r#"{"id":1,"host":"a"}"#.to_string(),
                r#"{"id":2,"host":"b"}"#.to_string(),
            ],
            dead,
        );
        assert_eq!(pool.live_candidates().len(), 2);
    }

    #[test]
    fn test_backend_from_record() {
        let pool = Pool::from_raw(
            vec![info(), r#"{"id":7,"host":"10.0.0.7","port":8080}"#.to_string()],
            HashSet::new(),
        );
        let (index, record) = pool.candidates()[0];
        let backend = Backend::from_record(index, record, pool.info(), "shop.example.com").unwrap();

        assert_eq!(backend.id, "7");
        assert_eq!(backend.index, 1);
        assert_eq!(backend.url(), "http://10.0.0.7:8080");
        assert_eq!(backend.virtual_host.as_deref(), Some("shop"));
        assert_eq!(backend.log_session.as_deref(), Some("log-1"));
        assert_eq!(backend.metric_session.as_deref(), Some("metric-1"));
        assert_eq!(backend.frontend, "shop.example.com");
        assert_eq!(backend.name, BACKEND_DISPLAY_NAME);
        assert!(backend.is_protected());
    }

    #[test]
    fn test_default_port() {
        let record: PoolRecord = serde_json::from_str(r#"{"host":"h"}"#).unwrap();
        let backend = Backend::from_record(2, &record, None, "f").unwrap();
        assert_eq!(backend.port, 80);
        assert_eq!(backend.id, "2");
        assert!(!backend.is_protected());
    }
}
