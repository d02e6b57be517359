pub mod ranking;

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use self::ranking::RankingRules;

/// One advertised source for a named channel. Several records may share a
/// display name when the same channel is offered by multiple upstreams; the
/// orchestrator picks between them by `score`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: String,
    pub name: String,
    pub url: String,
    /// Declared quality/resolution label, e.g. "1080p" or "4K UHD".
    pub quality: Option<String>,
    /// Free-form attributes from the upstream playlist (region, codec, ...).
    #[serde(default)]
    pub extras: HashMap<String, String>,
    #[serde(default)]
    pub geo_blocked: bool,
    /// Ranking score, recomputed whenever the catalog refreshes.
    #[serde(default)]
    pub score: i32,
}

impl ChannelRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            quality: None,
            extras: HashMap::new(),
            geo_blocked: false,
            score: 0,
        }
    }

    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = Some(quality.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    pub fn geo_blocked(mut self, blocked: bool) -> Self {
        self.geo_blocked = blocked;
        self
    }

    pub fn rescore(&mut self, rules: &RankingRules) {
        self.score = rules.score(self);
    }
}

/// Source of channel records, owned by the playlist/guide side of the
/// system. The orchestrator only reads from it.
pub trait ChannelCatalog: Send + Sync {
    /// All known sources for a display name, in catalog order.
    fn records_by_name(&self, name: &str) -> Vec<ChannelRecord>;
}

/// Catalog backed by a process-local map, rescored on every replace.
pub struct InMemoryCatalog {
    rules: RankingRules,
    records: Mutex<Vec<ChannelRecord>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self {
            rules: RankingRules::new(),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Replace the full record set, recomputing every score.
    pub fn replace_all(&self, records: Vec<ChannelRecord>) {
        let mut rescored = records;
        for record in &mut rescored {
            record.rescore(&self.rules);
        }
        *self.records.lock().unwrap() = rescored;
    }

    pub fn insert(&self, record: ChannelRecord) {
        let mut record = record;
        record.rescore(&self.rules);
        self.records.lock().unwrap().push(record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }

    /// Highest-scoring source for a display name, used for viewer-facing
    /// "best source" selection with the same scores the orchestrator uses
    /// for fallback ordering.
    pub fn best_record_by_name(&self, name: &str) -> Option<ChannelRecord> {
        ranking::rank(self.records_by_name(name)).into_iter().next()
    }
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelCatalog for InMemoryCatalog {
    fn records_by_name(&self, name: &str) -> Vec<ChannelRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|record| record.name == name)
            .cloned()
            .collect()
    }
}
