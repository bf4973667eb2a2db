use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::category::{CategoryError, CategoryKey, CategoryRegistry};

/// Liveness classification of a stream URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessState {
    Abierto,
    Dudoso,
    Fallido,
    Desconocido,
}

impl Default for LivenessState {
    fn default() -> Self {
        Self::Desconocido
    }
}

impl LivenessState {
    /// Fixed ranking: abierto=3 > dudoso=2 > fallido=1 > desconocido=0
    pub fn priority(self) -> u8 {
        match self {
            LivenessState::Abierto => 3,
            LivenessState::Dudoso => 2,
            LivenessState::Fallido => 1,
            LivenessState::Desconocido => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LivenessState::Abierto => "abierto",
            LivenessState::Dudoso => "dudoso",
            LivenessState::Fallido => "fallido",
            LivenessState::Desconocido => "desconocido",
        }
    }

    /// Parse a persisted marker value; anything unrecognised is `Desconocido`
    pub fn parse_lenient(raw: &str) -> Self {
        raw.parse().unwrap_or_default()
    }
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown liveness state: {0:?}")]
pub struct UnknownStateError(pub String);

impl FromStr for LivenessState {
    type Err = UnknownStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "abierto" => Ok(LivenessState::Abierto),
            "dudoso" => Ok(LivenessState::Dudoso),
            "fallido" => Ok(LivenessState::Fallido),
            "desconocido" => Ok(LivenessState::Desconocido),
            other => Err(UnknownStateError(other.to_string())),
        }
    }
}

/// Enriched channel entry flowing through the balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    pub url: String,
    pub display_name: String,
    pub category: CategoryKey,
    pub liveness: LivenessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tvg_id: Option<String>,
}

impl ChannelRecord {
    pub fn new(url: impl Into<String>, display_name: impl Into<String>, category: CategoryKey) -> Self {
        Self {
            url: url.into(),
            display_name: display_name.into(),
            category,
            liveness: LivenessState::Desconocido,
            logo: None,
            tvg_id: None,
        }
    }

    pub fn with_liveness(mut self, liveness: LivenessState) -> Self {
        self.liveness = liveness;
        self
    }

    /// Always derived from the liveness state
    pub fn priority(&self) -> u8 {
        self.liveness.priority()
    }

    /// Secondary dedup key: lowercase, no whitespace, ñ folded
    pub fn name_key(&self) -> String {
        self.display_name
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| if c == 'ñ' { 'n' } else { c })
            .collect()
    }
}

/// Per-state counters for one category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub abierto: usize,
    pub dudoso: usize,
    pub fallido: usize,
    pub desconocido: usize,
}

impl StateCounts {
    pub fn add(&mut self, state: LivenessState) {
        match state {
            LivenessState::Abierto => self.abierto += 1,
            LivenessState::Dudoso => self.dudoso += 1,
            LivenessState::Fallido => self.fallido += 1,
            LivenessState::Desconocido => self.desconocido += 1,
        }
    }
}

/// Contents of one shard: category -> ordered records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    categories: BTreeMap<CategoryKey, Vec<ChannelRecord>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an inventory, rejecting records whose category is not registered
    pub fn from_records(
        records: impl IntoIterator<Item = ChannelRecord>,
        registry: &CategoryRegistry,
    ) -> Result<Self, CategoryError> {
        let mut inventory = Self::new();
        for record in records {
            inventory.push_checked(record, registry)?;
        }
        Ok(inventory)
    }

    pub fn push_checked(
        &mut self,
        record: ChannelRecord,
        registry: &CategoryRegistry,
    ) -> Result<(), CategoryError> {
        if !registry.contains(&record.category) {
            return Err(CategoryError::UnknownKey(record.category.to_string()));
        }
        self.push(record);
        Ok(())
    }

    /// Append a record whose key already came from the registry
    pub fn push(&mut self, record: ChannelRecord) {
        self.categories
            .entry(record.category.clone())
            .or_default()
            .push(record);
    }

    pub fn get(&self, key: &CategoryKey) -> &[ChannelRecord] {
        self.categories.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.categories.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.values().all(Vec::is_empty)
    }

    /// Categories in key order
    pub fn iter(&self) -> impl Iterator<Item = (&CategoryKey, &[ChannelRecord])> {
        self.categories.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn records(&self) -> impl Iterator<Item = &ChannelRecord> {
        self.categories.values().flatten()
    }

    pub fn into_records(self) -> impl Iterator<Item = ChannelRecord> {
        self.categories.into_values().flatten()
    }

    pub fn state_counts(&self, key: &CategoryKey) -> StateCounts {
        let mut counts = StateCounts::default();
        for record in self.get(key) {
            counts.add(record.liveness);
        }
        counts
    }
}

/// Result of a balancing pass: 1-based shard index -> inventory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardAssignment {
    shards: BTreeMap<usize, Inventory>,
}

impl ShardAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: usize, record: ChannelRecord) {
        self.shards.entry(index).or_default().push(record);
    }

    /// Install a whole inventory; empty inventories are not kept
    pub fn insert(&mut self, index: usize, inventory: Inventory) {
        if inventory.is_empty() {
            self.shards.remove(&index);
        } else {
            self.shards.insert(index, inventory);
        }
    }

    pub fn get(&self, index: usize) -> Option<&Inventory> {
        self.shards.get(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Inventory)> {
        self.shards.iter().map(|(i, inv)| (*i, inv))
    }

    /// Number of non-empty shards
    pub fn shard_count(&self) -> usize {
        self.shards.values().filter(|inv| !inv.is_empty()).count()
    }

    pub fn total_records(&self) -> usize {
        self.shards.values().map(Inventory::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shard_count() == 0
    }
}
