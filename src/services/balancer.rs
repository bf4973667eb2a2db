//! Balancing pass
//!
//! Collects every persisted record, merges new and re-audited input, ranks
//! the pool by liveness and packs it forward-only into capacity-bounded
//! shards. Files are only touched once the whole assignment is known.

use anyhow::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::shard_store::ShardStore;
use crate::config::{BalanceLimits, Config};
use crate::models::{CategoryKey, ChannelRecord, LivenessState, ShardAssignment};

/// Pool filters applied before packing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolPolicy {
    /// Only `abierto` records reach the shards; the rest wait in the excluded file
    pub strict_liveness_gate: bool,
    /// Backup slots kept per normalized channel name
    pub max_urls_per_name: Option<usize>,
}

impl PoolPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            strict_liveness_gate: config.strict_liveness_gate,
            max_urls_per_name: config.max_urls_per_name,
        }
    }
}

/// Pool ready for packing
#[derive(Debug, Default)]
pub struct PreparedPool {
    pub eligible: Vec<ChannelRecord>,
    pub excluded: Vec<ChannelRecord>,
    pub duplicates: usize,
    pub name_capped: usize,
}

#[derive(Debug, Default)]
pub struct PackOutcome {
    pub assignment: ShardAssignment,
    /// Records left over once `max_shards` was exhausted
    pub dropped: Vec<ChannelRecord>,
}

/// Counters describing one pass
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassSummary {
    pub pass_id: String,
    pub collected: usize,
    pub incoming: usize,
    pub audited: usize,
    pub duplicates: usize,
    pub name_capped: usize,
    pub excluded: usize,
    pub placed: usize,
    pub dropped: usize,
    pub shards_written: usize,
    pub shards_deleted: usize,
    pub write_failures: usize,
    #[serde(skip)]
    pub assignment: ShardAssignment,
}

/// Keep the first occurrence of every URL
pub fn dedup_by_url(records: Vec<ChannelRecord>) -> (Vec<ChannelRecord>, usize) {
    let mut seen = HashSet::with_capacity(records.len());
    let before = records.len();
    let unique: Vec<ChannelRecord> = records
        .into_iter()
        .filter(|r| seen.insert(r.url.clone()))
        .collect();
    let duplicates = before - unique.len();
    (unique, duplicates)
}

/// Descending priority; equal priorities ordered by URL so that the pool
/// order does not depend on where records were read from
pub fn sort_by_priority(records: &mut [ChannelRecord]) {
    records.sort_by(|a, b| {
        b.priority()
            .cmp(&a.priority())
            .then_with(|| a.url.cmp(&b.url))
    });
}

/// Dedup, rank, gate and name-cap a collected pool
pub fn prepare_pool(records: Vec<ChannelRecord>, policy: PoolPolicy) -> PreparedPool {
    let (mut records, duplicates) = dedup_by_url(records);
    sort_by_priority(&mut records);

    let (candidates, excluded): (Vec<_>, Vec<_>) = if policy.strict_liveness_gate {
        records
            .into_iter()
            .partition(|r| r.liveness == LivenessState::Abierto)
    } else {
        (records, Vec::new())
    };

    let mut name_capped = 0;
    let eligible = match policy.max_urls_per_name {
        Some(limit) => {
            let mut per_name: HashMap<String, usize> = HashMap::new();
            candidates
                .into_iter()
                .filter(|r| {
                    let slots = per_name.entry(r.name_key()).or_insert(0);
                    if *slots >= limit {
                        name_capped += 1;
                        return false;
                    }
                    *slots += 1;
                    true
                })
                .collect()
        }
        None => candidates,
    };

    PreparedPool {
        eligible,
        excluded,
        duplicates,
        name_capped,
    }
}

/// Forward-only greedy packing.
///
/// Records are placed in pool order into the current shard. When the record's
/// category or the shard as a whole is full, the cursor advances and both
/// counters start over. Earlier shards are never revisited. Once the cursor
/// passes `max_shards` every remaining record is dropped.
pub fn pack(pool: Vec<ChannelRecord>, limits: &BalanceLimits) -> PackOutcome {
    let mut assignment = ShardAssignment::new();

    if limits.max_shards == 0 || limits.category_cap == 0 || limits.global_cap == 0 {
        return PackOutcome {
            assignment,
            dropped: pool,
        };
    }

    let mut current = 1usize;
    let mut per_category: HashMap<CategoryKey, usize> = HashMap::new();
    let mut total = 0usize;
    let mut records = pool.into_iter();

    while let Some(record) = records.next() {
        let used = per_category.get(&record.category).copied().unwrap_or(0);
        if used >= limits.category_cap || total >= limits.global_cap {
            current += 1;
            per_category.clear();
            total = 0;

            if current > limits.max_shards {
                let mut dropped = vec![record];
                dropped.extend(records);
                return PackOutcome { assignment, dropped };
            }
        }

        *per_category.entry(record.category.clone()).or_insert(0) += 1;
        total += 1;
        assignment.push(current, record);
    }

    PackOutcome {
        assignment,
        dropped: Vec::new(),
    }
}

/// Runs balancing passes against a shard store
pub struct Balancer {
    config: Arc<Config>,
    store: ShardStore,
}

impl Balancer {
    pub fn new(config: Arc<Config>, store: ShardStore) -> Self {
        Self { config, store }
    }

    pub fn store(&self) -> &ShardStore {
        &self.store
    }

    /// Every persisted record: shards in index order, then the excluded file
    pub async fn collect_persisted(&self) -> Vec<ChannelRecord> {
        let mut records = Vec::new();
        for index in 1..=self.config.search_bound() {
            if self.store.exists(index).await {
                records.extend(self.store.read_shard(index).await.into_records());
            }
        }
        records.extend(
            self.store
                .read_path(&self.store.excluded_path())
                .await
                .into_records(),
        );
        records
    }

    /// Full pass: collect, merge, rank, pack, persist and prune.
    /// `audited` maps stream URLs to their latest audit verdict.
    pub async fn run_pass(
        &self,
        incoming: Vec<ChannelRecord>,
        audited: &HashMap<String, LivenessState>,
    ) -> Result<PassSummary> {
        let pass_id = Uuid::new_v4().to_string();
        let span = info_span!("balance_pass", pass_id = %pass_id);

        async move {
            self.store.ensure_dir().await?;

            let registry = self.store.registry();
            let offered = incoming.len();
            let incoming: Vec<ChannelRecord> = incoming
                .into_iter()
                .filter(|r| registry.contains(&r.category))
                .collect();
            if incoming.len() < offered {
                warn!(
                    rejected = offered - incoming.len(),
                    "Incoming channels with unregistered categories rejected"
                );
            }

            let mut pool = self.collect_persisted().await;
            let mut summary = PassSummary {
                pass_id,
                collected: pool.len(),
                incoming: incoming.len(),
                ..Default::default()
            };
            pool.extend(incoming);

            for record in pool.iter_mut() {
                if let Some(&state) = audited.get(&record.url) {
                    if record.liveness != state {
                        record.liveness = state;
                        summary.audited += 1;
                    }
                }
            }

            let prepared = prepare_pool(pool, PoolPolicy::from_config(&self.config));
            summary.duplicates = prepared.duplicates;
            summary.name_capped = prepared.name_capped;
            summary.excluded = prepared.excluded.len();

            info!(
                collected = summary.collected,
                incoming = summary.incoming,
                audited = summary.audited,
                duplicates = summary.duplicates,
                eligible = prepared.eligible.len(),
                excluded = summary.excluded,
                "Pool prepared"
            );

            let limits = self.config.limits();
            let PackOutcome { assignment, dropped } = pack(prepared.eligible, &limits);
            summary.placed = assignment.total_records();
            summary.dropped = dropped.len();

            if assignment.is_empty() {
                warn!("Balancing pass produced no shards");
            }

            if !dropped.is_empty() {
                warn!(
                    dropped = dropped.len(),
                    max_shards = limits.max_shards,
                    "{} channels could not be assigned, shard limit reached",
                    dropped.len()
                );
            }

            self.persist(&assignment, &mut summary).await;
            self.persist_excluded(prepared.excluded, &mut summary).await;

            info!(
                placed = summary.placed,
                shards = assignment.shard_count(),
                written = summary.shards_written,
                deleted = summary.shards_deleted,
                failures = summary.write_failures,
                "Balancing pass complete"
            );

            summary.assignment = assignment;
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }

    /// Write assigned shards and delete stale ones across the search range.
    /// Failures are logged per shard and never abort the remaining writes.
    async fn persist(&self, assignment: &ShardAssignment, summary: &mut PassSummary) {
        for index in 1..=self.config.search_bound() {
            match assignment.get(index) {
                Some(inventory) if !inventory.is_empty() => {
                    match self.store.write_shard(index, inventory).await {
                        Ok(()) => {
                            summary.shards_written += 1;
                            info!(
                                shard = %self.store.file_name(index),
                                channels = inventory.len(),
                                "Shard written"
                            );
                        }
                        Err(e) => {
                            summary.write_failures += 1;
                            error!(shard = %self.store.file_name(index), error = %e, "Failed to write shard");
                        }
                    }
                }
                _ => {
                    if !self.store.exists(index).await {
                        continue;
                    }
                    match self.store.delete_shard(index).await {
                        Ok(true) => {
                            summary.shards_deleted += 1;
                            info!(shard = %self.store.file_name(index), "Stale shard removed");
                        }
                        Ok(false) => {}
                        Err(e) => {
                            summary.write_failures += 1;
                            error!(shard = %self.store.file_name(index), error = %e, "Failed to remove stale shard");
                        }
                    }
                }
            }
        }
    }

    async fn persist_excluded(&self, excluded: Vec<ChannelRecord>, summary: &mut PassSummary) {
        let path = self.store.excluded_path();

        if excluded.is_empty() {
            if let Err(e) = self.store.delete_path(&path).await {
                summary.write_failures += 1;
                error!(path = %path.display(), error = %e, "Failed to remove excluded file");
            }
            return;
        }

        let inventory = match self.store.inventory_from(excluded) {
            Ok(inventory) => inventory,
            Err(e) => {
                summary.write_failures += 1;
                error!(path = %path.display(), error = %e, "Excluded channels rejected");
                return;
            }
        };
        match self.store.write_path(&path, &inventory).await {
            Ok(()) => info!(
                path = %path.display(),
                channels = inventory.len(),
                "Channels held back by liveness gate"
            ),
            Err(e) => {
                summary.write_failures += 1;
                error!(path = %path.display(), error = %e, "Failed to write excluded file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::category::test_registry;
    use crate::models::{CategoryRegistry, Inventory};
    use crate::services::classifier::ChannelClassifier;
    use std::path::Path;
    use tempfile::TempDir;

    const KEYS: &[&str] = &["misc", "news", "kids"];

    fn registry() -> CategoryRegistry {
        test_registry(KEYS)
    }

    fn record(url: &str, key: &str, state: LivenessState) -> ChannelRecord {
        let registry = registry();
        let mut record = ChannelRecord::new(url, format!("Channel {}", url), registry.key(key).unwrap())
            .with_liveness(state);
        record.logo = Some("http://logo/x.png".to_string());
        record
    }

    fn limits(category_cap: usize, global_cap: usize, max_shards: usize) -> BalanceLimits {
        BalanceLimits {
            category_cap,
            global_cap,
            max_shards,
        }
    }

    fn balancer(dir: &Path, configure: impl FnOnce(&mut Config)) -> Balancer {
        let mut config = Config::with_output_dir(dir);
        configure(&mut config);
        let classifier = Arc::new(ChannelClassifier::new(Arc::new(registry())));
        let store = ShardStore::new(&config, classifier);
        Balancer::new(Arc::new(config), store)
    }

    fn urls(inventory: &Inventory) -> Vec<&str> {
        inventory.records().map(|r| r.url.as_str()).collect()
    }

    #[test]
    fn test_category_cap_advances_shard() {
        let pool: Vec<_> = (1..=5)
            .map(|i| record(&format!("http://n/{}", i), "news", LivenessState::Abierto))
            .collect();
        let outcome = pack(pool, &limits(2, 100, 20));

        assert!(outcome.dropped.is_empty());
        assert_eq!(outcome.assignment.shard_count(), 3);
        assert_eq!(outcome.assignment.get(1).unwrap().len(), 2);
        assert_eq!(outcome.assignment.get(2).unwrap().len(), 2);
        assert_eq!(outcome.assignment.get(3).unwrap().len(), 1);
    }

    #[test]
    fn test_forward_only_placement() {
        // The third record fills news and pushes the cursor; kids never backfills shard 1
        let pool = vec![
            record("http://n/1", "news", LivenessState::Abierto),
            record("http://n/2", "news", LivenessState::Abierto),
            record("http://n/3", "news", LivenessState::Abierto),
            record("http://k/1", "kids", LivenessState::Abierto),
        ];
        let outcome = pack(pool, &limits(2, 100, 20));

        assert_eq!(urls(outcome.assignment.get(1).unwrap()), vec!["http://n/1", "http://n/2"]);
        let second = outcome.assignment.get(2).unwrap();
        assert_eq!(second.len(), 2);
        assert!(urls(second).contains(&"http://k/1"));
    }

    #[test]
    fn test_global_cap_mixed_categories() {
        let pool = vec![
            record("http://a/1", "news", LivenessState::Abierto),
            record("http://a/2", "kids", LivenessState::Abierto),
            record("http://a/3", "misc", LivenessState::Abierto),
            record("http://a/4", "news", LivenessState::Abierto),
        ];
        let outcome = pack(pool, &limits(10, 3, 20));

        assert_eq!(outcome.assignment.get(1).unwrap().len(), 3);
        assert_eq!(urls(outcome.assignment.get(2).unwrap()), vec!["http://a/4"]);
    }

    #[test]
    fn test_overflow_drops_remaining() {
        let pool: Vec<_> = (1..=3)
            .map(|i| record(&format!("http://n/{}", i), "news", LivenessState::Abierto))
            .collect();
        let outcome = pack(pool, &limits(1, 100, 2));

        assert_eq!(outcome.assignment.shard_count(), 2);
        assert_eq!(outcome.dropped.len(), 1);
        assert_eq!(outcome.dropped[0].url, "http://n/3");
    }

    #[test]
    fn test_caps_hold_in_every_shard() {
        let keys = ["news", "kids", "misc"];
        let pool: Vec<_> = (0..200)
            .map(|i| record(&format!("http://c/{:03}", i), keys[i % 3], LivenessState::Dudoso))
            .collect();
        let outcome = pack(pool, &limits(7, 15, 50));

        assert!(outcome.dropped.is_empty());
        assert_eq!(outcome.assignment.total_records(), 200);
        for (_, inventory) in outcome.assignment.iter() {
            assert!(inventory.len() <= 15);
            for (_, records) in inventory.iter() {
                assert!(records.len() <= 7);
            }
        }
    }

    #[test]
    fn test_prepare_pool_dedup_and_ranking() {
        let pool = vec![
            record("http://z/1", "news", LivenessState::Desconocido),
            record("http://b/1", "news", LivenessState::Abierto),
            record("http://z/1", "kids", LivenessState::Abierto),
            record("http://a/1", "news", LivenessState::Abierto),
            record("http://f/1", "news", LivenessState::Fallido),
            record("http://d/1", "news", LivenessState::Dudoso),
        ];
        let prepared = prepare_pool(pool, PoolPolicy::default());

        assert_eq!(prepared.duplicates, 1);
        let order: Vec<_> = prepared.eligible.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(order, vec!["http://a/1", "http://b/1", "http://d/1", "http://f/1", "http://z/1"]);
        // First occurrence wins
        assert_eq!(prepared.eligible[4].category.as_str(), "news");
        assert_eq!(prepared.eligible[4].liveness, LivenessState::Desconocido);
    }

    #[test]
    fn test_strict_gate_and_name_cap() {
        let mut a = record("http://x/1", "news", LivenessState::Abierto);
        let mut b = record("http://x/2", "news", LivenessState::Abierto);
        let mut c = record("http://x/3", "news", LivenessState::Dudoso);
        a.display_name = "Canal Uno".to_string();
        b.display_name = "canal  uno".to_string();
        c.display_name = "Canal Uno".to_string();

        let policy = PoolPolicy {
            strict_liveness_gate: true,
            max_urls_per_name: Some(1),
        };
        let prepared = prepare_pool(vec![a, b, c], policy);

        assert_eq!(prepared.eligible.len(), 1);
        assert_eq!(prepared.eligible[0].url, "http://x/1");
        assert_eq!(prepared.name_capped, 1);
        assert_eq!(prepared.excluded.len(), 1);
        assert_eq!(prepared.excluded[0].url, "http://x/3");
    }

    #[tokio::test]
    async fn test_pass_places_by_priority() {
        let tmp = TempDir::new().unwrap();
        let balancer = balancer(tmp.path(), |c| {
            c.category_cap = 2;
            c.global_cap = 100;
        });
        let incoming = vec![
            record("http://n/1", "news", LivenessState::Fallido),
            record("http://n/2", "news", LivenessState::Abierto),
            record("http://n/3", "news", LivenessState::Dudoso),
        ];

        let summary = balancer.run_pass(incoming, &HashMap::new()).await.unwrap();

        assert_eq!(summary.placed, 3);
        assert_eq!(summary.shards_written, 2);
        let first = balancer.store().read_shard(1).await;
        assert_eq!(urls(&first), vec!["http://n/2", "http://n/3"]);
        let second = balancer.store().read_shard(2).await;
        assert_eq!(urls(&second), vec!["http://n/1"]);
    }

    #[tokio::test]
    async fn test_pass_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let balancer = balancer(tmp.path(), |c| {
            c.category_cap = 2;
            c.global_cap = 3;
        });
        let keys = ["news", "kids", "misc"];
        let states = [
            LivenessState::Abierto,
            LivenessState::Dudoso,
            LivenessState::Fallido,
            LivenessState::Desconocido,
        ];
        let incoming: Vec<_> = (0..11)
            .map(|i| record(&format!("http://i/{:02}", i), keys[i % 3], states[i % 4]))
            .collect();

        balancer.run_pass(incoming, &HashMap::new()).await.unwrap();
        let snapshot = |dir: &Path| {
            let mut files: Vec<(String, String)> = std::fs::read_dir(dir)
                .unwrap()
                .map(|e| e.unwrap().path())
                .map(|p| {
                    let name = p.file_name().unwrap().to_string_lossy().to_string();
                    (name, std::fs::read_to_string(&p).unwrap())
                })
                .collect();
            files.sort();
            files
        };
        let first = snapshot(tmp.path());

        let summary = balancer.run_pass(Vec::new(), &HashMap::new()).await.unwrap();
        assert_eq!(summary.collected, 11);
        assert_eq!(summary.shards_deleted, 0);
        assert_eq!(snapshot(tmp.path()), first);
    }

    #[tokio::test]
    async fn test_stale_shards_pruned_within_bound() {
        let tmp = TempDir::new().unwrap();
        let balancer = balancer(tmp.path(), |c| {
            c.max_shards = 3;
            c.shard_search_margin = 2;
        });
        let store = balancer.store();
        store.ensure_dir().await.unwrap();

        let mut stale = Inventory::new();
        stale.push(record("http://s/1", "kids", LivenessState::Dudoso));
        store.write_shard(5, &stale).await.unwrap();
        let mut outside = Inventory::new();
        outside.push(record("http://s/2", "kids", LivenessState::Dudoso));
        store.write_shard(6, &outside).await.unwrap();

        let summary = balancer.run_pass(Vec::new(), &HashMap::new()).await.unwrap();

        assert_eq!(summary.collected, 1);
        assert_eq!(summary.shards_deleted, 1);
        assert!(!store.exists(5).await);
        assert_eq!(urls(&store.read_shard(1).await), vec!["http://s/1"]);
        // Beyond max_shards + margin: neither read nor touched
        assert!(store.exists(6).await);
    }

    #[tokio::test]
    async fn test_audit_overrides_reorder() {
        let tmp = TempDir::new().unwrap();
        let balancer = balancer(tmp.path(), |c| c.category_cap = 1);
        let incoming = vec![
            record("http://n/1", "news", LivenessState::Abierto),
            record("http://n/2", "news", LivenessState::Desconocido),
        ];
        balancer.run_pass(incoming, &HashMap::new()).await.unwrap();

        let audited = HashMap::from([
            ("http://n/1".to_string(), LivenessState::Fallido),
            ("http://n/2".to_string(), LivenessState::Abierto),
        ]);
        let summary = balancer.run_pass(Vec::new(), &audited).await.unwrap();

        assert_eq!(summary.audited, 2);
        let first = balancer.store().read_shard(1).await;
        assert_eq!(urls(&first), vec!["http://n/2"]);
        assert_eq!(first.records().next().unwrap().liveness, LivenessState::Abierto);
    }

    #[tokio::test]
    async fn test_strict_gate_holds_records_until_open() {
        let tmp = TempDir::new().unwrap();
        let balancer = balancer(tmp.path(), |c| c.strict_liveness_gate = true);
        let incoming = vec![
            record("http://g/1", "news", LivenessState::Abierto),
            record("http://g/2", "news", LivenessState::Dudoso),
        ];

        let summary = balancer.run_pass(incoming, &HashMap::new()).await.unwrap();
        assert_eq!(summary.placed, 1);
        assert_eq!(summary.excluded, 1);
        let excluded_path = balancer.store().excluded_path();
        assert!(excluded_path.exists());

        let audited = HashMap::from([("http://g/2".to_string(), LivenessState::Abierto)]);
        let summary = balancer.run_pass(Vec::new(), &audited).await.unwrap();
        assert_eq!(summary.placed, 2);
        assert_eq!(summary.excluded, 0);
        assert!(!excluded_path.exists());
    }

    #[tokio::test]
    async fn test_unregistered_categories_rejected() {
        let tmp = TempDir::new().unwrap();
        let balancer = balancer(tmp.path(), |_| {});
        let foreign = test_registry(&["sports"]);
        let incoming = vec![
            record("http://r/1", "news", LivenessState::Abierto),
            ChannelRecord::new("http://r/2", "Foreign", foreign.key("sports").unwrap()),
        ];

        let summary = balancer.run_pass(incoming, &HashMap::new()).await.unwrap();
        assert_eq!(summary.incoming, 1);
        assert_eq!(summary.placed, 1);
    }

    #[tokio::test]
    async fn test_failed_shard_write_does_not_stop_others() {
        let tmp = TempDir::new().unwrap();
        let balancer = balancer(tmp.path(), |c| {
            c.category_cap = 1;
            c.global_cap = 100;
        });
        // A non-empty directory cannot be replaced by the rename
        let blocker = balancer.store().path_for(1);
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), b"x").unwrap();

        let incoming = vec![
            record("http://n/1", "news", LivenessState::Abierto),
            record("http://n/2", "news", LivenessState::Abierto),
        ];
        let summary = balancer.run_pass(incoming, &HashMap::new()).await.unwrap();

        assert_eq!(summary.placed, 2);
        assert_eq!(summary.write_failures, 1);
        assert_eq!(summary.shards_written, 1);
        assert!(blocker.is_dir());
        assert_eq!(urls(&balancer.store().read_shard(2).await), vec!["http://n/2"]);
        assert!(!tmp.path().join("RP_Servidor_01.m3u.tmp").exists());
    }

    #[tokio::test]
    async fn test_empty_pool_clears_shards() {
        let tmp = TempDir::new().unwrap();
        let balancer = balancer(tmp.path(), |_| {});
        let summary = balancer.run_pass(Vec::new(), &HashMap::new()).await.unwrap();

        assert_eq!(summary.placed, 0);
        assert!(summary.assignment.is_empty());
        assert!(!balancer.store().exists(1).await);
    }
}
