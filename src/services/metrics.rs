//! Pass metrics exported as a Prometheus textfile

use anyhow::Result;
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::path::Path;
use tracing::info;

use super::balancer::PassSummary;
use super::shard_store::write_atomic;

/// Gauges describing the most recent balancing pass
pub struct PassMetrics {
    registry: Registry,
    collected: IntGauge,
    incoming: IntGauge,
    duplicates: IntGauge,
    name_capped: IntGauge,
    excluded: IntGauge,
    placed: IntGauge,
    dropped: IntGauge,
    shards: IntGauge,
    shards_written: IntGauge,
    shards_deleted: IntGauge,
    write_failures: IntGauge,
    shard_channels: IntGaugeVec,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn as_gauge(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl PassMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let shard_channels = IntGaugeVec::new(
            Opts::new("berluca_shard_channels", "Channels placed in each shard"),
            &["shard"],
        )?;
        registry.register(Box::new(shard_channels.clone()))?;

        Ok(Self {
            collected: gauge(&registry, "berluca_pass_collected", "Records read back from persisted shards")?,
            incoming: gauge(&registry, "berluca_pass_incoming", "Records supplied by the input playlist")?,
            duplicates: gauge(&registry, "berluca_pass_duplicates", "Records discarded as duplicate URLs")?,
            name_capped: gauge(&registry, "berluca_pass_name_capped", "Records beyond the per-name backup slots")?,
            excluded: gauge(&registry, "berluca_pass_excluded", "Records held back by the liveness gate")?,
            placed: gauge(&registry, "berluca_pass_placed", "Records assigned to a shard")?,
            dropped: gauge(&registry, "berluca_pass_dropped", "Records left unassigned after max shards")?,
            shards: gauge(&registry, "berluca_pass_shards", "Non-empty shards after the pass")?,
            shards_written: gauge(&registry, "berluca_pass_shards_written", "Shard files written")?,
            shards_deleted: gauge(&registry, "berluca_pass_shards_deleted", "Stale shard files removed")?,
            write_failures: gauge(&registry, "berluca_pass_write_failures", "Shard writes or deletes that failed")?,
            shard_channels,
            registry,
        })
    }

    pub fn observe(&self, summary: &PassSummary) {
        self.collected.set(as_gauge(summary.collected));
        self.incoming.set(as_gauge(summary.incoming));
        self.duplicates.set(as_gauge(summary.duplicates));
        self.name_capped.set(as_gauge(summary.name_capped));
        self.excluded.set(as_gauge(summary.excluded));
        self.placed.set(as_gauge(summary.placed));
        self.dropped.set(as_gauge(summary.dropped));
        self.shards.set(as_gauge(summary.assignment.shard_count()));
        self.shards_written.set(as_gauge(summary.shards_written));
        self.shards_deleted.set(as_gauge(summary.shards_deleted));
        self.write_failures.set(as_gauge(summary.write_failures));

        self.shard_channels.reset();
        for (index, inventory) in summary.assignment.iter() {
            let shard = format!("{:02}", index);
            self.shard_channels
                .with_label_values(&[shard.as_str()])
                .set(as_gauge(inventory.len()));
        }
    }

    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Node-exporter textfile collector format
    pub async fn write_textfile(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.encode()?.as_bytes()).await?;
        info!(path = %path.display(), "Metrics textfile written");
        Ok(())
    }
}
