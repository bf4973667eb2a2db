use anyhow::Result;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

use super::shard_store::{write_atomic, ShardStore};
use crate::config::BalanceLimits;
use crate::models::{CategoryRegistry, ShardAssignment, StateCounts};

/// Human-readable description of the current shard layout
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentGuide {
    pub generated_at: String,
    pub category_cap: usize,
    pub global_cap: usize,
    pub max_shards: usize,
    pub total_channels: usize,
    pub shards: Vec<ShardSection>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardSection {
    pub index: usize,
    pub file_name: String,
    pub total: usize,
    pub categories: Vec<CategoryRow>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryRow {
    pub key: String,
    pub title: String,
    pub total: usize,
    pub states: StateCounts,
}

/// Build the guide from an assignment (fresh from a pass or read from disk)
pub fn generate_summary(
    assignment: &ShardAssignment,
    registry: &CategoryRegistry,
    store: &ShardStore,
    limits: &BalanceLimits,
    generated_at: DateTime<Local>,
) -> ContentGuide {
    let shards: Vec<ShardSection> = assignment
        .iter()
        .filter(|(_, inventory)| !inventory.is_empty())
        .map(|(index, inventory)| ShardSection {
            index,
            file_name: store.file_name(index),
            total: inventory.len(),
            categories: inventory
                .iter()
                .filter(|(_, records)| !records.is_empty())
                .map(|(key, records)| CategoryRow {
                    key: key.to_string(),
                    title: registry.title_for(key),
                    total: records.len(),
                    states: inventory.state_counts(key),
                })
                .collect(),
        })
        .collect();

    ContentGuide {
        generated_at: generated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        category_cap: limits.category_cap,
        global_cap: limits.global_cap,
        max_shards: limits.max_shards,
        total_channels: shards.iter().map(|s| s.total).sum(),
        shards,
    }
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|")
}

impl ContentGuide {
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# Content Guide - Berluca IPTV\n\n");
        out.push_str(&format!("Last updated: **{}**\n\n---\n\n", self.generated_at));
        out.push_str(&format!(
            "Channels are balanced with at most **{}** per category and **{}** per server, across up to **{}** servers.\n\n",
            self.category_cap, self.global_cap, self.max_shards
        ));

        if self.is_empty() {
            out.push_str("**No active shards:** the last balancing pass produced no server playlists.\n");
            return out;
        }

        out.push_str(&format!(
            "**Total channels:** {} across {} servers\n",
            self.total_channels,
            self.shards.len()
        ));

        for shard in &self.shards {
            out.push_str(&format!(
                "\n## Server {:02} (`{}`)\n\n**Channels:** {}\n\n",
                shard.index, shard.file_name, shard.total
            ));
            out.push_str("| Category | Total | abierto | dudoso | fallido | desconocido |\n");
            out.push_str("| :--- | :---: | :---: | :---: | :---: | :---: |\n");
            for row in &shard.categories {
                out.push_str(&format!(
                    "| {} | {} | {} | {} | {} | {} |\n",
                    escape_cell(&row.title),
                    row.total,
                    row.states.abierto,
                    row.states.dudoso,
                    row.states.fallido,
                    row.states.desconocido
                ));
            }
        }
        out
    }
}

pub fn json_twin(path: &Path) -> PathBuf {
    path.with_extension("json")
}

/// Markdown guide at `path` plus a JSON twin next to it
pub async fn write_guide(path: &Path, guide: &ContentGuide) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    write_atomic(path, guide.to_markdown().as_bytes()).await?;

    let json = serde_json::to_string_pretty(guide)?;
    write_atomic(&json_twin(path), json.as_bytes()).await?;

    info!(
        path = %path.display(),
        shards = guide.shards.len(),
        channels = guide.total_channels,
        "Content guide written"
    );
    Ok(())
}
