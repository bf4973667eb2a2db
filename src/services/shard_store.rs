use anyhow::{Context, Result};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::classifier::ChannelClassifier;
use super::m3u::{self, HEADER};
use crate::config::Config;
use crate::models::{CategoryError, CategoryRegistry, ChannelRecord, Inventory, ShardAssignment};

/// Write `contents` next to `path` and rename it into place, so readers never
/// observe a partially written file
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let written = async {
        let mut file = File::create(&tmp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, path).await
    }
    .await;

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e).with_context(|| format!("failed to write {}", path.display()));
    }
    Ok(())
}

/// Numbered shard playlists inside the output directory
pub struct ShardStore {
    dir: PathBuf,
    base_name: String,
    default_logo: String,
    classifier: Arc<ChannelClassifier>,
}

impl ShardStore {
    pub fn new(config: &Config, classifier: Arc<ChannelClassifier>) -> Self {
        Self {
            dir: config.output_dir.clone(),
            base_name: config.shard_base_name.clone(),
            default_logo: config.default_logo.clone(),
            classifier,
        }
    }

    pub fn registry(&self) -> &CategoryRegistry {
        self.classifier.registry()
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create output directory {}", self.dir.display()))
    }

    /// `RP_Servidor_07.m3u`
    pub fn file_name(&self, index: usize) -> String {
        format!("{}_{:02}.m3u", self.base_name, index)
    }

    pub fn path_for(&self, index: usize) -> PathBuf {
        self.dir.join(self.file_name(index))
    }

    /// Side file holding records kept out of the shards by the liveness gate
    pub fn excluded_path(&self) -> PathBuf {
        self.dir.join(format!("{}_excluidos.m3u", self.base_name))
    }

    pub async fn exists(&self, index: usize) -> bool {
        fs::try_exists(self.path_for(index)).await.unwrap_or(false)
    }

    pub async fn read_shard(&self, index: usize) -> Inventory {
        self.read_path(&self.path_for(index)).await
    }

    /// Read a playlist file. Missing and unreadable files are empty inventories.
    pub async fn read_path(&self, path: &Path) -> Inventory {
        match fs::read(path).await {
            Ok(bytes) => self.parse(&String::from_utf8_lossy(&bytes), path),
            Err(e) if e.kind() == ErrorKind::NotFound => Inventory::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read shard, treating as empty");
                Inventory::new()
            }
        }
    }

    /// Parse shard text back into an inventory. Duplicate URLs inside one file
    /// keep their first occurrence.
    pub fn parse(&self, text: &str, origin: &Path) -> Inventory {
        let mut inventory = Inventory::new();
        let mut seen = HashSet::new();
        let mut malformed = 0usize;

        for block in m3u::parse_blocks(text) {
            let block = match block {
                Ok(block) => block,
                Err(e) => {
                    debug!(path = %origin.display(), error = %e, "Skipping malformed shard entry");
                    malformed += 1;
                    continue;
                }
            };
            if !seen.insert(block.url.clone()) {
                continue;
            }

            let category = self
                .classifier
                .resolve_or_classify(block.extinf.attr("group-title"), &block.extinf.title);
            let liveness = block.liveness();
            let logo = block.extinf.attr("tvg-logo").map(str::to_string);
            let tvg_id = block.extinf.attr("tvg-id").map(str::to_string);

            let record = ChannelRecord {
                url: block.url,
                display_name: block.extinf.title,
                category,
                liveness,
                logo,
                tvg_id,
            };
            if let Err(e) = inventory.push_checked(record, self.registry()) {
                warn!(path = %origin.display(), error = %e, "Dropping shard entry");
            }
        }

        if malformed > 0 {
            warn!(path = %origin.display(), malformed, "Shard contained malformed entries");
        }
        inventory
    }

    /// Group records into an inventory, rejecting categories this store's
    /// registry does not know
    pub fn inventory_from(&self, records: Vec<ChannelRecord>) -> Result<Inventory, CategoryError> {
        Inventory::from_records(records, self.registry())
    }

    /// Render an inventory as a shard playlist: header, then one titled
    /// section per category in key order, records by descending priority
    pub fn render(&self, inventory: &Inventory) -> String {
        let registry = self.registry();
        let mut out = String::from(HEADER);
        out.push('\n');

        for (key, records) in inventory.iter() {
            if records.is_empty() {
                continue;
            }
            let title = registry.title_for(key);
            let category_logo = registry.logo_for(key);

            let mut ordered: Vec<&ChannelRecord> = records.iter().collect();
            ordered.sort_by(|a, b| b.priority().cmp(&a.priority()));

            out.push('\n');
            out.push_str(&m3u::section_header(&title));
            out.push('\n');

            for record in ordered {
                let logo = record
                    .logo
                    .as_deref()
                    .or(category_logo)
                    .unwrap_or(&self.default_logo);
                let attributes = [
                    ("tvg-id", record.tvg_id.as_deref().unwrap_or("")),
                    ("tvg-logo", logo),
                    ("group-title", title.as_str()),
                ];
                out.push_str(&m3u::render_extinf(&attributes, &record.display_name));
                out.push('\n');
                out.push_str(&m3u::render_state(record.liveness));
                out.push('\n');
                out.push_str(&record.url);
                out.push('\n');
            }
        }
        out
    }

    pub async fn write_shard(&self, index: usize, inventory: &Inventory) -> Result<()> {
        self.write_path(&self.path_for(index), inventory).await
    }

    pub async fn write_path(&self, path: &Path, inventory: &Inventory) -> Result<()> {
        write_atomic(path, self.render(inventory).as_bytes()).await
    }

    pub async fn delete_shard(&self, index: usize) -> Result<bool> {
        self.delete_path(&self.path_for(index)).await
    }

    /// Remove a file; `false` when there was nothing to remove
    pub async fn delete_path(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("failed to delete {}", path.display())),
        }
    }

    /// Every shard present on disk within `1..=bound`
    pub async fn load_existing(&self, bound: usize) -> ShardAssignment {
        let mut assignment = ShardAssignment::new();
        for index in 1..=bound {
            if self.exists(index).await {
                assignment.insert(index, self.read_shard(index).await);
            }
        }
        assignment
    }
}
