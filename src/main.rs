mod config;
mod models;
mod services;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::models::{CategoryRegistry, ChannelRecord, LivenessState};
use crate::services::{
    audit,
    balancer::{Balancer, PassSummary},
    classifier::ChannelClassifier,
    ingest,
    metrics::PassMetrics,
    reporter,
    shard_store::ShardStore,
};

#[derive(Parser, Debug)]
#[command(name = "berluca", version)]
#[command(about = "Balances classified IPTV channels across capacity-bounded server playlists", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rebalance the persisted shards, optionally merging a classified playlist
    Balance {
        /// Playlist produced by the collection stage
        #[arg(short, long, env = "INPUT_PLAYLIST")]
        input: Option<PathBuf>,
    },
    /// Apply connectivity audit verdicts and rebalance
    ApplyAudit {
        /// Audit summary (defaults to AUDIT_SUMMARY_PATH)
        #[arg(short, long)]
        summary: Option<PathBuf>,
    },
    /// Regenerate the content guide from the shards on disk
    Report,
    /// Print the category each channel name would be filed under
    Classify {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

struct App {
    config: Arc<Config>,
    registry: Arc<CategoryRegistry>,
    classifier: Arc<ChannelClassifier>,
}

impl App {
    fn store(&self) -> ShardStore {
        ShardStore::new(&self.config, self.classifier.clone())
    }

    async fn balance(
        &self,
        incoming: Vec<ChannelRecord>,
        audited: HashMap<String, LivenessState>,
    ) -> anyhow::Result<()> {
        let balancer = Balancer::new(self.config.clone(), self.store());
        let summary = balancer.run_pass(incoming, &audited).await?;

        self.write_guide(balancer.store(), &summary).await;
        self.export_metrics(&summary).await;

        if summary.dropped > 0 {
            tracing::warn!(
                "{} channels could not be assigned; raise MAX_SHARDS or the caps to place them",
                summary.dropped
            );
        }
        tracing::info!(
            pass_id = %summary.pass_id,
            shards = summary.assignment.shard_count(),
            placed = summary.placed,
            excluded = summary.excluded,
            "Balancing finished"
        );
        Ok(())
    }

    /// Guide failures are reported but never undo a completed pass
    async fn write_guide(&self, store: &ShardStore, summary: &PassSummary) {
        let guide = reporter::generate_summary(
            &summary.assignment,
            &self.registry,
            store,
            &self.config.limits(),
            chrono::Local::now(),
        );
        if let Err(e) = reporter::write_guide(&self.config.guide_path, &guide).await {
            tracing::error!("Failed to write content guide: {:#}", e);
        }
    }

    async fn export_metrics(&self, summary: &PassSummary) {
        let Some(path) = &self.config.metrics_textfile else {
            return;
        };
        let result = async {
            let metrics = PassMetrics::new()?;
            metrics.observe(summary);
            metrics.write_textfile(path).await
        }
        .await;
        if let Err(e) = result {
            tracing::error!("Failed to export metrics: {:#}", e);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing/logging (stderr keeps stdout for command output)
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "berluca=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = Config::from_env();
    config.validate()?;

    tracing::info!("Starting Berluca balancer v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        output_dir = %config.output_dir.display(),
        category_cap = config.category_cap,
        global_cap = config.global_cap,
        max_shards = config.max_shards,
        strict_liveness_gate = config.strict_liveness_gate,
        "Configuration loaded"
    );

    let registry = match &config.category_registry_path {
        Some(path) => CategoryRegistry::load(path).await?,
        None => CategoryRegistry::builtin()?,
    };
    tracing::info!("Category registry loaded: {} categories", registry.categories().count());

    let registry = Arc::new(registry);
    let app = App {
        classifier: Arc::new(ChannelClassifier::new(registry.clone())),
        registry,
        config: Arc::new(config),
    };

    match cli.command {
        Command::Balance { input } => {
            let incoming = match input {
                Some(path) => {
                    ingest::load_pool(&path, &app.classifier)
                        .await
                        .context("cannot balance without the input playlist")?
                        .records
                }
                None => Vec::new(),
            };
            app.balance(incoming, HashMap::new()).await?;
        }
        Command::ApplyAudit { summary } => {
            let path = summary.unwrap_or_else(|| app.config.audit_summary_path.clone());
            let audited = audit::load_audited_states(&path).await?;
            app.balance(Vec::new(), audited).await?;
        }
        Command::Report => {
            let store = app.store();
            let assignment = store.load_existing(app.config.search_bound()).await;
            let guide = reporter::generate_summary(
                &assignment,
                &app.registry,
                &store,
                &app.config.limits(),
                chrono::Local::now(),
            );
            reporter::write_guide(&app.config.guide_path, &guide).await?;
        }
        Command::Classify { names } => {
            for name in names {
                if app.classifier.is_excluded(&name) {
                    println!("excluded\t{}", name);
                } else {
                    println!("{}\t{}", app.classifier.classify(&name, None), name);
                }
            }
        }
    }

    Ok(())
}
