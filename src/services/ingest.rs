use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use super::classifier::ChannelClassifier;
use super::m3u;
use crate::models::ChannelRecord;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("input playlist {0} not found; run the collection and classification stage first")]
    Missing(PathBuf),
    #[error("failed to read input playlist {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Classified records plus what was skipped on the way
#[derive(Debug, Default)]
pub struct IngestOutcome {
    pub records: Vec<ChannelRecord>,
    pub malformed: usize,
    pub excluded: usize,
}

/// Turn playlist text into classified records
pub fn records_from_text(text: &str, classifier: &ChannelClassifier) -> IngestOutcome {
    let mut outcome = IngestOutcome::default();

    for block in m3u::parse_blocks(text) {
        let block = match block {
            Ok(block) => block,
            Err(e) => {
                debug!(error = %e, "Skipping malformed playlist entry");
                outcome.malformed += 1;
                continue;
            }
        };

        if classifier.is_excluded(&block.extinf.title) {
            outcome.excluded += 1;
            continue;
        }

        let category = classifier.classify(&block.extinf.title, block.extinf.attr("group-title"));
        let liveness = block.liveness();
        let logo = block.extinf.attr("tvg-logo").map(str::to_string);
        let tvg_id = block.extinf.attr("tvg-id").map(str::to_string);

        outcome.records.push(ChannelRecord {
            url: block.url,
            display_name: block.extinf.title,
            category,
            liveness,
            logo,
            tvg_id,
        });
    }

    outcome
}

/// Load an input playlist. A missing file aborts the pass.
pub async fn load_pool(path: &Path, classifier: &ChannelClassifier) -> Result<IngestOutcome, IngestError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(IngestError::Missing(path.to_path_buf()))
        }
        Err(source) => {
            return Err(IngestError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let outcome = records_from_text(&String::from_utf8_lossy(&bytes), classifier);
    info!(
        path = %path.display(),
        channels = outcome.records.len(),
        malformed = outcome.malformed,
        excluded = outcome.excluded,
        "Input playlist loaded"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CategoryRegistry, LivenessState};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn classifier() -> ChannelClassifier {
        ChannelClassifier::new(Arc::new(CategoryRegistry::builtin().unwrap()))
    }

    const PLAYLIST: &str = r#"#EXTM3U
#EXTINF:-1 tvg-id="espn.ar" tvg-logo="http://logo/espn.png" group-title="Sports",ESPN Premium
http://stream.example/espn
#EXTINF:-1 group-title="Series",Zeta XYZ
#ESTADO:abierto
http://stream.example/zeta
#EXTINF:-1 group-title="Misc",Misa Dominical
http://stream.example/misa
#EXTINF:-1,Broken
not a url at all
#EXTINF:-1,Broken Too
gopher://stream.example/old
"#;

    #[test]
    fn test_records_from_text() {
        let outcome = records_from_text(PLAYLIST, &classifier());

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.excluded, 1);
        assert_eq!(outcome.malformed, 2);

        let espn = &outcome.records[0];
        assert_eq!(espn.category.as_str(), "deportes");
        assert_eq!(espn.tvg_id.as_deref(), Some("espn.ar"));
        assert_eq!(espn.logo.as_deref(), Some("http://logo/espn.png"));
        assert_eq!(espn.liveness, LivenessState::Desconocido);

        let zeta = &outcome.records[1];
        assert_eq!(zeta.category.as_str(), "series");
        assert_eq!(zeta.liveness, LivenessState::Abierto);
    }

    #[tokio::test]
    async fn test_missing_input_aborts() {
        let tmp = TempDir::new().unwrap();
        let result = load_pool(&tmp.path().join("absent.m3u"), &classifier()).await;
        assert!(matches!(result, Err(IngestError::Missing(_))));
    }

    #[tokio::test]
    async fn test_load_pool() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("input.m3u");
        std::fs::write(&path, PLAYLIST).unwrap();
        let outcome = load_pool(&path, &classifier()).await.unwrap();
        assert_eq!(outcome.records.len(), 2);
    }
}
