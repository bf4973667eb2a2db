use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::m3u;
use crate::models::LivenessState;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit summary {0} not found; run the connectivity audit first")]
    SummaryMissing(PathBuf),
    #[error("audit summary {0} contains no audited channels")]
    NoStates(PathBuf),
    #[error("failed to read audit summary {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Audit verdicts keyed by stream URL. Later entries override earlier ones;
/// entries without a recognisable state are skipped.
pub fn audited_states_from_text(text: &str) -> HashMap<String, LivenessState> {
    let mut states = HashMap::new();
    let mut skipped = 0usize;

    for block in m3u::parse_blocks(text) {
        let Ok(block) = block else {
            skipped += 1;
            continue;
        };
        let verdict = block
            .audit_state
            .as_deref()
            .or(block.state.as_deref())
            .and_then(|raw| raw.parse::<LivenessState>().ok());
        match verdict {
            Some(state) => {
                states.insert(block.url, state);
            }
            None => skipped += 1,
        }
    }

    if skipped > 0 {
        debug!(skipped, "Audit entries without a usable verdict");
    }
    states
}

/// Load the audit summary. A missing or empty summary aborts the pass.
pub async fn load_audited_states(path: &Path) -> Result<HashMap<String, LivenessState>, AuditError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(AuditError::SummaryMissing(path.to_path_buf()))
        }
        Err(source) => {
            return Err(AuditError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let states = audited_states_from_text(&String::from_utf8_lossy(&bytes));
    if states.is_empty() {
        warn!(path = %path.display(), "Audit summary has no verdicts");
        return Err(AuditError::NoStates(path.to_path_buf()));
    }

    let abierto = states.values().filter(|s| **s == LivenessState::Abierto).count();
    info!(
        path = %path.display(),
        channels = states.len(),
        abierto,
        "Audit summary loaded"
    );
    Ok(states)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SUMMARY: &str = "#EXTM3U\n\
#EXTINF:-1 group-title=\"TV\",Uno\n#ESTADO:abierto\nhttp://a/1\n\
#EXTINF:-1 group-title=\"TV\" #ESTADO_AUDITORIA:fallido,Dos\nhttp://a/2\n\
#EXTINF:-1,Tres\nhttp://a/3\n\
#EXTINF:-1,Uno otra vez\n#ESTADO:dudoso\nhttp://a/1\n";

    #[test]
    fn test_states_from_text() {
        let states = audited_states_from_text(SUMMARY);
        assert_eq!(states.len(), 2);
        assert_eq!(states["http://a/1"], LivenessState::Dudoso);
        assert_eq!(states["http://a/2"], LivenessState::Fallido);
        assert!(!states.contains_key("http://a/3"));
    }

    #[tokio::test]
    async fn test_missing_summary_aborts() {
        let tmp = TempDir::new().unwrap();
        let err = load_audited_states(&tmp.path().join("none.m3u")).await.unwrap_err();
        assert!(matches!(err, AuditError::SummaryMissing(_)));
        assert!(err.to_string().contains("run the connectivity audit first"));
    }

    #[tokio::test]
    async fn test_empty_summary_aborts() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("resumen.m3u");
        std::fs::write(&path, "#EXTM3U\n#EXTINF:-1,Sin estado\nhttp://a/1\n").unwrap();
        assert!(matches!(
            load_audited_states(&path).await,
            Err(AuditError::NoStates(_))
        ));
    }

    #[tokio::test]
    async fn test_load_summary() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("resumen.m3u");
        std::fs::write(&path, SUMMARY).unwrap();
        let states = load_audited_states(&path).await.unwrap();
        assert_eq!(states.len(), 2);
    }
}
