//! Static candidate wallet lists.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::debug;

use crate::sources::{CandidateSource, SourceError};

/// Candidate wallets from configuration plus an optional file.
///
/// The file holds one address per line; blank lines and `#` comments are
/// ignored. It is re-read on every call so edits take effect at the next
/// discovery sweep.
#[derive(Debug, Clone, Default)]
pub struct StaticCandidates {
    addresses: Vec<String>,
    file: Option<PathBuf>,
}

impl StaticCandidates {
    pub fn new(addresses: Vec<String>, file: Option<PathBuf>) -> Self {
        Self { addresses, file }
    }
}

#[async_trait]
impl CandidateSource for StaticCandidates {
    async fn candidates(&self) -> Result<Vec<String>, SourceError> {
        let mut all: BTreeSet<String> = self
            .addresses
            .iter()
            .map(|a| a.trim().to_ascii_lowercase())
            .filter(|a| !a.is_empty())
            .collect();

        if let Some(path) = &self.file {
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| SourceError::Unavailable(format!("{}: {}", path.display(), e)))?;
            all.extend(parse_address_lines(&content));
        }

        debug!(count = all.len(), "Loaded candidate addresses");
        Ok(all.into_iter().collect())
    }
}

fn parse_address_lines(content: &str) -> impl Iterator<Item = String> + '_ {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_ascii_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_config_and_file_are_merged() {
        let path = std::env::temp_dir().join(format!("liqmon-candidates-{}.txt", std::process::id()));
        tokio::fs::write(&path, "# whales\n0xAAA\n\n  0xbbb  \n0xccc\n").await.unwrap();

        let source = StaticCandidates::new(vec!["0xCCC".to_string(), "0xddd".to_string()], Some(path.clone()));
        let candidates = source.candidates().await.unwrap();
        tokio::fs::remove_file(&path).await.ok();

        assert_eq!(candidates, vec!["0xaaa", "0xbbb", "0xccc", "0xddd"]);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let source = StaticCandidates::new(vec![], Some(PathBuf::from("/nonexistent/candidates.txt")));
        assert!(matches!(source.candidates().await, Err(SourceError::Unavailable(_))));
    }
}
