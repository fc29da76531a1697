use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::io::AsyncWriteExt;

use crate::schema::Experience;

/// Durable JSONL export of an experiment's experience stream, for offline
/// analysis. Not on the critical path of the episode loop — the in-memory
/// `ExperienceMemory` is authoritative while the process runs; this is the
/// engine's optional snapshot surface for the Control API's export endpoint.
#[derive(Debug, Clone)]
pub struct ExperienceLog {
    path: PathBuf,
}

impl ExperienceLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, experience: &Experience) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let line = serde_json::to_string(experience)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Atomically replace the log with `experiences`. Writes to a `.tmp`
    /// sibling, fsyncs, then renames over the original so a crash mid-write
    /// never corrupts the existing export.
    pub async fn overwrite(&self, experiences: &[Experience]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = {
            let filename = self
                .path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "experiences.jsonl".to_string());
            self.path.with_file_name(format!("{filename}.tmp"))
        };

        let write_result: Result<()> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await?;
            for experience in experiences {
                let line = serde_json::to_string(experience)?;
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await?;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        Ok(())
    }

    pub fn load(&self) -> Result<Vec<Experience>> {
        use std::fs::OpenOptions;
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(&self.path)?;
        let reader = BufReader::new(file);
        let mut experiences = Vec::new();
        let mut corrupt_count = 0usize;

        for (line_idx, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<Experience>(&line) {
                Ok(experience) => experiences.push(experience),
                Err(err) => {
                    corrupt_count += 1;
                    tracing::warn!(
                        line = line_idx + 1,
                        error = %err,
                        path = %self.path.display(),
                        "corrupt JSONL record — skipping line (original preserved in .corrupt file)"
                    );
                    let corrupt_path = self.path.with_extension("jsonl.corrupt");
                    let mut bad = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&corrupt_path)
                        .unwrap_or_else(|_| {
                            std::fs::File::open("/dev/null").expect("/dev/null always exists")
                        });
                    use std::io::Write as _;
                    let _ = writeln!(bad, "{line}");
                }
            }
        }

        if corrupt_count > 0 {
            tracing::warn!(
                corrupt_lines = corrupt_count,
                path = %self.path.display(),
                "experience log loaded with skipped corrupt lines — inspect .corrupt sidecar"
            );
        }

        Ok(experiences)
    }

    /// Exports as a UTF-8 document with a leading byte-order-mark, one JSON
    /// object per line, matching the export contract's BOM requirement.
    pub fn export_jsonl_with_bom(&self) -> Result<String> {
        let experiences = self.load()?;
        let mut out = String::from('\u{FEFF}');
        for experience in &experiences {
            out.push_str(&serde_json::to_string(experience)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_reward::{Outcome, RewardBreakdown};
    use drift_strategy::Strategy;
    use uuid::Uuid;

    fn sample() -> Experience {
        Experience {
            episode: 0,
            issue: crate::schema::Issue {
                id: Uuid::new_v4(),
                content: "issue".to_string(),
                issue_type: crate::schema::IssueType::OrderStatus,
                urgency: 2,
                metadata: Default::default(),
            },
            response: crate::schema::Response {
                id: Uuid::new_v4(),
                issue_id: Uuid::new_v4(),
                content: "response".to_string(),
                strategy: Strategy::Efficient,
                ticket_closed: true,
                response_time_seconds: 3.0,
                metadata: Default::default(),
            },
            outcome: Some(Outcome { customer_rating: 4, issue_resolved: true, has_complaint: false, has_follow_up: false }),
            reward: RewardBreakdown { short_term: 10.0, long_term: 20.0, violation: 0.0, total: 15.0 },
            strategy: Strategy::Efficient,
            is_violation: false,
            violation_tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn append_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExperienceLog::new(dir.path().join("experiences.jsonl"));
        log.append(&sample()).await.unwrap();
        let loaded = log.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].episode, 0);
    }

    #[tokio::test]
    async fn overwrite_replaces_prior_contents() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExperienceLog::new(dir.path().join("experiences.jsonl"));
        log.append(&sample()).await.unwrap();
        log.overwrite(&[]).await.unwrap();
        assert!(log.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn export_jsonl_starts_with_bom() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExperienceLog::new(dir.path().join("experiences.jsonl"));
        log.append(&sample()).await.unwrap();
        let exported = log.export_jsonl_with_bom().unwrap();
        assert!(exported.starts_with('\u{FEFF}'));
    }
}
