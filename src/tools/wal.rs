// WAL archiver over the directory PostgreSQL's archive_command writes into.
//
// A capture bundles every segment archived since the previous capture into
// one file:
//   8 bytes magic "WALBNDL1"
//   per segment: u16 name length, name, i64 archived-at (unix secs),
//                u64 data length, data       (all big-endian)
// Replay stages the segments archived up to the target into a restore
// directory and writes the recovery settings next to them.

use super::{WalArchiver, WalCapture};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tracing::{debug, info};

const BUNDLE_MAGIC: &[u8; 8] = b"WALBNDL1";

#[derive(Debug, Clone, PartialEq)]
struct Segment {
    name: String,
    archived_at: i64,
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DirectoryWalArchiver {
    archive_dir: PathBuf,
    restore_dir: PathBuf,
}

impl DirectoryWalArchiver {
    pub fn new(archive_dir: impl Into<PathBuf>, restore_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            restore_dir: restore_dir.into(),
        }
    }

    async fn archived_segments(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Segment>> {
        let mut entries = fs::read_dir(&self.archive_dir)
            .await
            .with_context(|| format!("failed to read {}", self.archive_dir.display()))?;
        let mut segments = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let archived_at = metadata
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            if since.is_some_and(|since| archived_at <= since.timestamp()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let data = fs::read(entry.path()).await?;
            segments.push(Segment {
                name,
                archived_at,
                data,
            });
        }

        // WAL segment names sort in log order
        segments.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(segments)
    }
}

fn encode_bundle(segments: &[Segment]) -> Vec<u8> {
    let mut out = Vec::from(&BUNDLE_MAGIC[..]);
    for segment in segments {
        out.extend_from_slice(&(segment.name.len() as u16).to_be_bytes());
        out.extend_from_slice(segment.name.as_bytes());
        out.extend_from_slice(&segment.archived_at.to_be_bytes());
        out.extend_from_slice(&(segment.data.len() as u64).to_be_bytes());
        out.extend_from_slice(&segment.data);
    }
    out
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if input.len() < n {
        bail!("truncated WAL bundle");
    }
    let (head, tail) = input.split_at(n);
    *input = tail;
    Ok(head)
}

fn decode_bundle(mut input: &[u8]) -> Result<Vec<Segment>> {
    if take(&mut input, 8)? != BUNDLE_MAGIC {
        bail!("not a WAL bundle");
    }
    let mut segments = Vec::new();
    while !input.is_empty() {
        let name_len = u16::from_be_bytes(take(&mut input, 2)?.try_into()?) as usize;
        let name = String::from_utf8(take(&mut input, name_len)?.to_vec())?;
        let archived_at = i64::from_be_bytes(take(&mut input, 8)?.try_into()?);
        let data_len = u64::from_be_bytes(take(&mut input, 8)?.try_into()?) as usize;
        let data = take(&mut input, data_len)?.to_vec();
        if name.contains('/') || name.contains("..") {
            bail!("invalid segment name in WAL bundle: {}", name);
        }
        segments.push(Segment {
            name,
            archived_at,
            data,
        });
    }
    Ok(segments)
}

#[async_trait]
impl WalArchiver for DirectoryWalArchiver {
    async fn capture(&self, output: &Path, since: Option<DateTime<Utc>>) -> Result<WalCapture> {
        let segments = self.archived_segments(since).await?;
        fs::write(output, encode_bundle(&segments))
            .await
            .with_context(|| format!("failed to write {}", output.display()))?;

        debug!(segments = segments.len(), output = %output.display(), "WAL segments bundled");
        Ok(WalCapture {
            segments: segments.len(),
            last_segment: segments.last().map(|s| s.name.clone()),
        })
    }

    async fn replay(&self, input: &Path, connection: &str, until: DateTime<Utc>) -> Result<u64> {
        let bundle = fs::read(input)
            .await
            .with_context(|| format!("failed to read {}", input.display()))?;
        let segments = decode_bundle(&bundle)?;

        fs::create_dir_all(&self.restore_dir).await?;
        let mut staged = 0u64;
        for segment in segments
            .iter()
            .filter(|segment| segment.archived_at <= until.timestamp())
        {
            fs::write(self.restore_dir.join(&segment.name), &segment.data).await?;
            staged += 1;
        }

        let settings = format!(
            "restore_command = 'cp {}/%f %p'\nrecovery_target_time = '{}'\nrecovery_target_action = 'promote'\n",
            self.restore_dir.display(),
            until.format("%Y-%m-%d %H:%M:%S%:z")
        );
        fs::write(self.restore_dir.join("recovery_target.conf"), settings).await?;
        fs::write(self.restore_dir.join("recovery.signal"), b"").await?;

        info!(
            staged_segments = staged,
            target = %until,
            database = %connection.rsplit('/').next().unwrap_or_default(),
            "WAL replay staged"
        );
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn scratch(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("wal-{}-{}", label, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_bundle_rejects_truncation_and_traversal() {
        let segments = vec![Segment {
            name: "000000010000000000000001".to_string(),
            archived_at: 1_700_000_000,
            data: vec![1, 2, 3],
        }];
        let bundle = encode_bundle(&segments);
        assert_eq!(decode_bundle(&bundle).unwrap(), segments);
        assert!(decode_bundle(&bundle[..bundle.len() - 1]).is_err());

        let evil = encode_bundle(&[Segment {
            name: "../postgresql.conf".to_string(),
            archived_at: 0,
            data: vec![],
        }]);
        assert!(decode_bundle(&evil).is_err());
    }

    #[tokio::test]
    async fn test_capture_then_replay_stages_segments() {
        let archive = scratch("archive");
        let restore = scratch("restore");
        fs::create_dir_all(&archive).await.unwrap();
        fs::write(archive.join("000000010000000000000001"), b"seg1").await.unwrap();
        fs::write(archive.join("000000010000000000000002"), b"seg2").await.unwrap();

        let archiver = DirectoryWalArchiver::new(&archive, &restore);
        let bundle = archive.with_extension("bundle");
        let capture = archiver.capture(&bundle, None).await.unwrap();
        assert_eq!(capture.segments, 2);
        assert_eq!(capture.last_segment.as_deref(), Some("000000010000000000000002"));

        let staged = archiver
            .replay(&bundle, "postgresql://localhost/platform", Utc::now() + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(staged, 2);
        assert!(fs::try_exists(restore.join("recovery.signal")).await.unwrap());

        fs::remove_dir_all(&archive).await.unwrap();
        fs::remove_dir_all(&restore).await.unwrap();
        fs::remove_file(&bundle).await.unwrap();
    }
}
