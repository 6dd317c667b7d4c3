//! On-disk buffer used when the broker is unreachable (C1).
//!
//! Segments are gzip-compressed JSON, one per batch, named
//! `batch_<uuid>_<enqueued_ns>.json.gz` so creation is lock-free: the
//! sweeper claims a segment by renaming it before it retries.

use crate::error::SpoolError;
use crate::model::EventBatch;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::read::GzDecoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct SegmentHeader {
    batch_id: Uuid,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmentBody {
    header: SegmentHeader,
    batch: EventBatch,
}

pub struct DiskSpool {
    dir: PathBuf,
    max_age: Duration,
}

#[derive(Debug, Clone)]
pub struct SpoolSegment {
    pub path: PathBuf,
    pub batch_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
}

impl DiskSpool {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Result<Self, SpoolError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, max_age })
    }

    /// Writes a batch as a new gzip segment. Returns the segment path.
    pub fn write_batch(&self, batch: &EventBatch) -> Result<PathBuf, SpoolError> {
        let enqueued_at = Utc::now();
        let file_name = format!(
            "batch_{}_{}.json.gz",
            batch.batch_id,
            enqueued_at.timestamp_nanos_opt().unwrap_or_default()
        );
        let path = self.dir.join(&file_name);
        let body = SegmentBody {
            header: SegmentHeader { batch_id: batch.batch_id, enqueued_at },
            batch: batch.clone(),
        };
        let json = serde_json::to_vec(&body)?;
        let file = std::fs::File::create(&path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&json)?;
        encoder.finish()?;
        Ok(path)
    }

    /// Scans the spool directory in FIFO (filename) order, sidelining any
    /// segment older than `max_age` rather than deleting it, and renaming
    /// unreadable segments to `.corrupted` instead of losing them silently.
    pub fn read_batches(&self) -> Result<Vec<(SpoolSegment, EventBatch)>, SpoolError> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().map(|e| e == "gz").unwrap_or(false)
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with("batch_"))
                        .unwrap_or(false)
            })
            .collect();
        entries.sort();

        let mut out = Vec::new();
        for path in entries {
            match self.load_segment(&path) {
                Ok((segment, batch)) => {
                    if Utc::now().signed_duration_since(segment.enqueued_at).to_std().unwrap_or_default()
                        > self.max_age
                    {
                        self.sideline(&path, "expired")?;
                        continue;
                    }
                    out.push((segment, batch));
                }
                Err(_) => {
                    self.sideline(&path, "corrupted")?;
                }
            }
        }
        Ok(out)
    }

    fn load_segment(&self, path: &Path) -> Result<(SpoolSegment, EventBatch), SpoolError> {
        let file = std::fs::File::open(path)?;
        let mut decoder = GzDecoder::new(file);
        let mut buf = Vec::new();
        decoder.read_to_end(&mut buf)?;
        let body: SegmentBody = serde_json::from_slice(&buf)?;
        Ok((
            SpoolSegment {
                path: path.to_path_buf(),
                batch_id: body.header.batch_id,
                enqueued_at: body.header.enqueued_at,
            },
            body.batch,
        ))
    }

    fn sideline(&self, path: &Path, reason: &str) -> Result<(), SpoolError> {
        let new_name = format!(
            "{}.{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("segment"),
            reason
        );
        let dest = self.dir.join(new_name);
        std::fs::rename(path, dest)?;
        Ok(())
    }

    /// Deletes a segment once the broker has acknowledged every event in it.
    pub fn remove_batch(&self, segment: &SpoolSegment) -> Result<(), SpoolError> {
        if segment.path.exists() {
            std::fs::remove_file(&segment.path)?;
        }
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        std::fs::read_dir(&self.dir)
            .map(|it| {
                it.filter_map(|e| e.ok())
                    .filter(|e| {
                        e.path()
                            .file_name()
                            .and_then(|n| n.to_str())
                            .map(|n| n.starts_with("batch_") && n.ends_with(".json.gz"))
                            .unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Event, EventPriority, EventType};

    fn sample_event() -> Event {
        Event {
            event_id: Uuid::new_v4(),
            learner_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            event_type: EventType::Interaction,
            timestamp: Utc::now(),
            priority: EventPriority::Normal,
            session_id: None,
            game_id: None,
            source_service: "test".into(),
            event_data: serde_json::json!({}),
            metadata: Default::default(),
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let spool = DiskSpool::new(dir.path(), Duration::from_secs(3600)).unwrap();
        let batch = EventBatch { batch_id: Uuid::new_v4(), events: vec![sample_event(), sample_event()] };
        spool.write_batch(&batch).unwrap();

        let read = spool.read_batches().unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].1.events.len(), 2);
        assert_eq!(read[0].0.batch_id, batch.batch_id);
    }

    #[test]
    fn expired_segment_is_sidelined_not_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let spool = DiskSpool::new(dir.path(), Duration::from_millis(1)).unwrap();
        let batch = EventBatch { batch_id: Uuid::new_v4(), events: vec![sample_event()] };
        spool.write_batch(&batch).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let read = spool.read_batches().unwrap();
        assert!(read.is_empty());

        let sidelined = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().ends_with(".expired"));
        assert!(sidelined, "expired segment should be renamed, not deleted");
    }

    #[test]
    fn remove_batch_deletes_segment() {
        let dir = tempfile::tempdir().unwrap();
        let spool = DiskSpool::new(dir.path(), Duration::from_secs(3600)).unwrap();
        let batch = EventBatch { batch_id: Uuid::new_v4(), events: vec![sample_event()] };
        spool.write_batch(&batch).unwrap();
        let (segment, _) = spool.read_batches().unwrap().remove(0);
        spool.remove_batch(&segment).unwrap();
        assert_eq!(spool.pending_count(), 0);
    }
}
