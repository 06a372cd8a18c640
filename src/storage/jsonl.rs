// src/storage/jsonl.rs - Append-only JSON-lines archive
//
// One record per line. Retrieval scans the whole file, which keeps the
// format trivially inspectable and appendable; it is meant for test
// campaigns and small deployments, not for long-term storage.

use super::{Archive, RetrievalQuery};
use crate::data::DataItem;
use crate::error::{ProcessingError, Result};
use crate::filter::{DataItemFilter, ScheduledActivityDataFilter};
use crate::scheduler::ScheduledActivityData;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum Record {
    Item { item: DataItem },
    Scheduled { data: ScheduledActivityData },
}

pub struct JsonLinesArchive {
    path: PathBuf,
    writer: Mutex<File>,
}

impl JsonLinesArchive {
    /// Open `path` for appending, creating it and its directory if needed
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        debug!("JSON-lines archive opened at {}", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, records: impl Iterator<Item = Record>) -> Result<()> {
        let mut buffer = String::new();
        for record in records {
            buffer.push_str(&serde_json::to_string(&record)?);
            buffer.push('\n');
        }
        if buffer.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(buffer.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn records(&self) -> Result<Vec<Record>> {
        // Serialize with writers so a half-written line is never read
        let _guard = self.writer.lock().await;
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ProcessingError::Archive(format!("Cannot read {}: {}", self.path.display(), e)))?;
        let mut records = Vec::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Record>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping corrupt archive line {} in {}: {}", number + 1, self.path.display(), e),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl Archive for JsonLinesArchive {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn store(&self, items: &[DataItem]) -> Result<()> {
        self.append(items.iter().map(|item| Record::Item { item: item.clone() })).await
    }

    async fn retrieve(&self, query: &RetrievalQuery<DataItemFilter>) -> Result<Vec<DataItem>> {
        let items: Vec<DataItem> = self
            .records()
            .await?
            .into_iter()
            .filter_map(|r| match r {
                Record::Item { item } => Some(item),
                Record::Scheduled { .. } => None,
            })
            .collect();
        Ok(query.select(items.iter(), DataItem::generation_time))
    }

    async fn store_scheduled(&self, items: &[ScheduledActivityData]) -> Result<()> {
        self.append(items.iter().map(|data| Record::Scheduled { data: data.clone() })).await
    }

    async fn retrieve_scheduled(
        &self,
        query: &RetrievalQuery<ScheduledActivityDataFilter>,
    ) -> Result<Vec<ScheduledActivityData>> {
        let scheduled: Vec<ScheduledActivityData> = self
            .records()
            .await?
            .into_iter()
            .filter_map(|r| match r {
                Record::Scheduled { data } => Some(data),
                Record::Item { .. } => None,
            })
            .collect();
        Ok(query.select(scheduled.iter(), |s: &ScheduledActivityData| s.generation_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{EntityType, Status, SystemEntity, AlarmState};
    use crate::path::EntityPath;
    use crate::storage::RetrievalDirection;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    fn entity(seq: u64, seconds: i64) -> DataItem {
        DataItem::SystemEntity(Arc::new(SystemEntity {
            internal_id: seq,
            external_id: 1,
            path: EntityPath::new("SAT.A"),
            entity_type: EntityType::Parameter,
            status: Status::Enabled,
            alarm_state: AlarmState::Nominal,
            generation_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(seconds),
        }))
    }

    #[tokio::test]
    async fn items_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive").join("data.jsonl");
        {
            let archive = JsonLinesArchive::open(&path).await.unwrap();
            archive.store(&[entity(1, 0), entity(2, 10)]).await.unwrap();
        }
        let archive = JsonLinesArchive::open(&path).await.unwrap();
        archive.store(&[entity(3, 20)]).await.unwrap();

        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 5).unwrap();
        let query = RetrievalQuery::new(start, 10, RetrievalDirection::ToFuture, DataItemFilter::all());
        let got: Vec<u64> = archive.retrieve(&query).await.unwrap().iter().map(|i| i.sequence()).collect();
        assert_eq!(got, vec![2, 3]);
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        let archive = JsonLinesArchive::open(&path).await.unwrap();
        archive.store(&[entity(1, 0)]).await.unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).await.unwrap();
            file.write_all(b"{not json\n").await.unwrap();
        }
        archive.store(&[entity(2, 1)]).await.unwrap();

        let start = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let query = RetrievalQuery::new(start, 10, RetrievalDirection::ToPast, DataItemFilter::all());
        let got: Vec<u64> = archive.retrieve(&query).await.unwrap().iter().map(|i| i.sequence()).collect();
        assert_eq!(got, vec![2, 1]);
    }
}
