// src/storage/memory.rs - Volatile archive, the default when no file is configured
use super::{Archive, RetrievalQuery};
use crate::data::DataItem;
use crate::error::Result;
use crate::filter::{DataItemFilter, ScheduledActivityDataFilter};
use crate::scheduler::ScheduledActivityData;
use async_trait::async_trait;
use parking_lot::RwLock;

#[derive(Default)]
pub struct MemoryArchive {
    items: RwLock<Vec<DataItem>>,
    scheduled: RwLock<Vec<ScheduledActivityData>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

#[async_trait]
impl Archive for MemoryArchive {
    fn name(&self) -> &str {
        "memory"
    }

    async fn store(&self, items: &[DataItem]) -> Result<()> {
        self.items.write().extend_from_slice(items);
        Ok(())
    }

    async fn retrieve(&self, query: &RetrievalQuery<DataItemFilter>) -> Result<Vec<DataItem>> {
        let items = self.items.read();
        Ok(query.select(items.iter(), DataItem::generation_time))
    }

    async fn store_scheduled(&self, items: &[ScheduledActivityData]) -> Result<()> {
        self.scheduled.write().extend_from_slice(items);
        Ok(())
    }

    async fn retrieve_scheduled(
        &self,
        query: &RetrievalQuery<ScheduledActivityDataFilter>,
    ) -> Result<Vec<ScheduledActivityData>> {
        let scheduled = self.scheduled.read();
        Ok(query.select(scheduled.iter(), |s: &ScheduledActivityData| s.generation_time))
    }
}
