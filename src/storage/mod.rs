// src/storage/mod.rs
use crate::data::DataItem;
use crate::error::Result;
use crate::filter::{DataItemFilter, ScheduledActivityDataFilter};
use crate::scheduler::ScheduledActivityData;
use crate::subscription::Filter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonLinesArchive;
pub use memory::MemoryArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalDirection {
    /// From `start` towards later generation times
    ToFuture,
    /// From `start` towards earlier generation times
    ToPast,
}

/// Historical query: up to `limit` items from `start` in `direction`,
/// optionally bounded by `end`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalQuery<F> {
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    pub limit: usize,
    pub direction: RetrievalDirection,
    pub filter: F,
}

impl<F> RetrievalQuery<F> {
    pub fn new(start: DateTime<Utc>, limit: usize, direction: RetrievalDirection, filter: F) -> Self {
        Self {
            start,
            end: None,
            limit,
            direction,
            filter,
        }
    }

    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    fn admits(&self, time: DateTime<Utc>) -> bool {
        match self.direction {
            RetrievalDirection::ToFuture => time >= self.start && self.end.map_or(true, |e| time <= e),
            RetrievalDirection::ToPast => time <= self.start && self.end.map_or(true, |e| time >= e),
        }
    }

    /// Apply the query to items stored in insertion order
    pub(crate) fn select<'a, T>(&self, items: impl Iterator<Item = &'a T>, time_of: fn(&T) -> DateTime<Utc>) -> Vec<T>
    where
        T: Clone + 'a,
        F: Filter<T>,
    {
        let mut selected: Vec<T> = items
            .filter(|item| self.admits(time_of(item)) && self.filter.matches(item))
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal times
        selected.sort_by_key(time_of);
        if self.direction == RetrievalDirection::ToPast {
            selected.reverse();
        }
        selected.truncate(self.limit);
        selected
    }
}

/// Archive of produced data items and scheduler snapshots.
///
/// The processing model stores every batch output through it, and
/// historical `retrieve` queries are delegated to it.
#[async_trait]
pub trait Archive: Send + Sync {
    fn name(&self) -> &str;

    async fn store(&self, items: &[DataItem]) -> Result<()>;

    async fn retrieve(&self, query: &RetrievalQuery<DataItemFilter>) -> Result<Vec<DataItem>>;

    async fn store_scheduled(&self, items: &[ScheduledActivityData]) -> Result<()>;

    async fn retrieve_scheduled(
        &self,
        query: &RetrievalQuery<ScheduledActivityDataFilter>,
    ) -> Result<Vec<ScheduledActivityData>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    struct Even;

    impl Filter<(i64, DateTime<Utc>)> for Even {
        fn matches(&self, item: &(i64, DateTime<Utc>)) -> bool {
            item.0 % 2 == 0
        }
    }

    fn time_of(item: &(i64, DateTime<Utc>)) -> DateTime<Utc> {
        item.1
    }

    #[test]
    fn select_in_both_directions() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let items: Vec<(i64, DateTime<Utc>)> = (0..10).map(|i| (i, t0 + Duration::seconds(i))).collect();

        let forward = RetrievalQuery::new(t0 + Duration::seconds(3), 2, RetrievalDirection::ToFuture, Even);
        let got: Vec<i64> = forward.select(items.iter(), time_of).into_iter().map(|i| i.0).collect();
        assert_eq!(got, vec![4, 6]);

        let backward = RetrievalQuery::new(t0 + Duration::seconds(7), 10, RetrievalDirection::ToPast, Even)
            .until(t0 + Duration::seconds(2));
        let got: Vec<i64> = backward.select(items.iter(), time_of).into_iter().map(|i| i.0).collect();
        assert_eq!(got, vec![6, 4, 2]);
    }
}
