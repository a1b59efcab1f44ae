//! Sample store adapter trait definition

use crate::error::ReplayError;
use crate::model::{EntityClass, EntityFilter, EntityTimeline, TimeRange, TimelineMap};
use async_trait::async_trait;

/// Read-only windowed access to an upstream sample provider
///
/// Each adapter is responsible for:
/// - Issuing one windowed query for an entity class
/// - Restricting results to the optional entity allow-list
/// - Grouping samples by entity and sorting each timeline by time
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Get the name of this store (e.g., "openf1", "demo")
    fn name(&self) -> &str;

    /// Fetch every sample of `class` whose timestamp lies in the closed
    /// `range`, optionally restricted to `filter`.
    ///
    /// Returns:
    /// - `Ok(map)` with one timeline per entity that has samples; entities
    ///   without samples are absent, not an error
    /// - `Err(UnknownEntityClass)` if the store does not serve `class`
    /// - `Err(SourceUnavailable)` on upstream failure or malformed data
    async fn fetch_window(
        &self,
        class: &EntityClass,
        range: TimeRange,
        filter: Option<&EntityFilter>,
    ) -> Result<TimelineMap, ReplayError>;
}

/// Store backed by a fixed set of timelines. Useful for tests and fixtures.
#[derive(Debug, Clone, Default)]
pub struct StaticStore {
    class: EntityClass,
    timelines: TimelineMap,
}

impl StaticStore {
    pub fn new(timelines: TimelineMap) -> Self {
        Self {
            class: EntityClass::location(),
            timelines,
        }
    }
}

#[async_trait]
impl SampleStore for StaticStore {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch_window(
        &self,
        class: &EntityClass,
        range: TimeRange,
        filter: Option<&EntityFilter>,
    ) -> Result<TimelineMap, ReplayError> {
        if *class != self.class {
            return Err(ReplayError::UnknownEntityClass {
                class: class.to_string(),
            });
        }

        Ok(self
            .timelines
            .iter()
            .filter(|(id, _)| filter.map_or(true, |f| f.allows(**id)))
            .filter_map(|(id, timeline)| {
                let samples: Vec<_> = timeline
                    .samples()
                    .iter()
                    .filter(|s| range.contains(s.timestamp))
                    .cloned()
                    .collect();
                (!samples.is_empty()).then(|| (*id, EntityTimeline::new(*id, samples)))
            })
            .collect())
    }
}
