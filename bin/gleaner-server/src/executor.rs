//! Built-in work unit.
//!
//! [`SimulatedExtractor`] walks through the phases of a place extraction
//! (browser start-up, search, result scraping, per-place processing) with a
//! fixed pause between steps and reports progress along the way.  It never
//! touches the network, so the whole job pipeline can be exercised end to
//! end without a browser.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use gleaner_core::{JobParameters, ProgressReporter, ResultSummary, WorkUnit, WorkUnitError};
use tracing::debug;

/// Share of the progress bar covered by each phase.
const SEARCH_DONE: u8 = 10;
const SCRAPE_DONE: u8 = 70;
const PROCESS_START: u8 = 75;
const PROCESS_DONE: u8 = 95;

/// Places remembered across jobs before the oldest are forgotten.
pub const SEEN_CAPACITY: usize = 100_000;

/// Places extracted by earlier jobs, oldest first.  A place found again is
/// not new.  Past `capacity` the oldest entry is evicted, so a place forgotten
/// that way counts as new the next time it is found.
#[derive(Debug)]
struct SeenPlaces {
    capacity: usize,
    order: VecDeque<String>,
    places: HashSet<String>,
}

impl SeenPlaces {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            places: HashSet::new(),
        }
    }

    /// Returns `true` if `place` was not remembered yet.
    fn insert(&mut self, place: String) -> bool {
        if self.places.contains(&place) {
            return false;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.places.remove(&oldest);
        }
        self.places.insert(place.clone());
        self.order.push_back(place);
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedExtractor {
    step: Duration,
    seen: Arc<Mutex<SeenPlaces>>,
}

impl SimulatedExtractor {
    pub fn new(step: Duration) -> Self {
        Self::with_seen_capacity(step, SEEN_CAPACITY)
    }

    pub fn with_seen_capacity(step: Duration, capacity: usize) -> Self {
        Self {
            step,
            seen: Arc::new(Mutex::new(SeenPlaces::new(capacity))),
        }
    }

    async fn pause(&self, progress: &ProgressReporter, step: Duration) -> Result<(), WorkUnitError> {
        tokio::select! {
            _ = progress.cancelled() => Err(WorkUnitError::new("extraction cancelled")),
            _ = tokio::time::sleep(step) => Ok(()),
        }
    }

    fn remember(&self, place: String) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(place)
    }
}

#[async_trait]
impl WorkUnit for SimulatedExtractor {
    async fn execute(
        &self,
        parameters: JobParameters,
        progress: ProgressReporter,
    ) -> Result<ResultSummary, WorkUnitError> {
        progress.report(5, "initializing browser");
        self.pause(&progress, self.step).await?;

        progress.report(
            SEARCH_DONE,
            format!(
                "searching {} within {} km of {}",
                parameters.keyword, parameters.radius, parameters.city
            ),
        );
        self.pause(&progress, self.step).await?;

        for scraped in [25u32, 50, 75, 100] {
            let percent = SEARCH_DONE as u32 + scraped * (SCRAPE_DONE - SEARCH_DONE) as u32 / 100;
            progress.report(percent as u8, format!("scraping in progress... {scraped}%"));
            self.pause(&progress, self.step).await?;
        }

        progress.report(PROCESS_START, "processing results");
        let found = parameters.max_results;
        let mut new_count = 0u64;
        for i in 0..found {
            let place = format!(
                "{} {} #{}",
                parameters.keyword.to_lowercase(),
                parameters.city.to_lowercase(),
                i + 1
            );
            let percent =
                PROCESS_START as u32 + i * (PROCESS_DONE - PROCESS_START) as u32 / found.max(1);
            progress.report(percent as u8, format!("processing {place}"));
            if self.remember(place) {
                new_count += 1;
            }
            self.pause(&progress, self.step / 4).await?;
        }

        debug!(found, new_count, "simulated extraction finished");
        Ok(ResultSummary::new(found as u64, new_count))
    }
}
