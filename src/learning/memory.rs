use std::collections::{BTreeMap, VecDeque};
use std::sync::RwLock;

use tracing::{debug, warn};

use super::{rank_similar, LearningStats, LearningStore, SimilarRecord, ToolExecutionRecord};
use crate::analysis::ImageAnalysis;
use crate::settings::SimilarityWeights;
use crate::tools::ToolName;

// Fixed-capacity ring buffer: the oldest record is evicted on write once full.
#[derive(Debug)]
pub struct InMemoryLearningStore {
    records: RwLock<VecDeque<ToolExecutionRecord>>,
    capacity: usize,
    persist_threshold: u8,
    weights: SimilarityWeights,
}

impl InMemoryLearningStore {
    pub fn new(capacity: usize, persist_threshold: u8, weights: SimilarityWeights) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: RwLock::new(VecDeque::with_capacity(capacity.min(1_024))),
            capacity,
            persist_threshold,
            weights,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<ToolExecutionRecord> {
        self.records
            .read()
            .map(|records| records.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl LearningStore for InMemoryLearningStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn record(&self, record: ToolExecutionRecord) -> bool {
        if !record.is_persistable(self.persist_threshold) {
            debug!(
                tool = %record.tool,
                confidence = record.confidence,
                success = record.success,
                "learning record below persistence threshold, skipped"
            );
            return false;
        }
        let Ok(mut records) = self.records.write() else {
            warn!("in-memory learning store lock poisoned, record dropped");
            return false;
        };
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        true
    }

    fn find_similar(
        &self,
        tool: ToolName,
        analysis: &ImageAnalysis,
        limit: usize,
    ) -> Vec<SimilarRecord> {
        let Ok(records) = self.records.read() else {
            warn!("in-memory learning store lock poisoned, returning no history");
            return Vec::new();
        };
        rank_similar(
            records.iter(),
            tool,
            analysis,
            limit,
            self.persist_threshold,
            &self.weights,
        )
    }

    fn prune(&self, keep_most_recent: usize) -> usize {
        let Ok(mut records) = self.records.write() else {
            return 0;
        };
        let excess = records.len().saturating_sub(keep_most_recent);
        records.drain(..excess);
        excess
    }

    fn stats(&self) -> LearningStats {
        let mut records_by_tool = BTreeMap::<String, usize>::new();
        let mut total_records = 0;
        if let Ok(records) = self.records.read() {
            for record in records.iter() {
                *records_by_tool
                    .entry(record.tool.as_str().to_string())
                    .or_default() += 1;
            }
            total_records = records.len();
        }
        LearningStats {
            backend: self.backend_name().to_string(),
            total_records,
            records_by_tool,
        }
    }
}
