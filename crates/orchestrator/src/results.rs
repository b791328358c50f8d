//! Test execution record and final result computation.

use chrono::{DateTime, Utc};
use itertools::{Itertools, MinMaxResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::RunContext;

/// One measured sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub task: String,
    pub name: String,
    pub value: f64,
    pub unit: String,
}

impl MetricRecord {
    pub fn new(
        task: impl Into<String>,
        name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            task: task.into(),
            name: name.into(),
            value,
            unit: unit.into(),
        }
    }
}

/// Aggregate of all samples of one metric in one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub task: String,
    pub name: String,
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub unit: String,
}

/// Results computed once the benchmark completed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalResults {
    /// Sorted by task, then metric name.
    pub summaries: Vec<MetricSummary>,
}

impl FinalResults {
    /// Summarise every `(task, metric)` pair.
    #[must_use]
    pub fn from_records(records: &[MetricRecord]) -> Self {
        let summaries = records
            .iter()
            .into_group_map_by(|r| (r.task.clone(), r.name.clone()))
            .into_iter()
            .sorted_by(|(a, _), (b, _)| a.cmp(b))
            .filter_map(|((task, name), samples)| summarize(task, name, &samples))
            .collect();
        Self { summaries }
    }

    #[must_use]
    pub fn get(&self, task: &str, name: &str) -> Option<&MetricSummary> {
        self.summaries
            .iter()
            .find(|s| s.task == task && s.name == name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }
}

#[allow(clippy::cast_precision_loss)]
fn summarize(task: String, name: String, samples: &[&MetricRecord]) -> Option<MetricSummary> {
    let (min, max) = match samples.iter().map(|r| r.value).minmax_by(f64::total_cmp) {
        MinMaxResult::NoElements => return None,
        MinMaxResult::OneElement(v) => (v, v),
        MinMaxResult::MinMax(lo, hi) => (lo, hi),
    };
    let count = samples.len();
    let mean = samples.iter().map(|r| r.value).sum::<f64>() / count as f64;
    let unit = samples.first().map(|r| r.unit.clone()).unwrap_or_default();
    Some(MetricSummary {
        task,
        name,
        count,
        min,
        max,
        mean,
        unit,
    })
}

/// Metadata and results of one benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestExecution {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub workload: String,
    pub test_procedure: Option<String>,
    pub provision_config_instance: Vec<String>,
    pub provision_config_revision: Option<String>,
    pub distribution_flavor: Option<String>,
    pub distribution_version: Option<String>,
    pub revision: Option<String>,
    pub results: Option<FinalResults>,
}

impl TestExecution {
    #[must_use]
    pub fn for_run(ctx: &RunContext) -> Self {
        Self {
            id: ctx.metrics.test_execution_id,
            timestamp: ctx.metrics.test_execution_timestamp,
            workload: ctx.workload.name.clone(),
            test_procedure: ctx.workload.test_procedure.clone(),
            provision_config_instance: ctx.metrics.provision_config_instance.clone(),
            provision_config_revision: None,
            distribution_flavor: None,
            distribution_version: None,
            revision: None,
            results: None,
        }
    }

    /// Human-readable line announcing the run.
    #[must_use]
    pub fn executing_notice(&self) -> String {
        let version = self.distribution_version.as_deref().unwrap_or("unknown");
        match &self.test_procedure {
            Some(procedure) => format!(
                "Executing test with workload [{}], test_procedure [{}] and provision_config_instance {:?} with version [{}].",
                self.workload, procedure, self.provision_config_instance, version
            ),
            None => format!(
                "Executing test with workload [{}] and provision_config_instance {:?} with version [{}].",
                self.workload, self.provision_config_instance, version
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_summarize_per_task_and_metric() {
        let records = vec![
            MetricRecord::new("index-append", "throughput", 100.0, "docs/s"),
            MetricRecord::new("index-append", "throughput", 300.0, "docs/s"),
            MetricRecord::new("index-append", "latency", 12.0, "ms"),
            MetricRecord::new("term-query", "latency", 4.0, "ms"),
        ];

        let results = FinalResults::from_records(&records);
        assert_eq!(results.summaries.len(), 3);

        let throughput = results.get("index-append", "throughput");
        assert!(throughput.is_some());
        if let Some(t) = throughput {
            assert_eq!(t.count, 2);
            assert!((t.min - 100.0).abs() < f64::EPSILON);
            assert!((t.max - 300.0).abs() < f64::EPSILON);
            assert!((t.mean - 200.0).abs() < f64::EPSILON);
            assert_eq!(t.unit, "docs/s");
        }

        let order: Vec<_> = results
            .summaries
            .iter()
            .map(|s| (s.task.as_str(), s.name.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("index-append", "latency"),
                ("index-append", "throughput"),
                ("term-query", "latency"),
            ]
        );
    }

    #[test]
    fn should_produce_empty_results_without_records() {
        assert!(FinalResults::from_records(&[]).is_empty());
    }
}
