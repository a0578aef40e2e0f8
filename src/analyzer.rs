//! Statistical analysis of consolidated counters
//!
//! Per experiment: totals and overall conversion rate. Per treatment:
//! conversion rate, share of traffic, standard error of that share, the 95%
//! half-width and a two-proportion z-score against the control.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::consolidator::{ConsolidationStats, CounterTable, ExperimentCounters};
use crate::constants::Z_95;
use crate::errors::Result;

/// Statistics for one treatment (or composite key)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreatmentAnalysis {
    pub total_tested: u64,
    pub total_converted: u64,
    pub conversion_rate: f64,
    pub percent_tested: f64,
    pub standard_error: f64,
    /// Half-width of the 95% interval (standard error × 1.96)
    pub high_confidence: f64,
    /// Absent for the control treatment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_score: Option<f64>,
}

/// Statistics for one experiment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRecord {
    pub total_tested: u64,
    pub total_converted: u64,
    pub conversion_rate: f64,
    pub control: String,
    pub multivariate: bool,
    pub treatments: BTreeMap<String, TreatmentAnalysis>,
}

impl AnalysisRecord {
    pub fn treatment(&self, name: &str) -> Option<&TreatmentAnalysis> {
        self.treatments.get(name)
    }
}

/// Analysis output handed to renderers
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub experiment: String,
    pub analyzed_at: DateTime<Utc>,
    pub records: BTreeMap<String, AnalysisRecord>,
    pub consolidation: ConsolidationStats,
}

impl AnalysisReport {
    pub fn new(
        experiment: impl Into<String>,
        counters: &CounterTable,
        consolidation: ConsolidationStats,
    ) -> Self {
        Self {
            experiment: experiment.into(),
            analyzed_at: Utc::now(),
            records: ExperimentAnalyzer::summarize(counters),
            consolidation,
        }
    }

    /// Record for the analyzed experiment itself
    pub fn record(&self) -> Option<&AnalysisRecord> {
        self.records.get(&self.experiment)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Pure summary statistics over a counter table
pub struct ExperimentAnalyzer;

impl ExperimentAnalyzer {
    /// Summarize every experiment in the table
    pub fn summarize(counters: &CounterTable) -> BTreeMap<String, AnalysisRecord> {
        counters
            .iter()
            .map(|(name, exp)| (name.to_string(), Self::analyze(exp)))
            .collect()
    }

    /// Summarize one experiment's counters
    pub fn analyze(counters: &ExperimentCounters) -> AnalysisRecord {
        let total_tested = counters.total();
        let total_converted = counters.completed();

        let (c_rate, c_total) = counters
            .treatments
            .get(&counters.control)
            .map(|c| (Self::rate(c.completed, c.total), c.total))
            .unwrap_or((0.0, 0));

        let treatments = counters
            .treatments
            .iter()
            .map(|(name, c)| {
                let conversion_rate = Self::rate(c.completed, c.total);
                let percent_tested = Self::rate(c.total, total_tested);
                let standard_error = Self::standard_error(percent_tested, c.total);
                let z_score = (name != &counters.control)
                    .then(|| Self::z_score(conversion_rate, c.total, c_rate, c_total));

                let analysis = TreatmentAnalysis {
                    total_tested: c.total,
                    total_converted: c.completed,
                    conversion_rate,
                    percent_tested,
                    standard_error,
                    high_confidence: standard_error * Z_95,
                    z_score,
                };
                (name.clone(), analysis)
            })
            .collect();

        AnalysisRecord {
            total_tested,
            total_converted,
            conversion_rate: Self::rate(total_converted, total_tested),
            control: counters.control.clone(),
            multivariate: counters.multivariate,
            treatments,
        }
    }

    /// `part / whole`, 0 when `whole` is 0
    fn rate(part: u64, whole: u64) -> f64 {
        if whole == 0 {
            0.0
        } else {
            part as f64 / whole as f64
        }
    }

    /// Standard error of a traffic share
    fn standard_error(percent_tested: f64, total: u64) -> f64 {
        if total == 0 {
            return 0.0;
        }
        (percent_tested * (1.0 - percent_tested) / total as f64).sqrt()
    }

    /// Two-proportion z-score of a treatment against the control
    ///
    /// Degenerate inputs (no traffic on either side, a zero treatment rate, or
    /// a zero pooled variance) yield 0.
    pub fn z_score(t_rate: f64, t_total: u64, c_rate: f64, c_total: u64) -> f64 {
        if c_total == 0 || t_total == 0 || t_rate == 0.0 {
            return 0.0;
        }
        let variance =
            t_rate * (1.0 - t_rate) / t_total as f64 + c_rate * (1.0 - c_rate) / c_total as f64;
        if variance <= 0.0 {
            return 0.0;
        }
        (t_rate - c_rate) / variance.sqrt()
    }
}
