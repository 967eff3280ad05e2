use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::QualityThresholds;
use crate::schema::{Quote, ThematicConnection};

pub const HISTOGRAM_BINS: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    OverConnecting,
    UnderConnecting,
    NarrowConfidence,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityAlert {
    pub kind: AlertKind,
    pub message: String,
}

/// Per-document statistics over the recorded connections. Advisory only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QualityReport {
    pub total_quotes: usize,
    /// Quotes at either end of at least one non-`none` connection
    pub connected_quotes: usize,
    pub connection_count: usize,
    pub connection_rate: f64,
    /// Connection confidences in ten equal bins over [0, 1]
    pub confidence_histogram: Vec<usize>,
    pub distinct_confidence_values: usize,
    pub alerts: Vec<QualityAlert>,
}

impl QualityReport {
    pub fn has_alert(&self, kind: AlertKind) -> bool {
        self.alerts.iter().any(|a| a.kind == kind)
    }
}

/// Aggregate over every completed document of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunQualitySummary {
    pub documents: usize,
    pub total_quotes: usize,
    pub total_connections: usize,
    pub mean_connection_rate: f64,
    pub over_connecting: usize,
    pub under_connecting: usize,
    pub narrow_confidence: usize,
}

pub struct QualityGate {
    thresholds: QualityThresholds,
}

impl QualityGate {
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self { thresholds }
    }

    pub fn assess(&self, quotes: &[Quote], connections: &[ThematicConnection]) -> QualityReport {
        let edges: Vec<&ThematicConnection> =
            connections.iter().filter(|c| c.relation_kind.is_edge()).collect();

        let mut touched: HashSet<&str> = HashSet::new();
        for connection in &edges {
            touched.insert(connection.from_quote_id.as_str());
            touched.insert(connection.to_quote_id.as_str());
        }
        let connected_quotes = quotes.iter().filter(|q| touched.contains(q.id.as_str())).count();
        let connection_rate = if quotes.is_empty() {
            0.0
        } else {
            connected_quotes as f64 / quotes.len() as f64
        };

        let mut confidence_histogram = vec![0; HISTOGRAM_BINS];
        let mut distinct: HashSet<i64> = HashSet::new();
        for connection in &edges {
            let confidence = connection.confidence.clamp(0.0, 1.0);
            let bin = ((confidence * HISTOGRAM_BINS as f64) as usize).min(HISTOGRAM_BINS - 1);
            confidence_histogram[bin] += 1;
            distinct.insert((confidence * 100.0).round() as i64);
        }

        let mut report = QualityReport {
            total_quotes: quotes.len(),
            connected_quotes,
            connection_count: edges.len(),
            connection_rate,
            confidence_histogram,
            distinct_confidence_values: distinct.len(),
            alerts: Vec::new(),
        };
        report.alerts = self.alerts_for(&report);
        report
    }

    fn alerts_for(&self, report: &QualityReport) -> Vec<QualityAlert> {
        let t = &self.thresholds;
        let mut alerts = Vec::new();

        if report.total_quotes > 0 && report.connection_rate > t.over_connecting_rate {
            alerts.push(QualityAlert {
                kind: AlertKind::OverConnecting,
                message: format!(
                    "likely over-connecting: {:.0}% of quotes connected (threshold {:.0}%)",
                    report.connection_rate * 100.0,
                    t.over_connecting_rate * 100.0
                ),
            });
        }

        if report.total_quotes >= t.min_quotes_for_under_connecting
            && report.connection_rate < t.under_connecting_rate
        {
            alerts.push(QualityAlert {
                kind: AlertKind::UnderConnecting,
                message: format!(
                    "likely under-connecting: {:.0}% of {} quotes connected (threshold {:.0}%)",
                    report.connection_rate * 100.0,
                    report.total_quotes,
                    t.under_connecting_rate * 100.0
                ),
            });
        }

        if report.connection_count >= t.min_connections_for_calibration
            && report.distinct_confidence_values < t.min_distinct_confidences
        {
            alerts.push(QualityAlert {
                kind: AlertKind::NarrowConfidence,
                message: format!(
                    "confidence clustered in {} distinct value(s) across {} connections",
                    report.distinct_confidence_values, report.connection_count
                ),
            });
        }

        alerts
    }

    pub fn summarize<'a>(reports: impl IntoIterator<Item = &'a QualityReport>) -> RunQualitySummary {
        let mut summary = RunQualitySummary::default();
        let mut rate_sum = 0.0;

        for report in reports {
            summary.documents += 1;
            summary.total_quotes += report.total_quotes;
            summary.total_connections += report.connection_count;
            rate_sum += report.connection_rate;
            for alert in &report.alerts {
                match alert.kind {
                    AlertKind::OverConnecting => summary.over_connecting += 1,
                    AlertKind::UnderConnecting => summary.under_connecting += 1,
                    AlertKind::NarrowConfidence => summary.narrow_confidence += 1,
                }
            }
        }

        if summary.documents > 0 {
            summary.mean_connection_rate = rate_sum / summary.documents as f64;
        }
        summary
    }
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::new(QualityThresholds::default())
    }
}
