//! Aggregated processing metrics and alert predicates.
//!
//! A read-model over audit records and processing attempts: everything here
//! is derived and rebuildable, never authoritative state. Aggregation queries
//! live in [`crate::storage::metrics`]; this module holds the result shapes
//! and the pure alert logic evaluated over them.

use serde::{Deserialize, Serialize};

use crate::models::EventKind;

/// Per-event-type rollup for a time bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTypeStats {
    /// Event type this row aggregates.
    pub event_type: EventKind,

    /// Total events of this type in the bucket.
    pub count: i64,

    /// Events that reached `succeeded`.
    pub success_count: i64,

    /// Mean latency from receipt to terminal state, in milliseconds.
    pub avg_latency_ms: Option<f64>,

    /// 95th-percentile latency, in milliseconds.
    pub p95_latency_ms: Option<f64>,
}

impl EventTypeStats {
    /// Fraction of events that succeeded, in `[0, 1]`.
    ///
    /// Returns 1.0 for an empty bucket so that absence of traffic never
    /// trips a success-rate alert.
    pub fn success_rate(&self) -> f64 {
        if self.count == 0 {
            return 1.0;
        }
        self.success_count as f64 / self.count as f64
    }
}

/// Service-wide rollup for the dashboard overview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverviewStats {
    /// Total events admitted.
    pub total_events: i64,

    /// Events in `succeeded`.
    pub succeeded: i64,

    /// Events in `dead_lettered`.
    pub dead_lettered: i64,

    /// Events waiting on a retry ticket.
    pub pending_retries: i64,

    /// Unresolved dead-letter entries.
    pub dead_letter_backlog: i64,
}

impl OverviewStats {
    /// Overall success rate across terminal events, in `[0, 1]`.
    pub fn success_rate(&self) -> f64 {
        let terminal = self.succeeded + self.dead_lettered;
        if terminal == 0 {
            return 1.0;
        }
        self.succeeded as f64 / terminal as f64
    }
}

/// Thresholds the alert predicates evaluate against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPolicy {
    /// Alert when a type's success rate drops below this fraction.
    pub min_success_rate: f64,

    /// Alert when a type's average latency exceeds this target.
    pub latency_slo_ms: f64,

    /// Alert when unresolved dead-letter entries exceed this count.
    pub max_dead_letter_backlog: i64,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            min_success_rate: 0.95,
            latency_slo_ms: 60_000.0,
            max_dead_letter_backlog: 10,
        }
    }
}

/// A threshold breach detected by [`AlertPolicy::evaluate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    /// An event type's success rate fell below the policy floor.
    LowSuccessRate {
        /// Affected event type.
        event_type: EventKind,
        /// Observed success rate.
        rate: f64,
        /// Policy floor that was breached.
        threshold: f64,
    },

    /// An event type's average latency exceeded its SLO.
    LatencyAboveTarget {
        /// Affected event type.
        event_type: EventKind,
        /// Observed average latency in milliseconds.
        avg_latency_ms: f64,
        /// SLO target in milliseconds.
        slo_ms: f64,
    },

    /// Unresolved dead-letter entries exceeded the backlog ceiling.
    DeadLetterBacklog {
        /// Current unresolved entry count.
        size: i64,
        /// Policy ceiling that was breached.
        threshold: i64,
    },
}

impl AlertPolicy {
    /// Evaluates all alert predicates over the current aggregates.
    ///
    /// Pure function of its inputs: no storage access, re-evaluated on every
    /// dashboard query rather than maintained as state.
    pub fn evaluate(&self, overview: &OverviewStats, per_type: &[EventTypeStats]) -> Vec<Alert> {
        let mut alerts = Vec::new();

        for stats in per_type {
            let rate = stats.success_rate();
            if rate < self.min_success_rate {
                alerts.push(Alert::LowSuccessRate {
                    event_type: stats.event_type.clone(),
                    rate,
                    threshold: self.min_success_rate,
                });
            }

            if let Some(avg) = stats.avg_latency_ms {
                if avg > self.latency_slo_ms {
                    alerts.push(Alert::LatencyAboveTarget {
                        event_type: stats.event_type.clone(),
                        avg_latency_ms: avg,
                        slo_ms: self.latency_slo_ms,
                    });
                }
            }
        }

        if overview.dead_letter_backlog > self.max_dead_letter_backlog {
            alerts.push(Alert::DeadLetterBacklog {
                size: overview.dead_letter_backlog,
                threshold: self.max_dead_letter_backlog,
            });
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(event_type: EventKind, count: i64, success: i64, avg_ms: Option<f64>) -> EventTypeStats {
        EventTypeStats {
            event_type,
            count,
            success_count: success,
            avg_latency_ms: avg_ms,
            p95_latency_ms: avg_ms.map(|v| v * 2.0),
        }
    }

    fn quiet_overview() -> OverviewStats {
        OverviewStats {
            total_events: 100,
            succeeded: 98,
            dead_lettered: 2,
            pending_retries: 0,
            dead_letter_backlog: 0,
        }
    }

    #[test]
    fn empty_bucket_counts_as_healthy() {
        let s = stats(EventKind::PaymentSucceeded, 0, 0, None);
        assert_eq!(s.success_rate(), 1.0);

        let alerts = AlertPolicy::default().evaluate(&quiet_overview(), &[s]);
        assert!(alerts.is_empty());
    }

    #[test]
    fn low_success_rate_raises_alert() {
        let s = stats(EventKind::PaymentFailed, 10, 7, Some(150.0));
        let alerts = AlertPolicy::default().evaluate(&quiet_overview(), &[s]);

        assert_eq!(alerts.len(), 1);
        match &alerts[0] {
            Alert::LowSuccessRate { event_type, rate, .. } => {
                assert_eq!(*event_type, EventKind::PaymentFailed);
                assert!((rate - 0.7).abs() < 1e-9);
            },
            other => panic!("unexpected alert: {other:?}"),
        }
    }

    #[test]
    fn latency_above_slo_raises_alert() {
        let policy = AlertPolicy {
            latency_slo_ms: 500.0,
            ..AlertPolicy::default()
        };
        let s = stats(EventKind::InvoiceFinalized, 20, 20, Some(900.0));
        let alerts = policy.evaluate(&quiet_overview(), &[s]);

        assert!(matches!(alerts[0], Alert::LatencyAboveTarget { slo_ms, .. } if slo_ms == 500.0));
    }

    #[test]
    fn backlog_over_ceiling_raises_alert() {
        let mut overview = quiet_overview();
        overview.dead_letter_backlog = 11;

        let alerts = AlertPolicy::default().evaluate(&overview, &[]);
        assert_eq!(alerts, vec![Alert::DeadLetterBacklog { size: 11, threshold: 10 }]);
    }

    #[test]
    fn overview_success_rate_ignores_in_flight_events() {
        let overview = OverviewStats {
            total_events: 10,
            succeeded: 4,
            dead_lettered: 1,
            pending_retries: 5,
            dead_letter_backlog: 1,
        };
        assert!((overview.success_rate() - 0.8).abs() < 1e-9);
    }
}
