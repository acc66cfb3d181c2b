//! Metrics definitions for the assigner.

use shared::metrics_defs::{MetricDef, MetricType};

pub const ASSIGNMENTS: MetricDef = MetricDef {
    name: "assignment.count",
    metric_type: MetricType::Counter,
    description: "Number of variant assignments served. Tagged with test, variant.",
};

pub const ASSIGNMENTS_REJECTED: MetricDef = MetricDef {
    name: "assignment.rejected",
    metric_type: MetricType::Counter,
    description: "Number of assignment requests rejected. Tagged with reason.",
};

pub const CONSENT_CHANGES: MetricDef = MetricDef {
    name: "consent.changes",
    metric_type: MetricType::Counter,
    description: "Number of consent changes applied to identity cookies. Tagged with consent.",
};

pub const SALT_ROTATIONS: MetricDef = MetricDef {
    name: "identity.salt.rotations",
    metric_type: MetricType::Counter,
    description: "Number of times the daily identity salt was regenerated",
};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Request duration in seconds. Tagged with status.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of requests currently being processed",
};

pub const ALL_METRICS: &[MetricDef] = &[
    ASSIGNMENTS,
    ASSIGNMENTS_REJECTED,
    CONSENT_CHANGES,
    SALT_ROTATIONS,
    REQUEST_DURATION,
    REQUESTS_INFLIGHT,
];
