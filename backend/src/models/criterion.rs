//! The fixed catalogue of risk criteria.

use serde::Serialize;

/// One scoring criterion. The catalogue is fixed; ids are stable and
/// referenced by event_scores and effective_scores rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Criterion {
    pub id: i64,
    pub slug: &'static str,
}

pub const CRITERIA: [Criterion; 6] = [
    Criterion { id: 1, slug: "it_security" },
    Criterion { id: 2, slug: "performance_degradation" },
    Criterion { id: 3, slug: "failure_prediction" },
    Criterion { id: 4, slug: "anomaly" },
    Criterion { id: 5, slug: "compliance_audit" },
    Criterion { id: 6, slug: "operational_risk" },
];

pub fn criterion_by_slug(slug: &str) -> Option<&'static Criterion> {
    CRITERIA.iter().find(|c| c.slug == slug)
}

pub fn criterion_by_id(id: i64) -> Option<&'static Criterion> {
    CRITERIA.iter().find(|c| c.id == id)
}
