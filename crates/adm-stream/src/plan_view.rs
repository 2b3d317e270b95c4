//! Plan grouping over an event snapshot.
//!
//! Everything here is derived on demand from the snapshot plus a selection,
//! so it cannot drift from the store.

use adm_core::StreamEvent;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PlanSelection {
    #[default]
    All,
    Plan(String),
}

impl PlanSelection {
    pub fn plan_id(&self) -> Option<&str> {
        match self {
            PlanSelection::All => None,
            PlanSelection::Plan(plan_id) => Some(plan_id),
        }
    }

    pub fn matches(&self, event: &StreamEvent) -> bool {
        match self {
            PlanSelection::All => true,
            PlanSelection::Plan(plan_id) => correlation_id(event) == Some(plan_id.as_str()),
        }
    }
}

impl From<Option<String>> for PlanSelection {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(plan_id) => plan_id.parse().unwrap_or_default(),
            None => PlanSelection::All,
        }
    }
}

impl FromStr for PlanSelection {
    type Err = Infallible;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
            Ok(PlanSelection::All)
        } else {
            Ok(PlanSelection::Plan(trimmed.to_string()))
        }
    }
}

impl fmt::Display for PlanSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanSelection::All => f.write_str("all"),
            PlanSelection::Plan(plan_id) => f.write_str(plan_id),
        }
    }
}

/// `plan_id` from the payload, else `original_plan_id` (replanned runs).
pub fn correlation_id(event: &StreamEvent) -> Option<&str> {
    event
        .payload_str("plan_id")
        .or_else(|| event.payload_str("original_plan_id"))
}

/// Distinct correlation ids in snapshot order.
pub fn known_plan_ids(events: &[StreamEvent]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut plan_ids = Vec::new();
    for plan_id in events.iter().filter_map(correlation_id) {
        if seen.insert(plan_id) {
            plan_ids.push(plan_id.to_string());
        }
    }
    plan_ids
}

pub fn filter_events<'a>(
    events: &'a [StreamEvent],
    selection: &PlanSelection,
) -> Vec<&'a StreamEvent> {
    events
        .iter()
        .filter(|event| selection.matches(event))
        .collect()
}

/// Keep the selection while its plan is still known; otherwise fall back to
/// the first known plan, or to `All` when there is none.
pub fn reconcile_selection(current: &PlanSelection, known: &[String]) -> PlanSelection {
    match current {
        PlanSelection::All => PlanSelection::All,
        PlanSelection::Plan(plan_id) if known.iter().any(|known| known == plan_id) => {
            current.clone()
        }
        PlanSelection::Plan(_) => known
            .first()
            .map(|plan_id| PlanSelection::Plan(plan_id.clone()))
            .unwrap_or(PlanSelection::All),
    }
}

/// Newest first by parsed timestamp; unparsable timestamps go last and keep
/// their relative order.
pub fn sort_by_timestamp(events: &mut [&StreamEvent]) {
    events.sort_by(|left, right| {
        compare_newest_first(left.timestamp_utc(), right.timestamp_utc())
    });
}

fn compare_newest_first(left: Option<DateTime<Utc>>, right: Option<DateTime<Utc>>) -> Ordering {
    match (left, right) {
        (Some(left), Some(right)) => right.cmp(&left),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanView {
    pub plan_ids: Vec<String>,
    pub selection: PlanSelection,
    pub events: Vec<StreamEvent>,
}

impl PlanView {
    /// Reconciles `selection` against the snapshot before filtering.
    pub fn derive(snapshot: &[StreamEvent], selection: &PlanSelection) -> Self {
        let plan_ids = known_plan_ids(snapshot);
        let selection = reconcile_selection(selection, &plan_ids);
        let events = filter_events(snapshot, &selection)
            .into_iter()
            .cloned()
            .collect();
        Self {
            plan_ids,
            selection,
            events,
        }
    }
}
