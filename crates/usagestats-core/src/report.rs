//! Report views over stored snapshots for the admin API.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use serde::Serialize;

use crate::model::{AppBreakdown, Horizon, Snapshot};

/// One application's breakdowns across the four horizons of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppTrend {
    pub app_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily: Option<AppBreakdown>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub weekly: Option<AppBreakdown>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly: Option<AppBreakdown>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub forever: Option<AppBreakdown>,
}

impl AppTrend {
    fn slot(&mut self, horizon: Horizon) -> &mut Option<AppBreakdown> {
        match horizon {
            Horizon::Daily => &mut self.daily,
            Horizon::Weekly => &mut self.weekly,
            Horizon::Monthly => &mut self.monthly,
            Horizon::Forever => &mut self.forever,
        }
    }

    fn daily_owners(&self) -> u64 {
        self.daily.as_ref().map_or(0, |app| app.distinct_owners)
    }
}

/// Pivot a snapshot's per-horizon app maps into one row per application.
///
/// Rows are ordered by daily distinct owners (descending), then app id.
pub fn pivot_apps(snapshot: &Snapshot) -> Vec<AppTrend> {
    let mut trends: BTreeMap<&str, AppTrend> = BTreeMap::new();
    for (horizon, window) in &snapshot.windows {
        for (app_id, breakdown) in &window.apps {
            let trend = trends.entry(app_id.as_str()).or_insert_with(|| AppTrend {
                app_id: app_id.clone(),
                ..Default::default()
            });
            *trend.slot(*horizon) = Some(breakdown.clone());
        }
    }

    let mut rows: Vec<AppTrend> = trends.into_values().collect();
    rows.sort_by(|a, b| {
        b.daily_owners()
            .cmp(&a.daily_owners())
            .then_with(|| a.app_id.cmp(&b.app_id))
    });
    rows
}

/// A stored snapshot labelled with the day it describes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPoint {
    /// Calendar date (UTC) of the midpoint of the sample period.
    pub day: NaiveDate,
    pub snapshot: Snapshot,
}

/// History newest-first, each entry labelled with its sample-period midpoint.
pub fn history_points(history: &[Snapshot]) -> Vec<HistoryPoint> {
    let mut points: Vec<HistoryPoint> = history
        .iter()
        .map(|snapshot| HistoryPoint {
            day: (snapshot.timestamp - Duration::hours(12)).date_naive(),
            snapshot: snapshot.clone(),
        })
        .collect();
    points.sort_by(|a, b| b.snapshot.timestamp.cmp(&a.snapshot.timestamp));
    points
}
