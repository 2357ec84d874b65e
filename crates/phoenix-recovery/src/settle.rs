//! Waiting for every cluster operator to reach steady state
//!
//! An operator is settled when Available=True, Progressing=False and
//! Degraded=False. A missing condition is never settled. Listing errors are
//! treated as "not yet": the API may still be flapping while the last operands
//! roll out. If nothing was ever listed, the wait fails instead of reporting an
//! empty (and therefore vacuously healthy) cluster.

use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use phoenix_common::crd::{
    find_condition, ClusterOperator, Condition, ConditionStatus, CONDITION_AVAILABLE,
    CONDITION_DEGRADED, CONDITION_PROGRESSING,
};
use phoenix_common::{poll_until, Error, PollSpec, Result};

use crate::client::ClusterStateClient;

/// Column headers of the unsettled-operator table
pub const REPORT_HEADERS: [&str; 8] = [
    "NAMESPACE",
    "NAME",
    "AVAILABLE",
    "PROGRESSING",
    "DEGRADED",
    "VERSION",
    "SINCE",
    "MESSAGE",
];

/// The one tolerated deviation from steady state.
///
/// Applies to a single named operator, a single condition (never
/// `Available`) and only while that condition reports `reason`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SettleExemption {
    /// ClusterOperator name
    pub operator: String,
    /// Condition type
    pub condition: String,
    /// Reason the condition must report
    pub reason: String,
}

impl SettleExemption {
    /// Whether `condition` on `operator` is excused
    pub fn tolerates(&self, operator: &str, condition: &Condition) -> bool {
        condition.type_ != CONDITION_AVAILABLE
            && self.operator == operator
            && self.condition == condition.type_
            && condition.reason.as_deref() == Some(self.reason.as_str())
    }
}

/// Health of one operator as seen by the settle check
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OperatorSummary {
    /// Operator namespace, if it reports one
    pub namespace: Option<String>,
    /// ClusterOperator name
    pub name: String,
    /// Available status, `None` if missing
    pub available: Option<ConditionStatus>,
    /// Progressing status, `None` if missing
    pub progressing: Option<ConditionStatus>,
    /// Degraded status, `None` if missing
    pub degraded: Option<ConditionStatus>,
    /// Operator version
    pub version: Option<String>,
    /// Latest transition among the unhealthy conditions
    pub since: Option<DateTime<Utc>>,
    /// Unhealthy conditions, `<Type>=<Status> (<Reason>): <message>`, joined by `; `
    pub message: String,
    /// Settled, after applying the exemption
    pub settled: bool,
}

impl OperatorSummary {
    /// Summarize one operator
    pub fn from_operator(operator: &ClusterOperator, exemption: Option<&SettleExemption>) -> Self {
        let name = operator.metadata.name.clone().unwrap_or_default();
        let conditions = operator.conditions();

        let mut problems = Vec::new();
        let mut since: Option<DateTime<Utc>> = None;
        for (type_, healthy) in [
            (CONDITION_AVAILABLE, ConditionStatus::True),
            (CONDITION_PROGRESSING, ConditionStatus::False),
            (CONDITION_DEGRADED, ConditionStatus::False),
        ] {
            match find_condition(conditions, type_) {
                Some(c) if c.status == healthy => {}
                Some(c) if exemption.is_some_and(|e| e.tolerates(&name, c)) => {
                    debug!(operator = %name, condition = %type_, "condition exempted from settle check");
                }
                Some(c) => {
                    problems.push(describe_condition(c));
                    since = since.max(c.last_transition_time);
                }
                None => problems.push(format!("{type_}=-")),
            }
        }

        Self {
            namespace: operator.namespace().map(str::to_string),
            available: find_condition(conditions, CONDITION_AVAILABLE).map(|c| c.status),
            progressing: find_condition(conditions, CONDITION_PROGRESSING).map(|c| c.status),
            degraded: find_condition(conditions, CONDITION_DEGRADED).map(|c| c.status),
            version: operator.version().map(str::to_string),
            since,
            settled: problems.is_empty(),
            message: problems.join("; "),
            name,
        }
    }

    fn row(&self) -> Vec<String> {
        let status = |s: Option<ConditionStatus>| s.map_or_else(|| "-".to_string(), |s| s.to_string());
        vec![
            self.namespace.clone().unwrap_or_else(|| "-".to_string()),
            self.name.clone(),
            status(self.available),
            status(self.progressing),
            status(self.degraded),
            self.version.clone().unwrap_or_else(|| "-".to_string()),
            self.since.as_ref().map_or_else(|| "-".to_string(), format_age),
            if self.message.is_empty() {
                "-".to_string()
            } else {
                self.message.clone()
            },
        ]
    }
}

fn describe_condition(c: &Condition) -> String {
    let mut out = format!("{}={}", c.type_, c.status);
    if let Some(reason) = c.reason.as_deref().filter(|r| !r.is_empty()) {
        out.push_str(&format!(" ({reason})"));
    }
    if let Some(message) = c.message.as_deref().filter(|m| !m.is_empty()) {
        out.push_str(&format!(": {message}"));
    }
    out
}

/// Health of every observed operator
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SettleReport {
    /// One entry per observed operator, in listing order
    pub operators: Vec<OperatorSummary>,
}

impl SettleReport {
    /// Summarize a listing
    pub fn new(operators: &[ClusterOperator], exemption: Option<&SettleExemption>) -> Self {
        Self {
            operators: operators
                .iter()
                .map(|o| OperatorSummary::from_operator(o, exemption))
                .collect(),
        }
    }

    /// Settled iff at least one operator was observed and all are settled
    pub fn is_settled(&self) -> bool {
        !self.operators.is_empty() && self.operators.iter().all(|o| o.settled)
    }

    /// Operators that are not settled
    pub fn unsettled(&self) -> impl Iterator<Item = &OperatorSummary> {
        self.operators.iter().filter(|o| !o.settled)
    }

    /// Names of the unsettled operators
    pub fn unsettled_names(&self) -> Vec<String> {
        self.unsettled().map(|o| o.name.clone()).collect()
    }

    /// Column-aligned table of the unsettled operators
    pub fn render_unsettled(&self) -> String {
        let rows: Vec<Vec<String>> = self.unsettled().map(OperatorSummary::row).collect();
        render_table(&REPORT_HEADERS, &rows)
    }

    /// The failure this report represents
    pub fn into_error(self) -> Error {
        let table = self.render_unsettled();
        Error::Unsettled {
            unsettled: self.unsettled_names(),
            table,
        }
    }
}

/// Waits for the cluster operators to settle
pub struct ClusterSettleMonitor {
    client: Arc<dyn ClusterStateClient>,
    exemption: Option<SettleExemption>,
}

impl ClusterSettleMonitor {
    /// Create a monitor
    pub fn new(client: Arc<dyn ClusterStateClient>, exemption: Option<SettleExemption>) -> Self {
        Self { client, exemption }
    }

    /// Current health of every operator
    pub async fn snapshot(&self) -> Result<SettleReport> {
        let operators = self.client.list_cluster_operators().await?;
        Ok(SettleReport::new(&operators, self.exemption.as_ref()))
    }

    /// Poll until every operator is settled.
    ///
    /// On timeout fails with [`Error::Unsettled`] carrying the table of the
    /// last observation, or with [`Error::PollTimeout`] if no operator was
    /// ever listed.
    pub async fn wait_for_settle(&self, spec: PollSpec) -> Result<SettleReport> {
        let last_report: Mutex<Option<SettleReport>> = Mutex::new(None);
        let last_error: Mutex<Option<String>> = Mutex::new(None);

        let result = {
            let (last_report, last_error) = (&last_report, &last_error);
            poll_until("cluster operators to settle", spec, || async move {
                let report = match self.snapshot().await {
                    Ok(report) => report,
                    Err(e) => {
                        warn!(error = %e, "unable to list cluster operators");
                        set(last_error, Some(e.to_string()));
                        return Ok(false);
                    }
                };
                set(last_error, None);

                let settled = report.is_settled();
                if !settled {
                    let unsettled = report.unsettled_names();
                    debug!(
                        observed = report.operators.len(),
                        unsettled = %unsettled.join(", "),
                        "operators still doing work"
                    );
                }
                set(last_report, Some(report));
                Ok(settled)
            })
            .await
        };

        let report = take(&last_report);
        match result {
            Ok(()) => {
                let report = report.unwrap_or_default();
                info!(operators = report.operators.len(), "cluster operators settled");
                Ok(report)
            }
            Err(e) if e.is_timeout() => match report {
                Some(report) if !report.operators.is_empty() => {
                    let err = report.into_error();
                    if let Error::Unsettled { table, .. } = &err {
                        warn!("cluster operators never settled:\n{table}");
                    }
                    Err(err)
                }
                _ => {
                    let cause = take(&last_error).unwrap_or_else(|| "empty list".to_string());
                    Err(Error::poll_timeout(
                        format!("any cluster operator to be observed (last result: {cause})"),
                        spec.timeout,
                    ))
                }
            },
            Err(e) => Err(e),
        }
    }
}

fn set<T>(slot: &Mutex<Option<T>>, value: Option<T>) {
    if let Ok(mut guard) = slot.lock() {
        *guard = value;
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().ok().and_then(|mut guard| guard.take())
}

/// Age of a timestamp as a short string (`45s`, `3m`, `2h`, `1d`)
pub fn format_age(timestamp: &DateTime<Utc>) -> String {
    let duration = Utc::now().signed_duration_since(*timestamp);
    if duration.num_seconds() < 0 {
        return "0s".to_string();
    }
    if duration.num_days() > 0 {
        return format!("{}d", duration.num_days());
    }
    if duration.num_hours() > 0 {
        return format!("{}h", duration.num_hours());
    }
    if duration.num_minutes() > 0 {
        return format!("{}m", duration.num_minutes());
    }
    format!("{}s", duration.num_seconds())
}

/// Render rows as a column-aligned table with headers
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut lines = vec![pad_line(headers.iter().copied(), &widths)];
    lines.extend(rows.iter().map(|row| pad_line(row.iter().map(String::as_str), &widths)));
    lines.join("\n")
}

fn pad_line<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    cells
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
        .collect::<Vec<_>>()
        .join("  ")
        .trim_end()
        .to_string()
}
