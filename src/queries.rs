//! Read models for the dashboard screens.
//!
//! Pure functions over snapshots of the store's collections. Nothing here
//! mutates state or talks to the backend.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::{
    Account, AccountLevel, ActivityNote, ActivityType, PipelineStage, Profile, Region, UsageRecord,
    UsageType,
};

// =============================================================================
// Account list: filter + sort
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortKey {
    #[default]
    Name,
    Region,
    Level,
    Stage,
    LastVisit,
    ChargePerUse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// Account list ordering, persisted in the preference store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortConfig {
    pub key: SortKey,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Default)]
pub struct AccountFilter {
    pub region: Option<Region>,
    pub level: Option<AccountLevel>,
    pub stage: Option<PipelineStage>,
    /// Case-insensitive substring of the account name.
    pub search: Option<String>,
}

impl AccountFilter {
    fn matches(&self, account: &Account, needle: Option<&str>) -> bool {
        self.region.map_or(true, |r| account.region == r)
            && self.level.map_or(true, |l| account.level == l)
            && self.stage.map_or(true, |s| account.pipeline_stage == s)
            && needle.map_or(true, |n| account.name.to_lowercase().contains(n))
    }
}

fn compare_accounts(a: &Account, b: &Account, key: SortKey) -> Ordering {
    let primary = match key {
        SortKey::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        SortKey::Region => a.region.cmp(&b.region),
        SortKey::Level => a.level.cmp(&b.level),
        SortKey::Stage => a.pipeline_stage.cmp(&b.pipeline_stage),
        SortKey::LastVisit => a.last_visit_date.cmp(&b.last_visit_date),
        SortKey::ChargePerUse => a
            .charge_per_use
            .unwrap_or(-1.0)
            .partial_cmp(&b.charge_per_use.unwrap_or(-1.0))
            .unwrap_or(Ordering::Equal),
    };
    primary.then_with(|| a.name.cmp(&b.name))
}

pub fn filter_accounts(
    accounts: &[Account],
    filter: &AccountFilter,
    sort: &SortConfig,
) -> Vec<Account> {
    let needle = filter
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase);

    let mut result: Vec<Account> = accounts
        .iter()
        .filter(|a| filter.matches(a, needle.as_deref()))
        .cloned()
        .collect();

    result.sort_by(|a, b| {
        let ordering = compare_accounts(a, b, sort.key);
        match sort.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    });
    result
}

// =============================================================================
// Pipeline summary
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageCount {
    pub stage: PipelineStage,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSummary {
    /// One entry per stage, in funnel order, zeros included.
    pub stages: Vec<StageCount>,
    pub open_accounts: usize,
    pub equipped_accounts: usize,
    pub never_visited: usize,
    /// Closed-won share of closed accounts, if any are closed.
    pub win_rate: Option<f64>,
}

pub fn pipeline_summary(accounts: &[Account]) -> PipelineSummary {
    let stages: Vec<StageCount> = PipelineStage::ALL
        .iter()
        .map(|stage| StageCount {
            stage: *stage,
            count: accounts
                .iter()
                .filter(|a| a.pipeline_stage == *stage)
                .count(),
        })
        .collect();

    let won = accounts
        .iter()
        .filter(|a| a.pipeline_stage == PipelineStage::ClosedWon)
        .count();
    let closed = accounts
        .iter()
        .filter(|a| a.pipeline_stage.is_closed())
        .count();

    PipelineSummary {
        stages,
        open_accounts: accounts.len() - closed,
        equipped_accounts: accounts.iter().filter(|a| a.equipment_installed()).count(),
        never_visited: accounts
            .iter()
            .filter(|a| a.last_visit_date.date().is_none())
            .count(),
        win_rate: (closed > 0).then(|| won as f64 / closed as f64),
    }
}

// =============================================================================
// Activity feed with role visibility
// =============================================================================

/// Whose activity to show.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthorFilter {
    #[default]
    Mine,
    All,
    User(String),
}

/// Notes the viewer may see under `filter`, newest first.
///
/// Sales reps only ever see their own notes, whatever filter they ask for.
/// With no viewer profile nothing is visible.
pub fn activity_feed(
    notes: &[ActivityNote],
    viewer: Option<&Profile>,
    filter: &AuthorFilter,
) -> Vec<ActivityNote> {
    let Some(viewer) = viewer else {
        return Vec::new();
    };

    let effective = if viewer.role_type.can_view_all() {
        filter.clone()
    } else {
        AuthorFilter::Mine
    };

    let mut visible: Vec<ActivityNote> = notes
        .iter()
        .filter(|note| match &effective {
            AuthorFilter::Mine => note.author_id == viewer.id,
            AuthorFilter::All => true,
            AuthorFilter::User(id) => &note.author_id == id,
        })
        .cloned()
        .collect();
    visible.sort_by(|a, b| b.activity_date.cmp(&a.activity_date));
    visible
}

// =============================================================================
// Calendar
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum CalendarKind {
    Activity { activity_type: ActivityType },
    NextStep,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEntry {
    pub date: NaiveDate,
    pub account_id: String,
    pub note_id: String,
    pub title: String,
    pub kind: CalendarKind,
}

/// Logged activities and scheduled next steps falling in `[from, to]`, by date.
pub fn calendar(notes: &[ActivityNote], from: NaiveDate, to: NaiveDate) -> Vec<CalendarEntry> {
    let in_range = |date: NaiveDate| date >= from && date <= to;
    let mut entries = Vec::new();

    for note in notes {
        if in_range(note.activity_date) {
            entries.push(CalendarEntry {
                date: note.activity_date,
                account_id: note.account_id.clone(),
                note_id: note.id.clone(),
                title: first_line(&note.content),
                kind: CalendarKind::Activity {
                    activity_type: note.activity_type,
                },
            });
        }
        if let (Some(step), Some(date)) = (&note.next_step, note.next_step_date) {
            if in_range(date) {
                entries.push(CalendarEntry {
                    date,
                    account_id: note.account_id.clone(),
                    note_id: note.id.clone(),
                    title: step.clone(),
                    kind: CalendarKind::NextStep,
                });
            }
        }
    }

    entries.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.note_id.cmp(&b.note_id)));
    entries
}

fn first_line(content: &str) -> String {
    content.lines().next().unwrap_or("").trim().to_string()
}

// =============================================================================
// Usage totals
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotal {
    pub product_code: String,
    pub ordered: u64,
    pub sampled: u64,
}

/// Per-product order/sample quantities, optionally for one account only.
pub fn usage_totals(records: &[UsageRecord], account_id: Option<&str>) -> Vec<UsageTotal> {
    let mut totals: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
    for record in records
        .iter()
        .filter(|r| account_id.map_or(true, |id| r.account_id == id))
    {
        let entry = totals.entry(record.product_code.as_str()).or_default();
        match record.usage_type {
            UsageType::Order => entry.0 += u64::from(record.quantity),
            UsageType::Sample => entry.1 += u64::from(record.quantity),
        }
    }
    totals
        .into_iter()
        .map(|(code, (ordered, sampled))| UsageTotal {
            product_code: code.to_string(),
            ordered,
            sampled,
        })
        .collect()
}
