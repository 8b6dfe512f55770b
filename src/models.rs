//! Domain entities for the field CRM.
//!
//! Wire rows (`AccountRow`) are kept separate from the domain `Account`, which
//! also carries its installed equipment so the `equipment_installed` flag can
//! be derived instead of stored.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::CrmError;

// =============================================================================
// Enumerations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Region {
    North,
    Central,
    South,
    East,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccountLevel {
    LocalCommunity,
    Regional,
    MedicalCenter,
}

/// Sales funnel position. Declaration order is funnel order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PipelineStage {
    Lead,
    Qualification,
    Trial,
    Negotiation,
    ClosedWon,
    ClosedLost,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 6] = [
        PipelineStage::Lead,
        PipelineStage::Qualification,
        PipelineStage::Trial,
        PipelineStage::Negotiation,
        PipelineStage::ClosedWon,
        PipelineStage::ClosedLost,
    ];

    pub fn is_closed(&self) -> bool {
        matches!(self, PipelineStage::ClosedWon | PipelineStage::ClosedLost)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityType {
    Call,
    Meeting,
    Visit,
    Email,
    Note,
    Demo,
    Training,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsageType {
    Order,
    Sample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ownership {
    Lease,
    Purchase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleType {
    Sales,
    Manager,
    Admin,
}

impl RoleType {
    /// Managers and admins may look at any rep's activity.
    pub fn can_view_all(&self) -> bool {
        matches!(self, RoleType::Manager | RoleType::Admin)
    }
}

// =============================================================================
// Last visit
// =============================================================================

/// Date of the most recent activity at an account.
///
/// `Never` orders before every date, so "advance if newer" is a plain `<`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(from = "Option<NaiveDate>", into = "Option<NaiveDate>")]
pub enum LastVisit {
    #[default]
    Never,
    On(NaiveDate),
}

impl LastVisit {
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            LastVisit::Never => None,
            LastVisit::On(date) => Some(*date),
        }
    }
}

impl From<Option<NaiveDate>> for LastVisit {
    fn from(value: Option<NaiveDate>) -> Self {
        value.map(LastVisit::On).unwrap_or(LastVisit::Never)
    }
}

impl From<LastVisit> for Option<NaiveDate> {
    fn from(value: LastVisit) -> Self {
        value.date()
    }
}

impl fmt::Display for LastVisit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LastVisit::Never => write!(f, "Never"),
            LastVisit::On(date) => write!(f, "{}", date.format("%Y-%m-%d")),
        }
    }
}

// =============================================================================
// Accounts and equipment
// =============================================================================

/// A row from the `hospitals` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRow {
    pub id: String,
    pub name: String,
    pub region: Region,
    pub level: AccountLevel,
    pub pipeline_stage: PipelineStage,
    #[serde(default)]
    pub last_visit_date: LastVisit,
    #[serde(default)]
    pub charge_per_use: Option<f64>,
    #[serde(default)]
    pub equipment_installed: bool,
}

/// A row from the `installed_equipment` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Equipment {
    pub id: String,
    pub account_id: String,
    pub product_code: String,
    pub quantity: u32,
    pub install_date: NaiveDate,
    pub ownership: Ownership,
}

/// A hospital tracked through the sales pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub name: String,
    pub region: Region,
    pub level: AccountLevel,
    pub pipeline_stage: PipelineStage,
    pub last_visit_date: LastVisit,
    pub charge_per_use: Option<f64>,
    pub installed_equipment: Vec<Equipment>,
}

impl Account {
    /// Build an account from its row and the equipment rows that belong to it.
    ///
    /// The row's stored `equipment_installed` flag is ignored; the flag is
    /// always derived from the equipment list.
    pub fn from_row(row: AccountRow, equipment: Vec<Equipment>) -> Self {
        Self {
            id: row.id,
            name: row.name,
            region: row.region,
            level: row.level,
            pipeline_stage: row.pipeline_stage,
            last_visit_date: row.last_visit_date,
            charge_per_use: row.charge_per_use,
            installed_equipment: equipment,
        }
    }

    pub fn equipment_installed(&self) -> bool {
        !self.installed_equipment.is_empty()
    }

    pub fn to_row(&self) -> AccountRow {
        AccountRow {
            id: self.id.clone(),
            name: self.name.clone(),
            region: self.region,
            level: self.level,
            pipeline_stage: self.pipeline_stage,
            last_visit_date: self.last_visit_date,
            charge_per_use: self.charge_per_use,
            equipment_installed: self.equipment_installed(),
        }
    }
}

/// Payload for creating an account. New accounts start with no visits and no equipment.
#[derive(Debug, Clone, Serialize)]
pub struct NewAccount {
    pub name: String,
    pub region: Region,
    pub level: AccountLevel,
    pub pipeline_stage: PipelineStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_per_use: Option<f64>,
}

impl NewAccount {
    pub fn validate(&self) -> Result<(), CrmError> {
        require_text("account name", &self.name)?;
        validate_charge(self.charge_per_use)
    }

    pub(crate) fn to_insert(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name.trim(),
            "region": self.region,
            "level": self.level,
            "pipeline_stage": self.pipeline_stage,
            "charge_per_use": self.charge_per_use,
            "last_visit_date": null,
            "equipment_installed": false,
        })
    }
}

/// Field-level edit of an account. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<AccountLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_stage: Option<PipelineStage>,
    /// `Some(None)` clears the charge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_per_use: Option<Option<f64>>,
}

impl AccountPatch {
    pub fn validate(&self) -> Result<(), CrmError> {
        if let Some(name) = &self.name {
            require_text("account name", name)?;
        }
        validate_charge(self.charge_per_use.flatten())
    }

    /// Trim free-text fields. The store normalizes once, before the patch is
    /// both applied locally and written remotely.
    pub fn normalized(mut self) -> Self {
        self.name = self.name.map(|name| name.trim().to_string());
        self
    }

    pub fn apply(&self, account: &mut Account) {
        if let Some(name) = &self.name {
            account.name = name.clone();
        }
        if let Some(region) = self.region {
            account.region = region;
        }
        if let Some(level) = self.level {
            account.level = level;
        }
        if let Some(stage) = self.pipeline_stage {
            account.pipeline_stage = stage;
        }
        if let Some(charge) = self.charge_per_use {
            account.charge_per_use = charge;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewEquipment {
    pub account_id: String,
    pub product_code: String,
    pub quantity: u32,
    pub install_date: NaiveDate,
    pub ownership: Ownership,
}

impl NewEquipment {
    pub fn validate(&self) -> Result<(), CrmError> {
        require_text("product code", &self.product_code)?;
        require_quantity(self.quantity)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EquipmentPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ownership: Option<Ownership>,
}

impl EquipmentPatch {
    pub fn validate(&self) -> Result<(), CrmError> {
        if let Some(code) = &self.product_code {
            require_text("product code", code)?;
        }
        if let Some(quantity) = self.quantity {
            require_quantity(quantity)?;
        }
        Ok(())
    }

    pub fn normalized(mut self) -> Self {
        self.product_code = self.product_code.map(|code| code.trim().to_string());
        self
    }

    pub fn apply(&self, equipment: &mut Equipment) {
        if let Some(code) = &self.product_code {
            equipment.product_code = code.clone();
        }
        if let Some(quantity) = self.quantity {
            equipment.quantity = quantity;
        }
        if let Some(date) = self.install_date {
            equipment.install_date = date;
        }
        if let Some(ownership) = self.ownership {
            equipment.ownership = ownership;
        }
    }
}

// =============================================================================
// Contacts
// =============================================================================

/// A row from the `contacts` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub account_id: String,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub is_key_decision_maker: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewContact {
    pub account_id: String,
    pub name: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub is_key_decision_maker: bool,
}

impl NewContact {
    pub fn validate(&self) -> Result<(), CrmError> {
        require_text("contact name", &self.name)?;
        validate_email(self.email.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContactPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_key_decision_maker: Option<bool>,
}

impl ContactPatch {
    pub fn validate(&self) -> Result<(), CrmError> {
        if let Some(name) = &self.name {
            require_text("contact name", name)?;
        }
        validate_email(self.email.as_ref().and_then(|e| e.as_deref()))
    }

    pub fn normalized(mut self) -> Self {
        self.name = self.name.map(|name| name.trim().to_string());
        self
    }

    pub fn apply(&self, contact: &mut Contact) {
        if let Some(name) = &self.name {
            contact.name = name.clone();
        }
        if let Some(role) = &self.role {
            contact.role = role.clone();
        }
        if let Some(email) = &self.email {
            contact.email = email.clone();
        }
        if let Some(phone) = &self.phone {
            contact.phone = phone.clone();
        }
        if let Some(key) = self.is_key_decision_maker {
            contact.is_key_decision_maker = key;
        }
    }
}

// =============================================================================
// Activity notes
// =============================================================================

/// A row from the `notes` table: one logged activity at an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityNote {
    pub id: String,
    pub account_id: String,
    pub content: String,
    pub activity_date: NaiveDate,
    /// Profile id of the rep who logged the activity.
    pub author_id: String,
    pub activity_type: ActivityType,
    #[serde(default)]
    pub next_step: Option<String>,
    #[serde(default)]
    pub next_step_date: Option<NaiveDate>,
    #[serde(default)]
    pub sentiment: Option<Sentiment>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewNote {
    pub account_id: String,
    pub content: String,
    pub activity_date: NaiveDate,
    pub activity_type: ActivityType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_step_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<Sentiment>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NewNote {
    /// Minimal note: a plain `Note` activity with no follow-up.
    pub fn simple(account_id: &str, activity_date: NaiveDate, content: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            content: content.to_string(),
            activity_date,
            activity_type: ActivityType::Note,
            next_step: None,
            next_step_date: None,
            sentiment: None,
            tags: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), CrmError> {
        require_text("note content", &self.content)?;
        validate_next_step(self.next_step.as_deref(), self.next_step_date)
    }

    pub(crate) fn to_insert(&self, author_id: &str) -> Result<serde_json::Value, CrmError> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| CrmError::Validation(format!("Unserializable note: {}", e)))?;
        if let Some(map) = value.as_object_mut() {
            map.insert("author_id".to_string(), serde_json::json!(author_id));
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NotePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_type: Option<ActivityType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_step: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_step_date: Option<Option<NaiveDate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<Option<Sentiment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl NotePatch {
    pub fn validate(&self) -> Result<(), CrmError> {
        if let Some(content) = &self.content {
            require_text("note content", content)?;
        }
        Ok(())
    }

    /// The note as it would look after this patch, checked against the same
    /// follow-up rule a new note must satisfy.
    pub fn applied_to(&self, note: &ActivityNote) -> Result<ActivityNote, CrmError> {
        let mut patched = note.clone();
        self.apply(&mut patched);
        validate_next_step(patched.next_step.as_deref(), patched.next_step_date)?;
        Ok(patched)
    }

    pub fn apply(&self, note: &mut ActivityNote) {
        if let Some(content) = &self.content {
            note.content = content.clone();
        }
        if let Some(date) = self.activity_date {
            note.activity_date = date;
        }
        if let Some(kind) = self.activity_type {
            note.activity_type = kind;
        }
        if let Some(step) = &self.next_step {
            note.next_step = step.clone();
        }
        if let Some(date) = self.next_step_date {
            note.next_step_date = date;
        }
        if let Some(sentiment) = self.sentiment {
            note.sentiment = sentiment;
        }
        if let Some(tags) = &self.tags {
            note.tags = tags.clone();
        }
    }
}

// =============================================================================
// Usage records, profiles, contracts
// =============================================================================

/// A row from the `usage_records` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub account_id: String,
    pub product_code: String,
    pub quantity: u32,
    pub date: NaiveDate,
    #[serde(rename = "type")]
    pub usage_type: UsageType,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewUsageRecord {
    pub account_id: String,
    pub product_code: String,
    pub quantity: u32,
    pub date: NaiveDate,
    #[serde(rename = "type")]
    pub usage_type: UsageType,
}

impl NewUsageRecord {
    pub fn validate(&self) -> Result<(), CrmError> {
        require_text("product code", &self.product_code)?;
        require_quantity(self.quantity)
    }
}

/// A row from the `profiles` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub full_name: String,
    pub role_type: RoleType,
    #[serde(default)]
    pub region: Option<Region>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Self-service edit of the signed-in user's profile. Role is not editable here.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<Option<Region>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<Option<String>>,
}

impl ProfilePatch {
    pub fn apply(&self, profile: &mut Profile) {
        if let Some(name) = &self.full_name {
            profile.full_name = name.clone();
        }
        if let Some(region) = self.region {
            profile.region = region;
        }
        if let Some(url) = &self.avatar_url {
            profile.avatar_url = url.clone();
        }
    }
}

/// A row from the `contracts` table. Read-only reference data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub value: Option<f64>,
}

// =============================================================================
// Validation helpers
// =============================================================================

fn require_text(field: &str, value: &str) -> Result<(), CrmError> {
    if value.trim().is_empty() {
        return Err(CrmError::Validation(format!("{} is required", field)));
    }
    Ok(())
}

fn require_quantity(quantity: u32) -> Result<(), CrmError> {
    if quantity == 0 {
        return Err(CrmError::Validation(
            "quantity must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_charge(charge: Option<f64>) -> Result<(), CrmError> {
    match charge {
        Some(value) if !value.is_finite() || value < 0.0 => Err(CrmError::Validation(format!(
            "charge per use must be a non-negative amount, got {}",
            value
        ))),
        _ => Ok(()),
    }
}

fn validate_email(email: Option<&str>) -> Result<(), CrmError> {
    match email.map(str::trim) {
        Some(value) if !value.is_empty() && !value.contains('@') => Err(CrmError::Validation(
            format!("'{}' is not an email address", value),
        )),
        _ => Ok(()),
    }
}

fn validate_next_step(step: Option<&str>, date: Option<NaiveDate>) -> Result<(), CrmError> {
    if date.is_some() && step.map(str::trim).unwrap_or("").is_empty() {
        return Err(CrmError::Validation(
            "next step date given without a next step".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_last_visit_orders_never_first() {
        assert!(LastVisit::Never < LastVisit::On(date("1999-01-01")));
        assert!(LastVisit::On(date("2023-01-01")) < LastVisit::On(date("2024-03-01")));
        assert_eq!(LastVisit::Never.to_string(), "Never");
        assert_eq!(LastVisit::On(date("2024-03-01")).to_string(), "2024-03-01");
    }

    #[test]
    fn test_account_row_null_last_visit_is_never() {
        let json = r#"{
            "id": "h1",
            "name": "Taipei General",
            "region": "North",
            "level": "Regional",
            "pipeline_stage": "Lead",
            "last_visit_date": null,
            "charge_per_use": null,
            "equipment_installed": true
        }"#;
        let row: AccountRow = serde_json::from_str(json).unwrap();
        assert_eq!(row.last_visit_date, LastVisit::Never);

        // Stored flag disagrees with the (empty) equipment list; the list wins.
        let account = Account::from_row(row, Vec::new());
        assert!(!account.equipment_installed());
        assert!(!account.to_row().equipment_installed);
    }

    #[test]
    fn test_new_account_requires_name() {
        let new = NewAccount {
            name: "   ".to_string(),
            region: Region::North,
            level: AccountLevel::Regional,
            pipeline_stage: PipelineStage::Lead,
            charge_per_use: None,
        };
        assert!(matches!(new.validate(), Err(CrmError::Validation(_))));
    }

    #[test]
    fn test_negative_charge_rejected() {
        let patch = AccountPatch {
            charge_per_use: Some(Some(-5.0)),
            ..Default::default()
        };
        assert!(patch.validate().is_err());
        let clear = AccountPatch {
            charge_per_use: Some(None),
            ..Default::default()
        };
        assert!(clear.validate().is_ok());
    }

    #[test]
    fn test_contact_email_validation() {
        let mut contact = NewContact {
            account_id: "h1".to_string(),
            name: "Dr. Lin".to_string(),
            role: "Head of Radiology".to_string(),
            email: Some("lin.example.com".to_string()),
            phone: None,
            is_key_decision_maker: true,
        };
        assert!(contact.validate().is_err());
        contact.email = Some("lin@example.com".to_string());
        assert!(contact.validate().is_ok());
    }

    #[test]
    fn test_note_next_step_date_needs_step() {
        let mut note = NewNote::simple("h1", date("2024-03-01"), "intro call");
        note.next_step_date = Some(date("2024-03-08"));
        assert!(note.validate().is_err());
        note.next_step = Some("Send quote".to_string());
        assert!(note.validate().is_ok());
    }

    #[test]
    fn test_note_patch_cannot_orphan_next_step_date() {
        let mut note = ActivityNote {
            id: "n1".to_string(),
            account_id: "h1".to_string(),
            content: "intro call".to_string(),
            activity_date: date("2024-03-01"),
            author_id: "user-1".to_string(),
            activity_type: ActivityType::Call,
            next_step: Some("Send quote".to_string()),
            next_step_date: None,
            sentiment: None,
            tags: Vec::new(),
        };

        let date_only = NotePatch {
            next_step: Some(None),
            next_step_date: Some(Some(date("2024-03-08"))),
            ..Default::default()
        };
        assert!(date_only.validate().is_ok());
        assert!(matches!(
            date_only.applied_to(&note),
            Err(CrmError::Validation(_))
        ));

        // A date alone is fine when the note already has a next step.
        let dated = NotePatch {
            next_step_date: Some(Some(date("2024-03-08"))),
            ..Default::default()
        };
        let patched = dated.applied_to(&note).unwrap();
        assert_eq!(patched.next_step_date, Some(date("2024-03-08")));

        note.next_step = None;
        assert!(dated.applied_to(&note).is_err());
    }

    #[test]
    fn test_note_insert_carries_author() {
        let note = NewNote::simple("h1", date("2024-03-01"), "intro call");
        let value = note.to_insert("user-1").unwrap();
        assert_eq!(value["author_id"], "user-1");
        assert_eq!(value["activity_date"], "2024-03-01");
        assert_eq!(value["activity_type"], "Note");
    }

    #[test]
    fn test_usage_record_type_column() {
        let json = r#"{"id":"u1","account_id":"h1","product_code":"CT-200","quantity":3,"date":"2024-02-02","type":"Sample"}"#;
        let record: UsageRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.usage_type, UsageType::Sample);
    }

    #[test]
    fn test_account_patch_apply() {
        let mut account = Account::from_row(
            AccountRow {
                id: "h1".to_string(),
                name: "Old".to_string(),
                region: Region::South,
                level: AccountLevel::LocalCommunity,
                pipeline_stage: PipelineStage::Lead,
                last_visit_date: LastVisit::Never,
                charge_per_use: Some(10.0),
                equipment_installed: false,
            },
            Vec::new(),
        );
        let patch = AccountPatch {
            name: Some(" New ".to_string()),
            pipeline_stage: Some(PipelineStage::Trial),
            charge_per_use: Some(None),
            ..Default::default()
        };
        patch.normalized().apply(&mut account);
        assert_eq!(account.name, "New");
        assert_eq!(account.pipeline_stage, PipelineStage::Trial);
        assert_eq!(account.charge_per_use, None);
        assert_eq!(account.region, Region::South);
    }
}
