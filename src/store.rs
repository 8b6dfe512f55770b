//! Application store: the single owner of the in-memory collections.
//!
//! Every write to the collections goes through a named method here.
//!
//! - Updates and deletes are applied locally first, then written remotely.
//!   A failed remote write reloads the affected collection from the backend
//!   and returns the original error.
//! - Creates wait for the backend to assign an id and only then splice the
//!   confirmed record in. A failed create leaves local state untouched.
//! - Notes maintain their account's last visit date. Equipment maintains the
//!   account's installed flag. Both derived writes are best-effort.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::CrmError;
use crate::models::{
    Account, AccountPatch, AccountRow, ActivityNote, Contact, ContactPatch, Contract, Equipment,
    EquipmentPatch, LastVisit, NewAccount, NewContact, NewEquipment, NewNote, NewUsageRecord,
    NotePatch, Profile, ProfilePatch, UsageRecord,
};
use crate::queries::{self, AccountFilter, AuthorFilter, SortConfig};
use crate::remote::{decode_row, decode_rows, DataService, Query, Table};
use crate::resilient::ResilientCaller;
use crate::session::SessionKeeper;

/// Snapshot of everything the screens render.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Collections {
    pub accounts: Vec<Account>,
    pub contacts: Vec<Contact>,
    pub notes: Vec<ActivityNote>,
    pub usage_records: Vec<UsageRecord>,
    pub profiles: Vec<Profile>,
    pub contracts: Vec<Contract>,
}

/// A reloadable collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    /// Hospitals together with their installed equipment.
    Accounts,
    Contacts,
    Notes,
    UsageRecords,
    Profiles,
    Contracts,
}

impl Collection {
    pub const ALL: [Collection; 6] = [
        Collection::Accounts,
        Collection::Contacts,
        Collection::Notes,
        Collection::UsageRecords,
        Collection::Profiles,
        Collection::Contracts,
    ];
}

pub struct AppStore {
    remote: Arc<dyn DataService>,
    caller: ResilientCaller,
    data: RwLock<Collections>,
}

impl AppStore {
    pub fn new(remote: Arc<dyn DataService>, caller: ResilientCaller) -> Self {
        Self {
            remote,
            caller,
            data: RwLock::new(Collections::default()),
        }
    }

    pub fn keeper(&self) -> &Arc<SessionKeeper> {
        self.caller.keeper()
    }

    /// Sign out and drop every cached collection along with the session.
    ///
    /// The collections are cleared even when the keeper reports an error.
    pub async fn sign_out(&self) -> Result<(), CrmError> {
        let result = self.keeper().sign_out().await;
        self.clear();
        result
    }

    pub fn clear(&self) {
        *self.data.write() = Collections::default();
        log::debug!("Cleared cached collections");
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Replace every collection with the backend's current state.
    pub async fn load_all(&self) -> Result<(), CrmError> {
        for collection in Collection::ALL {
            self.reload(collection).await?;
        }
        let data = self.data.read();
        log::info!(
            "Loaded {} accounts, {} contacts, {} notes, {} usage records",
            data.accounts.len(),
            data.contacts.len(),
            data.notes.len(),
            data.usage_records.len()
        );
        Ok(())
    }

    /// Background reload. Errors are logged and swallowed.
    pub async fn refresh_silently(&self) {
        match self.load_all().await {
            Ok(()) => log::debug!("Background refresh complete"),
            Err(e) => log::warn!("Background refresh failed: {}", e),
        }
    }

    pub async fn reload(&self, collection: Collection) -> Result<(), CrmError> {
        match collection {
            Collection::Accounts => {
                let accounts = self.fetch_accounts().await?;
                self.data.write().accounts = accounts;
            }
            Collection::Contacts => {
                let contacts = self
                    .fetch("load_contacts", Table::Contacts, Query::all().order_asc("name"))
                    .await?;
                self.data.write().contacts = contacts;
            }
            Collection::Notes => {
                let notes = self
                    .fetch(
                        "load_notes",
                        Table::Notes,
                        Query::all().order_desc("activity_date"),
                    )
                    .await?;
                self.data.write().notes = notes;
            }
            Collection::UsageRecords => {
                let records = self
                    .fetch("load_usage", Table::UsageRecords, Query::all().order_desc("date"))
                    .await?;
                self.data.write().usage_records = records;
            }
            Collection::Profiles => {
                let profiles = self
                    .fetch("load_profiles", Table::Profiles, Query::all().order_asc("full_name"))
                    .await?;
                self.data.write().profiles = profiles;
            }
            Collection::Contracts => {
                let contracts = self
                    .fetch("load_contracts", Table::Contracts, Query::all().order_asc("start_date"))
                    .await?;
                self.data.write().contracts = contracts;
            }
        }
        Ok(())
    }

    async fn fetch_accounts(&self) -> Result<Vec<Account>, CrmError> {
        let rows: Vec<AccountRow> = self
            .fetch("load_accounts", Table::Hospitals, Query::all().order_asc("name"))
            .await?;
        let equipment: Vec<Equipment> = self
            .fetch(
                "load_equipment",
                Table::InstalledEquipment,
                Query::all().order_asc("install_date"),
            )
            .await?;

        let mut by_account: HashMap<String, Vec<Equipment>> = HashMap::new();
        for item in equipment {
            by_account.entry(item.account_id.clone()).or_default().push(item);
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let installed = by_account.remove(&row.id).unwrap_or_default();
                if row.equipment_installed != !installed.is_empty() {
                    log::debug!(
                        "Account {} stored equipment flag disagrees with {} installed item(s)",
                        row.id,
                        installed.len()
                    );
                }
                Account::from_row(row, installed)
            })
            .collect())
    }

    /// Reload after a failed write. The reload's own failure is only logged;
    /// the caller reports the original write error.
    async fn reconcile(&self, collection: Collection, cause: &CrmError) {
        log::warn!("Write failed ({}), reloading {:?}", cause, collection);
        if let Err(e) = self.reload(collection).await {
            log::error!("Reload of {:?} after failed write also failed: {}", collection, e);
        }
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    pub async fn create_account(&self, new: NewAccount) -> Result<Account, CrmError> {
        new.validate()?;
        let row: AccountRow = self
            .insert_row("create_account", Table::Hospitals, new.to_insert())
            .await?;
        let account = Account::from_row(row, Vec::new());

        {
            let mut data = self.data.write();
            splice(&mut data.accounts, account.clone(), |a| a.id.as_str());
            data.accounts.sort_by(|a, b| a.name.cmp(&b.name));
        }
        log::info!("Created account {} ({})", account.name, account.id);
        Ok(account)
    }

    pub async fn update_account(&self, id: &str, patch: AccountPatch) -> Result<Account, CrmError> {
        let patch = patch.normalized();
        patch.validate()?;
        let body = to_body(&patch)?;
        let updated = {
            let mut data = self.data.write();
            let account = data
                .accounts
                .iter_mut()
                .find(|a| a.id == id)
                .ok_or_else(|| CrmError::not_found("account", id))?;
            patch.apply(account);
            account.clone()
        };

        if let Err(e) = self
            .update_row("update_account", Table::Hospitals, id, body)
            .await
        {
            self.reconcile(Collection::Accounts, &e).await;
            return Err(e);
        }
        Ok(updated)
    }

    /// Advance an account's last visit to `date` if it is newer.
    ///
    /// The local value moves first so the change is visible without a reload.
    /// A failed remote write is logged and otherwise ignored.
    async fn sync_last_visit(&self, account_id: &str, date: NaiveDate) {
        let candidate = LastVisit::On(date);
        let previous = {
            let mut data = self.data.write();
            let Some(account) = data.accounts.iter_mut().find(|a| a.id == account_id) else {
                log::warn!("Last visit sync: account {} not loaded", account_id);
                return;
            };
            if account.last_visit_date >= candidate {
                return;
            }
            std::mem::replace(&mut account.last_visit_date, candidate)
        };

        let body = serde_json::json!({ "last_visit_date": date });
        match self
            .update_row("sync_last_visit", Table::Hospitals, account_id, body)
            .await
        {
            Ok(()) => log::debug!(
                "Account {} last visit {} -> {}",
                account_id,
                previous,
                candidate
            ),
            Err(e) => log::warn!(
                "Could not persist last visit {} for account {}: {}",
                candidate,
                account_id,
                e
            ),
        }
    }

    // =========================================================================
    // Equipment
    // =========================================================================

    pub async fn add_equipment(&self, new: NewEquipment) -> Result<Equipment, CrmError> {
        new.validate()?;
        self.require_account(&new.account_id)?;

        let equipment: Equipment = self
            .insert_row("add_equipment", Table::InstalledEquipment, to_body(&new)?)
            .await?;
        {
            let mut data = self.data.write();
            if let Some(account) = data
                .accounts
                .iter_mut()
                .find(|a| a.id == equipment.account_id)
            {
                splice(&mut account.installed_equipment, equipment.clone(), |e| e.id.as_str());
            }
        }
        self.sync_equipment_flag(&equipment.account_id).await;
        Ok(equipment)
    }

    pub async fn update_equipment(
        &self,
        id: &str,
        patch: EquipmentPatch,
    ) -> Result<Equipment, CrmError> {
        let patch = patch.normalized();
        patch.validate()?;
        let body = to_body(&patch)?;
        let updated = {
            let mut data = self.data.write();
            let equipment = data
                .accounts
                .iter_mut()
                .flat_map(|a| a.installed_equipment.iter_mut())
                .find(|e| e.id == id)
                .ok_or_else(|| CrmError::not_found("equipment", id))?;
            patch.apply(equipment);
            equipment.clone()
        };

        if let Err(e) = self
            .update_row("update_equipment", Table::InstalledEquipment, id, body)
            .await
        {
            self.reconcile(Collection::Accounts, &e).await;
            return Err(e);
        }
        Ok(updated)
    }

    pub async fn delete_equipment(&self, id: &str) -> Result<(), CrmError> {
        let account_id = {
            let mut data = self.data.write();
            let account = data
                .accounts
                .iter_mut()
                .find(|a| a.installed_equipment.iter().any(|e| e.id == id))
                .ok_or_else(|| CrmError::not_found("equipment", id))?;
            account.installed_equipment.retain(|e| e.id != id);
            account.id.clone()
        };

        if let Err(e) = self
            .delete_row("delete_equipment", Table::InstalledEquipment, id)
            .await
        {
            self.reconcile(Collection::Accounts, &e).await;
            return Err(e);
        }
        self.sync_equipment_flag(&account_id).await;
        Ok(())
    }

    /// Persist the account's derived installed flag.
    async fn sync_equipment_flag(&self, account_id: &str) {
        let Some(installed) = self
            .data
            .read()
            .accounts
            .iter()
            .find(|a| a.id == account_id)
            .map(Account::equipment_installed)
        else {
            return;
        };

        let body = serde_json::json!({ "equipment_installed": installed });
        if let Err(e) = self
            .update_row("sync_equipment_flag", Table::Hospitals, account_id, body)
            .await
        {
            log::warn!(
                "Could not persist equipment flag for account {}: {}",
                account_id,
                e
            );
        }
    }

    // =========================================================================
    // Contacts
    // =========================================================================

    pub async fn create_contact(&self, new: NewContact) -> Result<Contact, CrmError> {
        new.validate()?;
        self.require_account(&new.account_id)?;

        let contact: Contact = self
            .insert_row("create_contact", Table::Contacts, to_body(&new)?)
            .await?;
        splice(&mut self.data.write().contacts, contact.clone(), |c| c.id.as_str());
        Ok(contact)
    }

    pub async fn update_contact(&self, id: &str, patch: ContactPatch) -> Result<Contact, CrmError> {
        let patch = patch.normalized();
        patch.validate()?;
        let body = to_body(&patch)?;
        let updated = {
            let mut data = self.data.write();
            let contact = data
                .contacts
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| CrmError::not_found("contact", id))?;
            patch.apply(contact);
            contact.clone()
        };

        if let Err(e) = self
            .update_row("update_contact", Table::Contacts, id, body)
            .await
        {
            self.reconcile(Collection::Contacts, &e).await;
            return Err(e);
        }
        Ok(updated)
    }

    pub async fn delete_contact(&self, id: &str) -> Result<(), CrmError> {
        remove_local(&mut self.data.write().contacts, id, "contact", |c| c.id.as_str())?;
        if let Err(e) = self.delete_row("delete_contact", Table::Contacts, id).await {
            self.reconcile(Collection::Contacts, &e).await;
            return Err(e);
        }
        Ok(())
    }

    // =========================================================================
    // Activity notes
    // =========================================================================

    /// Log an activity as the signed-in user, then advance the account's
    /// last visit if this activity is newer.
    pub async fn create_note(&self, new: NewNote) -> Result<ActivityNote, CrmError> {
        new.validate()?;
        self.require_account(&new.account_id)?;
        let author_id = self.keeper().subject_id().ok_or(CrmError::NotSignedIn)?;

        let note: ActivityNote = self
            .insert_row("create_note", Table::Notes, new.to_insert(&author_id)?)
            .await?;
        {
            let mut data = self.data.write();
            splice(&mut data.notes, note.clone(), |n| n.id.as_str());
            data.notes
                .sort_by(|a, b| b.activity_date.cmp(&a.activity_date));
        }

        self.sync_last_visit(&note.account_id, note.activity_date)
            .await;
        Ok(note)
    }

    pub async fn update_note(&self, id: &str, patch: NotePatch) -> Result<ActivityNote, CrmError> {
        patch.validate()?;
        let body = to_body(&patch)?;
        let updated = {
            let mut data = self.data.write();
            let note = data
                .notes
                .iter_mut()
                .find(|n| n.id == id)
                .ok_or_else(|| CrmError::not_found("note", id))?;
            let patched = patch.applied_to(note)?;
            *note = patched.clone();
            patched
        };

        if let Err(e) = self.update_row("update_note", Table::Notes, id, body).await {
            self.reconcile(Collection::Notes, &e).await;
            return Err(e);
        }

        self.sync_last_visit(&updated.account_id, updated.activity_date)
            .await;
        Ok(updated)
    }

    /// Deleting a note never moves the account's last visit backwards.
    pub async fn delete_note(&self, id: &str) -> Result<(), CrmError> {
        remove_local(&mut self.data.write().notes, id, "note", |n| n.id.as_str())?;
        if let Err(e) = self.delete_row("delete_note", Table::Notes, id).await {
            self.reconcile(Collection::Notes, &e).await;
            return Err(e);
        }
        Ok(())
    }

    // =========================================================================
    // Usage records
    // =========================================================================

    pub async fn create_usage_record(&self, new: NewUsageRecord) -> Result<UsageRecord, CrmError> {
        new.validate()?;
        self.require_account(&new.account_id)?;

        let record: UsageRecord = self
            .insert_row("create_usage_record", Table::UsageRecords, to_body(&new)?)
            .await?;
        {
            let mut data = self.data.write();
            splice(&mut data.usage_records, record.clone(), |r| r.id.as_str());
            data.usage_records.sort_by(|a, b| b.date.cmp(&a.date));
        }
        Ok(record)
    }

    pub async fn delete_usage_record(&self, id: &str) -> Result<(), CrmError> {
        remove_local(&mut self.data.write().usage_records, id, "usage record", |r| r.id.as_str())?;
        if let Err(e) = self
            .delete_row("delete_usage_record", Table::UsageRecords, id)
            .await
        {
            self.reconcile(Collection::UsageRecords, &e).await;
            return Err(e);
        }
        Ok(())
    }

    // =========================================================================
    // Profiles
    // =========================================================================

    pub fn current_profile(&self) -> Option<Profile> {
        let subject_id = self.keeper().subject_id()?;
        self.data
            .read()
            .profiles
            .iter()
            .find(|p| p.id == subject_id)
            .cloned()
    }

    /// Edit the signed-in user's own profile.
    pub async fn update_profile(&self, patch: ProfilePatch) -> Result<Profile, CrmError> {
        let subject_id = self.keeper().subject_id().ok_or(CrmError::NotSignedIn)?;
        if let Some(name) = &patch.full_name {
            if name.trim().is_empty() {
                return Err(CrmError::Validation("full name is required".to_string()));
            }
        }
        let body = to_body(&patch)?;
        let updated = {
            let mut data = self.data.write();
            let profile = data
                .profiles
                .iter_mut()
                .find(|p| p.id == subject_id)
                .ok_or_else(|| CrmError::not_found("profile", &subject_id))?;
            patch.apply(profile);
            profile.clone()
        };

        if let Err(e) = self
            .update_row("update_profile", Table::Profiles, &subject_id, body)
            .await
        {
            self.reconcile(Collection::Profiles, &e).await;
            return Err(e);
        }
        Ok(updated)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn snapshot(&self) -> Collections {
        self.data.read().clone()
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.data.read().accounts.clone()
    }

    pub fn account(&self, id: &str) -> Option<Account> {
        self.data.read().accounts.iter().find(|a| a.id == id).cloned()
    }

    pub fn contacts_for(&self, account_id: &str) -> Vec<Contact> {
        self.data
            .read()
            .contacts
            .iter()
            .filter(|c| c.account_id == account_id)
            .cloned()
            .collect()
    }

    pub fn notes_for(&self, account_id: &str) -> Vec<ActivityNote> {
        self.data
            .read()
            .notes
            .iter()
            .filter(|n| n.account_id == account_id)
            .cloned()
            .collect()
    }

    pub fn contracts_for(&self, account_id: &str) -> Vec<Contract> {
        self.data
            .read()
            .contracts
            .iter()
            .filter(|c| c.account_id == account_id)
            .cloned()
            .collect()
    }

    /// Account list filtered by `filter` and ordered by the saved sort preference.
    pub fn account_list(&self, filter: &AccountFilter) -> Vec<Account> {
        let sort = self.keeper().preferences().sort_config();
        queries::filter_accounts(&self.data.read().accounts, filter, &sort)
    }

    pub fn set_sort(&self, sort: SortConfig) -> Result<(), CrmError> {
        self.keeper().preferences().set_sort_config(&sort)
    }

    /// Activity feed as the signed-in user is allowed to see it.
    pub fn visible_notes(&self, filter: &AuthorFilter) -> Vec<ActivityNote> {
        let viewer = self.current_profile();
        queries::activity_feed(&self.data.read().notes, viewer.as_ref(), filter)
    }

    // =========================================================================
    // Remote plumbing
    // =========================================================================

    fn require_account(&self, account_id: &str) -> Result<(), CrmError> {
        if self.data.read().accounts.iter().any(|a| a.id == account_id) {
            Ok(())
        } else {
            Err(CrmError::not_found("account", account_id))
        }
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        label: &str,
        table: Table,
        query: Query,
    ) -> Result<Vec<T>, CrmError> {
        let rows = self
            .caller
            .call(label, || self.remote.select(table, &query))
            .await?;
        Ok(decode_rows(rows)?)
    }

    async fn insert_row<T: DeserializeOwned>(
        &self,
        label: &str,
        table: Table,
        row: Value,
    ) -> Result<T, CrmError> {
        let created = self
            .caller
            .call(label, || self.remote.insert(table, row.clone()))
            .await?;
        Ok(decode_row(created)?)
    }

    async fn update_row(
        &self,
        label: &str,
        table: Table,
        id: &str,
        patch: Value,
    ) -> Result<(), CrmError> {
        self.caller
            .call(label, || self.remote.update(table, id, patch.clone()))
            .await?;
        Ok(())
    }

    async fn delete_row(&self, label: &str, table: Table, id: &str) -> Result<(), CrmError> {
        self.caller
            .call(label, || self.remote.delete(table, id))
            .await
    }
}

/// Insert `item`, replacing any record with the same id.
fn splice<T>(items: &mut Vec<T>, item: T, id: impl Fn(&T) -> &str) {
    let new_id = id(&item).to_string();
    items.retain(|existing| id(existing) != new_id);
    items.push(item);
}

fn remove_local<T>(
    items: &mut Vec<T>,
    id: &str,
    entity: &'static str,
    id_of: impl Fn(&T) -> &str,
) -> Result<(), CrmError> {
    let before = items.len();
    items.retain(|item| id_of(item) != id);
    if items.len() == before {
        return Err(CrmError::not_found(entity, id));
    }
    Ok(())
}

fn to_body<T: Serialize>(value: &T) -> Result<Value, CrmError> {
    serde_json::to_value(value)
        .map_err(|e| CrmError::Validation(format!("Unserializable payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountLevel, Ownership, PipelineStage, Region, RoleType};
    use crate::preferences::PreferenceStore;
    use crate::remote::memory::{Fault, MemoryBackend};
    use crate::resilient::RetryPolicy;
    use crate::session::SessionPolicy;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    async fn signed_in_store(role: RoleType) -> (Arc<MemoryBackend>, AppStore) {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_user("rep@example.com", "secret-pw", "Rep One", role);
        let keeper = Arc::new(SessionKeeper::new(
            backend.clone(),
            SessionPolicy::default(),
            Arc::new(PreferenceStore::in_memory()),
        ));
        keeper.sign_in("rep@example.com", "secret-pw").await.unwrap();
        let store = AppStore::new(
            backend.clone(),
            ResilientCaller::new(keeper, RetryPolicy::default()),
        );
        store.load_all().await.unwrap();
        (backend, store)
    }

    fn taipei_general() -> NewAccount {
        NewAccount {
            name: "Taipei General".to_string(),
            region: Region::North,
            level: AccountLevel::Regional,
            pipeline_stage: PipelineStage::Lead,
            charge_per_use: None,
        }
    }

    #[tokio::test]
    async fn test_created_account_starts_never_visited() {
        let (backend, store) = signed_in_store(RoleType::Sales).await;

        let account = store.create_account(taipei_general()).await.unwrap();

        let listed = store.account_list(&AccountFilter::default());
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "Taipei General");
        assert_eq!(listed[0].last_visit_date.to_string(), "Never");

        let remote = backend.rows(Table::Hospitals);
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0]["id"], account.id.as_str());
    }

    #[tokio::test]
    async fn test_create_splices_exactly_one_record() {
        let (backend, store) = signed_in_store(RoleType::Sales).await;
        let account = store.create_account(taipei_general()).await.unwrap();

        // A background reload racing the create must not duplicate it.
        store.refresh_silently().await;
        let matching = store
            .accounts()
            .into_iter()
            .filter(|a| a.id == account.id)
            .count();
        assert_eq!(matching, 1);

        let contact = store
            .create_contact(NewContact {
                account_id: account.id.clone(),
                name: "Dr. Lin".to_string(),
                role: "Head of Radiology".to_string(),
                email: Some("lin@example.com".to_string()),
                phone: None,
                is_key_decision_maker: true,
            })
            .await
            .unwrap();
        assert_eq!(backend.rows(Table::Contacts)[0]["id"], contact.id.as_str());
        assert_eq!(store.contacts_for(&account.id), vec![contact]);
    }

    #[tokio::test]
    async fn test_failed_create_adds_nothing() {
        let (backend, store) = signed_in_store(RoleType::Sales).await;
        backend.fail_writes(1, Fault::Unavailable);

        let result = store.create_account(taipei_general()).await;
        assert!(result.is_err());
        assert!(store.accounts().is_empty());
    }

    #[tokio::test]
    async fn test_validation_runs_before_any_remote_call() {
        let (backend, store) = signed_in_store(RoleType::Sales).await;
        backend.reset_counters();

        let mut blank = taipei_general();
        blank.name = "  ".to_string();
        let err = store.create_account(blank).await.unwrap_err();

        assert!(matches!(err, CrmError::Validation(_)));
        assert_eq!(backend.counters().writes, 0);
        assert_eq!(backend.counters().reads, 0);
    }

    #[tokio::test]
    async fn test_note_advances_last_visit_monotonically() {
        let (backend, store) = signed_in_store(RoleType::Sales).await;
        let account = store.create_account(taipei_general()).await.unwrap();

        store
            .create_note(NewNote::simple(&account.id, date("2024-03-01"), "intro call"))
            .await
            .unwrap();
        assert_eq!(
            store.account(&account.id).unwrap().last_visit_date,
            LastVisit::On(date("2024-03-01"))
        );
        assert_eq!(backend.rows(Table::Hospitals)[0]["last_visit_date"], "2024-03-01");

        let older = store
            .create_note(NewNote::simple(&account.id, date("2023-01-01"), "old call"))
            .await
            .unwrap();
        assert_eq!(
            store.account(&account.id).unwrap().last_visit_date.to_string(),
            "2024-03-01"
        );

        // Moving an old note forward past the last visit advances it again.
        store
            .update_note(
                &older.id,
                NotePatch {
                    activity_date: Some(date("2024-05-10")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            store.account(&account.id).unwrap().last_visit_date,
            LastVisit::On(date("2024-05-10"))
        );

        // Deleting the newest note does not regress the last visit.
        store.delete_note(&older.id).await.unwrap();
        assert_eq!(
            store.account(&account.id).unwrap().last_visit_date,
            LastVisit::On(date("2024-05-10"))
        );
    }

    #[tokio::test]
    async fn test_last_visit_sync_failure_is_not_surfaced() {
        let (backend, store) = signed_in_store(RoleType::Sales).await;
        let account = store.create_account(taipei_general()).await.unwrap();
        // The hospital row disappears remotely; the derived write will fail.
        backend.delete(Table::Hospitals, &account.id).await.unwrap();

        let note = store
            .create_note(NewNote::simple(&account.id, date("2024-03-01"), "intro call"))
            .await;

        assert!(note.is_ok());
        assert_eq!(
            store.account(&account.id).unwrap().last_visit_date,
            LastVisit::On(date("2024-03-01"))
        );
    }

    #[tokio::test]
    async fn test_failed_update_reverts_to_server_state() {
        let (backend, store) = signed_in_store(RoleType::Sales).await;
        let account = store.create_account(taipei_general()).await.unwrap();
        let before = store.account(&account.id).unwrap();

        backend.fail_writes(1, Fault::Unavailable);
        let result = store
            .update_account(
                &account.id,
                AccountPatch {
                    name: Some("Renamed".to_string()),
                    pipeline_stage: Some(PipelineStage::Negotiation),
                    ..Default::default()
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(store.account(&account.id).unwrap(), before);
        assert_eq!(backend.rows(Table::Hospitals)[0]["name"], "Taipei General");
    }

    #[tokio::test]
    async fn test_successful_update_keeps_optimistic_value() {
        let (backend, store) = signed_in_store(RoleType::Sales).await;
        let account = store.create_account(taipei_general()).await.unwrap();

        let updated = store
            .update_account(
                &account.id,
                AccountPatch {
                    charge_per_use: Some(Some(120.0)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.charge_per_use, Some(120.0));
        assert_eq!(store.account(&account.id).unwrap().charge_per_use, Some(120.0));
        assert_eq!(backend.rows(Table::Hospitals)[0]["charge_per_use"], 120.0);
    }

    #[tokio::test]
    async fn test_failed_delete_restores_item() {
        let (backend, store) = signed_in_store(RoleType::Sales).await;
        let account = store.create_account(taipei_general()).await.unwrap();
        let note = store
            .create_note(NewNote::simple(&account.id, date("2024-03-01"), "intro call"))
            .await
            .unwrap();

        backend.fail_writes(1, Fault::Unavailable);
        assert!(store.delete_note(&note.id).await.is_err());
        assert_eq!(store.notes_for(&account.id), vec![note]);
    }

    #[tokio::test]
    async fn test_equipment_flag_tracks_installed_items() {
        let (backend, store) = signed_in_store(RoleType::Sales).await;
        let account = store.create_account(taipei_general()).await.unwrap();
        assert!(!store.account(&account.id).unwrap().equipment_installed());

        let equipment = store
            .add_equipment(NewEquipment {
                account_id: account.id.clone(),
                product_code: "CT-200".to_string(),
                quantity: 2,
                install_date: date("2024-02-01"),
                ownership: Ownership::Lease,
            })
            .await
            .unwrap();
        let local = store.account(&account.id).unwrap();
        assert!(local.equipment_installed());
        assert_eq!(local.installed_equipment.len(), 1);
        assert_eq!(backend.rows(Table::Hospitals)[0]["equipment_installed"], true);

        store
            .update_equipment(
                &equipment.id,
                EquipmentPatch {
                    quantity: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(store.account(&account.id).unwrap().equipment_installed());

        store.delete_equipment(&equipment.id).await.unwrap();
        assert!(!store.account(&account.id).unwrap().equipment_installed());
        assert_eq!(backend.rows(Table::Hospitals)[0]["equipment_installed"], false);

        // The invariant survives a full reload.
        store.load_all().await.unwrap();
        for account in store.accounts() {
            assert_eq!(
                account.equipment_installed(),
                !account.installed_equipment.is_empty()
            );
        }
    }

    #[tokio::test]
    async fn test_sales_rep_feed_shows_only_own_notes() {
        let (backend, store) = signed_in_store(RoleType::Sales).await;
        let account = store.create_account(taipei_general()).await.unwrap();
        let mine = store
            .create_note(NewNote::simple(&account.id, date("2024-03-01"), "my visit"))
            .await
            .unwrap();
        backend.seed(
            Table::Notes,
            vec![serde_json::json!({
                "id": "other-note",
                "account_id": account.id,
                "content": "someone else's visit",
                "activity_date": "2024-03-02",
                "author_id": "someone-else",
                "activity_type": "Visit",
            })],
        );
        store.reload(Collection::Notes).await.unwrap();

        assert_eq!(store.notes_for(&account.id).len(), 2);
        assert_eq!(store.visible_notes(&AuthorFilter::All), vec![mine]);
    }

    #[tokio::test]
    async fn test_update_own_profile() {
        let (backend, store) = signed_in_store(RoleType::Manager).await;

        let profile = store
            .update_profile(ProfilePatch {
                full_name: Some("Rep Renamed".to_string()),
                region: Some(Some(Region::East)),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(profile.full_name, "Rep Renamed");
        assert_eq!(store.current_profile(), Some(profile));
        assert_eq!(backend.rows(Table::Profiles)[0]["region"], "East");
    }

    #[tokio::test]
    async fn test_missing_entity_is_not_found() {
        let (_backend, store) = signed_in_store(RoleType::Sales).await;
        let err = store
            .update_contact("nope", ContactPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::NotFound { .. }));

        let err = store
            .create_note(NewNote::simple("missing-account", date("2024-03-01"), "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::NotFound { .. }));
    }

    fn lin_contact(account_id: &str) -> NewContact {
        NewContact {
            account_id: account_id.to_string(),
            name: "Dr. Lin".to_string(),
            role: "Head of Radiology".to_string(),
            email: Some("lin@example.com".to_string()),
            phone: None,
            is_key_decision_maker: true,
        }
    }

    fn ct_scanner(account_id: &str) -> NewEquipment {
        NewEquipment {
            account_id: account_id.to_string(),
            product_code: "CT-200".to_string(),
            quantity: 2,
            install_date: date("2024-02-01"),
            ownership: Ownership::Lease,
        }
    }

    #[tokio::test]
    async fn test_update_writes_the_same_values_it_shows() {
        let (backend, store) = signed_in_store(RoleType::Sales).await;
        let account = store.create_account(taipei_general()).await.unwrap();
        let contact = store.create_contact(lin_contact(&account.id)).await.unwrap();
        let equipment = store.add_equipment(ct_scanner(&account.id)).await.unwrap();

        store
            .update_account(
                &account.id,
                AccountPatch {
                    name: Some("  Renamed  ".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update_contact(
                &contact.id,
                ContactPatch {
                    name: Some(" Dr. Chen ".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update_equipment(
                &equipment.id,
                EquipmentPatch {
                    product_code: Some(" MRI-9 ".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(backend.rows(Table::Hospitals)[0]["name"], "Renamed");
        assert_eq!(backend.rows(Table::Contacts)[0]["name"], "Dr. Chen");
        assert_eq!(backend.rows(Table::InstalledEquipment)[0]["product_code"], "MRI-9");

        // A reload changes nothing the screens already show.
        let before = store.snapshot();
        store.load_all().await.unwrap();
        let after = store.snapshot();
        assert_eq!(after.accounts, before.accounts);
        assert_eq!(after.contacts, before.contacts);
        assert_eq!(after.accounts[0].name, "Renamed");
    }

    #[tokio::test]
    async fn test_sign_out_drops_cached_collections() {
        let (_backend, store) = signed_in_store(RoleType::Sales).await;
        let account = store.create_account(taipei_general()).await.unwrap();
        store
            .create_note(NewNote::simple(&account.id, date("2024-03-01"), "intro call"))
            .await
            .unwrap();
        assert!(!store.snapshot().profiles.is_empty());

        store.sign_out().await.unwrap();

        let data = store.snapshot();
        assert!(data.accounts.is_empty());
        assert!(data.notes.is_empty());
        assert!(data.profiles.is_empty());
        assert!(store.current_profile().is_none());
        assert!(store.keeper().subject_id().is_none());
    }

    #[tokio::test]
    async fn test_failed_contact_writes_revert() {
        let (backend, store) = signed_in_store(RoleType::Sales).await;
        let account = store.create_account(taipei_general()).await.unwrap();
        let contact = store.create_contact(lin_contact(&account.id)).await.unwrap();

        backend.fail_writes(1, Fault::Unavailable);
        let result = store
            .update_contact(
                &contact.id,
                ContactPatch {
                    role: Some("CFO".to_string()),
                    email: Some(None),
                    ..Default::default()
                },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(store.contacts_for(&account.id), vec![contact.clone()]);

        backend.fail_writes(1, Fault::Unavailable);
        assert!(store.delete_contact(&contact.id).await.is_err());
        assert_eq!(store.contacts_for(&account.id), vec![contact]);
        assert_eq!(backend.rows(Table::Contacts).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_note_update_reverts() {
        let (backend, store) = signed_in_store(RoleType::Sales).await;
        let account = store.create_account(taipei_general()).await.unwrap();
        let note = store
            .create_note(NewNote::simple(&account.id, date("2024-03-01"), "intro call"))
            .await
            .unwrap();

        backend.fail_writes(1, Fault::Unavailable);
        let result = store
            .update_note(
                &note.id,
                NotePatch {
                    content: Some("rewritten".to_string()),
                    activity_date: Some(date("2024-06-01")),
                    ..Default::default()
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(store.notes_for(&account.id), vec![note]);
        assert_eq!(
            store.account(&account.id).unwrap().last_visit_date,
            LastVisit::On(date("2024-03-01"))
        );
    }

    #[tokio::test]
    async fn test_failed_equipment_writes_revert() {
        let (backend, store) = signed_in_store(RoleType::Sales).await;
        let account = store.create_account(taipei_general()).await.unwrap();
        let equipment = store.add_equipment(ct_scanner(&account.id)).await.unwrap();
        let before = store.account(&account.id).unwrap();

        backend.fail_writes(1, Fault::Unavailable);
        let result = store
            .update_equipment(
                &equipment.id,
                EquipmentPatch {
                    quantity: Some(7),
                    ownership: Some(Ownership::Purchase),
                    ..Default::default()
                },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(store.account(&account.id).unwrap(), before);

        backend.fail_writes(1, Fault::Unavailable);
        assert!(store.delete_equipment(&equipment.id).await.is_err());
        let after = store.account(&account.id).unwrap();
        assert_eq!(after, before);
        assert!(after.equipment_installed());
    }

    #[tokio::test]
    async fn test_failed_profile_update_reverts() {
        let (backend, store) = signed_in_store(RoleType::Sales).await;
        let before = store.current_profile().unwrap();

        backend.fail_writes(1, Fault::Unavailable);
        let result = store
            .update_profile(ProfilePatch {
                full_name: Some("Someone Else".to_string()),
                region: Some(Some(Region::South)),
                ..Default::default()
            })
            .await;

        assert!(result.is_err());
        assert_eq!(store.current_profile(), Some(before));
        assert_eq!(backend.rows(Table::Profiles)[0]["full_name"], "Rep One");
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_recovers_from_one_auth_expiry() {
        let (backend, store) = signed_in_store(RoleType::Sales).await;
        let account = store.create_account(taipei_general()).await.unwrap();
        backend.reset_counters();

        backend.fail_writes(1, Fault::AuthExpired);
        let updated = store
            .update_account(
                &account.id,
                AccountPatch {
                    pipeline_stage: Some(PipelineStage::Trial),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.pipeline_stage, PipelineStage::Trial);
        assert_eq!(store.account(&account.id).unwrap(), updated);
        assert_eq!(backend.rows(Table::Hospitals)[0]["pipeline_stage"], "Trial");
        let counters = backend.counters();
        assert_eq!(counters.writes, 2);
        assert_eq!(counters.refresh_calls, 1);
    }

    #[tokio::test]
    async fn test_note_update_rejected_before_any_write() {
        let (backend, store) = signed_in_store(RoleType::Sales).await;
        let account = store.create_account(taipei_general()).await.unwrap();
        let note = store
            .create_note(NewNote::simple(&account.id, date("2024-03-01"), "intro call"))
            .await
            .unwrap();
        backend.reset_counters();

        let err = store
            .update_note(
                &note.id,
                NotePatch {
                    next_step_date: Some(Some(date("2024-03-08"))),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CrmError::Validation(_)));
        assert_eq!(backend.counters().writes, 0);
        assert_eq!(store.notes_for(&account.id), vec![note]);
    }
}
