//! Registry Records Module
//!
//! Typed registry records and the repository that keeps the in-memory
//! collection coherent with the remote service. Mutations apply
//! optimistically and are rolled back when the remote call fails.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::sync::{ApiError, RecordRow, RegistryApi};

/// Prefix of client-generated placeholder ids. The server assigns bare
/// numeric ids, so this namespace can never collide with them.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Gender as recorded in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Gender {
    #[default]
    Male,
    Female,
}

impl Gender {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "Male" => Some(Gender::Male),
            "Female" => Some(Gender::Female),
            _ => None,
        }
    }
}

impl std::fmt::Display for Gender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Gender::Male => write!(f, "Male"),
            Gender::Female => write!(f, "Female"),
        }
    }
}

/// ABO/Rh blood type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BloodType {
    #[default]
    #[serde(rename = "A+")]
    APositive,
    #[serde(rename = "A-")]
    ANegative,
    #[serde(rename = "B+")]
    BPositive,
    #[serde(rename = "B-")]
    BNegative,
    #[serde(rename = "AB+")]
    AbPositive,
    #[serde(rename = "AB-")]
    AbNegative,
    #[serde(rename = "O+")]
    OPositive,
    #[serde(rename = "O-")]
    ONegative,
}

impl BloodType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "A+" => Some(BloodType::APositive),
            "A-" => Some(BloodType::ANegative),
            "B+" => Some(BloodType::BPositive),
            "B-" => Some(BloodType::BNegative),
            "AB+" => Some(BloodType::AbPositive),
            "AB-" => Some(BloodType::AbNegative),
            "O+" => Some(BloodType::OPositive),
            "O-" => Some(BloodType::ONegative),
            _ => None,
        }
    }
}

impl std::fmt::Display for BloodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            BloodType::APositive => "A+",
            BloodType::ANegative => "A-",
            BloodType::BPositive => "B+",
            BloodType::BNegative => "B-",
            BloodType::AbPositive => "AB+",
            BloodType::AbNegative => "AB-",
            BloodType::OPositive => "O+",
            BloodType::ONegative => "O-",
        };
        write!(f, "{}", label)
    }
}

/// A registry entry without an id, as submitted from the entry form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonDraft {
    pub full_name: String,
    pub population_id: String,
    pub family_id: String,
    pub gender: Gender,
    pub date_of_birth: NaiveDate,
    pub place_of_birth: String,
    pub religion: String,
    pub blood_type: BloodType,
}

/// One registry entry.
///
/// Records fresh from `add` carry a [`LOCAL_ID_PREFIX`] placeholder id
/// until the server confirms the create and assigns the final one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonRecord {
    pub id: String,
    pub full_name: String,
    pub population_id: String,
    pub family_id: String,
    pub gender: Gender,
    pub date_of_birth: NaiveDate,
    pub place_of_birth: String,
    pub religion: String,
    pub blood_type: BloodType,
}

impl PersonRecord {
    fn from_draft(id: String, draft: &PersonDraft) -> Self {
        Self {
            id,
            full_name: draft.full_name.clone(),
            population_id: draft.population_id.clone(),
            family_id: draft.family_id.clone(),
            gender: draft.gender,
            date_of_birth: draft.date_of_birth,
            place_of_birth: draft.place_of_birth.clone(),
            religion: draft.religion.clone(),
            blood_type: draft.blood_type,
        }
    }

    /// Whether this record is still waiting for server confirmation.
    pub fn is_placeholder(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }
}

/// Client-side field checks. These never reach the network.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("Population ID must be exactly 16 digits")]
    InvalidPopulationId,

    #[error("Family ID must be exactly 16 digits")]
    InvalidFamilyId,

    #[error("Date of birth must not be in the future")]
    BirthDateInFuture,

    #[error("Population ID is already registered")]
    DuplicatePopulationId,
}

fn is_sixteen_digits(s: &str) -> bool {
    s.len() == 16 && s.bytes().all(|b| b.is_ascii_digit())
}

/// Validate a draft against the registry field rules.
///
/// Uniqueness of the population ID is checked separately by the
/// repository, which owns the collection.
pub fn validate_draft(draft: &PersonDraft) -> Result<(), ValidationError> {
    if draft.full_name.trim().is_empty() {
        return Err(ValidationError::EmptyField("Full name"));
    }
    if !is_sixteen_digits(&draft.population_id) {
        return Err(ValidationError::InvalidPopulationId);
    }
    if !is_sixteen_digits(&draft.family_id) {
        return Err(ValidationError::InvalidFamilyId);
    }
    if draft.date_of_birth > chrono::Utc::now().date_naive() {
        return Err(ValidationError::BirthDateInFuture);
    }
    if draft.place_of_birth.trim().is_empty() {
        return Err(ValidationError::EmptyField("Place of birth"));
    }
    if draft.religion.trim().is_empty() {
        return Err(ValidationError::EmptyField("Religion"));
    }
    Ok(())
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("No record with id {0}")]
    NotFound(String),

    #[error("A change to record {0} is still in flight")]
    MutationInFlight(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Owns the in-memory registry collection.
///
/// The collection lives inside a `watch` channel: observers subscribe
/// and always see either the old or the new vector, never a partial
/// merge. Mutations on a record id already in flight are rejected
/// instead of being left to race.
///
/// Cheap to clone — all state is behind `Arc`s.
#[derive(Clone)]
pub struct RecordRepository {
    api: Arc<dyn RegistryApi>,
    collection: Arc<watch::Sender<Vec<PersonRecord>>>,
    pending: Arc<Mutex<HashSet<String>>>,
    next_local_id: Arc<AtomicU64>,
    load_attempted: Arc<AtomicBool>,
}

impl RecordRepository {
    /// Create an empty repository backed by the given API.
    pub fn new(api: Arc<dyn RegistryApi>) -> Self {
        let (collection, _) = watch::channel(Vec::new());
        Self {
            api,
            collection: Arc::new(collection),
            pending: Arc::new(Mutex::new(HashSet::new())),
            next_local_id: Arc::new(AtomicU64::new(1)),
            load_attempted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to collection snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Vec<PersonRecord>> {
        self.collection.subscribe()
    }

    /// The current collection snapshot.
    pub fn records(&self) -> Vec<PersonRecord> {
        self.collection.borrow().clone()
    }

    /// Fetch the authoritative snapshot and replace the collection.
    ///
    /// On failure the previous collection is kept, except on the very
    /// first load where a placeholder sample is seeded so the rest of
    /// the application has something to render. The error is surfaced
    /// either way. Do not call while a mutation is in flight.
    pub async fn load_snapshot(&self) -> Result<usize, RepositoryError> {
        let first_load = !self.load_attempted.swap(true, Ordering::SeqCst);

        match self.api.list_all().await {
            Ok(rows) => {
                let mut records = Vec::with_capacity(rows.len());
                for row in rows {
                    if let Some(record) = normalize_row(row) {
                        records.push(record);
                    }
                }
                let count = records.len();
                self.collection.send_replace(records);
                info!("Loaded {} registry records", count);
                Ok(count)
            }
            Err(e) => {
                if first_load {
                    warn!("Initial snapshot load failed, seeding sample data: {}", e);
                    self.collection.send_replace(sample_records());
                } else {
                    warn!("Snapshot reload failed, keeping previous records: {}", e);
                }
                Err(e.into())
            }
        }
    }

    /// Insert a new record optimistically and confirm it remotely.
    ///
    /// The returned record carries the server-assigned id; the
    /// placeholder entry is replaced in place. On failure the
    /// optimistic entry is removed again.
    pub async fn add(&self, draft: PersonDraft) -> Result<PersonRecord, RepositoryError> {
        validate_draft(&draft)?;
        self.ensure_unique_population_id(&draft.population_id, None)?;

        let temp_id = format!(
            "{}{}",
            LOCAL_ID_PREFIX,
            self.next_local_id.fetch_add(1, Ordering::SeqCst)
        );
        self.claim(&temp_id)?;

        let optimistic = PersonRecord::from_draft(temp_id.clone(), &draft);
        self.collection.send_modify(|records| records.push(optimistic));
        debug!("Inserted optimistic record {}", temp_id);

        let result = self.api.create(&draft).await;
        self.release(&temp_id);

        match result {
            Ok(row) => {
                let Some(confirmed) = normalize_row(row) else {
                    self.collection
                        .send_modify(|records| records.retain(|r| r.id != temp_id));
                    return Err(ApiError::Unavailable(
                        "server returned an unreadable record".into(),
                    )
                    .into());
                };
                let returned = confirmed.clone();
                self.collection.send_modify(|records| {
                    match records.iter_mut().find(|r| r.id == temp_id) {
                        Some(entry) => *entry = confirmed,
                        // Placeholder vanished (e.g. a snapshot reload);
                        // the server copy still belongs in the collection.
                        None => records.push(confirmed),
                    }
                });
                info!("Record {} confirmed by server", returned.id);
                Ok(returned)
            }
            Err(e) => {
                self.collection
                    .send_modify(|records| records.retain(|r| r.id != temp_id));
                warn!("Create failed, optimistic entry removed: {}", e);
                Err(e.into())
            }
        }
    }

    /// Patch a record optimistically and confirm it remotely.
    ///
    /// On failure the record is restored to its pre-patch value.
    pub async fn update(&self, id: &str, draft: PersonDraft) -> Result<PersonRecord, RepositoryError> {
        validate_draft(&draft)?;
        self.ensure_unique_population_id(&draft.population_id, Some(id))?;
        self.claim(id)?;

        let previous = {
            let records = self.collection.borrow();
            records.iter().find(|r| r.id == id).cloned()
        };
        let Some(previous) = previous else {
            self.release(id);
            return Err(RepositoryError::NotFound(id.to_string()));
        };

        let optimistic = PersonRecord::from_draft(id.to_string(), &draft);
        self.collection.send_modify(|records| {
            if let Some(entry) = records.iter_mut().find(|r| r.id == id) {
                *entry = optimistic;
            }
        });

        let result = self.api.update(id, &draft).await;
        self.release(id);

        match result {
            Ok(row) => {
                // An unreadable confirmation keeps the optimistic value;
                // the server accepted exactly what we sent.
                let confirmed = normalize_row(row)
                    .unwrap_or_else(|| PersonRecord::from_draft(id.to_string(), &draft));
                let returned = confirmed.clone();
                self.collection.send_modify(|records| {
                    if let Some(entry) = records.iter_mut().find(|r| r.id == id) {
                        *entry = confirmed;
                    }
                });
                Ok(returned)
            }
            Err(e) => {
                self.collection.send_modify(|records| {
                    if let Some(entry) = records.iter_mut().find(|r| r.id == id) {
                        *entry = previous;
                    }
                });
                warn!("Update failed, rolled back record {}: {}", id, e);
                Err(e.into())
            }
        }
    }

    /// Remove a record optimistically and confirm the deletion remotely.
    ///
    /// On failure the record is reinserted at its original position.
    pub async fn remove(&self, id: &str) -> Result<(), RepositoryError> {
        self.claim(id)?;

        let removed = {
            let records = self.collection.borrow();
            records
                .iter()
                .position(|r| r.id == id)
                .map(|index| (index, records[index].clone()))
        };
        let Some((index, removed)) = removed else {
            self.release(id);
            return Err(RepositoryError::NotFound(id.to_string()));
        };

        self.collection
            .send_modify(|records| records.retain(|r| r.id != id));

        let result = self.api.delete(id).await;
        self.release(id);

        match result {
            Ok(()) => {
                info!("Record {} removed", id);
                Ok(())
            }
            Err(e) => {
                self.collection.send_modify(|records| {
                    let at = index.min(records.len());
                    records.insert(at, removed);
                });
                warn!("Delete failed, restored record {}: {}", id, e);
                Err(e.into())
            }
        }
    }

    fn ensure_unique_population_id(
        &self,
        population_id: &str,
        exclude_id: Option<&str>,
    ) -> Result<(), ValidationError> {
        let clash = self
            .collection
            .borrow()
            .iter()
            .any(|r| r.population_id == population_id && Some(r.id.as_str()) != exclude_id);
        if clash {
            return Err(ValidationError::DuplicatePopulationId);
        }
        Ok(())
    }

    fn pending(&self) -> MutexGuard<'_, HashSet<String>> {
        self.pending.lock().expect("pending set poisoned")
    }

    fn claim(&self, id: &str) -> Result<(), RepositoryError> {
        if !self.pending().insert(id.to_string()) {
            return Err(RepositoryError::MutationInFlight(id.to_string()));
        }
        Ok(())
    }

    fn release(&self, id: &str) {
        self.pending().remove(id);
    }
}

/// Turn a raw server row into a typed record.
///
/// Missing gender defaults to Male and missing blood type to A+;
/// other missing strings become empty. Rows whose date of birth
/// cannot be read are skipped rather than poisoning the snapshot.
fn normalize_row(row: RecordRow) -> Option<PersonRecord> {
    let raw_date = row.date_of_birth.unwrap_or_default();
    let Some(date_of_birth) = parse_wire_date(&raw_date) else {
        warn!("Skipping row {}: unreadable date of birth {:?}", row.id, raw_date);
        return None;
    };

    let gender = match row.gender.as_deref() {
        None | Some("") => Gender::default(),
        Some(s) => Gender::parse(s).unwrap_or_else(|| {
            warn!("Row {}: unknown gender {:?}, using default", row.id, s);
            Gender::default()
        }),
    };

    let blood_type = match row.blood_type.as_deref() {
        None | Some("") => BloodType::default(),
        Some(s) => BloodType::parse(s).unwrap_or_else(|| {
            warn!("Row {}: unknown blood type {:?}, using default", row.id, s);
            BloodType::default()
        }),
    };

    Some(PersonRecord {
        id: row.id,
        full_name: row.full_name.unwrap_or_default(),
        population_id: row.population_id.unwrap_or_default(),
        family_id: row.family_id.unwrap_or_default(),
        gender,
        date_of_birth,
        place_of_birth: row.place_of_birth.unwrap_or_default(),
        religion: row.religion.unwrap_or_default(),
        blood_type,
    })
}

/// Dates arrive either as plain `YYYY-MM-DD` or as a full RFC 3339
/// timestamp, which is truncated to its date.
fn parse_wire_date(raw: &str) -> Option<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.date_naive())
}

fn sample_date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid sample date")
}

/// Placeholder collection shown when the very first load fails.
fn sample_records() -> Vec<PersonRecord> {
    vec![
        PersonRecord {
            id: "1".into(),
            full_name: "John Doe".into(),
            population_id: "1234567890123456".into(),
            family_id: "1111111111111111".into(),
            gender: Gender::Male,
            date_of_birth: sample_date(1990, 5, 15),
            place_of_birth: "Jakarta".into(),
            religion: "Islam".into(),
            blood_type: BloodType::APositive,
        },
        PersonRecord {
            id: "2".into(),
            full_name: "Jane Smith".into(),
            population_id: "6543210987654321".into(),
            family_id: "2222222222222222".into(),
            gender: Gender::Female,
            date_of_birth: sample_date(1985, 12, 8),
            place_of_birth: "Surabaya".into(),
            religion: "Christian".into(),
            blood_type: BloodType::BPositive,
        },
        PersonRecord {
            id: "3".into(),
            full_name: "Ahmad Rahman".into(),
            population_id: "1122334455667788".into(),
            family_id: "3333333333333333".into(),
            gender: Gender::Male,
            date_of_birth: sample_date(1992, 3, 22),
            place_of_birth: "Bandung".into(),
            religion: "Islam".into(),
            blood_type: BloodType::OPositive,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::FakeRegistry;
    use tokio::sync::Semaphore;

    fn draft(full_name: &str, population_id: &str) -> PersonDraft {
        PersonDraft {
            full_name: full_name.into(),
            population_id: population_id.into(),
            family_id: "9999000011112222".into(),
            gender: Gender::Female,
            date_of_birth: sample_date(1988, 7, 1),
            place_of_birth: "Medan".into(),
            religion: "Islam".into(),
            blood_type: BloodType::ONegative,
        }
    }

    fn setup() -> (Arc<FakeRegistry>, RecordRepository) {
        let api = Arc::new(FakeRegistry::new());
        let repo = RecordRepository::new(api.clone());
        (api, repo)
    }

    // -- validation -------------------------------------------------------

    #[test]
    fn sixteen_digit_population_id_passes() {
        let d = draft("Siti Aminah", "1234567890123456");

        assert_eq!(validate_draft(&d), Ok(()));
    }

    #[test]
    fn short_population_id_fails() {
        let d = draft("Siti Aminah", "12345");

        assert_eq!(validate_draft(&d), Err(ValidationError::InvalidPopulationId));
    }

    #[test]
    fn non_numeric_population_id_fails() {
        let d = draft("Siti Aminah", "12345678901234ab");

        assert_eq!(validate_draft(&d), Err(ValidationError::InvalidPopulationId));
    }

    #[test]
    fn blank_name_fails() {
        let d = draft("   ", "1234567890123456");

        assert_eq!(validate_draft(&d), Err(ValidationError::EmptyField("Full name")));
    }

    #[test]
    fn future_birth_date_fails() {
        let mut d = draft("Siti Aminah", "1234567890123456");
        d.date_of_birth = chrono::Utc::now().date_naive() + chrono::Days::new(1);

        assert_eq!(validate_draft(&d), Err(ValidationError::BirthDateInFuture));
    }

    #[test]
    fn bad_family_id_fails() {
        let mut d = draft("Siti Aminah", "1234567890123456");
        d.family_id = "123".into();

        assert_eq!(validate_draft(&d), Err(ValidationError::InvalidFamilyId));
    }

    // -- normalization ----------------------------------------------------

    #[test]
    fn normalize_fills_documented_defaults() {
        let row = RecordRow {
            id: "5".into(),
            full_name: Some("John Doe".into()),
            population_id: Some("1234567890123456".into()),
            family_id: None,
            gender: None,
            date_of_birth: Some("1990-05-15".into()),
            place_of_birth: None,
            religion: None,
            blood_type: None,
        };

        let record = normalize_row(row).expect("row should normalize");

        assert_eq!(record.gender, Gender::Male);
        assert_eq!(record.blood_type, BloodType::APositive);
        assert_eq!(record.family_id, "");
    }

    #[test]
    fn normalize_truncates_timestamps_to_dates() {
        let row = RecordRow {
            id: "5".into(),
            full_name: Some("John Doe".into()),
            population_id: None,
            family_id: None,
            gender: Some("Female".into()),
            date_of_birth: Some("1990-05-15T08:30:00.000Z".into()),
            place_of_birth: None,
            religion: None,
            blood_type: Some("AB-".into()),
        };

        let record = normalize_row(row).expect("row should normalize");

        assert_eq!(record.date_of_birth, sample_date(1990, 5, 15));
        assert_eq!(record.gender, Gender::Female);
        assert_eq!(record.blood_type, BloodType::AbNegative);
    }

    #[test]
    fn normalize_skips_rows_with_unreadable_dates() {
        let row = RecordRow {
            id: "5".into(),
            full_name: Some("John Doe".into()),
            population_id: None,
            family_id: None,
            gender: None,
            date_of_birth: Some("not a date".into()),
            place_of_birth: None,
            religion: None,
            blood_type: None,
        };

        assert!(normalize_row(row).is_none());
    }

    // -- load_snapshot ----------------------------------------------------

    #[tokio::test]
    async fn first_load_failure_seeds_sample_data() {
        let (api, repo) = setup();
        api.fail_next_with(ApiError::Unavailable("connection refused".into()));

        let result = repo.load_snapshot().await;

        assert!(result.is_err());
        let records = repo.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].full_name, "John Doe");
    }

    #[tokio::test]
    async fn later_load_failure_keeps_previous_records() {
        let (api, repo) = setup();
        repo.add(draft("Siti Aminah", "1234567890123456"))
            .await
            .expect("add should succeed");
        repo.load_snapshot().await.expect("load should succeed");

        api.fail_next_with(ApiError::Unavailable("connection refused".into()));
        let result = repo.load_snapshot().await;

        assert!(result.is_err());
        let records = repo.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].full_name, "Siti Aminah");
    }

    #[tokio::test]
    async fn load_replaces_collection_atomically() {
        let (api, repo) = setup();
        repo.add(draft("Siti Aminah", "1234567890123456"))
            .await
            .expect("add should succeed");
        api.rows.lock().unwrap().clear();

        repo.load_snapshot().await.expect("load should succeed");

        assert!(repo.records().is_empty());
    }

    // -- add --------------------------------------------------------------

    #[tokio::test]
    async fn add_round_trips_through_snapshot() {
        let (_api, repo) = setup();
        let d = draft("Siti Aminah", "1234567890123456");

        let confirmed = repo.add(d.clone()).await.expect("add should succeed");

        assert!(!confirmed.is_placeholder(), "server id expected");
        repo.load_snapshot().await.expect("load should succeed");
        let records = repo.records();
        assert_eq!(records.len(), 1);
        let loaded = &records[0];
        assert_eq!(loaded.id, confirmed.id);
        assert_eq!(loaded.full_name, d.full_name);
        assert_eq!(loaded.population_id, d.population_id);
        assert_eq!(loaded.family_id, d.family_id);
        assert_eq!(loaded.gender, d.gender);
        assert_eq!(loaded.date_of_birth, d.date_of_birth);
        assert_eq!(loaded.place_of_birth, d.place_of_birth);
        assert_eq!(loaded.religion, d.religion);
        assert_eq!(loaded.blood_type, d.blood_type);
    }

    #[tokio::test]
    async fn add_replaces_placeholder_with_server_record() {
        let (_api, repo) = setup();

        let confirmed = repo
            .add(draft("Siti Aminah", "1234567890123456"))
            .await
            .expect("add should succeed");

        let records = repo.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, confirmed.id);
        assert!(records.iter().all(|r| !r.is_placeholder()));
    }

    #[tokio::test]
    async fn add_duplicate_population_id_is_rejected_before_network() {
        let (api, repo) = setup();
        repo.add(draft("Siti Aminah", "1234567890123456"))
            .await
            .expect("first add should succeed");
        let calls_before = api.data_call_count();

        let result = repo.add(draft("Someone Else", "1234567890123456")).await;

        assert!(matches!(
            result,
            Err(RepositoryError::Validation(ValidationError::DuplicatePopulationId))
        ));
        assert_eq!(api.data_call_count(), calls_before, "no network call expected");
    }

    #[tokio::test]
    async fn add_invalid_draft_is_rejected_before_network() {
        let (api, repo) = setup();

        let result = repo.add(draft("Siti Aminah", "12345")).await;

        assert!(matches!(result, Err(RepositoryError::Validation(_))));
        assert_eq!(api.data_call_count(), 0);
    }

    #[tokio::test]
    async fn add_failure_removes_optimistic_entry() {
        let (api, repo) = setup();
        api.fail_next_with(ApiError::ValidationRejected("duplicate".into()));

        let result = repo.add(draft("Siti Aminah", "1234567890123456")).await;

        assert!(matches!(result, Err(RepositoryError::Api(_))));
        assert!(repo.records().is_empty());
    }

    // -- update -----------------------------------------------------------

    #[tokio::test]
    async fn update_applies_new_values() {
        let (_api, repo) = setup();
        let confirmed = repo
            .add(draft("Siti Aminah", "1234567890123456"))
            .await
            .expect("add should succeed");

        let mut changed = draft("Siti Aminah Binti Hasan", "1234567890123456");
        changed.place_of_birth = "Padang".into();
        let updated = repo
            .update(&confirmed.id, changed)
            .await
            .expect("update should succeed");

        assert_eq!(updated.full_name, "Siti Aminah Binti Hasan");
        let records = repo.records();
        assert_eq!(records[0].place_of_birth, "Padang");
    }

    #[tokio::test]
    async fn update_failure_rolls_back_to_previous_value() {
        let (api, repo) = setup();
        let confirmed = repo
            .add(draft("Siti Aminah", "1234567890123456"))
            .await
            .expect("add should succeed");
        let before = repo.records()[0].clone();

        api.fail_next_with(ApiError::Unavailable("timeout".into()));
        let result = repo
            .update(&confirmed.id, draft("Changed Name", "1234567890123456"))
            .await;

        assert!(matches!(result, Err(RepositoryError::Api(_))));
        assert_eq!(repo.records()[0], before);
    }

    #[tokio::test]
    async fn update_unknown_id_fails_locally() {
        let (api, repo) = setup();

        let result = repo.update("42", draft("Siti Aminah", "1234567890123456")).await;

        assert!(matches!(result, Err(RepositoryError::NotFound(_))));
        assert_eq!(api.data_call_count(), 0);
    }

    #[tokio::test]
    async fn update_to_another_records_population_id_is_rejected() {
        let (_api, repo) = setup();
        repo.add(draft("Siti Aminah", "1234567890123456"))
            .await
            .expect("first add");
        let second = repo
            .add(draft("Budi Santoso", "6543210987654321"))
            .await
            .expect("second add");

        let result = repo
            .update(&second.id, draft("Budi Santoso", "1234567890123456"))
            .await;

        assert!(matches!(
            result,
            Err(RepositoryError::Validation(ValidationError::DuplicatePopulationId))
        ));
    }

    #[tokio::test]
    async fn update_keeping_own_population_id_is_allowed() {
        let (_api, repo) = setup();
        let confirmed = repo
            .add(draft("Siti Aminah", "1234567890123456"))
            .await
            .expect("add should succeed");

        let result = repo
            .update(&confirmed.id, draft("Siti A.", "1234567890123456"))
            .await;

        assert!(result.is_ok());
    }

    // -- remove -----------------------------------------------------------

    #[tokio::test]
    async fn remove_deletes_record() {
        let (_api, repo) = setup();
        let confirmed = repo
            .add(draft("Siti Aminah", "1234567890123456"))
            .await
            .expect("add should succeed");

        repo.remove(&confirmed.id).await.expect("remove should succeed");

        assert!(repo.records().is_empty());
    }

    #[tokio::test]
    async fn remove_failure_reinserts_at_original_position() {
        let (api, repo) = setup();
        let a = repo.add(draft("Aaa", "1111111111111111")).await.unwrap();
        let b = repo.add(draft("Bbb", "2222222222222222")).await.unwrap();
        let c = repo.add(draft("Ccc", "3333333333333333")).await.unwrap();

        api.fail_next_with(ApiError::Unavailable("timeout".into()));
        let result = repo.remove(&b.id).await;

        assert!(matches!(result, Err(RepositoryError::Api(_))));
        let ids: Vec<_> = repo.records().iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[tokio::test]
    async fn remove_unknown_id_fails_locally() {
        let (api, repo) = setup();

        let result = repo.remove("42").await;

        assert!(matches!(result, Err(RepositoryError::NotFound(_))));
        assert_eq!(api.data_call_count(), 0);
    }

    // -- pending guard ----------------------------------------------------

    #[tokio::test]
    async fn overlapping_mutations_on_one_id_are_rejected() {
        let (api, repo) = setup();
        let confirmed = repo
            .add(draft("Siti Aminah", "1234567890123456"))
            .await
            .expect("add should succeed");

        // Park the next remote call so the first mutation stays in flight.
        let gate = Arc::new(Semaphore::new(0));
        *api.gate.lock().unwrap() = Some(gate.clone());

        let in_flight = {
            let repo = repo.clone();
            let id = confirmed.id.clone();
            tokio::spawn(async move {
                repo.update(&id, draft("Renamed", "1234567890123456")).await
            })
        };
        tokio::task::yield_now().await;

        let second = repo.remove(&confirmed.id).await;
        assert!(matches!(second, Err(RepositoryError::MutationInFlight(_))));

        gate.add_permits(1);
        let first = in_flight.await.expect("task should not panic");
        assert!(first.is_ok(), "gated update should complete");
    }

    #[tokio::test]
    async fn guard_is_released_after_completion() {
        let (_api, repo) = setup();
        let confirmed = repo
            .add(draft("Siti Aminah", "1234567890123456"))
            .await
            .expect("add should succeed");

        repo.update(&confirmed.id, draft("First", "1234567890123456"))
            .await
            .expect("first update");
        repo.update(&confirmed.id, draft("Second", "1234567890123456"))
            .await
            .expect("second update");

        assert_eq!(repo.records()[0].full_name, "Second");
    }

    // -- observers --------------------------------------------------------

    #[tokio::test]
    async fn subscribers_see_optimistic_insert_and_confirmation() {
        let (_api, repo) = setup();
        let mut rx = repo.subscribe();

        repo.add(draft("Siti Aminah", "1234567890123456"))
            .await
            .expect("add should succeed");

        rx.changed().await.expect("collection should have changed");
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.len(), 1);
    }
}
