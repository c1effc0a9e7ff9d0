use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReclaimError {
    #[error("flow error: {0}")]
    Flow(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PoolError {
    #[error("pool backend error: {0}")]
    Backend(String),
}

/// Vendor-assigned member identifier. Opaque, stable, never synthesized locally.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct MemberId(pub String);

impl MemberId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Vendor lifecycle tag. Only `issued` carries meaning here; every other
/// value is passed through opaque.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(transparent)]
pub struct PassStatus(pub String);

impl PassStatus {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn is_issued(&self) -> bool {
        self.0.eq_ignore_ascii_case("issued")
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeMode {
    CollapseWhitespace,
    StripWhitespace,
}

impl NormalizeMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CollapseWhitespace => "collapse_whitespace",
            Self::StripWhitespace => "strip_whitespace",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "collapse_whitespace" => Some(Self::CollapseWhitespace),
            "strip_whitespace" => Some(Self::StripWhitespace),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Exact,
    Substring,
}

impl MatchMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Substring => "substring",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "exact" => Some(Self::Exact),
            "substring" => Some(Self::Substring),
            _ => None,
        }
    }
}

/// Which name keys a duplicate group. The search key reflects operator intent
/// about who the group is for, and diverges from the record's own display
/// name under substring matching.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GroupKeyMode {
    SearchKey,
    DisplayName,
}

impl GroupKeyMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SearchKey => "search_key",
            Self::DisplayName => "display_name",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "search_key" => Some(Self::SearchKey),
            "display_name" => Some(Self::DisplayName),
            _ => None,
        }
    }
}

/// Canonicalize one raw input line into a search name.
///
/// Trims, rewrites internal whitespace per `mode`, upper-cases. Returns
/// `None` when nothing remains; such lines are dropped from the batch.
#[must_use]
pub fn normalize_name(raw: &str, mode: NormalizeMode) -> Option<String> {
    let rewritten = match mode {
        NormalizeMode::CollapseWhitespace => {
            raw.split_whitespace().collect::<Vec<_>>().join(" ")
        }
        NormalizeMode::StripWhitespace => raw.split_whitespace().collect::<String>(),
    };
    let canonical = rewritten.to_uppercase();
    if canonical.is_empty() {
        None
    } else {
        Some(canonical)
    }
}

/// Normalize a list of raw lines and drop exact duplicates, preserving
/// first-occurrence order.
#[must_use]
pub fn dedupe_names<'a, I>(lines: I, mode: NormalizeMode) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = BTreeSet::new();
    let mut names = Vec::new();
    for line in lines {
        let Some(name) = normalize_name(line, mode) else {
            continue;
        };
        if seen.insert(name.clone()) {
            names.push(name);
        }
    }
    names
}

const RECORD_CONTAINER_ALIASES: [&str; 2] = ["result", "member"];
const META_CONTAINER_ALIASES: [&str; 3] = ["meta", "metaData", "metadata"];
const CREATED_ALIASES: [&str; 3] = ["created", "createdAt", "createdOn"];
const UPDATED_ALIASES: [&str; 3] = ["updated", "updatedAt", "updatedOn"];

/// Metadata key names inside the vendor's free-form meta container.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MetaKeys {
    pub card_number: String,
    pub lock_marker: String,
}

impl Default for MetaKeys {
    fn default() -> Self {
        Self {
            card_number: "meta_cardNumber".to_string(),
            lock_marker: "reclaim_lock".to_string(),
        }
    }
}

fn first_present<'a>(object: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| {
        let value = object.get(*key)?;
        if value.is_null() {
            None
        } else {
            Some(value)
        }
    })
}

fn value_to_trimmed_string(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// One membership entry in canonical shape.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MemberRecord {
    pub id: MemberId,
    pub display_name: String,
    /// The normalized input name whose search produced this record.
    pub search_key: String,
    pub status: PassStatus,
    pub card_number: Option<String>,
    pub created: Option<String>,
    pub updated: Option<String>,
    pub lock_marker: Option<String>,
}

impl MemberRecord {
    #[must_use]
    pub fn parsed_created(&self) -> Option<OffsetDateTime> {
        self.created.as_deref().and_then(parse_vendor_timestamp)
    }

    #[must_use]
    pub fn parsed_updated(&self) -> Option<OffsetDateTime> {
        self.updated.as_deref().and_then(parse_vendor_timestamp)
    }

    #[must_use]
    pub fn is_recyclable(&self, policy: &RecyclePolicy) -> bool {
        block_reason(self, policy).is_none()
    }
}

/// Parse a vendor timestamp: RFC3339 first, bare `YYYY-MM-DD` as a fallback.
/// Anything else is unparseable and only usable for server-order tie-breaks.
#[must_use]
pub fn parse_vendor_timestamp(raw: &str) -> Option<OffsetDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) =
        OffsetDateTime::parse(trimmed, &time::format_description::well_known::Rfc3339)
    {
        return Some(parsed);
    }
    let format = time::format_description::parse("[year]-[month]-[day]").ok()?;
    let date = time::Date::parse(trimmed, &format).ok()?;
    Some(date.midnight().assume_utc())
}

/// Map one raw search-response item to a canonical record.
///
/// The vendor wraps the record and its metadata container under several
/// historical key spellings; each logical field probes a fixed, ordered alias
/// list and takes the first present, non-null value. Items lacking both a
/// display name and an id are placeholder rows and are dropped silently.
#[must_use]
pub fn extract_record(item: &Value, search_key: &str, meta_keys: &MetaKeys) -> Option<MemberRecord> {
    let record = first_present(item, &RECORD_CONTAINER_ALIASES)
        .filter(|value| value.is_object())
        .unwrap_or(item);
    if !record.is_object() {
        return None;
    }

    let person = record.get("person").filter(|value| value.is_object());
    let display_name = person
        .and_then(|container| container.get("displayName"))
        .or_else(|| record.get("displayName"))
        .and_then(value_to_trimmed_string)?;
    let id = record.get("id").and_then(value_to_trimmed_string)?;

    let status = record
        .get("passStatus")
        .and_then(value_to_trimmed_string)
        .unwrap_or_default();

    let meta = first_present(record, &META_CONTAINER_ALIASES).filter(|value| value.is_object());
    let card_number = meta
        .and_then(|container| container.get(meta_keys.card_number.as_str()))
        .and_then(value_to_trimmed_string);
    let lock_marker = meta
        .and_then(|container| container.get(meta_keys.lock_marker.as_str()))
        .and_then(value_to_trimmed_string);

    let created = first_present(record, &CREATED_ALIASES).and_then(value_to_trimmed_string);
    let updated = first_present(record, &UPDATED_ALIASES).and_then(value_to_trimmed_string);

    Some(MemberRecord {
        id: MemberId::new(id),
        display_name,
        search_key: search_key.to_string(),
        status: PassStatus::new(status),
        card_number,
        created,
        updated,
        lock_marker,
    })
}

/// Extract up to `cap` records from one search response, preserving
/// server-reported order.
#[must_use]
pub fn extract_records(
    items: &[Value],
    search_key: &str,
    meta_keys: &MetaKeys,
    cap: usize,
) -> Vec<MemberRecord> {
    let mut records = Vec::new();
    for item in items {
        if records.len() >= cap {
            break;
        }
        if let Some(record) = extract_record(item, search_key, meta_keys) {
            records.push(record);
        }
    }
    records
}

/// Safety policy for reclaiming a duplicate record's identifier.
///
/// A record is reclaimable iff its status is `issued`, its card number is
/// empty, and (with lock enforcement on) no reclaim lock marker is present.
/// Reassigning a record whose card number is bound, or whose identifier may
/// already have been handed to someone, causes real-world identity confusion.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecyclePolicy {
    pub enforce_lock_marker: bool,
}

impl Default for RecyclePolicy {
    fn default() -> Self {
        Self { enforce_lock_marker: true }
    }
}

fn block_reason(record: &MemberRecord, policy: &RecyclePolicy) -> Option<String> {
    if !record.status.is_issued() {
        return Some(format!(
            "status is `{}`; only issued records are reclaimable",
            record.status.as_str()
        ));
    }
    if record.card_number.is_some() {
        return Some("card number is bound to a physical artifact".to_string());
    }
    if policy.enforce_lock_marker && record.lock_marker.is_some() {
        return Some("reclaim lock marker is set; identifier was already reassigned".to_string());
    }
    None
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SearchWarning {
    pub name: String,
    pub detail: String,
}

/// One batch-search run: deduplicated input names, hit records, names with
/// zero hits, and per-name collaborator failures (routed to missing, but
/// surfaced distinctly).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SearchBatch {
    pub run_id: RunId,
    pub names: Vec<String>,
    pub hits: Vec<MemberRecord>,
    pub missing: Vec<String>,
    pub warnings: Vec<SearchWarning>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DuplicateGroup {
    pub key: String,
    pub records: Vec<MemberRecord>,
}

/// Partition hits into groups, preserving first-seen order of groups and of
/// records within a group. Every hit lands in exactly one group.
#[must_use]
pub fn group_hits(hits: &[MemberRecord], key_mode: GroupKeyMode) -> Vec<DuplicateGroup> {
    let mut groups: Vec<DuplicateGroup> = Vec::new();
    let mut index_by_key: HashMap<String, usize> = HashMap::new();
    for record in hits {
        let key = match key_mode {
            GroupKeyMode::SearchKey => record.search_key.clone(),
            GroupKeyMode::DisplayName => record.display_name.clone(),
        };
        if let Some(&index) = index_by_key.get(&key) {
            groups[index].records.push(record.clone());
        } else {
            index_by_key.insert(key.clone(), groups.len());
            groups.push(DuplicateGroup { key, records: vec![record.clone()] });
        }
    }
    groups
}

/// How the keeper of a group was chosen. `ServerOrder` means no timestamp in
/// the group parsed and the plan built on it is low-confidence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KeeperBasis {
    Updated,
    Created,
    ServerOrder,
}

impl KeeperBasis {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Updated => "updated",
            Self::Created => "created",
            Self::ServerOrder => "server_order",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "updated" => Some(Self::Updated),
            "created" => Some(Self::Created),
            "server_order" => Some(Self::ServerOrder),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_low_confidence(self) -> bool {
        matches!(self, Self::ServerOrder)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReclaimCandidate {
    pub id: MemberId,
    pub group_key: String,
    pub basis: KeeperBasis,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BlockedDuplicate {
    pub id: MemberId,
    pub group_key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GroupResolution {
    pub key: String,
    pub keeper: MemberId,
    pub basis: KeeperBasis,
    pub candidate_ids: Vec<MemberId>,
    pub blocked: Vec<BlockedDuplicate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReclaimOutcome {
    pub resolutions: Vec<GroupResolution>,
    pub candidates: Vec<ReclaimCandidate>,
    pub blocked: Vec<BlockedDuplicate>,
}

fn cmp_by_timestamp(
    lhs: &MemberRecord,
    rhs: &MemberRecord,
    timestamp: fn(&MemberRecord) -> Option<OffsetDateTime>,
) -> Ordering {
    let ordering = match (timestamp(lhs), timestamp(rhs)) {
        (Some(lhs_ts), Some(rhs_ts)) => rhs_ts.cmp(&lhs_ts),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    ordering.then_with(|| lhs.id.cmp(&rhs.id))
}

fn order_group(records: &[MemberRecord]) -> (Vec<MemberRecord>, KeeperBasis) {
    let basis = if records.iter().any(|record| record.parsed_updated().is_some()) {
        KeeperBasis::Updated
    } else if records.iter().any(|record| record.parsed_created().is_some()) {
        KeeperBasis::Created
    } else {
        KeeperBasis::ServerOrder
    };

    let mut ordered: Vec<MemberRecord> = records.to_vec();
    match basis {
        KeeperBasis::Updated => {
            ordered.sort_by(|lhs, rhs| cmp_by_timestamp(lhs, rhs, MemberRecord::parsed_updated));
        }
        KeeperBasis::Created => {
            ordered.sort_by(|lhs, rhs| cmp_by_timestamp(lhs, rhs, MemberRecord::parsed_created));
        }
        KeeperBasis::ServerOrder => {}
    }
    (ordered, basis)
}

/// Classify every multi-record group: one keeper (newest, never touched),
/// the rest either reclaim candidates or blocked duplicates.
///
/// Candidate order follows group order, then in-group order after the sort.
/// Ids already present in `already_pooled` are skipped, as are repeats within
/// this outcome.
#[must_use]
pub fn resolve_groups(
    groups: &[DuplicateGroup],
    policy: &RecyclePolicy,
    already_pooled: &BTreeSet<MemberId>,
) -> ReclaimOutcome {
    let mut resolutions = Vec::new();
    let mut candidates = Vec::new();
    let mut blocked = Vec::new();
    let mut seen = already_pooled.clone();

    for group in groups {
        if group.records.len() < 2 {
            continue;
        }

        let (ordered, basis) = order_group(&group.records);
        let keeper = ordered[0].id.clone();
        let mut candidate_ids = Vec::new();
        let mut group_blocked = Vec::new();

        for record in ordered.iter().skip(1) {
            if let Some(reason) = block_reason(record, policy) {
                let entry = BlockedDuplicate {
                    id: record.id.clone(),
                    group_key: group.key.clone(),
                    reason,
                };
                group_blocked.push(entry.clone());
                blocked.push(entry);
                continue;
            }
            if !seen.insert(record.id.clone()) {
                continue;
            }
            candidate_ids.push(record.id.clone());
            candidates.push(ReclaimCandidate {
                id: record.id.clone(),
                group_key: group.key.clone(),
                basis,
            });
        }

        resolutions.push(GroupResolution {
            key: group.key.clone(),
            keeper,
            basis,
            candidate_ids,
            blocked: group_blocked,
        });
    }

    ReclaimOutcome { resolutions, candidates, blocked }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AssignmentPair {
    pub missing_name: String,
    pub recycled_id: MemberId,
}

/// Deterministic pairing of recycled identifiers to missing names. Pure data;
/// nothing is mutated until an executor applies it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct AssignmentPlan {
    pub pairs: Vec<AssignmentPair>,
}

impl AssignmentPlan {
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Zip candidates against missing names positionally, taking the first
/// `min(candidates, missing, limit)` pairs. Repeats in either input keep
/// their first occurrence only, so no id or name appears twice in the plan.
#[must_use]
pub fn plan_assignments(
    candidates: &[MemberId],
    missing: &[String],
    limit: usize,
) -> AssignmentPlan {
    let mut seen_ids = BTreeSet::new();
    let unique_ids: Vec<&MemberId> =
        candidates.iter().filter(|id| seen_ids.insert((*id).clone())).collect();
    let mut seen_names = BTreeSet::new();
    let unique_names: Vec<&String> =
        missing.iter().filter(|name| seen_names.insert((*name).clone())).collect();

    let take = unique_ids.len().min(unique_names.len()).min(limit);
    let pairs = unique_names
        .iter()
        .take(take)
        .zip(unique_ids.iter().take(take))
        .map(|(name, id)| AssignmentPair {
            missing_name: (*name).clone(),
            recycled_id: (*id).clone(),
        })
        .collect();
    AssignmentPlan { pairs }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Idle,
    Searching,
    PlanReady,
    Executing,
    ExecutionComplete,
}

impl FlowState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Searching => "searching",
            Self::PlanReady => "plan_ready",
            Self::Executing => "executing",
            Self::ExecutionComplete => "execution_complete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(Self::Idle),
            "searching" => Some(Self::Searching),
            "plan_ready" => Some(Self::PlanReady),
            "executing" => Some(Self::Executing),
            "execution_complete" => Some(Self::ExecutionComplete),
            _ => None,
        }
    }
}

/// End-to-end flow gate. The only path into `Executing` goes through
/// `begin_execution` with an explicit operator acknowledgment.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReconcileFlow {
    state: FlowState,
}

impl ReconcileFlow {
    #[must_use]
    pub fn new() -> Self {
        Self { state: FlowState::Idle }
    }

    #[must_use]
    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Batches may stack: more searches are allowed while a plan is pending,
    /// so the cumulative pool can grow before one execution consumes it.
    ///
    /// # Errors
    /// Returns [`ReclaimError::Flow`] while a search or execution is mid-flight.
    pub fn begin_search(&mut self) -> Result<(), ReclaimError> {
        match self.state {
            FlowState::Idle | FlowState::PlanReady | FlowState::ExecutionComplete => {
                self.state = FlowState::Searching;
                Ok(())
            }
            other => Err(ReclaimError::Flow(format!(
                "cannot begin a search from state `{}`",
                other.as_str()
            ))),
        }
    }

    /// # Errors
    /// Returns [`ReclaimError::Flow`] unless a search is in progress.
    pub fn complete_search(&mut self) -> Result<(), ReclaimError> {
        match self.state {
            FlowState::Searching => {
                self.state = FlowState::PlanReady;
                Ok(())
            }
            other => Err(ReclaimError::Flow(format!(
                "cannot complete a search from state `{}`",
                other.as_str()
            ))),
        }
    }

    /// Planning from a previously persisted pool, with no fresh search.
    ///
    /// # Errors
    /// Returns [`ReclaimError::Flow`] when a search or execution is mid-flight.
    pub fn mark_plan_ready(&mut self) -> Result<(), ReclaimError> {
        match self.state {
            FlowState::Idle | FlowState::PlanReady | FlowState::ExecutionComplete => {
                self.state = FlowState::PlanReady;
                Ok(())
            }
            other => Err(ReclaimError::Flow(format!(
                "cannot prepare a plan from state `{}`",
                other.as_str()
            ))),
        }
    }

    /// # Errors
    /// Returns [`ReclaimError::Flow`] without operator acknowledgment, or
    /// when no plan is ready.
    pub fn begin_execution(&mut self, acknowledged: bool) -> Result<(), ReclaimError> {
        if self.state != FlowState::PlanReady {
            return Err(ReclaimError::Flow(format!(
                "cannot execute from state `{}`; prepare a plan first",
                self.state.as_str()
            )));
        }
        if !acknowledged {
            return Err(ReclaimError::Flow(
                "execution requires explicit operator acknowledgment".to_string(),
            ));
        }
        self.state = FlowState::Executing;
        Ok(())
    }

    /// # Errors
    /// Returns [`ReclaimError::Flow`] unless an execution is in progress.
    pub fn complete_execution(&mut self) -> Result<(), ReclaimError> {
        match self.state {
            FlowState::Executing => {
                self.state = FlowState::ExecutionComplete;
                Ok(())
            }
            other => Err(ReclaimError::Flow(format!(
                "cannot complete an execution from state `{}`",
                other.as_str()
            ))),
        }
    }

    pub fn reset(&mut self) {
        self.state = FlowState::Idle;
    }
}

impl Default for ReconcileFlow {
    fn default() -> Self {
        Self::new()
    }
}

/// A reclaimed identifier waiting in the pool for assignment.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PooledCandidate {
    pub id: MemberId,
    pub group_key: String,
    pub basis: KeeperBasis,
    pub run_id: RunId,
    #[serde(with = "time::serde::rfc3339")]
    pub added_at: OffsetDateTime,
}

/// Working set of reclaimable identifiers plus the missing-name ledger they
/// will be assigned to. Implementations must preserve insertion order and
/// deduplicate on id / name.
pub trait RecyclePool {
    /// Returns `false` when the id was already pooled.
    ///
    /// # Errors
    /// Returns [`PoolError::Backend`] when the backing store fails.
    fn add_candidate(&mut self, candidate: &PooledCandidate) -> Result<bool, PoolError>;

    /// Returns `false` when the id was not pooled.
    ///
    /// # Errors
    /// Returns [`PoolError::Backend`] when the backing store fails.
    fn remove_candidate(&mut self, id: &MemberId) -> Result<bool, PoolError>;

    /// # Errors
    /// Returns [`PoolError::Backend`] when the backing store fails.
    fn list_candidates(&self) -> Result<Vec<PooledCandidate>, PoolError>;

    /// Returns `false` when the name was already in the ledger.
    ///
    /// # Errors
    /// Returns [`PoolError::Backend`] when the backing store fails.
    fn push_missing(&mut self, name: &str, run_id: RunId) -> Result<bool, PoolError>;

    /// Returns `false` when the name was not in the ledger.
    ///
    /// # Errors
    /// Returns [`PoolError::Backend`] when the backing store fails.
    fn remove_missing(&mut self, name: &str) -> Result<bool, PoolError>;

    /// # Errors
    /// Returns [`PoolError::Backend`] when the backing store fails.
    fn list_missing(&self) -> Result<Vec<String>, PoolError>;

    /// # Errors
    /// Returns [`PoolError::Backend`] when the backing store fails.
    fn clear(&mut self) -> Result<(), PoolError>;
}

/// Batch-scoped in-memory pool. State lives only as long as the owner.
#[derive(Debug, Clone, Default)]
pub struct MemoryPool {
    candidates: Vec<PooledCandidate>,
    missing: Vec<(String, RunId)>,
}

impl MemoryPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecyclePool for MemoryPool {
    fn add_candidate(&mut self, candidate: &PooledCandidate) -> Result<bool, PoolError> {
        if self.candidates.iter().any(|existing| existing.id == candidate.id) {
            return Ok(false);
        }
        self.candidates.push(candidate.clone());
        Ok(true)
    }

    fn remove_candidate(&mut self, id: &MemberId) -> Result<bool, PoolError> {
        let before = self.candidates.len();
        self.candidates.retain(|candidate| candidate.id != *id);
        Ok(self.candidates.len() != before)
    }

    fn list_candidates(&self) -> Result<Vec<PooledCandidate>, PoolError> {
        Ok(self.candidates.clone())
    }

    fn push_missing(&mut self, name: &str, run_id: RunId) -> Result<bool, PoolError> {
        if self.missing.iter().any(|(existing, _)| existing == name) {
            return Ok(false);
        }
        self.missing.push((name.to_string(), run_id));
        Ok(true)
    }

    fn remove_missing(&mut self, name: &str) -> Result<bool, PoolError> {
        let before = self.missing.len();
        self.missing.retain(|(existing, _)| existing != name);
        Ok(self.missing.len() != before)
    }

    fn list_missing(&self) -> Result<Vec<String>, PoolError> {
        Ok(self.missing.iter().map(|(name, _)| name.clone()).collect())
    }

    fn clear(&mut self) -> Result<(), PoolError> {
        self.candidates.clear();
        self.missing.clear();
        Ok(())
    }
}
