use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use pass_reclaim_core::{
    dedupe_names, extract_records, group_hits, plan_assignments, resolve_groups, AssignmentPlan,
    BlockedDuplicate, FlowState, GroupKeyMode, GroupResolution, MatchMode, MemberId, MemberRecord,
    MetaKeys, NormalizeMode, PooledCandidate, ReconcileFlow, RecyclePolicy, RecyclePool, RunId,
    SearchBatch, SearchWarning,
};
use pass_reclaim_vendor::{
    truncate_detail, DirectoryConfig, MemberDirectory, MemberUpdate, SearchFilter, Throttle,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Environment override for the vendor credential, so the key can stay out
/// of the config file.
pub const API_KEY_ENV: &str = "PASS_RECLAIM_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VendorSettings {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReclaimDefaults {
    /// Upper bound on input names per batch; the operator surface is bounded.
    pub max_names: usize,
    pub max_hits_per_name: usize,
    pub search_throttle_ms: u64,
    pub update_throttle_ms: u64,
    pub assign_limit: usize,
    pub match_mode: MatchMode,
    pub normalize_mode: NormalizeMode,
    pub group_key_mode: GroupKeyMode,
    pub enforce_lock_marker: bool,
    pub meta_keys: MetaKeys,
}

impl Default for ReclaimDefaults {
    fn default() -> Self {
        Self {
            max_names: 200,
            max_hits_per_name: 10,
            search_throttle_ms: 250,
            update_throttle_ms: 500,
            assign_limit: 50,
            match_mode: MatchMode::Exact,
            normalize_mode: NormalizeMode::CollapseWhitespace,
            group_key_mode: GroupKeyMode::SearchKey,
            enforce_lock_marker: true,
            meta_keys: MetaKeys::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub vendor: VendorSettings,
    #[serde(default)]
    pub defaults: ReclaimDefaults,
}

impl AppConfig {
    /// Load and validate configuration from a YAML file, with the API key
    /// overridable through [`API_KEY_ENV`].
    ///
    /// # Errors
    /// Returns an error when the file is unreadable, unparseable, or the
    /// vendor endpoint/credential is missing. Nothing proceeds partially.
    pub fn load(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Self = serde_yaml::from_str(&body)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                config.vendor.api_key = key.trim().to_string();
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the vendor endpoint or credential is missing.
    pub fn validate(&self) -> Result<()> {
        if self.vendor.base_url.trim().is_empty() {
            return Err(anyhow!("vendor base URL is not configured (vendor.base_url)"));
        }
        if self.vendor.api_key.trim().is_empty() {
            return Err(anyhow!(
                "vendor API key is not configured (set vendor.api_key or {API_KEY_ENV})"
            ));
        }
        if self.defaults.max_names == 0 || self.defaults.max_hits_per_name == 0 {
            return Err(anyhow!("defaults.max_names and defaults.max_hits_per_name must be >= 1"));
        }
        Ok(())
    }

    #[must_use]
    pub fn directory_config(&self) -> DirectoryConfig {
        DirectoryConfig {
            base_url: self.vendor.base_url.clone(),
            api_key: self.vendor.api_key.clone(),
            timeout_secs: self.vendor.timeout_secs,
        }
    }
}

/// Per-call knobs the operator can turn without editing configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchOverrides {
    pub max_hits_per_name: Option<usize>,
    pub search_throttle_ms: Option<u64>,
    pub match_mode: Option<MatchMode>,
    pub normalize_mode: Option<NormalizeMode>,
    pub group_key_mode: Option<GroupKeyMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchReport {
    pub run_id: RunId,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub names: Vec<String>,
    pub hits: Vec<MemberRecord>,
    pub missing: Vec<String>,
    pub warnings: Vec<SearchWarning>,
    pub resolutions: Vec<GroupResolution>,
    pub blocked: Vec<BlockedDuplicate>,
    pub candidates_added: usize,
    pub pool_total: usize,
    pub missing_total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanReport {
    pub plan: AssignmentPlan,
    pub candidates_total: usize,
    pub missing_total: usize,
    pub limit: usize,
    /// True when any planned id came out of a group resolved by server order
    /// alone (no parseable timestamps).
    pub low_confidence: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub missing_name: String,
    pub recycled_id: MemberId,
    pub status: ExecutionStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionReport {
    pub run_id: RunId,
    #[serde(with = "time::serde::rfc3339")]
    pub executed_at: OffsetDateTime,
    pub attempted: usize,
    pub ok: usize,
    pub failed: usize,
    pub results: Vec<ExecutionOutcome>,
    pub pool_total: usize,
    pub missing_total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub candidates: Vec<PooledCandidate>,
    pub missing: Vec<String>,
}

/// Build the dry-run plan straight from pool state. Pure bookkeeping over
/// `min(candidates, missing, limit)`; usable without a directory at hand.
///
/// # Errors
/// Returns an error when the pool backend fails.
pub fn plan_from_pool<P: RecyclePool>(pool: &P, limit: usize) -> Result<PlanReport> {
    let candidates = pool.list_candidates()?;
    let missing = pool.list_missing()?;
    let candidate_ids: Vec<MemberId> =
        candidates.iter().map(|candidate| candidate.id.clone()).collect();
    let plan = plan_assignments(&candidate_ids, &missing, limit);

    let planned_ids: BTreeSet<&MemberId> =
        plan.pairs.iter().map(|pair| &pair.recycled_id).collect();
    let low_confidence = candidates
        .iter()
        .any(|candidate| planned_ids.contains(&candidate.id) && candidate.basis.is_low_confidence());

    Ok(PlanReport {
        plan,
        candidates_total: candidates.len(),
        missing_total: missing.len(),
        limit,
        low_confidence,
    })
}

/// One operator session over a directory and a recycle pool: search, plan,
/// execute, in that order, with the flow gate in between.
pub struct ReclaimSession<D, P> {
    directory: D,
    pool: P,
    defaults: ReclaimDefaults,
    flow: ReconcileFlow,
}

impl<D, P> ReclaimSession<D, P>
where
    D: MemberDirectory,
    P: RecyclePool,
{
    #[must_use]
    pub fn new(directory: D, pool: P, defaults: ReclaimDefaults) -> Self {
        Self { directory, pool, defaults, flow: ReconcileFlow::new() }
    }

    #[must_use]
    pub fn state(&self) -> FlowState {
        self.flow.state()
    }

    pub fn pool_mut(&mut self) -> &mut P {
        &mut self.pool
    }

    /// Return the flow to idle, e.g. after reviewing a completed execution.
    pub fn reset(&mut self) {
        self.flow.reset();
    }

    /// Run one search batch: dedupe the input, call the directory once per
    /// name in order, bucket hits and misses, classify duplicates, and feed
    /// the pool.
    ///
    /// # Errors
    /// Returns an error on flow misuse, unusable input, or a pool-backend
    /// failure. Per-name directory failures never abort the batch.
    pub fn run_search(&mut self, input: &str, overrides: &SearchOverrides) -> Result<SearchReport> {
        self.flow.begin_search()?;
        match self.search_inner(input, overrides) {
            Ok(report) => {
                self.flow.complete_search()?;
                Ok(report)
            }
            Err(err) => {
                self.flow.reset();
                Err(err)
            }
        }
    }

    fn search_inner(&mut self, input: &str, overrides: &SearchOverrides) -> Result<SearchReport> {
        let normalize_mode = overrides.normalize_mode.unwrap_or(self.defaults.normalize_mode);
        let match_mode = overrides.match_mode.unwrap_or(self.defaults.match_mode);
        let group_key_mode = overrides.group_key_mode.unwrap_or(self.defaults.group_key_mode);
        let max_hits = overrides.max_hits_per_name.unwrap_or(self.defaults.max_hits_per_name);
        let throttle_ms = overrides.search_throttle_ms.unwrap_or(self.defaults.search_throttle_ms);

        let names = dedupe_names(input.lines(), normalize_mode);
        if names.is_empty() {
            return Err(anyhow!("no usable names in the input batch"));
        }
        if names.len() > self.defaults.max_names {
            return Err(anyhow!(
                "input batch has {} names; the limit is {}",
                names.len(),
                self.defaults.max_names
            ));
        }

        let run_id = RunId::new();
        let started_at = OffsetDateTime::now_utc();
        let mut throttle = Throttle::from_millis(throttle_ms);
        let mut hits = Vec::new();
        let mut missing = Vec::new();
        let mut warnings = Vec::new();

        for name in &names {
            throttle.pause();
            let filter = SearchFilter {
                name: name.clone(),
                mode: match_mode,
                limit: max_hits,
                offset: 0,
            };
            match self.directory.search(&filter) {
                Ok(items) => {
                    let records =
                        extract_records(&items, name, &self.defaults.meta_keys, max_hits);
                    if records.is_empty() {
                        missing.push(name.clone());
                    } else {
                        hits.extend(records);
                    }
                }
                Err(err) => {
                    tracing::warn!(name = %name, error = %err, "search failed; routing name to missing");
                    warnings.push(SearchWarning {
                        name: name.clone(),
                        detail: truncate_detail(&err.to_string()),
                    });
                    missing.push(name.clone());
                }
            }
        }

        let batch = SearchBatch { run_id, names, hits, missing, warnings };
        let policy = RecyclePolicy { enforce_lock_marker: self.defaults.enforce_lock_marker };
        let groups = group_hits(&batch.hits, group_key_mode);
        let pooled_ids: BTreeSet<MemberId> = self
            .pool
            .list_candidates()?
            .into_iter()
            .map(|candidate| candidate.id)
            .collect();
        let outcome = resolve_groups(&groups, &policy, &pooled_ids);

        for resolution in &outcome.resolutions {
            if resolution.basis.is_low_confidence() {
                tracing::warn!(
                    group = %resolution.key,
                    keeper = %resolution.keeper,
                    "no timestamp in group parsed; keeper chosen by server order (low confidence)"
                );
            }
        }

        let mut candidates_added = 0;
        for candidate in &outcome.candidates {
            let added = self.pool.add_candidate(&PooledCandidate {
                id: candidate.id.clone(),
                group_key: candidate.group_key.clone(),
                basis: candidate.basis,
                run_id,
                added_at: started_at,
            })?;
            if added {
                candidates_added += 1;
            }
        }
        for name in &batch.missing {
            self.pool.push_missing(name, run_id)?;
        }

        let pool_total = self.pool.list_candidates()?.len();
        let missing_total = self.pool.list_missing()?.len();
        tracing::info!(
            run_id = %run_id,
            names = batch.names.len(),
            hits = batch.hits.len(),
            missing = batch.missing.len(),
            candidates_added,
            "search batch complete"
        );

        Ok(SearchReport {
            run_id,
            started_at,
            names: batch.names,
            hits: batch.hits,
            missing: batch.missing,
            warnings: batch.warnings,
            resolutions: outcome.resolutions,
            blocked: outcome.blocked,
            candidates_added,
            pool_total,
            missing_total,
        })
    }

    /// Produce the dry-run assignment plan from the current pool state.
    /// Pure bookkeeping: no directory call is made here.
    ///
    /// # Errors
    /// Returns an error on flow misuse or a pool-backend failure.
    pub fn plan(&mut self, limit: Option<usize>) -> Result<PlanReport> {
        self.flow.mark_plan_ready()?;
        let limit = limit.unwrap_or(self.defaults.assign_limit);
        plan_from_pool(&self.pool, limit)
    }

    /// Apply the current plan through the directory, one update per pair in
    /// plan order. Requires the operator acknowledgment; a pair failure never
    /// aborts the remaining pairs, and only successful pairs leave the pool
    /// and the missing ledger.
    ///
    /// # Errors
    /// Returns an error when acknowledgment is absent, the flow gate is
    /// violated, or the pool backend fails.
    pub fn execute(
        &mut self,
        acknowledged: bool,
        limit: Option<usize>,
        delay_ms: Option<u64>,
    ) -> Result<ExecutionReport> {
        let plan_report = self.plan(limit)?;
        self.flow.begin_execution(acknowledged)?;
        match self.execute_inner(&plan_report.plan, delay_ms) {
            Ok(report) => {
                self.flow.complete_execution()?;
                Ok(report)
            }
            Err(err) => {
                self.flow.reset();
                Err(err)
            }
        }
    }

    fn execute_inner(
        &mut self,
        plan: &AssignmentPlan,
        delay_ms: Option<u64>,
    ) -> Result<ExecutionReport> {
        let run_id = RunId::new();
        let executed_at = OffsetDateTime::now_utc();
        let mut throttle =
            Throttle::from_millis(delay_ms.unwrap_or(self.defaults.update_throttle_ms));
        let mut results = Vec::new();
        let mut ok = 0;
        let mut failed = 0;

        for pair in &plan.pairs {
            throttle.pause();
            let mut meta = BTreeMap::new();
            if self.defaults.enforce_lock_marker {
                meta.insert(
                    self.defaults.meta_keys.lock_marker.clone(),
                    format!("reclaimed:{run_id}"),
                );
            }
            let update = MemberUpdate {
                id: pair.recycled_id.clone(),
                display_name: pair.missing_name.clone(),
                meta,
            };
            match self.directory.update(&update) {
                Ok(_) => {
                    self.pool.remove_candidate(&pair.recycled_id)?;
                    self.pool.remove_missing(&pair.missing_name)?;
                    results.push(ExecutionOutcome {
                        missing_name: pair.missing_name.clone(),
                        recycled_id: pair.recycled_id.clone(),
                        status: ExecutionStatus::Ok,
                        detail: None,
                    });
                    ok += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        id = %pair.recycled_id,
                        name = %pair.missing_name,
                        error = %err,
                        "update failed; pair stays pooled"
                    );
                    results.push(ExecutionOutcome {
                        missing_name: pair.missing_name.clone(),
                        recycled_id: pair.recycled_id.clone(),
                        status: ExecutionStatus::Failed,
                        detail: Some(truncate_detail(&err.to_string())),
                    });
                    failed += 1;
                }
            }
        }

        let pool_total = self.pool.list_candidates()?.len();
        let missing_total = self.pool.list_missing()?.len();
        tracing::info!(run_id = %run_id, attempted = results.len(), ok, failed, "execution complete");

        Ok(ExecutionReport {
            run_id,
            executed_at,
            attempted: results.len(),
            ok,
            failed,
            results,
            pool_total,
            missing_total,
        })
    }

    /// # Errors
    /// Returns an error when the pool backend fails.
    pub fn pool_snapshot(&self) -> Result<PoolSnapshot> {
        Ok(PoolSnapshot {
            candidates: self.pool.list_candidates()?,
            missing: self.pool.list_missing()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::path::PathBuf;

    use pass_reclaim_core::MemoryPool;
    use pass_reclaim_vendor::VendorError;
    use serde_json::Value;

    use super::*;

    enum CannedSearch {
        Items(Vec<Value>),
        Fail(String),
    }

    #[derive(Default)]
    struct FakeDirectory {
        searches: HashMap<String, CannedSearch>,
        failing_update_ids: BTreeSet<String>,
        search_calls: RefCell<Vec<String>>,
        update_calls: RefCell<Vec<MemberUpdate>>,
    }

    impl FakeDirectory {
        fn with_hits(mut self, name: &str, items: Vec<Value>) -> Self {
            self.searches.insert(name.to_string(), CannedSearch::Items(items));
            self
        }

        fn with_failure(mut self, name: &str, detail: &str) -> Self {
            self.searches.insert(name.to_string(), CannedSearch::Fail(detail.to_string()));
            self
        }

        fn with_failing_update(mut self, id: &str) -> Self {
            self.failing_update_ids.insert(id.to_string());
            self
        }

        fn search_count(&self) -> usize {
            self.search_calls.borrow().len()
        }

        fn update_count(&self) -> usize {
            self.update_calls.borrow().len()
        }
    }

    impl MemberDirectory for FakeDirectory {
        fn search(&self, filter: &SearchFilter) -> Result<Vec<Value>, VendorError> {
            self.search_calls.borrow_mut().push(filter.name.clone());
            match self.searches.get(&filter.name) {
                Some(CannedSearch::Items(items)) => Ok(items.clone()),
                Some(CannedSearch::Fail(detail)) => {
                    Err(VendorError::Transport(detail.clone()))
                }
                None => Ok(Vec::new()),
            }
        }

        fn update(&self, update: &MemberUpdate) -> Result<Value, VendorError> {
            self.update_calls.borrow_mut().push(update.clone());
            if self.failing_update_ids.contains(update.id.as_str()) {
                return Err(VendorError::Http {
                    status: 500,
                    body: "vendor had a moment".to_string(),
                });
            }
            Ok(serde_json::json!({ "id": update.id.as_str() }))
        }
    }

    fn member_item(id: &str, name: &str, updated: &str) -> Value {
        serde_json::json!({
            "result": {
                "id": id,
                "person": { "displayName": name },
                "passStatus": "issued",
                "meta": {},
                "updated": updated
            }
        })
    }

    fn quick_defaults() -> ReclaimDefaults {
        ReclaimDefaults {
            search_throttle_ms: 0,
            update_throttle_ms: 0,
            ..ReclaimDefaults::default()
        }
    }

    fn session(directory: FakeDirectory) -> ReclaimSession<FakeDirectory, MemoryPool> {
        ReclaimSession::new(directory, MemoryPool::new(), quick_defaults())
    }

    #[test]
    fn duplicate_input_resolves_to_one_candidate_and_one_missing_name() {
        let directory = FakeDirectory::default().with_hits(
            "ALICE SMITH",
            vec![
                member_item("A1", "ALICE SMITH", "2024-01-01"),
                member_item("A2", "ALICE SMITH", "2024-06-01"),
            ],
        );
        let mut session = session(directory);

        let report = match session
            .run_search("ALICE SMITH\nALICE SMITH\nBOB JONES\n", &SearchOverrides::default())
        {
            Ok(report) => report,
            Err(err) => panic!("search failed: {err}"),
        };

        assert_eq!(report.names, vec!["ALICE SMITH".to_string(), "BOB JONES".to_string()]);
        assert_eq!(report.hits.len(), 2);
        assert_eq!(report.missing, vec!["BOB JONES".to_string()]);
        assert!(report.warnings.is_empty());
        assert_eq!(report.resolutions.len(), 1);
        assert_eq!(report.resolutions[0].keeper, MemberId::new("A2"));
        assert_eq!(report.candidates_added, 1);
        assert_eq!(report.pool_total, 1);
        assert_eq!(report.missing_total, 1);
        assert_eq!(session.state(), FlowState::PlanReady);
    }

    #[test]
    fn full_cycle_assigns_recycled_id_and_drains_pool() {
        let directory = FakeDirectory::default().with_hits(
            "ALICE SMITH",
            vec![
                member_item("A1", "ALICE SMITH", "2024-01-01"),
                member_item("A2", "ALICE SMITH", "2024-06-01"),
            ],
        );
        let mut session = session(directory);
        if let Err(err) =
            session.run_search("ALICE SMITH\nALICE SMITH\nBOB JONES\n", &SearchOverrides::default())
        {
            panic!("search failed: {err}");
        }

        let plan = match session.plan(None) {
            Ok(plan) => plan,
            Err(err) => panic!("plan failed: {err}"),
        };
        assert_eq!(plan.plan.len(), 1);
        assert_eq!(plan.plan.pairs[0].missing_name, "BOB JONES");
        assert_eq!(plan.plan.pairs[0].recycled_id, MemberId::new("A1"));
        assert!(!plan.low_confidence);

        let report = match session.execute(true, None, None) {
            Ok(report) => report,
            Err(err) => panic!("execute failed: {err}"),
        };
        assert_eq!(report.ok, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.pool_total, 0);
        assert_eq!(report.missing_total, 0);
        assert_eq!(session.state(), FlowState::ExecutionComplete);

        let updates = session.directory.update_calls.borrow();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].display_name, "BOB JONES");
        assert_eq!(updates[0].id, MemberId::new("A1"));
        assert!(updates[0].meta.contains_key("reclaim_lock"));
    }

    #[test]
    fn search_failure_routes_name_to_missing_with_warning() {
        let directory = FakeDirectory::default()
            .with_failure("CARA LIN", "connection refused")
            .with_hits("BOB JONES", vec![member_item("B1", "BOB JONES", "2024-01-01")]);
        let mut session = session(directory);

        let report = match session.run_search("CARA LIN\nBOB JONES\n", &SearchOverrides::default())
        {
            Ok(report) => report,
            Err(err) => panic!("batch must survive a per-name failure: {err}"),
        };

        assert_eq!(report.missing, vec!["CARA LIN".to_string()]);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].name, "CARA LIN");
        assert!(report.warnings[0].detail.contains("connection refused"));
        assert_eq!(report.hits.len(), 1);
        assert_eq!(session.directory.search_count(), 2);
    }

    #[test]
    fn planning_is_a_dry_run_and_never_calls_the_directory() {
        let directory = FakeDirectory::default().with_hits(
            "ALICE SMITH",
            vec![
                member_item("A1", "ALICE SMITH", "2024-01-01"),
                member_item("A2", "ALICE SMITH", "2024-06-01"),
            ],
        );
        let mut session = session(directory);
        if let Err(err) =
            session.run_search("ALICE SMITH\nBOB JONES\n", &SearchOverrides::default())
        {
            panic!("search failed: {err}");
        }
        let searches_after_batch = session.directory.search_count();

        if let Err(err) = session.plan(None) {
            panic!("plan failed: {err}");
        }
        assert_eq!(session.directory.search_count(), searches_after_batch);
        assert_eq!(session.directory.update_count(), 0);
    }

    #[test]
    fn execution_refuses_without_operator_acknowledgment() {
        let directory = FakeDirectory::default().with_hits(
            "ALICE SMITH",
            vec![
                member_item("A1", "ALICE SMITH", "2024-01-01"),
                member_item("A2", "ALICE SMITH", "2024-06-01"),
            ],
        );
        let mut session = session(directory);
        if let Err(err) =
            session.run_search("ALICE SMITH\nBOB JONES\n", &SearchOverrides::default())
        {
            panic!("search failed: {err}");
        }

        let err = match session.execute(false, None, None) {
            Ok(_) => panic!("unacknowledged execution must be refused"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("acknowledgment"));
        assert_eq!(session.directory.update_count(), 0);
    }

    #[test]
    fn partial_failure_keeps_exactly_the_failed_pairs_pooled() {
        let directory = FakeDirectory::default()
            .with_hits(
                "ALICE SMITH",
                vec![
                    member_item("A0", "ALICE SMITH", "2024-09-01"),
                    member_item("A1", "ALICE SMITH", "2024-01-01"),
                    member_item("A2", "ALICE SMITH", "2024-02-01"),
                    member_item("A3", "ALICE SMITH", "2024-03-01"),
                ],
            )
            .with_failing_update("A2");
        let mut session = session(directory);
        if let Err(err) = session.run_search(
            "ALICE SMITH\nBOB JONES\nDANA WU\nERIN COLE\n",
            &SearchOverrides::default(),
        ) {
            panic!("search failed: {err}");
        }

        let plan = match session.plan(None) {
            Ok(plan) => plan,
            Err(err) => panic!("plan failed: {err}"),
        };
        assert_eq!(plan.plan.len(), 3);
        // Descending by `updated`: A0 keeps, candidates pool as A3, A2, A1.
        assert_eq!(plan.plan.pairs[0].recycled_id, MemberId::new("A3"));
        assert_eq!(plan.plan.pairs[1].recycled_id, MemberId::new("A2"));

        let report = match session.execute(true, None, None) {
            Ok(report) => report,
            Err(err) => panic!("execute failed: {err}"),
        };
        assert_eq!(report.attempted, 3);
        assert_eq!(report.ok, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.results[1].status, ExecutionStatus::Failed);
        assert!(report.results[1].detail.as_deref().is_some_and(|detail| detail.contains("500")));

        let snapshot = match session.pool_snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => panic!("pool snapshot failed: {err}"),
        };
        let remaining_ids: Vec<&str> =
            snapshot.candidates.iter().map(|candidate| candidate.id.as_str()).collect();
        assert_eq!(remaining_ids, vec!["A2"]);
        assert_eq!(snapshot.missing, vec!["DANA WU".to_string()]);
    }

    #[test]
    fn hits_are_truncated_to_the_per_name_cap() {
        let items: Vec<Value> = (0..6)
            .map(|index| member_item(&format!("A{index}"), "ALICE SMITH", "2024-01-01"))
            .collect();
        let directory = FakeDirectory::default().with_hits("ALICE SMITH", items);
        let mut session = session(directory);

        let overrides =
            SearchOverrides { max_hits_per_name: Some(3), ..SearchOverrides::default() };
        let report = match session.run_search("ALICE SMITH\n", &overrides) {
            Ok(report) => report,
            Err(err) => panic!("search failed: {err}"),
        };
        assert_eq!(report.hits.len(), 3);
    }

    #[test]
    fn oversized_or_empty_batches_are_rejected() {
        let mut session = session(FakeDirectory::default());
        assert!(session.run_search("\n \n", &SearchOverrides::default()).is_err());
        assert_eq!(session.state(), FlowState::Idle);

        let mut defaults = quick_defaults();
        defaults.max_names = 2;
        let mut small =
            ReclaimSession::new(FakeDirectory::default(), MemoryPool::new(), defaults);
        assert!(small.run_search("A\nB\nC\n", &SearchOverrides::default()).is_err());
        assert_eq!(small.state(), FlowState::Idle);
    }

    #[test]
    fn low_confidence_groups_are_flagged_in_the_plan() {
        let directory = FakeDirectory::default().with_hits(
            "ALICE SMITH",
            vec![
                member_item("A1", "ALICE SMITH", "not a timestamp"),
                member_item("A2", "ALICE SMITH", "also opaque"),
            ],
        );
        let mut session = session(directory);
        if let Err(err) =
            session.run_search("ALICE SMITH\nBOB JONES\n", &SearchOverrides::default())
        {
            panic!("search failed: {err}");
        }

        let plan = match session.plan(None) {
            Ok(plan) => plan,
            Err(err) => panic!("plan failed: {err}"),
        };
        assert!(plan.low_confidence);
    }

    fn unique_temp_config(body: &str) -> PathBuf {
        let path = std::env::temp_dir()
            .join(format!("pass-reclaim-config-{}.yaml", ulid::Ulid::new()));
        if let Err(err) = fs::write(&path, body) {
            panic!("failed to write temp config: {err}");
        }
        path
    }

    #[test]
    fn config_loads_yaml_and_applies_defaults() {
        let path = unique_temp_config(
            "vendor:\n  base_url: https://passes.example.com/api\n  api_key: secret-key\n",
        );
        let config = match AppConfig::load(&path) {
            Ok(config) => config,
            Err(err) => panic!("config should load: {err}"),
        };
        assert_eq!(config.vendor.base_url, "https://passes.example.com/api");
        assert_eq!(config.vendor.timeout_secs, 30);
        assert_eq!(config.defaults.match_mode, MatchMode::Exact);
        assert!(config.defaults.enforce_lock_marker);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn config_without_credentials_is_fatal() {
        let path = unique_temp_config("vendor:\n  base_url: https://passes.example.com/api\n");
        let err = match AppConfig::load(&path) {
            Ok(_) => panic!("missing credential must be fatal"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("API key"));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn config_defaults_section_overrides_apply() {
        let path = unique_temp_config(
            "vendor:\n  base_url: https://passes.example.com/api\n  api_key: secret-key\n\
             defaults:\n  match_mode: substring\n  enforce_lock_marker: false\n  assign_limit: 5\n",
        );
        let config = match AppConfig::load(&path) {
            Ok(config) => config,
            Err(err) => panic!("config should load: {err}"),
        };
        assert_eq!(config.defaults.match_mode, MatchMode::Substring);
        assert!(!config.defaults.enforce_lock_marker);
        assert_eq!(config.defaults.assign_limit, 5);
        let _ = fs::remove_file(&path);
    }
}
