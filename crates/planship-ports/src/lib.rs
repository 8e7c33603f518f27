//! Port traits for the planship services.
//!
//! The backend SDK is split into three narrow traits mirroring the remote
//! API families this tool touches: work-item tracking, test-plan
//! structure, and test runs. The REST adapter lives in `planship-ado`;
//! tests substitute in-memory fakes.

use anyhow::Result;
use planship_schema::backend::{
    NewRelation, PlanSummary, PointSummary, RunCreate, SuiteSummary, WorkItemSnapshot,
};
use planship_schema::result::ResultRecord;
use std::path::Path;
use std::sync::Mutex;

pub mod logger;

pub use logger::{ConsoleLogger, Logger};

/// Work-item tracking: CRUD with patch-document semantics, relations, and
/// WIQL queries.
pub trait WorkItems {
    /// Fetches a work item. `Ok(None)` on 404 so lookup misses stay
    /// recoverable; transport failures are errors.
    fn get(&self, id: u32) -> Result<Option<WorkItemSnapshot>>;

    /// Fetches a work item with its relations expanded.
    fn get_with_relations(&self, id: u32) -> Result<Option<WorkItemSnapshot>>;

    /// Creates a work item of the given type with the given fields and
    /// relations, returning the backend's view of it.
    fn create(
        &self,
        work_item_type: &str,
        fields: &[(&str, String)],
        relations: &[NewRelation],
    ) -> Result<WorkItemSnapshot>;

    /// Patches fields on an existing work item.
    fn update_fields(&self, id: u32, fields: &[(&str, String)]) -> Result<WorkItemSnapshot>;

    /// Appends a history comment.
    fn add_comment(&self, id: u32, text: &str) -> Result<()>;

    /// Adds one relation.
    fn add_relation(&self, id: u32, relation: &NewRelation) -> Result<()>;

    /// Removes the relation at `index` (position in the item's relation
    /// list as last fetched).
    fn remove_relation(&self, id: u32, index: usize) -> Result<()>;

    /// Runs a flat WIQL query, returning matching work-item ids in
    /// backend order.
    fn query_ids(&self, wiql: &str) -> Result<Vec<u32>>;

    /// Runs a WIQL link query, returning the distinct source ids in
    /// backend order.
    fn query_link_sources(&self, wiql: &str) -> Result<Vec<u32>>;

    /// The canonical API URL of a work item, as used in relation targets.
    fn work_item_url(&self, id: u32) -> String;
}

/// Test-plan structure: plans, suites, suite membership, points.
pub trait TestPlans {
    fn list_plans(&self) -> Result<Vec<PlanSummary>>;
    fn create_plan(&self, name: &str) -> Result<PlanSummary>;
    fn list_suites(&self, plan_id: u32) -> Result<Vec<SuiteSummary>>;
    fn create_suite(&self, plan_id: u32, parent_suite_id: u32, name: &str)
    -> Result<SuiteSummary>;
    /// Ids of the test cases currently members of the suite.
    fn list_suite_case_ids(&self, plan_id: u32, suite_id: u32) -> Result<Vec<u32>>;
    /// Adds the given test cases to the suite in one batched call.
    fn add_cases_to_suite(&self, plan_id: u32, suite_id: u32, case_ids: &[u32]) -> Result<()>;
    fn list_points(&self, plan_id: u32, suite_id: u32) -> Result<Vec<PointSummary>>;
}

/// Test runs: container lifecycle, result submission, attachments.
pub trait TestRuns {
    /// Creates a run container. The id is optional because the backend
    /// payload allows it to be absent; the publisher treats that case as
    /// fatal.
    fn create_run(&self, run: &RunCreate) -> Result<Option<u32>>;

    /// Submits results in one batch, returning the backend-assigned
    /// result ids (one per accepted result).
    fn add_results(&self, run_id: u32, results: &[ResultRecord]) -> Result<Vec<u32>>;

    /// Moves the run to the terminal state, returning the state the
    /// backend echoes back.
    fn complete_run(&self, run_id: u32) -> Result<String>;

    /// Uploads a file as a run-level attachment.
    fn attach_run_file(&self, run_id: u32, path: &Path) -> Result<()>;

    /// Uploads a file as a result-level attachment.
    fn attach_result_file(&self, run_id: u32, result_id: u32, path: &Path) -> Result<()>;

    /// The human-facing URL of a run.
    fn run_url(&self, run_id: u32) -> String;
}

/// A log sink that captures lines for assertions in tests.
#[derive(Debug, Default)]
pub struct VecLogger {
    lines: Mutex<Vec<(logger::Level, String)>>,
}

impl VecLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(logger::Level, String)> {
        self.lines.lock().expect("logger poisoned").clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|(_, l)| l.contains(needle))
    }
}

impl Logger for VecLogger {
    fn log(&self, level: logger::Level, message: &str) {
        self.lines
            .lock()
            .expect("logger poisoned")
            .push((level, message.to_string()));
    }
}
