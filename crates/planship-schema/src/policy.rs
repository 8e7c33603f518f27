use serde::{Deserialize, Serialize};

/// Global policy toggles for one sync run.
///
/// Loaded from the environment by the CLI and applied by the orchestrator;
/// the individual services only see the flags they act on.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Create missing test cases instead of failing resolution.
    pub auto_create_test_cases: bool,
    /// Try an exact-title search before creating a test case.
    pub fallback_to_name_search: bool,
    /// Create the plan unconditionally instead of requiring it to exist.
    pub auto_create_plan: bool,
    /// Create the suite under the plan root instead of requiring it.
    pub auto_create_suite: bool,
    /// File/update defect work items for failed tests.
    pub create_failure_tasks: bool,
    /// Unlink and possibly close defect work items for passed tests.
    pub auto_close_on_pass: bool,
    /// Work-item type used for failure tasks ("Task", "Bug", ...).
    pub defect_type: String,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            auto_create_test_cases: true,
            fallback_to_name_search: false,
            auto_create_plan: true,
            auto_create_suite: true,
            create_failure_tasks: true,
            auto_close_on_pass: false,
            defect_type: "Task".to_string(),
        }
    }
}

/// CI build identity attached to runs and failure-task comments.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildContext {
    pub build_id: u32,
    pub build_number: String,
}
