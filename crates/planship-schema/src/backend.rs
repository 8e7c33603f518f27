//! Typed views of backend entities.
//!
//! The REST adapter validates loosely-typed payloads at the boundary and
//! hands these fully-typed records to the core services, so absent fields
//! are handled exactly once.

use serde::{Deserialize, Serialize};

/// Well-known work-item field paths.
pub mod fields {
    pub const TITLE: &str = "System.Title";
    pub const AREA_PATH: &str = "System.AreaPath";
    pub const ITERATION_PATH: &str = "System.IterationPath";
    pub const DESCRIPTION: &str = "System.Description";
    pub const TAGS: &str = "System.Tags";
    pub const STATE: &str = "System.State";
    pub const HISTORY: &str = "System.History";
    pub const STEPS: &str = "Microsoft.VSTS.TCM.Steps";
}

/// A durable test-case work item.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestCaseRef {
    pub id: u32,
    /// Authoritative revision from the backend, never computed locally.
    pub revision: u32,
    pub title: String,
}

/// Relationship kinds this tool creates or inspects.
///
/// Translated to the backend's `rel` string constants only inside the REST
/// adapter; core logic never sees the magic strings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelationKind {
    /// Requirement-to-test link ("Tests" seen from the test case).
    TestedBy,
    /// Plain related-work link.
    Related,
    /// External hyperlink (e.g. a run URL).
    Hyperlink,
    /// Anything else the backend reports; kept verbatim for round-trips.
    Other(String),
}

/// One typed, directional link on a work item.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItemRelation {
    pub kind: RelationKind,
    pub url: String,
    pub comment: Option<String>,
}

impl WorkItemRelation {
    /// The numeric id of the work item this relation points at, when the
    /// URL follows the `.../workItems/{id}` convention. Hyperlinks and
    /// attachment relations return `None`.
    pub fn target_id(&self) -> Option<u32> {
        self.url
            .rsplit('/')
            .next()
            .and_then(|last| last.parse::<u32>().ok())
    }
}

/// A relation to be added to a work item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewRelation {
    pub kind: RelationKind,
    pub url: String,
    pub comment: Option<String>,
}

/// A validated work-item snapshot as returned by the backend.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WorkItemSnapshot {
    pub id: u32,
    pub revision: u32,
    pub title: String,
    pub state: Option<String>,
    pub work_item_type: Option<String>,
    /// Tags, split on the backend's `"; "` separator.
    pub tags: Vec<String>,
    pub relations: Vec<WorkItemRelation>,
}

/// Resolved plan reference, valid for one sync run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanRef {
    pub plan_id: u32,
    pub root_suite_id: Option<u32>,
}

/// Resolved suite reference, valid for one sync run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuiteRef {
    pub suite_id: u32,
}

/// Ephemeral execution-slot id binding a test case to a suite and
/// configuration. Fetched fresh every run; never cached across runs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PointRef {
    pub point_id: u32,
}

/// A published run, with the human-facing URL used in failure tasks.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRef {
    pub run_id: u32,
    pub run_url: String,
}

/// Plan listing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanSummary {
    pub id: u32,
    pub name: String,
    pub root_suite_id: Option<u32>,
}

/// Suite listing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuiteSummary {
    pub id: u32,
    pub name: String,
    pub parent_suite_id: Option<u32>,
}

/// Point listing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PointSummary {
    pub id: u32,
    pub test_case_id: u32,
    pub test_case_title: Option<String>,
}

/// Parameters for creating a run container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunCreate {
    pub name: String,
    pub plan_id: u32,
    pub build_id: u32,
    pub point_ids: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_target_id_parses_work_item_urls() {
        let rel = WorkItemRelation {
            kind: RelationKind::Related,
            url: "https://dev.azure.com/org/proj/_apis/wit/workItems/4711".into(),
            comment: None,
        };
        assert_eq!(rel.target_id(), Some(4711));
    }

    #[test]
    fn relation_target_id_rejects_hyperlinks() {
        let rel = WorkItemRelation {
            kind: RelationKind::Hyperlink,
            url: "https://dev.azure.com/org/proj/_testManagement/runs?runId=5".into(),
            comment: None,
        };
        assert_eq!(rel.target_id(), None);
    }
}
