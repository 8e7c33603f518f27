//! In-memory backend fake and fixture helpers.
//!
//! Implements the planship port traits over plain maps so service tests
//! can run the real logic without a network. The WIQL handling is a
//! deliberately small matcher: it understands the handful of clause
//! shapes this tool actually issues (type/title/tags/state filters and
//! link-target lookups), nothing more.
//!
//! Keeping this in a microcrate avoids copy-paste across the resolver,
//! plans, publisher, failure, and engine tests.

use anyhow::{Result, anyhow, bail};
use planship_ports::{TestPlans, TestRuns, WorkItems};
use planship_schema::backend::{
    NewRelation, PlanSummary, PointSummary, RelationKind, RunCreate, SuiteSummary,
    WorkItemRelation, WorkItemSnapshot, fields,
};
use planship_schema::result::ResultRecord;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const ORG_URL: &str = "https://dev.azure.com/acme";
pub const PROJECT: &str = "Webshop";

/// One stored work item.
#[derive(Clone, Debug)]
pub struct StoredWorkItem {
    pub id: u32,
    pub revision: u32,
    pub work_item_type: String,
    pub title: String,
    pub state: String,
    pub tags: Vec<String>,
    pub relations: Vec<WorkItemRelation>,
}

impl StoredWorkItem {
    fn snapshot(&self) -> WorkItemSnapshot {
        WorkItemSnapshot {
            id: self.id,
            revision: self.revision,
            title: self.title.clone(),
            state: Some(self.state.clone()),
            work_item_type: Some(self.work_item_type.clone()),
            tags: self.tags.clone(),
            relations: self.relations.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StoredRun {
    pub id: u32,
    pub name: String,
    pub plan_id: u32,
    pub build_id: u32,
    pub point_ids: Vec<u32>,
    pub state: String,
}

#[derive(Debug, Default)]
pub struct BackendState {
    next_id: u32,
    pub work_items: BTreeMap<u32, StoredWorkItem>,
    pub plans: Vec<PlanSummary>,
    pub suites: BTreeMap<u32, Vec<SuiteSummary>>,
    pub suite_members: BTreeMap<(u32, u32), Vec<u32>>,
    pub points: BTreeMap<(u32, u32), Vec<PointSummary>>,
    pub runs: Vec<StoredRun>,
    pub run_results: BTreeMap<u32, Vec<ResultRecord>>,
    pub run_attachments: Vec<(u32, PathBuf)>,
    pub result_attachments: Vec<(u32, u32, PathBuf)>,
    pub comments: Vec<(u32, String)>,
    /// Every batch passed to `add_cases_to_suite`, for idempotence checks.
    pub add_case_batches: Vec<Vec<u32>>,
    pub wiql_log: Vec<String>,
    // Failure-injection knobs.
    pub create_run_returns_no_id: bool,
    pub accept_zero_results: bool,
    pub complete_run_state: String,
    /// Mirror the real backend: adding cases to a suite materializes one
    /// point per case. Turn off to exercise the unplanned-result path.
    pub materialize_points: bool,
}

/// The fake backend. Clone-free: share by reference.
#[derive(Debug)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BackendState {
                next_id: 1000,
                complete_run_state: "Completed".to_string(),
                materialize_points: true,
                ..BackendState::default()
            }),
        }
    }

    pub fn with_state(mut f: impl FnMut(&mut BackendState)) -> Self {
        let backend = Self::new();
        f(&mut backend.state.lock().unwrap());
        backend
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.state.lock().unwrap()
    }

    /// Seeds a work item with explicit id and returns that id.
    pub fn seed_work_item(
        &self,
        id: u32,
        work_item_type: &str,
        title: &str,
        state: &str,
        tags: &[&str],
        relations: Vec<WorkItemRelation>,
    ) -> u32 {
        self.state().work_items.insert(
            id,
            StoredWorkItem {
                id,
                revision: 1,
                work_item_type: work_item_type.to_string(),
                title: title.to_string(),
                state: state.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                relations,
            },
        );
        id
    }

    pub fn seed_plan(&self, id: u32, name: &str, root_suite_id: u32) {
        let mut state = self.state();
        state.plans.push(PlanSummary {
            id,
            name: name.to_string(),
            root_suite_id: Some(root_suite_id),
        });
        state.suites.entry(id).or_default().push(SuiteSummary {
            id: root_suite_id,
            name: "Root Suite".to_string(),
            parent_suite_id: None,
        });
    }

    pub fn seed_point(&self, plan_id: u32, suite_id: u32, point_id: u32, case_id: u32) {
        self.state()
            .points
            .entry((plan_id, suite_id))
            .or_default()
            .push(PointSummary {
                id: point_id,
                test_case_id: case_id,
                test_case_title: None,
            });
    }

    pub fn related_link(target_id: u32) -> WorkItemRelation {
        WorkItemRelation {
            kind: RelationKind::Related,
            url: work_item_url(target_id),
            comment: None,
        }
    }
}

pub fn work_item_url(id: u32) -> String {
    format!("{ORG_URL}/{PROJECT}/_apis/wit/workItems/{id}")
}

// Pulls every single-quoted literal following `needle` out of a WIQL
// string, undoing the doubled-quote escape.
fn wiql_literals(wiql: &str, needle: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = wiql;
    while let Some(pos) = rest.find(needle) {
        rest = &rest[pos + needle.len()..];
        if let Some(start) = rest.find('\'') {
            let tail = &rest[start + 1..];
            let mut literal = String::new();
            let mut chars = tail.char_indices().peekable();
            while let Some((i, c)) = chars.next() {
                if c == '\'' {
                    if matches!(chars.peek(), Some((_, '\''))) {
                        literal.push('\'');
                        chars.next();
                    } else {
                        rest = &tail[i + 1..];
                        break;
                    }
                } else {
                    literal.push(c);
                }
            }
            out.push(literal);
        }
    }
    out
}

impl WorkItems for FakeBackend {
    fn get(&self, id: u32) -> Result<Option<WorkItemSnapshot>> {
        Ok(self.state().work_items.get(&id).map(|w| w.snapshot()))
    }

    fn get_with_relations(&self, id: u32) -> Result<Option<WorkItemSnapshot>> {
        self.get(id)
    }

    fn create(
        &self,
        work_item_type: &str,
        field_values: &[(&str, String)],
        relations: &[NewRelation],
    ) -> Result<WorkItemSnapshot> {
        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;

        let mut item = StoredWorkItem {
            id,
            revision: 1,
            work_item_type: work_item_type.to_string(),
            title: String::new(),
            state: "New".to_string(),
            tags: Vec::new(),
            relations: relations
                .iter()
                .map(|r| WorkItemRelation {
                    kind: r.kind.clone(),
                    url: r.url.clone(),
                    comment: r.comment.clone(),
                })
                .collect(),
        };
        apply_fields(&mut item, field_values);
        let snap = item.snapshot();
        state.work_items.insert(id, item);
        Ok(snap)
    }

    fn update_fields(&self, id: u32, field_values: &[(&str, String)]) -> Result<WorkItemSnapshot> {
        let mut state = self.state();
        // Comments travel as a History field write; record them the same
        // way the real backend does.
        for (path, value) in field_values {
            if *path == fields::HISTORY {
                state.comments.push((id, value.clone()));
            }
        }
        let item = state
            .work_items
            .get_mut(&id)
            .ok_or_else(|| anyhow!("work item {id} not found"))?;
        apply_fields(item, field_values);
        item.revision += 1;
        Ok(item.snapshot())
    }

    fn add_comment(&self, id: u32, text: &str) -> Result<()> {
        self.update_fields(id, &[(fields::HISTORY, text.to_string())])
            .map(|_| ())
    }

    fn add_relation(&self, id: u32, relation: &NewRelation) -> Result<()> {
        let mut state = self.state();
        let item = state
            .work_items
            .get_mut(&id)
            .ok_or_else(|| anyhow!("work item {id} not found"))?;
        item.relations.push(WorkItemRelation {
            kind: relation.kind.clone(),
            url: relation.url.clone(),
            comment: relation.comment.clone(),
        });
        item.revision += 1;
        Ok(())
    }

    fn remove_relation(&self, id: u32, index: usize) -> Result<()> {
        let mut state = self.state();
        let item = state
            .work_items
            .get_mut(&id)
            .ok_or_else(|| anyhow!("work item {id} not found"))?;
        if index >= item.relations.len() {
            bail!("relation index {index} out of range for work item {id}");
        }
        item.relations.remove(index);
        item.revision += 1;
        Ok(())
    }

    fn query_ids(&self, wiql: &str) -> Result<Vec<u32>> {
        let mut state = self.state();
        state.wiql_log.push(wiql.to_string());

        let type_filter = wiql_literals(wiql, "[System.WorkItemType] =")
            .into_iter()
            .next();
        let title_equals = wiql_literals(wiql, "[System.Title] =");
        let title_contains = wiql_literals(wiql, "[System.Title] CONTAINS");
        let tags_contains = wiql_literals(wiql, "[System.Tags] CONTAINS");
        let exclude_closed = wiql.contains("[System.State] <> 'Closed'");

        let mut ids = Vec::new();
        for item in state.work_items.values() {
            if let Some(t) = &type_filter {
                if &item.work_item_type != t {
                    continue;
                }
            }
            if exclude_closed && item.state == "Closed" {
                continue;
            }
            if !title_equals.is_empty() && !title_equals.iter().any(|t| &item.title == t) {
                continue;
            }
            if !title_contains.is_empty()
                && !title_contains.iter().any(|t| item.title.contains(t))
            {
                continue;
            }
            if !tags_contains.is_empty()
                && !tags_contains
                    .iter()
                    .any(|t| item.tags.iter().any(|tag| tag.contains(t)))
            {
                continue;
            }
            ids.push(item.id);
        }
        Ok(ids)
    }

    fn query_link_sources(&self, wiql: &str) -> Result<Vec<u32>> {
        let mut state = self.state();
        state.wiql_log.push(wiql.to_string());

        let target_id: Option<u32> = wiql
            .find("[Target].[System.Id] =")
            .map(|pos| &wiql[pos + "[Target].[System.Id] =".len()..])
            .and_then(|rest| {
                rest.trim_start()
                    .chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse()
                    .ok()
            });
        let Some(target_id) = target_id else {
            return Ok(Vec::new());
        };
        let exclude_closed = wiql.contains("[Source].[System.State] <> 'Closed'");

        let mut sources = Vec::new();
        for item in state.work_items.values() {
            if exclude_closed && item.state == "Closed" {
                continue;
            }
            let points_at_target = item.relations.iter().any(|r| {
                matches!(r.kind, RelationKind::Related) && r.target_id() == Some(target_id)
            });
            if points_at_target && !sources.contains(&item.id) {
                sources.push(item.id);
            }
        }
        Ok(sources)
    }

    fn work_item_url(&self, id: u32) -> String {
        work_item_url(id)
    }
}

fn apply_fields(item: &mut StoredWorkItem, field_values: &[(&str, String)]) {
    for (path, value) in field_values {
        match *path {
            fields::TITLE => item.title = value.clone(),
            fields::STATE => item.state = value.clone(),
            fields::TAGS => {
                item.tags = value
                    .split(';')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect();
            }
            _ => {}
        }
    }
}

impl TestPlans for FakeBackend {
    fn list_plans(&self) -> Result<Vec<PlanSummary>> {
        Ok(self.state().plans.clone())
    }

    fn create_plan(&self, name: &str) -> Result<PlanSummary> {
        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;
        let root_suite_id = id + 500_000;
        let plan = PlanSummary {
            id,
            name: name.to_string(),
            root_suite_id: Some(root_suite_id),
        };
        state.plans.push(plan.clone());
        state.suites.entry(id).or_default().push(SuiteSummary {
            id: root_suite_id,
            name: "Root Suite".to_string(),
            parent_suite_id: None,
        });
        Ok(plan)
    }

    fn list_suites(&self, plan_id: u32) -> Result<Vec<SuiteSummary>> {
        Ok(self.state().suites.get(&plan_id).cloned().unwrap_or_default())
    }

    fn create_suite(
        &self,
        plan_id: u32,
        parent_suite_id: u32,
        name: &str,
    ) -> Result<SuiteSummary> {
        let mut state = self.state();
        state.next_id += 1;
        let suite = SuiteSummary {
            id: state.next_id,
            name: name.to_string(),
            parent_suite_id: Some(parent_suite_id),
        };
        state.suites.entry(plan_id).or_default().push(suite.clone());
        Ok(suite)
    }

    fn list_suite_case_ids(&self, plan_id: u32, suite_id: u32) -> Result<Vec<u32>> {
        Ok(self
            .state()
            .suite_members
            .get(&(plan_id, suite_id))
            .cloned()
            .unwrap_or_default())
    }

    fn add_cases_to_suite(&self, plan_id: u32, suite_id: u32, case_ids: &[u32]) -> Result<()> {
        let mut state = self.state();
        state.add_case_batches.push(case_ids.to_vec());
        let mut added = Vec::new();
        {
            let members = state.suite_members.entry((plan_id, suite_id)).or_default();
            for id in case_ids {
                if !members.contains(id) {
                    members.push(*id);
                    added.push(*id);
                }
            }
        }
        if state.materialize_points {
            for case_id in added {
                state.next_id += 1;
                let point_id = state.next_id;
                state
                    .points
                    .entry((plan_id, suite_id))
                    .or_default()
                    .push(PointSummary {
                        id: point_id,
                        test_case_id: case_id,
                        test_case_title: None,
                    });
            }
        }
        Ok(())
    }

    fn list_points(&self, plan_id: u32, suite_id: u32) -> Result<Vec<PointSummary>> {
        Ok(self
            .state()
            .points
            .get(&(plan_id, suite_id))
            .cloned()
            .unwrap_or_default())
    }
}

impl TestRuns for FakeBackend {
    fn create_run(&self, run: &RunCreate) -> Result<Option<u32>> {
        let mut state = self.state();
        if state.create_run_returns_no_id {
            return Ok(None);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.runs.push(StoredRun {
            id,
            name: run.name.clone(),
            plan_id: run.plan_id,
            build_id: run.build_id,
            point_ids: run.point_ids.clone(),
            state: "InProgress".to_string(),
        });
        Ok(Some(id))
    }

    fn add_results(&self, run_id: u32, results: &[ResultRecord]) -> Result<Vec<u32>> {
        let mut state = self.state();
        if state.accept_zero_results {
            return Ok(Vec::new());
        }
        let base = 100_000 + state.run_results.len() as u32 * 1000;
        let ids: Vec<u32> = (0..results.len() as u32).map(|i| base + i).collect();
        state
            .run_results
            .entry(run_id)
            .or_default()
            .extend(results.iter().cloned());
        Ok(ids)
    }

    fn complete_run(&self, run_id: u32) -> Result<String> {
        let mut state = self.state();
        let echoed = state.complete_run_state.clone();
        if let Some(run) = state.runs.iter_mut().find(|r| r.id == run_id) {
            run.state = echoed.clone();
        }
        Ok(echoed)
    }

    fn attach_run_file(&self, run_id: u32, path: &Path) -> Result<()> {
        self.state().run_attachments.push((run_id, path.to_path_buf()));
        Ok(())
    }

    fn attach_result_file(&self, run_id: u32, result_id: u32, path: &Path) -> Result<()> {
        self.state()
            .result_attachments
            .push((run_id, result_id, path.to_path_buf()));
        Ok(())
    }

    fn run_url(&self, run_id: u32) -> String {
        format!("{ORG_URL}/{PROJECT}/_testManagement/runs?runId={run_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wiql_literals_undo_quote_doubling() {
        let wiql = "WHERE [System.Title] = 'O''Brien' AND [System.Title] = 'plain'";
        assert_eq!(
            wiql_literals(wiql, "[System.Title] ="),
            vec!["O'Brien", "plain"]
        );
    }

    #[test]
    fn query_ids_filters_on_type_title_and_state() {
        let backend = FakeBackend::new();
        backend.seed_work_item(1, "Test Case", "Login", "Design", &[], vec![]);
        backend.seed_work_item(2, "Task", "Login", "Closed", &[], vec![]);
        backend.seed_work_item(3, "Task", "Login", "New", &[], vec![]);

        let ids = backend
            .query_ids(
                "SELECT [System.Id] FROM WorkItems WHERE [System.WorkItemType] = 'Task' \
                 AND [System.Title] = 'Login' AND [System.State] <> 'Closed'",
            )
            .unwrap();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn link_sources_find_related_items() {
        let backend = FakeBackend::new();
        backend.seed_work_item(10, "Task", "investigate", "New", &[], vec![
            FakeBackend::related_link(77),
        ]);
        backend.seed_work_item(11, "Task", "closed one", "Closed", &[], vec![
            FakeBackend::related_link(77),
        ]);

        let sources = backend
            .query_link_sources(
                "SELECT [System.Id] FROM WorkItemLinks WHERE [Source].[System.State] <> 'Closed' \
                 AND [Target].[System.Id] = 77 MODE (MustContain)",
            )
            .unwrap();
        assert_eq!(sources, vec![10]);
    }
}
