//! Azure DevOps REST adapter.
//!
//! Implements the planship port traits against the Azure DevOps REST API
//! (personal-access-token auth). Loosely-typed API payloads are validated
//! here and handed to the services as the typed records from
//! `planship-schema::backend`; relation kinds are translated to the API's
//! `rel` constants at this boundary and nowhere else.

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use planship_ports::{TestPlans, TestRuns, WorkItems};
use planship_schema::backend::{
    NewRelation, PlanSummary, PointSummary, RelationKind, RunCreate, SuiteSummary,
    WorkItemRelation, WorkItemSnapshot, fields,
};
use planship_schema::result::ResultRecord;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::path::Path;
use url::Url;

const API_VERSION: &str = "7.1";
const ATTACHMENT_API_VERSION: &str = "7.1-preview.1";

/// A connected Azure DevOps project client.
#[derive(Debug)]
pub struct AdoClient {
    org_url: String,
    project: String,
    token: String,
    http: Client,
}

impl AdoClient {
    pub fn new(org_url: &str, project: &str, token: &str) -> Result<Self> {
        if org_url.is_empty() || project.is_empty() || token.is_empty() {
            bail!("organization URL, project, and token are all required");
        }
        // Validate early so later URL building cannot fail.
        Url::parse(org_url).with_context(|| format!("invalid organization URL {org_url:?}"))?;

        let http = Client::builder()
            .user_agent(concat!("planship/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build reqwest client")?;

        Ok(Self {
            org_url: org_url.trim_end_matches('/').to_string(),
            project: project.to_string(),
            token: token.to_string(),
            http,
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{}/_apis/{}", self.org_url, self.project, path)
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str, params: &[(&str, &str)]) -> Result<T> {
        let resp = self
            .http
            .get(build_url(url, params)?)
            .basic_auth("", Some(&self.token))
            .header("Accept", "application/json")
            .send()
            .with_context(|| format!("GET {url}"))?;
        expect_json(resp, url)
    }

    /// Like `get_json`, but a 404 becomes `Ok(None)` so lookup misses stay
    /// recoverable.
    fn get_json_opt<T: DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<Option<T>> {
        let resp = self
            .http
            .get(build_url(url, params)?)
            .basic_auth("", Some(&self.token))
            .header("Accept", "application/json")
            .send()
            .with_context(|| format!("GET {url}"))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        expect_json(resp, url).map(Some)
    }

    fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        url: &str,
        params: &[(&str, &str)],
        body: &B,
    ) -> Result<T> {
        let resp = self
            .http
            .post(build_url(url, params)?)
            .basic_auth("", Some(&self.token))
            .json(body)
            .send()
            .with_context(|| format!("POST {url}"))?;
        expect_json(resp, url)
    }

    fn patch_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        url: &str,
        params: &[(&str, &str)],
        body: &B,
    ) -> Result<T> {
        let resp = self
            .http
            .patch(build_url(url, params)?)
            .basic_auth("", Some(&self.token))
            .json(body)
            .send()
            .with_context(|| format!("PATCH {url}"))?;
        expect_json(resp, url)
    }

    /// Work-item create/update use JSON-Patch documents with a dedicated
    /// content type.
    fn send_patch_document<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        document: &[serde_json::Value],
    ) -> Result<T> {
        let resp = self
            .http
            .request(method, build_url(url, &[("api-version", API_VERSION)])?)
            .basic_auth("", Some(&self.token))
            .header("Content-Type", "application/json-patch+json")
            .body(serde_json::to_vec(document).context("encode patch document")?)
            .send()
            .with_context(|| format!("PATCH-DOC {url}"))?;
        expect_json(resp, url)
    }
}

fn build_url(base: &str, params: &[(&str, &str)]) -> Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("parse url {base}"))?;
    if !params.is_empty() {
        let mut query = url.query_pairs_mut();
        for (k, v) in params {
            query.append_pair(k, v);
        }
    }
    Ok(url)
}

fn expect_json<T: DeserializeOwned>(resp: reqwest::blocking::Response, url: &str) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().unwrap_or_default();
        return Err(anyhow!("Azure DevOps API error {status} on {url}: {body}"));
    }
    resp.json::<T>()
        .with_context(|| format!("parse json from {url}"))
}

fn rel_to_api(kind: &RelationKind) -> &str {
    match kind {
        RelationKind::TestedBy => "Microsoft.VSTS.Common.TestedBy-Reverse",
        RelationKind::Related => "System.LinkTypes.Related",
        RelationKind::Hyperlink => "Hyperlink",
        RelationKind::Other(s) => s,
    }
}

fn rel_from_api(rel: &str) -> RelationKind {
    match rel {
        "Microsoft.VSTS.Common.TestedBy-Reverse" => RelationKind::TestedBy,
        "System.LinkTypes.Related" => RelationKind::Related,
        "Hyperlink" => RelationKind::Hyperlink,
        other => RelationKind::Other(other.to_string()),
    }
}

fn relation_value(relation: &NewRelation) -> serde_json::Value {
    let mut value = json!({
        "rel": rel_to_api(&relation.kind),
        "url": relation.url,
    });
    if let Some(comment) = &relation.comment {
        value["attributes"] = json!({ "comment": comment });
    }
    value
}

fn snapshot_from_api(item: api::WorkItem) -> WorkItemSnapshot {
    let get_field = |name: &str| -> Option<String> {
        item.fields
            .get(name)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };

    WorkItemSnapshot {
        id: item.id,
        revision: item.rev.unwrap_or(1),
        title: get_field(fields::TITLE).unwrap_or_default(),
        state: get_field(fields::STATE),
        work_item_type: get_field("System.WorkItemType"),
        tags: get_field(fields::TAGS)
            .map(|t| t.split(';').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default(),
        relations: item
            .relations
            .unwrap_or_default()
            .into_iter()
            .map(|r| WorkItemRelation {
                kind: rel_from_api(&r.rel),
                url: r.url,
                comment: r.attributes.and_then(|a| a.comment),
            })
            .collect(),
    }
}

impl WorkItems for AdoClient {
    fn get(&self, id: u32) -> Result<Option<WorkItemSnapshot>> {
        let url = self.api_url(&format!("wit/workitems/{id}"));
        let item: Option<api::WorkItem> =
            self.get_json_opt(&url, &[("api-version", API_VERSION)])?;
        Ok(item.map(snapshot_from_api))
    }

    fn get_with_relations(&self, id: u32) -> Result<Option<WorkItemSnapshot>> {
        let url = self.api_url(&format!("wit/workitems/{id}"));
        let item: Option<api::WorkItem> = self.get_json_opt(
            &url,
            &[("api-version", API_VERSION), ("$expand", "relations")],
        )?;
        Ok(item.map(snapshot_from_api))
    }

    fn create(
        &self,
        work_item_type: &str,
        fields: &[(&str, String)],
        relations: &[NewRelation],
    ) -> Result<WorkItemSnapshot> {
        let mut document = Vec::new();
        for (path, value) in fields {
            document.push(json!({
                "op": "add",
                "path": format!("/fields/{path}"),
                "value": value,
            }));
        }
        for relation in relations {
            document.push(json!({
                "op": "add",
                "path": "/relations/-",
                "value": relation_value(relation),
            }));
        }

        let url = self.api_url(&format!("wit/workitems/${work_item_type}"));
        let item: api::WorkItem =
            self.send_patch_document(reqwest::Method::POST, &url, &document)?;
        Ok(snapshot_from_api(item))
    }

    fn update_fields(&self, id: u32, fields: &[(&str, String)]) -> Result<WorkItemSnapshot> {
        let document: Vec<serde_json::Value> = fields
            .iter()
            .map(|(path, value)| {
                json!({
                    "op": "add",
                    "path": format!("/fields/{path}"),
                    "value": value,
                })
            })
            .collect();

        let url = self.api_url(&format!("wit/workitems/{id}"));
        let item: api::WorkItem =
            self.send_patch_document(reqwest::Method::PATCH, &url, &document)?;
        Ok(snapshot_from_api(item))
    }

    fn add_comment(&self, id: u32, text: &str) -> Result<()> {
        self.update_fields(id, &[(fields::HISTORY, text.to_string())])
            .map(|_| ())
    }

    fn add_relation(&self, id: u32, relation: &NewRelation) -> Result<()> {
        let document = vec![json!({
            "op": "add",
            "path": "/relations/-",
            "value": relation_value(relation),
        })];
        let url = self.api_url(&format!("wit/workitems/{id}"));
        let _: api::WorkItem = self.send_patch_document(reqwest::Method::PATCH, &url, &document)?;
        Ok(())
    }

    fn remove_relation(&self, id: u32, index: usize) -> Result<()> {
        let document = vec![json!({
            "op": "remove",
            "path": format!("/relations/{index}"),
        })];
        let url = self.api_url(&format!("wit/workitems/{id}"));
        let _: api::WorkItem = self.send_patch_document(reqwest::Method::PATCH, &url, &document)?;
        Ok(())
    }

    fn query_ids(&self, wiql: &str) -> Result<Vec<u32>> {
        let url = self.api_url("wit/wiql");
        let result: api::WiqlResult = self.post_json(
            &url,
            &[("api-version", API_VERSION)],
            &json!({ "query": wiql }),
        )?;
        Ok(result
            .work_items
            .unwrap_or_default()
            .into_iter()
            .map(|w| w.id)
            .collect())
    }

    fn query_link_sources(&self, wiql: &str) -> Result<Vec<u32>> {
        let url = self.api_url("wit/wiql");
        let result: api::WiqlResult = self.post_json(
            &url,
            &[("api-version", API_VERSION)],
            &json!({ "query": wiql }),
        )?;
        let mut sources = Vec::new();
        for link in result.work_item_relations.unwrap_or_default() {
            if let Some(source) = link.source {
                if !sources.contains(&source.id) {
                    sources.push(source.id);
                }
            }
        }
        Ok(sources)
    }

    fn work_item_url(&self, id: u32) -> String {
        self.api_url(&format!("wit/workItems/{id}"))
    }
}

impl TestPlans for AdoClient {
    fn list_plans(&self) -> Result<Vec<PlanSummary>> {
        let url = self.api_url("testplan/plans");
        let list: api::List<api::TestPlan> =
            self.get_json(&url, &[("api-version", API_VERSION)])?;
        Ok(list
            .value
            .into_iter()
            .map(|p| PlanSummary {
                id: p.id,
                name: p.name,
                root_suite_id: p.root_suite.map(|s| s.id),
            })
            .collect())
    }

    fn create_plan(&self, name: &str) -> Result<PlanSummary> {
        let url = self.api_url("testplan/plans");
        let plan: api::TestPlan = self.post_json(
            &url,
            &[("api-version", API_VERSION)],
            &json!({
                "name": name,
                "areaPath": self.project,
                "iteration": self.project,
            }),
        )?;
        Ok(PlanSummary {
            id: plan.id,
            name: plan.name,
            root_suite_id: plan.root_suite.map(|s| s.id),
        })
    }

    fn list_suites(&self, plan_id: u32) -> Result<Vec<SuiteSummary>> {
        let url = self.api_url(&format!("testplan/Plans/{plan_id}/suites"));
        let list: api::List<api::TestSuite> =
            self.get_json(&url, &[("api-version", API_VERSION)])?;
        Ok(list
            .value
            .into_iter()
            .map(|s| SuiteSummary {
                id: s.id,
                name: s.name,
                parent_suite_id: s.parent_suite.map(|p| p.id),
            })
            .collect())
    }

    fn create_suite(
        &self,
        plan_id: u32,
        parent_suite_id: u32,
        name: &str,
    ) -> Result<SuiteSummary> {
        let url = self.api_url(&format!("testplan/Plans/{plan_id}/suites"));
        let suite: api::TestSuite = self.post_json(
            &url,
            &[("api-version", API_VERSION)],
            &json!({
                "suiteType": "staticTestSuite",
                "name": name,
                "parentSuite": { "id": parent_suite_id },
            }),
        )?;
        Ok(SuiteSummary {
            id: suite.id,
            name: suite.name,
            parent_suite_id: suite.parent_suite.map(|p| p.id),
        })
    }

    fn list_suite_case_ids(&self, plan_id: u32, suite_id: u32) -> Result<Vec<u32>> {
        let url = self.api_url(&format!("test/Plans/{plan_id}/suites/{suite_id}/testcases"));
        let list: api::List<api::SuiteTestCase> =
            self.get_json(&url, &[("api-version", API_VERSION)])?;
        Ok(list
            .value
            .into_iter()
            .filter_map(|c| c.test_case.and_then(|tc| tc.id.parse::<u32>().ok()))
            .collect())
    }

    fn add_cases_to_suite(&self, plan_id: u32, suite_id: u32, case_ids: &[u32]) -> Result<()> {
        if case_ids.is_empty() {
            return Ok(());
        }
        let ids_csv = case_ids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let url = self.api_url(&format!(
            "test/Plans/{plan_id}/suites/{suite_id}/testcases/{ids_csv}"
        ));
        let _: api::List<api::SuiteTestCase> = self.post_json(
            &url,
            &[("api-version", API_VERSION)],
            &serde_json::Value::Null,
        )?;
        Ok(())
    }

    fn list_points(&self, plan_id: u32, suite_id: u32) -> Result<Vec<PointSummary>> {
        let url = self.api_url(&format!(
            "testplan/Plans/{plan_id}/Suites/{suite_id}/TestPoint"
        ));
        let list: api::List<api::TestPoint> =
            self.get_json(&url, &[("api-version", API_VERSION)])?;
        Ok(list
            .value
            .into_iter()
            .filter_map(|p| {
                p.test_case_reference.map(|tc| PointSummary {
                    id: p.id,
                    test_case_id: tc.id,
                    test_case_title: tc.name,
                })
            })
            .collect())
    }
}

impl TestRuns for AdoClient {
    fn create_run(&self, run: &RunCreate) -> Result<Option<u32>> {
        let url = self.api_url("test/runs");
        let created: api::TestRun = self.post_json(
            &url,
            &[("api-version", API_VERSION)],
            &json!({
                "name": run.name,
                "plan": { "id": run.plan_id.to_string() },
                "pointIds": run.point_ids,
                "build": { "id": run.build_id.to_string() },
                "automated": true,
                "configurationIds": [],
            }),
        )?;
        Ok(created.id)
    }

    fn add_results(&self, run_id: u32, results: &[ResultRecord]) -> Result<Vec<u32>> {
        let payload: Vec<serde_json::Value> = results.iter().map(result_to_api).collect();
        let url = self.api_url(&format!("test/Runs/{run_id}/results"));
        let list: api::List<api::TestResult> =
            self.post_json(&url, &[("api-version", API_VERSION)], &payload)?;
        Ok(list.value.into_iter().map(|r| r.id).collect())
    }

    fn complete_run(&self, run_id: u32) -> Result<String> {
        let url = self.api_url(&format!("test/Runs/{run_id}"));
        let updated: api::TestRun = self.patch_json(
            &url,
            &[("api-version", API_VERSION)],
            &json!({ "state": "Completed" }),
        )?;
        Ok(updated.state.unwrap_or_default())
    }

    fn attach_run_file(&self, run_id: u32, path: &Path) -> Result<()> {
        let url = self.api_url(&format!("test/Runs/{run_id}/attachments"));
        let _: api::Attachment = self.post_json(
            &url,
            &[("api-version", ATTACHMENT_API_VERSION)],
            &attachment_body(path)?,
        )?;
        Ok(())
    }

    fn attach_result_file(&self, run_id: u32, result_id: u32, path: &Path) -> Result<()> {
        let url = self.api_url(&format!(
            "test/Runs/{run_id}/Results/{result_id}/attachments"
        ));
        let _: api::Attachment = self.post_json(
            &url,
            &[("api-version", ATTACHMENT_API_VERSION)],
            &attachment_body(path)?,
        )?;
        Ok(())
    }

    fn run_url(&self, run_id: u32) -> String {
        format!(
            "{}/{}/_testManagement/runs?runId={run_id}",
            self.org_url, self.project
        )
    }
}

fn result_to_api(record: &ResultRecord) -> serde_json::Value {
    let mut value = json!({
        "testCaseTitle": record.title,
        "automatedTestName": record.automated_test_name,
        "durationInMs": record.duration_ms,
        "outcome": record.outcome.as_str(),
        "state": "Completed",
        "testCase": { "id": record.test_case.id.to_string() },
        "testCaseRevision": record.test_case.revision,
    });
    if let Some(err) = &record.error_message {
        value["errorMessage"] = json!(err);
    }
    if let Some(point) = &record.point {
        value["testPoint"] = json!({ "id": point.point_id.to_string() });
    }
    value
}

fn attachment_body(path: &Path) -> Result<serde_json::Value> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read attachment {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("attachment.bin");
    Ok(json!({
        "attachmentType": "GeneralAttachment",
        "fileName": file_name,
        "stream": BASE64.encode(bytes),
    }))
}

// Azure DevOps API types. Only the fields this tool reads are declared;
// everything else is ignored on deserialization.
mod api {
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Deserialize)]
    pub struct List<T> {
        #[serde(default = "Vec::new")]
        pub value: Vec<T>,
    }

    #[derive(Debug, Deserialize)]
    pub struct WorkItem {
        pub id: u32,
        pub rev: Option<u32>,
        #[serde(default)]
        pub fields: BTreeMap<String, serde_json::Value>,
        pub relations: Option<Vec<Relation>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Relation {
        pub rel: String,
        pub url: String,
        pub attributes: Option<RelationAttributes>,
    }

    #[derive(Debug, Deserialize)]
    pub struct RelationAttributes {
        pub comment: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct WiqlResult {
        pub work_items: Option<Vec<WiqlWorkItem>>,
        pub work_item_relations: Option<Vec<WiqlLink>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct WiqlWorkItem {
        pub id: u32,
    }

    #[derive(Debug, Deserialize)]
    pub struct WiqlLink {
        pub source: Option<WiqlWorkItem>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct TestPlan {
        pub id: u32,
        pub name: String,
        pub root_suite: Option<SuiteRef>,
    }

    #[derive(Debug, Deserialize)]
    pub struct SuiteRef {
        pub id: u32,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct TestSuite {
        pub id: u32,
        pub name: String,
        pub parent_suite: Option<SuiteRef>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct SuiteTestCase {
        pub test_case: Option<StringIdRef>,
    }

    #[derive(Debug, Deserialize)]
    pub struct StringIdRef {
        pub id: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct TestPoint {
        pub id: u32,
        pub test_case_reference: Option<TestCaseReference>,
    }

    #[derive(Debug, Deserialize)]
    pub struct TestCaseReference {
        pub id: u32,
        pub name: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct TestRun {
        pub id: Option<u32>,
        pub state: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct TestResult {
        pub id: u32,
    }

    #[derive(Debug, Deserialize)]
    pub struct Attachment {
        #[allow(dead_code)]
        pub url: Option<String>,
    }
}
