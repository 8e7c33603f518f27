//! Test-case identity resolution.
//!
//! Maps an automated test name (optionally carrying an embedded numeric
//! id) to a durable test-case work item, creating it when policy allows.
//! Two caches, one per resolver instance, live for exactly one sync run:
//! by-id and by-name (case-sensitive exact title). The per-result loop is
//! sequential, so later iterations observe earlier writes and a repeated
//! name cannot create twice within a batch.
//!
//! Resolution order: id hint, then (under the fallback policy) exact-title
//! search, then the name cache, then create-or-fail.

use anyhow::{Context, Result, bail};
use planship_ports::{Logger, WorkItems};
use planship_sanitize::{escape_wiql, sanitize_for_csv};
use planship_schema::backend::{NewRelation, RelationKind, TestCaseRef, fields};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

const TEST_CASE_TYPE: &str = "Test Case";

// Requirement-ish references embedded in test names: "Story_4242",
// "AB#123", "Bug 77". Longer alternatives first so "UserStory" is not
// eaten by "Story".
static REQUIREMENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:UserStory|Story|Requirement|Bug|Task|Feature|Epic|Issue|AB#?)[_\s]*(\d+)")
        .expect("static requirement pattern")
});

/// Policy slice the resolver acts on.
#[derive(Clone, Copy, Debug)]
pub struct ResolvePolicy {
    pub auto_create: bool,
    pub fallback_to_name_search: bool,
}

/// Resolves test names to durable test-case work items.
///
/// Owns the identity caches; construct one per sync run and drop it with
/// the run.
pub struct TestCaseResolver<'a> {
    work_items: &'a dyn WorkItems,
    logger: &'a dyn Logger,
    project: String,
    policy: ResolvePolicy,
    by_id: HashMap<u32, TestCaseRef>,
    by_name: HashMap<String, TestCaseRef>,
}

impl<'a> TestCaseResolver<'a> {
    pub fn new(
        work_items: &'a dyn WorkItems,
        logger: &'a dyn Logger,
        project: &str,
        policy: ResolvePolicy,
    ) -> Self {
        Self {
            work_items,
            logger,
            project: project.to_string(),
            policy,
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    /// Resolves `test_name` to a test case, creating one if permitted.
    ///
    /// `candidate_id` is a hint extracted from the test name (e.g. the
    /// `1056` in `UserLogin_TC1056`); a stale or invalid hint falls
    /// through to the other strategies instead of failing.
    pub fn resolve(&mut self, test_name: &str, candidate_id: Option<&str>) -> Result<TestCaseRef> {
        let resolved = self.resolve_inner(test_name, candidate_id)?;
        // Linking is best-effort; the resolution itself already succeeded.
        if let Err(e) = self.link_requirements_from_name(&resolved, test_name) {
            self.logger.warn(&format!(
                "failed to auto-link requirements for test case {}: {e:#}",
                resolved.id
            ));
        }
        Ok(resolved)
    }

    fn resolve_inner(&mut self, test_name: &str, candidate_id: Option<&str>) -> Result<TestCaseRef> {
        if let Some(found) = self.try_by_candidate_id(test_name, candidate_id)? {
            return Ok(found);
        }

        if self.policy.fallback_to_name_search {
            if let Some(found) = self.try_by_exact_title(test_name)? {
                return Ok(found);
            }
        }

        if let Some(cached) = self.by_name.get(test_name) {
            self.logger.info(&format!(
                "test case \"{test_name}\" already resolved this run (id {}); skipping creation",
                cached.id
            ));
            return Ok(cached.clone());
        }

        if !self.policy.auto_create {
            bail!(
                "no test case found for \"{test_name}\" and auto-create is disabled"
            );
        }
        self.create_test_case(test_name)
    }

    fn try_by_candidate_id(
        &mut self,
        test_name: &str,
        candidate_id: Option<&str>,
    ) -> Result<Option<TestCaseRef>> {
        let Some(raw) = candidate_id else {
            return Ok(None);
        };
        let Ok(id) = raw.trim().parse::<u32>() else {
            self.logger
                .warn(&format!("ignoring non-numeric test case id hint {raw:?}"));
            return Ok(None);
        };

        if let Some(cached) = self.by_id.get(&id) {
            self.logger
                .info(&format!("using existing test case {id} for \"{test_name}\""));
            return Ok(Some(cached.clone()));
        }

        match self.work_items.get(id)? {
            Some(item) => {
                let info = TestCaseRef {
                    id,
                    revision: item.revision,
                    title: if item.title.is_empty() {
                        test_name.to_string()
                    } else {
                        item.title
                    },
                };
                self.cache(test_name, &info);
                self.logger
                    .info(&format!("using existing test case {id} for \"{test_name}\""));
                Ok(Some(info))
            }
            None => {
                self.logger.warn(&format!(
                    "test case id {id} not found; falling back for \"{test_name}\""
                ));
                Ok(None)
            }
        }
    }

    fn try_by_exact_title(&mut self, test_name: &str) -> Result<Option<TestCaseRef>> {
        // A prior run may have persisted the formula-sanitized form of
        // this title; search for both spellings.
        let sanitized = sanitize_for_csv(test_name);
        let mut clause = format!("[System.Title] = '{}'", escape_wiql(test_name));
        if sanitized != test_name {
            clause.push_str(&format!(
                " OR [System.Title] = '{}'",
                escape_wiql(&sanitized)
            ));
        }
        let wiql = format!(
            "SELECT [System.Id] FROM WorkItems \
             WHERE [System.TeamProject] = @project \
             AND [System.WorkItemType] = '{TEST_CASE_TYPE}' \
             AND ({clause}) \
             ORDER BY [System.ChangedDate] DESC"
        );

        let ids = match self.work_items.query_ids(&wiql) {
            Ok(ids) => ids,
            Err(e) => {
                self.logger
                    .warn(&format!("title search failed for \"{test_name}\": {e:#}"));
                return Ok(None);
            }
        };
        // First match in backend order wins; no further disambiguation.
        let Some(id) = ids.first().copied() else {
            return Ok(None);
        };

        let Some(item) = self.work_items.get(id)? else {
            self.logger.warn(&format!(
                "title search returned test case {id} but it could not be fetched"
            ));
            return Ok(None);
        };

        let info = TestCaseRef {
            id,
            revision: item.revision,
            title: item.title,
        };
        self.cache(test_name, &info);
        self.logger.info(&format!(
            "found test case {id} by title for \"{test_name}\""
        ));
        Ok(Some(info))
    }

    fn create_test_case(&mut self, test_name: &str) -> Result<TestCaseRef> {
        let created = self
            .work_items
            .create(
                TEST_CASE_TYPE,
                &[
                    (fields::TITLE, sanitize_for_csv(test_name)),
                    (fields::AREA_PATH, self.project.clone()),
                    (fields::ITERATION_PATH, self.project.clone()),
                ],
                &[],
            )
            .with_context(|| format!("create test case for \"{test_name}\""))?;

        let info = TestCaseRef {
            id: created.id,
            revision: created.revision,
            title: test_name.to_string(),
        };
        self.cache(test_name, &info);
        self.logger.info(&format!(
            "created test case {} for \"{test_name}\"",
            created.id
        ));
        Ok(info)
    }

    fn cache(&mut self, test_name: &str, info: &TestCaseRef) {
        self.by_id.insert(info.id, info.clone());
        self.by_name.insert(test_name.to_string(), info.clone());
    }

    /// Extracts requirement references from the test name and links each
    /// one to the test case, skipping links that already exist.
    fn link_requirements_from_name(&self, test_case: &TestCaseRef, test_name: &str) -> Result<()> {
        self.link_requirements(test_case.id, &extract_requirement_ids(test_name))
    }

    /// Links the given requirement work items to a test case with
    /// tested-by relations, skipping links that already exist. Failures
    /// on individual requirements are logged, never fatal.
    pub fn link_requirements(&self, test_case_id: u32, requirement_ids: &[u32]) -> Result<()> {
        if requirement_ids.is_empty() {
            return Ok(());
        }

        let existing_urls: Vec<String> = self
            .work_items
            .get_with_relations(test_case_id)?
            .map(|item| item.relations.into_iter().map(|r| r.url).collect())
            .unwrap_or_default();

        for req_id in requirement_ids {
            if *req_id == test_case_id {
                continue;
            }
            if let Err(e) = self.link_one_requirement(test_case_id, *req_id, &existing_urls) {
                self.logger.warn(&format!(
                    "could not link test case {test_case_id} to requirement {req_id}: {e:#}"
                ));
            }
        }
        Ok(())
    }

    fn link_one_requirement(
        &self,
        test_case_id: u32,
        req_id: u32,
        existing_urls: &[String],
    ) -> Result<()> {
        let Some(_target) = self.work_items.get(req_id)? else {
            bail!("requirement {req_id} not found");
        };

        let url = self.work_items.work_item_url(req_id);
        if existing_urls.iter().any(|u| u == &url) {
            return Ok(());
        }

        self.work_items.add_relation(
            test_case_id,
            &NewRelation {
                kind: RelationKind::TestedBy,
                url,
                comment: Some("Linked from automated test sync.".to_string()),
            },
        )?;
        self.logger.info(&format!(
            "linked test case {test_case_id} to requirement {req_id}"
        ));
        Ok(())
    }
}

/// Unique requirement ids referenced by a test name, in order of first
/// appearance.
pub fn extract_requirement_ids(test_name: &str) -> Vec<u32> {
    let mut ids = Vec::new();
    for caps in REQUIREMENT_PATTERN.captures_iter(test_name) {
        if let Ok(id) = caps[1].parse::<u32>() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}
