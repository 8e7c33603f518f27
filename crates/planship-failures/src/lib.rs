//! Failure-task reconciliation.
//!
//! A failing test either attaches to an existing open defect task or
//! files a new one; a passing test unlinks its task and closes it only
//! when no other failing test still points at it.
//!
//! Dedup key: the `ErrorHash:<hash>` tag, a fingerprint of the
//! whitespace-normalized error message. Failures without any error
//! message fall back to the older title-contains-test-case-id search, so
//! tasks created before hashing existed keep matching.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use planship_ports::{Logger, WorkItems};
use planship_sanitize::{escape_wiql, escape_xml, sanitize_for_csv};
use planship_schema::backend::{NewRelation, RelationKind, RunRef, fields};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Marker tag carried by every task this tool files.
pub const FAILURE_TAG: &str = "AutomatedTestFailure";

/// Tag prefix carrying the dedup fingerprint.
pub const ERROR_HASH_TAG_PREFIX: &str = "ErrorHash:";

const TITLE_MAX: usize = 255;
const TITLE_EXCERPT_MAX: usize = 100;
const COMMENT_ERROR_MAX: usize = 500;

/// One failing-test observation.
#[derive(Clone, Debug)]
pub struct FailureInfo {
    pub test_case_id: u32,
    pub test_name: String,
    pub error_message: Option<String>,
    pub build_number: String,
    pub run: RunRef,
    /// Artifact files referenced in the task description.
    pub attachments: Vec<PathBuf>,
}

pub struct FailureTaskReconciler<'a> {
    work_items: &'a dyn WorkItems,
    logger: &'a dyn Logger,
    project: String,
    defect_type: String,
}

impl<'a> FailureTaskReconciler<'a> {
    pub fn new(
        work_items: &'a dyn WorkItems,
        logger: &'a dyn Logger,
        project: &str,
        defect_type: &str,
    ) -> Self {
        Self {
            work_items,
            logger,
            project: project.to_string(),
            defect_type: defect_type.to_string(),
        }
    }

    /// Files or updates the defect task for a failing test.
    pub fn record_failure(&self, failure: &FailureInfo) -> Result<()> {
        let hash = failure
            .error_message
            .as_deref()
            .map(error_hash);

        let existing = match &hash {
            Some(h) => self.find_open_task_by_hash(h)?,
            // Only messageless failures use the legacy title search;
            // anything hashable must not re-match a legacy task for an
            // unrelated error.
            None => self.find_open_task_by_title(failure.test_case_id)?,
        };

        match existing {
            Some(task_id) => self.attach_to_existing(task_id, failure),
            None => self.create_task(failure, hash.as_deref()),
        }
    }

    fn find_open_task_by_hash(&self, hash: &str) -> Result<Option<u32>> {
        let tag = format!("{ERROR_HASH_TAG_PREFIX}{hash}");
        let wiql = format!(
            "SELECT [System.Id] FROM WorkItems \
             WHERE [System.TeamProject] = @project \
             AND [System.WorkItemType] = '{}' \
             AND [System.Tags] CONTAINS '{}' \
             AND [System.State] <> 'Closed' \
             ORDER BY [System.ChangedDate] DESC",
            escape_wiql(&self.defect_type),
            escape_wiql(&tag)
        );
        self.first_query_hit(&wiql)
    }

    fn find_open_task_by_title(&self, test_case_id: u32) -> Result<Option<u32>> {
        let wiql = format!(
            "SELECT [System.Id] FROM WorkItems \
             WHERE [System.TeamProject] = @project \
             AND [System.WorkItemType] = '{}' \
             AND [System.Title] CONTAINS '{test_case_id}' \
             AND [System.State] <> 'Closed' \
             ORDER BY [System.ChangedDate] DESC",
            escape_wiql(&self.defect_type)
        );
        self.first_query_hit(&wiql)
    }

    fn first_query_hit(&self, wiql: &str) -> Result<Option<u32>> {
        match self.work_items.query_ids(wiql) {
            Ok(ids) => Ok(ids.first().copied()),
            Err(e) => {
                // A failed lookup drives the create path instead of
                // aborting the whole reconciliation.
                self.logger
                    .warn(&format!("failure-task query failed: {e:#}"));
                Ok(None)
            }
        }
    }

    fn attach_to_existing(&self, task_id: u32, failure: &FailureInfo) -> Result<()> {
        self.logger.info(&format!(
            "task {task_id} already tracks this failure; updating it for test case {}",
            failure.test_case_id
        ));

        let relations = self
            .work_items
            .get_with_relations(task_id)?
            .map(|t| t.relations)
            .unwrap_or_default();
        let already_linked = relations.iter().any(|r| {
            matches!(r.kind, RelationKind::Related)
                && r.target_id() == Some(failure.test_case_id)
        });
        if !already_linked {
            let relation = NewRelation {
                kind: RelationKind::Related,
                url: self.work_items.work_item_url(failure.test_case_id),
                comment: Some("Linked from automated test failure.".to_string()),
            };
            if let Err(e) = self.work_items.add_relation(task_id, &relation) {
                self.logger.warn(&format!(
                    "failed to link test case {} to task {task_id}: {e:#}",
                    failure.test_case_id
                ));
            }
        }

        self.add_comment_best_effort(task_id, &occurrence_comment(failure));
        Ok(())
    }

    fn create_task(&self, failure: &FailureInfo, hash: Option<&str>) -> Result<()> {
        let title = task_title(failure, hash.is_some());

        let mut tags = FAILURE_TAG.to_string();
        if let Some(h) = hash {
            tags.push_str("; ");
            tags.push_str(ERROR_HASH_TAG_PREFIX);
            tags.push_str(h);
        }

        let relations = vec![
            NewRelation {
                kind: RelationKind::Related,
                url: self.work_items.work_item_url(failure.test_case_id),
                comment: Some("Linked from automated test failure.".to_string()),
            },
            NewRelation {
                kind: RelationKind::Hyperlink,
                url: failure.run.run_url.clone(),
                comment: Some(format!("Test Run {}", failure.run.run_id)),
            },
        ];

        let created = self
            .work_items
            .create(
                &self.defect_type,
                &[
                    (fields::TITLE, title),
                    (fields::AREA_PATH, self.project.clone()),
                    (fields::ITERATION_PATH, self.project.clone()),
                    (fields::DESCRIPTION, task_description(failure)),
                    (fields::TAGS, tags),
                ],
                &relations,
            )
            .with_context(|| format!("create failure task for \"{}\"", failure.test_name))?;

        self.logger.info(&format!(
            "created task {} for failed test \"{}\"",
            created.id, failure.test_name
        ));
        Ok(())
    }

    /// Reacts to a passing test: unlink its task and close the task when
    /// this was the last failing test pointing at it.
    pub fn resolve_success(&self, test_case_id: u32, build_number: &str) -> Result<()> {
        let wiql = format!(
            "SELECT [System.Id] FROM WorkItemLinks \
             WHERE ([Source].[System.TeamProject] = @project \
             AND [Source].[System.WorkItemType] = '{}' \
             AND [Source].[System.State] <> 'Closed') \
             AND ([System.Links.LinkType] = 'System.LinkTypes.Related') \
             AND ([Target].[System.Id] = {test_case_id}) \
             MODE (MustContain)",
            escape_wiql(&self.defect_type)
        );
        let sources = self
            .work_items
            .query_link_sources(&wiql)
            .context("query tasks linked to passed test case")?;
        let Some(task_id) = sources.first().copied() else {
            return Ok(());
        };

        let Some(task) = self.work_items.get_with_relations(task_id)? else {
            bail!("task {task_id} vanished between query and fetch");
        };

        let Some(relation_index) = task.relations.iter().position(|r| {
            matches!(r.kind, RelationKind::Related) && r.target_id() == Some(test_case_id)
        }) else {
            self.logger.warn(&format!(
                "task {task_id} has no related link to test case {test_case_id}; nothing to remove"
            ));
            return Ok(());
        };

        // How many failing tests still point at this task. The task must
        // stay open until the last of them has passed.
        let related_count = task
            .relations
            .iter()
            .filter(|r| matches!(r.kind, RelationKind::Related))
            .count();

        self.work_items
            .remove_relation(task_id, relation_index)
            .with_context(|| format!("remove relation from task {task_id}"))?;

        if related_count <= 1 {
            self.work_items
                .update_fields(task_id, &[(fields::STATE, "Closed".to_string())])
                .with_context(|| format!("close task {task_id}"))?;
            self.add_comment_best_effort(
                task_id,
                &format!(
                    "Auto-closed: test case {test_case_id} passed in build {build_number} \
                     and no other failing tests reference this task. ({})",
                    timestamp()
                ),
            );
            self.logger.info(&format!(
                "closed task {task_id}: test case {test_case_id} passed"
            ));
        } else {
            self.add_comment_best_effort(
                task_id,
                &format!(
                    "Test case {test_case_id} passed in build {build_number}; link removed. \
                     Task remains open for {} other linked test(s). ({})",
                    related_count - 1,
                    timestamp()
                ),
            );
            self.logger.info(&format!(
                "task {task_id}: removed link to test case {test_case_id}, task remains open"
            ));
        }
        Ok(())
    }

    fn add_comment_best_effort(&self, task_id: u32, comment: &str) {
        if let Err(e) = self.work_items.add_comment(task_id, comment) {
            self.logger
                .warn(&format!("failed to comment on task {task_id}: {e:#}"));
        }
    }
}

/// Fingerprint of a whitespace-normalized error message: first 16 hex
/// chars of its SHA-256.
pub fn error_hash(message: &str) -> String {
    let normalized = message.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

fn task_title(failure: &FailureInfo, hashed: bool) -> String {
    let title = if hashed {
        let excerpt: String = failure
            .error_message
            .as_deref()
            .unwrap_or_default()
            .lines()
            .next()
            .unwrap_or_default()
            .chars()
            .take(TITLE_EXCERPT_MAX)
            .collect();
        format!("[Auto] {}", sanitize_for_csv(excerpt.trim()))
    } else {
        format!(
            "[Auto] Investigate: {} (TC {})",
            sanitize_for_csv(&failure.test_name),
            failure.test_case_id
        )
    };
    title.chars().take(TITLE_MAX).collect()
}

fn task_description(failure: &FailureInfo) -> String {
    let mut html = format!(
        "<p>Test failed in build <b>{}</b></p>\n<p>Test Case ID: {}</p>",
        escape_xml(&failure.build_number),
        failure.test_case_id
    );
    match &failure.error_message {
        Some(msg) => html.push_str(&format!("\n<pre>{}</pre>", escape_xml(msg))),
        None => html.push_str("\n<p>No error message provided.</p>"),
    }
    if !failure.attachments.is_empty() {
        html.push_str("\n<p>Artifacts:</p>\n<ul>");
        for path in &failure.attachments {
            html.push_str(&format!(
                "\n<li>{}</li>",
                escape_xml(&path.display().to_string())
            ));
        }
        html.push_str("\n</ul>");
    }
    html
}

fn occurrence_comment(failure: &FailureInfo) -> String {
    let error_line = match &failure.error_message {
        Some(msg) => {
            let excerpt: String = msg.chars().take(COMMENT_ERROR_MAX).collect();
            format!("Error: {excerpt}")
        }
        None => "No error details.".to_string(),
    };
    format!(
        "Test failed in build {} ({})\n{}\nRun: {}",
        failure.build_number,
        timestamp(),
        error_line,
        failure.run.run_url
    )
}

fn timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
