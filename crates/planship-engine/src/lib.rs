//! Pipeline orchestrator.
//!
//! Sequences the planship services for the two flows:
//!
//! - `publish_results`: parse JUnit → resolve identities → ensure
//!   plan/suite → link cases → map points → publish run → reconcile
//!   failure tasks → auto-close for passes.
//! - `sync_features`: parse feature files → push step/tag/description
//!   metadata into existing test cases → link tagged requirements.
//!
//! Per-result processing is strictly sequential; the resolver caches are
//! read and written inside the loop, and later iterations must observe
//! earlier writes so a repeated name never creates twice in one batch.

use anyhow::{Context, Result};
use planship_failures::{FailureInfo, FailureTaskReconciler};
use planship_gherkin::parse_features;
use planship_junit::parse_junit;
use planship_plans::{PlanManager, PlanPolicy};
use planship_ports::{Logger, TestPlans, TestRuns, WorkItems};
use planship_publish::RunPublisher;
use planship_resolve::{ResolvePolicy, TestCaseResolver, extract_requirement_ids};
use planship_sanitize::sanitize_for_csv;
use planship_schema::backend::{RunRef, fields};
use planship_schema::policy::{BuildContext, SyncPolicy};
use planship_schema::result::{Outcome, ParsedTestCase, ResultRecord};
use planship_schema::scenario::ParsedScenario;
use planship_steps::{convert_steps, render_description_html, render_steps_xml};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

// Embedded test-case id in an automated test name: "UserLogin_TC1056".
static CASE_ID_HINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)TC_?(\d+)").expect("static id-hint pattern"));

/// Inputs for one result-publishing run.
#[derive(Clone, Debug)]
pub struct PublishOptions {
    pub results_file: PathBuf,
    pub plan_name: String,
    pub suite_name: String,
    /// Upload the result file itself as a run attachment.
    pub attach_results: bool,
    /// Directory holding per-test artifact files.
    pub artifacts_dir: Option<PathBuf>,
    /// Filename pattern with a `{testName}` placeholder.
    pub artifact_pattern: String,
}

/// What one publishing run did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub parsed: usize,
    pub published: usize,
    pub unplanned: usize,
    pub failure_tasks_processed: usize,
    pub pass_resolutions: usize,
    pub run: Option<RunRef>,
}

/// What one feature-sync run did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeatureSyncSummary {
    pub scenarios: usize,
    pub updated: usize,
    pub skipped: usize,
}

pub struct Engine<'a> {
    work_items: &'a dyn WorkItems,
    test_plans: &'a dyn TestPlans,
    test_runs: &'a dyn TestRuns,
    logger: &'a dyn Logger,
    project: String,
    policy: SyncPolicy,
    build: BuildContext,
}

struct PendingFailure {
    test_case_id: u32,
    test_name: String,
    error_message: Option<String>,
    attachments: Vec<PathBuf>,
}

impl<'a> Engine<'a> {
    pub fn new(
        work_items: &'a dyn WorkItems,
        test_plans: &'a dyn TestPlans,
        test_runs: &'a dyn TestRuns,
        logger: &'a dyn Logger,
        project: &str,
        policy: SyncPolicy,
        build: BuildContext,
    ) -> Self {
        Self {
            work_items,
            test_plans,
            test_runs,
            logger,
            project: project.to_string(),
            policy,
            build,
        }
    }

    /// Runs the full result-publishing pipeline.
    pub fn publish_results(&self, options: &PublishOptions) -> Result<PublishSummary> {
        let mut summary = PublishSummary::default();

        let parsed = parse_junit(&options.results_file)?;
        summary.parsed = parsed.len();
        if parsed.is_empty() {
            self.logger.info("no test cases found in the result file");
            return Ok(summary);
        }
        self.logger
            .info(&format!("parsed {} test case(s)", parsed.len()));

        let plan_manager = PlanManager::new(
            self.test_plans,
            self.logger,
            PlanPolicy {
                auto_create_plan: self.policy.auto_create_plan,
                auto_create_suite: self.policy.auto_create_suite,
            },
        );
        let plan = plan_manager.ensure_plan(&options.plan_name)?;
        let suite = plan_manager.ensure_suite(plan, &options.suite_name)?;

        let allowed_root = match &options.artifacts_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("determine working directory")?,
        };

        let mut resolver = TestCaseResolver::new(
            self.work_items,
            self.logger,
            &self.project,
            ResolvePolicy {
                auto_create: self.policy.auto_create_test_cases,
                fallback_to_name_search: self.policy.fallback_to_name_search,
            },
        );

        let mut records: Vec<ResultRecord> = Vec::new();
        let mut case_ids: Vec<u32> = Vec::new();
        let mut passed_case_ids: Vec<u32> = Vec::new();
        let mut failures: Vec<PendingFailure> = Vec::new();

        for case in &parsed {
            let hint = extract_case_id_hint(&case.name);
            let resolved = resolver.resolve(&case.name, hint.as_deref())?;
            let attachments = self.collect_artifacts(case, options, &allowed_root);

            case_ids.push(resolved.id);
            match case.outcome {
                Outcome::Failed => failures.push(PendingFailure {
                    test_case_id: resolved.id,
                    test_name: case.name.clone(),
                    error_message: case.error_message.clone(),
                    attachments: attachments.clone(),
                }),
                Outcome::Passed => passed_case_ids.push(resolved.id),
            }

            records.push(ResultRecord {
                title: case.name.clone(),
                automated_test_name: case.name.clone(),
                duration_ms: case.duration_ms,
                outcome: case.outcome,
                error_message: case.error_message.clone(),
                test_case: resolved,
                point: None,
                local_attachments: attachments,
            });
        }

        plan_manager.link_test_cases_to_suite(plan, suite, &case_ids)?;
        let point_ids = plan_manager.map_points_to_results(plan, suite, &mut records)?;
        self.logger
            .info(&format!("mapped {} test point(s)", point_ids.len()));

        // Unplanned results never reach the backend; they would land in a
        // meaningless bucket there.
        let (publishable, unplanned): (Vec<ResultRecord>, Vec<ResultRecord>) =
            records.into_iter().partition(ResultRecord::is_publishable);
        summary.unplanned = unplanned.len();
        for record in &unplanned {
            self.logger.warn(&format!(
                "excluding result for \"{}\": no test point",
                record.title
            ));
        }
        if publishable.is_empty() {
            self.logger
                .warn("no results had mapped test points; run will not be published");
            return Ok(summary);
        }

        let publisher = RunPublisher::new(self.test_runs, self.logger, &allowed_root);
        let run = publisher.create_run_and_publish(
            plan,
            &options.suite_name,
            &self.build,
            &publishable,
            point_ids,
            options.attach_results.then_some(options.results_file.as_path()),
        )?;
        summary.published = publishable.len();
        summary.run = Some(run.clone());

        if self.policy.create_failure_tasks {
            let reconciler = FailureTaskReconciler::new(
                self.work_items,
                self.logger,
                &self.project,
                &self.policy.defect_type,
            );
            for failure in &failures {
                let info = FailureInfo {
                    test_case_id: failure.test_case_id,
                    test_name: failure.test_name.clone(),
                    error_message: failure.error_message.clone(),
                    build_number: self.build.build_number.clone(),
                    run: run.clone(),
                    attachments: failure.attachments.clone(),
                };
                // One broken task must not stop the rest of the batch.
                if let Err(e) = reconciler.record_failure(&info) {
                    self.logger.error(&format!(
                        "failed to reconcile failure task for \"{}\": {e:#}",
                        failure.test_name
                    ));
                }
                summary.failure_tasks_processed += 1;
            }
        } else {
            self.logger.info("failure task creation is disabled");
        }

        if self.policy.auto_close_on_pass {
            let reconciler = FailureTaskReconciler::new(
                self.work_items,
                self.logger,
                &self.project,
                &self.policy.defect_type,
            );
            for case_id in &passed_case_ids {
                if let Err(e) = reconciler.resolve_success(*case_id, &self.build.build_number) {
                    self.logger.error(&format!(
                        "failed to resolve task for passed test case {case_id}: {e:#}"
                    ));
                }
                summary.pass_resolutions += 1;
            }
        }

        Ok(summary)
    }

    fn collect_artifacts(
        &self,
        case: &ParsedTestCase,
        options: &PublishOptions,
        allowed_root: &Path,
    ) -> Vec<PathBuf> {
        let mut out = Vec::new();

        for marker in &case.attachments {
            let path = PathBuf::from(marker);
            if path.is_absolute() {
                out.push(path);
            } else {
                out.push(allowed_root.join(path));
            }
        }

        if let Some(dir) = &options.artifacts_dir {
            let file_name = options.artifact_pattern.replace("{testName}", &case.name);
            let candidate = dir.join(file_name);
            if candidate.is_file() && !out.contains(&candidate) {
                out.push(candidate);
            }
        }

        out
    }

    /// Runs the feature-metadata sync pipeline over a feature-file glob.
    pub fn sync_features(&self, pattern: &str) -> Result<FeatureSyncSummary> {
        let scenarios = parse_features(pattern, self.logger)?;
        let mut summary = FeatureSyncSummary {
            scenarios: scenarios.len(),
            ..FeatureSyncSummary::default()
        };

        let resolver = TestCaseResolver::new(
            self.work_items,
            self.logger,
            &self.project,
            ResolvePolicy {
                auto_create: false,
                fallback_to_name_search: false,
            },
        );

        for scenario in &scenarios {
            let Some(tc_id) = scenario.tc_id else {
                self.logger.warn(&format!(
                    "scenario \"{}\" has no TC tag; skipping",
                    scenario.name
                ));
                summary.skipped += 1;
                continue;
            };

            match self.sync_one_scenario(scenario, tc_id, &resolver) {
                Ok(true) => summary.updated += 1,
                Ok(false) => summary.skipped += 1,
                Err(e) => {
                    summary.skipped += 1;
                    self.logger.error(&format!(
                        "failed to update test case {tc_id} for scenario \"{}\": {e:#}",
                        scenario.name
                    ));
                }
            }
        }

        Ok(summary)
    }

    fn sync_one_scenario(
        &self,
        scenario: &ParsedScenario,
        tc_id: u32,
        resolver: &TestCaseResolver<'_>,
    ) -> Result<bool> {
        let Some(_existing) = self.work_items.get(tc_id)? else {
            self.logger.warn(&format!(
                "test case {tc_id} not found or inaccessible; skipping scenario \"{}\"",
                scenario.name
            ));
            return Ok(false);
        };

        let steps = convert_steps(&scenario.steps);
        let tags = scenario
            .tags_to_sync()
            .iter()
            .map(|t| sanitize_for_csv(t))
            .collect::<Vec<_>>()
            .join("; ");

        self.work_items
            .update_fields(
                tc_id,
                &[
                    (fields::STEPS, render_steps_xml(&steps)),
                    (fields::TAGS, tags),
                    (fields::DESCRIPTION, render_description_html(scenario)),
                ],
            )
            .with_context(|| format!("update test case {tc_id}"))?;

        let mut requirement_ids = Vec::new();
        for tag in &scenario.tags {
            for id in extract_requirement_ids(tag) {
                if !requirement_ids.contains(&id) {
                    requirement_ids.push(id);
                }
            }
        }
        resolver.link_requirements(tc_id, &requirement_ids)?;

        self.logger.info(&format!(
            "updated test case {tc_id} from scenario \"{}\"",
            scenario.name
        ));
        Ok(true)
    }
}

/// Candidate test-case id embedded in a test name, if any.
pub fn extract_case_id_hint(test_name: &str) -> Option<String> {
    CASE_ID_HINT
        .captures(test_name)
        .map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use planship_failures::FAILURE_TAG;
    use planship_ports::VecLogger;
    use planship_schema::backend::RelationKind;
    use planship_testkit::{FakeBackend, PROJECT};
    use std::io::Write;

    fn write_junit(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("results.xml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    fn engine<'a>(
        backend: &'a FakeBackend,
        logger: &'a VecLogger,
        policy: SyncPolicy,
    ) -> Engine<'a> {
        Engine::new(
            backend,
            backend,
            backend,
            logger,
            PROJECT,
            policy,
            BuildContext {
                build_id: 77,
                build_number: "20260806.1".to_string(),
            },
        )
    }

    fn options(results_file: PathBuf) -> PublishOptions {
        PublishOptions {
            results_file,
            plan_name: "AutoPlan-20260806.1".to_string(),
            suite_name: "AutoSuite-20260806.1".to_string(),
            attach_results: false,
            artifacts_dir: None,
            artifact_pattern: "{testName}.png".to_string(),
        }
    }

    const TWO_CASES: &str = r#"
<testsuites>
  <testsuite name="Suite">
    <testcase name="UserLogin_TC1056" time="0.2">
      <failure message="assertion failed: login button missing"/>
    </testcase>
    <testcase name="Checkout_flow" time="1.1"/>
  </testsuite>
</testsuites>"#;

    #[test]
    fn full_publish_pipeline_creates_entities_and_a_completed_run() {
        let backend = FakeBackend::new();
        let logger = VecLogger::new();
        let dir = tempfile::tempdir().unwrap();
        let junit = write_junit(dir.path(), TWO_CASES);
        let e = engine(&backend, &logger, SyncPolicy::default());

        let summary = e.publish_results(&options(junit)).unwrap();

        assert_eq!(summary.parsed, 2);
        assert_eq!(summary.published, 2);
        assert_eq!(summary.unplanned, 0);
        assert_eq!(summary.failure_tasks_processed, 1);
        let run = summary.run.unwrap();

        let state = backend.state();
        // The stale TC1056 hint fell through to creation: two new test
        // cases plus one failure task.
        let cases: Vec<_> = state
            .work_items
            .values()
            .filter(|w| w.work_item_type == "Test Case")
            .collect();
        assert_eq!(cases.len(), 2);
        let tasks: Vec<_> = state
            .work_items
            .values()
            .filter(|w| w.work_item_type == "Task")
            .collect();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].tags.iter().any(|t| t.starts_with("ErrorHash:")));

        let stored_run = state.runs.iter().find(|r| r.id == run.run_id).unwrap();
        assert_eq!(stored_run.state, "Completed");
        assert_eq!(state.run_results.get(&run.run_id).unwrap().len(), 2);

        // The failed record kept its outcome through the pipeline.
        let published = state.run_results.get(&run.run_id).unwrap();
        let failed = published
            .iter()
            .find(|r| r.title == "UserLogin_TC1056")
            .unwrap();
        assert_eq!(failed.outcome, Outcome::Failed);
    }

    #[test]
    fn id_hint_reuses_the_existing_test_case() {
        let backend = FakeBackend::new();
        backend.seed_work_item(1056, "Test Case", "UserLogin_TC1056", "Design", &[], vec![]);
        let logger = VecLogger::new();
        let dir = tempfile::tempdir().unwrap();
        let junit = write_junit(dir.path(), TWO_CASES);
        let e = engine(&backend, &logger, SyncPolicy::default());

        e.publish_results(&options(junit)).unwrap();

        let state = backend.state();
        let created: Vec<_> = state
            .work_items
            .values()
            .filter(|w| w.work_item_type == "Test Case")
            .collect();
        // Only the unhinted test created a new case.
        assert_eq!(created.len(), 2);
        assert!(state.work_items.contains_key(&1056));
    }

    #[test]
    fn unplanned_results_are_excluded_and_empty_runs_are_skipped() {
        let backend = FakeBackend::new();
        backend.state().materialize_points = false;
        let logger = VecLogger::new();
        let dir = tempfile::tempdir().unwrap();
        let junit = write_junit(dir.path(), TWO_CASES);
        let e = engine(&backend, &logger, SyncPolicy::default());

        let summary = e.publish_results(&options(junit)).unwrap();

        assert_eq!(summary.unplanned, 2);
        assert_eq!(summary.published, 0);
        assert!(summary.run.is_none());
        assert!(backend.state().runs.is_empty());
        assert!(logger.contains("run will not be published"));
    }

    #[test]
    fn empty_result_file_short_circuits() {
        let backend = FakeBackend::new();
        let logger = VecLogger::new();
        let dir = tempfile::tempdir().unwrap();
        let junit = write_junit(dir.path(), "<testsuites></testsuites>");
        let e = engine(&backend, &logger, SyncPolicy::default());

        let summary = e.publish_results(&options(junit)).unwrap();
        assert_eq!(summary, PublishSummary::default());
        assert!(backend.state().plans.is_empty());
    }

    #[test]
    fn second_run_with_same_plan_names_links_nothing_new() {
        let backend = FakeBackend::new();
        let logger = VecLogger::new();
        let dir = tempfile::tempdir().unwrap();
        let junit = write_junit(dir.path(), TWO_CASES);
        let policy = SyncPolicy {
            auto_create_plan: false,
            auto_create_suite: false,
            // Without the title fallback a nameless re-run would recreate
            // every case and defeat the idempotence check.
            fallback_to_name_search: true,
            ..SyncPolicy::default()
        };
        backend.seed_plan(400, "AutoPlan-20260806.1", 401);
        {
            let mut state = backend.state();
            state.suites.get_mut(&400).unwrap().push(
                planship_schema::backend::SuiteSummary {
                    id: 402,
                    name: "AutoSuite-20260806.1".to_string(),
                    parent_suite_id: Some(401),
                },
            );
        }
        let e = engine(&backend, &logger, policy);

        e.publish_results(&options(junit.clone())).unwrap();
        let batches_after_first = backend.state().add_case_batches.len();
        e.publish_results(&options(junit)).unwrap();
        // Identical batch: suite linking issued no further writes.
        assert_eq!(backend.state().add_case_batches.len(), batches_after_first);
    }

    #[test]
    fn auto_close_resolves_tasks_for_passed_tests() {
        let backend = FakeBackend::new();
        let logger = VecLogger::new();
        let dir = tempfile::tempdir().unwrap();
        // Seed the test case and a task linked to it.
        backend.seed_work_item(2001, "Test Case", "Checkout_TC2001", "Design", &[], vec![]);
        backend.seed_work_item(
            900,
            "Task",
            "[Auto] old failure",
            "New",
            &[FAILURE_TAG],
            vec![FakeBackend::related_link(2001)],
        );
        let junit = write_junit(
            dir.path(),
            r#"<testsuite><testcase name="Checkout_TC2001" time="0.4"/></testsuite>"#,
        );
        let policy = SyncPolicy {
            auto_close_on_pass: true,
            ..SyncPolicy::default()
        };
        let e = engine(&backend, &logger, policy);

        let summary = e.publish_results(&options(junit)).unwrap();
        assert_eq!(summary.pass_resolutions, 1);
        assert_eq!(backend.state().work_items[&900].state, "Closed");
    }

    #[test]
    fn artifacts_matching_the_pattern_are_attached_to_results() {
        let backend = FakeBackend::new();
        let logger = VecLogger::new();
        let dir = tempfile::tempdir().unwrap();
        let junit = write_junit(
            dir.path(),
            r#"<testsuite><testcase name="Shot_me" time="0.1"><failure message="x"/></testcase></testsuite>"#,
        );
        let artifact = dir.path().join("Shot_me.png");
        std::fs::write(&artifact, b"png").unwrap();

        let mut opts = options(junit);
        opts.artifacts_dir = Some(dir.path().to_path_buf());
        let e = engine(&backend, &logger, SyncPolicy::default());

        e.publish_results(&opts).unwrap();

        let state = backend.state();
        assert_eq!(state.result_attachments.len(), 1);
        assert_eq!(state.result_attachments[0].2, artifact);
    }

    #[test]
    fn sync_features_updates_tagged_scenarios_and_links_requirements() {
        let backend = FakeBackend::new();
        backend.seed_work_item(1056, "Test Case", "old title", "Design", &[], vec![]);
        backend.seed_work_item(4242, "User Story", "story", "Active", &[], vec![]);
        let logger = VecLogger::new();
        let dir = tempfile::tempdir().unwrap();
        let feature = dir.path().join("checkout.feature");
        std::fs::write(
            &feature,
            "@Story_4242\nFeature: Checkout\n\n  @TC_1056 @smoke\n  Scenario: Pay\n    Given a cart\n    When paying\n    Then order confirmed\n",
        )
        .unwrap();
        let e = engine(&backend, &logger, SyncPolicy::default());

        let pattern = format!("{}/*.feature", dir.path().display());
        let summary = e.sync_features(&pattern).unwrap();
        assert_eq!(summary.scenarios, 1);
        assert_eq!(summary.updated, 1);

        let state = backend.state();
        let case = &state.work_items[&1056];
        assert_eq!(case.tags, vec!["Story_4242", "smoke"]);
        assert!(case
            .relations
            .iter()
            .any(|r| r.kind == RelationKind::TestedBy && r.target_id() == Some(4242)));
    }

    #[test]
    fn sync_features_skips_unknown_and_untagged_scenarios() {
        let backend = FakeBackend::new();
        let logger = VecLogger::new();
        let dir = tempfile::tempdir().unwrap();
        let feature = dir.path().join("a.feature");
        std::fs::write(
            &feature,
            "Feature: F\n\n  @TC_9999\n  Scenario: unknown id\n    Given x\n\n  Scenario: untagged\n    Given y\n",
        )
        .unwrap();
        let e = engine(&backend, &logger, SyncPolicy::default());

        let pattern = format!("{}/*.feature", dir.path().display());
        let summary = e.sync_features(&pattern).unwrap();
        assert_eq!(summary.scenarios, 2);
        assert_eq!(summary.updated, 0);
        assert_eq!(summary.skipped, 2);
        assert!(logger.contains("not found"));
        assert!(logger.contains("no TC tag"));
    }

    #[test]
    fn case_id_hint_extraction() {
        assert_eq!(extract_case_id_hint("UserLogin_TC1056"), Some("1056".into()));
        assert_eq!(extract_case_id_hint("tc_77_smoke"), Some("77".into()));
        assert_eq!(extract_case_id_hint("no_hint_here"), None);
    }
}
