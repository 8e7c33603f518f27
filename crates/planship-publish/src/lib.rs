//! Run publishing.
//!
//! Creates the run container, submits results in one batch, uploads
//! attachments, and moves the run to its terminal state. Backend-contract
//! violations (no run id, a silently dropped batch, a state update that
//! does not echo back) abort the publish; attachment problems only skip
//! the file in question.

use anyhow::{Context, Result, bail};
use planship_ports::{Logger, TestRuns};
use planship_schema::backend::{PlanRef, RunCreate, RunRef};
use planship_schema::policy::BuildContext;
use planship_schema::result::ResultRecord;
use std::path::{Path, PathBuf};

/// Size ceiling for one attachment; larger files are skipped, never
/// uploaded partially.
pub const MAX_ATTACHMENT_SIZE: u64 = 50 * 1024 * 1024;

const TERMINAL_STATE: &str = "Completed";

pub struct RunPublisher<'a> {
    test_runs: &'a dyn TestRuns,
    logger: &'a dyn Logger,
    /// Attachments must resolve (symlinks followed) inside this root.
    allowed_root: PathBuf,
}

impl<'a> RunPublisher<'a> {
    pub fn new(test_runs: &'a dyn TestRuns, logger: &'a dyn Logger, allowed_root: &Path) -> Self {
        Self {
            test_runs,
            logger,
            allowed_root: allowed_root.to_path_buf(),
        }
    }

    /// Publishes one batch of results and returns the finished run.
    pub fn create_run_and_publish(
        &self,
        plan: PlanRef,
        suite_name: &str,
        build: &BuildContext,
        results: &[ResultRecord],
        point_ids: Vec<u32>,
        results_file: Option<&Path>,
    ) -> Result<RunRef> {
        let run = RunCreate {
            name: format!("Run {} - {suite_name}", build.build_number),
            plan_id: plan.plan_id,
            build_id: build.build_id,
            point_ids,
        };

        let Some(run_id) = self.test_runs.create_run(&run).context("create test run")? else {
            bail!("run creation returned no run id");
        };
        self.logger.info(&format!("created test run {run_id}"));

        let mut result_ids = Vec::new();
        if !results.is_empty() {
            result_ids = self
                .test_runs
                .add_results(run_id, results)
                .context("submit test results")?;
            if result_ids.is_empty() {
                bail!(
                    "backend accepted zero of {} submitted results for run {run_id}",
                    results.len()
                );
            }
            self.logger
                .info(&format!("published {} result(s)", result_ids.len()));
        }

        if let Some(path) = results_file {
            self.attach_to_run(run_id, path);
        }
        self.attach_result_artifacts(run_id, results, &result_ids);

        let echoed = self
            .test_runs
            .complete_run(run_id)
            .context("complete test run")?;
        if echoed != TERMINAL_STATE {
            bail!("run {run_id} did not reach state {TERMINAL_STATE:?} (backend says {echoed:?})");
        }
        self.logger.info("run completed");

        Ok(RunRef {
            run_id,
            run_url: self.test_runs.run_url(run_id),
        })
    }

    fn attach_to_run(&self, run_id: u32, path: &Path) {
        if !self.attachment_is_safe(path) {
            return;
        }
        if let Err(e) = self.test_runs.attach_run_file(run_id, path) {
            self.logger.warn(&format!(
                "failed to attach {} to run {run_id}: {e:#}",
                path.display()
            ));
        }
    }

    fn attach_result_artifacts(&self, run_id: u32, results: &[ResultRecord], result_ids: &[u32]) {
        for (result, result_id) in results.iter().zip(result_ids) {
            for path in &result.local_attachments {
                if !self.attachment_is_safe(path) {
                    continue;
                }
                if let Err(e) = self.test_runs.attach_result_file(run_id, *result_id, path) {
                    self.logger.warn(&format!(
                        "failed to attach {} to result {result_id}: {e:#}",
                        path.display()
                    ));
                }
            }
        }
    }

    /// Gate for every upload: the file must exist, be a regular file,
    /// fit the size ceiling, and really live under the allowed root once
    /// symlinks are resolved.
    fn attachment_is_safe(&self, path: &Path) -> bool {
        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                self.logger
                    .warn(&format!("skipping attachment {}: {e}", path.display()));
                return false;
            }
        };
        if !meta.is_file() {
            self.logger.warn(&format!(
                "skipping attachment {}: not a regular file",
                path.display()
            ));
            return false;
        }
        if meta.len() > MAX_ATTACHMENT_SIZE {
            self.logger.warn(&format!(
                "skipping attachment {}: too large ({} bytes, max {})",
                path.display(),
                meta.len(),
                MAX_ATTACHMENT_SIZE
            ));
            return false;
        }

        let real = match std::fs::canonicalize(path) {
            Ok(p) => p,
            Err(e) => {
                self.logger.warn(&format!(
                    "skipping attachment {}: cannot resolve path: {e}",
                    path.display()
                ));
                return false;
            }
        };
        let root = match std::fs::canonicalize(&self.allowed_root) {
            Ok(p) => p,
            Err(e) => {
                self.logger.warn(&format!(
                    "skipping attachment {}: cannot resolve allowed root {}: {e}",
                    path.display(),
                    self.allowed_root.display()
                ));
                return false;
            }
        };
        if !real.starts_with(&root) {
            self.logger.warn(&format!(
                "skipping attachment {}: resolves outside the allowed root ({})",
                path.display(),
                real.display()
            ));
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planship_ports::VecLogger;
    use planship_schema::backend::{PointRef, TestCaseRef};
    use planship_schema::result::Outcome;
    use planship_testkit::FakeBackend;
    use std::io::Write;

    fn build() -> BuildContext {
        BuildContext {
            build_id: 321,
            build_number: "20260806.1".to_string(),
        }
    }

    fn plan() -> PlanRef {
        PlanRef {
            plan_id: 400,
            root_suite_id: Some(401),
        }
    }

    fn record_with_point(case_id: u32, point_id: u32) -> ResultRecord {
        ResultRecord {
            test_case: TestCaseRef {
                id: case_id,
                revision: 1,
                title: format!("case {case_id}"),
            },
            title: format!("case {case_id}"),
            automated_test_name: format!("case {case_id}"),
            duration_ms: 40.0,
            outcome: Outcome::Passed,
            error_message: None,
            point: Some(PointRef { point_id }),
            local_attachments: Vec::new(),
        }
    }

    #[test]
    fn publishes_and_completes_a_run() {
        let backend = FakeBackend::new();
        let logger = VecLogger::new();
        let root = tempfile::tempdir().unwrap();
        let publisher = RunPublisher::new(&backend, &logger, root.path());

        let results = vec![record_with_point(7, 9001)];
        let run = publisher
            .create_run_and_publish(plan(), "Smoke", &build(), &results, vec![9001], None)
            .unwrap();

        let state = backend.state();
        let stored = state.runs.iter().find(|r| r.id == run.run_id).unwrap();
        assert_eq!(stored.name, "Run 20260806.1 - Smoke");
        assert_eq!(stored.state, "Completed");
        assert_eq!(stored.point_ids, vec![9001]);
        assert_eq!(state.run_results.get(&run.run_id).unwrap().len(), 1);
        assert!(run.run_url.contains(&run.run_id.to_string()));
    }

    #[test]
    fn missing_run_id_is_fatal() {
        let backend = FakeBackend::new();
        backend.state().create_run_returns_no_id = true;
        let logger = VecLogger::new();
        let root = tempfile::tempdir().unwrap();
        let publisher = RunPublisher::new(&backend, &logger, root.path());

        let err = publisher
            .create_run_and_publish(plan(), "Smoke", &build(), &[], vec![], None)
            .unwrap_err();
        assert!(err.to_string().contains("no run id"));
    }

    #[test]
    fn silently_dropped_results_are_fatal() {
        let backend = FakeBackend::new();
        backend.state().accept_zero_results = true;
        let logger = VecLogger::new();
        let root = tempfile::tempdir().unwrap();
        let publisher = RunPublisher::new(&backend, &logger, root.path());

        let results = vec![record_with_point(7, 9001)];
        let err = publisher
            .create_run_and_publish(plan(), "Smoke", &build(), &results, vec![9001], None)
            .unwrap_err();
        assert!(err.to_string().contains("accepted zero"));
    }

    #[test]
    fn wrong_terminal_state_echo_is_fatal() {
        let backend = FakeBackend::new();
        backend.state().complete_run_state = "InProgress".to_string();
        let logger = VecLogger::new();
        let root = tempfile::tempdir().unwrap();
        let publisher = RunPublisher::new(&backend, &logger, root.path());

        let err = publisher
            .create_run_and_publish(plan(), "Smoke", &build(), &[], vec![], None)
            .unwrap_err();
        assert!(err.to_string().contains("did not reach state"));
    }

    #[test]
    fn results_file_within_root_is_attached() {
        let backend = FakeBackend::new();
        let logger = VecLogger::new();
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("results.xml");
        std::fs::write(&file, "<testsuites/>").unwrap();
        let publisher = RunPublisher::new(&backend, &logger, root.path());

        publisher
            .create_run_and_publish(plan(), "Smoke", &build(), &[], vec![], Some(&file))
            .unwrap();
        assert_eq!(backend.state().run_attachments.len(), 1);
    }

    #[test]
    fn oversized_attachment_is_skipped_with_warning() {
        let backend = FakeBackend::new();
        let logger = VecLogger::new();
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("huge.bin");
        let f = std::fs::File::create(&file).unwrap();
        f.set_len(MAX_ATTACHMENT_SIZE + 1).unwrap();
        drop(f);
        let publisher = RunPublisher::new(&backend, &logger, root.path());

        publisher
            .create_run_and_publish(plan(), "Smoke", &build(), &[], vec![], Some(&file))
            .unwrap();
        assert!(backend.state().run_attachments.is_empty());
        assert!(logger.contains("too large"));
    }

    #[test]
    fn attachment_escaping_the_root_is_skipped_with_warning() {
        let backend = FakeBackend::new();
        let logger = VecLogger::new();
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let file = outside.path().join("escape.txt");
        std::fs::write(&file, "outside").unwrap();
        let publisher = RunPublisher::new(&backend, &logger, root.path());

        let mut result = record_with_point(7, 9001);
        result.local_attachments.push(file);
        publisher
            .create_run_and_publish(plan(), "Smoke", &build(), &[result], vec![9001], None)
            .unwrap();
        assert!(backend.state().result_attachments.is_empty());
        assert!(logger.contains("outside the allowed root"));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_pointing_outside_the_root_is_skipped() {
        let backend = FakeBackend::new();
        let logger = VecLogger::new();
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("secret.txt");
        std::fs::write(&target, "secret").unwrap();
        let link = root.path().join("innocent.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        let publisher = RunPublisher::new(&backend, &logger, root.path());

        let mut result = record_with_point(7, 9001);
        result.local_attachments.push(link);
        publisher
            .create_run_and_publish(plan(), "Smoke", &build(), &[result], vec![9001], None)
            .unwrap();
        assert!(backend.state().result_attachments.is_empty());
        assert!(logger.contains("outside the allowed root"));
    }

    #[test]
    fn valid_result_artifact_is_attached() {
        let backend = FakeBackend::new();
        let logger = VecLogger::new();
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("shot.png");
        let mut f = std::fs::File::create(&file).unwrap();
        f.write_all(b"png bytes").unwrap();
        drop(f);
        let publisher = RunPublisher::new(&backend, &logger, root.path());

        let mut result = record_with_point(7, 9001);
        result.local_attachments.push(file.clone());
        publisher
            .create_run_and_publish(plan(), "Smoke", &build(), &[result], vec![9001], None)
            .unwrap();

        let state = backend.state();
        assert_eq!(state.result_attachments.len(), 1);
        assert_eq!(state.result_attachments[0].2, file);
    }
}
