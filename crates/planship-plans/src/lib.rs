//! Plan and suite membership.
//!
//! Guarantees the target plan and suite exist (create-if-permitted or
//! fail), keeps suite membership in sync without duplicate writes, and
//! maps suite test points onto pending results.

use anyhow::{Context, Result, bail};
use planship_ports::{Logger, TestPlans};
use planship_schema::backend::{PlanRef, PointRef, SuiteRef};
use planship_schema::result::ResultRecord;
use std::collections::HashMap;

/// Policy slice for plan/suite provisioning.
#[derive(Clone, Copy, Debug)]
pub struct PlanPolicy {
    pub auto_create_plan: bool,
    pub auto_create_suite: bool,
}

pub struct PlanManager<'a> {
    test_plans: &'a dyn TestPlans,
    logger: &'a dyn Logger,
    policy: PlanPolicy,
}

impl<'a> PlanManager<'a> {
    pub fn new(test_plans: &'a dyn TestPlans, logger: &'a dyn Logger, policy: PlanPolicy) -> Self {
        Self {
            test_plans,
            logger,
            policy,
        }
    }

    /// Returns the plan to publish into.
    ///
    /// With auto-create on, a plan is always created without searching
    /// first: generated plan names carry a build/timestamp suffix, so
    /// collisions are unlikely by construction. With auto-create off, the
    /// plan must already exist.
    pub fn ensure_plan(&self, plan_name: &str) -> Result<PlanRef> {
        if self.policy.auto_create_plan {
            let plan = self
                .test_plans
                .create_plan(plan_name)
                .with_context(|| format!("create test plan {plan_name:?}"))?;
            self.logger
                .info(&format!("created test plan {} ({plan_name})", plan.id));
            return Ok(PlanRef {
                plan_id: plan.id,
                root_suite_id: plan.root_suite_id,
            });
        }

        let plans = self.test_plans.list_plans()?;
        let found = plans
            .iter()
            .find(|p| p.name == plan_name)
            .ok_or_else(|| {
                anyhow::anyhow!("test plan {plan_name:?} not found and auto-create is disabled")
            })?;
        Ok(PlanRef {
            plan_id: found.id,
            root_suite_id: found.root_suite_id,
        })
    }

    /// Returns the suite to publish into, creating it directly under the
    /// plan's root suite when permitted.
    pub fn ensure_suite(&self, plan: PlanRef, suite_name: &str) -> Result<SuiteRef> {
        let suites = self.test_plans.list_suites(plan.plan_id)?;

        if !self.policy.auto_create_suite {
            let found = suites.iter().find(|s| s.name == suite_name).ok_or_else(|| {
                anyhow::anyhow!("test suite {suite_name:?} not found and auto-create is disabled")
            })?;
            return Ok(SuiteRef { suite_id: found.id });
        }

        // New suites always hang off the root: the first suite with no
        // parent, the first suite at all, or the plan's own root id.
        let parent_suite_id = suites
            .iter()
            .find(|s| s.parent_suite_id.is_none())
            .or_else(|| suites.first())
            .map(|s| s.id)
            .or(plan.root_suite_id);
        let Some(parent_suite_id) = parent_suite_id else {
            bail!("unable to determine root suite of plan {}", plan.plan_id);
        };

        let suite = self
            .test_plans
            .create_suite(plan.plan_id, parent_suite_id, suite_name)
            .with_context(|| format!("create test suite {suite_name:?}"))?;
        self.logger
            .info(&format!("created test suite {} ({suite_name})", suite.id));
        Ok(SuiteRef { suite_id: suite.id })
    }

    /// Ensures every id in `case_ids` is a member of the suite. Already
    /// linked ids are never resubmitted; re-running against an unchanged
    /// suite issues zero writes.
    pub fn link_test_cases_to_suite(
        &self,
        plan: PlanRef,
        suite: SuiteRef,
        case_ids: &[u32],
    ) -> Result<()> {
        if case_ids.is_empty() {
            return Ok(());
        }

        let mut unique = Vec::new();
        for id in case_ids {
            if !unique.contains(id) {
                unique.push(*id);
            }
        }

        let existing = self
            .test_plans
            .list_suite_case_ids(plan.plan_id, suite.suite_id)?;
        let to_add: Vec<u32> = unique
            .into_iter()
            .filter(|id| !existing.contains(id))
            .collect();

        if to_add.is_empty() {
            self.logger
                .info("all test cases already linked to suite; skipping add");
            return Ok(());
        }

        self.logger.info(&format!(
            "linking {} test case(s) to suite {}",
            to_add.len(),
            suite.suite_id
        ));
        self.test_plans
            .add_cases_to_suite(plan.plan_id, suite.suite_id, &to_add)
            .context("add test cases to suite")
    }

    /// Attaches the suite's points to the results and returns the
    /// de-duplicated point ids touched (the run's planned-point list).
    ///
    /// Points are fetched fresh every run; membership and configurations
    /// can change between runs. With multiple configurations the first
    /// point per test case wins. Results without a point are annotated
    /// with a warning only; exclusion is the orchestrator's call.
    pub fn map_points_to_results(
        &self,
        plan: PlanRef,
        suite: SuiteRef,
        results: &mut [ResultRecord],
    ) -> Result<Vec<u32>> {
        let points = self
            .test_plans
            .list_points(plan.plan_id, suite.suite_id)
            .context("list suite test points")?;

        let mut by_case: HashMap<u32, (u32, Option<String>)> = HashMap::new();
        for point in points {
            by_case
                .entry(point.test_case_id)
                .or_insert((point.id, point.test_case_title));
        }

        let mut point_ids = Vec::new();
        for result in results.iter_mut() {
            match by_case.get(&result.test_case.id) {
                Some((point_id, title)) => {
                    result.point = Some(PointRef { point_id: *point_id });
                    if result.title.is_empty() {
                        if let Some(t) = title {
                            result.title = t.clone();
                        }
                    }
                    if !point_ids.contains(point_id) {
                        point_ids.push(*point_id);
                    }
                }
                None => {
                    self.logger.warn(&format!(
                        "no test point for test case {}; result will be unplanned",
                        result.test_case.id
                    ));
                }
            }
        }

        Ok(point_ids)
    }
}
