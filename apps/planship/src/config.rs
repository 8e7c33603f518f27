//! Environment configuration.
//!
//! Credentials and policy toggles come from the environment, with the
//! pipeline-provided `SYSTEM_*`/`BUILD_*` variables taking precedence
//! over the `ADO_*` spellings for local runs. Missing credentials are
//! fatal before any backend call is made.

use anyhow::{Result, bail};
use planship_schema::policy::{BuildContext, SyncPolicy};

#[derive(Clone, Debug)]
pub struct AppEnv {
    pub token: String,
    pub org_url: String,
    pub project: String,
    pub build: BuildContext,
    pub policy: SyncPolicy,
}

pub fn load_environment() -> Result<AppEnv> {
    load_environment_from(|key| std::env::var(key).ok())
}

pub fn load_environment_from(get: impl Fn(&str) -> Option<String>) -> Result<AppEnv> {
    let first = |keys: &[&str]| keys.iter().find_map(|k| get(k).filter(|v| !v.is_empty()));

    let token = first(&["SYSTEM_ACCESSTOKEN", "ADO_TOKEN"]);
    let org_url = first(&["SYSTEM_TEAMFOUNDATIONCOLLECTIONURI", "ADO_ORG_URL"]);
    let project = first(&["SYSTEM_TEAMPROJECT", "ADO_PROJECT"]);

    let (Some(token), Some(org_url), Some(project)) = (token, org_url, project) else {
        bail!(
            "Missing required environment variables (token/orgUrl/project). \
             Provide SYSTEM_* values in a pipeline or set ADO_TOKEN, ADO_ORG_URL, \
             ADO_PROJECT locally."
        );
    };

    let build_id = get("BUILD_BUILDID")
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(0);
    let build_number = first(&["BUILD_BUILDNUMBER", "ADO_BUILD_NUMBER"])
        .unwrap_or_else(|| "Local Run".to_string());

    let parse_bool = |keys: &[&str], default: bool| {
        first(keys)
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(default)
    };

    let policy = SyncPolicy {
        auto_create_test_cases: parse_bool(&["ADO_AUTO_CREATE_TEST_CASES"], true),
        fallback_to_name_search: parse_bool(&["ADO_FALLBACK_TO_NAME_SEARCH"], false),
        auto_create_plan: parse_bool(&["ADO_AUTO_CREATE_PLAN"], true),
        auto_create_suite: parse_bool(&["ADO_AUTO_CREATE_SUITE"], true),
        create_failure_tasks: parse_bool(&["CREATE_FAILURE_TASKS", "ADO_CREATE_FAILURE_TASKS"], true),
        auto_close_on_pass: parse_bool(&["ADO_AUTO_CLOSE_ON_PASS"], false),
        defect_type: get("ADO_DEFECT_TYPE")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "Task".to_string()),
    };

    Ok(AppEnv {
        token,
        org_url,
        project,
        build: BuildContext {
            build_id,
            build_number,
        },
        policy,
    })
}

/// Expands the `auto-generate` sentinel into a unique name; anything else
/// passes through.
pub fn resolve_generated_name(requested: &str, prefix: &str, build_number: &str) -> String {
    if !requested.eq_ignore_ascii_case("auto-generate") {
        return requested.to_string();
    }
    let suffix = if build_number == "Local Run" {
        chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string()
    } else {
        build_number.to_string()
    };
    format!("{prefix}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |key| map.get(key).map(|v| v.to_string())
    }

    const BASE: &[(&str, &str)] = &[
        ("ADO_TOKEN", "pat"),
        ("ADO_ORG_URL", "https://dev.azure.com/acme"),
        ("ADO_PROJECT", "Webshop"),
    ];

    #[test]
    fn missing_credentials_are_fatal() {
        let err = load_environment_from(env(&[])).unwrap_err();
        assert!(err.to_string().contains("Missing required"));
    }

    #[test]
    fn pipeline_variables_win_over_local_ones() {
        let mut pairs = BASE.to_vec();
        pairs.push(("SYSTEM_TEAMPROJECT", "PipelineProject"));
        let cfg = load_environment_from(env(&pairs)).unwrap();
        assert_eq!(cfg.project, "PipelineProject");
        assert_eq!(cfg.token, "pat");
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = load_environment_from(env(BASE)).unwrap();
        assert_eq!(cfg.build.build_id, 0);
        assert_eq!(cfg.build.build_number, "Local Run");
        assert!(cfg.policy.auto_create_test_cases);
        assert!(!cfg.policy.fallback_to_name_search);
        assert!(cfg.policy.create_failure_tasks);
        assert!(!cfg.policy.auto_close_on_pass);
        assert_eq!(cfg.policy.defect_type, "Task");
    }

    #[test]
    fn boolean_toggles_parse_case_insensitively() {
        let mut pairs = BASE.to_vec();
        pairs.push(("CREATE_FAILURE_TASKS", "False"));
        pairs.push(("ADO_AUTO_CLOSE_ON_PASS", "TRUE"));
        let cfg = load_environment_from(env(&pairs)).unwrap();
        assert!(!cfg.policy.create_failure_tasks);
        assert!(cfg.policy.auto_close_on_pass);
    }

    #[test]
    fn generated_names_use_the_build_number() {
        assert_eq!(
            resolve_generated_name("auto-generate", "AutoPlan", "20260806.1"),
            "AutoPlan-20260806.1"
        );
        assert_eq!(
            resolve_generated_name("Nightly", "AutoPlan", "20260806.1"),
            "Nightly"
        );
        // A local run gets a timestamp suffix instead.
        let local = resolve_generated_name("AUTO-GENERATE", "AutoSuite", "Local Run");
        assert!(local.starts_with("AutoSuite-2"));
    }
}
