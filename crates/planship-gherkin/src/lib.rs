//! Feature-file collaborator.
//!
//! Expands a glob pattern, parses each feature file with the external
//! Gherkin grammar, and flattens the result into [`ParsedScenario`]
//! records: background steps (feature-level, then rule-level) are merged
//! ahead of each scenario's own steps, and tags are the order-preserving
//! union of feature, rule, and scenario tags.
//!
//! Oversized source files are fatal; unreadable files are skipped with a
//! warning. Free-text fields are secret-redacted before leaving this
//! crate.

use anyhow::{Context, Result, anyhow, bail};
use gherkin::{Feature, GherkinEnv};
use planship_ports::Logger;
use planship_redact::redact;
use planship_schema::scenario::{ParsedScenario, ParsedStep};
use std::path::Path;

/// Hard ceiling for one feature file; larger inputs are rejected.
pub const MAX_FEATURE_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Tag (without the `@`) that carries a test-case id: `TC_1056`.
const TC_TAG_PREFIX: &str = "TC_";

/// Parses every feature file matching `pattern`.
pub fn parse_features(pattern: &str, logger: &dyn Logger) -> Result<Vec<ParsedScenario>> {
    let entries = glob::glob(pattern).with_context(|| format!("bad glob pattern {pattern:?}"))?;

    let mut scenarios = Vec::new();
    let mut matched_any = false;

    for entry in entries {
        let path = match entry {
            Ok(p) => p,
            Err(e) => {
                logger.warn(&format!("skipping unreadable glob entry: {e}"));
                continue;
            }
        };
        matched_any = true;

        let meta = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                logger.warn(&format!(
                    "skipping inaccessible feature file {}: {e}",
                    path.display()
                ));
                continue;
            }
        };
        if !meta.is_file() {
            continue;
        }
        if meta.len() > MAX_FEATURE_FILE_SIZE {
            bail!(
                "feature file is too large ({} bytes, max {}): {}",
                meta.len(),
                MAX_FEATURE_FILE_SIZE,
                path.display()
            );
        }

        scenarios.extend(parse_feature_file(&path)?);
    }

    if !matched_any {
        logger.info(&format!("no feature files matched {pattern:?}"));
    }

    Ok(scenarios)
}

/// Parses a single feature file.
pub fn parse_feature_file(path: &Path) -> Result<Vec<ParsedScenario>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read feature file {}", path.display()))?;
    parse_feature_str(&content)
        .with_context(|| format!("parse feature file {}", path.display()))
}

/// Parses Gherkin source text into flattened scenario records.
pub fn parse_feature_str(content: &str) -> Result<Vec<ParsedScenario>> {
    let feature = Feature::parse(content, GherkinEnv::default())
        .map_err(|e| anyhow!("invalid Gherkin: {e:?}"))?;

    let feature_name = redact(&feature.name);
    let feature_description = redact(feature.description.as_deref().unwrap_or(""));
    let feature_tags = normalize_tags(&feature.tags);

    let background_steps: Vec<ParsedStep> = feature
        .background
        .as_ref()
        .map(|b| convert_steps(&b.steps))
        .unwrap_or_default();

    let mut out = Vec::new();

    for scenario in &feature.scenarios {
        out.push(flatten_scenario(
            scenario,
            &background_steps,
            &feature_tags,
            &feature_name,
            &feature_description,
        ));
    }

    for rule in &feature.rules {
        let mut rule_background = background_steps.clone();
        if let Some(bg) = &rule.background {
            rule_background.extend(convert_steps(&bg.steps));
        }
        let mut rule_tags = feature_tags.clone();
        merge_tags(&mut rule_tags, &normalize_tags(&rule.tags));

        for scenario in &rule.scenarios {
            out.push(flatten_scenario(
                scenario,
                &rule_background,
                &rule_tags,
                &feature_name,
                &feature_description,
            ));
        }
    }

    Ok(out)
}

fn flatten_scenario(
    scenario: &gherkin::Scenario,
    background_steps: &[ParsedStep],
    inherited_tags: &[String],
    feature_name: &str,
    feature_description: &str,
) -> ParsedScenario {
    let scenario_tags = normalize_tags(&scenario.tags);

    let mut tags = inherited_tags.to_vec();
    merge_tags(&mut tags, &scenario_tags);

    // The identity tag is only honored on the scenario itself; an
    // inherited feature-level TC tag would pin every scenario to one
    // test case.
    let tc_id = scenario_tags
        .iter()
        .find_map(|t| t.strip_prefix(TC_TAG_PREFIX))
        .and_then(|rest| rest.parse::<u32>().ok());

    let mut steps = background_steps.to_vec();
    steps.extend(convert_steps(&scenario.steps));

    ParsedScenario {
        name: redact(&scenario.name),
        description: redact(scenario.description.as_deref().unwrap_or("")),
        tags,
        steps,
        tc_id,
        feature_name: feature_name.to_string(),
        feature_description: feature_description.to_string(),
    }
}

fn convert_steps(steps: &[gherkin::Step]) -> Vec<ParsedStep> {
    steps
        .iter()
        .map(|s| ParsedStep {
            keyword: s.keyword.trim().to_string(),
            text: redact(&s.value),
        })
        .collect()
}

// Tags arrive with or without a leading `@` depending on the source;
// normalize to the bare name.
fn normalize_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .map(|t| t.trim_start_matches('@').to_string())
        .collect()
}

fn merge_tags(into: &mut Vec<String>, extra: &[String]) {
    for tag in extra {
        if !into.contains(tag) {
            into.push(tag.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planship_ports::VecLogger;
    use std::io::Write;

    const FEATURE: &str = r#"@web @Story_4242
Feature: Checkout
  Carts become orders.

  Background:
    Given a signed-in shopper

  @TC_1056 @smoke
  Scenario: Pay with saved card
    Saved cards skip the form.
    When the shopper pays with a saved card
    Then the order is confirmed

  Rule: Guest checkout
    Background:
      Given an empty guest cart

    @TC_1057
    Scenario: Guest pays
      When the guest pays
      Then a receipt is shown
"#;

    #[test]
    fn scenarios_are_flattened_with_backgrounds_and_tag_union() {
        let scenarios = parse_feature_str(FEATURE).unwrap();
        assert_eq!(scenarios.len(), 2);

        let first = &scenarios[0];
        assert_eq!(first.name, "Pay with saved card");
        assert_eq!(first.tc_id, Some(1056));
        assert_eq!(first.feature_name, "Checkout");
        assert_eq!(first.tags, vec!["web", "Story_4242", "TC_1056", "smoke"]);
        let keywords: Vec<&str> = first.steps.iter().map(|s| s.keyword.as_str()).collect();
        assert_eq!(keywords, vec!["Given", "When", "Then"]);
        assert_eq!(first.steps[0].text, "a signed-in shopper");

        let second = &scenarios[1];
        assert_eq!(second.tc_id, Some(1057));
        // Feature background then rule background then own steps.
        let texts: Vec<&str> = second.steps.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "a signed-in shopper",
                "an empty guest cart",
                "the guest pays",
                "a receipt is shown"
            ]
        );
        assert_eq!(second.tags, vec!["web", "Story_4242", "TC_1057"]);
    }

    #[test]
    fn scenario_without_tc_tag_has_no_id() {
        let content = "Feature: F\n  Scenario: untagged\n    Given something\n";
        let scenarios = parse_feature_str(content).unwrap();
        assert_eq!(scenarios[0].tc_id, None);
    }

    #[test]
    fn glob_with_no_matches_is_empty_not_fatal() {
        let logger = VecLogger::new();
        let scenarios = parse_features("/nonexistent/**/*.feature", &logger).unwrap();
        assert!(scenarios.is_empty());
    }

    #[test]
    fn oversized_feature_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.feature");
        let f = std::fs::File::create(&path).unwrap();
        f.set_len(MAX_FEATURE_FILE_SIZE + 1).unwrap();
        drop(f);

        let logger = VecLogger::new();
        let pattern = format!("{}/*.feature", dir.path().display());
        assert!(parse_features(&pattern, &logger).is_err());
    }

    #[test]
    fn feature_files_parse_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkout.feature");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(FEATURE.as_bytes()).unwrap();
        drop(f);

        let logger = VecLogger::new();
        let pattern = format!("{}/*.feature", dir.path().display());
        let scenarios = parse_features(&pattern, &logger).unwrap();
        assert_eq!(scenarios.len(), 2);
    }
}
