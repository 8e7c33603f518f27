use serde::{Deserialize, Serialize};

/// One Gherkin step, keyword kept verbatim (`Given`, `And`, `*`, ...).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParsedStep {
    pub keyword: String,
    pub text: String,
}

/// One scenario flattened out of a feature file.
///
/// Background steps (feature-level and rule-level) are already merged into
/// `steps`, and `tags` is the order-preserving union of feature, rule, and
/// scenario tags. Free-text fields are secret-redacted by the parser.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ParsedScenario {
    pub name: String,
    pub description: String,
    /// Tag names without the leading `@`.
    pub tags: Vec<String>,
    pub steps: Vec<ParsedStep>,
    /// Numeric id carried by a `TC_<id>` scenario tag, when present.
    pub tc_id: Option<u32>,
    pub feature_name: String,
    pub feature_description: String,
}

impl ParsedScenario {
    /// Tags worth syncing to the backend: everything except the identity
    /// tag itself.
    pub fn tags_to_sync(&self) -> Vec<&str> {
        self.tags
            .iter()
            .map(String::as_str)
            .filter(|t| !t.starts_with("TC_"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_tag_is_excluded_from_sync() {
        let sc = ParsedScenario {
            name: "login".into(),
            description: String::new(),
            tags: vec!["smoke".into(), "TC_1056".into(), "Story_12".into()],
            steps: Vec::new(),
            tc_id: Some(1056),
            feature_name: "auth".into(),
            feature_description: String::new(),
        };
        assert_eq!(sc.tags_to_sync(), vec!["smoke", "Story_12"]);
    }
}
