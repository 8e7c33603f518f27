//! Gherkin-to-test-case step conversion.
//!
//! Folds a linear Given/When/Then sequence into the backend's two-column
//! step model: `Given`/`When` text accumulates in the action column,
//! `Then` text in the expected column, and continuations (`And`, `But`,
//! `*`) append to whichever column is active. A `Given`/`When` arriving
//! after an expected result starts the next step. Lines within a column
//! are joined with `<br/>`.

use planship_sanitize::{escape_xml, sanitize_for_csv};
use planship_schema::scenario::{ParsedScenario, ParsedStep};

/// One rendered step: an action and its expected result.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CaseStep {
    pub action: String,
    pub expected: String,
}

/// Converts a Gherkin step sequence into action/expected pairs.
pub fn convert_steps(steps: &[ParsedStep]) -> Vec<CaseStep> {
    let mut out: Vec<CaseStep> = Vec::new();

    for step in steps {
        let keyword = step.keyword.trim();
        // Step text ends up in exportable fields; neutralize formula
        // prefixes here, before any joining.
        let line = format!("{keyword} {}", sanitize_for_csv(&step.text));

        let is_then = keyword == "Then";
        let is_continuation = matches!(keyword, "And" | "But" | "*");

        if is_then {
            match out.last_mut() {
                Some(current) => append_line(&mut current.expected, &line),
                None => out.push(CaseStep {
                    // A leading Then has no action to attach to.
                    action: "Check Condition".to_string(),
                    expected: line,
                }),
            }
        } else if is_continuation {
            match out.last_mut() {
                Some(current) => {
                    if current.expected.is_empty() {
                        append_line(&mut current.action, &line);
                    } else {
                        append_line(&mut current.expected, &line);
                    }
                }
                None => out.push(CaseStep {
                    action: line,
                    expected: String::new(),
                }),
            }
        } else {
            match out.last_mut() {
                // Still in the setup/action phase: fold into the same step.
                Some(current) if current.expected.is_empty() => {
                    append_line(&mut current.action, &line);
                }
                _ => out.push(CaseStep {
                    action: line,
                    expected: String::new(),
                }),
            }
        }
    }

    out
}

/// Renders steps into the XML the backend stores in its steps field.
pub fn render_steps_xml(steps: &[CaseStep]) -> String {
    let mut xml = format!("<steps id=\"0\" last=\"{}\">", steps.len());
    for (index, step) in steps.iter().enumerate() {
        let id = index + 1;
        xml.push_str(&format!(
            "\n<step id=\"{id}\" type=\"ActionStep\">\
             \n    <parameterizedString isformatted=\"true\">{}</parameterizedString>\
             \n    <parameterizedString isformatted=\"true\">{}</parameterizedString>\
             \n    <description/>\
             \n</step>",
            escape_xml(&step.action),
            escape_xml(&step.expected),
        ));
    }
    xml.push_str("</steps>");
    xml
}

/// Renders the feature/scenario header into the description field.
pub fn render_description_html(scenario: &ParsedScenario) -> String {
    let mut html = format!(
        "<strong>Feature:</strong> {}<br/>",
        escape_xml(&scenario.feature_name)
    );
    if !scenario.feature_description.is_empty() {
        html.push_str(&format!(
            "<p>{}</p>",
            escape_xml(&scenario.feature_description)
        ));
    }
    html.push_str("<br/>");
    html.push_str(&format!(
        "<strong>Scenario:</strong> {}<br/>",
        escape_xml(&scenario.name)
    ));
    if !scenario.description.is_empty() {
        html.push_str(&format!("<p>{}</p>", escape_xml(&scenario.description)));
    }
    html
}

fn append_line(column: &mut String, line: &str) {
    if column.is_empty() {
        column.push_str(line);
    } else {
        column.push_str("<br/>");
        column.push_str(line);
    }
}
