//! Escaping and injection guards.
//!
//! Everything persisted to the backend passes through here: titles and
//! tags get the CSV-formula guard (work-item exports open in spreadsheet
//! tools), query literals get WIQL quote doubling, and step/description
//! fields get XML escaping.

/// Neutralizes spreadsheet formula injection.
///
/// A value whose trimmed form starts with `=`, `+`, `@`, or a bare `-`
/// (not followed by a space, so Markdown-style bullets survive) is
/// prefixed with a single quote.
pub fn sanitize_for_csv(value: &str) -> String {
    let trimmed = value.trim_start();
    let mut chars = trimmed.chars();
    let dangerous = match chars.next() {
        Some('=') | Some('+') | Some('@') => true,
        Some('-') => !matches!(chars.next(), Some(' ')),
        _ => false,
    };

    if dangerous {
        format!("'{value}")
    } else {
        value.to_string()
    }
}

/// Escapes a string literal for embedding in a WIQL query: single quotes
/// are doubled.
pub fn escape_wiql(value: &str) -> String {
    value.replace('\'', "''")
}

/// Escapes text for XML element content and attribute values.
pub fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn formula_prefixes_are_neutralized() {
        assert_eq!(sanitize_for_csv("=cmd|' /C calc'!A0"), "'=cmd|' /C calc'!A0");
        assert_eq!(sanitize_for_csv("+SUM(A1)"), "'+SUM(A1)");
        assert_eq!(sanitize_for_csv("@reference"), "'@reference");
        assert_eq!(sanitize_for_csv("-2+3"), "'-2+3");
    }

    #[test]
    fn leading_whitespace_does_not_hide_a_formula() {
        assert_eq!(sanitize_for_csv("  =1+1"), "'  =1+1");
    }

    #[test]
    fn bullet_prefix_is_left_alone() {
        assert_eq!(sanitize_for_csv("- a list item"), "- a list item");
    }

    #[test]
    fn ordinary_text_is_left_alone() {
        assert_eq!(sanitize_for_csv("UserLogin_TC1056"), "UserLogin_TC1056");
        assert_eq!(sanitize_for_csv(""), "");
    }

    #[test]
    fn wiql_quotes_are_doubled() {
        assert_eq!(escape_wiql("O'Brien's test"), "O''Brien''s test");
        assert_eq!(escape_wiql("plain"), "plain");
    }

    #[test]
    fn xml_specials_are_escaped() {
        assert_eq!(
            escape_xml(r#"<a href="x">&'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;&amp;&apos;&lt;/a&gt;"
        );
    }

    proptest! {
        #[test]
        fn sanitized_values_never_start_with_a_formula_trigger(value in ".{0,80}") {
            let out = sanitize_for_csv(&value);
            let trimmed = out.trim_start();
            let mut chars = trimmed.chars();
            let still_dangerous = match chars.next() {
                Some('=') | Some('+') | Some('@') => true,
                Some('-') => !matches!(chars.next(), Some(' ')),
                _ => false,
            };
            prop_assert!(!still_dangerous, "output still dangerous: {out:?}");
        }

        #[test]
        fn escaped_xml_has_no_raw_specials(value in ".{0,80}") {
            let out = escape_xml(&value);
            prop_assert!(!out.contains('<') && !out.contains('>') && !out.contains('"'));
        }
    }
}
