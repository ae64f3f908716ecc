//! Unified-diff rendering shared by the diff modules.

use similar::TextDiff;

/// Unified diff of two texts with three lines of context and `---`/`+++`
/// headers, split into lines. Empty when the texts are equal.
pub fn unified_diff(old: &str, new: &str, from_label: &str, to_label: &str) -> Vec<String> {
    let diff = TextDiff::from_lines(old, new);
    let rendered = diff
        .unified_diff()
        .context_radius(3)
        .missing_newline_hint(false)
        .header(from_label, to_label)
        .to_string();
    rendered.lines().map(str::to_string).collect()
}

/// Zero-context unified diff of two line lists with the `---`/`+++`/`@@`
/// marker lines stripped; only the changed lines remain, `+`/`-` prefixed.
pub fn changed_lines(old: &[String], new: &[String]) -> Vec<String> {
    let old_text = join_lines(old);
    let new_text = join_lines(new);
    let diff = TextDiff::from_lines(&old_text, &new_text);
    let rendered = diff
        .unified_diff()
        .context_radius(0)
        .missing_newline_hint(false)
        .to_string();
    rendered
        .lines()
        .filter(|line| {
            !(line.starts_with("+++") || line.starts_with("---") || line.starts_with("@@"))
        })
        .map(str::to_string)
        .collect()
}

fn join_lines(lines: &[String]) -> String {
    let mut text = lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn equal_inputs_produce_no_diff() {
        assert!(unified_diff("a\nb\n", "a\nb\n", "old", "new").is_empty());
        assert!(changed_lines(&lines(&["a", "b"]), &lines(&["a", "b"])).is_empty());
    }

    #[test]
    fn unified_diff_carries_headers_and_hunks() {
        let diff = unified_diff("a\nb\nc\n", "a\nx\nc\n", "left", "right");
        assert_eq!(diff[0], "--- left");
        assert_eq!(diff[1], "+++ right");
        assert!(diff[2].starts_with("@@"));
        assert!(diff.contains(&"-b".to_string()));
        assert!(diff.contains(&"+x".to_string()));
        assert!(diff.contains(&" a".to_string()));
    }

    #[test]
    fn changed_lines_strips_markers() {
        let out = changed_lines(
            &lines(&["keep", "old value", "tail"]),
            &lines(&["keep", "new value", "tail"]),
        );
        assert_eq!(out, vec!["-old value".to_string(), "+new value".to_string()]);
    }

    #[test]
    fn changed_lines_handles_empty_sides() {
        let out = changed_lines(&[], &lines(&["added"]));
        assert_eq!(out, vec!["+added".to_string()]);
        let out = changed_lines(&lines(&["gone"]), &[]);
        assert_eq!(out, vec!["-gone".to_string()]);
    }
}
