//! Deterministic debug-trace injection and cleanup
//!
//! The logging-assisted stages must not depend on the model remembering to
//! instrument its own code. Canonical trace statements are inserted by a
//! source transformation: an entry trace after every `def`, an exit trace
//! before every `return`, and a trace before risky calls. Every inserted
//! line carries the `# cv-trace` marker, and cleanup removes exactly the
//! marked lines, never user-intended logging.

/// Marker carried by every injected line
pub const TRACE_MARKER: &str = "# cv-trace";

/// Calls worth announcing before they run
const RISKY_CALLS: [&str; 4] = ["open(", "json.loads(", "json.load(", "subprocess."];

/// Whether the code already carries injected traces
pub fn has_injected(code: &str) -> bool {
    code.lines().any(|line| line.trim_end().ends_with(TRACE_MARKER))
}

/// Insert canonical trace statements
///
/// Idempotent: code that already carries the marker is returned unchanged.
pub fn inject_trace(code: &str) -> String {
    if has_injected(code) {
        return code.to_string();
    }

    let mut out: Vec<String> = Vec::new();
    let mut inserted_any = false;
    // Stack of (indent, function name) for naming exit traces
    let mut def_stack: Vec<(usize, String)> = Vec::new();

    for line in code.lines() {
        let indent = leading_spaces(line);
        let trimmed = line.trim_start();

        while let Some((def_indent, _)) = def_stack.last() {
            if !trimmed.is_empty() && indent <= *def_indent {
                def_stack.pop();
            } else {
                break;
            }
        }

        if let Some(name) = def_name(trimmed) {
            out.push(line.to_string());
            let body_indent = " ".repeat(indent + 4);
            out.push(format!(
                "{}print(\"cv-trace: enter {}\", file=sys.stderr)  {}",
                body_indent, name, TRACE_MARKER
            ));
            def_stack.push((indent, name));
            inserted_any = true;
            continue;
        }

        if trimmed.starts_with("return") && !def_stack.is_empty() {
            let name = def_stack.last().map(|(_, n)| n.clone()).unwrap_or_default();
            out.push(format!(
                "{}print(\"cv-trace: exit {}\", file=sys.stderr)  {}",
                " ".repeat(indent),
                name,
                TRACE_MARKER
            ));
            out.push(line.to_string());
            inserted_any = true;
            continue;
        }

        if RISKY_CALLS.iter().any(|c| trimmed.contains(c)) && !trimmed.starts_with('#') {
            let excerpt: String = trimmed.chars().take(40).collect();
            out.push(format!(
                "{}print(\"cv-trace: about to {}\", file=sys.stderr)  {}",
                " ".repeat(indent),
                excerpt.replace('"', "'"),
                TRACE_MARKER
            ));
            out.push(line.to_string());
            inserted_any = true;
            continue;
        }

        out.push(line.to_string());
    }

    if !inserted_any {
        return code.to_string();
    }

    let mut result = String::new();
    // The traces need sys; inject the import only when it is missing
    if !code.lines().any(|l| {
        let t = l.trim();
        t == "import sys" || t.starts_with("import sys ") || t.starts_with("import sys,")
    }) {
        result.push_str(&format!("import sys  {}\n", TRACE_MARKER));
    }
    result.push_str(&out.join("\n"));
    if code.ends_with('\n') {
        result.push('\n');
    }
    result
}

/// Remove exactly the marker-tagged lines
pub fn strip_trace(code: &str) -> String {
    let kept: Vec<&str> = code
        .lines()
        .filter(|line| !line.trim_end().ends_with(TRACE_MARKER))
        .collect();
    let mut result = kept.join("\n");
    if code.ends_with('\n') && !result.is_empty() {
        result.push('\n');
    }
    result
}

fn leading_spaces(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

/// `def name(...)` -> name, for single-line def headers
fn def_name(trimmed: &str) -> Option<String> {
    let rest = trimmed.strip_prefix("def ")?;
    if !trimmed.trim_end().ends_with(':') {
        return None;
    }
    let name: String = rest
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    if name.is_empty() { None } else { Some(name) }
}
