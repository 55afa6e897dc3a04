use roxmltree::{Document, Node};

use crate::{
    error::Error,
    report::{Failure, TestCase, TestReport, TestStats},
};

/// Parses a JUnit XML document into a report.
///
/// Counts are summed over every suite that has at least one test case.
/// `time` and `timestamp` come from the first such suite only.
pub fn parse(xml: &str) -> Result<TestReport, Error> {
    let doc = Document::parse(xml)?;
    let root = doc.root_element();

    let suites: Vec<Node> = match root.tag_name().name() {
        "testsuites" => root
            .children()
            .filter(|n| n.has_tag_name("testsuite"))
            .collect(),
        "testsuite" => vec![root],
        other => {
            return Err(Error::from(format!(
                "Unexpected root element <{other}> in JUnit report"
            )));
        }
    };

    let mut stats: Option<TestStats> = None;
    let mut tests: Vec<TestCase> = vec![];

    for suite in suites {
        let cases: Vec<Node> = suite
            .children()
            .filter(|n| n.has_tag_name("testcase"))
            .collect();
        if suite.attribute("tests") == Some("0") || cases.is_empty() {
            continue;
        }

        match stats.as_mut() {
            None => {
                stats = Some(TestStats {
                    errors: attr_u32(&suite, "errors"),
                    failures: attr_u32(&suite, "failures"),
                    skipped: attr_u32(&suite, "skipped"),
                    tests: attr_u32(&suite, "tests"),
                    time: attr_f64(&suite, "time"),
                    timestamp: suite.attribute("timestamp").map(String::from),
                });
            }
            Some(s) => {
                s.errors += attr_u32(&suite, "errors");
                s.failures += attr_u32(&suite, "failures");
                s.skipped += attr_u32(&suite, "skipped");
                s.tests += attr_u32(&suite, "tests");
            }
        }

        tests.extend(cases.iter().map(test_case));
    }

    Ok(TestReport {
        stats: stats.unwrap_or_default(),
        tests: tests,
    })
}

fn test_case(node: &Node) -> TestCase {
    let failure = node
        .children()
        .find(|n| n.has_tag_name("failure") || n.has_tag_name("error"))
        .map(|f| Failure {
            stacktrace: f
                .descendants()
                .filter(|d| d.is_text())
                .filter_map(|d| d.text())
                .collect(),
            message: normalize_message(f.attribute("message").unwrap_or("")),
        });

    TestCase {
        name: node.attribute("name").unwrap_or("").to_string(),
        file: node.attribute("file").map(String::from),
        line: node.attribute("line").and_then(|l| l.trim().parse().ok()),
        time: attr_f64(node, "time"),
        failure: failure,
    }
}

/// Reduces an assertion message to the cause the student needs to see.
///
/// The `AssertionError: ` prefix is removed, everything from an echoed
/// `assert` statement to the end of its line is dropped, and trailing
/// whitespace is trimmed.
pub fn normalize_message(raw: &str) -> String {
    let mut msg = raw.replace("AssertionError: ", "");
    if let Some(start) = msg.find("assert") {
        let end = msg[start..]
            .find('\n')
            .map_or(msg.len(), |offset| start + offset);
        msg.replace_range(start..end, "");
    }
    msg.trim_end().to_string()
}

fn attr_u32(node: &Node, name: &str) -> u32 {
    node.attribute(name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

fn attr_f64(node: &Node, name: &str) -> f64 {
    node.attribute(name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0.0)
}
