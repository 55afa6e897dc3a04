use roxmltree::{Document, Node};

use crate::{
    error::Error,
    report::{Failure, MemoryFinding, TestCase, TestReport},
};

/// Shown instead of a line reference when the allocation happened in
/// harness code appended after the submission.
pub const HINT_ALLOCATED_BY_HARNESS: &str =
    "malloc() is called in the tests, you need to call free() in your program";

/// Name of the case that replaces individual findings while functional tests
/// are still failing.
pub const PLACEHOLDER_CASE_NAME: &str = "Memory check";

pub const PLACEHOLDER_CASE_MESSAGE: &str =
    "Memory errors were detected. Fix the failing tests first to see them in detail.";

/// Raw memory error, before grouping.
#[derive(Debug, Clone, PartialEq)]
struct RawFinding {
    file: String,
    line: u32,
    stacktrace: String,
    message: String,
}

/// Parses a memcheck XML report into deduplicated findings.
///
/// `submission_lines` is the number of lines of the student's source. Frames
/// pointing past it belong to the appended harness. Frames located in one of
/// `harness_internal_files` are skipped when looking for the responsible
/// frame.
pub fn parse(
    xml: &str,
    submission_lines: usize,
    harness_internal_files: &[String],
) -> Result<Vec<MemoryFinding>, Error> {
    let doc = Document::parse(xml)?;
    let root = doc.root_element();
    if !root.has_tag_name("valgrindoutput") {
        return Err(Error::from(format!(
            "Unexpected root element <{}> in memcheck report",
            root.tag_name().name()
        )));
    }

    let raw: Vec<RawFinding> = root
        .children()
        .filter(|n| n.has_tag_name("error"))
        .filter_map(|e| raw_finding(&e, submission_lines, harness_internal_files))
        .collect();

    Ok(deduplicate(raw))
}

fn raw_finding(
    error: &Node,
    submission_lines: usize,
    harness_internal_files: &[String],
) -> Option<RawFinding> {
    let stack = error.children().find(|n| n.has_tag_name("stack"))?;
    let (file, line) = stack
        .children()
        .filter(|n| n.has_tag_name("frame"))
        .filter_map(|frame| {
            let file = child_text(&frame, "file")?;
            let line = child_text(&frame, "line")?.trim().parse::<u32>().ok()?;
            Some((file, line))
        })
        .find(|(file, _)| !harness_internal_files.iter().any(|h| file.contains(h.as_str())))?;

    let stacktrace = if line as usize > submission_lines {
        HINT_ALLOCATED_BY_HARNESS.to_string()
    } else {
        format!("{file}:{line}")
    };

    let what = error
        .children()
        .find(|n| n.has_tag_name("xwhat"))
        .and_then(|x| child_text(&x, "text"))
        .or_else(|| child_text(error, "what"))
        .unwrap_or_default();
    let message = match what.find("in loss record") {
        Some(idx) => what[..idx].trim_end().to_string(),
        None => what.trim_end().to_string(),
    };

    Some(RawFinding {
        file: file,
        line: line,
        stacktrace: stacktrace,
        message: message,
    })
}

fn child_text(node: &Node, name: &str) -> Option<String> {
    node.children()
        .find(|n| n.has_tag_name(name))
        .and_then(|n| n.text())
        .map(String::from)
}

/// Groups findings sharing the same stacktrace and message. Groups keep the
/// position of their first member and are numbered in that order.
fn deduplicate(raw: Vec<RawFinding>) -> Vec<MemoryFinding> {
    let mut groups: Vec<(RawFinding, u32)> = vec![];
    for finding in raw {
        match groups.iter_mut().find(|(g, _)| {
            g.stacktrace == finding.stacktrace && g.message == finding.message
        }) {
            Some((_, count)) => *count += 1,
            None => groups.push((finding, 1)),
        }
    }

    groups
        .into_iter()
        .enumerate()
        .map(|(i, (f, count))| MemoryFinding {
            name: format!("Memory leak {}", i + 1),
            file: f.file,
            line: f.line,
            stacktrace: f.stacktrace,
            message: if count > 1 {
                format!("{} (x{count})", f.message)
            } else {
                f.message
            },
            occurrences: count,
        })
        .collect()
}

/// Merges memory findings into a functional report.
///
/// While functional tests fail, findings are summarized by a single
/// placeholder case. Otherwise every finding becomes its own failed case.
pub fn attach_findings(report: &mut TestReport, findings: Vec<MemoryFinding>) {
    if findings.is_empty() {
        return;
    }
    if report.unsuccessful() > 0 {
        log::debug!(
            "Hiding {} memory findings behind a placeholder case",
            findings.len()
        );
        report.push_failed_case(TestCase {
            name: PLACEHOLDER_CASE_NAME.to_string(),
            file: None,
            line: None,
            time: 0.0,
            failure: Some(Failure {
                stacktrace: String::new(),
                message: PLACEHOLDER_CASE_MESSAGE.to_string(),
            }),
        });
        return;
    }
    for f in findings {
        report.push_failed_case(f.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::TestStats;
    use asserting::prelude::*;

    fn internal() -> Vec<String> {
        vec!["vg_replace_malloc.c".to_string(), "unity.c".to_string()]
    }

    fn error_xml(what: &str, frames: &[(&str, u32)]) -> String {
        let frames: String = frames
            .iter()
            .map(|(file, line)| {
                format!(
                    "<frame><ip>0x0</ip><fn>f</fn><dir>/ws</dir><file>{file}</file><line>{line}</line></frame>"
                )
            })
            .collect();
        format!(
            "<error><unique>0x1</unique><kind>Leak_DefinitelyLost</kind><xwhat><text>{what}</text><leakedbytes>8</leakedbytes></xwhat><stack>{frames}</stack></error>"
        )
    }

    fn report_xml(errors: &[String]) -> String {
        format!(
            "<?xml version=\"1.0\"?><valgrindoutput><protocolversion>4</protocolversion>{}<errorcounts/></valgrindoutput>",
            errors.concat()
        )
    }

    const LOST: &str = "8 bytes in 1 blocks are definitely lost in loss record 1 of 3";

    #[test]
    fn test_identical_findings_collapse() {
        let e = error_xml(LOST, &[("vg_replace_malloc.c", 299), ("abc_test.c", 4)]);
        let xml = report_xml(&[e.clone(), e.clone(), e]);
        let findings = parse(&xml, 10, &internal()).unwrap();
        assert_that!(findings.len()).is_equal_to(1);
        assert_that!(findings[0].name.as_str()).is_equal_to("Memory leak 1");
        assert_that!(findings[0].message.as_str())
            .is_equal_to("8 bytes in 1 blocks are definitely lost (x3)");
        assert_that!(findings[0].message.ends_with("(x3)")).is_true();
        assert_that!(findings[0].stacktrace.as_str()).is_equal_to("abc_test.c:4");
        assert_that!(findings[0].occurrences).is_equal_to(3);
    }

    #[test]
    fn test_distinct_findings_are_numbered_by_first_occurrence() {
        let a = error_xml(LOST, &[("abc_test.c", 7)]);
        let b = error_xml(
            "16 bytes in 1 blocks are definitely lost in loss record 2 of 3",
            &[("abc_test.c", 3)],
        );
        let xml = report_xml(&[a.clone(), b, a]);
        let findings = parse(&xml, 10, &internal()).unwrap();
        assert_that!(findings.len()).is_equal_to(2);
        assert_that!(findings[0].name.as_str()).is_equal_to("Memory leak 1");
        assert_that!(findings[0].stacktrace.as_str()).is_equal_to("abc_test.c:7");
        assert_that!(findings[0].message.as_str())
            .is_equal_to("8 bytes in 1 blocks are definitely lost (x2)");
        assert_that!(findings[1].name.as_str()).is_equal_to("Memory leak 2");
        assert_that!(findings[1].message.as_str())
            .is_equal_to("16 bytes in 1 blocks are definitely lost");
    }

    #[test]
    fn test_findings_only_in_harness_internals_are_dropped() {
        let e = error_xml(LOST, &[("vg_replace_malloc.c", 299), ("unity.c", 1200)]);
        let findings = parse(&report_xml(&[e]), 10, &internal()).unwrap();
        assert_that!(findings).is_empty();
    }

    #[test]
    fn test_frames_without_file_are_skipped() {
        let e = "<error><kind>Leak_DefinitelyLost</kind><xwhat><text>lost</text></xwhat><stack><frame><ip>0x1</ip><obj>/lib/libc.so</obj></frame><frame><file>abc_test.c</file><line>2</line></frame></stack></error>".to_string();
        let findings = parse(&report_xml(&[e]), 10, &internal()).unwrap();
        assert_that!(findings.len()).is_equal_to(1);
        assert_that!(findings[0].line).is_equal_to(2);
    }

    #[test]
    fn test_allocation_in_harness_code_gets_hint() {
        let e = error_xml(LOST, &[("abc_test.c", 25)]);
        let findings = parse(&report_xml(&[e]), 10, &internal()).unwrap();
        assert_that!(findings[0].stacktrace.as_str()).is_equal_to(HINT_ALLOCATED_BY_HARNESS);
        assert_that!(findings[0].line).is_equal_to(25);
    }

    #[test]
    fn test_what_is_used_without_xwhat() {
        let e = "<error><kind>InvalidRead</kind><what>Invalid read of size 4</what><stack><frame><file>abc_test.c</file><line>5</line></frame></stack></error>".to_string();
        let findings = parse(&report_xml(&[e]), 10, &internal()).unwrap();
        assert_that!(findings[0].message.as_str()).is_equal_to("Invalid read of size 4");
    }

    #[test]
    fn test_empty_and_invalid_reports() {
        assert_that!(parse(&report_xml(&[]), 10, &internal()).unwrap()).is_empty();
        assert_that!(parse("<testsuites/>", 10, &internal())).is_err();
        assert_that!(parse("not xml", 10, &internal())).is_err();
    }

    fn finding(n: u32) -> MemoryFinding {
        MemoryFinding {
            name: format!("Memory leak {n}"),
            file: "abc_test.c".to_string(),
            line: n,
            stacktrace: format!("abc_test.c:{n}"),
            message: "lost".to_string(),
            occurrences: 1,
        }
    }

    #[test]
    fn test_attach_enumerates_when_nothing_fails() {
        let mut report = TestReport::default();
        attach_findings(&mut report, vec![finding(1), finding(2)]);
        assert_that!(report.stats.tests).is_equal_to(2);
        assert_that!(report.stats.failures).is_equal_to(2);
        assert_that!(report.tests.len()).is_equal_to(2);
        assert_that!(report.tests[1].name.as_str()).is_equal_to("Memory leak 2");
    }

    #[test]
    fn test_attach_uses_placeholder_when_tests_fail() {
        let mut report = TestReport {
            stats: TestStats {
                tests: 2,
                failures: 1,
                ..Default::default()
            },
            tests: vec![
                TestCase {
                    name: "ok".to_string(),
                    file: None,
                    line: None,
                    time: 0.0,
                    failure: None,
                },
                TestCase {
                    name: "bad".to_string(),
                    file: None,
                    line: None,
                    time: 0.0,
                    failure: Some(Failure {
                        stacktrace: String::new(),
                        message: "bad".to_string(),
                    }),
                },
            ],
        };
        attach_findings(&mut report, vec![finding(1), finding(2), finding(3)]);
        assert_that!(report.stats.tests).is_equal_to(3);
        assert_that!(report.stats.failures).is_equal_to(2);
        assert_that!(report.tests.len()).is_equal_to(3);
        assert_that!(report.tests[2].name.as_str()).is_equal_to(PLACEHOLDER_CASE_NAME);
    }

    #[test]
    fn test_attach_without_findings_is_noop() {
        let mut report = TestReport::default();
        attach_findings(&mut report, vec![]);
        assert_that!(report).is_equal_to(TestReport::default());
    }
}
