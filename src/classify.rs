use nix::sys::signal::Signal;
use serde::Serialize;

/// Exit code of the timeout enforcer when it had to stop the wrapped command.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Signals that mean the submission died rather than finished.
const FAULT_SIGNALS: [Signal; 7] = [
    Signal::SIGILL,
    Signal::SIGABRT,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGKILL,
    Signal::SIGSEGV,
    Signal::SIGSYS,
];

/// The signal that terminated a crashed submission.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashSignal {
    pub signal: i32,
    pub name: &'static str,
}

/// How a sandboxed run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The process ran to completion with the given exit code. A non-zero
    /// code may just mean that some tests failed.
    Completed(i32),
    TimedOut,
    Crashed(CrashSignal),
}

/// Everything observed about one sandboxed process.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub code: i32,
    pub status: RunStatus,
    pub stdout: String,
    pub stderr: String,
    /// Set when the wall clock limit was hit, either by the enforcer or by
    /// the host side backstop.
    pub timed_out: bool,
}

impl ExecutionOutcome {
    pub fn from_exit(code: i32, stdout: String, stderr: String) -> Self {
        let status = classify(code);
        ExecutionOutcome {
            code: code,
            status: status,
            stdout: stdout,
            stderr: stderr,
            timed_out: status == RunStatus::TimedOut,
        }
    }

    /// The host side backstop killed the process before it exited.
    pub fn backstop_timeout(stdout: String, stderr: String) -> Self {
        Self::from_exit(TIMEOUT_EXIT_CODE, stdout, stderr)
    }
}

/// Maps an exit code to a run status.
///
/// Codes above 128 follow the shell convention of `128 + signal`.
pub fn classify(code: i32) -> RunStatus {
    if code == TIMEOUT_EXIT_CODE {
        return RunStatus::TimedOut;
    }
    if code > 128 {
        if let Ok(sig) = Signal::try_from(code - 128) {
            if FAULT_SIGNALS.contains(&sig) {
                return RunStatus::Crashed(CrashSignal {
                    signal: sig as i32,
                    name: sig.as_str(),
                });
            }
        }
    }
    RunStatus::Completed(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use asserting::prelude::*;

    #[test]
    fn test_timeout() {
        assert_that!(classify(124)).is_equal_to(RunStatus::TimedOut);
        let o = ExecutionOutcome::from_exit(124, "partial".to_string(), String::new());
        assert_that!(o.timed_out).is_true();
    }

    #[test]
    fn test_segfault() {
        assert_that!(classify(139)).is_equal_to(RunStatus::Crashed(CrashSignal {
            signal: 11,
            name: "SIGSEGV",
        }));
    }

    #[test]
    fn test_other_fault_signals() {
        for (code, name) in [(134, "SIGABRT"), (136, "SIGFPE"), (135, "SIGBUS"), (137, "SIGKILL")] {
            match classify(code) {
                RunStatus::Crashed(c) => {
                    assert_that!(c.name).is_equal_to(name);
                }
                other => panic!("{code} classified as {other:?}"),
            }
        }
    }

    #[test]
    fn test_regular_exit_codes() {
        assert_that!(classify(0)).is_equal_to(RunStatus::Completed(0));
        assert_that!(classify(1)).is_equal_to(RunStatus::Completed(1));
        assert_that!(classify(125)).is_equal_to(RunStatus::Completed(125));
        // SIGTERM and SIGINT are not faults of the submission.
        assert_that!(classify(143)).is_equal_to(RunStatus::Completed(143));
        assert_that!(classify(130)).is_equal_to(RunStatus::Completed(130));
    }

    #[test]
    fn test_backstop_counts_as_timeout() {
        let o = ExecutionOutcome::backstop_timeout(String::new(), String::new());
        assert_that!(o.status).is_equal_to(RunStatus::TimedOut);
        assert_that!(o.code).is_equal_to(TIMEOUT_EXIT_CODE);
    }
}
