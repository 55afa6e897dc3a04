pub mod compiled;
pub mod interpreted;

use derive_more::derive::Display;
use regex::Regex;
use serde::Serialize;
use std::str::FromStr;

use crate::{
    classify::{CrashSignal, ExecutionOutcome, RunStatus},
    diagnostics::{self, CompileDiagnostic},
    error::Error,
    junit, memcheck,
    report::{MemoryFinding, TestReport},
    sandbox::{self, SandboxCommand},
    sanitize::{Sanitize, Sanitizer},
    settings::Settings,
    token::{RandomTokens, TokenSource},
    workspace::Workspace,
};

use compiled::CompiledRunner;
use interpreted::InterpretedRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Language {
    #[display("c")]
    C,
    #[display("python")]
    Python,
    #[display("javascript")]
    JavaScript,
}

impl Language {
    pub fn is_compiled(&self) -> bool {
        matches!(self, Language::C)
    }
}

impl FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "c" => Ok(Language::C),
            "python" => Ok(Language::Python),
            "javascript" => Ok(Language::JavaScript),
            _ => Err(Error::from(format!("Unsupported language \"{s}\""))),
        }
    }
}

/// A validated wall-clock limit, written as one or two digits followed by
/// `s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display("{seconds}s")]
pub struct TimeoutSpec {
    seconds: u64,
}

impl TimeoutSpec {
    pub fn parse(s: &str) -> Result<Self, Error> {
        if !Regex::new(r"^[0-9]{1,2}s$")?.is_match(s) {
            return Err(Error::TimeoutFormatError(s.to_string()));
        }
        let seconds = s
            .trim_end_matches('s')
            .parse::<u64>()
            .map_err(|_| Error::TimeoutFormatError(s.to_string()))?;
        Ok(TimeoutSpec { seconds: seconds })
    }

    pub fn seconds(&self) -> u64 {
        self.seconds
    }
}

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub timeout: String,
    pub use_memcheck: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        ExecuteOptions {
            timeout: "5s".to_string(),
            use_memcheck: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub source: String,
    pub harness: String,
    pub language: Language,
    pub options: ExecuteOptions,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", content = "data")]
pub enum Outcome {
    Success(TestReport),
    CompileFailure(Vec<CompileDiagnostic>),
    Timeout,
    Crash(CrashSignal),
    ReportUnavailable,
}

/// What an execution returns to the caller. All text is sanitized.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub outcome: Outcome,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionResult {
    fn new(outcome: Outcome, stdout: String, stderr: String) -> Self {
        ExecutionResult {
            outcome: outcome,
            stdout: stdout,
            stderr: stderr,
        }
    }

    fn from_run(outcome: Outcome, run: ExecutionOutcome) -> Self {
        Self::new(outcome, run.stdout, run.stderr)
    }
}

impl Sanitize for Outcome {
    fn sanitize(&mut self, sanitizer: &Sanitizer) {
        match self {
            Outcome::Success(report) => report.sanitize(sanitizer),
            Outcome::CompileFailure(diags) => diags.sanitize(sanitizer),
            Outcome::Timeout | Outcome::Crash(_) | Outcome::ReportUnavailable => {}
        }
    }
}

impl Sanitize for ExecutionResult {
    fn sanitize(&mut self, sanitizer: &Sanitizer) {
        self.outcome.sanitize(sanitizer);
        self.stdout.sanitize(sanitizer);
        self.stderr.sanitize(sanitizer);
    }
}

/// Output of a host side compilation.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// The language specific part of the pipeline.
pub enum Runner<'a> {
    Compiled(CompiledRunner<'a>),
    Interpreted(InterpretedRunner<'a>),
}

impl<'a> Runner<'a> {
    pub fn select(settings: &'a Settings, language: Language) -> Result<Self, Error> {
        if language.is_compiled() {
            return Ok(Runner::Compiled(CompiledRunner::new(settings)));
        }
        let profile = settings
            .interpreted
            .get(&language.to_string())
            .ok_or_else(|| Error::from(format!("No interpreter profile for {language}")))?;
        Ok(Runner::Interpreted(InterpretedRunner::new(settings, profile)))
    }

    /// Writes every artifact and applies the pre-run permissions.
    pub async fn stage(&self, ws: &Workspace, submission: &Submission) -> Result<(), Error> {
        match self {
            Runner::Compiled(r) => r.stage(ws, submission).await,
            Runner::Interpreted(r) => r.stage(ws, submission).await,
        }
    }

    /// Builds the program. `None` means there is nothing to compile.
    pub async fn compile(
        &self,
        ws: &Workspace,
        timeout: TimeoutSpec,
        debug_info: bool,
    ) -> Result<Option<CompileOutput>, Error> {
        match self {
            Runner::Compiled(r) => r.compile(ws, timeout, debug_info).await.map(Some),
            Runner::Interpreted(_) => Ok(None),
        }
    }

    /// Last preparations before untrusted code runs.
    pub async fn prepare_run(&self, ws: &Workspace) -> Result<(), Error> {
        match self {
            Runner::Compiled(r) => r.prepare_run(ws).await,
            Runner::Interpreted(_) => Ok(()),
        }
    }

    pub fn run_command(&self, ws: &Workspace, timeout: TimeoutSpec) -> SandboxCommand {
        match self {
            Runner::Compiled(r) => r.run_command(ws, timeout),
            Runner::Interpreted(r) => r.run_command(ws, timeout),
        }
    }

    /// Makes the result channel read-only again once the sandbox is gone.
    pub async fn seal(&self, ws: &Workspace) -> Result<(), Error> {
        match self {
            Runner::Compiled(r) => r.seal(ws).await,
            Runner::Interpreted(r) => r.seal(ws).await,
        }
    }

    pub async fn memcheck(
        &self,
        ws: &Workspace,
        submission: &Submission,
        timeout: TimeoutSpec,
    ) -> Result<Vec<MemoryFinding>, Error> {
        match self {
            Runner::Compiled(r) => r.memcheck(ws, submission, timeout).await,
            Runner::Interpreted(_) => {
                log::debug!("Memory checking is only available for compiled languages");
                Ok(vec![])
            }
        }
    }

    /// Produces the JUnit XML report, if the run left anything to convert.
    pub async fn convert(&self, ws: &Workspace) -> Result<Option<String>, Error> {
        match self {
            Runner::Compiled(r) => r.convert(ws).await,
            Runner::Interpreted(r) => r.convert(ws).await,
        }
    }
}

/// Executes a submission with freshly generated tokens.
pub async fn execute(
    settings: &Settings,
    submission: &Submission,
) -> Result<ExecutionResult, Error> {
    execute_with_tokens(settings, submission, &RandomTokens).await
}

/// Executes a submission in its own workspace.
///
/// Expected failures of the submission are reported through the returned
/// `Outcome`. An `Err` means that the grader itself could not do its job.
/// The workspace is removed before this returns, whatever the result.
pub async fn execute_with_tokens(
    settings: &Settings,
    submission: &Submission,
    tokens: &dyn TokenSource,
) -> Result<ExecutionResult, Error> {
    let timeout = TimeoutSpec::parse(&submission.options.timeout)?;
    let runner = Runner::select(settings, submission.language)?;

    let token = tokens.generate();
    let sanitizer = Sanitizer::new(token.as_str())?;
    let workspace = Workspace::create(&settings.workspace, &token).await?;

    let result = match drive(settings, &runner, &workspace, submission, timeout).await {
        Err(Error::SyscommandOutputLimitExceededError { limit, .. }) => {
            log::warn!("Submission exceeded the output limit of {limit} bytes");
            Ok(ExecutionResult::new(
                Outcome::ReportUnavailable,
                String::new(),
                format!("Output limit of {limit} bytes exceeded, the run was stopped.\n"),
            ))
        }
        other => other,
    };
    workspace.teardown().await;

    match result {
        Ok(mut result) => {
            result.sanitize(&sanitizer);
            Ok(result)
        }
        Err(mut e) => {
            e.sanitize(&sanitizer);
            Err(e)
        }
    }
}

/// stage -> compile -> run -> classify -> memcheck -> convert -> normalize
async fn drive(
    settings: &Settings,
    runner: &Runner<'_>,
    ws: &Workspace,
    submission: &Submission,
    timeout: TimeoutSpec,
) -> Result<ExecutionResult, Error> {
    log::info!(
        "Staging {} submission in {}",
        submission.language,
        ws.dir().display()
    );
    runner.stage(ws, submission).await?;

    if let Some(compiled) = runner
        .compile(ws, timeout, submission.options.use_memcheck)
        .await?
    {
        if compiled.code != 0 {
            log::info!("Compilation failed with code {}", compiled.code);
            return Ok(ExecutionResult::new(
                Outcome::CompileFailure(diagnostics::parse(&compiled.stderr)),
                compiled.stdout,
                compiled.stderr,
            ));
        }
    }

    runner.prepare_run(ws).await?;
    log::info!("Running submission in sandbox {}", ws.token());
    let run = sandbox::run(&settings.sandbox, ws, &runner.run_command(ws, timeout)).await?;
    runner.seal(ws).await?;
    log::debug!("Sandbox exited with code {}", run.code);

    match run.status {
        RunStatus::TimedOut => {
            log::info!("Submission timed out");
            return Ok(ExecutionResult::from_run(Outcome::Timeout, run));
        }
        RunStatus::Crashed(signal) => {
            log::info!("Submission crashed with {}", signal.name);
            return Ok(ExecutionResult::from_run(Outcome::Crash(signal), run));
        }
        RunStatus::Completed(_) => {}
    }

    let findings = if submission.options.use_memcheck {
        runner.memcheck(ws, submission, timeout).await?
    } else {
        vec![]
    };

    let Some(xml) = runner.convert(ws).await? else {
        log::info!("No test report was produced");
        return Ok(ExecutionResult::from_run(Outcome::ReportUnavailable, run));
    };

    match junit::parse(&xml) {
        Ok(mut report) => {
            memcheck::attach_findings(&mut report, findings);
            log::info!(
                "{} tests, {} unsuccessful",
                report.stats.tests,
                report.unsuccessful()
            );
            Ok(ExecutionResult::from_run(Outcome::Success(report), run))
        }
        Err(e) => {
            log::warn!("Could not parse test report: {e}");
            Ok(ExecutionResult::from_run(Outcome::ReportUnavailable, run))
        }
    }
}
