use nix::sys::signal::Signal;
use regex::Regex;
use std::{path::Path, time::Duration};

use super::{CompileOutput, Submission, TimeoutSpec};
use crate::{
    error::Error,
    memcheck,
    report::MemoryFinding,
    sandbox::{self, Mount, SandboxCommand},
    settings::Settings,
    utils::{syscommand_async, SyscommandSettings},
    workspace::{StagedFile, Workspace, MODE_READ_ONLY, MODE_SANDBOX_WRITABLE},
};

/// Name of the entry point of a submission once it has been disabled.
const DISABLED_MAIN: &str = "disabled_main";

/// Suffixes of the artifacts of one execution.
const SOURCE: &str = "_test.c";
const RESULT_CHANNEL: &str = ".testresults";
const BINARY: &str = ".bin";
const JUNIT_REPORT: &str = "_results.xml";
const MEMCHECK_REPORT: &str = "_memcheck.xml";
/// Where the functional results wait while the instrumented run reuses the
/// result channel.
const RESULT_BACKUP: &str = ".testresults.functional";

/// Runs C submissions tested with Unity. The harness is appended to the
/// submission and compiled on the host. Inside the sandbox only the binary
/// and the result channel are visible.
pub struct CompiledRunner<'a> {
    settings: &'a Settings,
}

/// Renames the first `main` definition so the harness can provide its own.
pub fn disable_main(source: &str) -> Result<String, Error> {
    let re = Regex::new(r"(?i)([ \t\n])main[^a-zA-Z]*\(")?;
    Ok(re
        .replace(source, format!("${{1}}{DISABLED_MAIN}("))
        .into_owned())
}

/// Builds the single translation unit that is compiled: the rewritten
/// submission, the result channel path, then the harness.
pub fn combine_sources(
    source: &str,
    harness: &str,
    self_reference: &str,
    token: &str,
) -> Result<String, Error> {
    let source = disable_main(source)?.replace(self_reference, token);
    let harness = harness.replace(self_reference, token);
    Ok(format!(
        "{source}\nconst char __TEST_FILE_PATH[] = \"{token}{RESULT_CHANNEL}\";\n{harness}"
    ))
}

impl<'a> CompiledRunner<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        CompiledRunner { settings: settings }
    }

    /// Everything that is compiled, and therefore must not change.
    fn sources(&self, ws: &Workspace) -> Vec<String> {
        let mut names = vec![ws.artifact(SOURCE)];
        names.extend(self.settings.compiled.support_files.iter().cloned());
        names
    }

    pub async fn stage(&self, ws: &Workspace, submission: &Submission) -> Result<(), Error> {
        let combined = combine_sources(
            &submission.source,
            &submission.harness,
            &self.settings.workspace.self_reference,
            ws.token(),
        )?;

        let mut files = vec![
            StagedFile::Contents(ws.artifact(SOURCE), combined),
            StagedFile::Contents(ws.artifact(RESULT_CHANNEL), String::new()),
        ];
        files.extend(self.settings.compiled.support_files.iter().map(|f| {
            StagedFile::Copy(
                f.to_owned(),
                Path::new(&self.settings.compiled.support_dir).join(f),
            )
        }));
        ws.stage(files).await?;

        ws.set_mode(&self.sources(ws), MODE_READ_ONLY).await?;
        ws.set_mode(&[ws.artifact(RESULT_CHANNEL)], MODE_SANDBOX_WRITABLE)
            .await
    }

    pub async fn compile(
        &self,
        ws: &Workspace,
        timeout: TimeoutSpec,
        debug_info: bool,
    ) -> Result<CompileOutput, Error> {
        let mut cmd: Vec<String> = vec![
            self.settings.sandbox.timeout_bin.to_owned(),
            timeout.to_string(),
        ];
        cmd.extend(self.settings.compiled.compiler.iter().cloned());
        if debug_info {
            cmd.push("-g".to_string());
        }
        cmd.extend(self.settings.compiled.compile_sources.iter().cloned());
        cmd.push(ws.artifact(SOURCE));
        cmd.push("-o".to_string());
        cmd.push(ws.artifact(BINARY));
        log::debug!("Compile command: {cmd:?}");

        let ret = syscommand_async(
            cmd,
            SyscommandSettings {
                timeout: Duration::from_secs(
                    timeout.seconds() + self.settings.sandbox.backstop_grace_seconds,
                ),
                cwd: Some(ws.dir().to_path_buf()),
                max_stdout_length: Some(self.settings.sandbox.max_output),
                max_stderr_length: Some(self.settings.sandbox.max_output),
                ..Default::default()
            },
        )
        .await;

        match ret {
            Ok(output) => Ok(CompileOutput {
                code: output.code,
                stdout: output.stdout,
                stderr: output.stderr,
            }),
            // A compiler that has to be killed by the host counts as a failed
            // compilation, just like one stopped by the timeout enforcer.
            Err(Error::SyscommandTimeoutError { stdout, stderr }) => {
                log::warn!("Compiler outlived its timeout, killed by the host");
                Ok(CompileOutput {
                    code: crate::classify::TIMEOUT_EXIT_CODE,
                    stdout: stdout.unwrap_or_default(),
                    stderr: stderr.unwrap_or_default(),
                })
            }
            // Diagnostics past the cap are cut off, not dropped.
            Err(Error::SyscommandOutputLimitExceededError {
                limit,
                stdout,
                stderr,
            }) => {
                log::warn!("Compiler output exceeded {limit} bytes, killed by the host");
                Ok(CompileOutput {
                    code: 128 + Signal::SIGKILL as i32,
                    stdout: stdout.unwrap_or_default(),
                    stderr: format!(
                        "{}\nCompiler output exceeded {limit} bytes and was cut off.\n",
                        stderr.unwrap_or_default()
                    ),
                })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn prepare_run(&self, ws: &Workspace) -> Result<(), Error> {
        if self.settings.compiled.strip_sources {
            log::debug!("Removing sources from {}", ws.dir().display());
            ws.remove_files(&self.sources(ws)).await?;
        }
        Ok(())
    }

    pub fn run_command(&self, ws: &Workspace, timeout: TimeoutSpec) -> SandboxCommand {
        SandboxCommand {
            mounts: vec![
                Mount::read_only(ws.artifact(BINARY)),
                Mount::writable(ws.artifact(RESULT_CHANNEL)),
            ],
            env: vec![],
            timeout_seconds: timeout.seconds(),
            program: vec![sandbox::file_path(
                &self.settings.sandbox,
                ws,
                &ws.artifact(BINARY),
            )],
        }
    }

    pub async fn seal(&self, ws: &Workspace) -> Result<(), Error> {
        ws.set_mode(&[ws.artifact(RESULT_CHANNEL)], MODE_READ_ONLY)
            .await
    }

    /// Runs the binary again under the memory checker and collects what it
    /// found. The functional results are kept aside during the re-run.
    pub async fn memcheck(
        &self,
        ws: &Workspace,
        submission: &Submission,
        timeout: TimeoutSpec,
    ) -> Result<Vec<MemoryFinding>, Error> {
        let results = ws.artifact(RESULT_CHANNEL);
        let backup = ws.artifact(RESULT_BACKUP);
        let report = ws.artifact(MEMCHECK_REPORT);

        ws.rename(&results, &backup).await?;
        ws.stage(vec![
            StagedFile::Contents(results.clone(), String::new()),
            StagedFile::Contents(report.clone(), String::new()),
        ])
        .await?;
        ws.set_mode(&[&results, &report], MODE_SANDBOX_WRITABLE)
            .await?;

        let report_path = sandbox::file_path(&self.settings.sandbox, ws, &report);
        let mut program: Vec<String> = self
            .settings
            .compiled
            .memcheck
            .iter()
            .map(|arg| arg.replace("{report}", &report_path))
            .collect();
        program.push(sandbox::file_path(
            &self.settings.sandbox,
            ws,
            &ws.artifact(BINARY),
        ));

        log::info!("Running memory check in sandbox {}", ws.token());
        let outcome = sandbox::run(
            &self.settings.sandbox,
            ws,
            &SandboxCommand {
                mounts: vec![
                    Mount::read_only(ws.artifact(BINARY)),
                    Mount::writable(results.clone()),
                    Mount::writable(report.clone()),
                ],
                env: vec![],
                timeout_seconds: timeout.seconds(),
                program: program,
            },
        )
        .await?;
        log::debug!("Memory check exited with code {}", outcome.code);

        ws.remove_files(&[&results]).await?;
        ws.rename(&backup, &results).await?;
        ws.set_mode(&[&results, &report], MODE_READ_ONLY).await?;

        let xml = ws.read(&report).await?.unwrap_or_default();
        if xml.trim().is_empty() {
            log::warn!("Memory check did not produce a report");
            return Ok(vec![]);
        }
        memcheck::parse(
            &xml,
            submission.source.lines().count(),
            &self.settings.compiled.harness_internal_files,
        )
        .or_else(|e| {
            log::warn!("Could not parse memory check report: {e}");
            Ok(vec![])
        })
    }

    pub async fn convert(&self, ws: &Workspace) -> Result<Option<String>, Error> {
        let junit = ws.artifact(JUNIT_REPORT);
        let mut cmd: Vec<String> = self.settings.compiled.converter.clone();
        cmd.push("-r".to_string());
        cmd.push(ws.dir().to_string_lossy().into_owned());
        cmd.push("-o".to_string());
        cmd.push(junit.clone());
        log::debug!("Convert command: {cmd:?}");

        let output = syscommand_async(
            cmd,
            SyscommandSettings {
                cwd: Some(ws.dir().to_path_buf()),
                max_stdout_length: Some(self.settings.sandbox.max_output),
                max_stderr_length: Some(self.settings.sandbox.max_output),
                ..Default::default()
            },
        )
        .await?;
        if output.code != 0 {
            log::warn!(
                "Converter exited with code {}: {}",
                output.code,
                output.stderr
            );
        }

        Ok(ws.read(&junit).await?.filter(|xml| !xml.trim().is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asserting::prelude::*;

    #[test]
    fn test_disable_main() {
        assert_that!(disable_main("int x;\nint main(void) {\n}").unwrap())
            .is_equal_to("int x;\nint disabled_main(void) {\n}");
        assert_that!(disable_main("int\nmain (int argc, char **argv)").unwrap())
            .is_equal_to("int\ndisabled_main(int argc, char **argv)");
        assert_that!(disable_main("void\tMAIN(){}").unwrap()).is_equal_to("void\tdisabled_main(){}");
        // Only the first definition is renamed.
        assert_that!(disable_main(" main() main()").unwrap()).is_equal_to(" disabled_main() main()");
        // Identifiers merely containing main are left alone.
        assert_that!(disable_main("int domain(void);").unwrap()).is_equal_to("int domain(void);");
        assert_that!(disable_main("int main_loop(void);").unwrap())
            .is_equal_to("int main_loop(void);");
    }

    #[test]
    fn test_combine_sources() {
        let combined = combine_sources(
            "int add(int a, int b) { return a + b; }\nint main() { return add(1, 2); }\n",
            "#include \"moduletotest.h\"\nvoid test_add(void) {}\n",
            "moduletotest",
            "tok",
        )
        .unwrap();
        assert_that!(combined).is_equal_to(
            "int add(int a, int b) { return a + b; }\nint disabled_main() { return add(1, 2); }\n\
             \nconst char __TEST_FILE_PATH[] = \"tok.testresults\";\n\
             #include \"tok.h\"\nvoid test_add(void) {}\n"
                .to_string(),
        );
    }
}
