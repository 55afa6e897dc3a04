use super::{Submission, TimeoutSpec};
use crate::{
    error::Error,
    sandbox::{self, Mount, SandboxCommand},
    settings::{InterpretedSettings, Settings},
    workspace::{StagedFile, Workspace, MODE_READ_ONLY, MODE_SANDBOX_WRITABLE},
};

const JUNIT_REPORT: &str = "_results.xml";

/// Runs submissions in interpreted languages with a test framework that
/// writes JUnit XML by itself.
pub struct InterpretedRunner<'a> {
    settings: &'a Settings,
    profile: &'a InterpretedSettings,
}

impl<'a> InterpretedRunner<'a> {
    pub fn new(settings: &'a Settings, profile: &'a InterpretedSettings) -> Self {
        InterpretedRunner {
            settings: settings,
            profile: profile,
        }
    }

    fn submission_file(&self, ws: &Workspace) -> String {
        ws.artifact(&format!(".{}", self.profile.extension))
    }

    fn harness_file(&self, ws: &Workspace) -> String {
        ws.artifact(&format!("_test.{}", self.profile.extension))
    }

    pub async fn stage(&self, ws: &Workspace, submission: &Submission) -> Result<(), Error> {
        let harness = submission
            .harness
            .replace(&self.settings.workspace.self_reference, ws.token());
        ws.stage(vec![
            StagedFile::Contents(self.submission_file(ws), submission.source.clone()),
            StagedFile::Contents(self.harness_file(ws), harness),
            StagedFile::Contents(ws.artifact(JUNIT_REPORT), String::new()),
        ])
        .await?;

        ws.set_mode(
            &[self.submission_file(ws), self.harness_file(ws)],
            MODE_READ_ONLY,
        )
        .await?;
        ws.set_mode(&[ws.artifact(JUNIT_REPORT)], MODE_SANDBOX_WRITABLE)
            .await
    }

    pub fn run_command(&self, ws: &Workspace, timeout: TimeoutSpec) -> SandboxCommand {
        let sandbox = &self.settings.sandbox;
        let submission = sandbox::file_path(sandbox, ws, &self.submission_file(ws));
        let harness = sandbox::file_path(sandbox, ws, &self.harness_file(ws));
        let result = sandbox::file_path(sandbox, ws, &ws.artifact(JUNIT_REPORT));

        SandboxCommand {
            mounts: vec![
                Mount::read_only(self.submission_file(ws)),
                Mount::read_only(self.harness_file(ws)),
                Mount::writable(ws.artifact(JUNIT_REPORT)),
            ],
            env: self.profile.env.clone(),
            timeout_seconds: timeout.seconds(),
            program: self
                .profile
                .command
                .iter()
                .map(|arg| {
                    arg.replace("{submission}", &submission)
                        .replace("{harness}", &harness)
                        .replace("{result}", &result)
                })
                .collect(),
        }
    }

    pub async fn seal(&self, ws: &Workspace) -> Result<(), Error> {
        ws.set_mode(&[ws.artifact(JUNIT_REPORT)], MODE_READ_ONLY)
            .await
    }

    /// The framework already wrote JUnit XML. An empty file means that it
    /// never got to report anything.
    pub async fn convert(&self, ws: &Workspace) -> Result<Option<String>, Error> {
        Ok(ws
            .read(&ws.artifact(JUNIT_REPORT))
            .await?
            .filter(|xml| !xml.trim().is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{runner::ExecuteOptions, runner::Language, settings::tests::EXAMPLE_SETTINGS};
    use asserting::prelude::*;

    #[tokio::test]
    async fn test_stage_and_command() {
        let root = tempfile::tempdir().unwrap();
        let settings =
            Settings::from_toml_str(EXAMPLE_SETTINGS, root.path().to_str().unwrap()).unwrap();
        let runner = InterpretedRunner::new(&settings, &settings.interpreted["python"]);
        let ws = Workspace::create(&settings.workspace, "tok").await.unwrap();

        runner
            .stage(
                &ws,
                &Submission {
                    source: "def add(a, b):\n    return a + b\n".to_string(),
                    harness: "from moduletotest import add\n".to_string(),
                    language: Language::Python,
                    options: ExecuteOptions::default(),
                },
            )
            .await
            .unwrap();
        assert_that!(ws.read("tok_test.py").await.unwrap())
            .is_equal_to(Some("from tok import add\n".to_string()));
        assert_that!(ws.read("tok.py").await.unwrap().unwrap()).starts_with("def add");

        let cmd = runner.run_command(&ws, TimeoutSpec::parse("7s").unwrap());
        assert_that!(cmd.timeout_seconds).is_equal_to(7);
        assert_that!(cmd.env).is_equal_to(vec!["PYTHONDONTWRITEBYTECODE=1".to_string()]);
        assert_that!(cmd.program).is_equal_to(
            [
                "python3",
                "-m",
                "pytest",
                "-p",
                "no:cacheprovider",
                "--junitxml",
                "/sandbox/tok_results.xml",
                "/sandbox/tok_test.py",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<String>>(),
        );
        assert_that!(cmd.mounts).is_equal_to(vec![
            Mount::read_only("tok.py"),
            Mount::read_only("tok_test.py"),
            Mount::writable("tok_results.xml"),
        ]);

        // Nothing was written to the result file.
        assert_that!(runner.convert(&ws).await.unwrap()).is_none();
    }
}
