use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use toml;

use crate::error::Error;
use crate::utils::{path_absolute_join, path_absolute_parent, path_join};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Settings {
    pub name: String,

    pub log: LoggingSettings,
    pub workspace: WorkspaceSettings,
    pub sandbox: SandboxSettings,
    pub compiled: CompiledSettings,

    /// Profiles for interpreted languages, keyed by the language name.
    pub interpreted: BTreeMap<String, InterpretedSettings>,

    #[serde(skip)]
    pub reldir: String,
}

/// Logging settings
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggingSettings {
    /// Directory where to store log messages
    pub dir: String,

    /// Whether to output debug messages.
    pub verbose: bool,
}

/// Where and how ephemeral workspaces are created.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkspaceSettings {
    /// Directory under which every execution creates its own token named
    /// workspace.
    pub dir: String,

    /// If the grader itself runs inside a container, this is where the
    /// workspace directory is located on the machine running the sandbox
    /// engine. Bind mounts use this path as their source.
    #[serde(default)]
    pub mount_source_dir: Option<String>,

    /// The name that a harness uses to refer to the submission under test.
    /// Replaced by the workspace token when staging.
    #[serde(default = "default_self_reference")]
    pub self_reference: String,
}

fn default_self_reference() -> String {
    "moduletotest".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    /// A throwaway container per execution.
    Podman,
    /// User namespace sandbox without a container image.
    Firejail,
}

/// Settings for the sandbox that untrusted code runs in.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SandboxSettings {
    pub kind: SandboxKind,

    /// Binary used for the sandbox, e.g. `podman`, `docker` or `firejail`.
    pub engine: String,

    /// The container image to run submissions in. Ignored by firejail.
    #[serde(default)]
    pub image: String,

    /// The directory inside the container where workspace files are mounted.
    #[serde(default = "default_mount_dir")]
    pub mount_dir: String,

    /// Wall-clock timeout enforcer. Must exit with code 124 when the wrapped
    /// command times out.
    #[serde(default = "default_timeout_bin")]
    pub timeout_bin: String,

    /// Extra seconds given to the host side backstop before it kills a
    /// process that the timeout enforcer failed to stop.
    #[serde(default = "default_backstop_grace")]
    pub backstop_grace_seconds: u64,

    /// Maximum number of bytes captured from stdout or stderr.
    #[serde(default = "default_max_output")]
    pub max_output: usize,

    /// Optional firejail profile.
    #[serde(default)]
    pub firejail_profile: Option<String>,
}

fn default_mount_dir() -> String {
    "/sandbox".to_string()
}
fn default_timeout_bin() -> String {
    "/usr/bin/timeout".to_string()
}
fn default_backstop_grace() -> u64 {
    10
}
fn default_max_output() -> usize {
    1024 * 1024
}

/// Settings for compiled-native submissions (C with the Unity framework).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CompiledSettings {
    /// Compiler command, without the source and output arguments.
    pub compiler: Vec<String>,

    /// Support sources compiled together with the submission.
    pub compile_sources: Vec<String>,

    /// Directory holding the vendored test framework sources.
    pub support_dir: String,

    /// Files copied from `support_dir` into every workspace.
    pub support_files: Vec<String>,

    /// Command that converts the raw result channel to JUnit XML. Receives
    /// `-r <workspace> -o <output file>` as trailing arguments.
    pub converter: Vec<String>,

    /// Source files that belong to the harness rather than to the student.
    /// Memory findings whose frames only point at these are discarded.
    pub harness_internal_files: Vec<String>,

    /// Memory instrumentation command. `{report}` is replaced by the XML
    /// report file name.
    pub memcheck: Vec<String>,

    /// Delete every source artifact from the workspace before running the
    /// compiled binary.
    #[serde(default)]
    pub strip_sources: bool,
}

/// Settings for an interpreted language.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InterpretedSettings {
    /// File extension of submissions and harnesses, without the dot.
    pub extension: String,

    /// Command run inside the sandbox. Understands the placeholders
    /// `{submission}`, `{harness}` and `{result}`.
    pub command: Vec<String>,

    /// Environment passed to the sandboxed process as `KEY=VALUE`.
    #[serde(default)]
    pub env: Vec<String>,
}

impl Settings {
    /// Loads settings from the specified path
    pub fn load(path: &str) -> Result<Self, Error> {
        let contents: String = std::fs::read_to_string(path)
            .inspect_err(|e| eprintln!("Could not load settings from \"{path}\": {e}"))?;
        let mut s = Self::from_toml_str(&contents, &path_absolute_parent(path)?)
            .inspect_err(|e| eprintln!("Error parsing settings from \"{path}\": {e}"))?;

        if let Ok(log_dir) = std::env::var("GRADER_LOG_DIR") {
            s.log.dir = log_dir;
        }
        if let Ok(truth_value) = std::env::var("GRADER_LOG_VERBOSE") {
            s.log.verbose = match truth_value.to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" => true,
                _ => false,
            };
        }
        if let Ok(workspace_dir) = std::env::var("GRADER_WORKSPACE_DIR") {
            s.workspace.dir = workspace_dir;
        }
        if let Ok(mount_source_dir) = std::env::var("GRADER_WORKSPACE_MOUNT_SOURCE_DIR") {
            s.workspace.mount_source_dir = Some(mount_source_dir);
        }
        if let Ok(kind) = std::env::var("GRADER_SANDBOX_KIND") {
            s.sandbox.kind = match kind.to_lowercase().as_str() {
                "podman" => SandboxKind::Podman,
                "firejail" => SandboxKind::Firejail,
                _ => {
                    return Err(Error::from(format!("Invalid sandbox kind \"{kind}\"")));
                }
            };
        }
        if let Ok(engine) = std::env::var("GRADER_SANDBOX_ENGINE") {
            s.sandbox.engine = engine;
        }
        if let Ok(image) = std::env::var("GRADER_SANDBOX_IMAGE") {
            s.sandbox.image = image;
        }

        Ok(s)
    }

    /// Parses settings from TOML contents. Relative paths are resolved
    /// against `reldir`.
    pub fn from_toml_str(contents: &str, reldir: &str) -> Result<Self, Error> {
        let mut s: Settings = toml::from_str(contents)?;

        s.reldir = reldir.to_string();
        s.log.dir = path_absolute_join(&s.reldir, &s.log.dir)?;
        s.workspace.dir = path_absolute_join(&s.reldir, &s.workspace.dir)?;
        s.compiled.support_dir = path_absolute_join(&s.reldir, &s.compiled.support_dir)?;

        if s.sandbox.engine.is_empty() {
            return Err(Error::from("sandbox.engine must not be empty"));
        }

        Ok(s)
    }

    /// Sets up logging for the current process.
    pub fn setup_logging(self: &Self, prockind: &str) -> Result<(), Error> {
        use log::LevelFilter::{Debug, Info};

        std::fs::create_dir_all(&self.log.dir).map_err(|e| {
            eprintln!(
                "Error creating directory {} for the log file: {}",
                &self.log.dir, e
            );
            e.to_string()
        })?;

        let path_logfile = path_join(&self.log.dir, "log.out")?;
        let prockind = prockind.to_string();
        fern::Dispatch::new()
            .format(move |out, message, record| {
                out.finish(format_args!(
                    "[{0} {1} ({4}-{5}) {2}:{3}] {6}",
                    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.target(),
                    record.line().unwrap_or(0),
                    prockind,
                    std::process::id(),
                    message
                ))
            })
            .level(if self.log.verbose { Debug } else { Info })
            .chain(std::io::stderr())
            .chain(
                fern::log_file(&path_logfile).inspect_err(|e| {
                    eprintln!("Error setting up log file {}: {}", &path_logfile, e)
                })?,
            )
            .apply()?;
        Ok(())
    }
}
