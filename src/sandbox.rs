use std::{path::PathBuf, time::Duration};

use crate::{
    classify::ExecutionOutcome,
    error::Error,
    settings::{SandboxKind, SandboxSettings},
    utils::{syscommand_async, SyscommandSettings},
    workspace::Workspace,
};

/// A workspace file made visible inside the sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    pub name: String,
    pub writable: bool,
}

impl Mount {
    pub fn read_only<S: Into<String>>(name: S) -> Self {
        Mount {
            name: name.into(),
            writable: false,
        }
    }

    pub fn writable<S: Into<String>>(name: S) -> Self {
        Mount {
            name: name.into(),
            writable: true,
        }
    }
}

/// One sandboxed invocation. Only the listed mounts are visible to the
/// program, and the network is always disabled.
#[derive(Debug, Clone)]
pub struct SandboxCommand {
    pub mounts: Vec<Mount>,
    /// Environment as `KEY=VALUE`.
    pub env: Vec<String>,
    pub timeout_seconds: u64,
    pub program: Vec<String>,
}

/// How the sandboxed program refers to a workspace file.
pub fn file_path(settings: &SandboxSettings, workspace: &Workspace, name: &str) -> String {
    match settings.kind {
        SandboxKind::Podman => format!("{}/{}", settings.mount_dir.trim_end_matches('/'), name),
        SandboxKind::Firejail => workspace.path(name).to_string_lossy().into_owned(),
    }
}

/// Builds the host command line and its working directory.
pub fn command_line(
    settings: &SandboxSettings,
    workspace: &Workspace,
    cmd: &SandboxCommand,
) -> (Vec<String>, Option<PathBuf>) {
    let name = workspace.token();
    let timeout = format!("{}s", cmd.timeout_seconds);
    match settings.kind {
        SandboxKind::Podman => {
            let mut argv: Vec<String> = vec![
                settings.engine.to_owned(),
                "run".to_string(),
                "--rm".to_string(),
                "--network".to_string(),
                "none".to_string(),
                "--name".to_string(),
                name.to_string(),
                "--hostname".to_string(),
                name.to_string(),
                "--workdir".to_string(),
                settings.mount_dir.to_owned(),
            ];
            for m in cmd.mounts.iter() {
                argv.push("-v".to_string());
                argv.push(format!(
                    "{}:{}:{},z",
                    workspace.mount_source(&m.name).display(),
                    file_path(settings, workspace, &m.name),
                    if m.writable { "rw" } else { "ro" }
                ));
            }
            for e in cmd.env.iter() {
                argv.push("--env".to_string());
                argv.push(e.to_owned());
            }
            argv.push("--entrypoint".to_string());
            argv.push(settings.timeout_bin.to_owned());
            argv.push(settings.image.to_owned());
            argv.push(timeout);
            argv.extend(cmd.program.iter().cloned());
            (argv, None)
        }
        SandboxKind::Firejail => {
            let mut argv: Vec<String> = vec![
                settings.timeout_bin.to_owned(),
                timeout,
                settings.engine.to_owned(),
                "--quiet".to_string(),
                "--force".to_string(),
                "--net=none".to_string(),
                format!("--name={name}"),
            ];
            if let Some(profile) = &settings.firejail_profile {
                argv.push(format!("--profile={profile}"));
            }
            for m in cmd.mounts.iter() {
                let path = workspace.path(&m.name);
                argv.push(format!("--whitelist={}", path.display()));
                argv.push(if m.writable {
                    format!("--read-write={}", path.display())
                } else {
                    format!("--read-only={}", path.display())
                });
            }
            for e in cmd.env.iter() {
                argv.push(format!("--env={e}"));
            }
            argv.extend(cmd.program.iter().cloned());
            (argv, Some(workspace.dir().to_path_buf()))
        }
    }
}

/// Runs a command in the sandbox and waits for it to finish.
///
/// The timeout enforcer inside the sandbox is expected to stop the program.
/// Should it fail to do so, the host kills the process after an additional
/// grace period and the run is reported as timed out.
pub async fn run(
    settings: &SandboxSettings,
    workspace: &Workspace,
    cmd: &SandboxCommand,
) -> Result<ExecutionOutcome, Error> {
    let (argv, cwd) = command_line(settings, workspace, cmd);
    log::debug!("Sandbox command: {argv:?}");

    let ret = syscommand_async(
        argv,
        SyscommandSettings {
            timeout: Duration::from_secs(cmd.timeout_seconds + settings.backstop_grace_seconds),
            cwd: cwd,
            max_stdout_length: Some(settings.max_output),
            max_stderr_length: Some(settings.max_output),
            ..Default::default()
        },
    )
    .await;

    match ret {
        Ok(output) => Ok(ExecutionOutcome::from_exit(
            output.code,
            output.stdout,
            output.stderr,
        )),
        Err(Error::SyscommandTimeoutError { stdout, stderr }) => {
            log::warn!(
                "Sandbox {} outlived its timeout, killed by the host",
                workspace.token()
            );
            if settings.kind == SandboxKind::Podman {
                force_rm(settings, workspace.token())
                    .await
                    .unwrap_or_else(|e| log::warn!("Could not remove container: {e}"));
            }
            Ok(ExecutionOutcome::backstop_timeout(
                stdout.unwrap_or_default(),
                stderr.unwrap_or_default(),
            ))
        }
        Err(e @ Error::SyscommandOutputLimitExceededError { .. }) => {
            log::warn!("Sandbox {} exceeded the output limit", workspace.token());
            if settings.kind == SandboxKind::Podman {
                force_rm(settings, workspace.token())
                    .await
                    .unwrap_or_else(|e| log::warn!("Could not remove container: {e}"));
            }
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// Force removal of a container
pub async fn force_rm(settings: &SandboxSettings, container_name: &str) -> Result<(), Error> {
    let output = syscommand_async(
        vec![
            settings.engine.to_owned(),
            "rm".to_string(),
            "-f".to_string(),
            container_name.to_string(),
        ],
        SyscommandSettings {
            max_stderr_length: Some(128 * 1024),
            ..Default::default()
        },
    )
    .await?;
    if output.code != 0 {
        return Err(Error::from(format!(
            "Error code {} when removing container {}: {}",
            output.code, container_name, output.stderr
        )));
    }

    Ok(())
}
