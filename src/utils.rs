use crate::error::Error;
use std::{
    ffi::OsString,
    io::Read,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use subprocess::{ExitStatus, Popen, PopenConfig, Redirection};

/// Joins two file system paths together.
pub fn path_join<A: AsRef<Path>, B: AsRef<Path>>(a: A, b: B) -> Result<String, Error> {
    a.as_ref()
        .join(b.as_ref())
        .to_str()
        .map(String::from)
        .ok_or(Error::from("Could not convert path to a string."))
}

/// Joins two file system paths together and returns the absolute path of the
/// result.
pub fn path_absolute_join<A: AsRef<Path>, B: AsRef<Path>>(a: A, b: B) -> Result<String, Error> {
    std::path::absolute(a.as_ref().join(b.as_ref()))?
        .to_str()
        .map(String::from)
        .ok_or(Error::from("Could not convert path to a string."))
}

/// Returns the absolute parent path of the provided string, which can succeed
/// even if the path doesn't exist.
pub fn path_absolute_parent<P: AsRef<Path>>(path: P) -> Result<String, Error> {
    std::path::absolute(path.as_ref())?
        .parent()
        .map(|e| e.to_owned())
        .and_then(|p| p.to_str().map(String::from))
        .ok_or(Error::from("Internal error: Could not get parent of path."))
}

/// Removes the first end-of-transmission marker (and a newline directly
/// following it) from captured output. Some container runtimes append one
/// when the attached streams are closed.
pub fn strip_eot<S: AsRef<str>>(s: S) -> String {
    let s = s.as_ref();
    match s.find('\x04') {
        Some(idx) => {
            let rest = &s[idx + 1..];
            let rest = rest.strip_prefix('\n').unwrap_or(rest);
            format!("{}{}", &s[..idx], rest)
        }
        None => s.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct SyscommandSettings {
    pub timeout: Duration,
    pub cwd: Option<PathBuf>,
    pub max_stdout_length: Option<usize>,
    pub max_stderr_length: Option<usize>,
}

impl Default for SyscommandSettings {
    fn default() -> Self {
        SyscommandSettings {
            timeout: Duration::from_secs(60),
            cwd: None,
            max_stdout_length: None,
            max_stderr_length: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyscommandOutput {
    /// Exit code of the process. A process terminated by a signal reports
    /// `128 + signal`, the same way a shell does.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a command with a timeout.
/// On success, returns code, stdout, and stderr.
///
/// Example, to run a simple command:
/// ```
/// use sandbox_grader::utils::{
///     syscommand_timeout, SyscommandSettings};
///
/// let ret = syscommand_timeout(
///     ["echo", "foo"],
///     SyscommandSettings::default()
/// ).unwrap();
///
/// println!("Returned {}", ret.code);
/// ```
pub fn syscommand_timeout<S: AsRef<str>, CmdList: AsRef<[S]>>(
    cmd: CmdList,
    cmd_settings: SyscommandSettings,
) -> Result<SyscommandOutput, Error> {
    let os_cmd: Vec<OsString> = cmd
        .as_ref()
        .iter()
        .map(|s| OsString::from(s.as_ref()))
        .collect();

    let mut handle = Popen::create(
        &os_cmd,
        PopenConfig {
            stdin: Redirection::None,
            stdout: if cmd_settings.max_stdout_length.is_some() {
                Redirection::Pipe
            } else {
                Redirection::None
            },
            stderr: if cmd_settings.max_stderr_length.is_some() {
                Redirection::Pipe
            } else {
                Redirection::None
            },
            cwd: cmd_settings.cwd.as_ref().map(|p| p.as_os_str().to_owned()),
            ..Default::default()
        },
    )
    .map_err(|e| Error::from(format!("Could not create Popen process: {e}")))?;

    let mut buf_stdout: Vec<u8> = vec![];
    let mut buf_stderr: Vec<u8> = vec![];

    let end_time = SystemTime::now()
        .checked_add(cmd_settings.timeout)
        .unwrap_or_else(SystemTime::now);

    /// A wrapped function that reads stdout and stderr as the process is
    /// running. This is used to ensure that the process is killed even if
    /// something goes wrong with the IO.
    fn wrapped_read_and_wait(
        handle: &mut Popen,
        buf_stdout: &mut Vec<u8>,
        buf_stderr: &mut Vec<u8>,
        end_time: SystemTime,
        max_stdout_length: usize,
        max_stderr_length: usize,
    ) -> Result<Option<ExitStatus>, Error> {
        static BUFFER_SIZE: usize = 4096;
        static EVENT_CAPACITY: usize = 1024;

        let mut read_buf = [0u8; BUFFER_SIZE];

        let mut poll = mio::Poll::new()
            .inspect_err(|e| log::error!("Received error when creating poll instance: {e}"))?;
        let mut events = mio::Events::with_capacity(EVENT_CAPACITY);

        if let Some(f) = &handle.stdout {
            poll.registry()
                .register(
                    &mut mio::unix::SourceFd(&f.as_raw_fd()),
                    mio::Token(1),
                    mio::Interest::READABLE,
                )
                .inspect_err(|e| log::error!("Received error when registering stdout: {e}"))?;
        }
        if let Some(f) = &handle.stderr {
            poll.registry()
                .register(
                    &mut mio::unix::SourceFd(&f.as_raw_fd()),
                    mio::Token(2),
                    mio::Interest::READABLE,
                )
                .inspect_err(|e| log::error!("Received error when registering stderr: {e}"))?;
        }

        let mut stat = None;

        while SystemTime::now() < end_time && stat.is_none() {
            poll.poll(&mut events, Some(Duration::from_millis(100)))?;

            for event in &events {
                if event.token() == mio::Token(1) {
                    if let Some(f) = handle.stdout.as_mut() {
                        let l = f.read(read_buf.as_mut_slice())?;
                        buf_stdout.extend_from_slice(read_buf.split_at(l).0);
                        if buf_stdout.len() > max_stdout_length {
                            return Err(Error::output_limit(max_stdout_length));
                        }
                    }
                } else if event.token() == mio::Token(2) {
                    if let Some(f) = handle.stderr.as_mut() {
                        let l = f.read(read_buf.as_mut_slice())?;
                        buf_stderr.extend_from_slice(read_buf.split_at(l).0);
                        if buf_stderr.len() > max_stderr_length {
                            return Err(Error::output_limit(max_stderr_length));
                        }
                    }
                }
            }

            stat = handle.poll();
        }

        // If we did not time out, make sure that we read the last data from
        // stdout and stderr
        if stat.is_some() {
            if let Some(f) = handle.stdout.as_mut() {
                loop {
                    let l = f.read(read_buf.as_mut_slice())?;
                    buf_stdout.extend_from_slice(read_buf.split_at(l).0);
                    if buf_stdout.len() > max_stdout_length {
                        return Err(Error::output_limit(max_stdout_length));
                    }
                    if l < BUFFER_SIZE {
                        break;
                    }
                }
            }
            if let Some(f) = handle.stderr.as_mut() {
                loop {
                    let l = f.read(read_buf.as_mut_slice())?;
                    buf_stderr.extend_from_slice(read_buf.split_at(l).0);
                    if buf_stderr.len() > max_stderr_length {
                        return Err(Error::output_limit(max_stderr_length));
                    }
                    if l < BUFFER_SIZE {
                        break;
                    }
                }
            }
        }

        Ok(stat)
    }

    let wait_result = wrapped_read_and_wait(
        &mut handle,
        &mut buf_stdout,
        &mut buf_stderr,
        end_time,
        cmd_settings.max_stdout_length.unwrap_or(0),
        cmd_settings.max_stderr_length.unwrap_or(0),
    )
    .inspect_err(|e| {
        log::warn!("(Terminating process) Runtime error when waiting for it to finish: {e}");
        handle
            .kill()
            .unwrap_or_else(|e| log::error!("Could not kill process: {e}"));
    })
    .map_err(|e| match e {
        // Hand back what was read before the limit was hit.
        Error::SyscommandOutputLimitExceededError { limit, .. } => {
            Error::SyscommandOutputLimitExceededError {
                limit: limit,
                stdout: Some(strip_eot(String::from_utf8_lossy(buf_stdout.as_slice()))),
                stderr: Some(strip_eot(String::from_utf8_lossy(buf_stderr.as_slice()))),
            }
        }
        e => e,
    })?;

    let stdout = strip_eot(String::from_utf8_lossy(buf_stdout.as_slice()));
    let stderr = strip_eot(String::from_utf8_lossy(buf_stderr.as_slice()));

    let code = match wait_result {
        Some(ExitStatus::Exited(ucode)) => ucode as i32,
        Some(ExitStatus::Signaled(sig)) => 128 + i32::from(sig),
        Some(ExitStatus::Other(v)) => return Err(format!("Unknown exit status {v}").into()),
        Some(ExitStatus::Undetermined) => return Err("Undetermined error".into()),
        None => {
            handle
                .kill()
                .unwrap_or_else(|e| log::warn!("Could not kill timed out process: {e}"));
            return Err(Error::SyscommandTimeoutError {
                stdout: Some(stdout),
                stderr: Some(stderr),
            });
        }
    };

    Ok(SyscommandOutput {
        code: code,
        stdout: stdout,
        stderr: stderr,
    })
}

/// Same as `syscommand_timeout`, but runs on the blocking thread pool so that
/// async callers can await the process without stalling the runtime.
pub async fn syscommand_async(
    cmd: Vec<String>,
    cmd_settings: SyscommandSettings,
) -> Result<SyscommandOutput, Error> {
    tokio::task::spawn_blocking(move || syscommand_timeout(cmd, cmd_settings)).await?
}

/// Writes an executable shell script to `dir` and returns its path.
#[cfg(test)]
pub(crate) fn write_script<P: AsRef<Path>>(dir: P, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.as_ref().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_str().unwrap().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use asserting::prelude::*;

    #[test]
    fn test_path_join() {
        assert_that!(path_join("foo", "bar")).has_value("foo/bar");
        assert_that!(path_join("/foo", "bar")).has_value("/foo/bar");
        assert_that!(path_join("/foo", "/bar")).has_value("/bar");
        assert_that!(path_join("foo/bar", "babar.txt")).has_value("foo/bar/babar.txt");
    }

    #[test]
    fn test_strip_eot() {
        assert_that!(strip_eot("plain")).is_equal_to("plain");
        assert_that!(strip_eot("abc\x04\ndef")).is_equal_to("abcdef");
        assert_that!(strip_eot("abc\x04def\x04")).is_equal_to("abcdef\x04");
    }

    #[test]
    fn test_syscommand_simple() {
        let ret = syscommand_timeout(
            ["echo", "foo"],
            SyscommandSettings {
                max_stdout_length: Some(10),
                ..Default::default()
            },
        );
        assert_that!(&ret).is_ok();
        assert_that!(&ret)
            .ok()
            .mapping(|s| &s.stdout)
            .is_equal_to("foo\n");
    }

    #[test]
    fn test_syscommand_lots_of_output() {
        let ret = syscommand_timeout(
            [
                "sh",
                "-c",
                "for i in $(seq 1 400); do echo 0123456789qwerty; done",
            ],
            SyscommandSettings {
                max_stdout_length: Some(1024 * 1024),
                ..Default::default()
            },
        );
        assert_that!(&ret).is_ok();
        assert_that!(&ret)
            .ok()
            .mapping(|s| &s.stdout)
            .is_equal_to(&"0123456789qwerty\n".repeat(400));
    }

    #[test]
    fn test_syscommand_output_limit_keeps_partial_output() {
        let ret = syscommand_timeout(
            [
                "sh",
                "-c",
                "for i in $(seq 1 400); do echo 0123456789qwerty >&2; done",
            ],
            SyscommandSettings {
                max_stdout_length: Some(1024),
                max_stderr_length: Some(1024),
                ..Default::default()
            },
        );
        match ret {
            Err(Error::SyscommandOutputLimitExceededError {
                limit,
                stdout,
                stderr,
            }) => {
                assert_that!(limit).is_equal_to(1024);
                assert_that!(stdout).is_some();
                assert_that!(stderr.unwrap_or_default()).starts_with("0123456789qwerty\n");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_syscommand_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let ret = syscommand_timeout(
            ["pwd"],
            SyscommandSettings {
                max_stdout_length: Some(4096),
                cwd: Some(dir.path().canonicalize().unwrap()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_that!(ret.stdout.trim())
            .is_equal_to(dir.path().canonicalize().unwrap().to_str().unwrap());
    }

    #[test]
    fn test_syscommand_signal_is_reported_as_code() {
        let ret = syscommand_timeout(
            ["sh", "-c", "kill -SEGV $$"],
            SyscommandSettings {
                max_stdout_length: Some(1024),
                max_stderr_length: Some(1024),
                ..Default::default()
            },
        )
        .unwrap();
        assert_that!(ret.code).is_equal_to(139);
    }

    #[test]
    fn test_syscommand_with_timeout() {
        let ret = syscommand_timeout(
            ["sleep", "2"],
            SyscommandSettings {
                timeout: Duration::from_secs(1),
                ..Default::default()
            },
        );
        assert_that!(&ret).is_err();
        assert_that!(&ret).err().satisfies(|e| match e {
            Error::SyscommandTimeoutError { .. } => true,
            _ => false,
        });
    }

    #[tokio::test]
    async fn test_syscommand_async() {
        let ret = syscommand_async(
            vec!["sh".to_string(), "-c".to_string(), "echo out; echo err >&2; exit 3".to_string()],
            SyscommandSettings {
                max_stdout_length: Some(1024),
                max_stderr_length: Some(1024),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_that!(ret.code).is_equal_to(3);
        assert_that!(ret.stdout).is_equal_to("out\n");
        assert_that!(ret.stderr).is_equal_to("err\n");
    }
}
