use futures::future::try_join_all;
use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use crate::{error::Error, settings::WorkspaceSettings};

/// Mode of artifacts that the sandboxed code must not modify.
pub const MODE_READ_ONLY: u32 = 0o444;

/// Mode of output channels while the sandbox writes to them.
pub const MODE_SANDBOX_WRITABLE: u32 = 0o777;

/// A file placed in the workspace during staging.
#[derive(Debug, Clone)]
pub enum StagedFile {
    /// A file with the given name and contents.
    Contents(String, String),
    /// A copy of an existing file under the given name.
    Copy(String, PathBuf),
}

/// Ephemeral, token named directory owning every file created for one
/// execution. It is removed by `teardown` or, on any other exit path, when
/// it is dropped.
#[derive(Debug)]
pub struct Workspace {
    token: String,
    dir: PathBuf,
    mount_source_dir: PathBuf,
    removed: bool,
}

impl Workspace {
    /// Creates the workspace directory for `token`. Fails if a directory with
    /// that name already exists.
    pub async fn create(settings: &WorkspaceSettings, token: &str) -> Result<Self, Error> {
        tokio::fs::create_dir_all(&settings.dir)
            .await
            .map_err(|e| Error::setup("Could not create workspace root", e))?;

        let dir = Path::new(&settings.dir).join(token);
        tokio::fs::create_dir(&dir).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                log::error!("Collision in workspace dir: {}", dir.display());
            }
            Error::setup("Could not create workspace", e)
        })?;

        // From here on the directory is removed when the workspace is dropped.
        let mount_source_dir = match &settings.mount_source_dir {
            Some(d) => Path::new(d).join(token),
            None => dir.clone(),
        };
        log::debug!("Created workspace {}", dir.display());

        Ok(Workspace {
            token: token.to_string(),
            dir: dir,
            mount_source_dir: mount_source_dir,
            removed: false,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Host path of a file in the workspace.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Path of a file as seen by the sandbox engine when bind mounting.
    pub fn mount_source(&self, name: &str) -> PathBuf {
        self.mount_source_dir.join(name)
    }

    /// Name of a workspace artifact, i.e. the token followed by `suffix`.
    pub fn artifact(&self, suffix: &str) -> String {
        format!("{}{}", self.token, suffix)
    }

    /// Writes and copies all files concurrently.
    pub async fn stage(&self, files: Vec<StagedFile>) -> Result<(), Error> {
        try_join_all(files.into_iter().map(|f| async move {
            match f {
                StagedFile::Contents(name, contents) => {
                    tokio::fs::write(self.path(&name), contents)
                        .await
                        .map_err(|e| Error::setup(&format!("Could not write {name}"), e))
                }
                StagedFile::Copy(name, src) => tokio::fs::copy(&src, self.path(&name))
                    .await
                    .map(|_| ())
                    .map_err(|e| {
                        Error::setup(&format!("Could not copy {}", src.display()), e)
                    }),
            }
        }))
        .await?;
        Ok(())
    }

    /// Sets the permission bits of the named files.
    pub async fn set_mode<S: AsRef<str>>(&self, names: &[S], mode: u32) -> Result<(), Error> {
        try_join_all(names.iter().map(|name| {
            let path = self.path(name.as_ref());
            async move {
                tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
                    .await
                    .map_err(|e| {
                        Error::setup(&format!("Could not set mode of {}", path.display()), e)
                    })
            }
        }))
        .await?;
        Ok(())
    }

    /// Deletes the named files from the workspace.
    pub async fn remove_files<S: AsRef<str>>(&self, names: &[S]) -> Result<(), Error> {
        try_join_all(names.iter().map(|name| {
            let path = self.path(name.as_ref());
            async move {
                tokio::fs::remove_file(&path).await.map_err(|e| {
                    Error::setup(&format!("Could not remove {}", path.display()), e)
                })
            }
        }))
        .await?;
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), Error> {
        tokio::fs::rename(self.path(from), self.path(to))
            .await
            .map_err(|e| Error::setup(&format!("Could not rename {from} to {to}"), e))
    }

    /// Reads a file from the workspace. A missing file is `None`.
    pub async fn read(&self, name: &str) -> Result<Option<String>, Error> {
        match tokio::fs::read(self.path(name)).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::from(e)),
        }
    }

    /// Removes the workspace and everything in it. Errors are logged.
    pub async fn teardown(mut self) {
        self.removed = true;
        log::debug!("Removing workspace {}", self.dir.display());
        tokio::fs::remove_dir_all(&self.dir)
            .await
            .unwrap_or_else(|e| {
                log::error!("Could not remove workspace {}: {e}", self.dir.display())
            });
    }
}

impl Drop for Workspace {
    // Only reached when `teardown` was skipped, e.g. on a panic or a
    // cancelled execution. Drop cannot await, so this blocks.
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        log::warn!("Workspace {} dropped without teardown", self.dir.display());
        std::fs::remove_dir_all(&self.dir).unwrap_or_else(|e| {
            log::error!("Could not remove workspace {}: {e}", self.dir.display())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asserting::prelude::*;

    fn settings(root: &Path) -> WorkspaceSettings {
        WorkspaceSettings {
            dir: root.to_str().unwrap().to_string(),
            mount_source_dir: None,
            self_reference: "moduletotest".to_string(),
        }
    }

    fn mode(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[tokio::test]
    async fn test_stage_and_teardown() {
        let root = tempfile::tempdir().unwrap();
        let support = root.path().join("unity.h");
        std::fs::write(&support, "#define UNITY").unwrap();

        let ws = Workspace::create(&settings(root.path()), "abcdef").await.unwrap();
        ws.stage(vec![
            StagedFile::Contents(ws.artifact(".py"), "x = 1".to_string()),
            StagedFile::Contents(ws.artifact("_results.xml"), String::new()),
            StagedFile::Copy("unity.h".to_string(), support.clone()),
        ])
        .await
        .unwrap();

        assert_that!(ws.read("abcdef.py").await.unwrap()).is_equal_to(Some("x = 1".to_string()));
        assert_that!(ws.read("unity.h").await.unwrap())
            .is_equal_to(Some("#define UNITY".to_string()));
        assert_that!(ws.read("missing").await.unwrap()).is_none();

        let dir = ws.dir().to_path_buf();
        ws.teardown().await;
        assert_that!(dir.exists()).is_false();
    }

    #[tokio::test]
    async fn test_modes() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create(&settings(root.path()), "tok").await.unwrap();
        ws.stage(vec![
            StagedFile::Contents("tok.c".to_string(), "int x;".to_string()),
            StagedFile::Contents("tok.testresults".to_string(), String::new()),
        ])
        .await
        .unwrap();
        ws.set_mode(&["tok.c"], MODE_READ_ONLY).await.unwrap();
        ws.set_mode(&["tok.testresults"], MODE_SANDBOX_WRITABLE).await.unwrap();
        assert_that!(mode(&ws.path("tok.c"))).is_equal_to(0o444);
        assert_that!(mode(&ws.path("tok.testresults"))).is_equal_to(0o777);

        ws.remove_files(&["tok.c"]).await.unwrap();
        assert_that!(ws.path("tok.c").exists()).is_false();

        // Read-only files do not prevent removal.
        let dir = ws.dir().to_path_buf();
        drop(ws);
        assert_that!(dir.exists()).is_false();
    }

    #[tokio::test]
    async fn test_collision_is_a_setup_error() {
        let root = tempfile::tempdir().unwrap();
        let first = Workspace::create(&settings(root.path()), "same").await.unwrap();
        let second = Workspace::create(&settings(root.path()), "same").await;
        assert_that!(matches!(second, Err(Error::SetupError(_)))).is_true();
        // The failed attempt must not remove the existing workspace.
        assert_that!(first.dir().exists()).is_true();
    }

    #[tokio::test]
    async fn test_mount_source_dir() {
        let root = tempfile::tempdir().unwrap();
        let mut s = settings(root.path());
        s.mount_source_dir = Some("/data".to_string());
        let ws = Workspace::create(&s, "tok").await.unwrap();
        assert_that!(ws.mount_source("tok.bin")).is_equal_to(PathBuf::from("/data/tok/tok.bin"));
        assert_that!(ws.path("tok.bin")).is_equal_to(root.path().join("tok").join("tok.bin"));
    }

    #[tokio::test]
    async fn test_failed_stage_still_tears_down() {
        let root = tempfile::tempdir().unwrap();
        let dir;
        {
            let ws = Workspace::create(&settings(root.path()), "tok").await.unwrap();
            dir = ws.dir().to_path_buf();
            let res = ws
                .stage(vec![StagedFile::Copy(
                    "unity.c".to_string(),
                    root.path().join("does-not-exist"),
                )])
                .await;
            assert_that!(matches!(res, Err(Error::SetupError(_)))).is_true();
        }
        assert_that!(dir.exists()).is_false();
    }
}
