// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Writing generated configuration files
//!
//! A file is replaced by writing the new contents to a temporary file in the
//! same directory and renaming it over the old one, so readers see either
//! the old or the new contents in full.  Contents whose hash matches the
//! last write are not written at all, and the caller learns that nothing
//! changed.

use camino::Utf8Path;
use camino::Utf8PathBuf;
use camino_tempfile::NamedUtf8TempFile;
use sha2::Digest;
use sha2::Sha256;
use slog::{debug, info, o, warn, Logger};
use std::io::Write;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("failed to create temporary file in {dir}")]
    TempFile {
        dir: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to write temporary file for {path}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to rename temporary file over {path}")]
    Persist {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

type Hash = [u8; 32];

fn hash(contents: &[u8]) -> Hash {
    Sha256::digest(contents).into()
}

/// One generated file and the hash of what was last written to it
pub struct ArtifactWriter {
    log: Logger,
    name: String,
    path: Utf8PathBuf,
    last_hash: Option<Hash>,
}

impl ArtifactWriter {
    /// Starts from whatever is already at `path`, so that a restart which
    /// renders the same contents does not count as a change.
    pub fn new(log: &Logger, name: &str, path: &Utf8Path) -> ArtifactWriter {
        let log = log.new(o!("artifact" => name.to_string()));
        let last_hash = match std::fs::read(path) {
            Ok(contents) => {
                let last = hash(&contents);
                debug!(log, "found existing file";
                    "path" => %path, "sha256" => hex::encode(last));
                Some(last)
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => {
                warn!(log, "could not read existing file";
                    "path" => %path, "error" => %error);
                None
            }
        };
        ArtifactWriter {
            log,
            name: name.to_string(),
            path: path.to_owned(),
            last_hash,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Replaces the file with `contents` unless it already holds them.
    /// Returns true if the file was replaced.
    pub fn write(&mut self, contents: &str) -> Result<bool, ArtifactError> {
        let new_hash = hash(contents.as_bytes());
        if self.last_hash == Some(new_hash) {
            debug!(self.log, "contents unchanged");
            return Ok(false);
        }

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_str().is_empty() => dir.to_owned(),
            _ => Utf8PathBuf::from("."),
        };
        let mut file = NamedUtf8TempFile::new_in(&dir)
            .map_err(|err| ArtifactError::TempFile { dir, err })?;
        file.write_all(contents.as_bytes())
            .and_then(|()| file.as_file().sync_all())
            .map_err(|err| ArtifactError::Write {
                path: self.path.clone(),
                err,
            })?;
        file.persist(&self.path).map_err(|error| ArtifactError::Persist {
            path: self.path.clone(),
            err: error.error,
        })?;

        info!(self.log, "wrote file";
            "path" => %self.path, "sha256" => hex::encode(new_hash));
        self.last_hash = Some(new_hash);
        Ok(true)
    }
}

/// Runs the command that makes a service pick up changed files.  A failure
/// is logged and otherwise ignored; the files are in place either way.
pub async fn reload(log: &Logger, command: &[String]) {
    let Some((program, args)) = command.split_first() else {
        return;
    };
    info!(log, "running reload command"; "command" => ?command);
    match tokio::process::Command::new(program).args(args).output().await {
        Ok(output) if output.status.success() => (),
        Ok(output) => warn!(log, "reload command failed";
            "status" => %output.status,
            "stderr" => String::from_utf8_lossy(&output.stderr).into_owned()),
        Err(error) => warn!(log, "could not run reload command";
            "error" => %error),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use corral_test_utils::dev::test_setup_log;

    #[test]
    fn test_write_only_on_change() {
        let logctx = test_setup_log("test_write_only_on_change");
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("hosts.conf");

        let mut writer = ArtifactWriter::new(&logctx.log, "hosts", &path);
        assert!(writer.write("host a {}\n").unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "host a {}\n");
        assert!(!writer.write("host a {}\n").unwrap());
        assert!(writer.write("host b {}\n").unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "host b {}\n");

        // Only the live file remains; the temporary files were renamed.
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);

        // A fresh writer knows what is already on disk.
        let mut writer = ArtifactWriter::new(&logctx.log, "hosts", &path);
        assert!(!writer.write("host b {}\n").unwrap());
        logctx.cleanup_successful();
    }

    #[test]
    fn test_write_failure() {
        let logctx = test_setup_log("test_write_failure");
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("missing").join("hosts.conf");

        let mut writer = ArtifactWriter::new(&logctx.log, "hosts", &path);
        assert!(matches!(
            writer.write("x"),
            Err(ArtifactError::TempFile { .. })
        ));
        // Nothing was recorded, so the next attempt writes again.
        std::fs::create_dir(dir.path().join("missing")).unwrap();
        assert!(writer.write("x").unwrap());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_reload() {
        let logctx = test_setup_log("test_reload");
        let dir = Utf8TempDir::new().unwrap();
        let marker = dir.path().join("reloaded");
        let command =
            vec![String::from("touch"), marker.as_str().to_string()];
        reload(&logctx.log, &command).await;
        assert!(marker.exists());

        // Neither of these may panic or fail the caller.
        reload(&logctx.log, &[]).await;
        reload(&logctx.log, &[String::from("/nonexistent/reload")]).await;
        logctx.cleanup_successful();
    }
}
