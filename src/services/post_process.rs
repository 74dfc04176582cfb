//! Best-effort post-processing of finalized files.
//!
//! Post-processing shells out to external programs: mime detection with
//! `file --mime-type -b`, and for images an optional thumbnailer invoked as
//! `<program> <input> -thumbnail 256x256 <output>`.

use crate::models::upload::UploadDescriptor;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::process::Command;
use tracing::{debug, warn};

const THUMBNAIL_GEOMETRY: &str = "256x256";

/// What post-processing learned about a stored file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PostProcessReport {
    pub mime_type: Option<String>,
    pub thumbnail: Option<PathBuf>,
}

#[async_trait]
pub trait PostProcessor: Send + Sync {
    /// Inspect the file at `path`, which is named by `digest` in the store.
    async fn process(
        &self,
        descriptor: &UploadDescriptor,
        digest: &str,
        path: &Path,
    ) -> Result<PostProcessReport>;
}

/// Post-processor used when post-processing is disabled.
pub struct NoopPostProcessor;

#[async_trait]
impl PostProcessor for NoopPostProcessor {
    async fn process(
        &self,
        _descriptor: &UploadDescriptor,
        _digest: &str,
        _path: &Path,
    ) -> Result<PostProcessReport> {
        Ok(PostProcessReport::default())
    }
}

/// Runs the configured external programs.
#[derive(Clone, Debug)]
pub struct CommandPostProcessor {
    pub mime_program: String,
    pub thumbnail_program: Option<String>,
    pub thumbnail_dir: PathBuf,
}

#[async_trait]
impl PostProcessor for CommandPostProcessor {
    async fn process(
        &self,
        descriptor: &UploadDescriptor,
        digest: &str,
        path: &Path,
    ) -> Result<PostProcessReport> {
        let output = run_cmd(
            &self.mime_program,
            &[
                OsStr::new("--mime-type"),
                OsStr::new("-b"),
                path.as_os_str(),
            ],
        )
        .await?;
        let mime = output.trim().to_string();
        debug!(name = %descriptor.name, digest, mime = %mime, "detected mime type");

        let mut report = PostProcessReport {
            mime_type: (!mime.is_empty()).then(|| mime.clone()),
            thumbnail: None,
        };

        if mime.starts_with("image/") {
            if let Some(program) = &self.thumbnail_program {
                tokio::fs::create_dir_all(&self.thumbnail_dir).await?;
                let thumb = self.thumbnail_dir.join(format!("{}.png", digest));
                match run_cmd(
                    program,
                    &[
                        path.as_os_str(),
                        OsStr::new("-thumbnail"),
                        OsStr::new(THUMBNAIL_GEOMETRY),
                        thumb.as_os_str(),
                    ],
                )
                .await
                {
                    Ok(_) => report.thumbnail = Some(thumb),
                    Err(err) => warn!(
                        name = %descriptor.name,
                        digest,
                        "thumbnailing failed: {:#}",
                        err
                    ),
                }
            }
        } else if mime.starts_with("video/") {
            debug!(name = %descriptor.name, digest, "no thumbnailer for video files");
        }

        Ok(report)
    }
}

/// Run `program` with `args` and return its stdout.
async fn run_cmd(program: &str, args: &[&OsStr]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("spawning `{}`", program))?;

    if !output.status.success() {
        bail!(
            "`{}` {:?} exited with {}: {}",
            program,
            args,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
