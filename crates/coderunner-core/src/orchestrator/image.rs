//! Makes sure the sandbox image exists before any submission is run.

use bollard::errors::Error as BollardError;
use bollard::query_parameters::BuildImageOptionsBuilder;
use bollard::{body_full, Docker};
use futures_util::stream::StreamExt;
use std::path::Path;

use crate::config::DockerConfig;
use crate::errors::RunnerError;

const BUILD_ERROR_TAIL: usize = 2000;

/// Top-level entries of the build context that are never sent to the daemon.
const CONTEXT_EXCLUDES: &[&str] = &["target", ".git"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    Present,
    Built,
    /// Not found and no build context configured
    Missing,
}

pub(crate) fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

pub async fn ensure_image(docker: &Docker, config: &DockerConfig) -> Result<ImageStatus, RunnerError> {
    match docker.inspect_image(&config.image).await {
        Ok(_) => {
            log::info!("Sandbox image {} is available", config.image);
            return Ok(ImageStatus::Present);
        }
        Err(e) if is_not_found(&e) => {}
        Err(e) => return Err(e.into()),
    }

    let Some(context) = config.build_context.as_deref() else {
        log::warn!("Sandbox image {} not found and no build context configured", config.image);
        return Ok(ImageStatus::Missing);
    };

    log::info!("Sandbox image {} not found, building it from {}", config.image, context.display());
    build_image(docker, context, &config.dockerfile, &config.image).await?;
    log::info!("Built sandbox image {}", config.image);
    Ok(ImageStatus::Built)
}

/// Builds the sandbox image through the daemon's build endpoint.
pub async fn build_image(
    docker: &Docker,
    context: &Path,
    dockerfile: &str,
    tag: &str,
) -> Result<(), RunnerError> {
    let root = context.to_path_buf();
    let archive = tokio::task::spawn_blocking(move || archive_context(&root))
        .await
        .map_err(|e| RunnerError::ImageBuild(format!("context archiver failed: {}", e)))??;
    log::debug!("Sending {} byte build context to the daemon", archive.len());

    let options = BuildImageOptionsBuilder::default()
        .dockerfile(dockerfile)
        .t(tag)
        .rm(true)
        .build();
    let mut build_stream = docker.build_image(options, None, Some(body_full(archive.into())));

    while let Some(item) = build_stream.next().await {
        let info = item.map_err(|e| RunnerError::ImageBuild(e.to_string()))?;
        if let Some(message) = info.error_detail.and_then(|detail| detail.message) {
            return Err(RunnerError::ImageBuild(tail(&message).to_string()));
        }
        if let Some(line) = info.stream {
            let line = line.trim_end();
            if !line.is_empty() {
                log::debug!("build: {}", line);
            }
        }
    }
    Ok(())
}

fn tail(text: &str) -> &str {
    let mut start = text.len().saturating_sub(BUILD_ERROR_TAIL);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].trim()
}

/// Packs `root` into an in-memory tar, leaving out build outputs and VCS data.
pub fn archive_context(root: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    append_tree(&mut builder, root, Path::new(""))?;
    builder.into_inner()
}

fn append_tree(builder: &mut tar::Builder<Vec<u8>>, root: &Path, relative: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(root.join(relative))? {
        let entry = entry?;
        let name = entry.file_name();
        let top_level = relative.as_os_str().is_empty();
        if top_level && name.to_str().is_some_and(|n| CONTEXT_EXCLUDES.contains(&n)) {
            continue;
        }

        let path = relative.join(&name);
        if entry.file_type()?.is_dir() {
            append_tree(builder, root, &path)?;
        } else {
            builder.append_path_with_name(entry.path(), &path)?;
        }
    }
    Ok(())
}
