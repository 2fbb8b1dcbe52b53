//! Sandbox image management: probing, building hardened images and pulling
//! public fallbacks.

use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;
use tar::{Builder, Header};
use tracing::{debug, info};

use super::SandboxError;
use crate::config::Config;
use crate::language::{LanguageProfile, ProfileRegistry};

/// Unprivileged user every sandbox image runs as.
pub(crate) const SANDBOX_USER: &str = "1000:1000";

/// Dockerfile for a language's hardened image: an unprivileged user, a
/// `/work` directory and no setuid binaries.
pub(crate) fn hardened_dockerfile(profile: &LanguageProfile) -> String {
    format!(
        "FROM {base}\n\
         RUN (id -u 1000 >/dev/null 2>&1 || useradd -m -u 1000 -s /bin/false sandbox) && \\\n    \
         mkdir -p /work && chown 1000:1000 /work && \\\n    \
         find / -xdev -perm /6000 -type f -exec chmod a-s {{}} + 2>/dev/null || true\n\
         USER {SANDBOX_USER}\n\
         WORKDIR /work\n",
        base = profile.fallback_image()
    )
}

/// Whether an image is present locally.
pub(crate) async fn image_exists(docker: &Docker, image: &str) -> Result<bool, SandboxError> {
    match docker.inspect_image(image).await {
        Ok(_) => Ok(true),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(false),
        Err(e) => Err(SandboxError::container_failed(format!(
            "failed to inspect image {image}: {e}"
        ))),
    }
}

/// Builds the hardened image for a language from an in-memory context.
pub(crate) async fn build_hardened_image(
    docker: &Docker,
    profile: &LanguageProfile,
    tag: &str,
) -> Result<(), SandboxError> {
    info!("Building sandbox image {} for {}", tag, profile.name);

    let dockerfile = hardened_dockerfile(profile);
    let context = build_context(&dockerfile)
        .map_err(|e| SandboxError::container_failed(format!("failed to create build context: {e}")))?;

    let build_options = BuildImageOptions {
        dockerfile: "Dockerfile".to_string(),
        t: tag.to_string(),
        rm: true,
        ..Default::default()
    };

    let mut stream = docker.build_image(build_options, None, Some(context));

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(output) => {
                if let Some(stream_text) = &output.stream {
                    let trimmed = stream_text.trim();
                    if !trimmed.is_empty() {
                        debug!("{}", trimmed);
                    }
                } else if let Some(error) = &output.error {
                    return Err(SandboxError::container_failed(format!(
                        "build of {tag} failed: {error}"
                    )));
                }
            }
            Err(e) => {
                return Err(SandboxError::container_failed(format!(
                    "build of {tag} failed: {e}"
                )));
            }
        }
    }

    info!("Image built successfully: {}", tag);
    Ok(())
}

/// Tarball holding just the Dockerfile.
fn build_context(dockerfile: &str) -> std::io::Result<Bytes> {
    let mut tar_buf = Vec::new();
    {
        let mut tar = Builder::new(&mut tar_buf);
        let mut header = Header::new_gnu();
        header.set_size(dockerfile.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, "Dockerfile", dockerfile.as_bytes())?;
        tar.finish()?;
    }
    Ok(Bytes::from(tar_buf))
}

/// Pulls an image from its registry.
pub(crate) async fn pull_image(docker: &Docker, image: &str) -> Result<(), SandboxError> {
    info!("Pulling image {}", image);
    let (name, tag) = parse_image_tag(image);

    let pull_options = CreateImageOptions {
        from_image: name,
        tag,
        ..Default::default()
    };

    let mut stream = docker.create_image(Some(pull_options), None, None);

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(output) => {
                if let Some(error) = &output.error {
                    return Err(SandboxError::image_not_found(format!("{image}: {error}")));
                }
                if let Some(status) = &output.status {
                    debug!("{}", status.trim());
                }
            }
            Err(e) => {
                return Err(SandboxError::image_not_found(format!("{image}: {e}")));
            }
        }
    }

    info!("Image pulled successfully: {}", image);
    Ok(())
}

/// Availability of one language's hardened image.
#[derive(Debug, Clone, Serialize)]
pub struct ImageStatus {
    pub language: &'static str,
    pub image: String,
    pub present: bool,
    /// Public image used while the hardened one is missing
    pub fallback: &'static str,
}

/// Reports which hardened images exist on the configured engine.
pub async fn image_status(config: &Config) -> Result<Vec<ImageStatus>, SandboxError> {
    let docker = super::docker::connect(config.engine.socket.as_deref()).await?;
    let profiles = ProfileRegistry::new(config)?;

    let mut statuses = Vec::new();
    for profile in profiles.list() {
        let image = profile.hardened_image(&config.engine.image_prefix);
        let present = image_exists(&docker, &image).await?;
        statuses.push(ImageStatus {
            language: profile.id,
            image,
            present,
            fallback: profile.fallback_image(),
        });
    }
    Ok(statuses)
}

/// Builds hardened images for the given languages, or for all of them when
/// `languages` is empty. Returns the tags built.
pub async fn build_images(config: &Config, languages: &[String]) -> Result<Vec<String>, SandboxError> {
    let docker = super::docker::connect(config.engine.socket.as_deref()).await?;
    let profiles = ProfileRegistry::new(config)?;

    let selected: Vec<&LanguageProfile> = if languages.is_empty() {
        profiles.list().iter().collect()
    } else {
        languages
            .iter()
            .map(|language| profiles.get(language))
            .collect::<Result<_, _>>()?
    };

    let mut built = Vec::new();
    for profile in selected {
        let tag = profile.hardened_image(&config.engine.image_prefix);
        build_hardened_image(&docker, profile, &tag).await?;
        built.push(tag);
    }
    Ok(built)
}

/// Parse image name and tag from a string.
pub(crate) fn parse_image_tag(image: &str) -> (&str, &str) {
    // A colon before the last slash belongs to a registry port
    let last_slash = image.rfind('/').unwrap_or(0);
    match image.rfind(':') {
        Some(colon_pos) if colon_pos > last_slash => {
            let (name, tag) = image.split_at(colon_pos);
            (name, &tag[1..])
        }
        _ => (image, "latest"),
    }
}
