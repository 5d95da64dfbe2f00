//! Build lifecycle driver.
//!
//! Creates cluster builds from Dockerfile or git sources and watches
//! them to a terminal phase. Transient error classes (network blips,
//! read-after-create windows) are retried under an explicit per-driver
//! backoff policy; authoritative failures surface the build's last
//! status with a classified reason.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::ExponentialBackoffBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gantry_core::jobspec::{Refs, short_hash};
use gantry_core::{Error, Result};

use crate::api::{Build, BuildPhase, BuildSource, BuildSpec, BuildStatus, DockerStrategy, GitBuildSource, ImageSource, ImageStreamTag};
use crate::client::{BuildClient, ImageTagClient};
use crate::pod::SPEC_HASH_ANNOTATION;

/// Marker the cluster's bundle index builder emits when a bundle
/// declares APIs it does not provide.
const INVALID_BUNDLE_MARKER: &str = "error checking provided apis";

pub struct BuildDriver {
    builds: Arc<dyn BuildClient>,
    tags: Arc<dyn ImageTagClient>,
    poll_interval: Duration,
    /// Policy for reads while watching a build.
    watch_backoff: ExponentialBackoff,
    /// Policy for image-stream-tag reads.
    tag_backoff: ExponentialBackoff,
}

impl BuildDriver {
    pub fn new(builds: Arc<dyn BuildClient>, tags: Arc<dyn ImageTagClient>) -> Self {
        Self {
            builds,
            tags,
            poll_interval: Duration::from_secs(2),
            watch_backoff: ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_millis(250))
                .with_multiplier(2.0)
                .with_max_elapsed_time(Some(Duration::from_secs(15 * 60)))
                .build(),
            tag_backoff: ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_millis(250))
                .with_multiplier(2.0)
                .with_max_elapsed_time(Some(Duration::from_secs(60)))
                .build(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_backoff(mut self, policy: ExponentialBackoff) -> Self {
        self.watch_backoff = policy.clone();
        self.tag_backoff = policy;
        self
    }

    /// Drive one build to completion.
    pub async fn run_build(&self, mut build: Build, token: &CancellationToken) -> Result<()> {
        stamp_spec_hash(&mut build);
        let name = build
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Validation("build without a name".into()))?;

        self.ensure_created(&name, &build).await?;
        info!(build = %name, "waiting for build");

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    if let Err(e) = self.builds.delete(&name).await {
                        warn!(build = %name, error = %e, "failed to delete build on cancel");
                    }
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let current = self.get_with_retry(&name).await?;
            let status = current.status.clone().unwrap_or_default();
            if !status.phase.is_terminal() {
                debug!(build = %name, phase = ?status.phase, "build in progress");
                continue;
            }
            return match status.phase {
                BuildPhase::Complete => {
                    info!(build = %name, "build complete");
                    Ok(())
                }
                _ => Err(classify_failure(&name, &status)),
            };
        }
    }

    /// Builds are immutable; an existing build with a drifted spec is
    /// deleted and resubmitted, a matching one is adopted.
    async fn ensure_created(&self, name: &str, build: &Build) -> Result<()> {
        if let Some(existing) = self.builds.get(name).await? {
            let existing_hash = existing
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(SPEC_HASH_ANNOTATION));
            let wanted_hash = build
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(SPEC_HASH_ANNOTATION));
            if existing_hash == wanted_hash {
                info!(build = %name, "adopting existing build");
                return Ok(());
            }
            warn!(build = %name, "existing build differs, recreating");
            self.builds.delete(name).await?;
        }
        match self.builds.create(build).await {
            Ok(_) => Ok(()),
            Err(Error::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Read a build, retrying transient failures and the not-found
    /// window right after creation.
    async fn get_with_retry(&self, name: &str) -> Result<Build> {
        let op = || async {
            match self.builds.get(name).await {
                Ok(Some(build)) => Ok(build),
                Ok(None) => Err(backoff::Error::transient(Error::NotFound(format!(
                    "build {name} not visible yet"
                )))),
                Err(e) if e.is_transient() => Err(backoff::Error::transient(e)),
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        };
        backoff::future::retry(self.watch_backoff.clone(), op).await
    }

    /// Resolve a pipeline tag to its content digest, retrying the
    /// transient window where the tag is not yet visible.
    pub async fn resolve_tag(&self, name: &str) -> Result<ImageStreamTag> {
        let op = || async {
            match self.tags.get(name).await {
                Ok(Some(tag)) if tag.status.as_ref().and_then(|s| s.digest.as_ref()).is_some() => {
                    Ok(tag)
                }
                Ok(_) => Err(backoff::Error::transient(Error::NotFound(format!(
                    "image tag {name} has no digest yet"
                )))),
                Err(e) if e.is_transient() => Err(backoff::Error::transient(e)),
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        };
        backoff::future::retry(self.tag_backoff.clone(), op).await
    }

    pub async fn resolve_tag_digest(&self, name: &str) -> Result<String> {
        let tag = self.resolve_tag(name).await?;
        Ok(tag
            .status
            .as_ref()
            .and_then(|s| s.digest.clone())
            .unwrap_or_default())
    }
}

fn stamp_spec_hash(build: &mut Build) {
    let serialized = serde_json::to_string(&build.spec).unwrap_or_default();
    build
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(SPEC_HASH_ANNOTATION.to_string(), short_hash(&serialized));
}

fn classify_failure(name: &str, status: &BuildStatus) -> Error {
    let message = status
        .message
        .clone()
        .or_else(|| status.reason.clone())
        .unwrap_or_else(|| format!("build ended in phase {:?}", status.phase));
    if message.contains(INVALID_BUNDLE_MARKER) {
        return Error::InvalidBundle(message);
    }
    Error::BuildFailed {
        name: name.to_string(),
        message: format!("phase {:?}: {message}", status.phase),
    }
}

/// A build whose context is an inline Dockerfile, optionally overlaid
/// with content copied from other images.
pub fn dockerfile_build(
    name: &str,
    dockerfile: String,
    from: Option<String>,
    output_tag: &str,
    source_images: Vec<ImageSource>,
    labels: BTreeMap<String, String>,
) -> Build {
    let mut build = Build::new(
        name,
        BuildSpec {
            source: BuildSource {
                dockerfile: Some(dockerfile),
                images: source_images,
                ..Default::default()
            },
            strategy: DockerStrategy {
                from,
                ..Default::default()
            },
            output_to: output_tag.to_string(),
        },
    );
    build.metadata.labels = Some(labels);
    build
}

/// A build cloned from the job's refs.
pub fn git_build(
    name: &str,
    refs: &Refs,
    from: Option<String>,
    output_tag: &str,
    labels: BTreeMap<String, String>,
) -> Build {
    let git_ref = refs
        .pulls
        .first()
        .map(|p| p.sha.clone())
        .unwrap_or_else(|| refs.base_sha.clone());
    let mut build = Build::new(
        name,
        BuildSpec {
            source: BuildSource {
                git: Some(GitBuildSource {
                    uri: format!("https://github.com/{}/{}.git", refs.org, refs.repo),
                    git_ref,
                }),
                ..Default::default()
            },
            strategy: DockerStrategy {
                from,
                ..Default::default()
            },
            output_to: output_tag.to_string(),
        },
    );
    build.metadata.labels = Some(labels);
    build
}

/// Dockerfile layering `RUN` commands over a base image. Commands are
/// emitted in exec form through a JSON quote, so shell metacharacters
/// survive verbatim.
pub fn cache_dockerfile(from: &str, commands: &[String]) -> String {
    let mut out = format!("FROM {from}\n");
    for command in commands {
        out.push_str(&format!("RUN [\"/bin/sh\", \"-c\", {}]\n", json_quote(command)));
    }
    out
}

fn json_quote(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// Shell command rewriting every pull spec occurrence in a generated
/// bundle's Dockerfiles. The `|` delimiter and sed metacharacters are
/// escaped so arbitrary pull specs cannot break out of the pattern.
pub fn pullspec_substitution_command(old: &str, new: &str) -> String {
    format!(
        "find . -type f -exec sed -i 's|{}|{}|g' {{}} +",
        sed_pattern_escape(old),
        sed_replacement_escape(new)
    )
}

fn sed_pattern_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '|' | '.' | '*' | '[' | ']' | '^' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn sed_replacement_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '|' | '&') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
