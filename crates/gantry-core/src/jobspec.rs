//! The job spec envelope handed to every invocation via `JOB_SPEC`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Environment variable carrying the serialized envelope.
pub const JOB_SPEC_ENV: &str = "JOB_SPEC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Presubmit,
    Postsubmit,
    Periodic,
    Batch,
}

/// A pull request included in the tested revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pull {
    pub number: u64,
    pub author: String,
    pub sha: String,
}

/// Origin refs for the tested revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refs {
    pub org: String,
    pub repo: String,
    #[serde(default)]
    pub base_ref: String,
    #[serde(default)]
    pub base_sha: String,
    #[serde(default)]
    pub pulls: Vec<Pull>,
}

/// Parsed `JOB_SPEC` plus identifiers derived from the raw envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(rename = "type")]
    pub kind: JobType,
    pub job: String,
    #[serde(default)]
    pub buildid: String,
    #[serde(default)]
    pub prowjobid: String,
    #[serde(default)]
    pub refs: Option<Refs>,

    /// The raw envelope the identifiers were derived from.
    #[serde(skip)]
    raw: String,
    /// Short, stable hex identifier for this invocation.
    #[serde(skip)]
    id: String,
}

impl JobSpec {
    /// Parse the raw envelope and derive the invocation identifier.
    pub fn parse(raw: &str) -> crate::Result<Self> {
        let mut spec: JobSpec = serde_json::from_str(raw)
            .map_err(|e| crate::Error::Validation(format!("malformed job spec: {e}")))?;
        spec.raw = raw.to_string();
        spec.id = short_hash(raw);
        Ok(spec)
    }

    /// Read and parse the envelope from the process environment.
    pub fn from_env() -> crate::Result<Self> {
        let raw = std::env::var(JOB_SPEC_ENV)
            .map_err(|_| crate::Error::Validation(format!("{JOB_SPEC_ENV} is not set")))?;
        Self::parse(&raw)
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// sha256 of the raw envelope, truncated to a short hex string.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The job name reduced to a DNS-label-safe form.
    pub fn job_name_safe(&self) -> String {
        let safe: String = self
            .job
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        safe.trim_matches('-').chars().take(63).collect()
    }

    /// Short hash of the job name, for resources whose names must stay
    /// under the label length limit regardless of job name length.
    pub fn job_name_hash(&self) -> String {
        short_hash(&self.job)
    }
}

/// sha256 truncated to a stable short hex string.
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENVELOPE: &str = r#"{
        "type": "presubmit",
        "job": "pull-ci-org-repo-master-e2e",
        "buildid": "42",
        "prowjobid": "9e6f2c1a",
        "refs": {
            "org": "org", "repo": "repo",
            "base_ref": "master", "base_sha": "abc123",
            "pulls": [{"number": 123, "author": "dev", "sha": "def456"}]
        }
    }"#;

    #[test]
    fn parses_the_envelope() {
        let spec = JobSpec::parse(ENVELOPE).unwrap();
        assert_eq!(spec.kind, JobType::Presubmit);
        assert_eq!(spec.job, "pull-ci-org-repo-master-e2e");
        let refs = spec.refs.as_ref().unwrap();
        assert_eq!(refs.org, "org");
        assert_eq!(refs.pulls[0].number, 123);
    }

    #[test]
    fn identifier_is_short_stable_hex() {
        let a = JobSpec::parse(ENVELOPE).unwrap();
        let b = JobSpec::parse(ENVELOPE).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().len(), 8);
        assert!(a.id().chars().all(|c| c.is_ascii_hexdigit()));

        let other = JobSpec::parse(&ENVELOPE.replace("42", "43")).unwrap();
        assert_ne!(a.id(), other.id());
    }

    #[test]
    fn job_name_is_sanitized() {
        let spec = JobSpec::parse(ENVELOPE).unwrap();
        assert_eq!(spec.job_name_safe(), "pull-ci-org-repo-master-e2e");

        let spec = JobSpec::parse(&ENVELOPE.replace(
            "pull-ci-org-repo-master-e2e",
            "Periodic_Job.With/Weird:Chars",
        ))
        .unwrap();
        assert_eq!(spec.job_name_safe(), "periodic-job-with-weird-chars");
    }

    #[test]
    fn rejects_garbage() {
        assert!(JobSpec::parse("not json").is_err());
    }
}
