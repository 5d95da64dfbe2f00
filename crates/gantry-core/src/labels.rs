//! Reserved label and annotation keys on cluster resources.

use std::collections::BTreeMap;

use crate::jobspec::JobSpec;

/// Annotation holding the serialized job envelope.
pub const JOB_SPEC_ANNOTATION: &str = "ci.openshift.io/job-spec";

/// Annotation listing container names, comma-separated, in intended
/// sub-test order.
pub const CONTAINER_SUB_TESTS_ANNOTATION: &str = "ci-operator.openshift.io/container-sub-tests";

/// Label naming the multi-stage step that owns a pod.
pub const MULTI_STAGE_TEST_LABEL: &str = "ci.openshift.io/multi-stage-test";

pub const REFS_ORG_LABEL: &str = "ci.openshift.io/refs.org";
pub const REFS_REPO_LABEL: &str = "ci.openshift.io/refs.repo";
pub const REFS_BRANCH_LABEL: &str = "ci.openshift.io/refs.branch";

pub const CREATED_BY_CI_LABEL: &str = "created-by-ci";
pub const BUILD_ID_LABEL: &str = "build-id";
pub const JOB_LABEL: &str = "job";
pub const PERSISTS_LABEL: &str = "persists-between-builds";

/// Bookkeeping labels stamped on every resource a step creates.
pub fn standard_labels(spec: &JobSpec) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CREATED_BY_CI_LABEL.to_string(), "true".to_string()),
        (BUILD_ID_LABEL.to_string(), spec.buildid.clone()),
        (JOB_LABEL.to_string(), spec.job_name_safe()),
    ])
}

/// Origin-ref labels, when the job carries refs.
pub fn refs_labels(spec: &JobSpec) -> BTreeMap<String, String> {
    let Some(refs) = &spec.refs else {
        return BTreeMap::new();
    };
    BTreeMap::from([
        (REFS_ORG_LABEL.to_string(), refs.org.clone()),
        (REFS_REPO_LABEL.to_string(), refs.repo.clone()),
        (REFS_BRANCH_LABEL.to_string(), refs.base_ref.clone()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_labels_carry_bookkeeping_keys() {
        let spec = JobSpec::parse(
            r#"{"type":"periodic","job":"nightly","buildid":"7","prowjobid":"x"}"#,
        )
        .unwrap();
        let labels = standard_labels(&spec);
        assert_eq!(labels["created-by-ci"], "true");
        assert_eq!(labels["build-id"], "7");
        assert_eq!(labels["job"], "nightly");
        assert!(refs_labels(&spec).is_empty());
    }
}
