//! Per-container sub-tests derived from pod outcomes.
//!
//! A pod may carry an annotation listing container names in intended
//! sub-test order. Each listed container that reached a terminal state
//! becomes a JUnit test case; elapsed intervals are projected onto one
//! timeline so concurrent sidecars never double-count wall time.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;

use gantry_core::junit::TestCase;
use gantry_core::labels::CONTAINER_SUB_TESTS_ANNOTATION;

use crate::pod::container_statuses;

struct Finished {
    name: String,
    started: DateTime<Utc>,
    finished: DateTime<Utc>,
    exit_code: i32,
    message: Option<String>,
}

/// Derive sub-tests from a terminal pod. Containers absent from the
/// annotation, or not yet terminal, are not reported.
pub fn subtests_for_pod(pod: &Pod) -> Vec<TestCase> {
    let Some(annotation) = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CONTAINER_SUB_TESTS_ANNOTATION))
    else {
        return Vec::new();
    };
    let listed: Vec<&str> = annotation
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let mut finished: Vec<Finished> = container_statuses(pod)
        .filter(|status| listed.contains(&status.name.as_str()))
        .filter_map(|status| {
            let term = status.state.as_ref()?.terminated.as_ref()?;
            Some(Finished {
                name: status.name.clone(),
                started: term.started_at.as_ref()?.0,
                finished: term.finished_at.as_ref()?.0,
                exit_code: term.exit_code,
                message: term.message.clone(),
            })
        })
        .collect();

    // Attribution order: start time, ties broken by container name.
    finished.sort_by(|a, b| a.started.cmp(&b.started).then(a.name.cmp(&b.name)));

    let mut covered: Vec<(i64, i64)> = Vec::new();
    let mut cases: Vec<TestCase> = finished
        .into_iter()
        .map(|f| {
            let interval = (f.started.timestamp(), f.finished.timestamp());
            let duration = uncovered_seconds(interval, &covered);
            covered.push(interval);

            let name = format!("container {}", f.name);
            if f.exit_code == 0 {
                TestCase::passed(name, duration as f64)
            } else {
                let output = f
                    .message
                    .unwrap_or_else(|| format!("exit code {}", f.exit_code));
                TestCase::failed(name, duration as f64, output)
            }
        })
        .collect();

    cases.sort_by(|a, b| a.name.cmp(&b.name));
    cases
}

/// Length of `interval` not already covered by earlier intervals.
fn uncovered_seconds(interval: (i64, i64), covered: &[(i64, i64)]) -> i64 {
    let (start, end) = interval;
    if end <= start {
        return 0;
    }
    // Merge the covered set, then subtract every overlap.
    let mut merged: Vec<(i64, i64)> = covered.to_vec();
    merged.sort();
    let mut total = end - start;
    let mut cursor = start;
    for &(s, e) in &merged {
        let overlap_start = cursor.max(s);
        let overlap_end = end.min(e);
        if overlap_end > overlap_start {
            total -= overlap_end - overlap_start;
            cursor = overlap_end;
        }
    }
    total.max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn time(secs: i64) -> Time {
        Time(Utc.timestamp_opt(secs, 0).unwrap())
    }

    fn container(
        name: &str,
        started: i64,
        finished: i64,
        exit_code: i32,
        message: Option<&str>,
    ) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    started_at: Some(time(started)),
                    finished_at: Some(time(finished)),
                    exit_code,
                    message: message.map(String::from),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod_with(annotation: &str, statuses: Vec<ContainerStatus>) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.annotations = Some(
            [(CONTAINER_SUB_TESTS_ANNOTATION.to_string(), annotation.to_string())]
                .into_iter()
                .collect(),
        );
        pod.status = Some(PodStatus {
            container_statuses: Some(statuses),
            ..Default::default()
        });
        pod
    }

    #[test]
    fn sequential_containers_split_the_timeline() {
        let pod = pod_with(
            "other,test",
            vec![
                container("test", 1000, 1100, 1, Some("exit message")),
                container("other", 1050, 1150, 0, None),
            ],
        );
        let cases = subtests_for_pod(&pod);
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].name, "container other");
        assert_eq!(cases[0].duration_seconds, 50.0);
        assert!(cases[0].failure_output.is_none());
        assert_eq!(cases[1].name, "container test");
        assert_eq!(cases[1].duration_seconds, 100.0);
        assert_eq!(cases[1].failure_output.as_deref(), Some("exit message"));
    }

    #[test]
    fn fully_overlapped_container_gets_zero() {
        let pod = pod_with(
            "other,test",
            vec![
                container("other", 1050, 1150, 0, None),
                container("test", 1100, 1150, 1, Some("exit message")),
            ],
        );
        let cases = subtests_for_pod(&pod);
        assert_eq!(cases[0].name, "container other");
        assert_eq!(cases[0].duration_seconds, 100.0);
        assert_eq!(cases[1].name, "container test");
        assert_eq!(cases[1].duration_seconds, 0.0);
        assert_eq!(cases[1].failure_output.as_deref(), Some("exit message"));
    }

    #[test]
    fn unlisted_and_unfinished_containers_are_ignored() {
        let mut statuses = vec![
            container("test", 1000, 1100, 0, None),
            container("sidecar", 1000, 1200, 0, None),
        ];
        statuses.push(ContainerStatus {
            name: "pending".to_string(),
            ..Default::default()
        });
        let pod = pod_with("test,pending", statuses);
        let cases = subtests_for_pod(&pod);
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].name, "container test");
    }

    #[test]
    fn duration_sum_never_exceeds_wall_clock() {
        let pod = pod_with(
            "a,b,c",
            vec![
                container("a", 1000, 1120, 0, None),
                container("b", 1060, 1180, 0, None),
                container("c", 1010, 1050, 0, None),
            ],
        );
        let cases = subtests_for_pod(&pod);
        let sum: f64 = cases.iter().map(|c| c.duration_seconds).sum();
        assert!(sum <= (1180 - 1000) as f64);
        assert_eq!(sum, 180.0);
    }
}
