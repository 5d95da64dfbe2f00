//! Step graph execution.
//!
//! A step is ready once every link it requires was created by a
//! completed step. Ready steps are dispatched concurrently, each in
//! its own task under a child cancellation token; a failure marks the
//! failing step's links dead and skips everything downstream of them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use gantry_core::step::Step;
use gantry_core::{Error, Result, StepFailure, StepLink};

use crate::reporter::Reporter;

enum StepState {
    Pending,
    Running { started: Instant },
    Succeeded,
    Failed(Error),
    Skipped(String),
}

impl StepState {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Succeeded | StepState::Failed(_) | StepState::Skipped(_)
        )
    }
}

/// Execute a validated set of steps to completion.
///
/// Returns `Ok` iff every step succeeded; otherwise an aggregate
/// carrying every failed and skipped step's reason. Cancelling `token`
/// propagates to in-flight steps, which are awaited before returning.
pub async fn run_graph(
    steps: Vec<Box<dyn Step>>,
    token: &CancellationToken,
    reporter: &Reporter,
) -> Result<()> {
    let steps: Vec<Arc<dyn Step>> = steps.into_iter().map(Arc::from).collect();
    validate(&steps)?;

    let requires: Vec<Vec<StepLink>> = steps.iter().map(|s| s.requires()).collect();
    let creates: Vec<Vec<StepLink>> = steps.iter().map(|s| s.creates()).collect();
    let producer_name: HashMap<StepLink, String> = steps
        .iter()
        .zip(&creates)
        .flat_map(|(step, links)| {
            links
                .iter()
                .map(|l| (l.clone(), step.name().to_string()))
        })
        .collect();

    audit_unconsumed(&steps, &requires, &creates);

    let mut states: Vec<StepState> = steps.iter().map(|_| StepState::Pending).collect();
    let mut satisfied: HashSet<StepLink> = HashSet::new();
    let mut dead: HashSet<StepLink> = HashSet::new();
    let mut any_failure = false;
    let mut in_flight = 0usize;
    let (tx, mut rx) = mpsc::unbounded_channel::<(usize, std::result::Result<(), Error>)>();

    loop {
        // Propagate skips and dispatch every ready step. Skipping can
        // unblock further skips, so iterate to a fixed point.
        let mut changed = true;
        while changed {
            changed = false;
            for i in 0..steps.len() {
                if !matches!(states[i], StepState::Pending) {
                    continue;
                }

                if token.is_cancelled() {
                    states[i] = StepState::Skipped("run was cancelled".to_string());
                    mark_dead(&mut dead, &creates[i]);
                    changed = true;
                    continue;
                }

                let wants_all_steps = requires[i].contains(&StepLink::AllSteps);
                if wants_all_steps && any_failure {
                    states[i] = StepState::Skipped("an earlier step failed".to_string());
                    mark_dead(&mut dead, &creates[i]);
                    changed = true;
                    continue;
                }
                if let Some(link) = requires[i].iter().find(|l| dead.contains(l)) {
                    let producer = producer_name
                        .get(link)
                        .map(String::as_str)
                        .unwrap_or("an upstream step");
                    states[i] = StepState::Skipped(format!(
                        "dependency \"{producer}\" did not complete"
                    ));
                    mark_dead(&mut dead, &creates[i]);
                    changed = true;
                    continue;
                }

                let ready = if wants_all_steps {
                    requires[i]
                        .iter()
                        .filter(|l| **l != StepLink::AllSteps)
                        .all(|l| satisfied.contains(l))
                        && states
                            .iter()
                            .enumerate()
                            .all(|(j, s)| j == i || s.is_terminal())
                } else {
                    requires[i].iter().all(|l| satisfied.contains(l))
                };
                if !ready {
                    continue;
                }

                info!(step = steps[i].name(), "starting step");
                states[i] = StepState::Running {
                    started: Instant::now(),
                };
                in_flight += 1;
                changed = true;

                let step = steps[i].clone();
                let child = token.child_token();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = step.run(&child).await;
                    // The receiver only drops once every task finished.
                    let _ = tx.send((i, result));
                });
            }
        }

        if in_flight == 0 {
            break;
        }

        let Some((i, result)) = rx.recv().await else {
            break;
        };
        in_flight -= 1;
        let duration = match &states[i] {
            StepState::Running { started } => started.elapsed().as_secs_f64(),
            _ => 0.0,
        };

        match result {
            Ok(()) => {
                info!(step = steps[i].name(), "step succeeded");
                reporter.record_step(steps[i].name(), duration, None);
                for case in steps[i]
                    .as_subtest_reporter()
                    .map(|r| r.subtests())
                    .unwrap_or_default()
                {
                    reporter.record_case(case);
                }
                satisfied.extend(creates[i].iter().cloned());
                states[i] = StepState::Succeeded;
            }
            Err(e) => {
                error!(step = steps[i].name(), error = %e, "step failed");
                reporter.record_step(steps[i].name(), duration, Some(&e));
                for case in steps[i]
                    .as_subtest_reporter()
                    .map(|r| r.subtests())
                    .unwrap_or_default()
                {
                    reporter.record_case(case);
                }
                mark_dead(&mut dead, &creates[i]);
                any_failure = true;
                states[i] = StepState::Failed(e);
            }
        }
    }

    // Anything still pending here is an unreachable island (a
    // dependency cycle the validation pass cannot see statically).
    for (i, state) in states.iter_mut().enumerate() {
        if matches!(state, StepState::Pending) {
            warn!(step = steps[i].name(), "step never became ready");
            *state = StepState::Skipped("step never became ready (dependency cycle?)".to_string());
        }
    }

    let mut failures = Vec::new();
    for (i, state) in states.into_iter().enumerate() {
        match state {
            StepState::Failed(e) => failures.push(StepFailure::new(steps[i].name(), e)),
            StepState::Skipped(reason) => {
                reporter.record_skipped(steps[i].name(), &reason);
                failures.push(StepFailure::new(steps[i].name(), Error::Skipped(reason)));
            }
            _ => {}
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        // Failures first, skips after, each with its own reason.
        failures.sort_by_key(|f| matches!(*f.error, Error::Skipped(_)));
        Err(Error::Aggregate(failures))
    }
}

fn mark_dead(dead: &mut HashSet<StepLink>, links: &[StepLink]) {
    dead.extend(links.iter().cloned());
}

/// Structural prechecks: unique names, unique producers, per-step
/// validation, and satisfiable requirements.
fn validate(steps: &[Arc<dyn Step>]) -> Result<()> {
    let mut failures = Vec::new();

    let mut names = HashSet::new();
    for step in steps {
        if !names.insert(step.name().to_string()) {
            failures.push(StepFailure::new(
                step.name(),
                Error::Validation(format!("duplicate step name \"{}\"", step.name())),
            ));
        }
        if let Err(e) = step.validate() {
            failures.push(StepFailure::new(step.name(), e));
        }
    }

    let mut producers: HashMap<StepLink, &str> = HashMap::new();
    for step in steps {
        for link in step.creates() {
            if link == StepLink::AllSteps {
                failures.push(StepFailure::new(
                    step.name(),
                    Error::Validation("no step may create the all-steps link".to_string()),
                ));
                continue;
            }
            if let Some(other) = producers.insert(link.clone(), step.name()) {
                failures.push(StepFailure::new(
                    step.name(),
                    Error::Validation(format!(
                        "link \"{link}\" is already created by step \"{other}\""
                    )),
                ));
            }
        }
    }

    for step in steps {
        for link in step.requires() {
            if link == StepLink::AllSteps {
                continue;
            }
            if !producers.contains_key(&link) {
                failures.push(StepFailure::new(
                    step.name(),
                    Error::Validation(format!("no step creates required link \"{link}\"")),
                ));
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Aggregate(failures))
    }
}

fn audit_unconsumed(steps: &[Arc<dyn Step>], requires: &[Vec<StepLink>], creates: &[Vec<StepLink>]) {
    let required: HashSet<&StepLink> = requires.iter().flatten().collect();
    for (step, links) in steps.iter().zip(creates) {
        for link in links {
            if !required.contains(link) {
                debug!(step = step.name(), link = %link, "created link is never required");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct TestStep {
        name: String,
        requires: Vec<StepLink>,
        creates: Vec<StepLink>,
        fail: bool,
        wait_for_cancel: bool,
        runs: AtomicUsize,
        order: Arc<Mutex<Vec<String>>>,
    }

    impl TestStep {
        fn new(
            name: &str,
            requires: Vec<StepLink>,
            creates: Vec<StepLink>,
            order: Arc<Mutex<Vec<String>>>,
        ) -> Self {
            Self {
                name: name.to_string(),
                requires,
                creates,
                fail: false,
                wait_for_cancel: false,
                runs: AtomicUsize::new(0),
                order,
            }
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }
    }

    #[async_trait]
    impl Step for TestStep {
        fn name(&self) -> &str {
            &self.name
        }

        fn requires(&self) -> Vec<StepLink> {
            self.requires.clone()
        }

        fn creates(&self) -> Vec<StepLink> {
            self.creates.clone()
        }

        async fn run(&self, token: &CancellationToken) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.wait_for_cancel {
                token.cancelled().await;
                return Err(Error::Cancelled);
            }
            // Yield so sibling steps genuinely interleave.
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.order.lock().unwrap().push(self.name.clone());
            if self.fail {
                Err(Error::PodFailed {
                    name: self.name.clone(),
                    message: "exit 1".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn link(tag: &str) -> StepLink {
        StepLink::internal(tag)
    }

    #[tokio::test]
    async fn diamond_runs_in_dependency_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let steps: Vec<Box<dyn Step>> = vec![
            Box::new(TestStep::new("d", vec![link("b"), link("c")], vec![], order.clone())),
            Box::new(TestStep::new("b", vec![link("a")], vec![link("b")], order.clone())),
            Box::new(TestStep::new("c", vec![link("a")], vec![link("c")], order.clone())),
            Box::new(TestStep::new("a", vec![], vec![link("a")], order.clone())),
        ];
        let reporter = Reporter::new("suite");
        run_graph(steps, &CancellationToken::new(), &reporter)
            .await
            .unwrap();

        let order = order.lock().unwrap();
        let pos = |n: &str| order.iter().position(|s| s == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[tokio::test]
    async fn failure_skips_downstream_and_aggregates_reasons() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let steps: Vec<Box<dyn Step>> = vec![
            Box::new(TestStep::new("a", vec![], vec![link("a")], order.clone()).failing()),
            Box::new(TestStep::new("b", vec![link("a")], vec![link("b")], order.clone())),
            Box::new(TestStep::new("c", vec![link("b")], vec![], order.clone())),
            Box::new(TestStep::new("ok", vec![], vec![], order.clone())),
        ];
        let reporter = Reporter::new("suite");
        let err = run_graph(steps, &CancellationToken::new(), &reporter)
            .await
            .unwrap_err();

        let Error::Aggregate(failures) = err else {
            panic!("expected aggregate");
        };
        assert_eq!(failures.len(), 3);
        assert_eq!(failures[0].step, "a");
        assert_eq!(failures[0].reason(), "pod_failed");
        let skipped: Vec<&str> = failures[1..].iter().map(|f| f.step.as_str()).collect();
        assert!(skipped.contains(&"b"));
        assert!(skipped.contains(&"c"));
        assert!(failures[1..].iter().all(|f| f.reason() == "skipped"));
        // The independent step still ran.
        assert!(order.lock().unwrap().contains(&"ok".to_string()));
    }

    #[tokio::test]
    async fn steps_run_at_most_once() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let shared = link("shared");
        let producer = Arc::new(TestStep::new("p", vec![], vec![shared.clone()], order.clone()));
        let consumers: Vec<Arc<TestStep>> = (0..8)
            .map(|i| {
                Arc::new(TestStep::new(
                    &format!("c{i}"),
                    vec![shared.clone()],
                    vec![],
                    order.clone(),
                ))
            })
            .collect();

        struct Shared(Arc<TestStep>);
        #[async_trait]
        impl Step for Shared {
            fn name(&self) -> &str {
                self.0.name()
            }
            fn requires(&self) -> Vec<StepLink> {
                self.0.requires()
            }
            fn creates(&self) -> Vec<StepLink> {
                self.0.creates()
            }
            async fn run(&self, token: &CancellationToken) -> Result<()> {
                self.0.run(token).await
            }
        }

        let mut steps: Vec<Box<dyn Step>> = vec![Box::new(Shared(producer.clone()))];
        steps.extend(
            consumers
                .iter()
                .map(|c| Box::new(Shared(c.clone())) as Box<dyn Step>),
        );
        run_graph(steps, &CancellationToken::new(), &Reporter::new("s"))
            .await
            .unwrap();
        assert_eq!(producer.runs.load(Ordering::SeqCst), 1);
        for c in consumers {
            assert_eq!(c.runs.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn unsatisfiable_requirement_rejects_the_graph() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let step = TestStep::new("lonely", vec![link("nowhere")], vec![], order);
        let err = run_graph(
            vec![Box::new(step)],
            &CancellationToken::new(),
            &Reporter::new("s"),
        )
        .await
        .unwrap_err();
        let Error::Aggregate(failures) = err else {
            panic!("expected aggregate");
        };
        assert_eq!(failures[0].reason(), "validation");
        assert!(failures[0].error.to_string().contains("pipeline image nowhere"));
    }

    #[tokio::test]
    async fn duplicate_producers_reject_the_graph() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let steps: Vec<Box<dyn Step>> = vec![
            Box::new(TestStep::new("x", vec![], vec![link("t")], order.clone())),
            Box::new(TestStep::new("y", vec![], vec![link("t")], order.clone())),
        ];
        let err = run_graph(steps, &CancellationToken::new(), &Reporter::new("s"))
            .await
            .unwrap_err();
        let Error::Aggregate(failures) = err else {
            panic!("expected aggregate");
        };
        assert!(failures.iter().any(|f| f.reason() == "validation"));
    }

    #[tokio::test]
    async fn all_steps_requirer_runs_last() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let steps: Vec<Box<dyn Step>> = vec![
            Box::new(TestStep::new("last", vec![StepLink::AllSteps], vec![], order.clone())),
            Box::new(TestStep::new("a", vec![], vec![link("a")], order.clone())),
            Box::new(TestStep::new("b", vec![link("a")], vec![], order.clone())),
        ];
        run_graph(steps, &CancellationToken::new(), &Reporter::new("s"))
            .await
            .unwrap();
        let order = order.lock().unwrap();
        assert_eq!(order.last().unwrap(), "last");
    }

    #[tokio::test]
    async fn all_steps_requirer_is_skipped_on_failure() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let steps: Vec<Box<dyn Step>> = vec![
            Box::new(TestStep::new("bad", vec![], vec![], order.clone()).failing()),
            Box::new(TestStep::new("last", vec![StepLink::AllSteps], vec![], order.clone())),
        ];
        let err = run_graph(steps, &CancellationToken::new(), &Reporter::new("s"))
            .await
            .unwrap_err();
        let Error::Aggregate(failures) = err else {
            panic!("expected aggregate");
        };
        assert!(
            failures
                .iter()
                .any(|f| f.step == "last" && f.reason() == "skipped")
        );
        assert!(!order.lock().unwrap().contains(&"last".to_string()));
    }

    #[tokio::test]
    async fn cancellation_reaches_running_steps_and_skips_pending_ones() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut blocker = TestStep::new("blocker", vec![], vec![link("x")], order.clone());
        blocker.wait_for_cancel = true;
        let steps: Vec<Box<dyn Step>> = vec![
            Box::new(blocker),
            Box::new(TestStep::new("after", vec![link("x")], vec![], order.clone())),
        ];

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = run_graph(steps, &token, &Reporter::new("s")).await.unwrap_err();
        let Error::Aggregate(failures) = err else {
            panic!("expected aggregate");
        };
        assert!(
            failures
                .iter()
                .any(|f| f.step == "blocker" && f.reason() == "cancelled")
        );
        assert!(
            failures
                .iter()
                .any(|f| f.step == "after" && f.reason() == "skipped")
        );
    }
}
