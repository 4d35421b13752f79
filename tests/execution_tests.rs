//! Execution lifecycle tests: promotion, retries with backoff, timeouts,
//! cancellation and dependency failures.
//!
//! Every test runs on a paused clock so backoff delays and timeouts elapse
//! instantly while keeping their relative ordering.


use std::time::Duration;

use buildmesh::model::{BuildStatus, JobDependency, RetryCondition, UserId};
use buildmesh::scheduler::SubmitRequest;
use buildmesh::store::BuildStore;
use test_harness::*;

fn request(job_name: &str) -> SubmitRequest {
    SubmitRequest::new(PROJECT, COMMIT, job_name, MAIN)
}

fn dependency(job_name: &str, require_successful: bool) -> JobDependency {
    JobDependency {
        job_name: job_name.to_string(),
        require_successful,
        params: Vec::new(),
        artifacts: None,
        destination_path: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_build_runs_from_waiting_to_successful() {
    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![job("test")]));
    cluster.start();

    let mut events = cluster.leader().events().subscribe();
    let build = cluster.leader().submit(request("test")).await.unwrap();
    assert_eq!(build.status, BuildStatus::Waiting);
    assert_eq!(build.number, 1);

    let collected = collect_events(
        &mut events,
        build.id,
        Duration::from_secs(10),
        Duration::from_secs(2),
    )
    .await;
    let names: Vec<&str> = collected.iter().map(|e| e.name()).collect();
    assert_eq!(names.first(), Some(&"submitted"));
    assert!(names.contains(&"pending"), "events: {:?}", names);
    assert!(names.contains(&"running"), "events: {:?}", names);
    assert_eq!(
        names.iter().filter(|name| **name == "finished").count(),
        1,
        "exactly one finished event expected, got {:?}",
        names
    );

    let finished = cluster.build(build.id);
    assert_eq!(finished.status, BuildStatus::Successful);
    assert!(finished.pending_date.is_some());
    assert!(finished.running_date.is_some());
    assert!(finished.finish_date.is_some());
    assert!(cluster.log_contains(build.id, "Job finished"));
    assert_eq!(cluster.script.runs_of(build.id).len(), 1);
    assert_eq!(cluster.leader().execution_count(), 0);

    cluster.stop();
}

#[tokio::test(start_paused = true)]
async fn test_failed_job_retries_with_doubling_backoff() {
    let mut flaky = job("flaky");
    flaky.retry_condition = RetryCondition::Always;
    flaky.max_retries = 3;
    flaky.retry_delay = 5;

    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![flaky]));
    cluster
        .script
        .push_n("flaky", Behavior::Fail("connection reset".to_string()), 4);
    cluster.start();

    let build = cluster.leader().submit(request("flaky")).await.unwrap();
    let finished = cluster
        .wait_for_finished(build.id, Duration::from_secs(120))
        .await
        .expect("build should finish");
    assert_eq!(finished.status, BuildStatus::Failed);

    let runs = cluster.script.runs_of(build.id);
    assert_eq!(runs.len(), 4, "one initial attempt plus three retries");
    let retried: Vec<u32> = runs.iter().map(|run| run.retried).collect();
    assert_eq!(retried, vec![0, 1, 2, 3]);

    for (window, expected) in runs.windows(2).zip([5u64, 10, 20]) {
        let gap = window[1].at - window[0].at;
        let expected = Duration::from_secs(expected);
        assert!(
            gap >= expected && gap < expected + Duration::from_secs(1),
            "attempts should start {:?} apart, got {:?}",
            expected,
            gap
        );
    }

    assert!(cluster.log_contains(build.id, "connection reset"));
    assert!(cluster.log_contains(build.id, "Job will be retried after a while..."));

    cluster.stop();
}

#[tokio::test(start_paused = true)]
async fn test_failure_not_matching_retry_condition_fails_immediately() {
    let mut picky = job("picky");
    picky.retry_condition = RetryCondition::ErrorContains("timeout".to_string());

    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![picky]));
    cluster
        .script
        .push("picky", Behavior::Fail("compile error".to_string()));
    cluster.start();

    let build = cluster.leader().submit(request("picky")).await.unwrap();
    let finished = cluster
        .wait_for_finished(build.id, Duration::from_secs(60))
        .await
        .expect("build should finish");
    assert_eq!(finished.status, BuildStatus::Failed);
    assert_eq!(cluster.script.runs_of(build.id).len(), 1);
    assert!(!cluster.log_contains(build.id, "Job will be retried"));

    cluster.stop();
}

#[tokio::test(start_paused = true)]
async fn test_aborted_job_is_never_retried() {
    let mut deploy = job("deploy");
    deploy.retry_condition = RetryCondition::Always;

    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![deploy]));
    cluster
        .script
        .push("deploy", Behavior::Abort("credentials rejected".to_string()));
    cluster.start();

    let build = cluster.leader().submit(request("deploy")).await.unwrap();
    let finished = cluster
        .wait_for_finished(build.id, Duration::from_secs(60))
        .await
        .expect("build should finish");
    assert_eq!(finished.status, BuildStatus::Failed);
    assert_eq!(cluster.script.runs_of(build.id).len(), 1);
    assert!(cluster.log_contains(build.id, "credentials rejected"));

    cluster.stop();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff() {
    let mut flaky = job("flaky");
    flaky.retry_condition = RetryCondition::Always;
    flaky.retry_delay = 60;

    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![flaky]));
    cluster
        .script
        .push("flaky", Behavior::Fail("boom".to_string()));
    cluster.start();

    let build = cluster.leader().submit(request("flaky")).await.unwrap();
    let builds = cluster.builds.clone();
    let build_id = build.id;
    assert_eventually(
        || {
            let builds = builds.clone();
            async move {
                builds.get(build_id).map_or(false, |b| {
                    b.status == BuildStatus::Waiting && b.retry_date.is_some()
                })
            }
        },
        Duration::from_secs(10),
        "build should be backing off",
    )
    .await;

    cluster
        .leader()
        .cancel(build.id, Some(UserId(9)))
        .await
        .unwrap();

    let finished = cluster
        .wait_for_finished(build.id, Duration::from_secs(10))
        .await
        .expect("build should finish");
    assert_eq!(finished.status, BuildStatus::Cancelled);
    assert_eq!(finished.canceller, Some(UserId(9)));
    assert_eq!(cluster.script.runs_of(build.id).len(), 1);

    cluster.stop();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_running_job_records_canceller() {
    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![job("serve")]));
    cluster.script.push("serve", Behavior::Hang);
    cluster.start();

    let build = cluster.leader().submit(request("serve")).await.unwrap();
    assert!(
        cluster
            .wait_for_status(build.id, BuildStatus::Running, Duration::from_secs(10))
            .await
    );

    cluster
        .leader()
        .cancel(build.id, Some(UserId(3)))
        .await
        .unwrap();

    let finished = cluster
        .wait_for_finished(build.id, Duration::from_secs(10))
        .await
        .expect("build should finish");
    assert_eq!(finished.status, BuildStatus::Cancelled);
    assert_eq!(finished.canceller, Some(UserId(3)));
    assert!(cluster.log_contains(build.id, "Job cancelled"));

    cluster.stop();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_waiting_build_finishes_it_directly() {
    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![job("test")]));

    // Not started: the build stays WAITING
    let build = cluster.leader().submit(request("test")).await.unwrap();
    cluster
        .leader()
        .cancel(build.id, Some(UserId(2)))
        .await
        .unwrap();

    let cancelled = cluster.build(build.id);
    assert_eq!(cancelled.status, BuildStatus::Cancelled);
    assert_eq!(cancelled.canceller, Some(UserId(2)));

    // Cancelling again leaves the finished build alone
    cluster.leader().cancel(build.id, Some(UserId(7))).await.unwrap();
    assert_eq!(cluster.build(build.id).canceller, Some(UserId(2)));
}

#[tokio::test(start_paused = true)]
async fn test_job_exceeding_timeout_is_timed_out() {
    let mut slow = job("slow");
    slow.timeout = 2;

    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![slow]));
    cluster.script.push("slow", Behavior::Hang);
    cluster.start();

    let build = cluster.leader().submit(request("slow")).await.unwrap();
    let finished = cluster
        .wait_for_finished(build.id, Duration::from_secs(30))
        .await
        .expect("build should finish");
    assert_eq!(finished.status, BuildStatus::TimedOut);
    assert!(cluster.log_contains(build.id, "Job timed out"));

    cluster.stop();
}

#[tokio::test(start_paused = true)]
async fn test_failed_required_dependency_fails_dependent() {
    let mut app = job("app");
    app.job_dependencies.push(dependency("lib", true));

    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![job("lib"), app]));
    cluster
        .script
        .push("lib", Behavior::Abort("lib broken".to_string()));
    cluster.start();

    let build = cluster.leader().submit(request("app")).await.unwrap();
    assert_eq!(build.dependencies.len(), 1);
    let lib_id = build.dependencies[0].dependency;

    let finished = cluster
        .wait_for_finished(build.id, Duration::from_secs(30))
        .await
        .expect("dependent build should finish");
    assert_eq!(finished.status, BuildStatus::Failed);
    assert_eq!(cluster.build(lib_id).status, BuildStatus::Failed);
    assert!(cluster.log_contains(lib_id, "lib broken"));
    assert!(cluster.log_contains(
        build.id,
        "Some dependencies are required to be successful but failed"
    ));
    assert!(cluster.script.runs_of(build.id).is_empty());

    cluster.stop();
}

#[tokio::test(start_paused = true)]
async fn test_optional_dependency_failure_still_runs_dependent() {
    let mut app = job("app");
    app.job_dependencies.push(dependency("lint", false));

    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![job("lint"), app]));
    cluster
        .script
        .push("lint", Behavior::Abort("style issues".to_string()));
    cluster.start();

    let build = cluster.leader().submit(request("app")).await.unwrap();
    let lint_id = build.dependencies[0].dependency;

    let finished = cluster
        .wait_for_finished(build.id, Duration::from_secs(30))
        .await
        .expect("dependent build should finish");
    assert_eq!(finished.status, BuildStatus::Successful);
    assert_eq!(cluster.build(lint_id).status, BuildStatus::Failed);

    let runs = cluster.script.runs();
    let lint_run = runs.iter().position(|r| r.build_id == lint_id).unwrap();
    let app_run = runs.iter().position(|r| r.build_id == build.id).unwrap();
    assert!(lint_run < app_run, "dependency must run before the dependent");

    cluster.stop();
}

#[tokio::test(start_paused = true)]
async fn test_unknown_executor_fails_build() {
    let mut odd = job("odd");
    odd.executor = Some("nope".to_string());

    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![odd]));
    cluster.start();

    let build = cluster.leader().submit(request("odd")).await.unwrap();
    let finished = cluster
        .wait_for_finished(build.id, Duration::from_secs(10))
        .await
        .expect("build should finish");
    assert_eq!(finished.status, BuildStatus::Failed);
    assert!(cluster.log_contains(build.id, "Unable to find specified job executor 'nope'"));
    assert!(cluster.script.runs_of(build.id).is_empty());

    cluster.stop();
}

#[tokio::test(start_paused = true)]
async fn test_resume_completes_interactive_job() {
    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![job("debug")]));
    cluster.script.push("debug", Behavior::Interactive);
    cluster.start();

    let build = cluster.leader().submit(request("debug")).await.unwrap();
    assert!(
        cluster
            .wait_for_status(build.id, BuildStatus::Running, Duration::from_secs(10))
            .await
    );

    // The job registers itself once the executor hands it to the runtime
    let leader = cluster.leader().clone();
    let build_id = build.id;
    assert_eventually(
        || {
            let leader = leader.clone();
            async move { leader.resume(build_id).await.is_ok() }
        },
        Duration::from_secs(10),
        "job should become resumable",
    )
    .await;

    let finished = cluster
        .wait_for_finished(build.id, Duration::from_secs(10))
        .await
        .expect("build should finish");
    assert_eq!(finished.status, BuildStatus::Successful);
    assert!(!finished.paused);
    assert!(cluster.log_contains(build.id, "Waiting to be resumed"));
    assert!(cluster.log_contains(build.id, "Resumed"));

    cluster.stop();
}

#[tokio::test(start_paused = true)]
async fn test_resume_without_running_job_fails() {
    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![job("test")]));

    let build = cluster.leader().submit(request("test")).await.unwrap();
    let err = cluster.leader().resume(build.id).await.unwrap_err();
    assert!(matches!(err, buildmesh::error::MeshError::JobContextNotFound));
}
