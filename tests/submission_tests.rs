//! Submission tests: deduplication, dependency matrices, parameter checks,
//! cross-project dependencies, superseding and resubmission.
//!
//! Managers are not started here, so submitted builds stay WAITING unless a
//! test finishes them through the store.


use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use buildmesh::error::MeshError;
use buildmesh::model::{
    BuildSelector, BuildStatus, JobDependency, ParamSpec, ParamSupply, ParamType, ProjectDependency,
    ProjectId, RequestId, UserId,
};
use buildmesh::scheduler::SubmitRequest;
use buildmesh::store::BuildStore;
use test_harness::*;

const LIB: ProjectId = ProjectId(2);

fn request(job_name: &str) -> SubmitRequest {
    SubmitRequest::new(PROJECT, COMMIT, job_name, MAIN)
}

fn text_param(name: &str) -> ParamSpec {
    ParamSpec {
        name: name.to_string(),
        param_type: ParamType::Text,
        allow_empty: false,
        allow_multiple: false,
    }
}

fn supply(name: &str, alternatives: &[&str]) -> ParamSupply {
    ParamSupply {
        name: name.to_string(),
        values: alternatives.iter().map(|v| vec![v.to_string()]).collect(),
    }
}

fn finish(cluster: &TestCluster, build_id: buildmesh::model::BuildId, status: BuildStatus) {
    cluster
        .builds
        .modify(build_id, &mut |b| b.finish(status))
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_submissions_share_one_build() {
    let cluster = Arc::new(TestCluster::new(1));
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![job("test")]));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let manager = cluster.leader().clone();
            tokio::spawn(async move { manager.submit(request("test")).await.unwrap().id })
        })
        .collect();

    let mut ids = BTreeSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }
    assert_eq!(ids.len(), 1, "every submission should resolve to the same build");
    assert_eq!(cluster.builds.len(), 1);
}

#[tokio::test]
async fn test_finished_build_reused_only_within_pipeline() {
    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![job("test")]));

    let first = cluster
        .leader()
        .submit(request("test").with_pipeline("p1"))
        .await
        .unwrap();
    finish(&cluster, first.id, BuildStatus::Successful);

    let same_pipeline = cluster
        .leader()
        .submit(request("test").with_pipeline("p1"))
        .await
        .unwrap();
    assert_eq!(same_pipeline.id, first.id);

    let other_pipeline = cluster
        .leader()
        .submit(request("test").with_pipeline("p2"))
        .await
        .unwrap();
    assert_ne!(other_pipeline.id, first.id);
    assert_eq!(other_pipeline.status, BuildStatus::Waiting);
    assert_eq!(other_pipeline.number, 2);
}

#[tokio::test]
async fn test_dependency_matrix_creates_one_build_per_cell() {
    let mut compile = job("compile");
    compile.params = vec![text_param("os"), text_param("arch")];

    let mut app = job("app");
    app.params = vec![text_param("flavor")];
    app.job_dependencies.push(JobDependency {
        job_name: "compile".to_string(),
        require_successful: true,
        params: vec![
            supply("os", &["linux", "mac"]),
            supply("arch", &["x86", "arm", "@param:flavor@"]),
        ],
        artifacts: Some("bin/**".to_string()),
        destination_path: None,
    });

    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![compile, app]));

    let build = cluster
        .leader()
        .submit(request("app").with_param("flavor", &["riscv"]))
        .await
        .unwrap();

    assert_eq!(build.dependencies.len(), 6);
    assert_eq!(cluster.builds.len(), 7);

    let mut cells = BTreeSet::new();
    for dependence in &build.dependencies {
        assert!(dependence.require_successful);
        assert_eq!(dependence.artifacts.as_deref(), Some("bin/**"));
        let dependency = cluster.build(dependence.dependency);
        assert_eq!(dependency.job_name, "compile");
        assert_eq!(dependency.pipeline, build.pipeline);
        assert_eq!(dependency.submit_reason, "Required by job 'app'");
        let params = dependency.param_map();
        cells.insert((params["os"][0].clone(), params["arch"][0].clone()));
    }
    assert_eq!(cells.len(), 6);
    assert!(cells.contains(&("mac".to_string(), "riscv".to_string())));
}

#[tokio::test]
async fn test_param_validation_errors() {
    let mut deploy = job("deploy");
    deploy.params = vec![
        text_param("target"),
        ParamSpec {
            name: "replicas".to_string(),
            param_type: ParamType::Integer,
            allow_empty: false,
            allow_multiple: false,
        },
    ];

    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![deploy]));

    let err = cluster
        .leader()
        .submit(request("deploy").with_param("target", &["prod"]))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, MeshError::ParamInvalid(m) if m == "Missing param: replicas"),
        "unexpected error: {}",
        err
    );

    let err = cluster
        .leader()
        .submit(
            request("deploy")
                .with_param("target", &["prod"])
                .with_param("replicas", &["2"])
                .with_param("region", &["eu"]),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(&err, MeshError::ParamInvalid(m) if m == "Unknown param: region"),
        "unexpected error: {}",
        err
    );

    let err = cluster
        .leader()
        .submit(
            request("deploy")
                .with_param("target", &["prod"])
                .with_param("replicas", &["two"]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::ParamInvalid(_)));

    assert!(cluster.builds.is_empty());
}

#[tokio::test]
async fn test_unknown_job_and_missing_spec() {
    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![job("test")]));
    cluster.projects.add_commit(PROJECT, "bare", &[], None);

    let err = cluster.leader().submit(request("deploy")).await.unwrap_err();
    assert!(matches!(err, MeshError::JobNotFound { ref job, .. } if job == "deploy"));

    let err = cluster
        .leader()
        .submit(SubmitRequest::new(PROJECT, "bare", "test", MAIN))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::SpecNotFound { .. }));
}

#[tokio::test]
async fn test_cyclic_dependencies_are_rejected() {
    let mut a = job("a");
    a.job_dependencies.push(JobDependency {
        job_name: "b".to_string(),
        require_successful: true,
        params: Vec::new(),
        artifacts: None,
        destination_path: None,
    });
    let mut b = job("b");
    b.job_dependencies.push(JobDependency {
        job_name: "a".to_string(),
        require_successful: true,
        params: Vec::new(),
        artifacts: None,
        destination_path: None,
    });

    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![a, b]));

    let err = cluster.leader().submit(request("a")).await.unwrap_err();
    assert!(matches!(err, MeshError::SpecInvalid { .. }), "unexpected error: {}", err);
}

fn lib_dependency(secret: Option<&str>) -> ProjectDependency {
    ProjectDependency {
        project_path: "acme/lib".to_string(),
        build: BuildSelector::LastSuccessful {
            job_name: "release".to_string(),
            ref_name: None,
        },
        access_token_secret: secret.map(str::to_string),
        artifacts: Some("**".to_string()),
        destination_path: Some("lib".to_string()),
    }
}

/// Project 1 depends on the last successful `release` build of project 2.
fn project_dependency_cluster(secret: Option<&str>) -> (TestCluster, buildmesh::model::BuildId) {
    let mut app = job("app");
    app.project_dependencies.push(lib_dependency(secret));

    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![app]));
    cluster.add_project(LIB, "acme/lib", 1, spec(vec![job("release")]));

    let release = cluster
        .builds
        .create(buildmesh::model::Build::new(LIB, COMMIT, "release", MAIN, "lib-pipeline"));
    finish(&cluster, release.id, BuildStatus::Successful);
    (cluster, release.id)
}

#[tokio::test]
async fn test_project_dependency_requires_access() {
    let (cluster, _) = project_dependency_cluster(None);

    let err = cluster.leader().submit(request("app")).await.unwrap_err();
    assert!(
        matches!(&err, MeshError::PermissionDenied(m) if m == "Unable to access dependency project: acme/lib"),
        "unexpected error: {}",
        err
    );
}

#[tokio::test]
async fn test_project_dependency_with_missing_secret() {
    let (cluster, _) = project_dependency_cluster(Some("LIB_TOKEN"));

    let err = cluster.leader().submit(request("app")).await.unwrap_err();
    assert!(
        matches!(&err, MeshError::Explicit(m) if m == "Secret not found: LIB_TOKEN"),
        "unexpected error: {}",
        err
    );
}

#[tokio::test]
async fn test_project_dependency_resolved_through_access_token() {
    let (cluster, release_id) = project_dependency_cluster(Some("LIB_TOKEN"));
    cluster.secrets.set(PROJECT, "LIB_TOKEN", "tok-123");
    cluster.access.add_access_token("tok-123", UserId(5));
    cluster.access.grant(UserId(5), LIB);

    let build = cluster.leader().submit(request("app")).await.unwrap();
    assert_eq!(build.dependencies.len(), 1);
    let dependence = &build.dependencies[0];
    assert_eq!(dependence.dependency, release_id);
    assert!(dependence.require_successful);
    assert_eq!(dependence.destination_path.as_deref(), Some("lib"));
}

#[tokio::test]
async fn test_project_dependency_resolved_through_submitter() {
    let (cluster, release_id) = project_dependency_cluster(None);
    cluster.access.grant(UserId(8), LIB);

    let build = cluster
        .leader()
        .submit(request("app").with_submitter(UserId(8)))
        .await
        .unwrap();
    assert_eq!(build.dependencies[0].dependency, release_id);
}

#[tokio::test]
async fn test_project_dependency_without_successful_build() {
    let (cluster, release_id) = project_dependency_cluster(None);
    cluster.access.make_public(LIB);
    cluster
        .builds
        .modify(release_id, &mut |b| b.status = BuildStatus::Failed)
        .unwrap();

    let err = cluster.leader().submit(request("app")).await.unwrap_err();
    assert!(
        matches!(&err, MeshError::Explicit(m) if m == "Unable to find dependency build in project: acme/lib"),
        "unexpected error: {}",
        err
    );
}

#[tokio::test]
async fn test_project_dependency_with_invalid_access_token() {
    let (cluster, _) = project_dependency_cluster(Some("LIB_TOKEN"));
    cluster.access.make_public(LIB);
    cluster.secrets.set(PROJECT, "LIB_TOKEN", "not-a-token");

    let err = cluster.leader().submit(request("app")).await.unwrap_err();
    assert!(
        matches!(&err, MeshError::PermissionDenied(m)
            if m == "Unable to access dependency project 'acme/lib': invalid access token"),
        "unexpected error: {}",
        err
    );
}

#[tokio::test]
async fn test_project_dependency_is_interpolated() {
    let mut app = job("app");
    app.params.push(text_param("lib"));
    app.params.push(text_param("release_job"));
    app.project_dependencies.push(ProjectDependency {
        project_path: "acme/@param:lib@".to_string(),
        build: BuildSelector::LastSuccessful {
            job_name: "@param:release_job@".to_string(),
            ref_name: None,
        },
        access_token_secret: None,
        artifacts: None,
        destination_path: Some("deps/@param:lib@".to_string()),
    });

    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![app]));
    cluster.add_project(LIB, "acme/lib", 1, spec(vec![job("release")]));
    cluster.access.make_public(LIB);
    let release = cluster
        .builds
        .create(buildmesh::model::Build::new(LIB, COMMIT, "release", MAIN, "lib-pipeline"));
    finish(&cluster, release.id, BuildStatus::Successful);

    let build = cluster
        .leader()
        .submit(
            request("app")
                .with_param("lib", &["lib"])
                .with_param("release_job", &["release"]),
        )
        .await
        .unwrap();
    assert_eq!(build.dependencies.len(), 1);
    assert_eq!(build.dependencies[0].dependency, release.id);
    assert_eq!(build.dependencies[0].destination_path.as_deref(), Some("deps/lib"));
}

#[tokio::test]
async fn test_failed_submission_leaves_no_builds_behind() {
    let mut app = job("app");
    app.job_dependencies.push(JobDependency {
        job_name: "compile".to_string(),
        require_successful: true,
        params: vec![],
        artifacts: None,
        destination_path: None,
    });
    app.project_dependencies.push(lib_dependency(None));

    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![job("compile"), app]));
    cluster.add_project(LIB, "acme/lib", 1, spec(vec![job("release")]));
    let release = cluster
        .builds
        .create(buildmesh::model::Build::new(LIB, COMMIT, "release", MAIN, "lib-pipeline"));
    finish(&cluster, release.id, BuildStatus::Successful);

    let mut events = cluster.leader().events().subscribe();
    let err = cluster.leader().submit(request("app")).await.unwrap_err();
    assert!(matches!(err, MeshError::PermissionDenied(_)), "unexpected error: {}", err);

    let app_builds: Vec<_> = cluster
        .builds
        .all()
        .into_iter()
        .filter(|b| b.project_id == PROJECT)
        .collect();
    assert!(app_builds.is_empty(), "builds left behind: {:?}", app_builds);
    assert!(events.try_recv().is_err());

    // Nothing stale gets reused once access is granted
    cluster.access.make_public(LIB);
    let build = cluster.leader().submit(request("app")).await.unwrap();
    let compile = cluster.builds.get(build.dependencies[0].dependency).unwrap();
    assert_eq!(compile.job_name, "compile");
    assert_eq!(compile.status, BuildStatus::Waiting);
    assert_eq!(
        cluster.builds.all().iter().filter(|b| b.project_id == PROJECT).count(),
        2
    );
}

#[tokio::test]
async fn test_newer_commit_supersedes_older_build() {
    let cluster = TestCluster::new(1);
    let jobs = spec(vec![job("test")]);
    cluster.add_project(PROJECT, "acme/app", 1, jobs.clone());
    cluster.projects.add_commit(PROJECT, "c2", &[COMMIT], Some(jobs));

    let old = cluster.leader().submit(request("test")).await.unwrap();
    let new = cluster
        .leader()
        .submit(SubmitRequest::new(PROJECT, "c2", "test", MAIN))
        .await
        .unwrap();
    assert_ne!(old.id, new.id);

    assert!(
        cluster
            .wait_for_status(old.id, BuildStatus::Cancelled, Duration::from_secs(5))
            .await,
        "older build should be cancelled"
    );
    assert_eq!(cluster.build(old.id).canceller, None);
    assert_eq!(cluster.build(new.id).status, BuildStatus::Waiting);
}

#[tokio::test]
async fn test_unrelated_commit_does_not_supersede() {
    let cluster = TestCluster::new(1);
    let jobs = spec(vec![job("test")]);
    cluster.add_project(PROJECT, "acme/app", 1, jobs.clone());
    cluster.projects.add_commit(PROJECT, "side", &[], Some(jobs));

    let old = cluster.leader().submit(request("test")).await.unwrap();
    cluster
        .leader()
        .submit(SubmitRequest::new(PROJECT, "side", "test", MAIN))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cluster.build(old.id).status, BuildStatus::Waiting);
}

#[tokio::test]
async fn test_pull_request_build_always_supersedes() {
    let cluster = TestCluster::new(1);
    let jobs = spec(vec![job("test")]);
    cluster.add_project(PROJECT, "acme/app", 1, jobs.clone());
    cluster.projects.add_commit(PROJECT, "force-pushed", &[], Some(jobs));

    let pr_ref = buildmesh::scheduler::pull_request_ref(RequestId(5));
    let old = cluster
        .leader()
        .submit(SubmitRequest::new(PROJECT, COMMIT, "test", pr_ref.clone()).with_request(RequestId(5)))
        .await
        .unwrap();
    cluster
        .leader()
        .submit(SubmitRequest::new(PROJECT, "force-pushed", "test", pr_ref).with_request(RequestId(5)))
        .await
        .unwrap();

    assert!(
        cluster
            .wait_for_status(old.id, BuildStatus::Cancelled, Duration::from_secs(5))
            .await
    );
}

#[tokio::test]
async fn test_resubmit_resets_build_and_failed_dependencies() {
    let mut app = job("app");
    app.job_dependencies.push(JobDependency {
        job_name: "lib".to_string(),
        require_successful: true,
        params: Vec::new(),
        artifacts: None,
        destination_path: None,
    });

    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![job("lib"), app]));

    let build = cluster.leader().submit(request("app")).await.unwrap();
    let lib_id = build.dependencies[0].dependency;

    let err = cluster
        .leader()
        .resubmit(build.id, "again", None)
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::BuildNotFinished(n) if n == build.number));

    finish(&cluster, lib_id, BuildStatus::Failed);
    finish(&cluster, build.id, BuildStatus::Failed);

    let resubmitted = cluster
        .leader()
        .resubmit(build.id, "Flaky network", Some(UserId(4)))
        .await
        .unwrap();
    assert_eq!(resubmitted.id, build.id);
    assert_eq!(resubmitted.status, BuildStatus::Waiting);
    assert_eq!(resubmitted.submit_reason, "Flaky network");
    assert_eq!(resubmitted.submitter, Some(UserId(4)));
    assert!(resubmitted.finish_date.is_none());

    let lib = cluster.build(lib_id);
    assert_eq!(lib.status, BuildStatus::Waiting);
    assert_eq!(
        lib.submit_reason,
        format!("Resubmitted by build #{}", build.number)
    );
}

#[tokio::test]
async fn test_resubmit_leaves_successful_dependencies_alone() {
    let mut app = job("app");
    app.job_dependencies.push(JobDependency {
        job_name: "lib".to_string(),
        require_successful: true,
        params: Vec::new(),
        artifacts: None,
        destination_path: None,
    });

    let cluster = TestCluster::new(1);
    cluster.add_project(PROJECT, "acme/app", 1, spec(vec![job("lib"), app]));

    let build = cluster.leader().submit(request("app")).await.unwrap();
    let lib_id = build.dependencies[0].dependency;
    finish(&cluster, lib_id, BuildStatus::Successful);
    finish(&cluster, build.id, BuildStatus::Failed);

    cluster
        .leader()
        .resubmit(build.id, "retry", None)
        .await
        .unwrap();
    assert_eq!(cluster.build(lib_id).status, BuildStatus::Successful);
    assert_eq!(cluster.build(build.id).status, BuildStatus::Waiting);
}
