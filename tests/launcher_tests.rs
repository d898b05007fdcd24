mod common;

use common::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use testbed_core::constants::request::LABEL_SESSION;
use testbed_core::request::InstanceFile;
use testbed_core::test_utils::RuntimeCall;
use testbed_core::{
    hook, wait, BatchLaunchError, ErrorKind, ExecOutput, InstanceRequest, LaunchOptions,
    LifecyclePhase, TerminateOutcome, TestbedError,
};

#[tokio::test]
async fn test_batch_without_failures_has_no_error() {
    let (runtime, launcher) = fake_launcher();
    let requests = vec![
        simple_request("postgres:16"),
        simple_request("redis:7"),
        simple_request("nginx:1.27"),
    ];

    let outcome = launcher.launch_all(requests, &LaunchOptions::default()).await;

    assert!(outcome.is_success());
    assert!(outcome.error.is_none());
    let images: Vec<&str> = outcome.instances.iter().map(|i| i.image()).collect();
    assert_eq!(images, vec!["postgres:16", "redis:7", "nginx:1.27"]);
    assert_eq!(runtime.created_count(), 3);
}

#[tokio::test]
async fn test_partial_failure_reports_each_failed_index() {
    let (runtime, launcher) = fake_launcher();
    runtime.fail_create("missing:latest");
    runtime.fail_start("crashy:1");

    let requests = vec![
        simple_request("postgres:16"),
        simple_request("missing:latest"),
        simple_request("redis:7"),
        simple_request("crashy:1"),
        simple_request("nginx:1.27"),
    ];
    let submitted = requests.len();

    let outcome = launcher.launch_all(requests, &LaunchOptions::default()).await;
    let error = outcome.error.as_ref().expect("two requests fail");

    assert_eq!(outcome.instances.len() + error.len(), submitted);
    assert_eq!(outcome.instances.len(), 3);
    let indexes: Vec<usize> = error.failures().iter().map(|f| f.index).collect();
    assert_eq!(indexes, vec![1, 3]);
    assert_eq!(error.failure_for(1).unwrap().kind(), ErrorKind::Creation);
    assert_eq!(error.failure_for(3).unwrap().kind(), ErrorKind::Start);

    // the instance that failed to start was created, so it gets cleaned up
    assert_eq!(runtime.created_count(), 4);
    assert_eq!(runtime.terminated_ids().len(), 1);
}

#[tokio::test]
async fn test_slow_failure_does_not_block_siblings_results() {
    let (runtime, launcher) = fake_launcher();
    runtime.script_log("fast", Duration::ZERO, "ready\n");

    let requests = vec![
        InstanceRequest::builder("fast")
            .wait_for(log_within("ready", Duration::from_secs(1)))
            .build()
            .unwrap(),
        InstanceRequest::builder("never")
            .wait_for(log_within("ready", Duration::from_millis(150)))
            .build()
            .unwrap(),
    ];

    let outcome = launcher.launch_all(requests, &LaunchOptions::default()).await;

    assert_eq!(outcome.instances.len(), 1);
    assert_eq!(outcome.instances[0].image(), "fast");
    let error = outcome.error.unwrap();
    assert_eq!(error.failures()[0].index, 1);
    assert_eq!(error.failures()[0].kind(), ErrorKind::ReadinessTimeout);
}

#[tokio::test]
async fn test_log_occurrence_waits_for_second_line() {
    let (runtime, launcher) = fake_launcher();
    runtime.script_log("postgres:16", Duration::ZERO, "database system is ready\n");
    runtime.script_log("postgres:16", Duration::from_millis(150), "database system is ready\n");

    let request = InstanceRequest::builder("postgres:16")
        .wait_for(log_within("database system is ready", Duration::from_secs(2)).with_occurrence(2))
        .build()
        .unwrap();

    let started = Instant::now();
    let instance = launcher.launch(request).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(140));
    assert!(!instance.is_terminated());
}

#[tokio::test]
async fn test_log_occurrence_seen_once_times_out() {
    let (runtime, launcher) = fake_launcher();
    runtime.script_log("postgres:16", Duration::ZERO, "database system is ready\n");

    let request = InstanceRequest::builder("postgres:16")
        .wait_for(log_within("database system is ready", Duration::from_millis(200)).with_occurrence(2))
        .build()
        .unwrap();

    let err = launcher.launch(request).await.unwrap_err();
    match err {
        TestbedError::ReadinessTimeout { strategy, last_observation, .. } => {
            assert!(strategy.contains("database system is ready"));
            assert!(last_observation.contains('1'), "{last_observation}");
        }
        other => panic!("expected readiness timeout, got {other:?}"),
    }
    assert_eq!(runtime.terminated_ids().len(), 1);
}

#[tokio::test]
async fn test_global_timeout_cancels_in_flight_waits() {
    let (_runtime, launcher) = fake_launcher();
    let request = InstanceRequest::builder("never")
        .wait_for(log_within("ready", Duration::from_secs(30)))
        .build()
        .unwrap();
    let options = LaunchOptions::builder()
        .timeout(Duration::from_millis(100))
        .build()
        .unwrap();

    let started = Instant::now();
    let outcome = launcher.launch_all(vec![request], &options).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    let error = outcome.error.unwrap();
    assert_eq!(error.failures()[0].kind(), ErrorKind::Cancelled);
}

#[tokio::test]
async fn test_caller_cancellation_mid_poll() {
    let (_runtime, launcher) = fake_launcher();
    let token = CancellationToken::new();
    let options = LaunchOptions::builder()
        .cancellation(token.clone())
        .build()
        .unwrap();
    let request = InstanceRequest::builder("never")
        .wait_for(log_within("ready", Duration::from_secs(30)))
        .build()
        .unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        token.cancel();
    });

    let started = Instant::now();
    let err = launcher.launch_with(request, &options).await.unwrap_err();

    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_reuse_creates_once_and_shares_lease() {
    let (runtime, launcher) = fake_launcher();
    runtime.set_create_delay(Duration::from_millis(50));

    let requests = (0..3).map(|_| reuse_request("redis:7", "shared-cache")).collect();
    let outcome = launcher.launch_all(requests, &LaunchOptions::default()).await;

    assert!(outcome.error.is_none());
    assert_eq!(outcome.instances.len(), 3);
    assert_eq!(runtime.created_count(), 1);
    assert_eq!(outcome.instances.iter().filter(|i| i.is_reused()).count(), 2);
    let id = outcome.instances[0].id().to_string();
    assert!(outcome.instances.iter().all(|i| i.id() == id));

    let first = outcome.instances[0].terminate().await.unwrap();
    assert_eq!(first, TerminateOutcome::Released);
    // the other handles still reach a live instance
    assert_eq!(outcome.instances[1].host().await.unwrap(), "localhost");

    assert_eq!(outcome.instances[1].terminate().await.unwrap(), TerminateOutcome::Released);
    assert_eq!(outcome.instances[2].terminate().await.unwrap(), TerminateOutcome::Terminated);
    assert_eq!(runtime.terminated_ids(), vec![id]);

    assert_eq!(
        outcome.instances[0].terminate().await.unwrap(),
        TerminateOutcome::AlreadyTerminated
    );
}

#[tokio::test]
async fn test_reuse_after_release_creates_again() {
    let (runtime, launcher) = fake_launcher();

    let first = launcher.launch(reuse_request("redis:7", "cache")).await.unwrap();
    assert_eq!(first.terminate().await.unwrap(), TerminateOutcome::Terminated);

    let second = launcher.launch(reuse_request("redis:7", "cache")).await.unwrap();
    assert!(!second.is_reused());
    assert_ne!(first.id(), second.id());
    assert_eq!(runtime.created_count(), 2);
}

#[tokio::test]
async fn test_shared_instance_removed_with_creator_hooks() {
    let (runtime, launcher) = fake_launcher();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let request_with_hook = |label: &'static str| {
        let seen = seen.clone();
        InstanceRequest::builder("postgres:16")
            .name("shared-db")
            .reuse(true)
            .hook(
                LifecyclePhase::PreTerminate,
                hook(move |_ctx| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().push(label);
                        Ok(())
                    }
                }),
            )
            .build()
            .unwrap()
    };

    let creator = launcher.launch(request_with_hook("creator")).await.unwrap();
    let attacher = launcher.launch(request_with_hook("attacher")).await.unwrap();
    assert!(attacher.is_reused());

    assert_eq!(creator.terminate().await.unwrap(), TerminateOutcome::Released);
    assert!(seen.lock().is_empty());

    assert_eq!(attacher.terminate().await.unwrap(), TerminateOutcome::Terminated);
    assert_eq!(*seen.lock(), vec!["creator"]);
    assert_eq!(runtime.terminated_ids().len(), 1);
}

#[tokio::test]
async fn test_reuse_attaches_to_external_instance() {
    let (runtime, launcher) = fake_launcher();
    let external = runtime.add_external("postgres:16", "shared-db");

    let instance = launcher
        .launch(reuse_request("postgres:16", "shared-db"))
        .await
        .unwrap();

    assert!(instance.is_reused());
    assert_eq!(instance.id(), external.id);
    assert_eq!(runtime.created_count(), 0);

    assert_eq!(instance.terminate().await.unwrap(), TerminateOutcome::Detached);
    assert!(runtime.terminated_ids().is_empty());
    assert!(runtime.is_running(&external.id));
}

#[tokio::test]
async fn test_hooks_run_in_phase_order() {
    let (_runtime, launcher) = fake_launcher();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut builder = InstanceRequest::builder("nginx:1.27");
    for phase in [
        LifecyclePhase::PreCreate,
        LifecyclePhase::PostCreate,
        LifecyclePhase::PreStart,
        LifecyclePhase::PostStart,
        LifecyclePhase::PostReady,
        LifecyclePhase::PreTerminate,
        LifecyclePhase::PostTerminate,
    ] {
        let seen = seen.clone();
        builder = builder.hook(
            phase,
            hook(move |ctx| {
                let seen = seen.clone();
                async move {
                    assert_eq!(ctx.instance.is_none(), ctx.phase == LifecyclePhase::PreCreate);
                    seen.lock().push(ctx.phase);
                    Ok(())
                }
            }),
        );
    }

    let instance = launcher.launch(builder.build().unwrap()).await.unwrap();
    assert_eq!(seen.lock().len(), 5);

    instance.terminate().await.unwrap();
    assert_eq!(
        *seen.lock(),
        vec![
            LifecyclePhase::PreCreate,
            LifecyclePhase::PostCreate,
            LifecyclePhase::PreStart,
            LifecyclePhase::PostStart,
            LifecyclePhase::PostReady,
            LifecyclePhase::PreTerminate,
            LifecyclePhase::PostTerminate,
        ]
    );
}

#[tokio::test]
async fn test_failing_hook_aborts_later_phases() {
    let (runtime, launcher) = fake_launcher();
    let post_start_ran = Arc::new(Mutex::new(false));
    let flag = post_start_ran.clone();

    let request = InstanceRequest::builder("nginx:1.27")
        .hook(
            LifecyclePhase::PreStart,
            hook(|_ctx| async { Err(TestbedError::configuration("tls material missing")) }),
        )
        .hook(
            LifecyclePhase::PostStart,
            hook(move |_ctx| {
                let flag = flag.clone();
                async move {
                    *flag.lock() = true;
                    Ok(())
                }
            }),
        )
        .build()
        .unwrap();

    let err = launcher.launch(request).await.unwrap_err();

    match err {
        TestbedError::Hook { phase, reason } => {
            assert_eq!(phase, LifecyclePhase::PreStart);
            assert!(reason.contains("tls material missing"));
        }
        other => panic!("expected hook error, got {other:?}"),
    }
    assert!(!*post_start_ran.lock());
    assert!(!runtime
        .calls()
        .iter()
        .any(|call| matches!(call, RuntimeCall::Start { .. })));
    assert_eq!(runtime.terminated_ids().len(), 1);
}

#[tokio::test]
async fn test_failed_instance_left_in_place_without_cleanup() {
    let (runtime, launcher) = fake_launcher();
    runtime.fail_start("crashy:1");
    let options = LaunchOptions::builder()
        .cleanup_failed_instances(false)
        .build()
        .unwrap();

    let outcome = launcher
        .launch_all(vec![simple_request("crashy:1")], &options)
        .await;

    assert_eq!(outcome.error.unwrap().failures()[0].kind(), ErrorKind::Start);
    assert!(runtime.terminated_ids().is_empty());
}

#[tokio::test]
async fn test_files_are_copied_before_start() {
    let (runtime, launcher) = fake_launcher();
    let dir = tempfile::tempdir().unwrap();
    let host_file = dir.path().join("init.sql");
    std::fs::write(&host_file, "CREATE TABLE t (id int);").unwrap();

    let request = InstanceRequest::builder("postgres:16")
        .file(InstanceFile::from_host(&host_file, "/docker-entrypoint-initdb.d/init.sql"))
        .file(InstanceFile::from_bytes("secret", "/run/secrets/token").with_mode(0o600))
        .build()
        .unwrap();

    let instance = launcher.launch(request).await.unwrap();

    let files = runtime.copied_files(instance.id());
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].0, "/docker-entrypoint-initdb.d/init.sql");
    assert_eq!(files[0].1, b"CREATE TABLE t (id int);");
    assert_eq!(files[1].2, 0o600);

    let calls = runtime.calls();
    let copy = calls
        .iter()
        .position(|call| matches!(call, RuntimeCall::CopyFile { .. }))
        .unwrap();
    let start = calls
        .iter()
        .position(|call| matches!(call, RuntimeCall::Start { .. }))
        .unwrap();
    assert!(copy < start);
}

#[tokio::test]
async fn test_missing_host_file_fails_before_create() {
    let (runtime, launcher) = fake_launcher();
    let request = InstanceRequest::builder("postgres:16")
        .file(InstanceFile::from_host("/definitely/not/here.sql", "/init.sql"))
        .build()
        .unwrap();

    let err = launcher.launch(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(runtime.created_count(), 0);
}

#[tokio::test]
async fn test_after_ready_command_failure_is_post_ready_hook_error() {
    let (runtime, launcher) = fake_launcher();
    runtime.script_exec(&["psql", "-c", "SELECT 1"], vec![ExecOutput::new(0, "1")]);
    runtime.script_exec(&["init-db"], vec![ExecOutput::new(3, "relation exists")]);

    let request = InstanceRequest::builder("postgres:16")
        .after_ready_command(["psql", "-c", "SELECT 1"])
        .after_ready_command(["init-db"])
        .build()
        .unwrap();

    let err = launcher.launch(request).await.unwrap_err();
    match err {
        TestbedError::Hook { phase, reason } => {
            assert_eq!(phase, LifecyclePhase::PostReady);
            assert!(reason.contains("exited with code 3"));
        }
        other => panic!("expected hook error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_customizer_error_stops_before_create() {
    let (runtime, launcher) = fake_launcher();
    let request = InstanceRequest::builder("postgres:16")
        .customize(|request: &mut InstanceRequest| {
            request.env.insert("POSTGRES_DB".to_string(), "app".to_string());
            Ok(())
        })
        .customize(|_request: &mut InstanceRequest| {
            Err(TestbedError::configuration("no credentials available"))
        })
        .build()
        .unwrap();

    let err = launcher.launch(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Customization);
    assert_eq!(runtime.created_count(), 0);
}

#[tokio::test]
async fn test_not_started_request_skips_start_and_wait() {
    let (runtime, launcher) = fake_launcher();
    let request = InstanceRequest::builder("postgres:16")
        .started(false)
        .wait_for(log_within("never printed", Duration::from_millis(50)))
        .build()
        .unwrap();

    let instance = launcher.launch(request).await.unwrap();

    assert!(!runtime.is_running(instance.id()));
    assert!(!runtime
        .calls()
        .iter()
        .any(|call| matches!(call, RuntimeCall::Start { .. })));
}

#[tokio::test]
async fn test_session_label_is_stamped() {
    let (runtime, launcher) = fake_launcher();
    let instance = launcher.launch(simple_request("redis:7")).await.unwrap();

    let labels = runtime.labels(instance.id());
    assert_eq!(
        labels.get(LABEL_SESSION),
        Some(&launcher.session_id().to_string())
    );
}

#[tokio::test]
async fn test_max_concurrency_still_launches_everything() {
    let (runtime, launcher) = fake_launcher();
    runtime.set_create_delay(Duration::from_millis(20));
    let options = LaunchOptions::builder().max_concurrency(1).build().unwrap();

    let requests = (0..4).map(|_| simple_request("redis:7")).collect();
    let outcome = launcher.launch_all(requests, &options).await;

    assert!(outcome.error.is_none());
    assert_eq!(outcome.instances.len(), 4);
}

#[tokio::test]
async fn test_concurrency_bound_beyond_semaphore_limit_is_rejected() {
    let err = LaunchOptions::builder()
        .max_concurrency(usize::MAX)
        .build()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let mut config = fast_config();
    config.launcher.max_concurrency = Some(usize::MAX);
    assert!(testbed_core::ConfigManager::from_config(config).is_err());

    let (_runtime, launcher) = fake_launcher();
    let options = LaunchOptions::builder()
        .max_concurrency(tokio::sync::Semaphore::MAX_PERMITS)
        .build()
        .unwrap();
    let requests = (0..3).map(|_| simple_request("redis:7")).collect();
    let outcome = launcher.launch_all(requests, &options).await;
    assert!(outcome.is_success());
    assert_eq!(outcome.instances.len(), 3);
}

#[tokio::test]
async fn test_operations_after_terminate() {
    let (_runtime, launcher) = fake_launcher();
    let instance = launcher.launch(simple_request("redis:7")).await.unwrap();
    let clone = instance.clone();

    assert_eq!(instance.terminate().await.unwrap(), TerminateOutcome::Terminated);
    assert!(clone.is_terminated());
    assert_eq!(clone.terminate().await.unwrap(), TerminateOutcome::AlreadyTerminated);

    let err = clone.logs().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyTerminated);
}

#[tokio::test]
async fn test_batch_error_downcasts_through_dynamic_errors() {
    let (runtime, launcher) = fake_launcher();
    runtime.fail_create("missing:latest");

    let outcome = launcher
        .launch_all(
            vec![simple_request("redis:7"), simple_request("missing:latest")],
            &LaunchOptions::default(),
        )
        .await;
    let (instances, error) = outcome.into_result().unwrap_err();
    assert_eq!(instances.len(), 1);

    let as_anyhow = anyhow::Error::new(error.clone());
    let recovered = as_anyhow.downcast_ref::<BatchLaunchError>().unwrap();
    assert_eq!(recovered.failures()[0].index, 1);

    let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(error);
    assert!(boxed.downcast_ref::<BatchLaunchError>().is_some());
}

#[tokio::test]
async fn test_empty_batch() {
    let (_runtime, launcher) = fake_launcher();
    let outcome = launcher.launch_all(Vec::new(), &LaunchOptions::default()).await;
    assert!(outcome.instances.is_empty());
    assert!(outcome.error.is_none());
}

#[tokio::test]
async fn test_launcher_from_loaded_config() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("testbed-config.yaml"),
        "launcher:\n  max_concurrency: 2\nwait:\n  poll_interval_ms: 25\ntest:\n  launcher:\n    cleanup_failed_instances: false\n",
    )
    .unwrap();

    let manager =
        testbed_core::ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
            .unwrap();
    let runtime = Arc::new(testbed_core::test_utils::FakeRuntime::new());
    let launcher = testbed_core::Launcher::with_config(runtime, manager);

    assert_eq!(launcher.config().launcher.max_concurrency, Some(2));
    assert!(!launcher.config().launcher.cleanup_failed_instances);
    assert_eq!(launcher.config().wait.poll_interval_ms, 25);

    let outcome = launcher
        .launch_all(vec![simple_request("redis:7")], &LaunchOptions::default())
        .await;
    tokio_test::assert_ok!(outcome.into_result());
}

#[test]
fn test_wait_helpers_build_strategies() {
    let strategy: testbed_core::WaitStrategy = wait::for_all(vec![
        wait::for_log("ready").into(),
        wait::for_exposed_port().into(),
    ])
    .into();
    assert!(strategy.validate().is_ok());
}
