//! Unit tests for the supervisor against mock workers and samplers

use super::*;
use crate::port::resource_sampler::mocks::{MockResourceSampler, MockSample};
use crate::port::worker_process::mocks::{MockBehavior, MockWorkerLauncher};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::time::sleep;
use tokio_test::assert_ok;

fn request(data: Value) -> JobRequest {
    let mut context = Map::new();
    context.insert("data".to_string(), data);
    JobRequest::new(context)
}

fn supervisor(
    launcher: &MockWorkerLauncher,
    sampler: &MockResourceSampler,
    options: SupervisorOptions,
) -> Supervisor {
    Supervisor::new(
        "data",
        options,
        Arc::new(launcher.clone()),
        Arc::new(sampler.clone()),
    )
    .unwrap()
}

fn quiet_sampler() -> MockResourceSampler {
    MockResourceSampler::with_bytes(1024)
}

async fn wait_for_state(supervisor: &Supervisor, state: SupervisorState) {
    for _ in 0..100 {
        if supervisor.state() == state {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("supervisor never reached {:?}", state);
}

#[tokio::test]
async fn test_echo_and_lazy_launch() {
    let launcher = MockWorkerLauncher::new_echo();
    let sup = supervisor(&launcher, &quiet_sampler(), SupervisorOptions::default());
    assert_eq!(launcher.launches(), 0);

    let ticket = assert_ok!(sup.submit(request(json!("test"))));
    assert_eq!(ticket.await, Ok(json!("test")));
    assert_eq!(sup.state(), SupervisorState::Idle);
    assert_eq!(launcher.launches(), 1);

    let init = &launcher.inits()[0];
    assert_eq!(init.code, "data");
    assert_eq!(init.timeout, Some(600));
}

#[tokio::test]
async fn test_rejects_second_job_while_busy() {
    let launcher = MockWorkerLauncher::new(MockBehavior::Hang);
    let sup = supervisor(
        &launcher,
        &quiet_sampler(),
        SupervisorOptions::default().with_timeout_ms(5_000),
    );

    let (first, _first_ticket) = sup.prepare(request(json!(1)));
    let first_id = first.id.clone();
    assert!(sup.run(first).is_ok());

    let (second, mut second_ticket) = sup.prepare(request(json!(2)));
    let rejection = sup.run(second).unwrap_err();
    assert_eq!(rejection.reason, RejectReason::Busy(first_id.clone()));
    assert_eq!(sup.state(), SupervisorState::Busy(first_id));

    // The rejected job's slot never fired
    tokio_test::assert_pending!(tokio_test::task::spawn(&mut second_ticket).poll());
    drop(rejection);
    assert_eq!(second_ticket.await, Err(JobError::Killed));
}

#[tokio::test]
async fn test_stale_reply_does_not_resolve_job() {
    let launcher = MockWorkerLauncher::new(MockBehavior::StaleThenEcho);
    let sup = supervisor(&launcher, &quiet_sampler(), SupervisorOptions::default());

    let outcome = sup.submit(request(json!("mine"))).unwrap().await;
    assert_eq!(outcome, Ok(json!("mine")));
}

#[tokio::test]
async fn test_execution_error_is_per_job() {
    let launcher = MockWorkerLauncher::new(MockBehavior::Fail("Runtime error: boom".to_string()));
    let sup = supervisor(&launcher, &quiet_sampler(), SupervisorOptions::default());

    let outcome = sup.submit(request(json!(1))).unwrap().await;
    assert_eq!(outcome, Err(JobError::Execution("Runtime error: boom".to_string())));

    launcher.set_behavior(MockBehavior::Echo);
    assert_eq!(sup.submit(request(json!(2))).unwrap().await, Ok(json!(2)));
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test]
async fn test_fatal_preparation_short_circuits_without_dispatch() {
    let launcher = MockWorkerLauncher::new(MockBehavior::Fatal("Syntax error: nope".to_string()));
    let sup = supervisor(&launcher, &quiet_sampler(), SupervisorOptions::default());

    for i in 0..3 {
        let outcome = sup.submit(request(json!(i))).unwrap().await;
        assert_eq!(outcome, Err(JobError::Preparation("Syntax error: nope".to_string())));
    }
    assert_eq!(launcher.launches(), 1);
    assert_eq!(launcher.jobs_sent(), 0);
}

#[tokio::test]
async fn test_relaunch_retries_preparation() {
    let launcher = MockWorkerLauncher::new(MockBehavior::Fatal("Syntax error: nope".to_string()));
    let sup = supervisor(&launcher, &quiet_sampler(), SupervisorOptions::default());

    let outcome = sup.submit(request(json!(1))).unwrap().await;
    assert!(matches!(outcome, Err(JobError::Preparation(_))));

    // A fresh incarnation prepares the code again
    launcher.set_behavior(MockBehavior::Echo);
    sup.kill(false);
    wait_for_state(&sup, SupervisorState::Idle).await;
    for _ in 0..100 {
        if launcher.launches() == 2 {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(launcher.launches(), 2);
    assert_eq!(sup.submit(request(json!(2))).unwrap().await, Ok(json!(2)));
}

#[tokio::test]
async fn test_timeout_kills_and_relaunches() {
    let launcher = MockWorkerLauncher::new(MockBehavior::Hang);
    let sup = supervisor(
        &launcher,
        &quiet_sampler(),
        SupervisorOptions::default().with_timeout_ms(50),
    );
    let mut events = sup.subscribe();

    let outcome = sup.submit(request(json!(1))).unwrap().await;
    assert_eq!(outcome, Err(JobError::Timedout));
    assert_eq!(launcher.kills(), 1);
    assert_eq!(launcher.launches(), 2);

    assert!(matches!(
        events.recv().await.unwrap(),
        SupervisorEvent::Failed { reason: JobError::Timedout }
    ));

    launcher.set_behavior(MockBehavior::Echo);
    assert_eq!(sup.submit(request(json!("again"))).unwrap().await, Ok(json!("again")));
}

#[tokio::test]
async fn test_memory_limit_exceeded() {
    let launcher = MockWorkerLauncher::new(MockBehavior::Hang);
    let sampler = MockResourceSampler::with_bytes(10 * 1024 * 1024);
    let sup = supervisor(
        &launcher,
        &sampler,
        SupervisorOptions::default()
            .with_memory_limit_kb(1024)
            .with_heartbeat_tick_ms(10)
            .with_timeout_ms(5_000),
    );

    let outcome = sup.submit(request(json!(1))).unwrap().await;
    assert_eq!(outcome, Err(JobError::MemoryExceeded));
    assert!(sampler.calls() >= 1);
    assert_eq!(launcher.launches(), 2);
}

#[tokio::test]
async fn test_sampler_misses_and_failures_are_not_fatal() {
    let launcher = MockWorkerLauncher::new(MockBehavior::Delayed(Duration::from_millis(60)));
    let sampler = MockResourceSampler::new(MockSample::Fail("ps exploded".to_string()));
    let sup = supervisor(
        &launcher,
        &sampler,
        SupervisorOptions::default()
            .with_heartbeat_tick_ms(10)
            .with_timeout_ms(5_000),
    );

    assert_eq!(sup.submit(request(json!(1))).unwrap().await, Ok(json!(1)));
    assert!(sampler.calls() >= 1);

    sampler.set(MockSample::Missing);
    assert_eq!(sup.submit(request(json!(2))).unwrap().await, Ok(json!(2)));
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test]
async fn test_timers_disarmed_after_resolution() {
    let launcher = MockWorkerLauncher::new_echo();
    let sampler = quiet_sampler();
    let sup = supervisor(
        &launcher,
        &sampler,
        SupervisorOptions::default()
            .with_timeout_ms(30)
            .with_heartbeat_tick_ms(5),
    );

    assert_eq!(sup.submit(request(json!(1))).unwrap().await, Ok(json!(1)));
    let calls = sampler.calls();
    sleep(Duration::from_millis(80)).await;

    // No stale timeout kill, no sampling while idle
    assert_eq!(launcher.kills(), 0);
    assert_eq!(launcher.launches(), 1);
    assert_eq!(sampler.calls(), calls);
}

#[tokio::test]
async fn test_crash_resolves_with_process_failed() {
    let launcher = MockWorkerLauncher::new(MockBehavior::Hang);
    let sup = supervisor(
        &launcher,
        &quiet_sampler(),
        SupervisorOptions::default().with_timeout_ms(5_000),
    );
    let mut events = sup.subscribe();

    let ticket = sup.submit(request(json!(1))).unwrap();
    wait_for_state(&sup, SupervisorState::Busy(ticket.id().to_string())).await;
    sleep(Duration::from_millis(10)).await;
    launcher.crash_current();

    assert_eq!(ticket.await, Err(JobError::ProcessFailed));
    assert!(matches!(
        events.recv().await.unwrap(),
        SupervisorEvent::Failed { reason: JobError::ProcessFailed }
    ));

    launcher.set_behavior(MockBehavior::Echo);
    assert_eq!(sup.submit(request(json!(2))).unwrap().await, Ok(json!(2)));
    assert_eq!(launcher.launches(), 2);
}

#[tokio::test]
async fn test_kill_with_restart_fails_job_and_relaunches() {
    let launcher = MockWorkerLauncher::new(MockBehavior::Hang);
    let sup = supervisor(
        &launcher,
        &quiet_sampler(),
        SupervisorOptions::default().with_timeout_ms(5_000),
    );

    let ticket = sup.submit(request(json!(1))).unwrap();
    sleep(Duration::from_millis(10)).await;
    sup.kill(false);

    assert_eq!(ticket.await, Err(JobError::ProcessFailed));
    assert_eq!(launcher.launches(), 2);
    assert_eq!(sup.state(), SupervisorState::Idle);
}

#[tokio::test]
async fn test_restart_kill_rejects_work_until_relaunched() {
    let launcher = MockWorkerLauncher::new_echo();
    let sup = supervisor(&launcher, &quiet_sampler(), SupervisorOptions::default());

    for i in 0..20 {
        assert_eq!(sup.submit(request(json!(i))).unwrap().await, Ok(json!(i)));

        sup.kill(false);
        assert_eq!(sup.state(), SupervisorState::Restarting);
        assert!(matches!(
            sup.submit(request(json!("too early"))),
            Err(AppError::Restarting)
        ));
        wait_for_state(&sup, SupervisorState::Idle).await;
    }

    // The job after the last kill lands on a fresh worker, not the dying one
    assert_eq!(sup.submit(request(json!("after"))).unwrap().await, Ok(json!("after")));
    assert_eq!(launcher.launches(), 21);
}

#[tokio::test]
async fn test_restart_kill_without_worker_reopens() {
    let launcher = MockWorkerLauncher::new_echo();
    let sup = supervisor(&launcher, &quiet_sampler(), SupervisorOptions::default());

    sup.kill(false);
    wait_for_state(&sup, SupervisorState::Idle).await;
    assert_eq!(launcher.launches(), 0);
    assert_eq!(sup.submit(request(json!(1))).unwrap().await, Ok(json!(1)));
}

#[tokio::test]
async fn test_kill_without_restart_stops_for_good() {
    let launcher = MockWorkerLauncher::new(MockBehavior::Hang);
    let sup = supervisor(
        &launcher,
        &quiet_sampler(),
        SupervisorOptions::default().with_timeout_ms(5_000),
    );

    let ticket = sup.submit(request(json!(1))).unwrap();
    sleep(Duration::from_millis(10)).await;
    sup.kill(true);

    assert_eq!(ticket.await, Err(JobError::Killed));
    assert_eq!(sup.state(), SupervisorState::Stopped);
    assert!(matches!(
        sup.submit(request(json!(2))),
        Err(AppError::Killed)
    ));
    sleep(Duration::from_millis(20)).await;
    assert_eq!(launcher.launches(), 1);
    assert_eq!(sup.worker_pid(), None);
}

#[tokio::test]
async fn test_launch_failure_resolves_job_and_retries_next_time() {
    let launcher = MockWorkerLauncher::new_echo();
    launcher.fail_next_launches(1);
    let sup = supervisor(&launcher, &quiet_sampler(), SupervisorOptions::default());

    let outcome = sup.submit(request(json!(1))).unwrap().await;
    assert!(matches!(outcome, Err(JobError::Launch(_))));
    assert_eq!(sup.state(), SupervisorState::Idle);

    assert_eq!(sup.submit(request(json!(2))).unwrap().await, Ok(json!(2)));
    assert_eq!(launcher.launches(), 1);
    assert!(sup.worker_pid().is_some());
}

#[tokio::test]
async fn test_invalid_options_rejected() {
    let launcher = MockWorkerLauncher::new_echo();
    let result = Supervisor::new(
        "data",
        SupervisorOptions::default().with_memory_limit_kb(0),
        Arc::new(launcher),
        Arc::new(quiet_sampler()),
    );
    assert!(matches!(result, Err(AppError::Config(_))));
}
