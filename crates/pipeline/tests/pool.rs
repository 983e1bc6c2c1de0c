//! Worker pool scheduling, backpressure, and crash isolation.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;

use common::{
    expect_no_start, expect_start, init_tracing, request, test_config, wait_for_status, Behavior,
    ScriptedEngine,
};
use demix_core::device::Device;
use demix_core::error::CoreError;
use demix_core::task::TaskStatus;
use demix_db::MemoryTaskStore;
use demix_pipeline::SeparationService;

#[tokio::test]
async fn tasks_start_in_submission_order() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut started) = ScriptedEngine::new(Behavior::Gate);
    let service = SeparationService::start(
        test_config(1, vec![], 16, dir.path()),
        Arc::new(MemoryTaskStore::new()),
        engine.clone(),
    )
    .await
    .unwrap();

    let inputs = ["t1.wav", "t2.wav", "t3.wav", "t4.wav"];
    let mut ids = Vec::new();
    for input in inputs {
        ids.push(
            service
                .submit(request(), input.to_string(), 0)
                .await
                .unwrap(),
        );
    }

    // One worker: each release lets exactly the next task in line start.
    for expected in inputs {
        let event = expect_start(&mut started).await;
        assert_eq!(event.input_path, expected);
        engine.release(1);
    }

    for id in ids {
        wait_for_status(&service, id, TaskStatus::Completed).await;
    }
    service.shutdown(true).await;
}

#[tokio::test]
async fn concurrency_never_exceeds_worker_count() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut started) = ScriptedEngine::new(Behavior::Gate);
    let service = SeparationService::start(
        test_config(2, vec![], 16, dir.path()),
        Arc::new(MemoryTaskStore::new()),
        engine.clone(),
    )
    .await
    .unwrap();

    let mut ids = Vec::new();
    for input in ["a.wav", "b.wav", "c.wav", "d.wav"] {
        ids.push(
            service
                .submit(request(), input.to_string(), 0)
                .await
                .unwrap(),
        );
    }

    // Two workers fill up; the third start must wait for a release.
    expect_start(&mut started).await;
    expect_start(&mut started).await;
    expect_no_start(&mut started).await;

    engine.release(4);
    expect_start(&mut started).await;
    expect_start(&mut started).await;

    for id in ids {
        wait_for_status(&service, id, TaskStatus::Completed).await;
    }
    assert!(engine.max_active() <= 2, "saw {} concurrent", engine.max_active());
    service.shutdown(true).await;
}

#[tokio::test]
async fn full_queue_rejects_with_capacity_exceeded() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut started) = ScriptedEngine::new(Behavior::Gate);
    let service = SeparationService::start(
        test_config(1, vec![], 2, dir.path()),
        Arc::new(MemoryTaskStore::new()),
        engine.clone(),
    )
    .await
    .unwrap();

    // First task occupies the single worker...
    let running = service
        .submit(request(), "running.wav".to_string(), 0)
        .await
        .unwrap();
    expect_start(&mut started).await;

    // ...two more fill the queue to its cap...
    let queued_a = service
        .submit(request(), "queued-a.wav".to_string(), 0)
        .await
        .unwrap();
    let queued_b = service
        .submit(request(), "queued-b.wav".to_string(), 0)
        .await
        .unwrap();

    // ...and the next submission is rejected without creating a task.
    let err = service
        .submit(request(), "overflow.wav".to_string(), 0)
        .await
        .unwrap_err();
    assert_matches!(err, CoreError::CapacityExceeded(_));

    engine.release(3);
    for id in [running, queued_a, queued_b] {
        wait_for_status(&service, id, TaskStatus::Completed).await;
    }
    service.shutdown(true).await;
}

#[tokio::test]
async fn devices_are_assigned_round_robin() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut started) = ScriptedEngine::new(Behavior::Gate);
    let service = SeparationService::start(
        test_config(2, vec![0, 1], 16, dir.path()),
        Arc::new(MemoryTaskStore::new()),
        engine.clone(),
    )
    .await
    .unwrap();

    let mut ids = Vec::new();
    for input in ["a.wav", "b.wav", "c.wav"] {
        ids.push(
            service
                .submit(request(), input.to_string(), 0)
                .await
                .unwrap(),
        );
    }

    let first = expect_start(&mut started).await;
    let second = expect_start(&mut started).await;
    assert_eq!(first.device, Device::Cuda(0));
    assert_eq!(second.device, Device::Cuda(1));
    // Both devices busy: at most one execution per device.
    expect_no_start(&mut started).await;

    // Release only the first task (the gate is FIFO), so cuda:0 frees up
    // and the third task lands there.
    engine.release(1);
    let third = expect_start(&mut started).await;
    assert_eq!(third.device, Device::Cuda(0));
    engine.release(2);

    for id in ids {
        wait_for_status(&service, id, TaskStatus::Completed).await;
    }
    service.shutdown(true).await;
}

#[tokio::test]
async fn crash_is_isolated_from_other_tasks() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (engine, _started) = ScriptedEngine::new(Behavior::Succeed);
    // Crashes on every attempt: requeued once, then permanently failed.
    engine.set_behavior("poison.wav", Behavior::Crash { times: u32::MAX });
    let service = SeparationService::start(
        test_config(2, vec![], 16, dir.path()),
        Arc::new(MemoryTaskStore::new()),
        engine.clone(),
    )
    .await
    .unwrap();

    let poison = service
        .submit(request(), "poison.wav".to_string(), 0)
        .await
        .unwrap();
    let healthy_a = service
        .submit(request(), "healthy-a.wav".to_string(), 0)
        .await
        .unwrap();
    let healthy_b = service
        .submit(request(), "healthy-b.wav".to_string(), 0)
        .await
        .unwrap();

    let failed = wait_for_status(&service, poison, TaskStatus::Failed).await;
    assert_eq!(failed.crash_count, 2);
    let reason = failed.error_message.unwrap();
    assert!(reason.contains("crashed"), "unexpected reason: {reason}");

    wait_for_status(&service, healthy_a, TaskStatus::Completed).await;
    wait_for_status(&service, healthy_b, TaskStatus::Completed).await;
    service.shutdown(true).await;
}

#[tokio::test]
async fn single_crash_requeues_and_recovers() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (engine, _started) = ScriptedEngine::new(Behavior::Succeed);
    engine.set_behavior("flaky.wav", Behavior::Crash { times: 1 });
    let service = SeparationService::start(
        test_config(1, vec![], 16, dir.path()),
        Arc::new(MemoryTaskStore::new()),
        engine.clone(),
    )
    .await
    .unwrap();

    let id = service
        .submit(request(), "flaky.wav".to_string(), 0)
        .await
        .unwrap();

    let record = wait_for_status(&service, id, TaskStatus::Completed).await;
    assert_eq!(record.crash_count, 1);
    assert!(!record.output_files.is_empty());
    service.shutdown(true).await;
}

#[tokio::test]
async fn drain_shutdown_waits_for_in_flight_work() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut started) = ScriptedEngine::new(Behavior::Gate);
    let service = Arc::new(
        SeparationService::start(
            test_config(1, vec![], 16, dir.path()),
            Arc::new(MemoryTaskStore::new()),
            engine.clone(),
        )
        .await
        .unwrap(),
    );

    let id = service
        .submit(request(), "slow.wav".to_string(), 0)
        .await
        .unwrap();
    expect_start(&mut started).await;

    let shutdown = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.shutdown(true).await })
    };
    engine.release(1);
    shutdown.await.unwrap();

    let record = service.status(id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
}

#[tokio::test]
async fn drain_timeout_force_fails_stuck_work() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut started) = ScriptedEngine::new(Behavior::Gate);
    let service = SeparationService::start(
        test_config(1, vec![], 16, dir.path()),
        Arc::new(MemoryTaskStore::new()),
        engine.clone(),
    )
    .await
    .unwrap();

    let stuck = service
        .submit(request(), "stuck.wav".to_string(), 0)
        .await
        .unwrap();
    expect_start(&mut started).await;
    let queued = service
        .submit(request(), "queued.wav".to_string(), 0)
        .await
        .unwrap();

    // Never released: the 1s drain timeout elapses and the task is
    // force-cancelled with a shutdown reason.
    service.shutdown(true).await;

    let record = service.status(stuck).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record.error_message.unwrap().contains("shut down"));

    // The queued task never started; it stays pending for restart resume.
    let record = service.status(queued).await.unwrap();
    assert_eq!(record.status, TaskStatus::Pending);

    // New submissions are refused once shutdown has begun.
    let err = service
        .submit(request(), "late.wav".to_string(), 0)
        .await
        .unwrap_err();
    assert_matches!(err, CoreError::Conflict(_));
}
