mod common;

use std::time::Duration;

use batchgen_comfyui::api::ComfyUIApi;
use batchgen_comfyui::job::JobClient;
use batchgen_core::library::WorkflowLibrary;
use batchgen_core::prompt_file::parse_prompt_file;
use batchgen_pipeline::batch::{BatchRunner, RunCounters, RunSettings, RunStatus};
use batchgen_testing::{unreachable_url, FakeComfyUI, FakeConfig};
use common::{prompt_file, runner, workflows};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn every_requested_image_completes() {
    let server = FakeComfyUI::spawn(FakeConfig::default()).await;
    let templates = workflows(&["square"]);
    let prompts = tempfile::tempdir().unwrap();
    let file = prompt_file(prompts.path(), "batch.txt", "sunset (square):2\n");

    let report = runner(&server.url(), templates.path(), CancellationToken::new())
        .run(&file)
        .await;

    assert_eq!(report.status, RunStatus::Finished);
    assert_eq!(
        report.counters,
        RunCounters {
            total: 2,
            completed: 2,
            failed: 0
        }
    );
    assert_eq!(server.state.submission_count(), 2);
    assert!(report.finished_at >= report.started_at);
}

#[tokio::test]
async fn submissions_carry_bound_prompt_and_fresh_seeds() {
    let server = FakeComfyUI::spawn(FakeConfig::default()).await;
    let templates = workflows(&["square"]);
    let prompts = tempfile::tempdir().unwrap();
    let file = prompt_file(prompts.path(), "batch.txt", "a red fox (square):2\n");

    let runner = runner(&server.url(), templates.path(), CancellationToken::new());
    runner.run(&file).await;

    let submissions = server.state.submissions.lock().unwrap().clone();
    assert_eq!(submissions.len(), 2);
    for submission in &submissions {
        assert_eq!(submission["prompt"]["6"]["inputs"]["text"], "a red fox");
        assert_eq!(submission["client_id"], runner.client().client_id());
        let seed = submission["prompt"]["3"]["inputs"]["seed"].as_u64().unwrap();
        assert!((1..=1_000_000_000).contains(&seed));
    }
    // Untouched nodes survive binding.
    assert_eq!(
        submissions[0]["prompt"]["4"]["inputs"]["ckpt_name"],
        "sd.safetensors"
    );
}

#[tokio::test]
async fn unreachable_server_fails_every_image() {
    let templates = workflows(&["square"]);
    let prompts = tempfile::tempdir().unwrap();
    let file = prompt_file(prompts.path(), "batch.txt", "sunset (square):2\n");

    let report = runner(
        &unreachable_url().await,
        templates.path(),
        CancellationToken::new(),
    )
    .run(&file)
    .await;

    assert_eq!(report.status, RunStatus::Finished);
    assert_eq!(
        report.counters,
        RunCounters {
            total: 2,
            completed: 0,
            failed: 2
        }
    );
}

#[tokio::test]
async fn reported_total_matches_parser_total() {
    let server = FakeComfyUI::spawn(FakeConfig::default()).await;
    let templates = workflows(&["landscape", "portrait"]);
    let prompts = tempfile::tempdir().unwrap();
    let file = prompt_file(
        prompts.path(),
        "mixed.txt",
        "a misty mountain at dawn (landscape):3, portrait):1\n\
         no ratio here\n\
         \n\
         city lights (portrait):2\n",
    );

    let parsed = parse_prompt_file(&file).unwrap();
    let report = runner(&server.url(), templates.path(), CancellationToken::new())
        .run(&file)
        .await;

    assert_eq!(report.counters.total, parsed.total_images());
    assert_eq!(report.counters.total, 6);
    assert_eq!(report.counters.completed, 6);
}

#[tokio::test]
async fn missing_template_fails_only_its_repetitions() {
    let server = FakeComfyUI::spawn(FakeConfig::default()).await;
    let templates = workflows(&["landscape"]);
    let prompts = tempfile::tempdir().unwrap();
    let file = prompt_file(
        prompts.path(),
        "batch.txt",
        "harbor (landscape):1, widescreen):2\n",
    );

    let report = runner(&server.url(), templates.path(), CancellationToken::new())
        .run(&file)
        .await;

    assert_eq!(
        report.counters,
        RunCounters {
            total: 3,
            completed: 1,
            failed: 2
        }
    );
    assert_eq!(server.state.submission_count(), 1);
}

#[tokio::test]
async fn jobs_that_never_finish_time_out() {
    let server = FakeComfyUI::spawn(FakeConfig {
        polls_until_done: None,
        ..Default::default()
    })
    .await;
    let templates = workflows(&["square"]);
    let prompts = tempfile::tempdir().unwrap();
    let file = prompt_file(prompts.path(), "batch.txt", "sunset (square):1\n");

    let cancel = CancellationToken::new();
    let client = JobClient::new(ComfyUIApi::new(server.url()), cancel)
        .with_poll_interval(Duration::from_millis(10));
    let runner = BatchRunner::new(
        client,
        WorkflowLibrary::new(templates.path()),
        RunSettings {
            job_timeout: Duration::from_millis(100),
            request_delay: Duration::ZERO,
        },
    );

    let report = runner.run(&file).await;
    assert_eq!(report.counters.failed, 1);
    assert_eq!(report.counters.completed, 0);
}

#[tokio::test]
async fn file_without_valid_lines_submits_nothing() {
    let server = FakeComfyUI::spawn(FakeConfig::default()).await;
    let templates = workflows(&["square"]);
    let prompts = tempfile::tempdir().unwrap();
    let file = prompt_file(prompts.path(), "empty.txt", "no ratio here\n(broken\n");

    let report = runner(&server.url(), templates.path(), CancellationToken::new())
        .run(&file)
        .await;

    assert_eq!(report.status, RunStatus::Finished);
    assert_eq!(report.counters, RunCounters::default());
    assert_eq!(server.state.submission_count(), 0);
}

#[tokio::test]
async fn missing_prompt_file_is_unreadable() {
    let templates = workflows(&["square"]);
    let prompts = tempfile::tempdir().unwrap();

    let report = runner(
        "http://127.0.0.1:9",
        templates.path(),
        CancellationToken::new(),
    )
    .run(&prompts.path().join("missing.txt"))
    .await;

    assert_eq!(report.status, RunStatus::Unreadable);
    assert_eq!(report.counters, RunCounters::default());
}

#[tokio::test]
async fn cancellation_stops_before_the_next_repetition() {
    let server = FakeComfyUI::spawn(FakeConfig::default()).await;
    let templates = workflows(&["square"]);
    let prompts = tempfile::tempdir().unwrap();
    let file = prompt_file(prompts.path(), "batch.txt", "sunset (square):5\n");

    let cancel = CancellationToken::new();
    let client = JobClient::new(ComfyUIApi::new(server.url()), cancel.clone())
        .with_poll_interval(Duration::from_millis(10));
    let runner = BatchRunner::new(
        client,
        WorkflowLibrary::new(templates.path()),
        RunSettings {
            job_timeout: Duration::from_secs(2),
            request_delay: Duration::from_secs(30),
        },
    );

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(Duration::from_secs(5), runner.run(&file))
        .await
        .expect("run should stop promptly after cancel");

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.counters.total, 5);
    assert_eq!(report.counters.completed, 1);
    assert_eq!(report.counters.remaining(), 4);
    assert_eq!(server.state.submission_count(), 1);
}
