use std::sync::Arc;
use std::time::Duration;

use sandbox_core::fakes::{FakeEngine, FakeScript};
use sandbox_core::{
    Application, BuildOrchestrator, BuildOutcome, Image, RevisionSpec, RunOrchestrator,
    SandboxConfig, ServiceConfig,
};
use tokio_util::sync::CancellationToken;

const PLAN: &str = r#"{
    "name": "ramen",
    "environment": {"SECRET": "s3cr3t"},
    "upload_files": ["application.tar"],
    "services": [
        {"name": "api", "type": "python", "ports": {"metrics": "tcp"}},
        {"name": "jobs", "type": "python-worker"},
        {"name": "db", "type": "postgresql"}
    ]
}"#;

async fn load_plan(dir: &tempfile::TempDir) -> Application {
    std::fs::write(dir.path().join("application.tar"), b"code").unwrap();
    let plan = dir.path().join("sandbox.json");
    std::fs::write(&plan, PLAN).unwrap();
    Application::load(&plan)
        .await
        .unwrap()
        .with_default_environment("alice")
}

async fn base_image(engine: &Arc<FakeEngine>) -> Image {
    engine.add_image("lopter/sandbox-base:latest");
    Image::lookup(
        engine.clone(),
        &RevisionSpec::parse("lopter/sandbox-base").unwrap(),
    )
    .await
    .unwrap()
}

// ── Build ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn build_produces_latest_image_per_buildable_service() {
    let dir = tempfile::tempdir().unwrap();
    let app = load_plan(&dir).await;
    let engine = Arc::new(FakeEngine::new());
    let base = base_image(&engine).await;

    let outcome = BuildOrchestrator::new(SandboxConfig::default())
        .build(&app, Some(&base))
        .await
        .unwrap();

    let images = match outcome {
        BuildOutcome::Built(images) => images,
        BuildOutcome::NothingToBuild => panic!("expected images"),
    };
    assert_eq!(
        images.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["api", "jobs"]
    );
    for (service, image) in &images {
        let repository = format!("ramen-{service}");
        assert_eq!(
            engine.tagged(&repository, "latest").as_deref(),
            Some(image.revision().unwrap())
        );
    }
    // Three stages per service, each in its own container.
    assert_eq!(engine.count_calls("run"), 6);
    assert_eq!(engine.count_calls("rm"), 6);
    assert!(engine.live_containers().is_empty());
}

#[tokio::test]
async fn one_failing_service_fails_the_whole_build() {
    let dir = tempfile::tempdir().unwrap();
    let mut app = load_plan(&dir).await;
    let mut www = ServiceConfig::new("www", "python");
    www.extract_path = Some("/srv/www".to_string());
    app.services.push(www);
    let engine = Arc::new(FakeEngine::new());
    let base = base_image(&engine).await;
    engine.script(
        "udotcloud.builder /srv/www",
        FakeScript::exit(1).with_output("boom\n"),
    );

    let err = BuildOrchestrator::new(SandboxConfig::default())
        .build(&app, Some(&base))
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.starts_with("1 service(s) failed to build"), "{message}");
    assert!(message.contains("service www: build stage exited with status 1"));
    // Siblings ran to completion, and nothing got tagged latest.
    assert_eq!(engine.count_calls("run"), 9);
    assert_eq!(engine.count_calls("rm"), 9);
    assert!(engine.live_containers().is_empty());
    for service in ["api", "jobs", "www"] {
        assert_eq!(engine.tagged(&format!("ramen-{service}"), "latest"), None);
    }
}

// ── Run ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn run_before_build_reports_unbuilt_services() {
    let dir = tempfile::tempdir().unwrap();
    let app = load_plan(&dir).await;
    let engine = Arc::new(FakeEngine::new());

    let err = RunOrchestrator::new(engine.clone(), SandboxConfig::default())
        .with_output(Arc::new(|_| Box::new(tokio::io::sink())))
        .run(&app, CancellationToken::new())
        .await
        .unwrap_err();

    let mut not_built = err.not_built_services();
    not_built.sort_unstable();
    assert_eq!(not_built, vec!["api", "jobs"]);
}

#[tokio::test]
async fn interrupting_a_run_stops_every_service_once() {
    let dir = tempfile::tempdir().unwrap();
    let app = load_plan(&dir).await;
    let engine = Arc::new(FakeEngine::new());
    let base = base_image(&engine).await;
    BuildOrchestrator::new(SandboxConfig::default())
        .build(&app, Some(&base))
        .await
        .unwrap();
    engine.script("supervisord", FakeScript::exit(0).long_running());

    let token = CancellationToken::new();
    let orchestrator = RunOrchestrator::new(engine.clone(), SandboxConfig::default())
        .with_output(Arc::new(|_| Box::new(tokio::io::sink())));
    let run = orchestrator.run(&app, token.clone());
    let interrupt = async {
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.running_containers().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        token.cancel();
    };
    let (outcome, ()) = tokio::join!(run, interrupt);

    outcome.unwrap();
    assert_eq!(engine.count_calls("stop"), 2);
    assert!(engine.running_containers().is_empty());
    assert!(engine.live_containers().is_empty());
}
