//! Parallel build of an application's services.
//!
//! Every buildable service goes through its own pipeline, concurrently with
//! the others:
//!
//! 1. install system packages, when the service asks for some;
//! 2. upload the service bundle and unpack it at the extract path;
//! 3. run the bootstrap script installing the builder (failure only warns);
//! 4. run the builder, committing into `<app>-<service>:ts-<unix seconds>`.
//!
//! Each stage runs in a fresh container created from the previous stage's
//! commit. Once every pipeline finished, the build fails as a whole if any of
//! them failed; otherwise every result is also tagged `latest`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::bundle::{BundleError, BundleRenderer, TarBundler};
use crate::config::SandboxConfig;
use crate::container::{Container, ContainerError, RunOptions};
use crate::engine::argv;
use crate::image::{Image, ImageError};
use crate::revspec::{RevisionSpec, LATEST_TAG};
use crate::service::{Application, ServiceConfig, ServiceError};

/// A step of a service build pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    SystemPackages,
    Upload,
    Bootstrap,
    Build,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildStage::SystemPackages => "system packages",
            BuildStage::Upload => "upload",
            BuildStage::Bootstrap => "bootstrap",
            BuildStage::Build => "build",
        })
    }
}

/// Errors produced by a build.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no base image given (you can pull and try lopter/sandbox-base)")]
    NoBaseImage,

    #[error("service {service}: {stage} stage failed: {source}")]
    Stage {
        service: String,
        stage: BuildStage,
        #[source]
        source: ContainerError,
    },

    #[error("service {service}: {stage} stage exited with status {exit_code}")]
    StageFailed {
        service: String,
        stage: BuildStage,
        exit_code: i32,
        logs: String,
    },

    #[error("service {service}: can't render bundle: {source}")]
    ServiceBundle {
        service: String,
        #[source]
        source: BundleError,
    },

    #[error("service {service}: can't tag result: {source}")]
    Tag {
        service: String,
        #[source]
        source: ImageError,
    },

    #[error("service {service}: build task died: {reason}")]
    Panicked { service: String, reason: String },

    #[error("{} service(s) failed to build: {}", .failures.len(), join_errors(.failures))]
    ServicesFailed { failures: Vec<BuildError> },

    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_errors(errors: &[BuildError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for builds.
pub type Result<T> = std::result::Result<T, BuildError>;

/// What a successful build produced.
#[derive(Debug)]
pub enum BuildOutcome {
    /// The application has no buildable service.
    NothingToBuild,
    /// Resulting image of each buildable service, by service name.
    Built(BTreeMap<String, Image>),
}

impl BuildOutcome {
    pub fn images(&self) -> Option<&BTreeMap<String, Image>> {
        match self {
            BuildOutcome::NothingToBuild => None,
            BuildOutcome::Built(images) => Some(images),
        }
    }
}

/// Builds every buildable service of an application in parallel.
pub struct BuildOrchestrator {
    config: SandboxConfig,
    renderer: Arc<dyn BundleRenderer>,
}

impl BuildOrchestrator {
    pub fn new(config: SandboxConfig) -> Self {
        let renderer = Arc::new(TarBundler::new(config.clone()));
        Self { config, renderer }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn BundleRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Build `application` on top of `base`.
    ///
    /// Returns [`BuildOutcome::NothingToBuild`] when no service is buildable,
    /// without requiring a base image. Intermediate containers are removed
    /// even when the build fails; partial results are never returned.
    #[instrument(skip_all, fields(application = %application.name))]
    pub async fn build(&self, application: &Application, base: Option<&Image>) -> Result<BuildOutcome> {
        let services: Vec<ServiceConfig> = application
            .buildable_services()
            .into_iter()
            .cloned()
            .collect();
        if services.is_empty() {
            info!("nothing to build");
            return Ok(BuildOutcome::NothingToBuild);
        }
        let base = base.ok_or(BuildError::NoBaseImage)?;

        let build_dir = tempfile::Builder::new().prefix("sandbox-").tempdir()?;
        let app_files = self
            .renderer
            .render_application(application, build_dir.path())
            .await?;
        let timestamp = Utc::now().timestamp();
        let application = Arc::new(application.clone());

        debug!(services = services.len(), base = %base, "starting parallel build");
        let handles: Vec<(String, JoinHandle<Result<Image>>)> = services
            .into_iter()
            .map(|service| {
                let name = service.name.clone();
                let pipeline = ServicePipeline {
                    config: self.config.clone(),
                    renderer: Arc::clone(&self.renderer),
                    application: Arc::clone(&application),
                    service,
                    base: base.clone(),
                    build_dir: build_dir.path().to_path_buf(),
                    app_files: app_files.clone(),
                    timestamp,
                };
                (name, tokio::spawn(pipeline.run()))
            })
            .collect();

        let mut images = BTreeMap::new();
        let mut failures = Vec::new();
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(image)) => {
                    images.insert(name, image);
                }
                Ok(Err(e)) => {
                    error!(service = %name, error = %e, "couldn't build service");
                    failures.push(e);
                }
                Err(e) => {
                    error!(service = %name, error = %e, "build task died");
                    failures.push(BuildError::Panicked {
                        service: name,
                        reason: e.to_string(),
                    });
                }
            }
        }
        drop(build_dir);

        if !failures.is_empty() {
            return Err(BuildError::ServicesFailed { failures });
        }

        for (name, image) in &images {
            image
                .add_tag(LATEST_TAG)
                .await
                .map_err(|source| BuildError::Tag {
                    service: name.clone(),
                    source,
                })?;
            info!(service = %name, image = %image, "service built");
        }
        Ok(BuildOutcome::Built(images))
    }
}

/// Everything one service's pipeline needs, owned so it can run in a task.
struct ServicePipeline {
    config: SandboxConfig,
    renderer: Arc<dyn BundleRenderer>,
    application: Arc<Application>,
    service: ServiceConfig,
    base: Image,
    build_dir: PathBuf,
    app_files: Vec<PathBuf>,
    timestamp: i64,
}

impl ServicePipeline {
    #[instrument(skip_all, fields(service = %self.service.name))]
    async fn run(self) -> Result<Image> {
        info!(service_type = %self.service.service_type, "building service");
        let mut current = self.base.clone();

        if !self.service.system_packages.is_empty() {
            let stage = BuildStage::SystemPackages;
            debug!(packages = %self.service.system_packages.join(", "), "installing system packages");
            let mut container = self.container(&current, RevisionSpec::anonymous(), stage)?;
            container
                .install_system_packages(&self.service.system_packages)
                .await
                .map_err(|e| self.stage_error(stage, e))?;
            self.check_exit(stage, &container)?;
            current = self.take_result(stage, &mut container)?;
        }

        let stage = BuildStage::Upload;
        let bundle = self
            .renderer
            .render_service(
                &self.application,
                &self.service,
                &self.build_dir,
                &self.app_files,
            )
            .await
            .map_err(|source| BuildError::ServiceBundle {
                service: self.service.name.clone(),
                source,
            })?;
        let extract_path = self.service.extract_path(&self.config);
        debug!(bundle = %bundle.display(), %extract_path, "uploading service bundle");
        let mut container = self.container(&current, RevisionSpec::anonymous(), stage)?;
        container
            .run(
                &argv(&["tar", "-xf", "-", "-C", extract_path.as_str()]),
                RunOptions::new().with_stdin(),
                move |mut handle| async move {
                    let mut stdin = handle
                        .take_stdin()
                        .ok_or_else(|| ContainerError::body("container stdin isn't available"))?;
                    let mut source = tokio::fs::File::open(&bundle).await?;
                    tokio::io::copy(&mut source, &mut stdin).await?;
                    stdin.shutdown().await?;
                    Ok::<_, ContainerError>(())
                },
            )
            .await
            .map_err(|e| self.stage_error(stage, e))?;
        self.check_exit(stage, &container)?;
        current = self.take_result(stage, &mut container)?;

        let stage = BuildStage::Bootstrap;
        let bootstrap = self
            .service
            .extracted(&self.config, &self.config.bootstrap_script);
        let mut container = self.container(&current, RevisionSpec::anonymous(), stage)?;
        container
            .run(&argv(&[bootstrap.as_str()]), RunOptions::new(), |_| async {
                Ok(())
            })
            .await
            .map_err(|e| self.stage_error(stage, e))?;
        debug!(logs = %container.logs_text(), "builder bootstrap logs");
        match container.exit_code() {
            Some(0) => {}
            code => warn!(
                exit_code = code.unwrap_or(-1),
                "couldn't install the builder (bootstrap script failed)"
            ),
        }
        current = self.take_result(stage, &mut container)?;

        let stage = BuildStage::Build;
        let result_spec = self
            .service
            .result_spec(&self.application.name, self.timestamp)?;
        let mut container = self.container(&current, result_spec, stage)?;
        container
            .run(
                &argv(&[self.config.builder_path.as_str(), extract_path.as_str()]),
                RunOptions::new()
                    .as_user(self.config.service_user.as_str())
                    .env("HOME", self.config.home_dir.as_str()),
                |_| async { Ok(()) },
            )
            .await
            .map_err(|e| self.stage_error(stage, e))?;
        info!(logs = %container.logs_text(), "build logs");
        self.check_exit(stage, &container)?;
        self.take_result(stage, &mut container)
    }

    fn container(&self, image: &Image, commit_as: RevisionSpec, stage: BuildStage) -> Result<Container> {
        image
            .instantiate(Some(commit_as))
            .map_err(|e| self.stage_error(stage, e.into()))
    }

    fn check_exit(&self, stage: BuildStage, container: &Container) -> Result<()> {
        match container.exit_code() {
            Some(0) => Ok(()),
            code => {
                let exit_code = code.unwrap_or(-1);
                error!(%stage, exit_code, "stage failed");
                Err(BuildError::StageFailed {
                    service: self.service.name.clone(),
                    stage,
                    exit_code,
                    logs: container.logs_text(),
                })
            }
        }
    }

    fn take_result(&self, stage: BuildStage, container: &mut Container) -> Result<Image> {
        container
            .take_result()
            .ok_or_else(|| self.stage_error(stage, ContainerError::body("nothing was committed")))
    }

    fn stage_error(&self, stage: BuildStage, source: ContainerError) -> BuildError {
        BuildError::Stage {
            service: self.service.name.clone(),
            stage,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::fakes::{FakeEngine, FakeScript};

    async fn setup() -> (Arc<FakeEngine>, Image) {
        let engine = Arc::new(FakeEngine::new());
        engine.add_image("lopter/sandbox-base:latest");
        let base = Image::lookup(
            engine.clone(),
            &RevisionSpec::parse("lopter/sandbox-base").unwrap(),
        )
        .await
        .unwrap();
        (engine, base)
    }

    fn application(services: &[(&str, &str)]) -> Application {
        let mut app = Application::new("ramen");
        for (name, service_type) in services {
            app.services.push(ServiceConfig::new(*name, *service_type));
        }
        app
    }

    fn stage_commands(engine: &FakeEngine) -> Vec<String> {
        engine
            .calls()
            .into_iter()
            .filter(|call| call[0] == "run")
            .map(|call| call.last().cloned().unwrap_or_default())
            .collect()
    }

    #[tokio::test]
    async fn test_nothing_to_build() {
        let (engine, base) = setup().await;
        let orchestrator = BuildOrchestrator::new(SandboxConfig::default());
        let app = application(&[("db", "postgresql")]);

        let outcome = orchestrator.build(&app, Some(&base)).await.unwrap();
        assert!(matches!(outcome, BuildOutcome::NothingToBuild));
        assert!(outcome.images().is_none());

        let outcome = orchestrator.build(&app, None).await.unwrap();
        assert!(matches!(outcome, BuildOutcome::NothingToBuild));
        assert_eq!(engine.count_calls("run"), 0);
    }

    #[tokio::test]
    async fn test_missing_base_image() {
        let err = BuildOrchestrator::new(SandboxConfig::default())
            .build(&application(&[("api", "python")]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::NoBaseImage));
    }

    #[tokio::test]
    async fn test_single_service_pipeline() {
        let (engine, base) = setup().await;
        engine.script(
            "udotcloud.builder",
            FakeScript::exit(0).with_output("Successfully built\n"),
        );

        let outcome = BuildOrchestrator::new(SandboxConfig::default())
            .build(&application(&[("api", "python")]), Some(&base))
            .await
            .unwrap();
        let images = outcome.images().unwrap();
        let image = &images["api"];
        let spec = image.spec().unwrap();
        assert_eq!(spec.repository(), Some("ramen-api"));
        assert!(spec.tag().unwrap().starts_with("ts-"));

        assert_eq!(
            stage_commands(&engine),
            vec![
                "/home/dotcloud".to_string(),
                "/home/dotcloud/bootstrap.sh".to_string(),
                "/home/dotcloud".to_string(),
            ]
        );
        assert_eq!(
            engine.tagged("ramen-api", "latest").as_deref(),
            Some(image.revision().unwrap())
        );
        assert_eq!(engine.count_calls("rm"), 3);
        assert!(engine.live_containers().is_empty());
    }

    #[tokio::test]
    async fn test_system_packages_stage_runs_first() {
        let (engine, base) = setup().await;
        let mut app = application(&[("api", "python")]);
        app.services[0].system_packages = vec!["libpq-dev".to_string()];

        BuildOrchestrator::new(SandboxConfig::default())
            .build(&app, Some(&base))
            .await
            .unwrap();

        let commands = stage_commands(&engine);
        assert_eq!(commands.len(), 4);
        assert!(commands[0].contains("apt-get -y install libpq-dev"));
        assert_eq!(engine.count_calls("rm"), 4);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_only_warns() {
        let (engine, base) = setup().await;
        engine.script("bootstrap.sh", FakeScript::exit(1).with_output("oops\n"));

        let outcome = BuildOrchestrator::new(SandboxConfig::default())
            .build(&application(&[("api", "python")]), Some(&base))
            .await
            .unwrap();
        assert!(outcome.images().unwrap().contains_key("api"));
    }

    #[tokio::test]
    async fn test_builder_failure_fails_the_build() {
        let (engine, base) = setup().await;
        engine.script(
            "udotcloud.builder",
            FakeScript::exit(2).with_output("pip: command not found\n"),
        );

        let err = BuildOrchestrator::new(SandboxConfig::default())
            .build(&application(&[("api", "python")]), Some(&base))
            .await
            .unwrap_err();
        let failures = match err {
            BuildError::ServicesFailed { failures } => failures,
            other => panic!("expected ServicesFailed, got {other:?}"),
        };
        assert_eq!(failures.len(), 1);
        match &failures[0] {
            BuildError::StageFailed {
                service,
                stage,
                exit_code,
                logs,
            } => {
                assert_eq!(service, "api");
                assert_eq!(*stage, BuildStage::Build);
                assert_eq!(*exit_code, 2);
                assert_eq!(logs, "pip: command not found\n");
            }
            other => panic!("expected StageFailed, got {other:?}"),
        }
        assert!(engine.tagged("ramen-api", "latest").is_none());
        assert!(engine.live_containers().is_empty());
    }

    #[tokio::test]
    async fn test_upload_failure_is_fatal() {
        let (engine, base) = setup().await;
        engine.script("tar -xf", FakeScript::exit(2));

        let err = BuildOrchestrator::new(SandboxConfig::default())
            .build(&application(&[("api", "python")]), Some(&base))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("upload stage exited with status 2"));
        assert_eq!(engine.count_calls("run"), 1);
    }

    #[tokio::test]
    async fn test_engine_failure_names_service_and_stage() {
        let (engine, base) = setup().await;
        engine.fail_command("commit", "no space left on device");

        let err = BuildOrchestrator::new(SandboxConfig::default())
            .build(&application(&[("api", "python")]), Some(&base))
            .await
            .unwrap_err();
        let failures = match err {
            BuildError::ServicesFailed { failures } => failures,
            other => panic!("expected ServicesFailed, got {other:?}"),
        };
        assert!(matches!(
            &failures[0],
            BuildError::Stage {
                stage: BuildStage::Upload,
                source: ContainerError::Engine(EngineError::CommandFailed { .. }),
                ..
            }
        ));
        assert!(engine.live_containers().is_empty());
    }

    #[test]
    fn test_services_failed_message_lists_every_failure() {
        let err = BuildError::ServicesFailed {
            failures: vec![
                BuildError::StageFailed {
                    service: "api".into(),
                    stage: BuildStage::Build,
                    exit_code: 1,
                    logs: String::new(),
                },
                BuildError::Panicked {
                    service: "www".into(),
                    reason: "boom".into(),
                },
            ],
        };
        let message = err.to_string();
        assert!(message.starts_with("2 service(s) failed to build"));
        assert!(message.contains("service api: build stage exited with status 1"));
        assert!(message.contains("service www: build task died: boom"));
    }
}
