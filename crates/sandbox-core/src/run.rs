//! Running built services.
//!
//! Every buildable service is started from its `latest` image, concurrently,
//! under its process supervisor. The run lasts until every service exited.
//! Cancelling the token, or any service failing, broadcasts a stop to every
//! running service; the orchestrator then waits for all of them to drain.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SandboxConfig;
use crate::container::{ContainerError, ContainerStopper, RunOptions, StreamHandle};
use crate::engine::{argv, BoxedWriter, Engine};
use crate::image::{Image, ImageError};
use crate::service::{Application, ServiceConfig, ServiceError};

/// Errors produced while running services.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("service {service} hasn't been built yet")]
    NotBuilt { service: String },

    #[error("service {service}: {source}")]
    Image {
        service: String,
        #[source]
        source: ImageError,
    },

    #[error("service {service}: {source}")]
    Container {
        service: String,
        #[source]
        source: ContainerError,
    },

    #[error("service {service} exited with status {exit_code}")]
    Exited { service: String, exit_code: i32 },

    #[error("service task died: {reason}")]
    Panicked { reason: String },

    #[error("{} service(s) failed: {}", .failures.len(), join_errors(.failures))]
    ServicesFailed { failures: Vec<RunError> },

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl RunError {
    /// Names of the services that failed because they were never built.
    pub fn not_built_services(&self) -> Vec<&str> {
        match self {
            RunError::NotBuilt { service } => vec![service.as_str()],
            RunError::ServicesFailed { failures } => failures
                .iter()
                .flat_map(RunError::not_built_services)
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn join_errors(errors: &[RunError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for runs.
pub type Result<T> = std::result::Result<T, RunError>;

#[derive(Debug, Default)]
struct SupervisorState {
    stopping: bool,
    running: Vec<(String, ContainerStopper)>,
}

/// Tracks the containers of running services so they can all be stopped.
///
/// A stop is broadcast at most once. Containers tracked after the broadcast
/// are stopped right away, so every service gets exactly one stop request.
#[derive(Debug)]
pub struct ServiceSupervisor {
    state: Mutex<SupervisorState>,
    grace: Duration,
}

impl ServiceSupervisor {
    pub fn new(grace: Duration) -> Self {
        Self {
            state: Mutex::new(SupervisorState::default()),
            grace,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_stopping(&self) -> bool {
        self.lock().stopping
    }

    /// Register the container of `service`, stopping it at once when a stop
    /// was already broadcast.
    pub async fn track(&self, service: &str, stopper: ContainerStopper) {
        {
            let mut state = self.lock();
            if !state.stopping {
                state.running.push((service.to_string(), stopper));
                return;
            }
        }
        debug!(service, "stop already requested, stopping service");
        self.stop_one(service, &stopper).await;
    }

    /// Ask every tracked service to stop. Only the first call does anything.
    pub async fn stop_all(&self) {
        let running = {
            let mut state = self.lock();
            if state.stopping {
                return;
            }
            state.stopping = true;
            std::mem::take(&mut state.running)
        };
        info!(services = running.len(), "stopping services");
        join_all(
            running
                .iter()
                .map(|(service, stopper)| self.stop_one(service, stopper)),
        )
        .await;
    }

    async fn stop_one(&self, service: &str, stopper: &ContainerStopper) {
        match stopper.stop(self.grace).await {
            Ok(true) => info!(service, "service stopped"),
            Ok(false) => debug!(service, "service already gone"),
            Err(e) => warn!(service, error = %e, "couldn't stop service"),
        }
    }
}

/// Builds the sink receiving a service's output.
pub type OutputFactory = Arc<dyn Fn(&str) -> BoxedWriter + Send + Sync>;

/// Starts the built services of an application and supervises them.
pub struct RunOrchestrator {
    engine: Arc<dyn Engine>,
    config: SandboxConfig,
    output: OutputFactory,
}

impl RunOrchestrator {
    pub fn new(engine: Arc<dyn Engine>, config: SandboxConfig) -> Self {
        Self {
            engine,
            config,
            output: Arc::new(|_| Box::new(tokio::io::stdout())),
        }
    }

    /// Send service output somewhere else than stdout.
    pub fn with_output(mut self, output: OutputFactory) -> Self {
        self.output = output;
        self
    }

    /// Run every buildable service until they all exited.
    ///
    /// Cancelling `token` stops every running service. A service failing
    /// stops its siblings too, and the run then fails with every failure
    /// collected.
    #[instrument(skip_all, fields(application = %application.name))]
    pub async fn run(&self, application: &Application, token: CancellationToken) -> Result<()> {
        let supervisor = Arc::new(ServiceSupervisor::new(self.config.stop_grace()));
        let application = Arc::new(application.clone());

        let mut tasks = JoinSet::new();
        for service in application.buildable_services() {
            let task = ServiceTask {
                engine: Arc::clone(&self.engine),
                config: self.config.clone(),
                application: Arc::clone(&application),
                service: service.clone(),
                supervisor: Arc::clone(&supervisor),
                output: (self.output)(&service.name),
            };
            tasks.spawn(task.run());
        }
        if tasks.is_empty() {
            info!("no service to run");
            return Ok(());
        }

        let mut failures = Vec::new();
        let mut cancelled = false;
        loop {
            tokio::select! {
                _ = token.cancelled(), if !cancelled => {
                    cancelled = true;
                    info!("interrupted");
                    supervisor.stop_all().await;
                }
                joined = tasks.join_next() => {
                    let Some(joined) = joined else {
                        break;
                    };
                    let failure = match joined {
                        Ok((service, Ok(()))) => {
                            info!(%service, "service exited");
                            None
                        }
                        Ok((service, Err(e))) => {
                            error!(%service, error = %e, "service failed");
                            Some(e)
                        }
                        Err(e) => {
                            error!(error = %e, "service task died");
                            Some(RunError::Panicked { reason: e.to_string() })
                        }
                    };
                    if let Some(failure) = failure {
                        failures.push(failure);
                        supervisor.stop_all().await;
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RunError::ServicesFailed { failures })
        }
    }
}

/// One service's run, owned so it can live in a task.
struct ServiceTask {
    engine: Arc<dyn Engine>,
    config: SandboxConfig,
    application: Arc<Application>,
    service: ServiceConfig,
    supervisor: Arc<ServiceSupervisor>,
    output: BoxedWriter,
}

impl ServiceTask {
    async fn run(self) -> (String, Result<()>) {
        let name = self.service.name.clone();
        (name, self.execute().await)
    }

    #[instrument(skip_all, fields(service = %self.service.name))]
    async fn execute(self) -> Result<()> {
        let name = self.service.name.clone();
        let spec = self.service.latest_spec(&self.application.name)?;
        let image = match Image::lookup(Arc::clone(&self.engine), &spec).await {
            Ok(image) => image,
            Err(ImageError::NotFound { .. }) => return Err(RunError::NotBuilt { service: name }),
            Err(source) => return Err(RunError::Image { service: name, source }),
        };
        if self.supervisor.is_stopping() {
            info!("stop requested before start, skipping");
            return Ok(());
        }

        let mut container = image
            .instantiate(None)
            .map_err(|source| RunError::Image {
                service: name.clone(),
                source,
            })?
            .with_stop_grace(self.config.stop_grace());

        let supervisor_config = self
            .service
            .extracted(&self.config, &self.config.supervisor_config);
        let command = argv(&[
            "/bin/sh",
            "-lc",
            format!("exec supervisord -nc {supervisor_config}").as_str(),
        ]);
        let options = self
            .service
            .published_ports(&self.config)
            .into_iter()
            .fold(
                RunOptions::new()
                    .as_user(self.config.service_user.as_str())
                    .env("HOME", self.config.home_dir.as_str()),
                RunOptions::publish,
            );

        info!(image = %image, "starting service");
        let stopper = container.stopper();
        let supervisor = Arc::clone(&self.supervisor);
        let service = name.clone();
        container
            .run_streamed(&command, options, self.output, move |handle: StreamHandle| async move {
                for (port, host_port) in &handle.ports {
                    info!(%service, port, host_port, "port published");
                }
                supervisor.track(&service, stopper).await;
                Ok::<_, ContainerError>(())
            })
            .await
            .map_err(|source| RunError::Container {
                service: name.clone(),
                source,
            })?;

        match container.exit_code() {
            Some(0) | None => Ok(()),
            Some(exit_code) if container.stop_requested() => {
                info!(exit_code, "service exited after stop");
                Ok(())
            }
            Some(exit_code) => Err(RunError::Exited {
                service: name,
                exit_code,
            }),
        }
    }
}
