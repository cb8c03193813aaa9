//! Lifecycle orchestration for one test run
//!
//! Startup: fixture, then manager, then the setup callbacks (env, indexers,
//! reconcilers, in that order), then the manager on its own task. The test
//! body runs only after the manager reports readiness. Shutdown always
//! cancels the manager before the fixture is stopped.
//!
//! # Timeouts
//!
//! Readiness is awaited without an internal deadline unless
//! [`RunInputBuilder::run_timeout`] is set. That limit covers readiness and
//! the test body together; when it elapses the run fails with
//! [`Error::RunTimeout`] after the usual ordered shutdown.
//!
//! Dropping the [`Orchestrator::execute`] future part way (an outer
//! [`tokio::time::timeout`], say) cancels the manager and finishes the
//! shutdown on a background task, so the fixture is still stopped.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::environment::Environment;
use crate::fixture::{default_fixture, Connection, Fixture, FixtureFactory, FixtureOptions};
use crate::manager::{default_manager, Manager, ManagerFactory};
use crate::readiness::ReadinessSignal;
use crate::registry::TypeRegistry;
use crate::telemetry::{init_logging, LogOptions, TelemetryError};
use crate::{Error, FATAL_EXIT_CODE};

/// Exit code reported when the test body panics
pub const PANIC_EXIT_CODE: i32 = 101;

/// Default time the manager gets to return after cancellation
pub const DEFAULT_MANAGER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

type SetupEnvFn = Box<dyn FnOnce(&mut Environment) -> Result<(), Error> + Send>;
type SetupManagerFn = Box<dyn FnOnce(&CancellationToken, &dyn Manager) -> Result<(), Error> + Send>;
type TestBodyFn = Box<dyn FnOnce(Arc<Environment>) -> BoxFuture<'static, i32> + Send>;
type ManagerTask = JoinHandle<Result<(), Error>>;
type SharedFixture = Arc<Mutex<Box<dyn Fixture>>>;
type EnvLookup = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Inputs for one run; see [`RunInput::builder`]
pub struct RunInput {
    crd_directory_paths: Vec<PathBuf>,
    setup_env: Option<SetupEnvFn>,
    setup_indexers: Option<SetupManagerFn>,
    setup_reconcilers: Option<SetupManagerFn>,
    test_body: TestBodyFn,
    log_options: Option<LogOptions>,
    registry: TypeRegistry,
    fixture_factory: FixtureFactory,
    manager_factory: ManagerFactory,
    manager_shutdown_timeout: Duration,
    run_timeout: Option<Duration>,
}

impl RunInput {
    /// Start building a run around `test_body`, whose return value becomes
    /// the exit code
    pub fn builder<F, Fut>(test_body: F) -> RunInputBuilder
    where
        F: FnOnce(Arc<Environment>) -> Fut + Send + 'static,
        Fut: Future<Output = i32> + Send + 'static,
    {
        RunInputBuilder {
            input: RunInput {
                crd_directory_paths: Vec::new(),
                setup_env: None,
                setup_indexers: None,
                setup_reconcilers: None,
                test_body: Box::new(move |env| test_body(env).boxed()),
                log_options: None,
                registry: TypeRegistry::with_builtin(),
                fixture_factory: Box::new(default_fixture),
                manager_factory: Box::new(default_manager),
                manager_shutdown_timeout: DEFAULT_MANAGER_SHUTDOWN_TIMEOUT,
                run_timeout: None,
            },
        }
    }
}

/// Builder for [`RunInput`]
pub struct RunInputBuilder {
    input: RunInput,
}

impl RunInputBuilder {
    /// CRD files or directories, installed in order
    ///
    /// Leaving this empty installs from [`crate::DEFAULT_CRD_DIRECTORY`].
    pub fn crd_directory_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.input.crd_directory_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Adjust the environment before anything is registered
    pub fn setup_env<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut Environment) -> Result<(), Error> + Send + 'static,
    {
        self.input.setup_env = Some(Box::new(f));
        self
    }

    /// Register indexers; runs after `setup_env`
    pub fn setup_indexers<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&CancellationToken, &dyn Manager) -> Result<(), Error> + Send + 'static,
    {
        self.input.setup_indexers = Some(Box::new(f));
        self
    }

    /// Register reconcilers; runs after `setup_indexers`
    pub fn setup_reconcilers<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&CancellationToken, &dyn Manager) -> Result<(), Error> + Send + 'static,
    {
        self.input.setup_reconcilers = Some(Box::new(f));
        self
    }

    /// Logging settings; read from the environment when unset
    pub fn log_options(mut self, options: LogOptions) -> Self {
        self.input.log_options = Some(options);
        self
    }

    /// Registry of known types; installed CRDs are added to it
    pub fn registry(mut self, registry: TypeRegistry) -> Self {
        self.input.registry = registry;
        self
    }

    /// Replace how the fixture is built
    pub fn fixture_factory<F>(mut self, f: F) -> Self
    where
        F: FnOnce(FixtureOptions) -> Box<dyn Fixture> + Send + 'static,
    {
        self.input.fixture_factory = Box::new(f);
        self
    }

    /// Replace how the manager is built
    pub fn manager_factory<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&Connection, &TypeRegistry) -> Result<Arc<dyn Manager>, Error> + Send + 'static,
    {
        self.input.manager_factory = Box::new(f);
        self
    }

    /// How long the manager gets to return after cancellation
    pub fn manager_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.input.manager_shutdown_timeout = timeout;
        self
    }

    /// Upper bound for readiness plus the test body
    ///
    /// When it elapses the body is dropped, shutdown runs as usual and the
    /// run fails with [`Error::RunTimeout`]. Fixture start and stop are not
    /// covered.
    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.input.run_timeout = Some(timeout);
        self
    }

    /// Finish building
    pub fn build(self) -> RunInput {
        self.input
    }
}

/// Drives one run from fixture start to fixture stop
pub struct Orchestrator;

impl Orchestrator {
    /// Run the full lifecycle, returning the test body's exit code
    ///
    /// Every `Err` is fatal (see [`Error::is_fatal`]): the run could not be
    /// carried out faithfully.
    pub async fn execute(parent: CancellationToken, input: RunInput) -> Result<i32, Error> {
        Self::execute_with_env(parent, input, &process_env).await
    }

    pub(crate) async fn execute_with_env(
        parent: CancellationToken,
        input: RunInput,
        lookup: &EnvLookup,
    ) -> Result<i32, Error> {
        let RunInput {
            crd_directory_paths,
            setup_env,
            setup_indexers,
            setup_reconcilers,
            test_body,
            log_options,
            registry,
            fixture_factory,
            manager_factory,
            manager_shutdown_timeout,
            run_timeout,
        } = input;

        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        setup_logging(log_options, lookup);
        let token = parent.child_token();

        let options = FixtureOptions::from_lookup(crd_directory_paths, lookup).map_err(|e| {
            Error::fixture_start(format!("invalid fixture configuration: {e}"))
        })?;
        info!(crd_paths = ?options.crd_directory_paths, "Starting fixture");
        let fixture: SharedFixture = Arc::new(Mutex::new(fixture_factory(options)));
        let connection = fixture
            .lock()
            .await
            .start()
            .await
            .map_err(|e| as_kind(e, Error::fixture_start, |e| matches!(e, Error::FixtureStart { .. })))?;

        let mut added = 0;
        for crd in &connection.crds {
            added += registry.register_crd(crd);
        }
        debug!(crds = connection.crds.len(), types = added, "Registered installed CRDs");

        let manager = match manager_factory(&connection, &registry) {
            Ok(manager) => manager,
            Err(e) => {
                stop_after_startup_failure(&fixture).await;
                return Err(as_kind(e, Error::manager_build, |e| {
                    matches!(e, Error::ManagerBuild { .. })
                }));
            }
        };

        let mut env = Environment::new(connection, registry, manager.clone(), token.clone());
        if let Err(e) = run_setup(&mut env, &token, setup_env, setup_indexers, setup_reconcilers) {
            stop_after_startup_failure(&fixture).await;
            return Err(e);
        }

        info!("Starting manager");
        let manager_task = {
            let manager = manager.clone();
            let token = token.clone();
            tokio::spawn(async move { manager.start(token).await })
        };
        let mut teardown = Teardown {
            token,
            fixture,
            manager_task: Some(manager_task),
            grace: manager_shutdown_timeout,
            finished: false,
        };

        let env = Arc::new(env);
        let outcome = {
            let run = async {
                match wait_ready(manager.readiness(), &mut teardown).await {
                    Ok(()) => {
                        info!("Manager ready, running test body");
                        run_body(test_body, env.clone(), &mut teardown).await
                    }
                    Err(e) => Err(e),
                }
            };
            match run_timeout {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        error!(timeout = ?limit, "Run timed out");
                        Err(Error::run_timeout(limit))
                    }
                },
                None => run.await,
            }
        };

        if let Err(e) = teardown.shutdown().await {
            if let Err(earlier) = &outcome {
                error!(error = %earlier, "Run had already failed before fixture stop");
            }
            return Err(e);
        }
        info!("Fixture stopped");

        let code = outcome?;
        info!(exit_code = code, "Test run complete");
        Ok(code)
    }
}

/// Run the lifecycle and return the test body's exit code
///
/// Fatal orchestration failures are logged and end the process with
/// [`FATAL_EXIT_CODE`]; they never reach the test body. Bound readiness and
/// the body with [`RunInputBuilder::run_timeout`].
pub async fn run(parent: CancellationToken, input: RunInput) -> i32 {
    match Orchestrator::execute(parent, input).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Test environment failed");
            std::process::exit(FATAL_EXIT_CODE);
        }
    }
}

fn process_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

/// Explicit options win; unreadable environment settings fall back to defaults
fn resolve_log_options(
    explicit: Option<LogOptions>,
    lookup: &EnvLookup,
) -> (LogOptions, Option<TelemetryError>) {
    match explicit {
        Some(options) => (options, None),
        None => match LogOptions::from_lookup(lookup) {
            Ok(options) => (options, None),
            Err(e) => (LogOptions::default(), Some(e)),
        },
    }
}

fn setup_logging(explicit: Option<LogOptions>, lookup: &EnvLookup) {
    let (options, invalid) = resolve_log_options(explicit, lookup);
    let initialized = match init_logging(&options) {
        Ok(initialized) => initialized,
        Err(e) => {
            let initialized = init_logging(&LogOptions::default()).unwrap_or(false);
            warn!(error = %e, "Logging setup failed, using defaults");
            initialized
        }
    };
    if initialized {
        debug!(verbosity = options.verbosity, "Logging initialized");
    }
    if let Some(e) = invalid {
        warn!(error = %e, "Ignoring invalid logging configuration, using defaults");
    }
}

fn run_setup(
    env: &mut Environment,
    token: &CancellationToken,
    setup_env: Option<SetupEnvFn>,
    setup_indexers: Option<SetupManagerFn>,
    setup_reconcilers: Option<SetupManagerFn>,
) -> Result<(), Error> {
    if let Some(setup) = setup_env {
        setup(env).map_err(|e| Error::manager_build(format!("setup_env failed: {e}")))?;
    }

    let manager = env.manager().clone();
    if let Some(setup) = setup_indexers {
        setup(token, manager.as_ref())
            .map_err(|e| Error::manager_build(format!("setup_indexers failed: {e}")))?;
    }
    if let Some(setup) = setup_reconcilers {
        setup(token, manager.as_ref())
            .map_err(|e| Error::manager_build(format!("setup_reconcilers failed: {e}")))?;
    }
    Ok(())
}

/// Owns everything shutdown needs once the manager is running
///
/// [`Teardown::shutdown`] runs cancel, drain, fixture stop in order. If the
/// orchestrator future is dropped first, `Drop` cancels the manager and
/// hands the rest to a background task.
struct Teardown {
    token: CancellationToken,
    fixture: SharedFixture,
    manager_task: Option<ManagerTask>,
    grace: Duration,
    finished: bool,
}

impl Teardown {
    async fn shutdown(&mut self) -> Result<(), Error> {
        info!("Shutting down");
        self.token.cancel();
        if let Some(task) = self.manager_task.take() {
            drain_manager(task, self.grace).await;
        }
        let stopped = self.fixture.lock().await.stop().await;
        self.finished = true;
        stopped.map_err(|e| as_kind(e, Error::fixture_stop, |e| matches!(e, Error::FixtureStop { .. })))
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.token.cancel();
        let task = self.manager_task.take();
        let fixture = self.fixture.clone();
        let grace = self.grace;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Run abandoned before shutdown, stopping fixture in the background");
                handle.spawn(async move {
                    if let Some(task) = task {
                        drain_manager(task, grace).await;
                    }
                    if let Err(e) = fixture.lock().await.stop().await {
                        warn!(error = %e, "Failed to stop abandoned fixture");
                    }
                });
            }
            Err(_) => warn!("Run abandoned outside a runtime, fixture left running"),
        }
    }
}

/// Resolve once the manager task exits; pending forever after it has
async fn join_manager(task: &mut Option<ManagerTask>) -> Result<Result<(), Error>, JoinError> {
    match task.as_mut() {
        Some(handle) => {
            let joined = handle.await;
            *task = None;
            joined
        }
        None => std::future::pending().await,
    }
}

async fn wait_ready(readiness: ReadinessSignal, teardown: &mut Teardown) -> Result<(), Error> {
    tokio::select! {
        biased;
        joined = join_manager(&mut teardown.manager_task) => match manager_exit(joined) {
            Ok(()) if readiness.is_ready() => Ok(()),
            Ok(()) => Err(Error::manager_runtime("manager stopped before becoming ready")),
            Err(e) => Err(e),
        },
        ready = readiness.wait() => match ready {
            Ok(()) => Ok(()),
            // The trigger goes away with the manager; report why it stopped
            Err(dropped) => {
                let joined = tokio::time::timeout(
                    teardown.grace,
                    join_manager(&mut teardown.manager_task),
                )
                .await;
                match joined.map(manager_exit) {
                    Ok(Ok(())) => Err(Error::manager_runtime("manager stopped before becoming ready")),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(dropped),
                }
            }
        },
    }
}

async fn run_body(
    test_body: TestBodyFn,
    env: Arc<Environment>,
    teardown: &mut Teardown,
) -> Result<i32, Error> {
    let body = AssertUnwindSafe(test_body(env)).catch_unwind();
    tokio::pin!(body);

    loop {
        tokio::select! {
            finished = &mut body => {
                return Ok(finished.unwrap_or_else(|_| {
                    error!(exit_code = PANIC_EXIT_CODE, "Test body panicked");
                    PANIC_EXIT_CODE
                }));
            }
            joined = join_manager(&mut teardown.manager_task) => {
                match manager_exit(joined) {
                    // Parent cancelled; the body sees the same token and decides when to stop
                    Ok(()) => debug!("Manager stopped while the test body was running"),
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

async fn drain_manager(mut task: ManagerTask, timeout: Duration) {
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(joined) => match manager_exit(joined) {
            Ok(()) => debug!("Manager stopped"),
            Err(e) => warn!(error = %e, "Manager failed during shutdown"),
        },
        Err(_) => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "Manager did not stop in time, aborting"
            );
            task.abort();
        }
    }
}

async fn stop_after_startup_failure(fixture: &Mutex<Box<dyn Fixture>>) {
    if let Err(e) = fixture.lock().await.stop().await {
        warn!(error = %e, "Failed to stop fixture after startup failure");
    }
}

fn manager_exit(joined: Result<Result<(), Error>, JoinError>) -> Result<(), Error> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(as_kind(e, Error::manager_runtime, |e| {
            matches!(e, Error::ManagerRuntime { .. })
        })),
        Err(e) if e.is_panic() => Err(Error::manager_runtime("manager task panicked")),
        Err(e) => Err(Error::manager_runtime(format!("manager task aborted: {e}"))),
    }
}

/// Keep errors already of the expected kind, wrap everything else
fn as_kind(
    e: Error,
    wrap: fn(String) -> Error,
    is_kind: impl Fn(&Error) -> bool,
) -> Error {
    if is_kind(&e) {
        e
    } else {
        wrap(e.to_string())
    }
}
