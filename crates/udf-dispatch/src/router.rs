use serde_json::{Map, Value};
use std::{fmt, sync::Arc};
use tokio::task::JoinHandle;
use udf_core::{
    DispatchKey, Error, ExecutionResult, Mode, Result, Source, TokenProvider, UdfData,
};
use udf_sandbox::{GeoTable, ImportAllowlist, SampleInput, Sandbox, SandboxOptions, TileXyz};

use crate::{
    client::RealtimeClient,
    config::RouterConfig,
    console::{ConsoleSink, StdConsole},
    decode::PayloadDecoder,
    reference::{RunRequest, UdfRef},
    select::{default_engine, resolve_shape, select_strategy, StrategyId},
};

/// What a finished strategy handed back.
#[derive(Debug)]
pub enum RunOutcome {
    /// The unit of work's data; `None` when it produced nothing.
    Data(Option<UdfData>),

    /// The full execution result, when the caller asked to keep the log.
    Rich(ExecutionResult),

    /// The job record of a batch submission.
    Job(Value),

    /// An asynchronous run still in flight.
    Pending(PendingRun),
}

impl RunOutcome {
    pub fn data(&self) -> Option<&UdfData> {
        match self {
            RunOutcome::Data(data) => data.as_ref(),
            RunOutcome::Rich(result) => result.data.as_ref(),
            RunOutcome::Job(_) | RunOutcome::Pending(_) => None,
        }
    }
}

/// Handle to a run executing on a background task.
pub struct PendingRun {
    handle: JoinHandle<Result<RunOutcome>>,
}

impl PendingRun {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn wait(self) -> Result<RunOutcome> {
        self.handle
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("dispatch task failed: {e}")))?
    }
}

impl fmt::Debug for PendingRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRun")
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

/// A dispatched run: the selection that was made and what it produced.
#[derive(Debug)]
pub struct Run {
    pub key: DispatchKey,
    pub strategy: StrategyId,
    pub outcome: RunOutcome,
    pub warnings: Vec<String>,
}

/// Everything a strategy needs, owned so it can move onto a background task.
#[derive(Debug, Clone)]
struct Call {
    reference: UdfRef,
    tile: Option<TileXyz>,
    parameters: Map<String, Value>,
    include_log: bool,
    validate_output: bool,
    validate_imports: bool,
}

/// Untouched strategy output, before results are replayed and unwrapped.
enum Produced {
    Data(Option<UdfData>),
    Rich(ExecutionResult),
    Job(Value),
}

/// Selects and invokes exactly one call strategy per request.
#[derive(Clone)]
pub struct DispatchRouter {
    client: RealtimeClient,
    auth: Arc<dyn TokenProvider>,
    sandbox: Sandbox,
    console: Arc<dyn ConsoleSink>,
}

impl fmt::Debug for DispatchRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchRouter")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl DispatchRouter {
    pub fn new(cfg: RouterConfig, auth: Arc<dyn TokenProvider>) -> Result<Self> {
        Ok(Self {
            client: RealtimeClient::new(cfg, auth.clone())?,
            auth,
            sandbox: Sandbox::default(),
            console: Arc::new(StdConsole),
        })
    }

    /// Sandbox used by the local engine.
    pub fn with_sandbox(mut self, sandbox: Sandbox) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_console(mut self, console: Arc<dyn ConsoleSink>) -> Self {
        self.console = console;
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn PayloadDecoder>) -> Self {
        self.client = self.client.with_decoder(decoder);
        self
    }

    pub fn client(&self) -> &RealtimeClient {
        &self.client
    }

    /// Resolve `req` to one strategy and run it.
    ///
    /// Every selection failure is returned before any request is sent. In async mode the
    /// strategy runs on a spawned task and the outcome is [`RunOutcome::Pending`].
    pub async fn run(&self, mut req: RunRequest) -> Result<Run> {
        let mut warnings = Vec::new();
        let reference = req.resolve_reference(&mut warnings)?;
        let (shape, tile) = resolve_shape(req.x, req.y, req.z, req.shape, &mut warnings)?;

        let source = reference.source();
        let engine = match req.engine {
            Some(engine) => engine,
            None => {
                let cfg = self.client.config();
                let configured = source == Source::Local
                    && cfg.default_udf_run_engine.is_none()
                    && self.auth.is_configured().await;
                default_engine(source, cfg.default_udf_run_engine, configured)
            }
        };

        let key = DispatchKey::new(req.mode, shape, source, engine);
        let strategy = select_strategy(key)?;
        tracing::info!(event = "udf.dispatch.selected", key = %key, strategy = %strategy);

        let call = Call {
            reference,
            tile,
            parameters: std::mem::take(&mut req.parameters),
            include_log: req.include_log,
            validate_output: req.validate_output,
            validate_imports: req
                .validate_imports
                .unwrap_or(self.client.config().default_validate_imports),
        };

        let outcome = match req.mode {
            Mode::Sync => self.invoke(strategy, call).await?,
            Mode::Async => {
                let router = self.clone();
                let handle = tokio::spawn(async move { router.invoke(strategy, call).await });
                RunOutcome::Pending(PendingRun { handle })
            }
        };

        Ok(Run {
            key,
            strategy,
            outcome,
            warnings,
        })
    }

    async fn invoke(&self, strategy: StrategyId, call: Call) -> Result<RunOutcome> {
        let include_log = call.include_log;
        let produced = match self.dispatch(strategy, call).await {
            Ok(produced) => produced,
            Err(err) => {
                if let Error::RemoteChild { stdout, stderr, .. }
                | Error::UdfRuntime { stdout, stderr, .. } = &err
                {
                    self.replay(stdout, stderr);
                }
                return Err(err);
            }
        };

        match produced {
            Produced::Data(data) => Ok(RunOutcome::Data(data)),
            Produced::Job(job) => Ok(RunOutcome::Job(job)),
            Produced::Rich(result) => {
                self.replay(&result.stdout, &result.stderr);
                if include_log && !result.is_failure() {
                    return Ok(RunOutcome::Rich(result));
                }
                Ok(RunOutcome::Data(result.into_data()?))
            }
        }
    }

    async fn dispatch(&self, strategy: StrategyId, call: Call) -> Result<Produced> {
        let Call {
            reference,
            tile,
            parameters,
            validate_output,
            validate_imports,
            ..
        } = call;

        match (strategy, reference) {
            (StrategyId::SavedTile | StrategyId::SavedFile, UdfRef::Saved { owner, name }) => {
                let owner = match owner {
                    Some(owner) => owner,
                    None => self.client.owner_email().await?,
                };
                let data = match tile {
                    Some(tile) if strategy == StrategyId::SavedTile => {
                        self.client
                            .run_saved_tile(&owner, &name, tile, &parameters)
                            .await?
                    }
                    _ => self.client.run_saved_file(&owner, &name, &parameters).await?,
                };
                Ok(Produced::Data(data))
            }
            (StrategyId::SharedTile | StrategyId::SharedFile, UdfRef::Token(token)) => {
                let data = match tile {
                    Some(tile) if strategy == StrategyId::SharedTile => {
                        self.client.run_shared_tile(&token, tile, &parameters).await?
                    }
                    _ => self.client.run_shared_file(&token, &parameters).await?,
                };
                Ok(Produced::Data(data))
            }
            (StrategyId::StepRealtimeTile | StrategyId::StepRealtimeFile, reference) => {
                let step = in_memory(reference)?;
                if let Some(allowlist) = self.allowlist(validate_imports).await? {
                    allowlist.check(&step.udf)?;
                }
                let tile = tile.filter(|_| strategy == StrategyId::StepRealtimeTile);
                let result = self.client.run_step(&step, tile, &parameters).await?;
                Ok(Produced::Rich(result))
            }
            (StrategyId::StepLocalTile | StrategyId::StepLocalFile, reference) => {
                let step = in_memory(reference)?;
                let mut input = match tile.filter(|_| strategy == StrategyId::StepLocalTile) {
                    Some(tile) => {
                        let mut geo = GeoTable::from_bbox(tile.bounds());
                        geo.assign_tile(tile);
                        SampleInput::new().arg(geo.to_feature_collection())
                    }
                    None => step
                        .input
                        .as_ref()
                        .and_then(|records| records.first())
                        .map(SampleInput::from_record)
                        .unwrap_or_default(),
                };
                input.kwargs.extend(parameters);

                let options = SandboxOptions {
                    validate_output,
                    allowed_imports: self.allowlist(validate_imports).await?,
                    ..SandboxOptions::default()
                };
                let sandbox = self.sandbox.clone();
                let mut udf = step.udf;
                let result = tokio::task::spawn_blocking(move || {
                    sandbox.execute(&mut udf, &input, &options)
                })
                .await
                .map_err(|e| Error::Other(anyhow::anyhow!("local execution task failed: {e}")))??;
                Ok(Produced::Rich(result))
            }
            (StrategyId::StepBatch, reference) => {
                let step = in_memory(reference)?;
                let job = self.client.submit_batch(&step, &parameters).await?;
                tracing::info!(event = "udf.dispatch.batch_submitted", udf = %step.udf.name);
                Ok(Produced::Job(job))
            }
            (strategy, reference) => Err(Error::Other(anyhow::anyhow!(
                "strategy {strategy} cannot run a {} reference",
                reference.source().as_str()
            ))),
        }
    }

    /// The remote allow-list, when import validation is on and there is a credential to fetch
    /// it with.
    async fn allowlist(&self, validate_imports: bool) -> Result<Option<ImportAllowlist>> {
        if !validate_imports || !self.auth.is_configured().await {
            return Ok(None);
        }
        let doc = self.client.dependency_whitelist().await?;
        Ok(Some(ImportAllowlist::from_whitelist(&doc)?))
    }

    fn replay(&self, stdout: &str, stderr: &str) {
        if !stdout.is_empty() {
            self.console.stdout(stdout);
        }
        if !stderr.is_empty() {
            self.console.stderr(stderr);
        }
    }
}

fn in_memory(reference: UdfRef) -> Result<udf_core::JobStep> {
    let source = reference.source();
    reference.into_job_step().ok_or_else(|| {
        Error::Other(anyhow::anyhow!(
            "a {} reference has no in-memory code",
            source.as_str()
        ))
    })
}
