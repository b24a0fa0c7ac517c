//! Reconciliation: find which required images the target host lacks and acquire each one
//! through an ordered chain of strategies, one concurrent worker per missing image.

use crate::archive::{FileTree, LocalTree};
use crate::config::{EngineConfig, RetryConfig, TransportConfig};
use crate::error::{CommandFailure, EngineError, ErrorKind, Result, ResultExt};
use crate::image_reference::ImageRef;
use crate::image_store::{BuildRequest, ImageStore, Side};
use crate::retry::RetryPolicy;
use crate::runner::{CommandRunner, RemoteRunner};
use crate::transport::{Connector, RemoteSession};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Parameters for the build strategies.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    pub context: PathBuf,
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub image: ImageRef,
    pub build: Option<BuildSpec>,
}

/// Acquisition strategies, declared in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    RemotePull,
    LocalPullTransfer,
    RemoteBuild,
    LocalBuildTransfer,
}

impl Strategy {
    pub const FALLBACK_ORDER: [Strategy; 4] = [
        Strategy::RemotePull,
        Strategy::LocalPullTransfer,
        Strategy::RemoteBuild,
        Strategy::LocalBuildTransfer,
    ];

    pub fn needs_build(self) -> bool {
        matches!(self, Strategy::RemoteBuild | Strategy::LocalBuildTransfer)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::RemotePull => "remote pull",
            Strategy::LocalPullTransfer => "local pull + transfer",
            Strategy::RemoteBuild => "remote build",
            Strategy::LocalBuildTransfer => "local build + transfer",
        };
        f.write_str(name)
    }
}

/// The strategies to try for one missing image. Build strategies are only planned when
/// build parameters were supplied.
#[derive(Debug, Clone)]
pub struct AcquisitionPlan {
    pub image: ImageRef,
    pub strategies: Vec<Strategy>,
    pub build: Option<BuildSpec>,
}

impl AcquisitionPlan {
    pub fn for_request(request: &ImageRequest) -> Self {
        let strategies = Strategy::FALLBACK_ORDER
            .into_iter()
            .filter(|strategy| request.build.is_some() || !strategy.needs_build())
            .collect();
        Self {
            image: request.image.clone(),
            strategies,
            build: request.build.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Unknown,
    Checked,
    AlreadyPresent,
    Acquiring(Strategy),
    Acquired(Strategy),
    Failed,
}

impl ImageState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ImageState::AlreadyPresent | ImageState::Acquired(_) | ImageState::Failed
        )
    }

    /// Whether `next` is a legal successor. Strategies only ever move forward in the chain.
    pub fn can_advance_to(self, next: ImageState) -> bool {
        use ImageState::*;
        match (self, next) {
            (Unknown, Checked) => true,
            (Checked, AlreadyPresent | Acquiring(_) | Failed) => true,
            (Acquiring(current), Acquiring(following)) => following > current,
            (Acquiring(current), Acquired(used)) => current == used,
            (Acquiring(_), Failed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyFailure {
    pub strategy: Strategy,
    pub kind: ErrorKind,
    pub error: String,
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.strategy, self.error)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Outcome {
    AlreadyPresent,
    Acquired,
    Failed {
        reason: String,
        attempts: Vec<StrategyFailure>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    pub image: ImageRef,
    pub outcome: Outcome,
    pub strategy_used: Option<Strategy>,
}

impl TransferResult {
    fn present(image: ImageRef) -> Self {
        Self {
            image,
            outcome: Outcome::AlreadyPresent,
            strategy_used: None,
        }
    }

    fn failed(image: ImageRef, reason: impl Into<String>, attempts: Vec<StrategyFailure>) -> Self {
        Self {
            image,
            outcome: Outcome::Failed {
                reason: reason.into(),
                attempts,
            },
            strategy_used: None,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, Outcome::Failed { .. })
    }

    pub fn state(&self) -> ImageState {
        match (&self.outcome, self.strategy_used) {
            (Outcome::AlreadyPresent, _) => ImageState::AlreadyPresent,
            (Outcome::Acquired, Some(strategy)) => ImageState::Acquired(strategy),
            _ => ImageState::Failed,
        }
    }
}

impl fmt::Display for TransferResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.outcome, self.strategy_used) {
            (Outcome::AlreadyPresent, _) => write!(f, "{}: already present", self.image),
            (Outcome::Acquired, Some(strategy)) => {
                write!(f, "{}: acquired via {}", self.image, strategy)
            }
            (Outcome::Acquired, None) => write!(f, "{}: acquired", self.image),
            (Outcome::Failed { reason, attempts }, _) => {
                write!(f, "{}: failed ({})", self.image, reason)?;
                for attempt in attempts {
                    write!(f, "; {}", attempt)?;
                }
                Ok(())
            }
        }
    }
}

/// Tracks one image through its states, refusing illegal transitions.
struct Progress {
    image: ImageRef,
    state: ImageState,
}

impl Progress {
    fn new(image: ImageRef) -> Self {
        Self {
            image,
            state: ImageState::Unknown,
        }
    }

    fn advance(&mut self, next: ImageState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {:?} for {}",
            self.state,
            next,
            self.image
        );
        debug!("{}: {:?} -> {:?}", self.image, self.state, next);
        self.state = next;
    }
}

/// State shared read-only by every worker of one reconciliation.
struct Shared {
    local: ImageStore,
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    engine: EngineConfig,
    transport: TransportConfig,
}

pub struct Reconciler {
    local: ImageStore,
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    engine: EngineConfig,
}

impl Reconciler {
    pub fn new(
        local_runner: Arc<dyn CommandRunner>,
        connector: Arc<dyn Connector>,
        retry: RetryConfig,
        engine: EngineConfig,
    ) -> Self {
        let retry = RetryPolicy::new(retry);
        Self {
            local: ImageStore::new(
                local_runner,
                retry.clone(),
                Side::Local,
                engine.max_archive_bytes,
            ),
            connector,
            retry,
            engine,
        }
    }

    /// Opens a short-lived session to list the target's images, then acquires what is missing.
    pub async fn reconcile(
        &self,
        cancel: &CancellationToken,
        required: &[ImageRequest],
        transport: &TransportConfig,
    ) -> Result<Vec<TransferResult>> {
        transport.validate()?;
        let probe = connect(&self.retry, self.connector.as_ref(), cancel, transport).await?;
        let results = self.reconcile_on(cancel, probe.clone(), required, transport).await;
        if let Err(e) = probe.close().await {
            warn!("Failed to close probe session to {}: {}", probe.destination(), e);
        }
        results
    }

    /// Like [`reconcile`](Self::reconcile), but lists remote images through an existing session.
    /// Transfers still open their own sessions.
    pub async fn reconcile_on(
        &self,
        cancel: &CancellationToken,
        probe: Arc<dyn RemoteSession>,
        required: &[ImageRequest],
        transport: &TransportConfig,
    ) -> Result<Vec<TransferResult>> {
        let requests = deduplicate(required);
        let remote = remote_store(probe.clone(), &self.retry, &self.engine);
        let present: HashSet<ImageRef> = remote
            .list(cancel, None)
            .await
            .context(format!("list images on {}", probe.destination()))?
            .into_iter()
            .collect();

        let shared = Arc::new(Shared {
            local: self.local.clone(),
            connector: self.connector.clone(),
            retry: self.retry.clone(),
            engine: self.engine.clone(),
            transport: transport.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(self.engine.max_concurrent_transfers.max(1)));
        let mut results: Vec<Option<TransferResult>> = vec![None; requests.len()];
        let mut workers = JoinSet::new();

        for (index, request) in requests.iter().enumerate() {
            if present.contains(&request.image) {
                info!("{} already present on {}", request.image, probe.destination());
                results[index] = Some(TransferResult::present(request.image.clone()));
                continue;
            }
            let shared = shared.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let request = request.clone();
            workers.spawn(async move {
                let permit = tokio::select! {
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let result = match permit {
                    Some(_permit) => acquire(&shared, &cancel, &request).await,
                    None => TransferResult::failed(
                        request.image.clone(),
                        "cancelled before starting",
                        Vec::new(),
                    ),
                };
                (index, result)
            });
        }

        if !workers.is_empty() {
            info!(
                "Acquiring {} missing image(s) on {}",
                workers.len(),
                probe.destination()
            );
        }
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => error!("Transfer worker terminated abnormally: {}", e),
            }
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled.context("reconcile images"));
        }

        Ok(results
            .into_iter()
            .zip(requests)
            .map(|(result, request)| {
                result.unwrap_or_else(|| {
                    TransferResult::failed(
                        request.image,
                        "transfer worker terminated abnormally",
                        Vec::new(),
                    )
                })
            })
            .collect())
    }
}

/// Keeps the first request for each image.
fn deduplicate(required: &[ImageRequest]) -> Vec<ImageRequest> {
    let mut seen = HashSet::new();
    required
        .iter()
        .filter(|request| seen.insert(request.image.clone()))
        .cloned()
        .collect()
}

/// Opens a session, retrying transient connection failures.
pub(crate) async fn connect(
    retry: &RetryPolicy,
    connector: &dyn Connector,
    cancel: &CancellationToken,
    transport: &TransportConfig,
) -> Result<Arc<dyn RemoteSession>> {
    let operation = format!("connect to {}", transport.destination());
    retry
        .execute(cancel, &operation, |_| connector.connect(cancel, transport))
        .await
}

pub(crate) fn remote_store(
    session: Arc<dyn RemoteSession>,
    retry: &RetryPolicy,
    engine: &EngineConfig,
) -> ImageStore {
    ImageStore::new(
        Arc::new(RemoteRunner::new(session)),
        retry.clone(),
        Side::Remote,
        engine.max_archive_bytes,
    )
}

/// One image's state machine: walks the plan until a strategy succeeds.
async fn acquire(
    shared: &Shared,
    cancel: &CancellationToken,
    request: &ImageRequest,
) -> TransferResult {
    let plan = AcquisitionPlan::for_request(request);
    let image = plan.image.clone();
    let mut progress = Progress::new(image.clone());
    progress.advance(ImageState::Checked);

    let connected = connect(
        &shared.retry,
        shared.connector.as_ref(),
        cancel,
        &shared.transport,
    )
    .await;
    let session = match connected {
        Ok(session) => session,
        Err(e) => {
            progress.advance(ImageState::Failed);
            error!("{}: could not open a transfer session: {}", image, e);
            return TransferResult::failed(image, format!("connect failed: {}", e), Vec::new());
        }
    };
    let remote = remote_store(session.clone(), &shared.retry, &shared.engine);

    let mut failures = Vec::new();
    let mut used = None;
    for strategy in plan.strategies.iter().copied() {
        progress.advance(ImageState::Acquiring(strategy));
        info!("{}: trying {}", image, strategy);
        match run_strategy(shared, cancel, &plan, strategy, &remote, session.as_ref()).await {
            Ok(()) => {
                progress.advance(ImageState::Acquired(strategy));
                used = Some(strategy);
                break;
            }
            Err(e) => {
                warn!("{}: {} failed: {}", image, strategy, e);
                let cancelled = e.kind() == ErrorKind::Cancelled;
                failures.push(StrategyFailure {
                    strategy,
                    kind: e.kind(),
                    error: e.to_string(),
                });
                if cancelled {
                    break;
                }
            }
        }
    }

    if let Err(e) = session.close().await {
        warn!("Failed to close transfer session for {}: {}", image, e);
    }

    match used {
        Some(strategy) => {
            info!("{}: acquired via {}", image, strategy);
            TransferResult {
                image,
                outcome: Outcome::Acquired,
                strategy_used: Some(strategy),
            }
        }
        None => {
            progress.advance(ImageState::Failed);
            let reason = if failures.last().is_some_and(|f| f.kind == ErrorKind::Cancelled) {
                "cancelled".to_string()
            } else {
                format!("all {} strategies failed", failures.len())
            };
            error!("{}: {}", image, reason);
            TransferResult::failed(image, reason, failures)
        }
    }
}

async fn run_strategy(
    shared: &Shared,
    cancel: &CancellationToken,
    plan: &AcquisitionPlan,
    strategy: Strategy,
    remote: &ImageStore,
    session: &dyn RemoteSession,
) -> Result<()> {
    let image = &plan.image;
    match strategy {
        Strategy::RemotePull => remote.pull(cancel, image).await,
        Strategy::LocalPullTransfer => {
            shared.local.pull(cancel, image).await?;
            transfer(shared, cancel, image, remote, session).await
        }
        Strategy::RemoteBuild => build(remote, cancel, plan).await,
        Strategy::LocalBuildTransfer => {
            build(&shared.local, cancel, plan).await?;
            transfer(shared, cancel, image, remote, session).await
        }
    }
}

async fn build(
    store: &ImageStore,
    cancel: &CancellationToken,
    plan: &AcquisitionPlan,
) -> Result<()> {
    let spec = plan.build.as_ref().ok_or_else(|| {
        EngineError::validation(format!("no build parameters for {}", plan.image))
    })?;
    let tree = LocalTree::new(&spec.context)
        .map_err(EngineError::from)
        .context(format!("open build context {}", spec.context.display()))?
        .including(&spec.dockerfile);
    let context: Arc<dyn FileTree> = Arc::new(tree);
    store
        .build(
            cancel,
            BuildRequest {
                context,
                dockerfile: &spec.dockerfile,
                tag: &plan.image,
                args: &spec.args,
            },
        )
        .await
}

/// Local save, upload to the staging directory, remote load, then best-effort removal of the
/// remote copy. The local archive is a uniquely named temp file removed on every path.
async fn transfer(
    shared: &Shared,
    cancel: &CancellationToken,
    image: &ImageRef,
    remote: &ImageStore,
    session: &dyn RemoteSession,
) -> Result<()> {
    let temp_dir = shared
        .engine
        .local_temp_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    let archive = tempfile::Builder::new()
        .prefix(&format!("{}-", image.file_stem()))
        .suffix(".tar")
        .tempfile_in(&temp_dir)
        .map_err(EngineError::from)
        .context(format!("create temp archive in {}", temp_dir.display()))?;
    let local_path = archive.path().to_path_buf();

    shared.local.save_to_archive(cancel, image, &local_path).await?;

    let file_name = local_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}.tar", image.file_stem()));
    let remote_path = format!(
        "{}/{}",
        shared.engine.remote_staging_dir.trim_end_matches('/'),
        file_name
    );

    let loaded = async {
        let operation = format!("upload {} to {}", image, session.destination());
        shared
            .retry
            .execute(cancel, &operation, |_| {
                session.upload(cancel, &local_path, &remote_path)
            })
            .await?;
        let loaded = remote.load_from_archive(cancel, &remote_path).await?;
        if loaded.contains(image) || remote.exists(cancel, image).await? {
            Ok(())
        } else {
            Err(EngineError::Command {
                command: format!("docker load -i {}", remote_path),
                failure: CommandFailure::NotFound,
                status: Some(0),
                output: format!("archive did not provide {}", image),
            })
        }
    }
    .await;

    // Cleanup runs even after cancellation, bounded by its own timeout.
    let cleanup = CancellationToken::new();
    if tokio::time::timeout(CLEANUP_TIMEOUT, remote.discard(&cleanup, &remote_path))
        .await
        .is_err()
    {
        warn!(
            "Timed out removing {} on {}",
            remote_path,
            session.destination()
        );
    }
    drop(archive);
    loaded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConnector, FakeEngine, transport_config};
    use std::fs;
    use std::time::Instant;
    use tempfile::TempDir;

    struct Fixture {
        local: Arc<FakeEngine>,
        remote: Arc<FakeEngine>,
        connector: Arc<FakeConnector>,
        reconciler: Reconciler,
        temp: TempDir,
        context: TempDir,
    }

    fn fixture() -> Fixture {
        let local = FakeEngine::local();
        let remote = FakeEngine::remote("deploy@203.0.113.10:22");
        let connector = FakeConnector::new(remote.clone());
        let temp = TempDir::new().unwrap();
        let context = TempDir::new().unwrap();
        fs::write(context.path().join("Dockerfile"), "FROM alpine:3.20\nRUN make\n").unwrap();
        let reconciler = Reconciler::new(
            local.clone(),
            connector.clone(),
            RetryConfig {
                max_attempts: 2,
                initial_delay_ms: 1,
                backoff_multiplier: 2.0,
                max_delay_ms: 5,
                jitter_fraction: 0.0,
            },
            EngineConfig {
                max_archive_bytes: 1 << 20,
                remote_staging_dir: "/tmp/".to_string(),
                local_temp_dir: Some(temp.path().to_path_buf()),
                max_concurrent_transfers: 3,
            },
        );
        Fixture {
            local,
            remote,
            connector,
            reconciler,
            temp,
            context,
        }
    }

    impl Fixture {
        fn request(&self, reference: &str, buildable: bool) -> ImageRequest {
            ImageRequest {
                image: ImageRef::parse(reference).unwrap(),
                build: buildable.then(|| BuildSpec {
                    context: self.context.path().to_path_buf(),
                    dockerfile: "Dockerfile".to_string(),
                    args: BTreeMap::new(),
                }),
            }
        }

        async fn reconcile(&self, requests: &[ImageRequest]) -> Vec<TransferResult> {
            self.reconciler
                .reconcile(&CancellationToken::new(), requests, &transport_config())
                .await
                .unwrap()
        }

        fn local_temp_files(&self) -> usize {
            fs::read_dir(self.temp.path()).unwrap().count()
        }
    }

    #[test]
    fn test_plan_orders_strategies() {
        let image = ImageRef::parse("app/api:1").unwrap();
        let without_build = AcquisitionPlan::for_request(&ImageRequest {
            image: image.clone(),
            build: None,
        });
        assert_eq!(
            without_build.strategies,
            vec![Strategy::RemotePull, Strategy::LocalPullTransfer]
        );
        let with_build = AcquisitionPlan::for_request(&ImageRequest {
            image,
            build: Some(BuildSpec {
                context: PathBuf::from("."),
                dockerfile: default_dockerfile(),
                args: BTreeMap::new(),
            }),
        });
        assert_eq!(with_build.strategies, Strategy::FALLBACK_ORDER.to_vec());
    }

    #[test]
    fn test_state_transitions() {
        use ImageState::*;
        assert!(Unknown.can_advance_to(Checked));
        assert!(Checked.can_advance_to(AlreadyPresent));
        assert!(Acquiring(Strategy::RemotePull).can_advance_to(Acquiring(Strategy::RemoteBuild)));
        assert!(!Acquiring(Strategy::RemoteBuild).can_advance_to(Acquiring(Strategy::RemotePull)));
        assert!(!Acquiring(Strategy::RemotePull).can_advance_to(Acquired(Strategy::RemoteBuild)));
        assert!(!AlreadyPresent.can_advance_to(Acquiring(Strategy::RemotePull)));
        assert!(Acquired(Strategy::RemotePull).is_terminal());
        assert!(!Checked.is_terminal());
    }

    #[tokio::test]
    async fn test_second_reconcile_transfers_nothing() {
        let f = fixture();
        f.remote.add_image("nginx:1.27", 100);
        let requests = vec![f.request("nginx:1.27", false), f.request("redis:7", false)];

        let first = f.reconcile(&requests).await;
        assert_eq!(first[0].state(), ImageState::AlreadyPresent);
        assert_eq!(first[1].state(), ImageState::Acquired(Strategy::RemotePull));

        let calls_before = f.remote.calls().len();
        let second = f.reconcile(&requests).await;
        assert!(second.iter().all(|r| r.state() == ImageState::AlreadyPresent));
        let new_calls: Vec<String> = f.remote.calls()[calls_before..].to_vec();
        assert!(new_calls.iter().all(|call| call.starts_with("docker images")));
        assert_eq!(f.connector.opened(), f.connector.closed());
    }

    #[tokio::test]
    async fn test_local_pull_used_when_remote_pull_fails() {
        let f = fixture();
        f.remote.fail_pull("app/api:2");
        let results = f.reconcile(&[f.request("app/api:2", true)]).await;

        assert_eq!(results[0].strategy_used, Some(Strategy::LocalPullTransfer));
        assert!(f.remote.has_image("app/api:2"));
        assert_eq!(f.local.count_calls("docker build"), 0);
        assert_eq!(f.remote.count_calls("docker build"), 0);
        assert_eq!(f.remote.count_calls("upload"), 1);
        assert!(f.remote.files().is_empty(), "remote archive left behind");
        assert_eq!(f.local_temp_files(), 0, "local archive left behind");
    }

    #[tokio::test]
    async fn test_concurrent_transfers_are_isolated() {
        let f = fixture();
        // a: remote pull, b: local pull, c: remote build, d: local build, e: nothing works
        for reference in ["app/b:1", "app/c:1", "app/d:1", "app/e:1"] {
            f.remote.fail_pull(reference);
        }
        for reference in ["app/c:1", "app/d:1", "app/e:1"] {
            f.local.fail_pull(reference);
        }
        f.remote.fail_build("app/d:1");
        f.remote.fail_build("app/e:1");
        f.local.fail_build("app/e:1");

        let requests: Vec<ImageRequest> = ["app/a:1", "app/b:1", "app/c:1", "app/d:1", "app/e:1"]
            .iter()
            .map(|reference| f.request(reference, true))
            .collect();
        let results = f.reconcile(&requests).await;

        assert_eq!(results.len(), 5);
        let used: Vec<(String, Option<Strategy>)> = results
            .iter()
            .map(|r| (r.image.to_string(), r.strategy_used))
            .collect();
        assert_eq!(
            used,
            vec![
                ("app/a:1".to_string(), Some(Strategy::RemotePull)),
                ("app/b:1".to_string(), Some(Strategy::LocalPullTransfer)),
                ("app/c:1".to_string(), Some(Strategy::RemoteBuild)),
                ("app/d:1".to_string(), Some(Strategy::LocalBuildTransfer)),
                ("app/e:1".to_string(), None),
            ]
        );
        for reference in ["app/a:1", "app/b:1", "app/c:1", "app/d:1"] {
            assert!(f.remote.has_image(reference), "{} missing on remote", reference);
        }
        assert!(!f.remote.has_image("app/e:1"));
        assert_eq!(f.connector.opened(), 6);
        assert_eq!(f.connector.closed(), 6);
        assert!(f.remote.files().is_empty());
        assert_eq!(f.local_temp_files(), 0);
    }

    #[tokio::test]
    async fn test_failed_image_reports_every_strategy() {
        let f = fixture();
        f.remote.fail_pull("app/e:1");
        f.local.fail_pull("app/e:1");
        f.remote.fail_build("app/e:1");
        f.local.fail_build("app/e:1");

        let results = f.reconcile(&[f.request("app/e:1", true)]).await;
        let Outcome::Failed { attempts, .. } = &results[0].outcome else {
            panic!("expected failure, got {}", results[0]);
        };
        let strategies: Vec<Strategy> = attempts.iter().map(|a| a.strategy).collect();
        assert_eq!(strategies, Strategy::FALLBACK_ORDER.to_vec());
        assert_eq!(attempts[0].kind, ErrorKind::NotFound);
        assert_eq!(attempts[2].kind, ErrorKind::BuildFailed);
        let summary = results[0].to_string();
        assert!(summary.contains("remote build"));
        assert!(summary.contains("local build + transfer"));
    }

    #[tokio::test]
    async fn test_oversized_local_image_fails_transfer() {
        let f = fixture();
        f.remote.fail_pull("big/model:1");
        f.local.add_image("big/model:1", 10 << 20);

        let results = f.reconcile(&[f.request("big/model:1", false)]).await;
        let Outcome::Failed { attempts, .. } = &results[0].outcome else {
            panic!("expected failure, got {}", results[0]);
        };
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].kind, ErrorKind::SizeExceeded);
        assert_eq!(f.local.count_calls("docker save"), 0);
        assert_eq!(f.local_temp_files(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_requests_collapse() {
        let f = fixture();
        let requests = vec![f.request("redis:7", false), f.request("redis:7", false)];
        let results = f.reconcile(&requests).await;
        assert_eq!(results.len(), 1);
        assert_eq!(f.remote.count_calls("docker pull"), 1);
    }

    #[tokio::test]
    async fn test_cancelled_reconcile_returns_error() {
        let f = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = f
            .reconciler
            .reconcile(&cancel, &[f.request("redis:7", false)], &transport_config())
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Cancelled);
        assert_eq!(f.remote.count_calls("docker pull"), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_upload_cleans_up_both_sides() {
        let f = fixture();
        f.remote.fail_pull("app/api:2");
        f.remote.stall_uploads();
        let cancel = CancellationToken::new();
        let requests = [f.request("app/api:2", false)];
        let config = transport_config();

        let (result, cancelled_at) = tokio::join!(
            f.reconciler.reconcile(&cancel, &requests, &config),
            async {
                f.remote.upload_started().await;
                assert_eq!(f.remote.files().len(), 1);
                cancel.cancel();
                Instant::now()
            }
        );

        let error = result.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Cancelled);
        assert!(cancelled_at.elapsed() < Duration::from_secs(2));
        assert_eq!(f.remote.count_calls("docker load"), 0);
        assert!(f.remote.files().is_empty(), "remote archive left behind");
        assert_eq!(f.local_temp_files(), 0, "local archive left behind");
        assert_eq!(f.connector.opened(), f.connector.closed());
    }
}
