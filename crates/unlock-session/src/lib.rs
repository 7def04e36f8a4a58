//! Unlock session controller: offer loading, the hidden countdown and the final reveal.
//!
//! One [`UnlockController`] drives a single session at a time:
//!
//! ```text
//! idle -> loading-offers -> (offers-shown | error) -> countdown-running -> unlocked
//! ```
//!
//! The offer list and the countdown are independent sub-states. Reloading offers
//! never touches a running countdown, and every exit from `countdown-running`
//! cancels its tick.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};
use unlock_core::{
    Catalog, CatalogEntry, CompletionNotice, Offer, PendingOfferRecord, SessionState,
    COMPLETED_STATUS, COUNTDOWN_DURATION_MS, DEFAULT_MAX_OFFERS, FALLBACK_RESOURCE_URL,
    PENDING_OFFER_KEY, TICK_PERIOD_MS,
};
use unlock_provider::{LockerProviderClient, OfferProvider, DEFAULT_CLIENT_AGENT, FALLBACK_CLIENT_ADDRESS};
use uuid::Uuid;

pub const CRATE_NAME: &str = "unlock-session";

pub const LOADING_MESSAGE: &str = "Loading offers...";
pub const FAILED_MESSAGE: &str = "Failed to load offers";
pub const EMPTY_MESSAGE: &str = "No offers available at the moment.";
pub const PREPARING_MESSAGE: &str = "Preparing your access…";
pub const READY_MESSAGE: &str = "Ready";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub countdown: Duration,
    pub tick_period: Duration,
    pub max_offers: usize,
    pub client_agent: String,
    pub fallback_url: String,
    pub catalog_path: Option<PathBuf>,
    pub pending_path: PathBuf,
    pub ack_url: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            countdown: Duration::from_millis(COUNTDOWN_DURATION_MS),
            tick_period: Duration::from_millis(TICK_PERIOD_MS),
            max_offers: DEFAULT_MAX_OFFERS,
            client_agent: DEFAULT_CLIENT_AGENT.to_string(),
            fallback_url: FALLBACK_RESOURCE_URL.to_string(),
            catalog_path: None,
            pending_path: PathBuf::from(format!("./.unlock/{PENDING_OFFER_KEY}.json")),
            ack_url: None,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            countdown: env_parse::<u64>("UNLOCK_COUNTDOWN_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.countdown),
            tick_period: env_parse::<u64>("UNLOCK_TICK_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_period),
            max_offers: env_parse::<usize>("UNLOCK_MAX_OFFERS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_offers),
            client_agent: std::env::var("UNLOCK_USER_AGENT").unwrap_or(defaults.client_agent),
            fallback_url: std::env::var("UNLOCK_FALLBACK_URL").unwrap_or(defaults.fallback_url),
            catalog_path: std::env::var("UNLOCK_CATALOG_PATH").ok().map(PathBuf::from),
            pending_path: std::env::var("UNLOCK_PENDING_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.pending_path),
            ack_url: std::env::var("UNLOCK_ACK_URL").ok().filter(|v| !v.trim().is_empty()),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    fallback_url: Option<String>,
    items: Vec<CatalogEntry>,
}

/// Built-in catalog unless `catalog_path` points at a YAML catalog.
pub fn load_catalog(config: &SessionConfig) -> anyhow::Result<Catalog> {
    match &config.catalog_path {
        Some(path) => load_catalog_file(path, &config.fallback_url),
        None => Ok(Catalog::builtin().with_fallback_url(config.fallback_url.clone())),
    }
}

pub fn load_catalog_file(path: impl AsRef<Path>, default_fallback_url: &str) -> anyhow::Result<Catalog> {
    let path = path.as_ref();
    let yaml = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: CatalogFile =
        serde_yaml::from_str(&yaml).with_context(|| format!("parsing {}", path.display()))?;
    let fallback_url = file
        .fallback_url
        .unwrap_or_else(|| default_fallback_url.to_string());
    Ok(Catalog::new(file.items, fallback_url))
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no unlock session is open")]
    NoActiveSession,
    #[error("offers are not currently shown")]
    OffersNotShown,
    #[error("offer `{0}` is not part of the current batch")]
    UnknownOffer(String),
    #[error("no tick scheduler configured and no tokio runtime available")]
    NoScheduler,
}

/// Wall-clock source. Elapsed countdown time is always `now - start`.
pub trait Clock: Send + Sync {
    /// Epoch milliseconds.
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let by = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now_ms.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

pub type TickFn = Arc<dyn Fn() + Send + Sync>;

/// Handle to a recurring tick. Cancelling is idempotent; dropping cancels.
#[derive(Debug)]
pub struct TickHandle {
    cancelled: Arc<AtomicBool>,
    task: Option<tokio::task::AbortHandle>,
}

impl TickHandle {
    fn new(cancelled: Arc<AtomicBool>, task: Option<tokio::task::AbortHandle>) -> Self {
        Self { cancelled, task }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for TickHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub trait TickScheduler: Send + Sync {
    fn schedule(&self, period: Duration, tick: TickFn) -> TickHandle;
}

#[derive(Debug, Clone)]
pub struct TokioTickScheduler {
    runtime: Handle,
}

impl TokioTickScheduler {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl TickScheduler for TokioTickScheduler {
    fn schedule(&self, period: Duration, tick: TickFn) -> TickHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let period = period.max(Duration::from_millis(1));
        let task = self.runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                tick();
            }
        });
        TickHandle::new(cancelled, Some(task.abort_handle()))
    }
}

struct ManualTask {
    cancelled: Arc<AtomicBool>,
    tick: TickFn,
}

/// Scheduler whose ticks only run when [`ManualTickScheduler::fire`] is called.
#[derive(Default)]
pub struct ManualTickScheduler {
    tasks: Mutex<Vec<ManualTask>>,
    scheduled: AtomicUsize,
    fired: AtomicUsize,
}

impl ManualTickScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every live task once and returns how many ran.
    pub fn fire(&self) -> usize {
        let live: Vec<TickFn> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.retain(|t| !t.cancelled.load(Ordering::SeqCst));
            tasks.iter().map(|t| Arc::clone(&t.tick)).collect()
        };
        for tick in &live {
            tick();
        }
        self.fired.fetch_add(live.len(), Ordering::SeqCst);
        live.len()
    }

    pub fn active(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .count()
    }

    pub fn scheduled(&self) -> usize {
        self.scheduled.load(Ordering::SeqCst)
    }

    pub fn fired(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }
}

impl TickScheduler for ManualTickScheduler {
    fn schedule(&self, _period: Duration, tick: TickFn) -> TickHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ManualTask {
                cancelled: Arc::clone(&cancelled),
                tick,
            });
        self.scheduled.fetch_add(1, Ordering::SeqCst);
        TickHandle::new(cancelled, None)
    }
}

/// Receives the pending-offer breadcrumb. Write-only; the controller never reads it back.
pub trait PendingOfferSink: Send + Sync {
    fn record(&self, record: &PendingOfferRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPendingSink;

impl PendingOfferSink for NoopPendingSink {
    fn record(&self, _record: &PendingOfferRecord) {}
}

/// Overwrites a single JSON file per write.
#[derive(Debug, Clone)]
pub struct FilePendingSink {
    path: PathBuf,
}

impl FilePendingSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, record: &PendingOfferRecord) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec(record).context("serializing pending offer record")?;
        std::fs::write(&self.path, bytes)
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

impl PendingOfferSink for FilePendingSink {
    fn record(&self, record: &PendingOfferRecord) {
        if let Err(err) = self.write(record) {
            warn!(error = %err, path = %self.path.display(), "failed to write pending offer record");
        }
    }
}

/// Opens an offer URL without waiting on it.
pub trait Navigator: Send + Sync {
    fn open(&self, url: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn open(&self, url: &str) {
        info!(url, "opening offer");
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnlockEvent {
    pub session_id: Uuid,
    pub item: String,
    pub offer_id: String,
    pub resource_url: String,
    pub client_address: String,
    pub client_agent: String,
}

impl UnlockEvent {
    pub fn completion_notice(&self) -> CompletionNotice {
        CompletionNotice {
            offer_id: self.offer_id.clone(),
            user_ip: self.client_address.clone(),
            user_agent: self.client_agent.clone(),
            status: COMPLETED_STATUS.to_string(),
            game_name: self.item.clone(),
        }
    }
}

pub type UnlockCallback = Arc<dyn Fn(&UnlockEvent) + Send + Sync>;

/// Fire-and-forget POST of a [`CompletionNotice`] to the acknowledgement endpoint.
#[derive(Debug, Clone)]
pub struct HttpAckNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpAckNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn notify(&self, event: &UnlockEvent) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("no tokio runtime; completion acknowledgement skipped");
            return;
        };
        let notice = event.completion_notice();
        let client = self.client.clone();
        let url = self.url.clone();
        let span = info_span!("completion_ack", session_id = %event.session_id, url = %url);
        runtime.spawn(
            async move {
                match client.post(&url).json(&notice).send().await {
                    Ok(resp) => debug!(status = resp.status().as_u16(), "completion acknowledged"),
                    Err(err) => warn!(error = %err, "completion acknowledgement failed"),
                }
            }
            .instrument(span),
        );
    }
}

/// Offer sub-state as rendered by a presentation surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OfferPanel {
    Idle,
    Loading,
    Failed { message: String },
    Empty,
    Offers { offers: Vec<Offer> },
}

impl OfferPanel {
    /// Failed and empty panels offer a manual retry/refresh.
    pub fn can_retry(&self) -> bool {
        matches!(self, OfferPanel::Failed { .. } | OfferPanel::Empty)
    }

    pub fn headline(&self) -> Option<&'static str> {
        match self {
            OfferPanel::Loading => Some(LOADING_MESSAGE),
            OfferPanel::Failed { .. } => Some(FAILED_MESSAGE),
            OfferPanel::Empty => Some(EMPTY_MESSAGE),
            OfferPanel::Idle | OfferPanel::Offers { .. } => None,
        }
    }
}

/// Render-ready snapshot. Carries derived flags only, never timers or timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub item: Option<String>,
    pub state: SessionState,
    pub panel: OfferPanel,
    pub countdown_active: bool,
    pub reveal_ready: bool,
    pub reveal_url: Option<String>,
}

impl SessionView {
    pub fn progress_label(&self) -> Option<&'static str> {
        if self.countdown_active {
            Some(PREPARING_MESSAGE)
        } else if self.reveal_ready {
            Some(READY_MESSAGE)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Shown { count: usize },
    Failed { message: String },
    /// Another load for this session is still pending.
    AlreadyInFlight,
    /// The session was reset while the call was pending; the result was dropped.
    Stale,
    NoSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectOutcome {
    CountdownStarted,
    CountdownAlreadyRunning,
    AlreadyUnlocked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PanelState {
    Idle,
    Loading { ticket: u64 },
    Shown(Vec<Offer>),
    Failed(String),
}

#[derive(Debug)]
enum Countdown {
    Inactive,
    Running {
        seq: u64,
        started_at_ms: i64,
        handle: TickHandle,
    },
    Unlocked,
}

#[derive(Debug)]
struct SessionInner {
    session_id: Option<Uuid>,
    item: Option<String>,
    panel: PanelState,
    selected_offer: Option<String>,
    target_url: Option<String>,
    client_address: Option<String>,
    countdown: Countdown,
    // Monotonic across resets so stale loads and ticks never match a newer session.
    load_seq: u64,
    countdown_seq: u64,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            session_id: None,
            item: None,
            panel: PanelState::Idle,
            selected_offer: None,
            target_url: None,
            client_address: None,
            countdown: Countdown::Inactive,
            load_seq: 0,
            countdown_seq: 0,
        }
    }

    fn clear(&mut self) {
        if let Countdown::Running { handle, .. } =
            std::mem::replace(&mut self.countdown, Countdown::Inactive)
        {
            handle.cancel();
        }
        self.session_id = None;
        self.item = None;
        self.panel = PanelState::Idle;
        self.selected_offer = None;
        self.target_url = None;
        self.client_address = None;
    }

    fn state(&self) -> SessionState {
        match (&self.countdown, &self.panel) {
            (Countdown::Running { .. }, _) => SessionState::CountdownRunning,
            (Countdown::Unlocked, _) => SessionState::Unlocked,
            (Countdown::Inactive, PanelState::Idle) => SessionState::Idle,
            (Countdown::Inactive, PanelState::Loading { .. }) => SessionState::LoadingOffers,
            (Countdown::Inactive, PanelState::Shown(_)) => SessionState::OffersShown,
            (Countdown::Inactive, PanelState::Failed(_)) => SessionState::Error,
        }
    }
}

/// Puts the panel back if a load future is dropped before its batch is applied.
struct PendingLoad<'a> {
    inner: &'a Mutex<SessionInner>,
    ticket: u64,
    previous: Option<PanelState>,
}

impl Drop for PendingLoad<'_> {
    fn drop(&mut self) {
        let Some(previous) = self.previous.take() else {
            return;
        };
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(inner.panel, PanelState::Loading { ticket } if ticket == self.ticket) {
            debug!(ticket = self.ticket, "offer load abandoned; panel restored");
            inner.panel = previous;
        }
    }
}

struct Deps {
    provider: Arc<dyn OfferProvider>,
    catalog: Catalog,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn TickScheduler>,
    navigator: Arc<dyn Navigator>,
    pending_sink: Arc<dyn PendingOfferSink>,
    on_unlock: Option<UnlockCallback>,
    config: SessionConfig,
}

pub struct UnlockControllerBuilder {
    provider: Arc<dyn OfferProvider>,
    catalog: Option<Catalog>,
    clock: Option<Arc<dyn Clock>>,
    scheduler: Option<Arc<dyn TickScheduler>>,
    navigator: Option<Arc<dyn Navigator>>,
    pending_sink: Option<Arc<dyn PendingOfferSink>>,
    on_unlock: Option<UnlockCallback>,
    config: SessionConfig,
}

impl UnlockControllerBuilder {
    pub fn catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn TickScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    pub fn pending_sink(mut self, sink: Arc<dyn PendingOfferSink>) -> Self {
        self.pending_sink = Some(sink);
        self
    }

    pub fn on_unlock(mut self, callback: impl Fn(&UnlockEvent) + Send + Sync + 'static) -> Self {
        self.on_unlock = Some(Arc::new(callback));
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Falls back to a [`TokioTickScheduler`] on the current runtime when no scheduler was set.
    pub fn build(self) -> Result<UnlockController, SessionError> {
        let scheduler: Arc<dyn TickScheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioTickScheduler::current().ok_or(SessionError::NoScheduler)?),
        };
        let catalog = self
            .catalog
            .unwrap_or_else(|| Catalog::builtin().with_fallback_url(self.config.fallback_url.clone()));
        let deps = Deps {
            provider: self.provider,
            catalog,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            scheduler,
            navigator: self.navigator.unwrap_or_else(|| Arc::new(LogNavigator)),
            pending_sink: self.pending_sink.unwrap_or_else(|| Arc::new(NoopPendingSink)),
            on_unlock: self.on_unlock,
            config: self.config,
        };
        Ok(UnlockController {
            inner: Arc::new(Mutex::new(SessionInner::new())),
            deps: Arc::new(deps),
        })
    }
}

/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct UnlockController {
    inner: Arc<Mutex<SessionInner>>,
    deps: Arc<Deps>,
}

impl fmt::Debug for UnlockController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnlockController")
            .field("state", &self.state())
            .field("config", &self.deps.config)
            .finish()
    }
}

impl UnlockController {
    pub fn builder(provider: Arc<dyn OfferProvider>) -> UnlockControllerBuilder {
        UnlockControllerBuilder {
            provider,
            catalog: None,
            clock: None,
            scheduler: None,
            navigator: None,
            pending_sink: None,
            on_unlock: None,
            config: SessionConfig::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.deps.catalog
    }

    pub fn config(&self) -> &SessionConfig {
        &self.deps.config
    }

    /// Starts a fresh session for `item`, tearing down whatever was there before.
    pub fn open(&self, item: &str) -> Uuid {
        let mut inner = self.lock();
        inner.clear();
        let session_id = Uuid::new_v4();
        inner.session_id = Some(session_id);
        inner.item = Some(item.to_string());
        info!(%session_id, item, "unlock session opened");
        session_id
    }

    /// Fetches a batch from the provider. At most one load is in flight per session.
    pub async fn load_offers(&self) -> LoadOutcome {
        let (session_id, ticket, previous) = {
            let mut inner = self.lock();
            let Some(session_id) = inner.session_id else {
                return LoadOutcome::NoSession;
            };
            if let PanelState::Loading { ticket } = inner.panel {
                debug!(%session_id, ticket, "offer load already in flight");
                return LoadOutcome::AlreadyInFlight;
            }
            inner.load_seq += 1;
            let ticket = inner.load_seq;
            let previous = std::mem::replace(&mut inner.panel, PanelState::Loading { ticket });
            (session_id, ticket, previous)
        };

        let mut pending = PendingLoad {
            inner: &self.inner,
            ticket,
            previous: Some(previous),
        };
        let span = info_span!("load_offers", %session_id, ticket);
        let outcome = self.fetch_and_apply(ticket).instrument(span).await;
        pending.previous = None;
        outcome
    }

    pub async fn retry(&self) -> LoadOutcome {
        self.load_offers().await
    }

    async fn fetch_and_apply(&self, ticket: u64) -> LoadOutcome {
        let deps = &self.deps;
        let client_address = deps.provider.resolve_client_address().await;
        let batch = deps
            .provider
            .fetch_offers(&client_address, &deps.config.client_agent, deps.config.max_offers)
            .await;

        let mut inner = self.lock();
        if !matches!(inner.panel, PanelState::Loading { ticket: pending } if pending == ticket) {
            debug!("discarding stale offer batch");
            return LoadOutcome::Stale;
        }
        inner.client_address = Some(client_address);
        if batch.success {
            let count = batch.offers.len();
            info!(count, "offers shown");
            inner.panel = PanelState::Shown(batch.offers);
            LoadOutcome::Shown { count }
        } else {
            let message = batch.error.unwrap_or_else(|| FAILED_MESSAGE.to_string());
            warn!(%message, "offer load failed");
            inner.panel = PanelState::Failed(message.clone());
            LoadOutcome::Failed { message }
        }
    }

    /// Opens `offer`, writes the pending breadcrumb and starts the countdown if none exists.
    pub fn select_offer(&self, offer: &Offer) -> Result<SelectOutcome, SessionError> {
        let now_ms = self.deps.clock.now_ms();
        let (session_id, outcome, record) = {
            let mut inner = self.lock();
            let (Some(session_id), Some(item)) = (inner.session_id, inner.item.clone()) else {
                return Err(SessionError::NoActiveSession);
            };
            match &inner.panel {
                PanelState::Shown(offers) if offers.iter().any(|o| o.id == offer.id) => {}
                PanelState::Shown(_) => return Err(SessionError::UnknownOffer(offer.id.clone())),
                _ => return Err(SessionError::OffersNotShown),
            }

            inner.target_url = Some(self.deps.catalog.resolve(&item));
            if inner.selected_offer.is_none() {
                inner.selected_offer = Some(offer.id.clone());
            }

            let outcome = if matches!(inner.countdown, Countdown::Inactive) {
                self.start_countdown(&mut inner, now_ms);
                SelectOutcome::CountdownStarted
            } else if matches!(inner.countdown, Countdown::Running { .. }) {
                SelectOutcome::CountdownAlreadyRunning
            } else {
                SelectOutcome::AlreadyUnlocked
            };

            let record = PendingOfferRecord {
                offer_id: offer.id.clone(),
                game_name: item,
                timestamp: now_ms,
            };
            (session_id, outcome, record)
        };

        self.deps.pending_sink.record(&record);
        self.deps.navigator.open(&offer.url);
        info!(%session_id, offer_id = %offer.id, ?outcome, "offer selected");
        Ok(outcome)
    }

    fn start_countdown(&self, inner: &mut SessionInner, now_ms: i64) {
        inner.countdown_seq += 1;
        let seq = inner.countdown_seq;
        let inner_ref = Arc::downgrade(&self.inner);
        let deps_ref = Arc::downgrade(&self.deps);
        let tick: TickFn = Arc::new(move || {
            if let (Some(inner), Some(deps)) = (inner_ref.upgrade(), deps_ref.upgrade()) {
                UnlockController { inner, deps }.tick_countdown(seq);
            }
        });
        let handle = self.deps.scheduler.schedule(self.deps.config.tick_period, tick);
        inner.countdown = Countdown::Running {
            seq,
            started_at_ms: now_ms,
            handle,
        };
    }

    fn tick_countdown(&self, seq: u64) -> bool {
        let now_ms = self.deps.clock.now_ms();
        let duration_ms = i64::try_from(self.deps.config.countdown.as_millis()).unwrap_or(i64::MAX);
        let event = {
            let mut inner = self.lock();
            let started_at_ms = match &inner.countdown {
                Countdown::Running {
                    seq: running,
                    started_at_ms,
                    ..
                } if *running == seq => *started_at_ms,
                _ => return false,
            };
            let elapsed_ms = now_ms.saturating_sub(started_at_ms);
            if elapsed_ms < duration_ms {
                return false;
            }
            if let Countdown::Running { handle, .. } =
                std::mem::replace(&mut inner.countdown, Countdown::Unlocked)
            {
                handle.cancel();
            }

            let event = UnlockEvent {
                session_id: inner.session_id.unwrap_or_else(Uuid::nil),
                item: inner.item.clone().unwrap_or_default(),
                offer_id: inner.selected_offer.clone().unwrap_or_default(),
                resource_url: inner
                    .target_url
                    .clone()
                    .unwrap_or_else(|| self.deps.catalog.fallback_url().to_string()),
                client_address: inner
                    .client_address
                    .clone()
                    .unwrap_or_else(|| FALLBACK_CLIENT_ADDRESS.to_string()),
                client_agent: self.deps.config.client_agent.clone(),
            };
            info!(session_id = %event.session_id, elapsed_ms, "countdown elapsed; resource revealed");
            event
        };

        if let Some(callback) = &self.deps.on_unlock {
            callback(&event);
        }
        true
    }

    /// Returns to idle from any state and cancels the countdown tick.
    pub fn reset(&self) {
        let mut inner = self.lock();
        if let Some(session_id) = inner.session_id {
            info!(%session_id, state = %inner.state(), "unlock session reset");
        }
        inner.clear();
    }

    pub fn close(&self) {
        self.reset();
    }

    pub fn state(&self) -> SessionState {
        self.lock().state()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.lock().session_id
    }

    pub fn item(&self) -> Option<String> {
        self.lock().item.clone()
    }

    pub fn offers(&self) -> Vec<Offer> {
        match &self.lock().panel {
            PanelState::Shown(offers) => offers.clone(),
            _ => Vec::new(),
        }
    }

    pub fn selected_offer_id(&self) -> Option<String> {
        self.lock().selected_offer.clone()
    }

    pub fn target_url(&self) -> Option<String> {
        self.lock().target_url.clone()
    }

    pub fn countdown_started_at_ms(&self) -> Option<i64> {
        match &self.lock().countdown {
            Countdown::Running { started_at_ms, .. } => Some(*started_at_ms),
            _ => None,
        }
    }

    pub fn view(&self) -> SessionView {
        let inner = self.lock();
        let panel = match &inner.panel {
            PanelState::Idle => OfferPanel::Idle,
            PanelState::Loading { .. } => OfferPanel::Loading,
            PanelState::Failed(message) => OfferPanel::Failed {
                message: message.clone(),
            },
            PanelState::Shown(offers) if offers.is_empty() => OfferPanel::Empty,
            PanelState::Shown(offers) => OfferPanel::Offers {
                offers: offers.clone(),
            },
        };
        let reveal_ready = matches!(inner.countdown, Countdown::Unlocked);
        SessionView {
            item: inner.item.clone(),
            state: inner.state(),
            panel,
            countdown_active: matches!(inner.countdown, Countdown::Running { .. }),
            reveal_ready,
            reveal_url: if reveal_ready {
                inner.target_url.clone()
            } else {
                None
            },
        }
    }
}

/// Wires the locker-wall client, catalog, pending-offer file and optional acknowledgement.
pub fn controller_from_env(navigator: Arc<dyn Navigator>) -> anyhow::Result<UnlockController> {
    let config = SessionConfig::from_env();
    let catalog = load_catalog(&config)?;
    let provider = LockerProviderClient::from_env()?;
    let mut builder = UnlockController::builder(Arc::new(provider))
        .catalog(catalog)
        .navigator(navigator)
        .pending_sink(Arc::new(FilePendingSink::new(config.pending_path.clone())));
    if let Some(url) = &config.ack_url {
        let notifier = HttpAckNotifier::new(url.clone())?;
        builder = builder.on_unlock(move |event| notifier.notify(event));
    }
    Ok(builder.config(config).build()?)
}
