//! The discovery client: peer resolution, change watching and the
//! long-poll server loop.
//!
//! One background task per client discovers the set of discovery nodes,
//! long-polls one of them with per-app incremental timestamps, and
//! publishes each delta to watchers through an atomically swapped snapshot
//! plus a coalescing change signal. Node failover is a round-robin walk
//! over a shuffled node list with a one-second backoff.

use crate::{
    config::{Config, HttpConfig},
    error::{Code, Error, Result},
    http,
    registry::Registration,
    types::{AppData, Instance, InstancesByZone, NodeInfo},
};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Once,
    },
    time::{Duration, Instant},
};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

/// Gap between keep-alive renewals of a self-registered instance.
pub(crate) const REGISTER_GAP: Duration = Duration::from_secs(30);

/// How often the cached node list is refreshed.
const NODES_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Backoff between failed loop iterations.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Depth of the queue carrying unwatched apps to the server loop.
const DELETE_QUEUE_DEPTH: usize = 10;

/// Read-side capabilities: resolve and watch application peer sets.
#[async_trait]
pub trait Resolver {
    /// Current zone→instances snapshot for `app_id`, if any poll has
    /// delivered one.
    fn fetch(&self, app_id: &str) -> Option<Arc<InstancesByZone>>;

    /// Subscribe to change notifications for `app_id`. Idempotent; starts
    /// the background loop on first use.
    async fn watch(&self, app_id: &str) -> watch::Receiver<u64>;

    /// Stop watching `app_id` and close its change channel.
    async fn unwatch(&self, app_id: &str);

    /// URI scheme this resolver answers for.
    fn scheme(&self) -> &'static str;
}

/// Write-side capabilities: register instances and manage the client
/// lifecycle.
#[async_trait]
pub trait Registry {
    /// Register `ins` and keep it renewed until the returned handle is
    /// cancelled.
    async fn register(&self, ins: Instance) -> Result<Registration>;

    /// Swap the configuration; later requests use the new values.
    fn reload(&self, config: Config);

    /// Cancel every background task owned by the client.
    fn close(&self);
}

/// Per-app watcher state. The server loop is the sole writer; readers go
/// through the lock-free snapshot.
pub(crate) struct AppWatch {
    /// Change signal. Carries a version counter; watchers that see a new
    /// version re-fetch, so intermediate versions may coalesce.
    pub(crate) event: watch::Sender<u64>,
    /// Latest zone→instances snapshot, swapped atomically.
    pub(crate) zone_ins: ArcSwapOption<InstancesByZone>,
    /// High-water mark used as the next poll baseline.
    pub(crate) last_ts: AtomicI64,
}

impl AppWatch {
    fn new() -> Self {
        let (event, _) = watch::channel(0);
        Self {
            event,
            zone_ins: ArcSwapOption::new(None),
            last_ts: AtomicI64::new(0),
        }
    }
}

pub(crate) struct State {
    pub(crate) config: Config,
    pub(crate) apps: HashMap<String, Arc<AppWatch>>,
    pub(crate) registered: HashSet<String>,
    last_host: String,
    cancel_polls: Option<watch::Sender<bool>>,
}

pub(crate) struct Inner {
    pub(crate) http: http::Client,
    pub(crate) shutdown: broadcast::Sender<()>,
    pub(crate) closed: AtomicBool,
    pub(crate) state: RwLock<State>,
    delete_tx: mpsc::Sender<Arc<AppWatch>>,
    delete_rx: Mutex<Option<mpsc::Receiver<Arc<AppWatch>>>>,
    loop_started: Once,
}

/// Discovery client: registers local instances with the discovery server
/// and resolves watched peers through its long-poll protocol.
///
/// Cloning is cheap and shares the same client.
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<Inner>,
}

impl Discovery {
    /// Create a client. Unset `zone`/`env`/`host` fields are filled from
    /// the environment before validation.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_http_config(config, &HttpConfig::default())
    }

    /// Create a client with explicit transport tuning.
    pub fn with_http_config(mut config: Config, http_config: &HttpConfig) -> Result<Self> {
        config.fill_from_env();
        config.validate()?;
        let http = http::Client::new(http_config)?;
        let (shutdown, _) = broadcast::channel(1);
        let (delete_tx, delete_rx) = mpsc::channel(DELETE_QUEUE_DEPTH);
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                shutdown,
                closed: AtomicBool::new(false),
                state: RwLock::new(State {
                    config,
                    apps: HashMap::new(),
                    registered: HashSet::new(),
                    last_host: String::new(),
                    cancel_polls: None,
                }),
                delete_tx,
                delete_rx: Mutex::new(Some(delete_rx)),
                loop_started: Once::new(),
            }),
        })
    }

    /// Current zone→instances snapshot for `app_id`. `None` until a poll
    /// has delivered data for it. Never blocks.
    pub fn fetch(&self, app_id: &str) -> Option<Arc<InstancesByZone>> {
        let app = self.inner.state.read().apps.get(app_id).cloned()?;
        app.zone_ins.load_full()
    }

    /// Watch `app_id` for changes. Returns a receiver that wakes whenever
    /// a newer snapshot is published; wake-ups coalesce, so receivers must
    /// re-[`fetch`](Self::fetch) after each one.
    ///
    /// Adding a new app interrupts any in-flight poll so the very next one
    /// carries the updated app set.
    pub async fn watch(&self, app_id: &str) -> watch::Receiver<u64> {
        let mut state = self.inner.state.write();
        if let Some(app) = state.apps.get(app_id) {
            let receiver = app.event.subscribe();
            drop(state);
            self.ensure_server_loop();
            return receiver;
        }
        let app = Arc::new(AppWatch::new());
        let receiver = app.event.subscribe();
        state.apps.insert(app_id.to_string(), app);
        let cancel = state.cancel_polls.take();
        drop(state);

        info!("discovery: watch added appid({})", app_id);
        if let Some(cancel) = cancel {
            let _ = cancel.send(true);
        }
        self.ensure_server_loop();
        receiver
    }

    /// Stop watching `app_id`. The server loop drops the watcher on its
    /// next iteration, closing the change channel exactly once; may block
    /// briefly while an in-flight poll finishes.
    pub async fn unwatch(&self, app_id: &str) {
        let app = self.inner.state.write().apps.remove(app_id);
        if let Some(app) = app {
            info!("discovery: watch removed appid({})", app_id);
            let _ = self.inner.delete_tx.send(app).await;
        }
    }

    /// Swap the configuration; later requests use the new
    /// domain/zone/env/host.
    pub fn reload(&self, mut config: Config) {
        config.fill_from_env();
        self.inner.state.write().config = config;
    }

    /// Cancel the server loop and every renew task. Operations after this
    /// fail with [`Error::Closed`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown.send(());
    }

    /// URI scheme this client resolves.
    pub fn scheme(&self) -> &'static str {
        "discovery"
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    /// Start the server loop the first time a watcher appears.
    fn ensure_server_loop(&self) {
        let inner = self.inner.clone();
        self.inner.loop_started.call_once(move || {
            let delete_rx = inner.delete_rx.lock().take();
            if let Some(delete_rx) = delete_rx {
                tokio::spawn(server_loop(inner, delete_rx));
            }
        });
    }
}

#[async_trait]
impl Resolver for Discovery {
    fn fetch(&self, app_id: &str) -> Option<Arc<InstancesByZone>> {
        Discovery::fetch(self, app_id)
    }

    async fn watch(&self, app_id: &str) -> watch::Receiver<u64> {
        Discovery::watch(self, app_id).await
    }

    async fn unwatch(&self, app_id: &str) {
        Discovery::unwatch(self, app_id).await
    }

    fn scheme(&self) -> &'static str {
        Discovery::scheme(self)
    }
}

#[async_trait]
impl Registry for Discovery {
    async fn register(&self, ins: Instance) -> Result<Registration> {
        Discovery::register(self, ins).await
    }

    fn reload(&self, config: Config) {
        Discovery::reload(self, config)
    }

    fn close(&self) {
        Discovery::close(self)
    }
}

/// What one loop iteration's poll produced.
enum PollOutcome {
    /// Apps whose data advanced past the supplied baselines.
    Delta(HashMap<String, AppData>),
    /// The server reported nothing new.
    Unchanged,
    /// Nothing is watched right now, no request was issued.
    Idle,
}

/// Install a fresh poll-abort channel so `watch` can interrupt the
/// in-flight long poll.
fn new_poll_abort(inner: &Inner) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    inner.state.write().cancel_polls = Some(tx);
    rx
}

async fn server_loop(inner: Arc<Inner>, mut delete_rx: mpsc::Receiver<Arc<AppWatch>>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut rng = StdRng::from_entropy();
    let mut nodes: Vec<String> = Vec::new();
    let mut idx: u64 = 0;
    let mut retry: u32 = 0;
    let mut refresh_nodes = false;
    let mut last_refresh = Instant::now();
    let mut poll_abort = new_poll_abort(&inner);

    debug!("discovery: server loop started");
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        // Unwatched apps are dropped here; the last reference going away
        // closes their change channel.
        while let Ok(app) = delete_rx.try_recv() {
            drop(app);
        }
        if last_refresh.elapsed() >= NODES_REFRESH_INTERVAL {
            refresh_nodes = true;
            last_refresh = Instant::now();
        }

        if nodes.is_empty() || refresh_nodes {
            refresh_nodes = false;
            let fresh = fetch_nodes(&inner).await;
            if fresh.is_empty() {
                tokio::time::sleep(RETRY_DELAY).await;
                retry += 1;
                continue;
            }
            retry = 0;
            nodes = fresh;
            nodes.shuffle(&mut rng);
            counter!("discovery_node_refreshes", 1);
        }

        let host = nodes[(idx % nodes.len() as u64) as usize].clone();
        let outcome = tokio::select! {
            biased;
            _ = shutdown.recv() => return,
            _ = poll_abort.changed() => {
                // a new watch invalidated the app set; re-poll right away
                poll_abort = new_poll_abort(&inner);
                continue;
            }
            outcome = polls(&inner, &host) => outcome,
        };
        match outcome {
            Ok(PollOutcome::Delta(apps)) => {
                retry = 0;
                broadcast(&inner, apps);
            }
            Ok(PollOutcome::Unchanged) => {
                retry = 0;
            }
            Ok(PollOutcome::Idle) => {
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(err) => {
                warn!("discovery: polls host({}) retry({}) error({})", host, retry, err);
                counter!("discovery_poll_failures", 1);
                idx = idx.wrapping_add(1);
                tokio::time::sleep(RETRY_DELAY).await;
                retry += 1;
            }
        }
    }
}

async fn fetch_nodes(inner: &Arc<Inner>) -> Vec<String> {
    let domain = inner.state.read().config.domain().to_string();
    let url = format!("http://{}/discovery/nodes", domain);
    let reply = match inner.http.get::<Vec<NodeInfo>>(&url, &[]).await {
        Ok(reply) => reply,
        Err(err) => {
            error!("discovery: nodes({}) error({})", url, err);
            return Vec::new();
        }
    };
    if !Code(reply.code).is_ok() {
        error!("discovery: nodes({}) error code({})", url, Code(reply.code));
        return Vec::new();
    }
    let nodes: Vec<String> = reply
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|node| node.addr)
        .collect();
    if nodes.is_empty() {
        warn!("discovery: nodes({}) returned no nodes", url);
    }
    nodes
}

async fn polls(inner: &Arc<Inner>, host: &str) -> Result<PollOutcome> {
    let (env, hostname, watched) = {
        let mut state = inner.state.write();
        let host_changed = state.last_host != host;
        if host_changed {
            state.last_host = host.to_string();
        }
        let mut watched = Vec::with_capacity(state.apps.len());
        for (app_id, app) in &state.apps {
            if host_changed {
                // baselines are per-server; force a full refresh against
                // the new host
                app.last_ts.store(0, Ordering::SeqCst);
            }
            watched.push((app_id.clone(), app.last_ts.load(Ordering::SeqCst)));
        }
        (
            state.config.env().to_string(),
            state.config.host().to_string(),
            watched,
        )
    };
    if watched.is_empty() {
        return Ok(PollOutcome::Idle);
    }

    let url = format!("http://{}/discovery/polls", host);
    let mut query: Vec<(&str, String)> = Vec::with_capacity(2 + watched.len() * 2);
    query.push(("env", env));
    query.push(("hostname", hostname));
    for (app_id, _) in &watched {
        query.push(("appid", app_id.clone()));
    }
    for (_, last_ts) in &watched {
        query.push(("latest_timestamp", last_ts.to_string()));
    }

    let reply = inner.http.get::<HashMap<String, AppData>>(&url, &query).await?;
    match Code(reply.code) {
        Code::OK => {
            let apps = reply.data.unwrap_or_default();
            if apps.values().any(|app| app.last_ts == 0) {
                error!("discovery: polls({}) returned latest_timestamp 0", url);
                return Err(Error::Code(Code::SERVER_ERR));
            }
            debug!("discovery: polls({}) delivered {} app(s)", url, apps.len());
            Ok(PollOutcome::Delta(apps))
        }
        Code::NOT_MODIFIED => Ok(PollOutcome::Unchanged),
        code => {
            error!("discovery: polls({}) error code({})", url, code);
            Err(Error::Code(code))
        }
    }
}

/// Publish one poll delta: prune empty zones, swap snapshots, advance
/// baselines and wake watchers.
fn broadcast(inner: &Inner, apps: HashMap<String, AppData>) {
    for (app_id, mut data) in apps {
        data.zone_instances.retain(|_, instances| !instances.is_empty());
        let total: usize = data.zone_instances.values().map(Vec::len).sum();
        if total == 0 {
            // an all-empty update carries no usable peer set; skip it and
            // keep the previous snapshot
            continue;
        }
        let app = inner.state.read().apps.get(&app_id).cloned();
        if let Some(app) = app {
            app.last_ts.store(data.last_ts, Ordering::SeqCst);
            app.zone_ins.store(Some(Arc::new(data.zone_instances)));
            app.event.send_modify(|version| *version = version.wrapping_add(1));
        }
    }
}
