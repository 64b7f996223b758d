//! Self-registration keep-alive
//!
//! `register` posts the instance to the discovery server, then keeps it
//! alive from a background task that renews every 30 seconds and falls
//! back to a fresh registration when the server has lost the record. The
//! returned [`Registration`] handle deregisters on cancel, in order: stop
//! renewing, post the cancellation, release the local duplicate guard.

use crate::{
    config::Config,
    discovery::{Discovery, Inner, REGISTER_GAP},
    error::{Code, Error, Result},
    types::Instance,
};
use metrics::counter;
use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Wire value for an Up instance at registration time.
const STATUS_UP: &str = "1";

/// Handle to an active self-registration.
///
/// Cancelling stops the renew task, posts the deregistration and releases
/// the duplicate guard before returning, so callers can rely on post-cancel
/// cleanliness (a later `register` for the same appid succeeds). Dropping
/// the handle triggers the same teardown without waiting for it.
#[derive(Debug)]
pub struct Registration {
    app_id: String,
    cancel_tx: oneshot::Sender<()>,
    done_rx: oneshot::Receiver<()>,
}

impl Registration {
    /// The appid this handle keeps alive.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Stop renewing and deregister. Returns once the cancellation has
    /// been issued to the server.
    pub async fn cancel(self) {
        let _ = self.cancel_tx.send(());
        let _ = self.done_rx.await;
    }
}

impl Discovery {
    /// Register `ins` with the discovery server and renew it every 30
    /// seconds until the returned handle is cancelled or the client is
    /// closed.
    ///
    /// At most one registration per appid per client: a second call for
    /// the same appid fails with [`Error::Duplication`] until the first
    /// one has been cancelled.
    pub async fn register(&self, ins: Instance) -> Result<Registration> {
        let inner = self.inner().clone();
        if inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if !inner.state.write().registered.insert(ins.app_id.clone()) {
            return Err(Error::Duplication);
        }
        if let Err(err) = register_call(&inner, &ins).await {
            inner.state.write().registered.remove(&ins.app_id);
            return Err(err);
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let app_id = ins.app_id.clone();
        tokio::spawn(renew_loop(inner, ins, REGISTER_GAP, cancel_rx, done_tx));
        Ok(Registration {
            app_id,
            cancel_tx,
            done_rx,
        })
    }
}

/// Keep one instance alive until cancelled, then deregister it.
async fn renew_loop(
    inner: Arc<Inner>,
    ins: Instance,
    gap: Duration,
    mut cancel_rx: oneshot::Receiver<()>,
    done_tx: oneshot::Sender<()>,
) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + gap, gap);
    // the closed flag covers a close() racing the subscription above
    while !inner.closed.load(Ordering::SeqCst) {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = renew_call(&inner, &ins).await {
                    if err.is_nothing_found() {
                        // the server lost the record; start over
                        let _ = register_call(&inner, &ins).await;
                    }
                }
            }
            _ = &mut cancel_rx => break,
            _ = shutdown.recv() => break,
        }
    }
    if let Err(err) = cancel_call(&inner, &ins).await {
        warn!("discovery: cancel appid({}) error({})", ins.app_id, err);
    }
    inner.state.write().registered.remove(&ins.app_id);
    let _ = done_tx.send(());
}

fn base_params(config: &Config) -> Vec<(&'static str, String)> {
    vec![
        ("zone", config.zone().to_string()),
        ("env", config.env().to_string()),
        ("hostname", config.host().to_string()),
    ]
}

pub(crate) async fn register_call(inner: &Arc<Inner>, ins: &Instance) -> Result<()> {
    let config = inner.state.read().config.clone();
    let url = format!("http://{}/discovery/register", config.domain());
    let metadata = if ins.metadata.is_empty() {
        String::new()
    } else {
        serde_json::to_string(&ins.metadata).unwrap_or_default()
    };

    let mut form = base_params(&config);
    form.push(("appid", ins.app_id.clone()));
    form.push(("addrs", ins.addrs.join(",")));
    form.push(("color", ins.color.clone()));
    form.push(("version", ins.version.clone()));
    form.push(("status", STATUS_UP.to_string()));
    form.push(("metadata", metadata));

    let reply = match inner.http.post_form::<serde_json::Value>(&url, &form).await {
        Ok(reply) => reply,
        Err(err) => {
            error!(
                "discovery: register({}) env({}) appid({}) addrs({:?}) error({})",
                url,
                config.env(),
                ins.app_id,
                ins.addrs,
                err
            );
            return Err(err);
        }
    };
    let code = Code(reply.code);
    if !code.is_ok() {
        warn!(
            "discovery: register({}) env({}) appid({}) code({})",
            url,
            config.env(),
            ins.app_id,
            code
        );
        counter!("discovery_register_failures", 1);
        return Err(Error::Code(code));
    }
    info!(
        "discovery: register({}) env({}) appid({}) addrs({:?}) success",
        url,
        config.env(),
        ins.app_id,
        ins.addrs
    );
    counter!("discovery_registers", 1);
    Ok(())
}

async fn renew_call(inner: &Arc<Inner>, ins: &Instance) -> Result<()> {
    let config = inner.state.read().config.clone();
    let url = format!("http://{}/discovery/renew", config.domain());
    let mut form = base_params(&config);
    form.push(("appid", ins.app_id.clone()));

    let reply = match inner.http.post_form::<serde_json::Value>(&url, &form).await {
        Ok(reply) => reply,
        Err(err) => {
            error!(
                "discovery: renew({}) env({}) appid({}) hostname({}) error({})",
                url,
                config.env(),
                ins.app_id,
                config.host(),
                err
            );
            return Err(err);
        }
    };
    let code = Code(reply.code);
    if !code.is_ok() {
        // NothingFound is the expected "please re-register" answer and is
        // handled by the caller without noise
        if code != Code::NOTHING_FOUND {
            error!(
                "discovery: renew({}) env({}) appid({}) hostname({}) code({})",
                url,
                config.env(),
                ins.app_id,
                config.host(),
                code
            );
        }
        return Err(Error::Code(code));
    }
    Ok(())
}

async fn cancel_call(inner: &Arc<Inner>, ins: &Instance) -> Result<()> {
    let config = inner.state.read().config.clone();
    let url = format!("http://{}/discovery/cancel", config.domain());
    let mut form = base_params(&config);
    form.push(("appid", ins.app_id.clone()));

    let reply = match inner.http.post_form::<serde_json::Value>(&url, &form).await {
        Ok(reply) => reply,
        Err(err) => {
            error!(
                "discovery: cancel({}) env({}) appid({}) hostname({}) error({})",
                url,
                config.env(),
                ins.app_id,
                config.host(),
                err
            );
            return Err(err);
        }
    };
    let code = Code(reply.code);
    if !code.is_ok() {
        warn!(
            "discovery: cancel({}) env({}) appid({}) hostname({}) code({})",
            url,
            config.env(),
            ins.app_id,
            config.host(),
            code
        );
        return Err(Error::Code(code));
    }
    info!(
        "discovery: cancel({}) env({}) appid({}) hostname({}) success",
        url,
        config.env(),
        ins.app_id,
        config.host()
    );
    Ok(())
}
