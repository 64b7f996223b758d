//! Replication fan-out to one peer discovery node
//!
//! A `PeerNode` represents one peer discovery server and forwards every
//! instance mutation received by the local node (register, renew, cancel,
//! status/metadata set) to it, preserving the origin's timestamp triple.
//! Cross-zone calls carry `replication=false` so the receiving peer stores
//! the mutation without fanning it out again, which is what keeps a
//! multi-zone cluster from amplifying its own traffic.
//!
//! A `PeerNode` never retries; retry and quorum policy belong to the
//! registry driving it.

use crate::{
    config::HttpConfig,
    error::{Code, Error, Result},
    http,
    types::{Instance, NodeStatus},
};
use metrics::counter;
use tracing::{error, warn};

const REGISTER_URL: &str = "/discovery/register";
const RENEW_URL: &str = "/discovery/renew";
const CANCEL_URL: &str = "/discovery/cancel";
const SET_URL: &str = "/discovery/set";

/// Mutation kinds a peer node replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Register,
    Renew,
    Cancel,
    Set,
}

/// A peer discovery server that mutations received by this node are
/// replicated to. Immutable after construction except for its status.
pub struct PeerNode {
    client: http::Client,
    addr: String,
    register_url: String,
    renew_url: String,
    cancel_url: String,
    set_url: String,
    status: NodeStatus,
    zone: String,
    other_zone: bool,
}

impl PeerNode {
    /// Build a descriptor for the peer at `addr` (`host:port`) living in
    /// `zone`, compared against `local_zone` to decide whether the peer
    /// should fan mutations out further.
    pub fn new<A: Into<String>, Z: Into<String>>(
        http_config: &HttpConfig,
        addr: A,
        zone: Z,
        local_zone: &str,
    ) -> Result<Self> {
        let addr = addr.into();
        let zone = zone.into();
        Ok(Self {
            client: http::Client::new(http_config)?,
            register_url: format!("http://{addr}{REGISTER_URL}"),
            renew_url: format!("http://{addr}{RENEW_URL}"),
            cancel_url: format!("http://{addr}{CANCEL_URL}"),
            set_url: format!("http://{addr}{SET_URL}"),
            other_zone: zone != local_zone,
            zone,
            addr,
            status: NodeStatus::Lost,
        })
    }

    /// Peer address (`host:port`).
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Zone the peer lives in.
    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Whether the peer is in a different zone than this node.
    pub fn is_other_zone(&self) -> bool {
        self.other_zone
    }

    /// Current liveness label.
    pub fn status(&self) -> NodeStatus {
        self.status
    }

    /// Update the liveness label.
    pub fn set_status(&mut self, status: NodeStatus) {
        self.status = status;
    }

    /// Forward a registration, timestamps and metadata included.
    pub async fn register(&self, ins: &Instance) -> Result<()> {
        let result = self.call(Action::Register, ins, &self.register_url).await;
        if let Err(err) = &result {
            warn!(
                "peer({}) register appid({}) hostname({}) error({})",
                self.addr, ins.app_id, ins.hostname, err
            );
        }
        result
    }

    /// Forward a heartbeat, carrying the origin's `dirty_timestamp`.
    /// When the peer answers `NothingFound` it has no record of the
    /// instance and the caller is expected to fall back to
    /// [`register`](Self::register).
    pub async fn renew(&self, ins: &Instance) -> Result<()> {
        self.call(Action::Renew, ins, &self.renew_url).await
    }

    /// Forward a cancellation, carrying the origin's `latest_timestamp`.
    pub async fn cancel(&self, ins: &Instance) -> Result<()> {
        let result = self.call(Action::Cancel, ins, &self.cancel_url).await;
        if let Err(err) = &result {
            warn!(
                "peer({}) cancel appid({}) hostname({}) error({})",
                self.addr, ins.app_id, ins.hostname, err
            );
        }
        result
    }

    /// Forward a status/metadata override.
    pub async fn set(&self, ins: &Instance) -> Result<()> {
        let result = self.call(Action::Set, ins, &self.set_url).await;
        if let Err(err) = &result {
            warn!(
                "peer({}) set appid({}) hostname({}) error({})",
                self.addr, ins.app_id, ins.hostname, err
            );
        }
        result
    }

    fn params(&self, action: Action, ins: &Instance) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("zone", ins.zone.clone()),
            ("env", ins.env.clone()),
            ("appid", ins.app_id.clone()),
            ("hostname", ins.hostname.clone()),
            // a peer in another zone stores the mutation but must not
            // replicate it onward
            ("replication", (!self.other_zone).to_string()),
        ];
        match action {
            Action::Register => {
                params.push(("addrs", ins.addrs.join(",")));
                params.push(("status", ins.status.as_wire().to_string()));
                params.push(("color", ins.color.clone()));
                params.push(("version", ins.version.clone()));
                let metadata = serde_json::to_string(&ins.metadata).unwrap_or_default();
                params.push(("metadata", metadata));
                params.push(("reg_timestamp", ins.reg_timestamp.to_string()));
                params.push(("dirty_timestamp", ins.dirty_timestamp.to_string()));
                params.push(("latest_timestamp", ins.latest_timestamp.to_string()));
            }
            Action::Renew => {
                params.push(("dirty_timestamp", ins.dirty_timestamp.to_string()));
            }
            Action::Cancel => {
                params.push(("latest_timestamp", ins.latest_timestamp.to_string()));
            }
            Action::Set => {
                params.push(("status", ins.status.as_wire().to_string()));
                let metadata = serde_json::to_string(&ins.metadata).unwrap_or_default();
                params.push(("metadata", metadata));
                params.push(("latest_timestamp", ins.latest_timestamp.to_string()));
            }
        }
        params
    }

    async fn call(&self, action: Action, ins: &Instance, url: &str) -> Result<()> {
        let params = self.params(action, ins);
        let reply = match self
            .client
            .post_form::<serde_json::Value>(url, &params)
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                error!(
                    "peer({}) call({}) appid({}) error({})",
                    self.addr, url, ins.app_id, err
                );
                counter!("discovery_replication_failures", 1);
                return Err(err);
            }
        };
        match Code(reply.code) {
            Code::OK => Ok(()),
            Code::CONFLICT => {
                // the reply carries the record that won; surface it so the
                // caller can overwrite its own copy (decode is best-effort,
                // an unreadable body degrades to the bare conflict)
                let winning = reply
                    .data
                    .and_then(|data| serde_json::from_value::<Instance>(data).ok())
                    .map(Box::new);
                Err(Error::Conflict(winning))
            }
            code => {
                error!(
                    "peer({}) call({}) appid({}) reply code({})",
                    self.addr, url, ins.app_id, code
                );
                counter!("discovery_replication_failures", 1);
                Err(Error::Code(code))
            }
        }
    }
}
