//! Wire model shared by the resolver client and the peer replication fan-out

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Instances grouped by zone, the unit a watcher fetches.
pub type InstancesByZone = HashMap<String, Vec<Instance>>;

/// Liveness of a registered instance. `1`/`2`/`3` on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum Status {
    /// The instance is serving.
    #[default]
    Up,
    /// The instance asked to be taken out of rotation.
    Down,
    /// The instance stopped renewing and is presumed gone.
    Lost,
}

impl Status {
    /// The integer the wire protocol uses for this status.
    pub fn as_wire(self) -> u32 {
        self.into()
    }
}

impl From<Status> for u32 {
    fn from(status: Status) -> u32 {
        match status {
            Status::Up => 1,
            Status::Down => 2,
            Status::Lost => 3,
        }
    }
}

impl TryFrom<u32> for Status {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Status::Up),
            2 => Ok(Status::Down),
            3 => Ok(Status::Lost),
            other => Err(format!("unknown instance status {other}")),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Up => write!(f, "up"),
            Status::Down => write!(f, "down"),
            Status::Lost => write!(f, "lost"),
        }
    }
}

/// A registered process: one appid instance on one host in one zone.
///
/// The three timestamps are Unix seconds and order the instance's history:
/// `reg_timestamp` (first registered) never exceeds `dirty_timestamp` (last
/// mutation at the source replica), which never exceeds `latest_timestamp`
/// (newest observation across replicas).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Deployment locality the instance runs in.
    #[serde(default)]
    pub zone: String,
    /// Logical environment (prod, test, ...) scoping the registration.
    #[serde(default)]
    pub env: String,
    /// Logical service name, the discovery key.
    #[serde(rename = "appid")]
    pub app_id: String,
    /// Host the instance runs on.
    #[serde(default)]
    pub hostname: String,
    /// Scheme-prefixed endpoint URIs (`http://...`, `grpc://...`).
    #[serde(default)]
    pub addrs: Vec<String>,
    /// Routing tag for canary/traffic splitting.
    #[serde(default)]
    pub color: String,
    /// Build or release version label.
    #[serde(default)]
    pub version: String,
    /// Free-form key/value attributes.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Current liveness.
    #[serde(default)]
    pub status: Status,
    /// When the instance was first registered (Unix seconds).
    #[serde(default)]
    pub reg_timestamp: i64,
    /// Last mutation at the source replica (Unix seconds).
    #[serde(default)]
    pub dirty_timestamp: i64,
    /// Newest observation across replicas (Unix seconds).
    #[serde(default)]
    pub latest_timestamp: i64,
}

impl Instance {
    /// Create an Up instance for `app_id` with everything else defaulted.
    pub fn new<S: Into<String>>(app_id: S) -> Self {
        Self {
            app_id: app_id.into(),
            status: Status::Up,
            ..Default::default()
        }
    }

    /// Set the zone.
    pub fn with_zone<S: Into<String>>(mut self, zone: S) -> Self {
        self.zone = zone.into();
        self
    }

    /// Set the environment.
    pub fn with_env<S: Into<String>>(mut self, env: S) -> Self {
        self.env = env.into();
        self
    }

    /// Set the hostname.
    pub fn with_hostname<S: Into<String>>(mut self, hostname: S) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Append one endpoint URI.
    pub fn with_addr<S: Into<String>>(mut self, addr: S) -> Self {
        self.addrs.push(addr.into());
        self
    }

    /// Replace the endpoint URIs.
    pub fn with_addrs<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addrs = addrs.into_iter().map(|a| a.into()).collect();
        self
    }

    /// Set the routing color.
    pub fn with_color<S: Into<String>>(mut self, color: S) -> Self {
        self.color = color.into();
        self
    }

    /// Set the version label.
    pub fn with_version<S: Into<String>>(mut self, version: S) -> Self {
        self.version = version.into();
        self
    }

    /// Insert one metadata entry.
    pub fn with_metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the liveness status.
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Set the whole timestamp triple.
    pub fn with_timestamps(mut self, reg: i64, dirty: i64, latest: i64) -> Self {
        self.reg_timestamp = reg;
        self.dirty_timestamp = dirty;
        self.latest_timestamp = latest;
        self
    }

    /// Whether the timestamp triple is consistently ordered
    /// (`reg <= dirty <= latest`, equality allowed).
    pub fn has_ordered_timestamps(&self) -> bool {
        self.reg_timestamp <= self.dirty_timestamp
            && self.dirty_timestamp <= self.latest_timestamp
    }
}

/// One app's payload in a poll reply: instances partitioned by zone plus the
/// newest mutation timestamp across all of them.
///
/// A successful reply always carries `last_ts > 0`; zero marks a broken
/// server and is rejected by the poll path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppData {
    /// Instances grouped by zone.
    #[serde(default)]
    pub zone_instances: InstancesByZone,
    /// Newest mutation timestamp across every zone of the app.
    #[serde(rename = "latest_timestamp")]
    pub last_ts: i64,
}

/// Address record returned by `/discovery/nodes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// `host:port` of a discovery node.
    pub addr: String,
}

/// Liveness of a peer discovery node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// The peer answers replication calls.
    Up,
    /// The peer is unreachable; a new node starts here until proven alive.
    #[default]
    Lost,
}
