//! Service instances and per-service instance counts.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{Record, ServiceKey, Timestamp};

/// Metadata key holding the last heartbeat as unix seconds.
pub const METADATA_LAST_HEARTBEAT: &str = "internal-lastheartbeat";
/// Metadata key set on instances served under zero protection.
pub const METADATA_ZERO_PROTECTED: &str = "internal-zero-protected";
/// Derived metadata key for the instance version.
pub const METADATA_VERSION: &str = "internal-version";
/// Derived metadata key for the instance protocol.
pub const METADATA_PROTOCOL: &str = "internal-protocol";
/// Derived metadata key for the region.
pub const METADATA_REGION: &str = "internal-region";
/// Derived metadata key for the zone.
pub const METADATA_ZONE: &str = "internal-zone";
/// Derived metadata key for the campus.
pub const METADATA_CAMPUS: &str = "internal-campus";

/// Heartbeat TTL applied when an instance does not declare one.
pub const DEFAULT_HEARTBEAT_TTL_SECS: u32 = 5;

/// Physical placement of an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Region, e.g. `eu-west`.
    #[serde(default)]
    pub region: String,
    /// Zone within the region.
    #[serde(default)]
    pub zone: String,
    /// Campus within the zone.
    #[serde(default)]
    pub campus: String,
}

/// One registered instance of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Unique, stable identifier.
    pub id: String,
    /// Owning service id. Normally immutable.
    pub service_id: String,
    /// Owning service name and namespace.
    pub service: ServiceKey,
    /// Host address.
    pub host: String,
    /// Port.
    pub port: u32,
    /// Protocol served on the port.
    #[serde(default)]
    pub protocol: String,
    /// Version label.
    #[serde(default)]
    pub version: String,
    /// Load-balancing weight.
    pub weight: u32,
    /// Authoritative health flag.
    pub healthy: bool,
    /// Isolated instances receive no traffic.
    #[serde(default)]
    pub isolate: bool,
    /// Heartbeat TTL in seconds, zero for the default.
    #[serde(default)]
    pub ttl_secs: u32,
    /// Placement.
    #[serde(default)]
    pub location: Location,
    /// User and internal metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Version assigned at write time.
    pub revision: String,
    /// Last modification time.
    pub modify_time: Timestamp,
    /// Soft-delete flag.
    pub valid: bool,
}

impl Instance {
    /// Create a healthy instance with weight 100.
    pub fn new(
        id: impl Into<String>,
        service_id: impl Into<String>,
        service: ServiceKey,
        host: impl Into<String>,
        port: u32,
    ) -> Self {
        let id = id.into();
        Self {
            revision: format!("{id}-0"),
            id,
            service_id: service_id.into(),
            service,
            host: host.into(),
            port,
            protocol: String::new(),
            version: String::new(),
            weight: 100,
            healthy: true,
            isolate: false,
            ttl_secs: 0,
            location: Location::default(),
            metadata: HashMap::new(),
            modify_time: Utc::now(),
            valid: true,
        }
    }

    /// Heartbeat TTL, falling back to [`DEFAULT_HEARTBEAT_TTL_SECS`].
    #[must_use]
    pub fn ttl(&self) -> u32 {
        if self.ttl_secs == 0 {
            DEFAULT_HEARTBEAT_TTL_SECS
        } else {
            self.ttl_secs
        }
    }

    /// Last heartbeat in unix seconds, if recorded and well-formed.
    #[must_use]
    pub fn last_heartbeat(&self) -> Option<i64> {
        self.metadata
            .get(METADATA_LAST_HEARTBEAT)
            .and_then(|v| v.parse().ok())
    }

    /// Whether this entry is a zero-protection view.
    #[must_use]
    pub fn is_zero_protected(&self) -> bool {
        self.metadata
            .get(METADATA_ZERO_PROTECTED)
            .is_some_and(|v| v == "true")
    }
}

impl Record for Instance {
    fn id(&self) -> &str {
        &self.id
    }

    fn revision(&self) -> &str {
        &self.revision
    }

    fn modify_time(&self) -> Timestamp {
        self.modify_time
    }

    fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Counts for one version of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionCount {
    /// All instances of the version.
    pub total: u32,
    /// Healthy instances of the version.
    pub healthy: u32,
    /// Isolated instances of the version.
    pub isolate: u32,
}

/// Per-service instance aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceCount {
    /// All instances.
    pub total: u32,
    /// Healthy instances.
    pub healthy: u32,
    /// Isolated instances.
    pub isolate: u32,
    /// Breakdown by version label.
    pub versions: BTreeMap<String, VersionCount>,
}

impl InstanceCount {
    /// Aggregate a set of instances.
    pub fn from_instances<'a>(instances: impl IntoIterator<Item = &'a Instance>) -> Self {
        let mut count = Self::default();
        for instance in instances {
            let version = count.versions.entry(instance.version.clone()).or_default();
            count.total += 1;
            version.total += 1;
            if instance.healthy {
                count.healthy += 1;
                version.healthy += 1;
            }
            if instance.isolate {
                count.isolate += 1;
                version.isolate += 1;
            }
        }
        count
    }
}
