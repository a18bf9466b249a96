// src/proxy/endpoint.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub u64);

impl TenantId {
    /// Resolves to any healthy endpoint without creating a binding.
    pub const SENTINEL: TenantId = TenantId(0);

    pub fn is_sentinel(self) -> bool {
        self == Self::SENTINEL
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxyId(pub u64);

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Http,
    Https,
    Socks5,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
            ProxyScheme::Socks5 => "socks5",
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAddress {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl ProxyAddress {
    /// Cache key for transport handles: scheme, credentials, host and port.
    pub fn signature(&self) -> String {
        match &self.credentials {
            Some(c) => format!(
                "{}://{}:{}@{}:{}",
                self.scheme.as_str(),
                c.username,
                c.password,
                self.host,
                self.port
            ),
            None => format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port),
        }
    }

    /// `host:port`, safe to log.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn to_url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&format!("{}://{}", self.scheme.as_str(), self.authority()))?;
        if let Some(c) = &self.credentials {
            // set_username/set_password only fail for cannot-be-a-base URLs
            let _ = url.set_username(&c.username);
            let _ = url.set_password(Some(&c.password));
        }
        Ok(url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityClass {
    Exclusive,
    Shared,
}

impl CapacityClass {
    pub fn limit(&self, shared_capacity: usize) -> usize {
        match self {
            CapacityClass::Exclusive => 1,
            CapacityClass::Shared => shared_capacity,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityClass::Exclusive => "exclusive",
            CapacityClass::Shared => "shared",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyStatus {
    Healthy,
    Suspect,
    Condemned,
}

impl ProxyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::Healthy => "healthy",
            ProxyStatus::Suspect => "suspect",
            ProxyStatus::Condemned => "condemned",
        }
    }

    /// Applies one probe outcome and returns the new status and failure streak.
    ///
    /// The first failure moves an endpoint to `Suspect`; `condemn_after` further
    /// failures condemn it. Any success restores `Healthy` and resets the streak.
    /// `Condemned` never changes here.
    pub fn after_probe(self, streak: u32, success: bool, condemn_after: u32) -> (ProxyStatus, u32) {
        if self == ProxyStatus::Condemned {
            return (self, streak);
        }
        if success {
            return (ProxyStatus::Healthy, 0);
        }

        let streak = streak.saturating_add(1);
        if streak > condemn_after {
            (ProxyStatus::Condemned, streak)
        } else {
            (ProxyStatus::Suspect, streak)
        }
    }
}

/// Point-in-time view of an endpoint as held by a store.
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    pub id: ProxyId,
    pub address: ProxyAddress,
    pub region: Option<String>,
    pub capacity: CapacityClass,
    pub capacity_limit: usize,
    pub status: ProxyStatus,
    pub consecutive_failures: u32,
    pub active: bool,
    pub bound_tenants: usize,
    pub last_assigned_at: Option<DateTime<Utc>>,
    pub last_probed_at: Option<DateTime<Utc>>,
}

impl ProxyEndpoint {
    pub fn spare_capacity(&self) -> usize {
        self.capacity_limit.saturating_sub(self.bound_tenants)
    }

    pub fn is_allocatable(&self) -> bool {
        self.active && self.status == ProxyStatus::Healthy && self.spare_capacity() > 0
    }

    pub fn signature(&self) -> String {
        self.address.signature()
    }
}
