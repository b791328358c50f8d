//! Target host parsing, resolution, and node assignment.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use anyhow::Context;
use async_trait::async_trait;
use benchrig_core::{Config, Error as CoreError, Result as CoreResult};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::actors::ActorError;

/// Port used when a host entry does not name one.
pub const DEFAULT_PORT: u16 = 9200;

/// One entry of `client.hosts` as the user wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// Options beyond host and port. Not supported for managed clusters.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl HostSpec {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
            extra: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Parse `host`, `host:port` or `[v6-address]:port`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHostSpec` for an empty host or a malformed port.
    pub fn parse(spec: &str) -> CoreResult<Self> {
        let trimmed = spec.trim();
        let (host, port) = if let Some(rest) = trimmed.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| CoreError::invalid_host_spec(spec, "unterminated '['"))?;
            let port = match after.strip_prefix(':') {
                Some(port) => Some(port),
                None if after.is_empty() => None,
                None => {
                    return Err(CoreError::invalid_host_spec(
                        spec,
                        "unexpected characters after ']'",
                    ));
                }
            };
            (host, port)
        } else if trimmed.parse::<IpAddr>().is_ok() {
            (trimmed, None)
        } else {
            match trimmed.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (trimmed, None),
            }
        };

        if host.is_empty() {
            return Err(CoreError::invalid_host_spec(spec, "host is empty"));
        }
        let port = port
            .map(|p| {
                p.parse::<u16>()
                    .map_err(|e| CoreError::invalid_host_spec(spec, format!("invalid port: {e}")))
            })
            .transpose()?;

        Ok(Self {
            host: host.to_string(),
            port,
            extra: BTreeMap::new(),
        })
    }
}

/// Read `client.hosts`.
///
/// Entries may be `"host:port"` strings or objects with `host`, optional
/// `port`, and any further options. A missing key yields an empty list.
///
/// # Errors
///
/// Returns an error if the value is not a list or an entry is malformed.
pub fn hosts_from_config(config: &Config) -> CoreResult<Vec<HostSpec>> {
    let Some(value) = config.opt("client", "hosts") else {
        return Ok(Vec::new());
    };
    let Value::Array(entries) = value else {
        return Err(CoreError::invalid_config_value(
            "client",
            "hosts",
            "expected a list of hosts",
        ));
    };
    entries
        .iter()
        .map(|entry| match entry {
            Value::String(spec) => HostSpec::parse(spec),
            other => serde_json::from_value(other.clone()).map_err(|e| {
                CoreError::invalid_config_value("client", "hosts", e.to_string())
            }),
        })
        .collect()
}

/// A resolved `(ip, port)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostEndpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl HostEndpoint {
    #[must_use]
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Loopback endpoints are served by an in-process node builder; all
    /// others need the host to announce itself first.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.ip.is_loopback()
    }
}

impl fmt::Display for HostEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::new(self.ip, self.port))
    }
}

/// Turns host names into addresses.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> anyhow::Result<IpAddr>;
}

/// Resolver backed by the system's name service. Prefers IPv4.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> anyhow::Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, 0))
            .await
            .with_context(|| format!("could not resolve [{host}]"))?
            .collect();
        addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addrs.first())
            .map(SocketAddr::ip)
            .with_context(|| format!("[{host}] resolved to no addresses"))
    }
}

/// Resolve host entries into endpoints, preserving order and duplicates.
///
/// # Errors
///
/// Returns `SystemSetup` if an entry carries options other than host and
/// port, or if a host cannot be resolved.
pub async fn to_ip_port(
    hosts: &[HostSpec],
    resolver: &dyn HostResolver,
) -> Result<Vec<HostEndpoint>, ActorError> {
    let mut endpoints = Vec::with_capacity(hosts.len());
    for spec in hosts {
        if !spec.extra.is_empty() {
            return Err(ActorError::system_setup(
                "When specifying nodes to be managed by benchrig you can only supply hostname:port \
                 pairs (e.g. 'localhost:9200'), any additional options cannot be supported.",
            ));
        }
        let ip = resolver
            .resolve(&spec.host)
            .await
            .map_err(|e| ActorError::system_setup(format!("{e:#}")))?;
        endpoints.push(HostEndpoint::new(ip, spec.port.unwrap_or(DEFAULT_PORT)));
    }
    debug!(endpoints = ?endpoints, "Resolved target hosts");
    Ok(endpoints)
}

/// Node ids per distinct endpoint, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeAssignment {
    hosts: Vec<(HostEndpoint, Vec<u32>)>,
}

impl NodeAssignment {
    pub fn iter(&self) -> impl Iterator<Item = (&HostEndpoint, &[u32])> {
        self.hosts.iter().map(|(ep, ids)| (ep, ids.as_slice()))
    }

    /// Number of distinct endpoints, i.e. node builders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    #[must_use]
    pub fn node_ids(&self, endpoint: &HostEndpoint) -> Option<&[u32]> {
        self.hosts
            .iter()
            .find(|(ep, _)| ep == endpoint)
            .map(|(_, ids)| ids.as_slice())
    }

    /// Distinct addresses of all hosts.
    #[must_use]
    pub fn all_node_ips(&self) -> Vec<IpAddr> {
        self.hosts.iter().map(|(ep, _)| ep.ip).unique().collect()
    }

    #[must_use]
    pub fn all_node_ids(&self) -> Vec<u32> {
        self.hosts
            .iter()
            .flat_map(|(_, ids)| ids.iter().copied())
            .sorted_unstable()
            .collect()
    }

    /// Split into `(local, remote)` entries.
    #[must_use]
    pub fn partition(&self) -> (Vec<(HostEndpoint, Vec<u32>)>, Vec<(HostEndpoint, Vec<u32>)>) {
        self.hosts
            .iter()
            .cloned()
            .partition(|(endpoint, _)| endpoint.is_local())
    }
}

/// Assign sequential node ids across the endpoint list.
///
/// Repeating an endpoint puts several nodes on that host.
#[must_use]
pub fn nodes_by_host(endpoints: &[HostEndpoint]) -> NodeAssignment {
    let mut hosts: Vec<(HostEndpoint, Vec<u32>)> = Vec::new();
    for (node_id, endpoint) in (0u32..).zip(endpoints) {
        match hosts.iter_mut().find(|(ep, _)| ep == endpoint) {
            Some((_, ids)) => ids.push(node_id),
            None => hosts.push((*endpoint, vec![node_id])),
        }
    }
    NodeAssignment { hosts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use benchrig_core::Scope;
    use std::net::Ipv4Addr;

    fn ep(a: u8, b: u8, c: u8, d: u8, port: u16) -> HostEndpoint {
        HostEndpoint::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port)
    }

    #[test]
    fn should_parse_host_and_port() {
        let spec = HostSpec::parse("10.0.0.1:9201");
        assert_eq!(spec.ok(), Some(HostSpec::new("10.0.0.1", 9201)));
    }

    #[test]
    fn should_leave_port_empty_when_absent() {
        let spec = HostSpec::parse("localhost");
        assert!(matches!(spec, Ok(HostSpec { port: None, .. })));
    }

    #[test]
    fn should_parse_bracketed_ipv6() {
        let spec = HostSpec::parse("[::1]:9200");
        assert_eq!(spec.ok(), Some(HostSpec::new("::1", 9200)));
        let bare = HostSpec::parse("::1");
        assert!(matches!(bare, Ok(HostSpec { port: None, .. })));
    }

    #[test]
    fn should_reject_bad_port() {
        assert!(HostSpec::parse("example.org:http").is_err());
        assert!(HostSpec::parse(":9200").is_err());
    }

    #[test]
    fn should_read_string_and_object_hosts_from_config() {
        let mut config = Config::new();
        config.add(
            Scope::Application,
            "client",
            "hosts",
            serde_json::json!(["127.0.0.1:9200", {"host": "10.0.0.2", "port": 9300, "ssl": true}]),
        );

        let hosts = hosts_from_config(&config);
        assert!(hosts.is_ok());
        if let Ok(hosts) = hosts {
            assert_eq!(hosts.len(), 2);
            assert_eq!(hosts[1].port, Some(9300));
            assert!(hosts[1].extra.contains_key("ssl"));
        }
    }

    #[tokio::test]
    async fn should_reject_extra_host_options() {
        let hosts = vec![HostSpec::new("127.0.0.1", 9200).with_option("ssl", true)];
        let result = to_ip_port(&hosts, &SystemResolver).await;
        assert!(matches!(result, Err(ActorError::SystemSetup(_))));
    }

    #[tokio::test]
    async fn should_apply_default_port() {
        let hosts = vec![HostSpec {
            host: "127.0.0.1".to_string(),
            port: None,
            extra: BTreeMap::new(),
        }];
        let result = to_ip_port(&hosts, &SystemResolver).await;
        assert_eq!(result.ok(), Some(vec![ep(127, 0, 0, 1, DEFAULT_PORT)]));
    }

    #[test]
    fn should_assign_sequential_node_ids_per_endpoint() {
        let endpoints = vec![
            ep(10, 0, 0, 1, 9200),
            ep(10, 0, 0, 2, 9200),
            ep(10, 0, 0, 1, 9200),
            ep(10, 0, 0, 1, 9201),
        ];
        let assignment = nodes_by_host(&endpoints);

        assert_eq!(assignment.len(), 3);
        assert_eq!(assignment.node_ids(&ep(10, 0, 0, 1, 9200)), Some(&[0, 2][..]));
        assert_eq!(assignment.node_ids(&ep(10, 0, 0, 2, 9200)), Some(&[1][..]));
        assert_eq!(assignment.node_ids(&ep(10, 0, 0, 1, 9201)), Some(&[3][..]));
        assert_eq!(assignment.all_node_ids(), vec![0, 1, 2, 3]);
        assert_eq!(assignment.all_node_ips().len(), 2);
    }

    #[test]
    fn should_partition_loopback_from_remote() {
        let assignment = nodes_by_host(&[ep(127, 0, 0, 1, 9200), ep(10, 0, 0, 5, 9200)]);
        let (local, remote) = assignment.partition();
        assert_eq!(local.len(), 1);
        assert_eq!(remote.len(), 1);
        assert!(local[0].0.is_local());
        assert!(!remote[0].0.is_local());
    }
}
