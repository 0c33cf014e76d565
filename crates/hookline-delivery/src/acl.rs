//! Destination deny-list for outbound deliveries.
//!
//! Endpoint URLs are tenant input, so the deliverer refuses to connect to
//! addresses inside the worker's own network unless told otherwise. Rules are
//! IP addresses, CIDR blocks, host names (optionally `*.`-prefixed) or one of
//! the named presets:
//!
//! | preset       | ranges                                                   |
//! |--------------|----------------------------------------------------------|
//! | `@private`   | 10/8, 172.16/12, 192.168/16                              |
//! | `@loopback`  | 127/8, ::1                                               |
//! | `@linklocal` | 169.254/16, fe80::/10                                    |
//! | `@reserved`  | 0/8, 100.64/10, 192.0.0/24, 224/4, 240/4, fc00::/7       |
//! | `@default`   | all of the above                                         |
//!
//! Host names are resolved through [`DenyListResolver`], which drops denied
//! addresses before reqwest connects. Literal IP hosts never reach a resolver
//! and are checked with [`DenyList::check_url`].

use std::{
    net::{IpAddr, SocketAddr},
    str::FromStr,
    sync::Arc,
};

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use thiserror::Error;

use crate::error::{DeliveryError, Result};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Rules denied when none are configured.
pub const DEFAULT_DENY: &str = "@default";

const PRIVATE: &[&str] = &["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];
const LOOPBACK: &[&str] = &["127.0.0.0/8", "::1/128"];
const LINK_LOCAL: &[&str] = &["169.254.0.0/16", "fe80::/10"];
const RESERVED: &[&str] =
    &["0.0.0.0/8", "100.64.0.0/10", "192.0.0.0/24", "224.0.0.0/4", "240.0.0.0/4", "fc00::/7"];
const DEFAULT: &[&str] = &["@private", "@loopback", "@linklocal", "@reserved"];

fn preset(name: &str) -> Option<&'static [&'static str]> {
    match name {
        "@private" => Some(PRIVATE),
        "@loopback" => Some(LOOPBACK),
        "@linklocal" => Some(LINK_LOCAL),
        "@reserved" => Some(RESERVED),
        "@default" => Some(DEFAULT),
        _ => None,
    }
}

/// An address block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpBlock {
    network: IpAddr,
    prefix: u8,
}

impl IpBlock {
    /// Returns true if `addr` is inside the block.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(addr) & mask
            },
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(addr) & mask
            },
            _ => false,
        }
    }
}

impl FromStr for IpBlock {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || DeliveryError::configuration(format!("invalid CIDR block '{s}'"));
        let (network, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let network: IpAddr = network.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { network, prefix })
    }
}

/// Parsed deny rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DenyList {
    addrs: Vec<IpAddr>,
    blocks: Vec<IpBlock>,
    domains: Vec<String>,
}

impl DenyList {
    /// Parses rules, expanding presets.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a malformed CIDR block or host
    /// pattern.
    pub fn parse<S: AsRef<str>>(rules: &[S]) -> Result<Self> {
        let mut list = Self::default();
        for rule in rules {
            list.add(rule.as_ref().trim())?;
        }
        Ok(list)
    }

    fn add(&mut self, rule: &str) -> Result<()> {
        if let Some(expanded) = preset(rule) {
            for rule in expanded {
                self.add(rule)?;
            }
            return Ok(());
        }
        if let Ok(addr) = rule.parse::<IpAddr>() {
            self.addrs.push(addr);
            return Ok(());
        }
        if rule.contains('/') {
            self.blocks.push(rule.parse()?);
            return Ok(());
        }
        if !is_host_pattern(rule) {
            return Err(DeliveryError::configuration(format!("invalid deny rule '{rule}'")));
        }
        self.domains.push(rule.to_ascii_lowercase());
        Ok(())
    }

    /// Returns true when no rule is configured.
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty() && self.blocks.is_empty() && self.domains.is_empty()
    }

    /// Returns true if connecting to `addr` for `host` is permitted.
    pub fn allows(&self, host: &str, addr: IpAddr) -> bool {
        let addr = unmap(addr);
        if self.addrs.contains(&addr) || self.blocks.iter().any(|b| b.contains(addr)) {
            return false;
        }
        !self.denies_host(host)
    }

    /// Returns true if `host` matches a host rule.
    pub fn denies_host(&self, host: &str) -> bool {
        if host.is_empty() {
            return false;
        }
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.domains.iter().any(|pattern| match pattern.strip_prefix('*') {
            Some(suffix) => host.ends_with(suffix),
            None => *pattern == host,
        })
    }

    /// Checks a URL before it is handed to the client: literal IP hosts and
    /// denied host names are rejected here.
    ///
    /// # Errors
    ///
    /// Returns [`DestinationDenied`] if the URL's host is denied.
    pub fn check_url(&self, url: &reqwest::Url) -> std::result::Result<(), DestinationDenied> {
        let Some(host) = url.host_str() else {
            return Ok(());
        };
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        let denied = match literal.parse::<IpAddr>() {
            Ok(addr) => !self.allows("", addr),
            Err(_) => self.denies_host(host),
        };
        if denied {
            return Err(DestinationDenied { host: host.to_string() });
        }
        Ok(())
    }
}

fn unmap(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(addr, IpAddr::V4),
        IpAddr::V4(_) => addr,
    }
}

fn is_host_pattern(rule: &str) -> bool {
    let host = rule.strip_prefix("*.").unwrap_or(rule);
    !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// A connection refused by the deny-list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("request to {host} is denied")]
pub struct DestinationDenied {
    /// Host the request targeted.
    pub host: String,
}

/// DNS resolver that removes denied addresses from lookups.
#[derive(Debug, Clone)]
pub struct DenyListResolver {
    deny: Arc<DenyList>,
}

impl DenyListResolver {
    /// Wraps the system resolver.
    pub fn new(deny: Arc<DenyList>) -> Self {
        Self { deny }
    }
}

impl Resolve for DenyListResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let deny = self.deny.clone();
        Box::pin(async move {
            let host = name.as_str().to_string();
            let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
                .await
                .map_err(|e| -> BoxError { Box::new(e) })?
                .collect();
            let allowed: Vec<SocketAddr> =
                resolved.into_iter().filter(|addr| deny.allows(&host, addr.ip())).collect();
            if allowed.is_empty() {
                return Err::<Addrs, BoxError>(Box::new(DestinationDenied { host }));
            }
            let addrs: Addrs = Box::new(allowed.into_iter());
            Ok(addrs)
        })
    }
}
