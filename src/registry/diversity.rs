//! Diversity / Sybil Guard
//!
//! Population-level limits on connected peers per subnet, ASN and country,
//! plus diversity-aware peer selection. Caps only gate new connections;
//! peers already connected are never evicted by this guard.

use ipnet::IpNet;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::config::DiversityConfig;
use crate::types::{NetworkMeta, PeerId, PeerRecord};

/// Country bucket for peers without geo data
const UNKNOWN_COUNTRY: &str = "unknown";

/// ASN and country for an address
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkInfo {
    pub asn: Option<u32>,
    pub country: Option<String>,
}

/// Source of ASN / geo data for addresses
pub trait NetworkInfoResolver: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> NetworkInfo;
}

/// Resolver that knows nothing; callers can still pass ASN/country in events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopResolver;

impl NetworkInfoResolver for NoopResolver {
    fn resolve(&self, _ip: IpAddr) -> NetworkInfo {
        NetworkInfo::default()
    }
}

/// Which cap a connection would exceed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiversityViolation {
    Subnet(IpNet),
    Asn(u32),
    Country(String),
}

impl fmt::Display for DiversityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiversityViolation::Subnet(net) => write!(f, "too many peers from subnet {}", net),
            DiversityViolation::Asn(asn) => write!(f, "too many peers from AS{}", asn),
            DiversityViolation::Country(c) => write!(f, "too many peers from country {}", c),
        }
    }
}

/// Largest shares of the connected population
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Concentration {
    pub connected: usize,
    pub top_subnet: Option<(String, f64)>,
    pub top_asn: Option<(u32, f64)>,
    pub top_country: Option<(String, f64)>,
}

#[derive(Default)]
struct GuardState {
    members: HashMap<PeerId, NetworkMeta>,
    subnets: HashMap<IpNet, usize>,
    asns: HashMap<u32, usize>,
    countries: HashMap<String, usize>,
}

impl GuardState {
    fn add(&mut self, meta: &NetworkMeta) {
        if let Some(subnet) = meta.subnet {
            *self.subnets.entry(subnet).or_insert(0) += 1;
        }
        if let Some(asn) = meta.asn {
            *self.asns.entry(asn).or_insert(0) += 1;
        }
        if let Some(country) = &meta.country {
            *self.countries.entry(country.clone()).or_insert(0) += 1;
        }
    }

    fn remove(&mut self, meta: &NetworkMeta) {
        if let Some(subnet) = meta.subnet {
            decrement(&mut self.subnets, &subnet);
        }
        if let Some(asn) = meta.asn {
            decrement(&mut self.asns, &asn);
        }
        if let Some(country) = &meta.country {
            decrement(&mut self.countries, country);
        }
    }
}

fn decrement<K: std::hash::Hash + Eq>(map: &mut HashMap<K, usize>, key: &K) {
    if let Some(count) = map.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            map.remove(key);
        }
    }
}

/// Connection diversity limits
pub struct DiversityGuard {
    config: DiversityConfig,
    state: Mutex<GuardState>,
}

impl DiversityGuard {
    pub fn new(config: DiversityConfig) -> Self {
        Self {
            config,
            state: Mutex::new(GuardState::default()),
        }
    }

    /// Build network metadata from an address and optional caller hints
    pub fn meta_for(
        &self,
        address: &str,
        resolver: &dyn NetworkInfoResolver,
        asn: Option<u32>,
        country: Option<String>,
    ) -> Option<NetworkMeta> {
        let ip = parse_ip(address)?;
        let resolved = resolver.resolve(ip);
        Some(NetworkMeta {
            ip: Some(ip),
            subnet: self.subnet_of(ip),
            asn: asn.or(resolved.asn),
            country: country.or(resolved.country).map(|c| c.to_ascii_uppercase()),
        })
    }

    /// Grouping prefix for an address (/24 for IPv4, /48 for IPv6 by default)
    pub fn subnet_of(&self, ip: IpAddr) -> Option<IpNet> {
        let prefix = match ip {
            IpAddr::V4(_) => self.config.ipv4_prefix,
            IpAddr::V6(_) => self.config.ipv6_prefix,
        };
        IpNet::new(ip, prefix).ok().map(|net| net.trunc())
    }

    /// Check whether a new connection fits under every cap
    pub fn check(&self, peer_id: &PeerId, meta: &NetworkMeta) -> Result<(), DiversityViolation> {
        let state = self.state.lock();
        if state.members.contains_key(peer_id) {
            return Ok(());
        }

        if let Some(subnet) = meta.subnet {
            if state.subnets.get(&subnet).copied().unwrap_or(0) >= self.config.max_peers_per_subnet {
                return Err(DiversityViolation::Subnet(subnet));
            }
        }
        if let Some(asn) = meta.asn {
            if state.asns.get(&asn).copied().unwrap_or(0) >= self.config.max_peers_per_asn {
                return Err(DiversityViolation::Asn(asn));
            }
        }
        if let Some(country) = &meta.country {
            if state.countries.get(country).copied().unwrap_or(0) >= self.config.max_peers_per_country {
                return Err(DiversityViolation::Country(country.clone()));
            }
        }
        Ok(())
    }

    /// Count a connected peer; re-registering replaces its previous placement
    pub fn register(&self, peer_id: &PeerId, meta: NetworkMeta) {
        let mut state = self.state.lock();
        if let Some(previous) = state.members.remove(peer_id) {
            state.remove(&previous);
        }
        state.add(&meta);
        state.members.insert(peer_id.clone(), meta);
    }

    pub fn unregister(&self, peer_id: &PeerId) -> bool {
        let mut state = self.state.lock();
        match state.members.remove(peer_id) {
            Some(meta) => {
                state.remove(&meta);
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, peer_id: &PeerId) -> bool {
        self.state.lock().members.contains_key(peer_id)
    }

    pub fn connected_count(&self) -> usize {
        self.state.lock().members.len()
    }

    pub fn subnet_count(&self, subnet: &IpNet) -> usize {
        self.state.lock().subnets.get(subnet).copied().unwrap_or(0)
    }

    /// Largest subnet, ASN and country shares among connected peers
    pub fn concentration(&self) -> Concentration {
        let state = self.state.lock();
        let total = state.members.len();
        if total == 0 {
            return Concentration::default();
        }
        let share = |count: usize| count as f64 / total as f64;

        Concentration {
            connected: total,
            top_subnet: state
                .subnets
                .iter()
                .max_by_key(|(_, c)| **c)
                .map(|(net, c)| (net.to_string(), share(*c))),
            top_asn: state
                .asns
                .iter()
                .max_by_key(|(_, c)| **c)
                .map(|(asn, c)| (*asn, share(*c))),
            top_country: state
                .countries
                .iter()
                .max_by_key(|(_, c)| **c)
                .map(|(country, c)| (country.clone(), share(*c))),
        }
    }
}

/// Pick up to `n` peers, spreading across subnets and countries
///
/// First pass takes the best peer of each unseen subnet while keeping every
/// country under `ceil(n / countries)`; second pass backfills by score.
pub fn select_diverse(mut candidates: Vec<PeerRecord>, n: usize) -> Vec<PeerRecord> {
    if n == 0 || candidates.is_empty() {
        return vec![];
    }

    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let country_of = |p: &PeerRecord| {
        p.network
            .country
            .clone()
            .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string())
    };

    let distinct_countries = candidates
        .iter()
        .map(country_of)
        .collect::<HashSet<_>>()
        .len()
        .max(1);
    let per_country = n.div_ceil(distinct_countries);

    let mut selected = vec![false; candidates.len()];
    let mut picked = 0;
    let mut subnets_seen: HashSet<IpNet> = HashSet::new();
    let mut per_country_count: HashMap<String, usize> = HashMap::new();

    // First pass: one per subnet, country quota
    for (i, peer) in candidates.iter().enumerate() {
        if picked >= n {
            break;
        }
        if let Some(subnet) = peer.network.subnet {
            if subnets_seen.contains(&subnet) {
                continue;
            }
        }
        let country = country_of(peer);
        let count = per_country_count.entry(country).or_insert(0);
        if *count >= per_country {
            continue;
        }

        *count += 1;
        if let Some(subnet) = peer.network.subnet {
            subnets_seen.insert(subnet);
        }
        selected[i] = true;
        picked += 1;
    }

    // Second pass: fill remaining slots with highest scoring
    for flag in selected.iter_mut() {
        if picked >= n {
            break;
        }
        if !*flag {
            *flag = true;
            picked += 1;
        }
    }

    // Preserve score order in the result
    candidates
        .into_iter()
        .zip(selected)
        .filter_map(|(peer, keep)| keep.then_some(peer))
        .collect()
}

/// Extract the IP from `ip`, `ip:port`, `[v6]:port` or `/ip4/../tcp/..` forms
pub fn parse_ip(address: &str) -> Option<IpAddr> {
    let address = address.trim();
    if address.is_empty() {
        return None;
    }

    if address.starts_with('/') {
        let mut parts = address.split('/').filter(|s| !s.is_empty());
        while let Some(proto) = parts.next() {
            if matches!(proto, "ip4" | "ip6") {
                return parts.next().and_then(|ip| ip.parse().ok());
            }
        }
        return None;
    }

    if let Ok(socket) = address.parse::<SocketAddr>() {
        return Some(socket.ip());
    }

    address
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()
}
