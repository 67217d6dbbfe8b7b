use crate::error::ClajsError;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Default abuse list source: GitHub's published meta ranges.
pub const GITHUB_META_URL: &str = "https://api.github.com/meta";

/// Keys of the meta document whose ranges get blocked.
const META_KEYS: &[&str] = &["actions"];

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// One blocked network: an address and a prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedNet {
    addr: IpAddr,
    prefix: u8,
}

impl BlockedNet {
    /// Check if an IP address is within this range.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (ip, self.addr) {
            (IpAddr::V4(ip), IpAddr::V4(net)) => {
                // prefix == 0 would overflow the shift
                let mask = if self.prefix == 0 {
                    0
                } else {
                    !((1u32 << (32 - self.prefix)) - 1)
                };
                (u32::from(ip) & mask) == (u32::from(net) & mask)
            }
            (IpAddr::V6(ip), IpAddr::V6(net)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    !((1u128 << (128 - self.prefix)) - 1)
                };
                (u128::from(ip) & mask) == (u128::from(net) & mask)
            }
            (IpAddr::V6(ip), IpAddr::V4(_)) => ip
                .to_ipv4_mapped()
                .is_some_and(|v4| self.contains(IpAddr::V4(v4))),
            (IpAddr::V4(_), IpAddr::V6(_)) => false,
        }
    }
}

impl FromStr for BlockedNet {
    type Err = ClajsError;

    /// Parses `a.b.c.d`, `a.b.c.d/n`, or the IPv6 equivalents.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClajsError::InvalidBlockEntry(s.to_string());
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let addr: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.trim().parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { addr, prefix })
    }
}

/// Refreshable set of blocked networks consulted when a socket connects.
///
/// Static entries come from configuration and never change; fetched entries
/// are replaced wholesale by each successful [`Blacklist::refresh`].
#[derive(Debug, Default)]
pub struct Blacklist {
    fixed: Vec<BlockedNet>,
    fetched: RwLock<Vec<BlockedNet>>,
}

impl Blacklist {
    /// Create a blacklist with the given static entries.
    #[must_use]
    pub fn new(fixed: Vec<BlockedNet>) -> Self {
        Self {
            fixed,
            fetched: RwLock::new(Vec::new()),
        }
    }

    /// Returns `true` if `ip` falls in any blocked network.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        if self.fixed.iter().any(|net| net.contains(ip)) {
            return true;
        }
        let fetched = self
            .fetched
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        fetched.iter().any(|net| net.contains(ip))
    }

    /// Replace the fetched entries.
    pub fn replace(&self, nets: Vec<BlockedNet>) {
        let mut fetched = self
            .fetched
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *fetched = nets;
    }

    /// Number of fetched entries.
    #[must_use]
    pub fn fetched_len(&self) -> usize {
        self.fetched
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Fetch the meta document at `url` and replace the fetched entries.
    ///
    /// Failure leaves the previous entries in place; the caller decides
    /// whether to log and carry on.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the document is malformed.
    pub async fn refresh(&self, url: &str) -> Result<usize, ClajsError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("clajs/", env!("CARGO_PKG_VERSION")))
            .timeout(FETCH_TIMEOUT)
            .build()?;
        let body: serde_json::Value = client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let nets = parse_meta(&body)?;
        let count = nets.len();
        self.replace(nets);
        Ok(count)
    }

    /// Refresh, logging the outcome instead of returning it.
    pub async fn refresh_logged(&self, url: &str) {
        match self.refresh(url).await {
            Ok(count) => tracing::info!(count, "added GitHub Actions ranges to blacklist"),
            Err(e) => tracing::error!("failed to refresh blacklist from {}: {}", url, e),
        }
    }

    /// Refresh from `url` every `every`, starting one period from now.
    pub fn spawn_refresh(
        self: Arc<Self>,
        url: String,
        every: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                ticker.tick().await;
                self.refresh_logged(&url).await;
            }
        })
    }
}

/// Extract blocked ranges from a GitHub meta document.
///
/// Entries that do not parse are skipped with a debug log.
///
/// # Errors
///
/// Returns an error if none of the expected keys hold an array.
pub fn parse_meta(body: &serde_json::Value) -> Result<Vec<BlockedNet>, ClajsError> {
    let mut nets = Vec::new();
    let mut found = false;
    for key in META_KEYS {
        let Some(ranges) = body.get(key).and_then(serde_json::Value::as_array) else {
            continue;
        };
        found = true;
        for range in ranges.iter().filter_map(serde_json::Value::as_str) {
            match range.parse() {
                Ok(net) => nets.push(net),
                Err(e) => tracing::debug!("skipping blacklist entry: {}", e),
            }
        }
    }
    if !found {
        return Err(ClajsError::BlacklistFormat("missing \"actions\" array"));
    }
    Ok(nets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn bare_address_is_host_route() {
        let net: BlockedNet = "10.1.2.3".parse().unwrap();
        assert!(net.contains(ip("10.1.2.3")));
        assert!(!net.contains(ip("10.1.2.4")));
    }

    #[test]
    fn ipv4_cidr_membership() {
        let net: BlockedNet = "4.148.0.0/16".parse().unwrap();
        assert!(net.contains(ip("4.148.10.20")));
        assert!(!net.contains(ip("4.149.0.1")));
    }

    #[test]
    fn ipv6_cidr_membership() {
        let net: BlockedNet = "2a01:111:f403::/48".parse().unwrap();
        assert!(net.contains(ip("2a01:111:f403:1::1")));
        assert!(!net.contains(ip("2a01:111:f404::1")));
    }

    #[test]
    fn zero_prefix_matches_family() {
        let net: BlockedNet = "0.0.0.0/0".parse().unwrap();
        assert!(net.contains(ip("203.0.113.9")));
        assert!(!net.contains(ip("::1")));
    }

    #[test]
    fn v4_mapped_v6_matches_v4_range() {
        let net: BlockedNet = "192.0.2.0/24".parse().unwrap();
        assert!(net.contains(ip("::ffff:192.0.2.77")));
    }

    #[test]
    fn invalid_entries_are_rejected() {
        assert!("not-an-ip".parse::<BlockedNet>().is_err());
        assert!("10.0.0.0/33".parse::<BlockedNet>().is_err());
        assert!("::/129".parse::<BlockedNet>().is_err());
        assert!("10.0.0.0/x".parse::<BlockedNet>().is_err());
    }

    #[test]
    fn blacklist_checks_fixed_and_fetched() {
        let list = Blacklist::new(vec!["198.51.100.0/24".parse().unwrap()]);
        assert!(list.contains(ip("198.51.100.1")));
        assert!(!list.contains(ip("203.0.113.1")));

        list.replace(vec!["203.0.113.0/24".parse().unwrap()]);
        assert!(list.contains(ip("203.0.113.1")));
        assert_eq!(list.fetched_len(), 1);

        list.replace(Vec::new());
        assert!(!list.contains(ip("203.0.113.1")));
        assert!(list.contains(ip("198.51.100.1")));
    }

    #[test]
    fn parse_meta_reads_actions_ranges() {
        let body = serde_json::json!({
            "hooks": ["192.30.252.0/22"],
            "actions": ["4.148.0.0/16", "2a01:111:f403::/48", "garbage", 7]
        });
        let nets = parse_meta(&body).unwrap();
        assert_eq!(nets.len(), 2);
        assert!(nets.iter().any(|n| n.contains(ip("4.148.1.1"))));
        assert!(!nets.iter().any(|n| n.contains(ip("192.30.252.1"))));
    }

    #[test]
    fn parse_meta_without_actions_is_error() {
        let body = serde_json::json!({ "hooks": [] });
        assert!(matches!(
            parse_meta(&body),
            Err(ClajsError::BlacklistFormat(_))
        ));
    }

    #[tokio::test]
    async fn refresh_failure_keeps_previous_entries() {
        let list = Blacklist::default();
        list.replace(vec!["203.0.113.0/24".parse().unwrap()]);
        // nothing listens on port 9 of the loopback
        assert!(list.refresh("http://127.0.0.1:9/meta").await.is_err());
        assert!(list.contains(ip("203.0.113.5")));
    }
}
