//! Session settings packs.
//!
//! The baseline pack is built from `UndertowConfig`; the optional
//! `libtorrent.config` file in the profile is parsed into an overrides pack
//! that is layered on top and re-applied wholesale when the file changes.

use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use tracing::warn;

use crate::config::{EncryptionPolicy, ProxyType, SessionProfile, UndertowConfig};

/// Bootstrap routers used when DHT is enabled.
pub const DHT_BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "router.utorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "dht.aelitis.com:6881",
    "router.silotis.us:6881",
    "dht.libtorrent.org:25401",
];

/// Alert categories the engine consumes: error, port mapping, storage, status.
const ALERT_MASK: i64 = 1 | (1 << 2) | (1 << 3) | (1 << 6);

/// A single setting value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(value) => write!(f, "{value}"),
            SettingValue::Int(value) => write!(f, "{value}"),
            SettingValue::Str(value) => f.write_str(value),
        }
    }
}

/// Ordered set of named settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsPack {
    values: BTreeMap<String, SettingValue>,
}

impl SettingsPack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.values.insert(key.to_string(), SettingValue::Bool(value));
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.values.insert(key.to_string(), SettingValue::Int(value));
    }

    pub fn set_str(&mut self, key: &str, value: impl Into<String>) {
        self.values
            .insert(key.to_string(), SettingValue::Str(value.into()));
    }

    pub fn set(&mut self, key: &str, value: SettingValue) {
        self.values.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.values.get(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.values.get(key) {
            Some(SettingValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key) {
            Some(SettingValue::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(SettingValue::Str(value)) => Some(value),
            _ => None,
        }
    }

    /// Copies every entry of `other` over this pack.
    pub fn merge(&mut self, other: &SettingsPack) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SettingValue)> {
        self.values.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Parses `key=value` override lines. Values are `true`, `false` or an
/// integer; `#` lines and blank lines are ignored, anything else is logged
/// and skipped.
pub fn parse_overrides(text: &str) -> SettingsPack {
    let mut pack = SettingsPack::new();
    for (number, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!("Ignoring override line {}: missing '='", number + 1);
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            warn!("Ignoring override line {}: empty key", number + 1);
            continue;
        }
        match value {
            "true" => pack.set_bool(key, true),
            "false" => pack.set_bool(key, false),
            other => match other.parse::<i64>() {
                Ok(number_value) => pack.set_int(key, number_value),
                Err(_) => warn!(
                    "Ignoring override {}={}: value is neither bool nor integer",
                    key, other
                ),
            },
        }
    }
    pack
}

/// One bound `interface:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenEndpoint {
    pub interface: String,
    pub port: u16,
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.interface.contains(':') && !self.interface.starts_with('[') {
            write!(f, "[{}]:{}", self.interface, self.port)
        } else {
            write!(f, "{}:{}", self.interface, self.port)
        }
    }
}

/// Picks listen ports for every interface: one random port from the range,
/// plus a distinct second one when the range holds more than one port.
pub fn build_listen_endpoints<R: Rng>(
    interfaces: &[String],
    port_min: u16,
    port_max: u16,
    rng: &mut R,
) -> Vec<ListenEndpoint> {
    let default_interface = ["0.0.0.0".to_string()];
    let interfaces = if interfaces.is_empty() {
        &default_interface[..]
    } else {
        interfaces
    };
    let (low, high) = if port_min <= port_max {
        (port_min, port_max)
    } else {
        (port_max, port_min)
    };

    let mut endpoints = Vec::with_capacity(interfaces.len() * 2);
    for interface in interfaces {
        let first = rng.random_range(low..=high);
        endpoints.push(ListenEndpoint {
            interface: interface.clone(),
            port: first,
        });
        if high > low {
            let mut second = rng.random_range(low..=high);
            while second == first {
                second = rng.random_range(low..=high);
            }
            endpoints.push(ListenEndpoint {
                interface: interface.clone(),
                port: second,
            });
        }
    }
    endpoints
}

pub fn listen_interfaces_value(endpoints: &[ListenEndpoint]) -> String {
    endpoints
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Download/upload rate limits in bytes per second. Zero is unlimited.
pub fn rate_limit_settings(download: u64, upload: u64) -> SettingsPack {
    let mut pack = SettingsPack::new();
    pack.set_int("download_rate_limit", clamp_i64(download));
    pack.set_int("upload_rate_limit", clamp_i64(upload));
    pack
}

/// Builds the baseline session settings.
pub fn build_settings(config: &UndertowConfig, endpoints: &[ListenEndpoint]) -> SettingsPack {
    let network = &config.network;
    let mut pack = SettingsPack::new();

    pack.set_str("user_agent", network.user_agent.clone());
    pack.set_int("alert_mask", ALERT_MASK);
    pack.set_int("connections_limit", i64::from(network.connections_limit));
    pack.set_int("aio_threads", (num_cpus::get() as i64).clamp(2, 16));
    pack.set_bool("announce_to_all_tiers", true);
    pack.set_bool("announce_to_all_trackers", true);
    pack.set_bool("strict_end_game_mode", false);
    pack.set_int("request_timeout", 2);
    pack.set_int("peer_connect_timeout", 2);

    if config.limits.limit_after_buffering {
        pack.merge(&rate_limit_settings(0, 0));
    } else {
        pack.merge(&rate_limit_settings(
            config.limits.download_rate_limit,
            config.limits.upload_rate_limit,
        ));
    }

    apply_encryption(&mut pack, network.encryption_policy);
    apply_proxy(&mut pack, config);

    pack.set_bool("enable_dht", !network.disable_dht);
    pack.set_bool("enable_lsd", !network.disable_lsd);
    pack.set_bool("enable_upnp", !network.disable_upnp);
    pack.set_bool("enable_natpmp", !network.disable_natpmp);
    if !network.disable_dht {
        pack.set_str("dht_bootstrap_nodes", DHT_BOOTSTRAP_NODES.join(","));
    }

    if !endpoints.is_empty() {
        pack.set_str("listen_interfaces", listen_interfaces_value(endpoints));
    }
    if !network.outgoing_interfaces.is_empty() {
        pack.set_str("outgoing_interfaces", network.outgoing_interfaces.join(","));
    }

    apply_profile(&mut pack, network.session_profile);
    pack
}

fn apply_encryption(pack: &mut SettingsPack, policy: EncryptionPolicy) {
    // enc_policy: forced=0, enabled=1, disabled=2; enc_level: plaintext=1, rc4=2, both=3
    let (enc_policy, enc_level, prefer_rc4) = match policy {
        EncryptionPolicy::Off => (2, 1, false),
        EncryptionPolicy::Prefer => (1, 3, false),
        EncryptionPolicy::Force => (0, 2, true),
    };
    pack.set_int("out_enc_policy", enc_policy);
    pack.set_int("in_enc_policy", enc_policy);
    pack.set_int("allowed_enc_level", enc_level);
    pack.set_bool("prefer_rc4", prefer_rc4);
}

/// Library proxy type code.
pub fn proxy_type_code(proxy_type: ProxyType) -> i64 {
    match proxy_type {
        ProxyType::None => 0,
        ProxyType::Socks4 => 1,
        ProxyType::Socks5 => 2,
        ProxyType::Socks5Password => 3,
        ProxyType::Http => 4,
        ProxyType::HttpPassword => 5,
        ProxyType::I2p => 6,
    }
}

fn apply_proxy(pack: &mut SettingsPack, config: &UndertowConfig) {
    let proxy = &config.network.proxy;
    pack.set_int("proxy_type", proxy_type_code(proxy.proxy_type));
    if proxy.proxy_type == ProxyType::None {
        return;
    }
    if proxy.proxy_type == ProxyType::I2p {
        pack.set_str("i2p_hostname", proxy.host.clone());
        pack.set_int("i2p_port", i64::from(proxy.port));
        pack.set_bool("allow_i2p_mixed", true);
        return;
    }
    pack.set_str("proxy_hostname", proxy.host.clone());
    pack.set_int("proxy_port", i64::from(proxy.port));
    if matches!(
        proxy.proxy_type,
        ProxyType::Socks5Password | ProxyType::HttpPassword
    ) {
        pack.set_str("proxy_username", proxy.username.clone());
        pack.set_str("proxy_password", proxy.password.clone());
    }
    pack.set_bool("proxy_peer_connections", true);
    pack.set_bool("proxy_tracker_connections", true);
    pack.set_bool("proxy_hostnames", true);
}

fn apply_profile(pack: &mut SettingsPack, profile: SessionProfile) {
    match profile {
        SessionProfile::Default => {}
        SessionProfile::MinMemory => {
            pack.set_int("max_queued_disk_bytes", 1024 * 1024);
            pack.set_int("send_buffer_watermark", 512 * 1024);
            pack.set_int("max_peerlist_size", 500);
            pack.set_int("checking_mem_usage", 2);
            pack.set_bool("close_redundant_connections", true);
        }
        SessionProfile::HighPerformance => {
            pack.set_int("max_queued_disk_bytes", 8 * 1024 * 1024);
            pack.set_int("send_buffer_watermark", 3 * 1024 * 1024);
            pack.set_int("send_buffer_watermark_factor", 150);
            pack.set_int("max_peerlist_size", 4000);
            pack.set_int("max_out_request_queue", 1500);
            pack.set_int("suggest_mode", 1);
        }
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn test_parse_overrides_skips_comments_and_bad_lines() {
        let text = "# tuning\n\
                    connections_limit=400\n\
                    enable_dht = false\n\
                    \n\
                    broken line\n\
                    user_agent=custom\n\
                    =5\n";
        let pack = parse_overrides(text);

        assert_eq!(pack.len(), 2);
        assert_eq!(pack.get_int("connections_limit"), Some(400));
        assert_eq!(pack.get_bool("enable_dht"), Some(false));
        assert!(pack.get("user_agent").is_none());
    }

    #[test]
    fn test_merge_overrides_baseline() {
        let mut baseline = SettingsPack::new();
        baseline.set_int("connections_limit", 200);
        baseline.set_bool("enable_lsd", true);
        let overrides = parse_overrides("connections_limit=50");

        baseline.merge(&overrides);
        assert_eq!(baseline.get_int("connections_limit"), Some(50));
        assert_eq!(baseline.get_bool("enable_lsd"), Some(true));
    }

    #[test]
    fn test_encryption_policy_mapping() {
        let mut config = UndertowConfig::default();

        config.network.encryption_policy = EncryptionPolicy::Off;
        let pack = build_settings(&config, &[]);
        assert_eq!(pack.get_int("out_enc_policy"), Some(2));
        assert_eq!(pack.get_int("allowed_enc_level"), Some(1));

        config.network.encryption_policy = EncryptionPolicy::Prefer;
        let pack = build_settings(&config, &[]);
        assert_eq!(pack.get_int("in_enc_policy"), Some(1));
        assert_eq!(pack.get_int("allowed_enc_level"), Some(3));

        config.network.encryption_policy = EncryptionPolicy::Force;
        let pack = build_settings(&config, &[]);
        assert_eq!(pack.get_int("out_enc_policy"), Some(0));
        assert_eq!(pack.get_int("allowed_enc_level"), Some(2));
        assert_eq!(pack.get_bool("prefer_rc4"), Some(true));
    }

    #[test]
    fn test_proxy_mapping() {
        let mut config = UndertowConfig::default();
        config.network.proxy.proxy_type = ProxyType::Socks5Password;
        config.network.proxy.host = "proxy.local".to_string();
        config.network.proxy.port = 1080;
        config.network.proxy.username = "user".to_string();

        let pack = build_settings(&config, &[]);
        assert_eq!(pack.get_int("proxy_type"), Some(3));
        assert_eq!(pack.get_str("proxy_hostname"), Some("proxy.local"));
        assert_eq!(pack.get_str("proxy_username"), Some("user"));
        assert_eq!(proxy_type_code(ProxyType::I2p), 6);
        assert_eq!(proxy_type_code(ProxyType::Http), 4);
    }

    #[test]
    fn test_rate_limits_deferred_until_buffering() {
        let mut config = UndertowConfig::default();
        config.limits.download_rate_limit = 1000;
        config.limits.limit_after_buffering = true;
        let pack = build_settings(&config, &[]);
        assert_eq!(pack.get_int("download_rate_limit"), Some(0));

        config.limits.limit_after_buffering = false;
        let pack = build_settings(&config, &[]);
        assert_eq!(pack.get_int("download_rate_limit"), Some(1000));
    }

    #[test]
    fn test_toggles_and_bootstrap_nodes() {
        let mut config = UndertowConfig::default();
        config.network.disable_dht = true;
        config.network.disable_upnp = true;
        let pack = build_settings(&config, &[]);
        assert_eq!(pack.get_bool("enable_dht"), Some(false));
        assert_eq!(pack.get_bool("enable_upnp"), Some(false));
        assert_eq!(pack.get_bool("enable_lsd"), Some(true));
        assert!(pack.get("dht_bootstrap_nodes").is_none());
    }

    #[test]
    fn test_listen_endpoints_within_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let interfaces = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        let endpoints = build_listen_endpoints(&interfaces, 6891, 6899, &mut rng);

        assert_eq!(endpoints.len(), 4);
        for endpoint in &endpoints {
            assert!((6891..=6899).contains(&endpoint.port));
        }
        assert_ne!(endpoints[0].port, endpoints[1].port);
        assert_eq!(endpoints[2].interface, "10.0.0.2");
    }

    #[test]
    fn test_single_port_range_yields_one_endpoint_per_interface() {
        let mut rng = StdRng::seed_from_u64(1);
        let endpoints = build_listen_endpoints(&[], 7000, 7000, &mut rng);
        assert_eq!(
            endpoints,
            vec![ListenEndpoint {
                interface: "0.0.0.0".to_string(),
                port: 7000
            }]
        );
    }

    #[test]
    fn test_listen_interfaces_value_brackets_ipv6() {
        let endpoints = vec![
            ListenEndpoint {
                interface: "0.0.0.0".to_string(),
                port: 6891,
            },
            ListenEndpoint {
                interface: "::".to_string(),
                port: 6892,
            },
        ];
        assert_eq!(listen_interfaces_value(&endpoints), "0.0.0.0:6891,[::]:6892");
    }
}
