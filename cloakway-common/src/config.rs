use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Secret;

fn default_meek_listen() -> String {
    "0.0.0.0:8080".to_owned()
}

fn default_certificate_common_name() -> String {
    "localhost".to_owned()
}

fn default_udpgw_idle_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_udpgw_max_port_forward_count() -> usize {
    32
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct CloakwayConfig {
    #[serde(default)]
    pub meek: MeekConfig,

    #[serde(default)]
    pub udpgw: UdpgwConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MeekConfig {
    #[serde(default = "default_meek_listen")]
    pub listen: String,

    #[serde(default)]
    pub https: bool,

    /// Shared secret mixed into the cookie obfuscation keystream.
    #[serde(default)]
    pub obfuscated_key: Secret<String>,

    /// Server X25519 private key for opening cookie payloads, base64.
    #[serde(default)]
    pub cookie_private_key: Secret<String>,

    #[serde(default)]
    pub certificate: Option<String>,

    #[serde(default)]
    pub key: Option<String>,

    #[serde(default = "default_certificate_common_name")]
    pub certificate_common_name: String,

    #[serde(default)]
    pub prohibited_headers: Vec<String>,

    #[serde(default)]
    pub proxy_forwarded_for_headers: Vec<String>,
}

impl Default for MeekConfig {
    fn default() -> Self {
        Self {
            listen: default_meek_listen(),
            https: false,
            obfuscated_key: Secret::default(),
            cookie_private_key: Secret::default(),
            certificate: None,
            key: None,
            certificate_common_name: default_certificate_common_name(),
            prohibited_headers: vec![],
            proxy_forwarded_for_headers: vec![],
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct UdpgwConfig {
    /// When set, flows flagged as DNS are redirected to this resolver.
    #[serde(default)]
    pub dns_server_address: Option<String>,

    #[serde(default = "default_udpgw_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    #[serde(default = "default_udpgw_max_port_forward_count")]
    pub max_port_forward_count: usize,

    #[serde(default)]
    pub allow_ports: Vec<u16>,

    #[serde(default)]
    pub deny_ports: Vec<u16>,
}

impl Default for UdpgwConfig {
    fn default() -> Self {
        Self {
            dns_server_address: None,
            idle_timeout: default_udpgw_idle_timeout(),
            max_port_forward_count: default_udpgw_max_port_forward_count(),
            allow_ports: vec![],
            deny_ports: vec![],
        }
    }
}

impl UdpgwConfig {
    /// Deny list wins; an empty allow list permits every port.
    pub fn port_permitted(&self, port: u16) -> bool {
        if self.deny_ports.contains(&port) {
            return false;
        }
        self.allow_ports.is_empty() || self.allow_ports.contains(&port)
    }
}
