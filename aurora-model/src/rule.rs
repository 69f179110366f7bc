//! Forward rules: the method enumeration, per-method parameter schemas,
//! and the engine-owned state that rides along in the rule's config bag.
//!
//! The `method` column discriminates the parameter schema, so decoding is
//! externally tagged: [`RuleConfig::decode`] splits the shared keys off the
//! raw bag and parses the remainder against the method's strict schema.
//! Unknown fields are rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ModelError, Result};

/// The forwarding technology attached to a port. Closed enumeration;
/// unknown methods are rejected at the boundary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Iptables,
    Gost,
    V2ray,
    Brook,
    Socat,
    Ehco,
    Wstunnel,
    Shadowsocks,
    TinyPortMapper,
    Iperf,
    Realm,
    Haproxy,
    Caddy,
    NodeExporter,
}

impl Method {
    pub const ALL: [Method; 14] = [
        Method::Iptables,
        Method::Gost,
        Method::V2ray,
        Method::Brook,
        Method::Socat,
        Method::Ehco,
        Method::Wstunnel,
        Method::Shadowsocks,
        Method::TinyPortMapper,
        Method::Iperf,
        Method::Realm,
        Method::Haproxy,
        Method::Caddy,
        Method::NodeExporter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Iptables => "iptables",
            Method::Gost => "gost",
            Method::V2ray => "v2ray",
            Method::Brook => "brook",
            Method::Socat => "socat",
            Method::Ehco => "ehco",
            Method::Wstunnel => "wstunnel",
            Method::Shadowsocks => "shadowsocks",
            Method::TinyPortMapper => "tiny_port_mapper",
            Method::Iperf => "iperf",
            Method::Realm => "realm",
            Method::Haproxy => "haproxy",
            Method::Caddy => "caddy",
            Method::NodeExporter => "node_exporter",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        Method::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == value)
            .ok_or_else(|| ModelError::UnknownMethod(value.to_string()))
    }

    /// Methods whose remote endpoint is re-resolved by the DDNS watcher.
    pub fn follows_ddns(&self) -> bool {
        matches!(
            self,
            Method::Iptables | Method::Brook | Method::TinyPortMapper
        )
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule lifecycle as driven by the reconciler.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    #[default]
    Starting,
    Running,
    Failed,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Starting => "starting",
            RuleStatus::Running => "running",
            RuleStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "starting" => Some(RuleStatus::Starting),
            "running" => Some(RuleStatus::Running),
            "failed" => Some(RuleStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol selector shared by the NAT-style methods.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
pub enum ForwardType {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
    #[default]
    #[serde(rename = "ALL")]
    All,
}

impl ForwardType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardType::Tcp => "TCP",
            ForwardType::Udp => "UDP",
            ForwardType::All => "ALL",
        }
    }

    pub fn tcp(&self) -> bool {
        matches!(self, ForwardType::Tcp | ForwardType::All)
    }

    pub fn udp(&self) -> bool {
        matches!(self, ForwardType::Udp | ForwardType::All)
    }
}

/// ehco listen/transport selector.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum EhcoTransport {
    #[default]
    Raw,
    Ws,
    Wss,
    Mwss,
}

impl EhcoTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            EhcoTransport::Raw => "raw",
            EhcoTransport::Ws => "ws",
            EhcoTransport::Wss => "wss",
            EhcoTransport::Mwss => "mwss",
        }
    }

    /// URL scheme prefix for the remote endpoint, empty for raw TCP.
    pub fn url_prefix(&self) -> &'static str {
        match self {
            EhcoTransport::Raw => "",
            EhcoTransport::Ws => "ws://",
            EhcoTransport::Wss | EhcoTransport::Mwss => "wss://",
        }
    }
}

/// The published shadowsocks cipher list.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum ShadowsocksCipher {
    #[serde(rename = "AEAD_AES_128_GCM")]
    AeadAes128Gcm,
    #[serde(rename = "AEAD_AES_256_GCM")]
    AeadAes256Gcm,
    #[serde(rename = "AEAD_CHACHA20_POLY1305")]
    AeadChacha20Poly1305,
    #[serde(rename = "aes-128-cfb")]
    Aes128Cfb,
    #[serde(rename = "aes-192-cfb")]
    Aes192Cfb,
    #[serde(rename = "aes-256-cfb")]
    Aes256Cfb,
    #[serde(rename = "aes-128-ctr")]
    Aes128Ctr,
    #[serde(rename = "aes-192-ctr")]
    Aes192Ctr,
    #[serde(rename = "aes-256-ctr")]
    Aes256Ctr,
    #[serde(rename = "rc4-md5")]
    Rc4Md5,
    #[serde(rename = "chacha20")]
    Chacha20,
    #[serde(rename = "chacha20-ietf")]
    Chacha20Ietf,
    #[serde(rename = "xchacha20")]
    Xchacha20,
}

impl ShadowsocksCipher {
    /// AEAD ciphers are served by the go2 binary, stream ciphers by go.
    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            ShadowsocksCipher::AeadAes128Gcm
                | ShadowsocksCipher::AeadAes256Gcm
                | ShadowsocksCipher::AeadChacha20Poly1305
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShadowsocksCipher::AeadAes128Gcm => "AEAD_AES_128_GCM",
            ShadowsocksCipher::AeadAes256Gcm => "AEAD_AES_256_GCM",
            ShadowsocksCipher::AeadChacha20Poly1305 => {
                "AEAD_CHACHA20_POLY1305"
            }
            ShadowsocksCipher::Aes128Cfb => "aes-128-cfb",
            ShadowsocksCipher::Aes192Cfb => "aes-192-cfb",
            ShadowsocksCipher::Aes256Cfb => "aes-256-cfb",
            ShadowsocksCipher::Aes128Ctr => "aes-128-ctr",
            ShadowsocksCipher::Aes192Ctr => "aes-192-ctr",
            ShadowsocksCipher::Aes256Ctr => "aes-256-ctr",
            ShadowsocksCipher::Rc4Md5 => "rc4-md5",
            ShadowsocksCipher::Chacha20 => "chacha20",
            ShadowsocksCipher::Chacha20Ietf => "chacha20-ietf",
            ShadowsocksCipher::Xchacha20 => "xchacha20",
        }
    }
}

/// iptables NAT forward parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IptablesParams {
    #[serde(rename = "type", default)]
    pub forward_type: ForwardType,
    pub remote_address: String,
    pub remote_port: u16,
}

/// gost proxy parameters; node strings follow gost's URL node syntax.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct GostParams {
    #[serde(rename = "Retries", default)]
    pub retries: u32,
    #[serde(rename = "ServeNodes", default)]
    pub serve_nodes: Vec<String>,
    #[serde(rename = "ChainNodes", default)]
    pub chain_nodes: Vec<String>,
}

impl GostParams {
    /// Every serve node must listen on the port's own number (or the
    /// advertised `external_num` when set).
    pub fn check_serve_nodes(
        &self,
        num: u16,
        external_num: Option<u16>,
    ) -> Result<()> {
        let allowed = external_num.unwrap_or(num);
        for node in &self.serve_nodes {
            let ok = if let Some(rest) = node.strip_prefix(':') {
                rest.starts_with(&allowed.to_string())
            } else if let Ok(parsed) = url::Url::parse(node) {
                let suffix = allowed.to_string();
                parsed
                    .port()
                    .map(|p| p == allowed)
                    .unwrap_or_else(|| parsed.path().ends_with(&suffix))
            } else {
                false
            };
            if !ok {
                return Err(ModelError::validation(format!(
                    "Port not allowed, ServeNode: {node}"
                )));
            }
        }
        Ok(())
    }

    /// Rewrite serve nodes advertised on `external_num` to listen on the
    /// real port number.
    pub fn effective_serve_nodes(
        &self,
        num: u16,
        external_num: Option<u16>,
    ) -> Vec<String> {
        if self.serve_nodes.is_empty() {
            return vec![format!(":{num}")];
        }
        match external_num {
            Some(external) => self
                .serve_nodes
                .iter()
                .map(|node| {
                    node.replacen(
                        &format!(":{external}"),
                        &format!(":{num}"),
                        1,
                    )
                })
                .collect(),
            None => self.serve_nodes.clone(),
        }
    }
}

/// v2ray inbound/outbound passthrough config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct V2rayParams {
    #[serde(default)]
    pub inbounds: Vec<Value>,
    #[serde(default)]
    pub outbounds: Vec<Value>,
    #[serde(default)]
    pub routing: Value,
    #[serde(default)]
    pub dns: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShadowsocksParams {
    pub encryption: ShadowsocksCipher,
    pub password: String,
    #[serde(default)]
    pub udp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EhcoParams {
    #[serde(default)]
    pub listen_type: EhcoTransport,
    #[serde(default)]
    pub transport_type: EhcoTransport,
    pub remote_address: String,
    pub remote_port: u16,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum WstunnelMode {
    Client,
    Server,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum WstunnelProtocol {
    Ws,
    Wss,
}

impl WstunnelProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            WstunnelProtocol::Ws => "ws",
            WstunnelProtocol::Wss => "wss",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WstunnelParams {
    pub client_type: WstunnelMode,
    pub protocol: WstunnelProtocol,
    pub proxy_port: u16,
    #[serde(default)]
    pub forward_type: ForwardType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BrookCommand {
    Relay,
    Server,
    Wsserver,
    Client,
    Wsclient,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrookParams {
    pub command: BrookCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SocatParams {
    #[serde(rename = "type", default)]
    pub forward_type: ForwardType,
    pub remote_address: String,
    pub remote_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TinyPortMapperParams {
    #[serde(rename = "type", default)]
    pub forward_type: ForwardType,
    pub remote_address: String,
    pub remote_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct IperfParams {}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
pub enum RealmCommand {
    #[default]
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "ws-in")]
    WsIn,
    #[serde(rename = "ws-out")]
    WsOut,
    #[serde(rename = "wss-in")]
    WssIn,
    #[serde(rename = "wss-out")]
    WssOut,
}

impl RealmCommand {
    /// Extra realm argument selecting the websocket wrapping side.
    pub fn transport_arg(&self) -> &'static str {
        match self {
            RealmCommand::Tcp => "",
            RealmCommand::WsIn => "-b 'ws;host=abc;path=/'",
            RealmCommand::WsOut => "-a 'ws;host=abc;path=/'",
            RealmCommand::WssIn => {
                "-b 'ws;host=abc;path=/;tls;insecure;sni=abc'"
            }
            RealmCommand::WssOut => {
                "-a 'ws;host=abc;path=/;tls;servername=abc'"
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RealmParams {
    #[serde(default)]
    pub command: RealmCommand,
    pub remote_address: String,
    pub remote_port: u16,
}

fn default_haproxy_mode() -> String {
    "tcp".to_string()
}

fn default_balance_mode() -> String {
    "roundrobin".to_string()
}

fn default_maxconn() -> u32 {
    20_480
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HaproxyParams {
    #[serde(default = "default_haproxy_mode")]
    pub mode: String,
    #[serde(default = "default_balance_mode")]
    pub balance_mode: String,
    #[serde(default = "default_maxconn")]
    pub maxconn: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_proxy: Option<String>,
    pub backend_nodes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct CaddyParams {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct NodeExporterParams {}

/// Settings for rules fronted by a caddy reverse proxy on the same server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    pub domain: String,
    pub path: String,
    pub protocol: String,
}

/// Method-specific parameters, discriminated by the rule's `method` column.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RuleParams {
    Iptables(IptablesParams),
    Gost(GostParams),
    V2ray(V2rayParams),
    Brook(BrookParams),
    Socat(SocatParams),
    Ehco(EhcoParams),
    Wstunnel(WstunnelParams),
    Shadowsocks(ShadowsocksParams),
    TinyPortMapper(TinyPortMapperParams),
    Iperf(IperfParams),
    Realm(RealmParams),
    Haproxy(HaproxyParams),
    Caddy(CaddyParams),
    NodeExporter(NodeExporterParams),
}

impl RuleParams {
    pub fn method(&self) -> Method {
        match self {
            RuleParams::Iptables(_) => Method::Iptables,
            RuleParams::Gost(_) => Method::Gost,
            RuleParams::V2ray(_) => Method::V2ray,
            RuleParams::Brook(_) => Method::Brook,
            RuleParams::Socat(_) => Method::Socat,
            RuleParams::Ehco(_) => Method::Ehco,
            RuleParams::Wstunnel(_) => Method::Wstunnel,
            RuleParams::Shadowsocks(_) => Method::Shadowsocks,
            RuleParams::TinyPortMapper(_) => Method::TinyPortMapper,
            RuleParams::Iperf(_) => Method::Iperf,
            RuleParams::Realm(_) => Method::Realm,
            RuleParams::Haproxy(_) => Method::Haproxy,
            RuleParams::Caddy(_) => Method::Caddy,
            RuleParams::NodeExporter(_) => Method::NodeExporter,
        }
    }

    /// Strictly decode the parameter object for the given method.
    pub fn decode(method: Method, value: Value) -> Result<Self> {
        let params = match method {
            Method::Iptables => {
                RuleParams::Iptables(serde_json::from_value(value)?)
            }
            Method::Gost => RuleParams::Gost(serde_json::from_value(value)?),
            Method::V2ray => {
                RuleParams::V2ray(serde_json::from_value(value)?)
            }
            Method::Brook => {
                RuleParams::Brook(serde_json::from_value(value)?)
            }
            Method::Socat => {
                RuleParams::Socat(serde_json::from_value(value)?)
            }
            Method::Ehco => RuleParams::Ehco(serde_json::from_value(value)?),
            Method::Wstunnel => {
                RuleParams::Wstunnel(serde_json::from_value(value)?)
            }
            Method::Shadowsocks => {
                RuleParams::Shadowsocks(serde_json::from_value(value)?)
            }
            Method::TinyPortMapper => {
                RuleParams::TinyPortMapper(serde_json::from_value(value)?)
            }
            Method::Iperf => {
                RuleParams::Iperf(serde_json::from_value(value)?)
            }
            Method::Realm => {
                RuleParams::Realm(serde_json::from_value(value)?)
            }
            Method::Haproxy => {
                RuleParams::Haproxy(serde_json::from_value(value)?)
            }
            Method::Caddy => {
                RuleParams::Caddy(serde_json::from_value(value)?)
            }
            Method::NodeExporter => {
                RuleParams::NodeExporter(serde_json::from_value(value)?)
            }
        };
        Ok(params)
    }

    /// The remote address the rule dials out to, when the method has one.
    pub fn remote_address(&self) -> Option<&str> {
        match self {
            RuleParams::Iptables(p) => Some(&p.remote_address),
            RuleParams::Socat(p) => Some(&p.remote_address),
            RuleParams::Ehco(p) => Some(&p.remote_address),
            RuleParams::TinyPortMapper(p) => Some(&p.remote_address),
            RuleParams::Realm(p) => Some(&p.remote_address),
            RuleParams::Brook(p) => p.remote_address.as_deref(),
            RuleParams::Wstunnel(p) => p.remote_address.as_deref(),
            _ => None,
        }
    }
}

/// The full rule config bag: method parameters plus the keys owned by the
/// engine (`remote_ip`, `runner`, `error`) and the operator-side extras
/// that apply to any method.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleConfig {
    #[serde(flatten)]
    pub params: RuleParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_second: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse_proxy: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Keys the engine and operator own regardless of method; stripped before
/// the strict per-method decode.
const SHARED_KEYS: [&str; 6] = [
    "expire_second",
    "reverse_proxy",
    "tls_settings",
    "remote_ip",
    "runner",
    "error",
];

impl RuleConfig {
    pub fn new(params: RuleParams) -> Self {
        Self {
            params,
            expire_second: None,
            reverse_proxy: None,
            tls_settings: None,
            remote_ip: None,
            runner: None,
            error: None,
        }
    }

    /// Decode a stored or submitted config bag for the given method.
    /// Shared keys are split off; everything else must match the method's
    /// schema exactly.
    pub fn decode(method: Method, value: &Value) -> Result<Self> {
        let mut map = match value {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(ModelError::validation(format!(
                    "rule config must be an object, got {other}"
                )));
            }
        };

        let mut shared = serde_json::Map::new();
        for key in SHARED_KEYS {
            if let Some(v) = map.remove(key) {
                shared.insert(key.to_string(), v);
            }
        }

        let params = RuleParams::decode(method, Value::Object(map))?;
        let take_str = |shared: &serde_json::Map<String, Value>,
                        key: &str| {
            shared
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        Ok(Self {
            params,
            expire_second: shared
                .get("expire_second")
                .and_then(Value::as_i64),
            reverse_proxy: shared
                .get("reverse_proxy")
                .and_then(Value::as_i64),
            tls_settings: shared
                .get("tls_settings")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?,
            remote_ip: take_str(&shared, "remote_ip"),
            runner: take_str(&shared, "runner"),
            error: take_str(&shared, "error"),
        })
    }

    /// Re-encode into the flat JSON bag stored in the database.
    pub fn encode(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardRule {
    pub id: i64,
    pub port_id: i64,
    pub method: Method,
    pub config: RuleConfig,
    pub status: RuleStatus,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_iptables_config() {
        let value = json!({
            "type": "TCP",
            "remote_address": "example.com",
            "remote_port": 443,
        });
        let config = RuleConfig::decode(Method::Iptables, &value).unwrap();
        match &config.params {
            RuleParams::Iptables(p) => {
                assert_eq!(p.forward_type, ForwardType::Tcp);
                assert_eq!(p.remote_address, "example.com");
                assert_eq!(p.remote_port, 443);
            }
            other => panic!("wrong params: {other:?}"),
        }
        assert!(config.remote_ip.is_none());
    }

    #[test]
    fn unknown_fields_rejected() {
        let value = json!({
            "remote_address": "example.com",
            "remote_port": 443,
            "surprise": true,
        });
        assert!(RuleConfig::decode(Method::Iptables, &value).is_err());
    }

    #[test]
    fn shared_keys_survive_round_trip() {
        let value = json!({
            "remote_address": "example.com",
            "remote_port": 443,
            "remote_ip": "1.2.3.4",
            "error": "boom",
            "expire_second": 3600,
        });
        let config = RuleConfig::decode(Method::Iptables, &value).unwrap();
        assert_eq!(config.remote_ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(config.error.as_deref(), Some("boom"));
        assert_eq!(config.expire_second, Some(3600));

        let encoded = config.encode().unwrap();
        assert_eq!(encoded["remote_ip"], "1.2.3.4");
        assert_eq!(encoded["remote_address"], "example.com");
        let back = RuleConfig::decode(Method::Iptables, &encoded).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn out_of_range_port_rejected() {
        let value = json!({
            "remote_address": "example.com",
            "remote_port": 70000,
        });
        assert!(RuleConfig::decode(Method::Iptables, &value).is_err());
    }

    #[test]
    fn gost_serve_node_port_check() {
        let params = GostParams {
            retries: 0,
            serve_nodes: vec![":99".to_string()],
            chain_nodes: vec![],
        };
        let err = params.check_serve_nodes(10001, None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Port not allowed, ServeNode: :99"
        );

        let params = GostParams {
            retries: 0,
            serve_nodes: vec![
                ":10001".to_string(),
                "tcp://:10001/1.2.3.4:443".to_string(),
            ],
            chain_nodes: vec![],
        };
        assert!(params.check_serve_nodes(10001, None).is_ok());
    }

    #[test]
    fn gost_external_num_rewrite() {
        let params = GostParams {
            retries: 0,
            serve_nodes: vec![":20001".to_string()],
            chain_nodes: vec![],
        };
        assert!(params.check_serve_nodes(10001, Some(20001)).is_ok());
        assert_eq!(
            params.effective_serve_nodes(10001, Some(20001)),
            vec![":10001".to_string()]
        );
    }

    #[test]
    fn empty_serve_nodes_default_to_port() {
        let params = GostParams::default();
        assert_eq!(
            params.effective_serve_nodes(10001, None),
            vec![":10001".to_string()]
        );
    }

    #[test]
    fn unknown_cipher_rejected() {
        let value = json!({
            "encryption": "rot13",
            "password": "hunter2",
        });
        assert!(RuleConfig::decode(Method::Shadowsocks, &value).is_err());
    }

    #[test]
    fn method_round_trip() {
        for method in Method::ALL {
            assert_eq!(Method::parse(method.as_str()).unwrap(), method);
        }
        assert!(Method::parse("telepathy").is_err());
    }
}
