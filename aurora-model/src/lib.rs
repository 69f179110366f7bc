//! Core data model definitions shared across Aurora crates.
#![allow(missing_docs)]

pub mod error;
pub mod file;
pub mod limit;
pub mod net;
pub mod port;
pub mod rule;
pub mod server;
pub mod user;

// Intentionally curated re-exports for downstream consumers.
pub use error::{ModelError, Result as ModelResult};
pub use file::{File, FileKind};
pub use limit::{LimitAction, UsagePolicy};
pub use net::{is_ip, is_ipv4, is_ipv6};
pub use port::{Port, PortConfig, PortUsage, PortUser};
pub use rule::{
    BrookCommand, BrookParams, CaddyParams, EhcoParams, EhcoTransport,
    ForwardRule, ForwardType, GostParams, HaproxyParams, IperfParams,
    IptablesParams, Method, NodeExporterParams, RealmCommand, RealmParams,
    RuleConfig, RuleParams, RuleStatus, ShadowsocksCipher,
    ShadowsocksParams, SocatParams, TinyPortMapperParams, TlsSettings,
    V2rayParams, WstunnelMode, WstunnelParams, WstunnelProtocol,
};
pub use server::{
    Server, ServerConfig, ServerUsagePoint, ServerUser, SystemFacts,
};
pub use user::User;
