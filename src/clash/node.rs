//! Proxy node model shared by the link parser, the connectivity probe and
//! the Clash config generator.
//!
//! A `ProxyNode` is only built through [`ProxyNode::new`], which rejects an
//! empty server, port 0 and an empty identity. Transport settings are a
//! tagged variant, so the network type can never disagree with its options.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::subscription::ParseError;

/// Default vmess cipher when the link does not carry `scy`.
pub const DEFAULT_CIPHER: &str = "auto";

/// Default gRPC transport mode.
pub const DEFAULT_GRPC_MODE: &str = "gun";

/// Default request method for the `http` transport.
pub const DEFAULT_HTTP_METHOD: &str = "GET";

/// Proxy protocol of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    VMess,
    VLess,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VMess => write!(f, "vmess"),
            Self::VLess => write!(f, "vless"),
        }
    }
}

/// Transport network carried under the proxy protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Ws,
    Grpc,
    H2,
    Http,
}

impl Network {
    /// Map a share-link network tag. Unknown or empty tags fall back to tcp.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "ws" | "websocket" => Self::Ws,
            "grpc" => Self::Grpc,
            "h2" => Self::H2,
            "http" => Self::Http,
            _ => Self::Tcp,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Ws => "ws",
            Self::Grpc => "grpc",
            Self::H2 => "h2",
            Self::Http => "http",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-specific options, keyed by network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "network", rename_all = "lowercase")]
pub enum TransportOptions {
    #[default]
    Tcp,
    Ws {
        path: String,
        host: Option<String>,
    },
    Grpc {
        service_name: String,
        mode: String,
    },
    H2 {
        path: String,
        host: Option<String>,
    },
    Http {
        path: String,
        host: Option<String>,
        method: String,
    },
}

impl TransportOptions {
    pub fn network(&self) -> Network {
        match self {
            Self::Tcp => Network::Tcp,
            Self::Ws { .. } => Network::Ws,
            Self::Grpc { .. } => Network::Grpc,
            Self::H2 { .. } => Network::H2,
            Self::Http { .. } => Network::Http,
        }
    }
}

/// Reality handshake parameters (vless only).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealityOptions {
    pub public_key: String,
    pub short_id: Option<String>,
}

/// TLS settings of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    pub enabled: bool,
    pub sni: Option<String>,
    pub skip_cert_verify: bool,
    pub fingerprint: Option<String>,
    pub reality: Option<RealityOptions>,
}

/// A single proxy endpoint decoded from a share link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyNode {
    pub kind: NodeKind,
    pub name: String,
    pub server: String,
    pub port: u16,
    /// UUID credential for both vmess and vless.
    #[serde(rename = "uuid")]
    pub identity: String,
    /// vmess only.
    pub cipher: String,
    /// vmess only.
    pub alter_id: u32,
    pub transport: TransportOptions,
    pub tls: TlsSettings,
    /// XTLS / Reality flow tag, vless only.
    pub flow: Option<String>,
    pub udp: bool,
}

impl ProxyNode {
    /// Build a tcp node without TLS after checking the node invariants.
    pub fn new(
        kind: NodeKind,
        name: impl Into<String>,
        server: impl Into<String>,
        port: u16,
        identity: impl Into<String>,
    ) -> Result<Self, ParseError> {
        let server = server.into().trim().to_string();
        let identity = identity.into().trim().to_string();
        if server.is_empty() {
            return Err(ParseError::MissingField("server"));
        }
        if port == 0 {
            return Err(ParseError::InvalidPort("0".into()));
        }
        if identity.is_empty() {
            return Err(ParseError::MissingField("uuid"));
        }

        Ok(Self {
            kind,
            name: name.into(),
            server,
            port,
            identity,
            cipher: DEFAULT_CIPHER.to_string(),
            alter_id: 0,
            transport: TransportOptions::Tcp,
            tls: TlsSettings::default(),
            flow: None,
            udp: true,
        })
    }

    pub fn network(&self) -> Network {
        self.transport.network()
    }

    /// `server:port` pair used for probing and default labels.
    pub fn address(&self) -> String {
        if self.server.contains(':') {
            format!("[{}]:{}", self.server, self.port)
        } else {
            format!("{}:{}", self.server, self.port)
        }
    }
}
