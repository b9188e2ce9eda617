//! Share-link parser for vmess and vless subscriptions.
//!
//! Accepts the multi-line text users paste into the generator: one link per
//! line, blank lines ignored. Each line is decoded independently; a bad line
//! is recorded as a [`LineError`] and skipped, so one broken link never
//! rejects the whole batch. Only a batch with no usable link at all fails.

use std::collections::HashMap;
use std::fmt;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde_json::{Map, Value};

use super::node::{
    Network, NodeKind, ProxyNode, RealityOptions, TransportOptions, DEFAULT_CIPHER,
    DEFAULT_GRPC_MODE, DEFAULT_HTTP_METHOD,
};

const VMESS_SCHEME: &str = "vmess://";
const VLESS_SCHEME: &str = "vless://";

/// Why a single link was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unsupported link scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("vmess payload is not valid base64")]
    Base64,

    #[error("vmess payload is not valid JSON: {0}")]
    Json(String),

    #[error("malformed vless link: {0}")]
    InvalidUri(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid port '{0}'")]
    InvalidPort(String),
}

/// A rejected input line, 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineError {
    pub line: usize,
    pub error: ParseError,
}

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.error)
    }
}

/// Batch-level parse failure.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("no valid proxy links found ({} line(s) rejected)", .errors.len())]
    NoValidLinks { errors: Vec<LineError> },
}

/// Nodes that parsed, in input order, plus the lines that did not.
#[derive(Debug, Clone, Default)]
pub struct ParseReport {
    pub nodes: Vec<ProxyNode>,
    pub errors: Vec<LineError>,
}

/// Share-link parser.
pub struct LinkParser;

impl LinkParser {
    /// Parse a block of share links, one per line.
    ///
    /// Returns `SubscriptionError::NoValidLinks` only when no line produced a
    /// node; otherwise every rejected line is reported in `ParseReport::errors`.
    pub fn parse_links(text: &str) -> Result<ParseReport, SubscriptionError> {
        let mut report = ParseReport::default();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim_start_matches('\u{feff}').trim();
            if line.is_empty() {
                continue;
            }
            let line_no = idx + 1;
            match Self::parse_link(line, line_no) {
                Ok(node) => report.nodes.push(node),
                Err(error) => {
                    tracing::debug!("skipping share link on line {line_no}: {error}");
                    report.errors.push(LineError {
                        line: line_no,
                        error,
                    });
                }
            }
        }

        if report.nodes.is_empty() {
            return Err(SubscriptionError::NoValidLinks {
                errors: report.errors,
            });
        }

        tracing::debug!(
            "parsed {} share link(s), rejected {}",
            report.nodes.len(),
            report.errors.len()
        );
        Ok(report)
    }

    /// Parse one trimmed link. `index` feeds default node names.
    pub fn parse_link(link: &str, index: usize) -> Result<ProxyNode, ParseError> {
        if let Some(payload) = link.strip_prefix(VMESS_SCHEME) {
            parse_vmess(payload, index)
        } else if link.starts_with(VLESS_SCHEME) {
            parse_vless(link)
        } else {
            let scheme = link
                .split_once("://")
                .map_or_else(|| truncate(link, 16), |(s, _)| s.to_string());
            Err(ParseError::UnsupportedScheme(scheme))
        }
    }
}

// ── vmess ───────────────────────────────────────────────────────────

fn parse_vmess(payload: &str, index: usize) -> Result<ProxyNode, ParseError> {
    let decoded = decode_base64(payload.trim()).ok_or(ParseError::Base64)?;
    let value: Value =
        serde_json::from_slice(&decoded).map_err(|e| ParseError::Json(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| ParseError::Json("expected a JSON object".into()))?;

    let server = json_text(obj, "add").ok_or(ParseError::MissingField("add"))?;
    let port_raw = json_text(obj, "port").ok_or(ParseError::MissingField("port"))?;
    let port = parse_port(&port_raw)?;
    let identity = json_text(obj, "id").ok_or(ParseError::MissingField("id"))?;

    let name = json_text(obj, "ps").unwrap_or_else(|| format!("VMess-{index}"));
    let mut node = ProxyNode::new(NodeKind::VMess, name, server, port, identity)?;

    node.alter_id = json_text(obj, "aid")
        .and_then(|aid| aid.parse::<u32>().ok())
        .unwrap_or(0);
    node.cipher = json_text(obj, "scy").unwrap_or_else(|| DEFAULT_CIPHER.to_string());

    let path = json_text(obj, "path").unwrap_or_default();
    let host = json_text(obj, "host");
    node.transport = match Network::from_tag(&json_text(obj, "net").unwrap_or_default()) {
        Network::Tcp => TransportOptions::Tcp,
        Network::Ws => TransportOptions::Ws {
            path,
            host: Some(host.unwrap_or_else(|| node.server.clone())),
        },
        Network::Grpc => TransportOptions::Grpc {
            service_name: path,
            mode: match json_text(obj, "type").as_deref() {
                Some("multi") => "multi".to_string(),
                _ => DEFAULT_GRPC_MODE.to_string(),
            },
        },
        Network::H2 => TransportOptions::H2 {
            path,
            host: Some(host.unwrap_or_else(|| node.server.clone())),
        },
        Network::Http => TransportOptions::Http {
            path,
            host: Some(host.unwrap_or_else(|| node.server.clone())),
            method: DEFAULT_HTTP_METHOD.to_string(),
        },
    };

    node.tls.enabled = json_text(obj, "tls").as_deref() == Some("tls");
    node.tls.sni = json_text(obj, "sni");
    node.tls.fingerprint = json_text(obj, "fp");

    Ok(node)
}

/// Try standard, URL-safe, then unpadded alphabets; first success wins.
fn decode_base64(payload: &str) -> Option<Vec<u8>> {
    [STANDARD, URL_SAFE, STANDARD_NO_PAD, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(payload).ok())
}

/// Read a vmess JSON field that may be a string or a number.
fn json_text(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ── vless ───────────────────────────────────────────────────────────

fn parse_vless(link: &str) -> Result<ProxyNode, ParseError> {
    let url = url::Url::parse(link).map_err(|e| match e {
        url::ParseError::InvalidPort => ParseError::InvalidPort(authority_port(link)),
        other => ParseError::InvalidUri(other.to_string()),
    })?;

    let identity = percent_decode(url.username());
    if identity.trim().is_empty() {
        return Err(ParseError::MissingField("uuid"));
    }
    let server = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|h| !h.is_empty())
        .ok_or(ParseError::MissingField("host"))?;
    let port = url
        .port()
        .ok_or_else(|| ParseError::InvalidPort(String::new()))?;

    let name = url
        .fragment()
        .map(percent_decode)
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("VLess-{server}:{port}"));

    let query: HashMap<String, String> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.trim().to_string()))
        .filter(|(_, v)| !v.is_empty())
        .collect();
    let param = |key: &str| query.get(key).cloned();

    let mut node = ProxyNode::new(NodeKind::VLess, name, server, port, identity)?;

    let host_or_server = || param("host").unwrap_or_else(|| node.server.clone());
    let transport = match Network::from_tag(&param("type").unwrap_or_default()) {
        Network::Tcp => TransportOptions::Tcp,
        Network::Ws => TransportOptions::Ws {
            path: param("path").unwrap_or_default(),
            host: Some(host_or_server()),
        },
        Network::Grpc => TransportOptions::Grpc {
            service_name: param("serviceName").unwrap_or_default(),
            mode: param("mode").unwrap_or_else(|| DEFAULT_GRPC_MODE.to_string()),
        },
        Network::H2 => TransportOptions::H2 {
            path: param("path").unwrap_or_default(),
            host: Some(host_or_server()),
        },
        Network::Http => TransportOptions::Http {
            path: param("path").unwrap_or_default(),
            host: Some(host_or_server()),
            method: param("method").unwrap_or_else(|| DEFAULT_HTTP_METHOD.to_string()),
        },
    };
    node.transport = transport;

    let security = param("security").unwrap_or_default().to_ascii_lowercase();
    node.tls.enabled = security == "tls" || security == "reality";
    node.tls.sni = param("sni");
    node.tls.skip_cert_verify = matches!(param("allowInsecure").as_deref(), Some("1" | "true"));
    node.tls.fingerprint = param("fp");
    if security == "reality" {
        node.tls.reality = param("pbk").map(|public_key| RealityOptions {
            public_key,
            short_id: param("sid"),
        });
    }
    node.flow = param("flow");

    Ok(node)
}

fn percent_decode(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// Best-effort extraction of the port text for diagnostics.
fn authority_port(link: &str) -> String {
    let rest = link.strip_prefix(VLESS_SCHEME).unwrap_or(link);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    authority
        .rsplit_once(':')
        .map(|(_, p)| p.to_string())
        .unwrap_or_default()
}

fn parse_port(raw: &str) -> Result<u16, ParseError> {
    match raw.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ParseError::InvalidPort(raw.to_string())),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
