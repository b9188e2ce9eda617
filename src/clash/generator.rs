//! Clash config YAML generation.
//!
//! Produces a complete Clash/mihomo config from parsed nodes:
//! - global settings (`mixed-port`, `allow-lan`, controller address)
//! - a `dns` block in fake-ip or redir-host mode
//! - one `proxies` stanza per node
//! - three `proxy-groups`: manual selector, url-test auto group, direct group
//! - `rules` with LAN/China bypass, user rules, and a final `MATCH`
//!
//! Output is a pure function of the inputs apart from the timestamp line in
//! the header, so regenerating with the same links yields the same document.

use serde::{Deserialize, Deserializer, Serialize};

use super::node::{NodeKind, ProxyNode, TransportOptions};

/// Manual selector group; also the `MATCH` target.
pub const SELECTOR_GROUP_NAME: &str = "🚀 Node Select";

/// Latency-based auto selection group.
pub const AUTO_GROUP_NAME: &str = "♻️ Auto Select";

/// Direct-or-proxy group used by the China bypass rules.
pub const DIRECT_GROUP_NAME: &str = "🎯 Direct";

/// Probe URL for the url-test group.
pub const URL_TEST_PROBE_URL: &str = "http://www.gstatic.com/generate_204";

const URL_TEST_INTERVAL_SECS: u32 = 300;
const URL_TEST_TOLERANCE_MS: u32 = 50;

const DEFAULT_MIXED_PORT: u16 = 7890;
const DEFAULT_CONTROLLER_PORT: u16 = 9090;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_DNS_MODE: &str = "fake-ip";

const FAKE_IP_RANGE: &str = "198.18.0.1/16";
const DEFAULT_NAMESERVERS: &[&str] = &["223.5.5.5", "114.114.114.114", "8.8.8.8"];
const DOH_NAMESERVERS: &[&str] = &[
    "https://doh.pub/dns-query",
    "https://dns.alidns.com/dns-query",
    "https://cloudflare-dns.com/dns-query",
];

/// Rules that always come first: LAN and loopback ranges go direct.
const BYPASS_RULES: &[&str] = &[
    "DOMAIN-SUFFIX,local,DIRECT",
    "IP-CIDR,127.0.0.0/8,DIRECT",
    "IP-CIDR,172.16.0.0/12,DIRECT",
    "IP-CIDR,192.168.0.0/16,DIRECT",
    "IP-CIDR,10.0.0.0/8,DIRECT",
    "IP-CIDR,17.0.0.0/8,DIRECT",
    "IP-CIDR,100.64.0.0/10,DIRECT",
];

/// Timestamp layout used in the header comment.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Per-call generation options.
///
/// Field aliases accept the camelCase names used by the web form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    #[serde(alias = "mixedPort")]
    pub mixed_port: u16,
    #[serde(alias = "controllerPort")]
    pub controller_port: u16,
    #[serde(alias = "allowLan")]
    pub allow_lan: bool,
    #[serde(alias = "logLevel")]
    pub log_level: String,
    #[serde(alias = "dnsMode")]
    pub dns_mode: String,
    #[serde(alias = "enableIPv6", alias = "enableIpv6")]
    pub enable_ipv6: bool,
    /// Raw rule lines. Also accepts a single multi-line string.
    #[serde(alias = "customRules", deserialize_with = "rules_from_text_or_list")]
    pub custom_rules: Vec<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            mixed_port: DEFAULT_MIXED_PORT,
            controller_port: DEFAULT_CONTROLLER_PORT,
            allow_lan: false,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            dns_mode: DEFAULT_DNS_MODE.to_string(),
            enable_ipv6: false,
            custom_rules: Vec::new(),
        }
    }
}

impl GenerationOptions {
    /// Replace zero ports and blank strings with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.mixed_port == 0 {
            self.mixed_port = DEFAULT_MIXED_PORT;
        }
        if self.controller_port == 0 {
            self.controller_port = DEFAULT_CONTROLLER_PORT;
        }
        if self.log_level.trim().is_empty() {
            self.log_level = DEFAULT_LOG_LEVEL.to_string();
        }
        if self.dns_mode.trim().is_empty() {
            self.dns_mode = DEFAULT_DNS_MODE.to_string();
        }
        self
    }

    /// Split a pasted rules block into lines.
    pub fn with_rules_text(mut self, text: &str) -> Self {
        self.custom_rules = text.lines().map(str::to_string).collect();
        self
    }
}

/// Custom rules as sent by a client: one multi-line string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RulesInput {
    Text(String),
    Lines(Vec<String>),
}

impl RulesInput {
    pub fn into_lines(self) -> Vec<String> {
        match self {
            Self::Text(text) => text.lines().map(str::to_string).collect(),
            Self::Lines(lines) => lines,
        }
    }
}

fn rules_from_text_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    RulesInput::deserialize(deserializer).map(RulesInput::into_lines)
}

/// Render a config stamped with the current local time.
pub fn render(nodes: &[ProxyNode], options: &GenerationOptions, config_name: &str) -> String {
    let generated_at = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
    render_at(nodes, options, config_name, &generated_at)
}

/// Render a config with an explicit timestamp string.
pub fn render_at(
    nodes: &[ProxyNode],
    options: &GenerationOptions,
    config_name: &str,
    generated_at: &str,
) -> String {
    let mut yaml = String::with_capacity(2048 + nodes.len() * 256);

    // Header comment. Newlines in the name would end the comment early.
    yaml.push_str(&format!(
        "# Clash config - {}\n\
         # Generated at: {}\n\
         # Generated by clashlink\n\n",
        single_line(config_name),
        single_line(generated_at)
    ));

    // Global settings.
    yaml.push_str(&format!(
        "mixed-port: {}\n\
         allow-lan: {}\n\
         bind-address: '*'\n\
         mode: rule\n\
         log-level: {}\n\
         external-controller: '127.0.0.1:{}'\n\n",
        options.mixed_port,
        options.allow_lan,
        yaml_scalar(&options.log_level),
        options.controller_port
    ));

    append_dns(&mut yaml, options);

    yaml.push_str("proxies:");
    if nodes.is_empty() {
        yaml.push_str(" []\n");
    } else {
        yaml.push('\n');
        for node in nodes {
            append_proxy_yaml(&mut yaml, node);
        }
    }

    append_proxy_groups(&mut yaml, nodes);
    append_rules(&mut yaml, &options.custom_rules);

    yaml
}

fn append_dns(yaml: &mut String, options: &GenerationOptions) {
    yaml.push_str("dns:\n  enable: true\n");
    yaml.push_str(&format!("  ipv6: {}\n", options.enable_ipv6));
    yaml.push_str("  default-nameserver:\n");
    for ns in DEFAULT_NAMESERVERS {
        yaml.push_str(&format!("    - {ns}\n"));
    }
    yaml.push_str(&format!("  enhanced-mode: {}\n", yaml_scalar(&options.dns_mode)));
    yaml.push_str(&format!("  fake-ip-range: {FAKE_IP_RANGE}\n"));
    yaml.push_str("  use-hosts: true\n");
    yaml.push_str("  nameserver:\n");
    for ns in DOH_NAMESERVERS {
        yaml.push_str(&format!("    - {ns}\n"));
    }
    yaml.push('\n');
}

/// Append one node as a `proxies` list entry.
fn append_proxy_yaml(yaml: &mut String, node: &ProxyNode) {
    yaml.push_str(&format!("  - name: {}\n", quoted(&node.name)));
    yaml.push_str(&format!("    type: {}\n", node.kind));
    yaml.push_str(&format!("    server: {}\n", yaml_scalar(&node.server)));
    yaml.push_str(&format!("    port: {}\n", node.port));
    yaml.push_str(&format!("    uuid: {}\n", yaml_scalar(&node.identity)));

    if node.kind == NodeKind::VMess {
        yaml.push_str(&format!("    alterId: {}\n", node.alter_id));
        yaml.push_str(&format!("    cipher: {}\n", yaml_scalar(&node.cipher)));
    }

    match &node.transport {
        TransportOptions::Tcp => {}
        TransportOptions::Ws { path, host } => {
            yaml.push_str("    network: ws\n");
            yaml.push_str("    ws-opts:\n");
            yaml.push_str(&format!("      path: {}\n", yaml_scalar(path_or_root(path))));
            if let Some(host) = host.as_deref().filter(|h| !h.is_empty()) {
                yaml.push_str("      headers:\n");
                yaml.push_str(&format!("        Host: {}\n", yaml_scalar(host)));
            }
        }
        TransportOptions::Grpc { service_name, .. } => {
            yaml.push_str("    network: grpc\n");
            yaml.push_str("    grpc-opts:\n");
            yaml.push_str(&format!(
                "      grpc-service-name: {}\n",
                yaml_scalar(service_name)
            ));
        }
        TransportOptions::H2 { path, host } => {
            yaml.push_str("    network: h2\n");
            yaml.push_str("    h2-opts:\n");
            if let Some(host) = host.as_deref().filter(|h| !h.is_empty()) {
                yaml.push_str("      host:\n");
                yaml.push_str(&format!("        - {}\n", yaml_scalar(host)));
            }
            yaml.push_str(&format!("      path: {}\n", yaml_scalar(path_or_root(path))));
        }
        TransportOptions::Http { path, host, method } => {
            yaml.push_str("    network: http\n");
            yaml.push_str("    http-opts:\n");
            yaml.push_str(&format!("      method: {}\n", yaml_scalar(method)));
            yaml.push_str("      path:\n");
            yaml.push_str(&format!("        - {}\n", yaml_scalar(path_or_root(path))));
            if let Some(host) = host.as_deref().filter(|h| !h.is_empty()) {
                yaml.push_str("      headers:\n");
                yaml.push_str("        Host:\n");
                yaml.push_str(&format!("          - {}\n", yaml_scalar(host)));
            }
        }
    }

    if node.tls.enabled {
        yaml.push_str("    tls: true\n");
        if let Some(sni) = node.tls.sni.as_deref().filter(|s| !s.is_empty()) {
            yaml.push_str(&format!("    servername: {}\n", yaml_scalar(sni)));
        }
        if node.tls.skip_cert_verify {
            yaml.push_str("    skip-cert-verify: true\n");
        }
        if let Some(fp) = node.tls.fingerprint.as_deref().filter(|s| !s.is_empty()) {
            yaml.push_str(&format!("    client-fingerprint: {}\n", yaml_scalar(fp)));
        }
        if let Some(reality) = &node.tls.reality {
            yaml.push_str("    reality-opts:\n");
            yaml.push_str(&format!(
                "      public-key: {}\n",
                yaml_scalar(&reality.public_key)
            ));
            if let Some(sid) = reality.short_id.as_deref().filter(|s| !s.is_empty()) {
                yaml.push_str(&format!("      short-id: {}\n", yaml_scalar(sid)));
            }
        }
    }

    if let Some(flow) = node.flow.as_deref().filter(|f| !f.is_empty()) {
        yaml.push_str(&format!("    flow: {}\n", yaml_scalar(flow)));
    }

    yaml.push_str("    udp: true\n\n");
}

fn append_proxy_groups(yaml: &mut String, nodes: &[ProxyNode]) {
    yaml.push_str("proxy-groups:\n");

    yaml.push_str(&format!("  - name: {}\n", quoted(SELECTOR_GROUP_NAME)));
    yaml.push_str("    type: select\n");
    yaml.push_str("    proxies:\n");
    yaml.push_str(&format!("      - {}\n", quoted(AUTO_GROUP_NAME)));
    yaml.push_str(&format!("      - {}\n", quoted(DIRECT_GROUP_NAME)));
    for node in nodes {
        yaml.push_str(&format!("      - {}\n", quoted(&node.name)));
    }

    yaml.push_str(&format!("  - name: {}\n", quoted(AUTO_GROUP_NAME)));
    yaml.push_str("    type: url-test\n");
    yaml.push_str(&format!("    url: {URL_TEST_PROBE_URL}\n"));
    yaml.push_str(&format!("    interval: {URL_TEST_INTERVAL_SECS}\n"));
    yaml.push_str(&format!("    tolerance: {URL_TEST_TOLERANCE_MS}\n"));
    yaml.push_str("    proxies:");
    if nodes.is_empty() {
        yaml.push_str(" []\n");
    } else {
        yaml.push('\n');
        for node in nodes {
            yaml.push_str(&format!("      - {}\n", quoted(&node.name)));
        }
    }

    yaml.push_str(&format!("  - name: {}\n", quoted(DIRECT_GROUP_NAME)));
    yaml.push_str("    type: select\n");
    yaml.push_str("    proxies:\n");
    yaml.push_str("      - \"DIRECT\"\n");
    yaml.push_str(&format!("      - {}\n\n", quoted(SELECTOR_GROUP_NAME)));
}

fn append_rules(yaml: &mut String, custom_rules: &[String]) {
    yaml.push_str("rules:\n");
    for rule in BYPASS_RULES {
        yaml.push_str(&format!("  - {rule}\n"));
    }
    yaml.push_str(&format!("  - DOMAIN-SUFFIX,cn,{DIRECT_GROUP_NAME}\n"));
    yaml.push_str(&format!("  - GEOIP,CN,{DIRECT_GROUP_NAME}\n"));

    let custom = custom_rule_lines(custom_rules);
    if !custom.is_empty() {
        yaml.push_str("  # custom rules\n");
        for rule in custom {
            yaml.push_str(&format!("  - {}\n", yaml_scalar(rule)));
        }
    }

    yaml.push_str(&format!("  - MATCH,{SELECTOR_GROUP_NAME}\n"));
}

/// User rule lines that survive filtering: trimmed, without a leading `-`
/// list marker, no blanks, no comments. Every Clash rule is at least
/// `TYPE,target`, so lines without a comma are dropped too.
pub fn custom_rule_lines(rules: &[String]) -> Vec<&str> {
    rules
        .iter()
        .map(|r| r.trim())
        .map(|r| r.strip_prefix('-').map_or(r, str::trim))
        .filter(|r| !r.is_empty() && !r.starts_with('#') && r.contains(','))
        .collect()
}

fn single_line(s: &str) -> String {
    s.replace(['\r', '\n'], " ")
}

/// Emit `s` as a plain YAML scalar when that is unambiguous, otherwise as a
/// double-quoted string.
fn yaml_scalar(s: &str) -> String {
    if needs_quotes(s) {
        quoted(s)
    } else {
        s.to_string()
    }
}

fn needs_quotes(s: &str) -> bool {
    const INDICATORS: &[char] = &[
        '-', '?', ':', ',', '[', ']', '{', '}', '#', '&', '*', '!', '|', '>', '\'', '"', '%',
        '@', '`',
    ];
    // YAML 1.1 booleans, null and the special floats.
    const RESERVED: &[&str] = &[
        "true", "false", "yes", "no", "y", "n", "on", "off", "null", "~", ".inf", "+.inf",
        "-.inf", ".nan",
    ];

    let Some(first) = s.chars().next() else {
        return true;
    };
    INDICATORS.contains(&first)
        || first.is_whitespace()
        || s.ends_with(char::is_whitespace)
        || s.contains(':')
        || s.contains(" #")
        || s.chars().any(char::is_control)
        || RESERVED.iter().any(|r| r.eq_ignore_ascii_case(s))
        || s.parse::<f64>().is_ok()
}

/// Double-quoted YAML string.
fn quoted(s: &str) -> String {
    format!("\"{}\"", escape_yaml_string(s))
}

/// Escape special characters for YAML double-quoted strings.
fn escape_yaml_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}
