//! End-to-end generation: parse links, optionally probe, render, persist.
//!
//! Shared by the HTTP gateway and the CLI so both surfaces behave the same.

use serde::Deserialize;

use crate::clash::{
    online_only, render, summarize, GenerationOptions, HealthChecker, LineError,
    LinkParser, NodeStatus, ProbeSummary, ProxyNode, RulesInput, SubscriptionError,
};
use crate::store::{Owner, StoreError, SubscriptionStore};

/// Per-request option overrides. Anything left out falls back to the
/// configured [`GenerationOptions`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OptionOverrides {
    #[serde(alias = "mixedPort")]
    pub mixed_port: Option<u16>,
    #[serde(alias = "controllerPort")]
    pub controller_port: Option<u16>,
    #[serde(alias = "allowLan")]
    pub allow_lan: Option<bool>,
    #[serde(alias = "logLevel")]
    pub log_level: Option<String>,
    #[serde(alias = "dnsMode")]
    pub dns_mode: Option<String>,
    #[serde(alias = "enableIPv6", alias = "enableIpv6")]
    pub enable_ipv6: Option<bool>,
    #[serde(alias = "customRules")]
    pub custom_rules: Option<RulesInput>,
}

impl OptionOverrides {
    pub fn apply(&self, base: &GenerationOptions) -> GenerationOptions {
        let mut options = base.clone();
        if let Some(port) = self.mixed_port {
            options.mixed_port = port;
        }
        if let Some(port) = self.controller_port {
            options.controller_port = port;
        }
        if let Some(allow_lan) = self.allow_lan {
            options.allow_lan = allow_lan;
        }
        if let Some(level) = &self.log_level {
            options.log_level = level.clone();
        }
        if let Some(mode) = &self.dns_mode {
            options.dns_mode = mode.clone();
        }
        if let Some(ipv6) = self.enable_ipv6 {
            options.enable_ipv6 = ipv6;
        }
        if let Some(rules) = &self.custom_rules {
            options.custom_rules = rules.clone().into_lines();
        }
        options.normalized()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GenerateRequest {
    /// Share links, one per line.
    pub links: String,
    /// Probe every node before rendering.
    #[serde(alias = "checkNodes")]
    pub check_nodes: bool,
    /// Drop nodes that did not answer the probe. Implies `check_nodes`.
    #[serde(alias = "onlyOnline")]
    pub only_online: bool,
    /// Subscription name; a timestamped name is generated when absent.
    #[serde(alias = "configName")]
    pub config_name: Option<String>,
    #[serde(flatten)]
    pub overrides: OptionOverrides,
}

impl GenerateRequest {
    /// Caller-chosen config name, if any.
    fn requested_name(&self) -> Option<&str> {
        self.config_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub config_name: String,
    /// Stored file name; `None` when the config was only rendered.
    pub filename: Option<String>,
    pub content: String,
    /// Proxies in the rendered config.
    pub node_count: usize,
    /// Probe results for every parsed node, when probing ran.
    pub statuses: Option<Vec<NodeStatus>>,
    pub summary: Option<ProbeSummary>,
    /// Lines that were skipped while parsing.
    pub parse_errors: Vec<LineError>,
}

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("please provide at least one share link")]
    EmptyInput,

    #[error(transparent)]
    Parse(#[from] SubscriptionError),

    #[error("no online nodes ({} probed)", .summary.total)]
    NoOnlineNodes {
        statuses: Vec<NodeStatus>,
        summary: ProbeSummary,
    },

    #[error("failed to save subscription: {0}")]
    Store(#[from] StoreError),
}

/// Parse, probe and render without touching the store.
pub async fn build(
    request: &GenerateRequest,
    base: &GenerationOptions,
    owner: &Owner,
) -> Result<GenerateOutcome, GenerateError> {
    if request.links.trim().is_empty() {
        return Err(GenerateError::EmptyInput);
    }

    let report = LinkParser::parse_links(&request.links)?;
    for skipped in &report.errors {
        tracing::warn!("skipped {skipped}");
    }

    let probe = request.check_nodes || request.only_online;
    let (nodes, statuses, summary): (Vec<ProxyNode>, _, _) = if probe {
        let statuses = HealthChecker::check_all(&report.nodes).await;
        let summary = summarize(&statuses);
        let nodes = if request.only_online {
            let online = online_only(&statuses);
            if online.is_empty() {
                return Err(GenerateError::NoOnlineNodes { statuses, summary });
            }
            online
        } else {
            report.nodes
        };
        (nodes, Some(statuses), Some(summary))
    } else {
        (report.nodes, None, None)
    };

    let config_name = request
        .requested_name()
        .map(str::to_string)
        .unwrap_or_else(|| SubscriptionStore::generated_name(owner));

    let options = request.overrides.apply(base);
    let content = render(&nodes, &options, &config_name);
    tracing::info!(
        "rendered '{config_name}' with {} node(s) (probe: {probe})",
        nodes.len()
    );

    Ok(GenerateOutcome {
        config_name,
        filename: None,
        content,
        node_count: nodes.len(),
        statuses,
        summary,
        parse_errors: report.errors,
    })
}

/// [`build`], then save the result under the config name.
///
/// A caller-chosen name replaces any earlier file of that name. Generated
/// names never do; a clash gets a numeric suffix instead.
pub async fn generate(
    request: &GenerateRequest,
    base: &GenerationOptions,
    owner: &Owner,
    store: &SubscriptionStore,
) -> Result<GenerateOutcome, GenerateError> {
    let mut outcome = build(request, base, owner).await?;
    let filename = if request.requested_name().is_some() {
        store.save(&outcome.config_name, &outcome.content).await?
    } else {
        store.save_new(&outcome.config_name, &outcome.content).await?
    };
    outcome.filename = Some(filename);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clash::ProbeState;

    const VLESS_LOCAL: &str = "vless://11111111-2222-3333-4444-555555555555@127.0.0.1:{port}#local";
    const VLESS_DEAD: &str = "vless://11111111-2222-3333-4444-555555555555@127.0.0.1:{port}#dead";

    fn request(links: &str) -> GenerateRequest {
        GenerateRequest {
            links: links.to_string(),
            ..GenerateRequest::default()
        }
    }

    async fn dead_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn empty_input_is_rejected() {
        let err = build(&request("  \n "), &GenerationOptions::default(), &Owner::anonymous())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerateError::EmptyInput));
    }

    #[tokio::test]
    async fn all_lines_invalid_is_parse_error() {
        let err = build(
            &request("ss://abc\ngarbage"),
            &GenerationOptions::default(),
            &Owner::anonymous(),
        )
        .await
        .unwrap_err();
        match err {
            GenerateError::Parse(SubscriptionError::NoValidLinks { errors }) => {
                assert_eq!(errors.len(), 2)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn build_without_probe_keeps_all_nodes() {
        let links = "vless://u@a.example.com:443#a\nnot-a-link\nvless://u@b.example.com:443#b";
        let mut req = request(links);
        req.config_name = Some("mine".into());
        let outcome = build(&req, &GenerationOptions::default(), &Owner::anonymous())
            .await
            .unwrap();
        assert_eq!(outcome.config_name, "mine");
        assert_eq!(outcome.node_count, 2);
        assert_eq!(outcome.parse_errors.len(), 1);
        assert_eq!(outcome.parse_errors[0].line, 2);
        assert!(outcome.statuses.is_none());
        assert!(outcome.filename.is_none());
        assert!(outcome.content.contains("# Clash config - mine"));
    }

    #[tokio::test]
    async fn only_online_filters_dead_nodes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap().port();
        let dead = dead_port().await;
        let links = format!(
            "{}\n{}",
            VLESS_LOCAL.replace("{port}", &live.to_string()),
            VLESS_DEAD.replace("{port}", &dead.to_string())
        );
        let mut req = request(&links);
        req.only_online = true;

        let outcome = build(&req, &GenerationOptions::default(), &Owner::anonymous())
            .await
            .unwrap();
        assert_eq!(outcome.node_count, 1);
        let statuses = outcome.statuses.unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].state, ProbeState::Online);
        assert_ne!(statuses[1].state, ProbeState::Online);
        assert_eq!(outcome.summary.unwrap().online, 1);
        assert!(outcome.content.contains("\"local\""));
        assert!(!outcome.content.contains("\"dead\""));
    }

    #[tokio::test]
    async fn only_online_with_nothing_online_fails() {
        let dead = dead_port().await;
        let mut req = request(&VLESS_DEAD.replace("{port}", &dead.to_string()));
        req.only_online = true;
        let err = build(&req, &GenerationOptions::default(), &Owner::anonymous())
            .await
            .unwrap_err();
        match err {
            GenerateError::NoOnlineNodes { statuses, summary } => {
                assert_eq!(statuses.len(), 1);
                assert_eq!(summary.total, 1);
                assert_eq!(summary.online, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn generate_saves_to_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SubscriptionStore::new(dir.path());
        let owner = Owner::new("alice").unwrap();
        let outcome = generate(
            &request("vless://u@a.example.com:443#a"),
            &GenerationOptions::default(),
            &owner,
            &store,
        )
        .await
        .unwrap();
        let filename = outcome.filename.unwrap();
        assert!(filename.starts_with("clash_config_alice_"));
        assert_eq!(store.load(&filename).await.unwrap(), outcome.content);
    }

    #[tokio::test]
    async fn back_to_back_generates_keep_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SubscriptionStore::new(dir.path());
        let owner = Owner::new("alice").unwrap();
        let base = GenerationOptions::default();

        let first = generate(&request("vless://u@a.example.com:443#first"), &base, &owner, &store)
            .await
            .unwrap();
        let second = generate(&request("vless://u@b.example.com:443#second"), &base, &owner, &store)
            .await
            .unwrap();

        let first_file = first.filename.unwrap();
        let second_file = second.filename.unwrap();
        assert_ne!(first_file, second_file);
        assert!(second_file.starts_with("clash_config_alice_"));
        assert!(store.load(&first_file).await.unwrap().contains("\"first\""));
        assert!(store.load(&second_file).await.unwrap().contains("\"second\""));
        assert_eq!(store.reset(&owner).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn invalid_config_name_is_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SubscriptionStore::new(dir.path());
        let mut req = request("vless://u@a.example.com:443#a");
        req.config_name = Some("../escape".into());
        let err = generate(&req, &GenerationOptions::default(), &Owner::anonymous(), &store)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerateError::Store(StoreError::InvalidName(_))));
    }

    #[test]
    fn overrides_fall_back_to_base() {
        let base = GenerationOptions {
            mixed_port: 7000,
            ..GenerationOptions::default()
        };
        let overrides = OptionOverrides {
            controller_port: Some(9999),
            custom_rules: Some(RulesInput::Text("DOMAIN,a.com,DIRECT\n".into())),
            ..OptionOverrides::default()
        };
        let options = overrides.apply(&base);
        assert_eq!(options.mixed_port, 7000);
        assert_eq!(options.controller_port, 9999);
        assert_eq!(options.custom_rules, vec!["DOMAIN,a.com,DIRECT".to_string()]);
    }

    #[test]
    fn request_accepts_camel_case_body() {
        let req: GenerateRequest = serde_json::from_value(serde_json::json!({
            "links": "vless://u@h:1",
            "checkNodes": true,
            "onlyOnline": false,
            "configName": "cfg",
            "mixedPort": 7891,
            "allowLan": true,
            "customRules": ["DOMAIN,a.com,DIRECT"]
        }))
        .unwrap();
        assert!(req.check_nodes);
        assert_eq!(req.config_name.as_deref(), Some("cfg"));
        assert_eq!(req.overrides.mixed_port, Some(7891));
        assert_eq!(req.overrides.allow_lan, Some(true));
        assert!(req.overrides.custom_rules.is_some());
        assert!(req.overrides.dns_mode.is_none());
    }
}
