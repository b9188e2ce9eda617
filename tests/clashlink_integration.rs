//! End-to-end tests for the parse → probe → render → store pipeline.
//!
//! Probes only ever target listeners bound on 127.0.0.1 by the test itself.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use clashlink::clash::{
    render_at, GenerationOptions, HealthChecker, LinkParser, NodeKind, ProbeState,
    TransportOptions, SELECTOR_GROUP_NAME,
};
use clashlink::generate::{self, GenerateError, GenerateRequest};
use clashlink::{Owner, SubscriptionStore};

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn vmess_link(json: serde_json::Value) -> String {
    format!("vmess://{}", STANDARD.encode(json.to_string()))
}

fn sample_links() -> String {
    let vmess = vmess_link(serde_json::json!({
        "v": "2",
        "ps": "HK-01",
        "add": "hk.example.com",
        "port": "443",
        "id": "b831381d-6324-4d53-ad4f-8cda48b30811",
        "aid": "0",
        "net": "ws",
        "path": "/ray",
        "host": "cdn.example.com",
        "tls": "tls"
    }));
    let vless = "vless://11111111-2222-3333-4444-555555555555@jp.example.com:8443\
                 ?type=grpc&security=reality&sni=www.microsoft.com&pbk=PUBKEY&sid=ab12\
                 &serviceName=gun-svc&flow=xtls-rprx-vision#JP%20Reality";
    format!("{vmess}\n\n# comment line\n{vless}\ntrojan://nope@x:1\n")
}

fn parse_yaml(content: &str) -> serde_yaml::Value {
    serde_yaml::from_str(content).expect("generated config must be valid YAML")
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing + rendering
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn mixed_batch_parses_in_order_and_reports_rejects() {
    let report = LinkParser::parse_links(&sample_links()).unwrap();

    assert_eq!(report.nodes.len(), 2);
    assert_eq!(report.nodes[0].kind, NodeKind::VMess);
    assert_eq!(report.nodes[0].name, "HK-01");
    assert_eq!(report.nodes[1].kind, NodeKind::VLess);
    assert_eq!(report.nodes[1].name, "JP Reality");
    assert!(matches!(
        report.nodes[1].transport,
        TransportOptions::Grpc { ref service_name, .. } if service_name == "gun-svc"
    ));

    let rejected: Vec<usize> = report.errors.iter().map(|e| e.line).collect();
    assert_eq!(rejected, vec![3, 5]);
}

#[test]
fn rendered_config_is_valid_clash_yaml() {
    let report = LinkParser::parse_links(&sample_links()).unwrap();
    let options = GenerationOptions::default().with_rules_text("DOMAIN-SUFFIX,corp.example,DIRECT");
    let yaml = render_at(&report.nodes, &options, "integration", "2024-01-01 00:00:00");
    let doc = parse_yaml(&yaml);

    assert_eq!(doc["mixed-port"].as_u64(), Some(7890));
    assert_eq!(doc["dns"]["enhanced-mode"].as_str(), Some("fake-ip"));

    let proxies = doc["proxies"].as_sequence().unwrap();
    assert_eq!(proxies.len(), 2);
    assert_eq!(proxies[0]["type"].as_str(), Some("vmess"));
    assert_eq!(proxies[0]["ws-opts"]["path"].as_str(), Some("/ray"));
    assert_eq!(proxies[0]["ws-opts"]["headers"]["Host"].as_str(), Some("cdn.example.com"));
    assert_eq!(proxies[0]["tls"].as_bool(), Some(true));
    assert_eq!(proxies[1]["type"].as_str(), Some("vless"));
    assert_eq!(proxies[1]["name"].as_str(), Some("JP Reality"));
    assert_eq!(proxies[1]["grpc-opts"]["grpc-service-name"].as_str(), Some("gun-svc"));
    assert_eq!(proxies[1]["reality-opts"]["public-key"].as_str(), Some("PUBKEY"));
    assert_eq!(proxies[1]["flow"].as_str(), Some("xtls-rprx-vision"));

    let groups = doc["proxy-groups"].as_sequence().unwrap();
    assert_eq!(groups.len(), 3);
    assert_eq!(groups[0]["name"].as_str(), Some(SELECTOR_GROUP_NAME));

    let rules: Vec<&str> = doc["rules"]
        .as_sequence()
        .unwrap()
        .iter()
        .filter_map(|r| r.as_str())
        .collect();
    assert!(rules.contains(&"DOMAIN-SUFFIX,corp.example,DIRECT"));
    assert_eq!(rules.last(), Some(&format!("MATCH,{SELECTOR_GROUP_NAME}").as_str()));
}

#[test]
fn empty_node_list_still_renders_valid_yaml() {
    let yaml = render_at(&[], &GenerationOptions::default(), "empty", "now");
    let doc = parse_yaml(&yaml);
    assert_eq!(doc["proxies"].as_sequence().map(Vec::len), Some(0));
}

#[test]
fn hostile_names_stay_inside_their_scalar() {
    let link = "vless://u@h.example.com:443#%22evil%22%0Arules%3A%20%5B%5D";
    let report = LinkParser::parse_links(link).unwrap();
    let yaml = render_at(&report.nodes, &GenerationOptions::default(), "x", "now");
    let doc = parse_yaml(&yaml);
    assert_eq!(
        doc["proxies"][0]["name"].as_str(),
        Some("\"evil\"\nrules: []")
    );
    assert!(doc["rules"].as_sequence().unwrap().len() > 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Probe + pipeline
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn probe_reports_local_listener_online() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let live = listener.local_addr().unwrap().port();
    let dead = free_port().await;
    let links = format!("vless://u@127.0.0.1:{live}#live\nvless://u@127.0.0.1:{dead}#dead");

    let report = LinkParser::parse_links(&links).unwrap();
    let statuses = HealthChecker::check_all(&report.nodes).await;

    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].node.name, "live");
    assert_eq!(statuses[0].state, ProbeState::Online);
    assert!(statuses[0].latency_ms >= 0);
    assert_eq!(statuses[1].node.name, "dead");
    assert_ne!(statuses[1].state, ProbeState::Online);
    assert_eq!(statuses[1].latency_ms, -1);
}

#[tokio::test]
async fn generate_then_reset_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = SubscriptionStore::new(dir.path());
    let owner = Owner::new("dave").unwrap();
    let request = GenerateRequest {
        links: sample_links(),
        ..GenerateRequest::default()
    };

    let first = generate::generate(&request, &GenerationOptions::default(), &owner, &store)
        .await
        .unwrap();
    let filename = first.filename.clone().unwrap();
    assert_eq!(first.node_count, 2);
    assert_eq!(first.parse_errors.len(), 2);
    parse_yaml(&store.load(&filename).await.unwrap());

    let named = GenerateRequest {
        config_name: Some("keep-me".into()),
        ..request
    };
    generate::generate(&named, &GenerationOptions::default(), &owner, &store)
        .await
        .unwrap();

    assert_eq!(store.reset(&owner).await.unwrap(), 1);
    assert!(store.load(&filename).await.is_err());
    assert!(store.load("keep-me.yaml").await.is_ok());
}

#[tokio::test]
async fn only_online_without_reachable_nodes_is_reported() {
    let dead = free_port().await;
    let request = GenerateRequest {
        links: format!("vless://u@127.0.0.1:{dead}#dead"),
        only_online: true,
        ..GenerateRequest::default()
    };
    let err = generate::build(&request, &GenerationOptions::default(), &Owner::anonymous())
        .await
        .unwrap_err();
    assert!(matches!(err, GenerateError::NoOnlineNodes { .. }));
}
