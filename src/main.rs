use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncReadExt;

use clashlink::clash::{summarize, HealthChecker, LinkParser, RulesInput};
use clashlink::config::default_config_path;
use clashlink::generate::{self, GenerateRequest, OptionOverrides};
use clashlink::{gateway, logging, AppConfig, Owner, SubscriptionStore};

/// Turn vmess/vless share links into Clash subscriptions.
#[derive(Parser, Debug)]
#[command(name = "clashlink", version, about)]
struct Cli {
    /// Config file (default: ~/.clashlink/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP gateway
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },

    /// Generate a Clash config from a file of share links
    Generate(GenerateArgs),

    /// Probe every node and print a reachability table
    Check {
        /// Links file, `-` for stdin
        #[arg(short, long, default_value = "-")]
        input: String,
        /// Per-node timeout in seconds
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },

    /// Delete every generated subscription of an owner
    Reset {
        #[arg(long, default_value = "anonymous")]
        owner: String,
    },
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// Links file, `-` for stdin
    #[arg(short, long, default_value = "-")]
    input: String,
    /// Probe nodes before rendering
    #[arg(long)]
    check: bool,
    /// Keep only nodes that answered the probe
    #[arg(long)]
    only_online: bool,
    /// Config name (also the stored file name)
    #[arg(long)]
    name: Option<String>,
    /// Write the config here instead of stdout
    #[arg(short, long, conflicts_with = "save")]
    output: Option<PathBuf>,
    /// Save into the subscriptions directory
    #[arg(long)]
    save: bool,
    #[arg(long, default_value = "anonymous")]
    owner: String,
    #[arg(long)]
    mixed_port: Option<u16>,
    #[arg(long)]
    controller_port: Option<u16>,
    #[arg(long)]
    allow_lan: bool,
    /// Clash log level written into the config
    #[arg(long)]
    log_level: Option<String>,
    #[arg(long)]
    dns_mode: Option<String>,
    #[arg(long)]
    ipv6: bool,
    /// File with extra rule lines appended before the final MATCH
    #[arg(long)]
    rules: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;
    logging::init(&config.log_level);
    match &config.source {
        Some(path) => tracing::debug!("loaded config from {}", path.display()),
        None => tracing::debug!(
            "no config at {}, using defaults",
            default_config_path().display()
        ),
    }

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            config.validate()?;
            gateway::serve(config).await
        }
        Command::Generate(args) => run_generate(&config, args).await,
        Command::Check {
            input,
            timeout_secs,
        } => run_check(&input, Duration::from_secs(timeout_secs.max(1))).await,
        Command::Reset { owner } => {
            let owner = Owner::new(&owner)?;
            let store = SubscriptionStore::new(&config.storage.subscriptions_dir);
            let deleted = store.reset(&owner).await?;
            println!("deleted {deleted} subscription(s) for {owner}");
            Ok(())
        }
    }
}

async fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut text = String::new();
        tokio::io::stdin()
            .read_to_string(&mut text)
            .await
            .context("failed to read links from stdin")?;
        Ok(text)
    } else {
        tokio::fs::read_to_string(input)
            .await
            .with_context(|| format!("failed to read links from {input}"))
    }
}

async fn run_generate(config: &AppConfig, args: GenerateArgs) -> Result<()> {
    let links = read_input(&args.input).await?;
    let custom_rules = match &args.rules {
        Some(path) => Some(RulesInput::Text(read_rules(path).await?)),
        None => None,
    };

    let request = GenerateRequest {
        links,
        check_nodes: args.check,
        only_online: args.only_online,
        config_name: args.name,
        overrides: OptionOverrides {
            mixed_port: args.mixed_port,
            controller_port: args.controller_port,
            allow_lan: args.allow_lan.then_some(true),
            log_level: args.log_level,
            dns_mode: args.dns_mode,
            enable_ipv6: args.ipv6.then_some(true),
            custom_rules,
        },
    };
    let owner = Owner::new(&args.owner)?;

    let outcome = if args.save {
        let store = SubscriptionStore::new(&config.storage.subscriptions_dir);
        generate::generate(&request, &config.generation, &owner, &store).await?
    } else {
        generate::build(&request, &config.generation, &owner).await?
    };

    if let Some(summary) = outcome.summary {
        eprintln!(
            "probed {} node(s): {} online, {} offline, {} timeout",
            summary.total, summary.online, summary.offline, summary.timeout
        );
    }

    match (&outcome.filename, &args.output) {
        (Some(filename), _) => {
            let path = config.storage.subscriptions_dir.join(filename);
            eprintln!("saved {} node(s) to {}", outcome.node_count, path.display());
        }
        (None, Some(path)) => {
            tokio::fs::write(path, &outcome.content)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("wrote {} node(s) to {}", outcome.node_count, path.display());
        }
        (None, None) => print!("{}", outcome.content),
    }
    Ok(())
}

async fn read_rules(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read rules from {}", path.display()))
}

async fn run_check(input: &str, timeout: Duration) -> Result<()> {
    let text = read_input(input).await?;
    let report = LinkParser::parse_links(&text)?;
    for skipped in &report.errors {
        tracing::warn!("skipped {skipped}");
    }

    let statuses = HealthChecker::check_all_with_timeout(&report.nodes, timeout).await;
    for status in &statuses {
        let latency = if status.is_online() {
            format!("{}ms", status.latency_ms)
        } else {
            "-".to_string()
        };
        println!(
            "{:<8} {:>7}  {}  ({})",
            status.state.to_string(),
            latency,
            status.node.name,
            status.node.address()
        );
    }

    let summary = summarize(&statuses);
    println!(
        "\n{} total, {} online, {} offline, {} timeout",
        summary.total, summary.online, summary.offline, summary.timeout
    );
    Ok(())
}
