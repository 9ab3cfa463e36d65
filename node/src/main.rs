use anyhow::{Context, Result};
use axum::http::HeaderName;
use clap::{value_parser, Arg, ArgAction, Command};
use config::{Config, File as ConfigFile};
use keyledger_keys::KeyOrchestrator;
use keyledger_ledger::{MemoryLedger, RegistryKind, Resource};
use keyledger_rpc::{start_server, AppState, DEFAULT_IDENTITY_HEADER};
use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "config/keyledger.toml";
const LOG_FORMATS: [&str; 2] = ["pretty", "json"];

#[derive(Debug, Clone)]
struct NodeConfig {
    config_path: Option<PathBuf>,
    node_id: String,
    rpc_host: String,
    rpc_port: u16,
    identity_header: String,
    participants: Vec<String>,
    seed_members: Vec<String>,
    log_level: String,
    log_format: String,
    prometheus_enabled: bool,
}

impl NodeConfig {
    fn load(config_path_override: Option<&str>) -> Result<Self> {
        let resolved_path = if let Some(path) = config_path_override {
            let path = PathBuf::from(path);
            if !path.exists() {
                anyhow::bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            Some(path)
        } else {
            let path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if path.exists() {
                Some(path)
            } else {
                None
            }
        };

        let mut builder = Config::builder();

        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }

        builder = builder.add_source(config::Environment::with_prefix("KEYLEDGER"));

        let config = builder.build()?;

        let rpc_port = match get_string_value(&config, &["rpc_port", "rpc.port"]) {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("invalid RPC port {raw:?}"))?,
            None => 8088,
        };

        Ok(Self {
            config_path: resolved_path,
            node_id: get_string_value(&config, &["node_id", "node.id"])
                .unwrap_or_else(|| "keyledger-node".to_string()),
            rpc_host: get_string_value(&config, &["rpc_host", "rpc.host"])
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            rpc_port,
            identity_header: get_string_value(&config, &["identity_header", "rpc.identity_header"])
                .unwrap_or_else(|| DEFAULT_IDENTITY_HEADER.to_string()),
            participants: get_list_value(&config, &["participants", "ledger.participants"])
                .unwrap_or_else(|| vec!["admin".to_string()]),
            seed_members: get_list_value(&config, &["seed_members", "ledger.seed_members"])
                .unwrap_or_default(),
            log_level: get_string_value(&config, &["log_level", "logging.level"])
                .unwrap_or_else(|| "info".to_string()),
            log_format: get_string_value(&config, &["log_format", "logging.format"])
                .unwrap_or_else(|| "pretty".to_string()),
            prometheus_enabled: get_bool_value(
                &config,
                &["prometheus_enabled", "metrics.enabled"],
                true,
            ),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            anyhow::bail!("NODE_ID must not be empty");
        }
        if self.rpc_port == 0 {
            anyhow::bail!("RPC_PORT must be greater than zero");
        }
        if self.participants.is_empty() {
            anyhow::bail!("at least one ledger participant must be configured");
        }
        if !LOG_FORMATS.contains(&self.log_format.as_str()) {
            anyhow::bail!(
                "unsupported log format {:?}, expected one of {:?}",
                self.log_format,
                LOG_FORMATS
            );
        }
        self.identity_header_name()?;
        Ok(())
    }

    fn identity_header_name(&self) -> Result<HeaderName> {
        HeaderName::from_bytes(self.identity_header.to_ascii_lowercase().as_bytes())
            .with_context(|| format!("invalid identity header {:?}", self.identity_header))
    }

    fn rpc_addr(&self) -> String {
        format!("{}:{}", self.rpc_host, self.rpc_port)
    }
}

fn get_string_value(config: &Config, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        config
            .get_string(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn get_list_value(config: &Config, keys: &[&str]) -> Option<Vec<String>> {
    get_string_value(config, keys).map(|value| {
        value
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    })
}

fn get_bool_value(config: &Config, keys: &[&str], default: bool) -> bool {
    for key in keys {
        if let Ok(value) = config.get_bool(key) {
            return value;
        }
        if let Ok(raw) = config.get_string(key) {
            if let Ok(parsed) = raw.parse::<bool>() {
                return parsed;
            }
        }
    }
    default
}

fn build_cli() -> Command {
    Command::new("keyledger-node")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Ledger-backed key registry node")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(LOG_FORMATS)
                .help("Select log output format"),
        )
        .arg(
            Arg::new("rpc-host")
                .long("rpc-host")
                .value_name("HOST")
                .help("Override RPC bind host"),
        )
        .arg(
            Arg::new("rpc-port")
                .long("rpc-port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .help("Override RPC port"),
        )
        .arg(
            Arg::new("participant")
                .long("participant")
                .value_name("IDENTITY")
                .action(ArgAction::Append)
                .help("Register an extra ledger participant (repeatable)"),
        )
        .arg(
            Arg::new("disable-metrics")
                .long("disable-metrics")
                .action(ArgAction::SetTrue)
                .help("Disable the Prometheus exporter"),
        )
}

fn load_config_with_overrides(matches: &clap::ArgMatches) -> Result<NodeConfig> {
    let config_path = matches
        .get_one::<String>("config")
        .map(|value| value.as_str());
    let mut config = NodeConfig::load(config_path)?;
    apply_overrides(matches, &mut config);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut NodeConfig) {
    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    if let Some(rpc_host) = matches.get_one::<String>("rpc-host") {
        config.rpc_host = rpc_host.clone();
    }

    if let Some(rpc_port) = matches.get_one::<u16>("rpc-port") {
        config.rpc_port = *rpc_port;
    }

    if let Some(participants) = matches.get_many::<String>("participant") {
        for participant in participants {
            if !config.participants.contains(participant) {
                config.participants.push(participant.clone());
            }
        }
    }

    if matches.get_flag("disable-metrics") {
        config.prometheus_enabled = false;
    }
}

/// In-process ledger with the configured participants and members in place.
fn build_ledger(config: &NodeConfig) -> Result<MemoryLedger> {
    let ledger = MemoryLedger::new();
    for participant in &config.participants {
        ledger.register_participant(participant.clone());
    }
    for member in &config.seed_members {
        ledger
            .seed(Resource::new(RegistryKind::Members, member.clone()))
            .with_context(|| format!("failed to seed member {member}"))?;
    }
    info!(
        participants = config.participants.len(),
        members = config.seed_members.len(),
        "In-memory ledger initialised"
    );
    Ok(ledger)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    let config = load_config_with_overrides(&matches)?;

    init_logging(&config)?;
    if let Some(path) = &config.config_path {
        info!("Loaded configuration from {}", path.display());
    }

    let metrics_handle = init_metrics(&config);
    let ledger = build_ledger(&config)?;

    let state = AppState::new(
        KeyOrchestrator::new(Arc::new(ledger)),
        config.identity_header_name()?,
        config.node_id.clone(),
    )
    .with_metrics(metrics_handle);

    let rpc_addr = config.rpc_addr();
    let rpc_handle = tokio::spawn({
        let rpc_addr = rpc_addr.clone();
        async move {
            if let Err(err) = start_server(state, &rpc_addr).await {
                warn!("RPC server stopped: {err:#}");
            }
        }
    });

    info!("Key registry node {} is ready", config.node_id);
    info!("RPC API available at: http://{}", rpc_addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down key registry node");
    rpc_handle.abort();

    Ok(())
}

fn init_metrics(config: &NodeConfig) -> Option<PrometheusHandle> {
    if !config.prometheus_enabled {
        info!("Prometheus metrics exporter disabled via configuration");
        return None;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("Prometheus metrics exporter registered");
            describe_counter!(
                "keyledger_key_operations_total",
                "Key operations handled, by operation and outcome"
            );
            Some(handle)
        }
        Err(err) => {
            warn!("Failed to install Prometheus metrics exporter: {}", err);
            None
        }
    }
}

fn init_logging(config: &NodeConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}
