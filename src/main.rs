use anyhow::Result;
use clap::Parser;
use mcp_relay::admin::App as AdminApp;
use mcp_relay::apikey::ApiKeyStore;
use mcp_relay::config::LocalConfig;
use mcp_relay::manager::ProxyManager;
use mcp_relay::relay::metrics::Metrics;
use mcp_relay::transport::PluginRegistry;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info};
use tracing_subscriber::{self, EnvFilter};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Use config from an inline JSON string
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Use config from file
	#[arg(short, long, value_name = "file")]
	file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = Args::parse();

	let cfg: LocalConfig = match (args.file, args.config) {
		(Some(filename), None) => {
			let file = tokio::fs::read_to_string(filename).await?;
			serde_json::from_str(&file)?
		},
		(None, Some(config)) => serde_json::from_str(&config)?,
		(Some(_), Some(_)) => {
			eprintln!("config error: both --file and --config cannot be provided, exiting");
			std::process::exit(1);
		},
		(None, None) => LocalConfig::default(),
	};
	debug!(
		"loaded config: {}",
		serde_yaml::to_string(&cfg).unwrap_or_default()
	);

	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(&mut registry));

	let mut plugins = PluginRegistry::new();
	if let Some(plugin_dir) = &cfg.plugin_dir {
		let loaded = plugins.load_manifest_dir(plugin_dir);
		info!(count = loaded, "loaded transport plugin manifests");
	}

	let manager = Arc::new(ProxyManager::new(&cfg, Arc::new(plugins), metrics));
	manager.initialize(cfg.upstreams.clone()).await?;

	let api_keys = Arc::new(ApiKeyStore::in_memory());
	let admin = AdminApp::new(manager.clone(), api_keys);

	let mut run_set = JoinSet::new();

	let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
	info!(addr = %cfg.listen_addr, "serving management api");
	let router = admin
		.router()
		.into_make_service_with_connect_info::<std::net::SocketAddr>();
	run_set.spawn(async move {
		axum::serve(listener, router)
			.await
			.map_err(anyhow::Error::from)
	});

	let metrics_listener = tokio::net::TcpListener::bind(&cfg.metrics_addr).await?;
	info!(addr = %cfg.metrics_addr, "serving metrics");
	let metrics_router = mcp_relay::metrics::router(Arc::new(registry));
	run_set.spawn(async move {
		axum::serve(metrics_listener, metrics_router)
			.await
			.map_err(anyhow::Error::from)
	});

	while let Some(result) = run_set.join_next().await {
		result??;
	}
	manager.shutdown().await;
	Ok(())
}
