//! edgedev command line entry point.

use anyhow::Context;
use clap::Parser;
use edgedev::edge_functions::ProcessBundler;
use edgedev::events::LifecycleEvent;
use edgedev::functions::{DirectoryLister, ProcessRuntime};
use edgedev::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// Local development proxy for edge functions, functions and redirects.
#[derive(Debug, Parser)]
#[command(name = "edgedev", version, about)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "edgedev.toml")]
    config: PathBuf,
    /// Port of the primary listener.
    #[arg(short, long, env = "EDGEDEV_PORT")]
    port: Option<u16>,
    /// Project directory.
    #[arg(short, long)]
    dir: Option<PathBuf>,
    /// Port of the framework dev server to proxy to.
    #[arg(long)]
    target_port: Option<u16>,
    /// Verbose logging.
    #[arg(long)]
    debug: bool,
    /// Never reach out to remote services.
    #[arg(long)]
    offline: bool,
}

fn load_config(cli: &Cli) -> anyhow::Result<DevConfig> {
    let path = match &cli.dir {
        Some(dir) if cli.config.is_relative() => dir.join(&cli.config),
        _ => cli.config.clone(),
    };
    let mut config = if path.exists() {
        DevConfig::from_file(&path)?
    } else {
        DevConfig::new()
    };
    config = config.with_env_overrides()?;

    if let Some(dir) = &cli.dir {
        config = config.project_dir(dir);
    }
    if let Some(port) = cli.port {
        config = config.port(port);
    }
    if let Some(port) = cli.target_port {
        config = config.framework_port(port);
    }
    config.debug |= cli.debug;
    config.offline |= cli.offline;

    for (key, value) in std::env::vars() {
        config.env.entry(key).or_insert(value);
    }
    Ok(config)
}

fn log_events(mut events: broadcast::Receiver<LifecycleEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!("{:?}", event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!("Missed {} lifecycle events", missed)
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = load_config(&cli).context("failed to load configuration")?;

    let geo = Arc::new(GeoContext::new(
        GeoResolver::new(&config.project_dir, Box::new(HttpGeoLookup::new())),
        &config.geo,
        config.offline,
    ));

    let functions = FunctionsRegistry::new(
        Arc::new(DirectoryLister),
        vec![Arc::new(ProcessRuntime::new(config.env.clone()))],
        FunctionsRegistrySettings::from_config(&config),
    );
    log_events(functions.subscribe());
    let functions_server = Arc::new(FunctionsServer::new(
        functions.clone(),
        AdapterSettings::from_config(&config),
        geo.clone(),
    ));

    let bundler = config
        .edge_functions
        .enabled
        .then(|| ProcessBundler::from_config(&config))
        .flatten();
    if config.edge_functions.enabled && bundler.is_none() {
        tracing::warn!("No edge functions bundler command configured, edge functions are disabled");
    }
    let edge_functions = bundler.map(|bundler| {
        EdgeFunctionsRegistry::new(Arc::new(bundler), EdgeRegistrySettings::from_config(&config))
    });
    let edge_proxy = edge_functions.as_ref().map(|registry| {
        log_events(registry.subscribe());
        Arc::new(EdgeFunctionsProxy::new(
            registry.clone(),
            EdgeProxySettings::from_config(&config),
            geo.clone(),
        ))
    });

    let router = Router::new(
        RouterSettings::from_config(&config),
        Arc::new(NoRules),
        edge_proxy,
        Some(functions_server),
    );

    let mut server = DevServer::new(config, router).with_functions(functions);
    if let Some(registry) = edge_functions {
        server = server.with_edge_functions(registry);
    }
    server.run().await?;
    Ok(())
}
