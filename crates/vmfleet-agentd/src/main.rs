use std::{sync::Arc, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vmfleet_core::{FleetController, connector::MockConnector, metrics::MetricsHandle};
use vmfleet_model::{
    DeployTarget, FleetConfig, ImageDescriptor, ProviderInstance, ProviderState, Tags, UserData,
};
use vmfleet_observe::{LoggerConfig, LoggingListener, init_logger};
use vmfleet_prometheus::PrometheusMetrics;

/// Daemon configuration file, JSON, every section optional.
#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DaemonConfig {
    logger: LoggerConfig,
    fleet: FleetConfig,
    image: ImageDescriptor,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            logger: LoggerConfig::default(),
            fleet: FleetConfig::default(),
            image: demo_image(),
        }
    }
}

fn demo_image() -> ImageDescriptor {
    ImageDescriptor {
        source_id: "linux-agents".into(),
        target: DeployTarget::Image {
            image_id: "/images/build-agent-2024".into(),
        },
        region: "westeurope".into(),
        network_id: "build-net".into(),
        subnet_id: "agents".into(),
        max_instances: 2,
        name_prefix: "agent-".into(),
        vm_size: "Standard_B2s".into(),
        reuse_stopped: true,
        os_type: None,
        tags: Tags::new(),
        identity: None,
    }
}

/// JSON schema of the fleet and image sections of the config file.
fn config_schema() -> serde_json::Value {
    serde_json::json!({
        "fleet": schemars::schema_for!(FleetConfig),
        "image": schemars::schema_for!(ImageDescriptor),
    })
}

fn load_config(arg: Option<String>) -> anyhow::Result<DaemonConfig> {
    match arg {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config {path}"))
        }
        None => Ok(DaemonConfig::default()),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    // 1) config + logger
    let arg = std::env::args().nth(1);
    if arg.as_deref() == Some("--schema") {
        println!("{}", serde_json::to_string_pretty(&config_schema())?);
        return Ok(());
    }
    let cfg = load_config(arg)?;
    init_logger(&cfg.logger)?;
    info!(profile = %cfg.fleet.profile_id, "logger initialized");

    // 2) provider with one leftover instance from a previous run
    let connector = Arc::new(MockConnector::new().with_latency(Duration::from_millis(200)));
    connector.insert_instance(
        cfg.image.instance_name(1),
        ProviderInstance::new(ProviderState::Stopped).with_source_hash(cfg.image.source_hash()),
    );

    // 3) metrics + controller
    let metrics = PrometheusMetrics::new()?;
    let handle: MetricsHandle = Arc::new(metrics.clone());
    let fleet = Arc::new(
        FleetController::builder(cfg.image, connector)
            .with_config(cfg.fleet)
            .with_metrics(handle)
            .with_listener(Arc::new(LoggingListener))
            .build()?,
    );

    // 4) adopt what the provider already runs
    let adopted = fleet.reconcile().await?;
    info!(adopted, "inventory reconciled");

    // 5) start in the foreground, launch in the background
    let first = fleet
        .start_new_instance(UserData::new().with("POOL", "default"))
        .await?;
    let pending = fleet.launch_new_instance(UserData::new(), CancellationToken::new())?;
    let second = pending.wait().await?;
    info!(
        first = first.name(),
        second = second.name(),
        used = fleet.capacity_used(),
        "instances running"
    );

    if let Err(err) = fleet.start_new_instance(UserData::new()).await {
        warn!(error = %err, "start rejected");
    }

    // 6) tear down
    for instance in [first, second] {
        fleet.terminate_instance(&instance).await?;
    }

    println!("{}", metrics.encode_text()?);
    Ok(())
}
