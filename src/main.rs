use std::{fs::File, io::prelude::*, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Error};
use structopt::StructOpt;

use offpeak_ev_charging::broker::TokenBroker;
use offpeak_ev_charging::pricing::PricingClient;
use offpeak_ev_charging::scheduler::HttpSchedulerClient;
use offpeak_ev_charging::scout;
use offpeak_ev_charging::sheet::HttpSheetClient;
use offpeak_ev_charging::store::{FileSecretStore, FileStore, SecretStore};
use offpeak_ev_charging::tesla::Gateway;
use offpeak_ev_charging::worker::{self, WorkerContext};
use offpeak_ev_charging::{Config, Validate};

#[derive(Debug, StructOpt)]
struct Opt {
    /// Command
    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Generate a default configuration file.
    GenerateConfig {
        /// Output path for default config file
        #[structopt(short, long, parse(from_os_str))]
        output: PathBuf,
    },
    /// Run a single scout poll: read vehicle state, trigger the worker if
    /// something actionable changed, persist, exit.
    Scout {
        /// Config file path
        #[structopt(short, long, parse(from_os_str))]
        config: PathBuf,
    },
    /// Run the long-lived worker service.
    Worker {
        /// Config file path
        #[structopt(short, long, parse(from_os_str))]
        config: PathBuf,
        /// Prometheus endpoint address
        #[structopt(short, long)]
        prometheus_endpoint: Option<SocketAddr>,
    },
}

fn load_config(path: PathBuf) -> Result<Config, Error> {
    let mut buf = String::new();
    File::open(&path)
        .with_context(|| format!("opening config {}", path.display()))?
        .read_to_string(&mut buf)?;
    toml::from_str::<Config>(&buf)
        .context("parsing config")?
        .validate()
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let opt = Opt::from_args();
    match opt.cmd {
        Command::GenerateConfig { output } => {
            let config_toml = toml::to_string_pretty(&Config::default())?;
            File::create(output)?.write_all(config_toml.as_bytes())?;
        }
        Command::Scout { config } => {
            let config = load_config(config)?;
            let store = Arc::new(FileStore::open(&config.charging.state_path)?);
            let secrets = Arc::new(FileSecretStore::new(config.oauth.token_path.clone()));

            let report = scout::run(&config, store, secrets).await?;
            println!("{}", serde_json::to_string(&report)?);
        }
        Command::Worker {
            config,
            prometheus_endpoint,
        } => {
            if let Some(addr) = prometheus_endpoint {
                metrics_exporter_prometheus::PrometheusBuilder::new()
                    .listen_address(addr)
                    .install()
                    .unwrap();
            }
            let config = load_config(config)?;
            start_worker(config).await?;
        }
    }

    Ok(())
}

async fn start_worker(config: Config) -> Result<(), Error> {
    let secrets: Arc<dyn SecretStore> =
        Arc::new(FileSecretStore::new(config.oauth.token_path.clone()));
    let broker = Arc::new(TokenBroker::new(config.oauth.clone(), secrets.clone()));

    tracing::info!("connecting to vehicle API");
    let gateway = Gateway::connect(
        config.home.clone(),
        config.proxy.clone(),
        config.charging.vin.clone(),
        broker.clone(),
    )
    .await?;

    let store = Arc::new(FileStore::open(&config.charging.state_path)?);
    let pricing = Arc::new(PricingClient::new(
        config.pricing.clone(),
        config.charging.battery_capacity_kwh,
    ));
    let sheet = Arc::new(HttpSheetClient::new(config.sheet.clone()));
    let scheduler = Arc::new(HttpSchedulerClient::new(
        &config.scheduler,
        config.worker.auth_token.clone(),
    ));

    let ctx = Arc::new(WorkerContext::new(
        config,
        Arc::new(gateway),
        store,
        secrets,
        broker,
        pricing,
        sheet,
        scheduler,
    ));

    worker::serve(ctx).await
}
