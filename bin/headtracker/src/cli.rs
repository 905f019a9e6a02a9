//! Contains the head tracker CLI.

use crate::{
    flags::{FilterArgs, MetricsArgs, TrackerArgs},
    provider::AlloyChainClient,
};
use alloy_primitives::ChainId;
use anyhow::{Result, bail};
use clap::{ArgAction, Parser};
use kona_headtracker::{
    HeadTrackerConfig, HeadTrackerMetrics, HeadTrackerService, Metrics, NoopMetrics,
};
use kona_headtracker_storage::InMemoryHeadSaver;
use kona_headtracker_types::BlockHead;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

/// Chain head tracker CLI.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Verbosity level. Repeat to increase (`-v` debug, `-vv` trace).
    #[arg(short = 'v', action = ArgAction::Count, global = true)]
    pub v: u8,
    /// Websocket URL of the execution client RPC API.
    #[arg(long, visible_alias = "ws", env = "HEADTRACKER_WS_RPC")]
    pub ws_rpc: Url,
    /// The chain ID every received head must belong to.
    #[arg(long, short = 'c', env = "HEADTRACKER_CHAIN_ID")]
    pub chain_id: ChainId,
    /// Head tracking arguments.
    #[command(flatten)]
    pub tracker: TrackerArgs,
    /// Log filter arguments.
    #[command(flatten)]
    pub filter: FilterArgs,
    /// Prometheus metrics arguments.
    #[command(flatten)]
    pub metrics: MetricsArgs,
}

impl Cli {
    /// Runs the CLI.
    pub fn run(self) -> Result<()> {
        // Initialize the telemetry stack.
        Self::init_stack(self.v, &self.metrics)?;

        Self::run_until_ctrl_c(self.start())
    }

    /// Initialize the tracing stack and Prometheus metrics recorder.
    ///
    /// This function should be called at the beginning of the program.
    pub fn init_stack(verbosity: u8, metrics: &MetricsArgs) -> Result<()> {
        let level = match verbosity {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        };
        let filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|err| anyhow::anyhow!("Failed to initialize tracing: {err}"))?;

        if metrics.enabled {
            let addr = SocketAddr::new(metrics.addr, metrics.port);
            PrometheusBuilder::new().with_http_listener(addr).install()?;
            info!(target: "prometheus", "Serving metrics at: http://{addr}");
        }

        Ok(())
    }

    /// Connects to the node and tracks its head until ctrl-c is pressed or a fatal error occurs.
    pub async fn start(self) -> Result<()> {
        let config = HeadTrackerConfig::from(&self.tracker);

        let client = Arc::new(AlloyChainClient::connect(&self.ws_rpc, self.chain_id).await?);
        let remote_chain_id = client.remote_chain_id().await?;
        if remote_chain_id != self.chain_id {
            bail!(
                "Node at {} serves chain {remote_chain_id}, expected {}",
                self.ws_rpc,
                self.chain_id
            );
        }

        let metrics: Arc<dyn HeadTrackerMetrics> = if self.metrics.enabled {
            Arc::new(Metrics::init(self.chain_id))
        } else {
            Arc::new(NoopMetrics)
        };
        let storage = Arc::new(
            InMemoryHeadSaver::<BlockHead>::new(config.history_depth)
                .with_log_retention(config.log_retention),
        );
        let cancel = CancellationToken::new();
        let service = HeadTrackerService::new(
            Arc::clone(&client),
            storage,
            client,
            config,
            metrics,
            cancel.clone(),
        )?;
        match self.filter.to_filter() {
            Some(filter) => service.tracker().filters().register("cli", filter)?,
            None => warn!(target: "headtracker", "No log filters registered, saving heads only"),
        }

        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!(target: "headtracker", "Received ctrl-c, shutting down"),
                Err(err) => warn!(target: "headtracker", %err, "Failed to listen for ctrl-c"),
            }
            cancel.cancel();
        });

        info!(
            target: "headtracker",
            chain_id = self.chain_id,
            url = %self.ws_rpc,
            "Tracking chain head"
        );
        service.start().await?;
        Ok(())
    }

    /// Run until ctrl-c is pressed.
    pub fn run_until_ctrl_c<F>(fut: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        let rt = Self::tokio_runtime().map_err(|e| anyhow::anyhow!(e))?;
        rt.block_on(fut)
    }

    /// Creates a new default tokio multi-thread [Runtime](tokio::runtime::Runtime) with all
    /// features enabled
    pub fn tokio_runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
        tokio::runtime::Builder::new_multi_thread().enable_all().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cli() {
        let cli = Cli::try_parse_from([
            "headtracker",
            "--ws-rpc",
            "ws://localhost:8546",
            "-c",
            "10",
            "-vv",
            "--finality-depth",
            "64",
        ])
        .unwrap();

        assert_eq!(cli.ws_rpc.as_str(), "ws://localhost:8546/");
        assert_eq!(cli.chain_id, 10);
        assert_eq!(cli.v, 2);
        assert_eq!(cli.tracker.finality_depth, 64);
        assert_eq!(cli.filter, FilterArgs::default());
        assert!(!cli.metrics.enabled);
    }

    #[test]
    fn test_parse_filter() {
        let cli = Cli::try_parse_from([
            "headtracker",
            "--ws-rpc",
            "ws://localhost:8546",
            "-c",
            "1",
            "--filter.address",
            "0x00000000000000000000000000000000000000aa",
            "--filter.event",
            "0x00000000000000000000000000000000000000000000000000000000000000ee",
        ])
        .unwrap();

        let filter = cli.filter.to_filter().unwrap();
        assert_eq!(filter.addresses.len(), 1);
        assert_eq!(filter.event_sigs.len(), 1);
    }

    #[test]
    fn test_ws_alias() {
        let cli =
            Cli::try_parse_from(["headtracker", "--ws", "ws://localhost:8546", "--chain-id", "1"])
                .unwrap();
        assert_eq!(cli.chain_id, 1);
    }

    #[test]
    fn test_requires_chain_id() {
        assert!(Cli::try_parse_from(["headtracker", "--ws-rpc", "ws://localhost:8546"]).is_err());
    }

    #[test]
    fn test_rejects_invalid_url() {
        assert!(
            Cli::try_parse_from(["headtracker", "--ws-rpc", "not a url", "--chain-id", "1"])
                .is_err()
        );
    }
}
