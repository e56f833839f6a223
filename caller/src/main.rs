// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use contract_caller::config::CallerNodeConfig;
use contract_caller::driver::{EthTxDriver, TxIntent};
use contract_caller::eth_client::EthClient;
use contract_caller::metrics::{start_prometheus_server, CallerMetrics};
use contract_caller::node::run_caller_node;
use contract_caller::txmgr::{wait_mined, TxManager};
use contract_caller_config::Config;
use ethers::types::{Address as EthAddress, Bytes, H256, U256};
use prometheus::Registry;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tap::TapFallible;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version = VERSION)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
#[clap(rename_all = "kebab-case")]
enum Command {
    /// Sync headers and watched contract events until ctrl-c or divergence.
    Index {
        #[clap(long, env = "CALLER_CONFIG_PATH")]
        config_path: PathBuf,
    },
    /// Send one contract call, bumping fees until it is confirmed.
    Call {
        #[clap(long, env = "CALLER_CONFIG_PATH")]
        config_path: PathBuf,
        #[clap(long)]
        to: EthAddress,
        /// Hex encoded call data.
        #[clap(long, default_value = "0x")]
        data: Bytes,
        /// Value in wei.
        #[clap(long, value_parser = parse_wei, default_value = "0")]
        value: U256,
        #[clap(long)]
        gas_limit: Option<u64>,
        /// Give up after this many seconds.
        #[clap(long, default_value_t = 600)]
        timeout_secs: u64,
    },
    /// Wait for a transaction to reach the configured confirmations.
    WaitMined {
        #[clap(long, env = "CALLER_CONFIG_PATH")]
        config_path: PathBuf,
        #[clap(long)]
        tx_hash: H256,
        #[clap(long, default_value_t = 600)]
        timeout_secs: u64,
    },
    Version,
}

fn parse_wei(s: &str) -> Result<U256, String> {
    U256::from_dec_str(s).map_err(|e| format!("invalid wei amount {}: {}", s, e))
}

fn load_config(path: &Path) -> anyhow::Result<CallerNodeConfig> {
    let config = CallerNodeConfig::load(path)?;
    config.validate()?;
    Ok(config)
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Token cancelled on ctrl-c, or once `timeout` elapses when given.
fn shutdown_token(timeout: Option<Duration>) -> CancellationToken {
    let token = CancellationToken::new();
    let signal = token.clone();
    tokio::spawn(async move {
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received ctrl-c, shutting down"),
            _ = deadline => info!("Deadline reached, shutting down"),
            _ = signal.cancelled() => return,
        }
        signal.cancel();
    });
    token
}

async fn index(config: CallerNodeConfig) -> anyhow::Result<()> {
    let registry = Registry::new();
    let metrics = Arc::new(CallerMetrics::new(&registry)?);
    let metrics_address =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), config.metrics_port);
    let _metrics_server = start_prometheus_server(metrics_address, registry);
    info!("Metrics server started at port {}", config.metrics_port);

    let shutdown = shutdown_token(None);
    let handle = run_caller_node(config, metrics, shutdown.clone()).await?;
    handle
        .join()
        .await
        .tap_err(|e| error!("Synchronizer exited with error: {}", e))?;
    Ok(())
}

async fn call(
    config: CallerNodeConfig,
    intent: TxIntent,
    timeout: Duration,
) -> anyhow::Result<()> {
    let metrics = Arc::new(CallerMetrics::new(&Registry::new())?);
    let cancel = shutdown_token(Some(timeout));
    let client = Arc::new(EthClient::dial(&config.chain, metrics.clone(), &cancel).await?);
    let driver = EthTxDriver::new(client.clone(), config.wallet()?, intent).await?;
    info!("Sending from {:?}", driver.sender());

    let manager = TxManager::new(&config.chain.chain_name, config.txmgr.clone(), client)?
        .with_metrics(metrics);
    let receipt = manager
        .send(&cancel, Arc::new(driver))
        .await
        .context("Transaction was not confirmed")?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(())
}

async fn wait(config: CallerNodeConfig, tx_hash: H256, timeout: Duration) -> anyhow::Result<()> {
    let metrics = Arc::new(CallerMetrics::new(&Registry::new())?);
    let cancel = shutdown_token(Some(timeout));
    let client = EthClient::dial(&config.chain, metrics, &cancel).await?;
    let receipt = wait_mined(
        &cancel,
        &client,
        tx_hash,
        config.txmgr.receipt_query_interval,
        config.txmgr.num_confirmations,
    )
    .await
    .map_err(|e| anyhow!("Waiting for {:?} failed: {}", tx_hash, e))?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Command::Index { config_path } => index(load_config(&config_path)?).await,
        Command::Call {
            config_path,
            to,
            data,
            value,
            gas_limit,
            timeout_secs,
        } => {
            let intent = TxIntent {
                to,
                data,
                value,
                gas_limit: gas_limit.map(U256::from),
            };
            call(
                load_config(&config_path)?,
                intent,
                Duration::from_secs(timeout_secs),
            )
            .await
        }
        Command::WaitMined {
            config_path,
            tx_hash,
            timeout_secs,
        } => {
            wait(
                load_config(&config_path)?,
                tx_hash,
                Duration::from_secs(timeout_secs),
            )
            .await
        }
        Command::Version => {
            println!("{} {}", env!("CARGO_BIN_NAME"), VERSION);
            Ok(())
        }
    }
}
