//! LedgerLink orchestrator daemon
//!
//! Wires the configured ledger connectors, the Postgres store, the decoder
//! and callback clients, one scheduler per instruction kind and the admin
//! HTTP surface, then runs until SIGINT/SIGTERM.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;
use url::Url;

use orchestrator::api::{self, ApiState};
use orchestrator::callback::CallbackDispatcher;
use orchestrator::config::Config;
use orchestrator::ledger::{
    CordaConnector, DecoderClient, EvmConnector, LedgerConnector, LedgerRegistry, ProofDecoder,
};
use orchestrator::machine::{
    InstructionMachine, OrchestratorContext, SettlementMachine, SwapMachine, ValidatorMachine,
};
use orchestrator::proof::HttpSignerClient;
use orchestrator::scheduler;
use orchestrator::store::{create_pool, run_migrations, PgInstructionStore};
use orchestrator::types::{InstructionKind, LedgerKind};

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();
    info!("Starting LedgerLink orchestrator");

    orchestrator::metrics::UP.set(1);

    let config = Config::load()?;
    info!(
        networks = config.networks.len(),
        local_system = config.local_system_id,
        "Configuration loaded"
    );

    let pool = create_pool(&config.database.url).await?;
    run_migrations(&pool).await?;
    let store = Arc::new(PgInstructionStore::new(pool));

    let http = reqwest::Client::new();
    let decoder: Arc<dyn ProofDecoder> = Arc::new(DecoderClient::new(
        http.clone(),
        &Url::parse(&config.decoder_url)?,
    )?);
    let callbacks = Arc::new(CallbackDispatcher::new(
        http.clone(),
        config.callbacks.rewrite_https,
        config.callbacks.bearer_token.clone(),
    ));
    let signers = Arc::new(HttpSignerClient::new(http));

    let mut ledgers = LedgerRegistry::new();
    for network in &config.networks {
        let connector: Arc<dyn LedgerConnector> = match network.kind {
            LedgerKind::Evm => Arc::new(EvmConnector::new(
                network.system_id,
                network.rpc_url.clone().unwrap_or_default(),
                &network.contract_address,
                &config.evm_private_key.0,
                network.scan_window,
            )?),
            LedgerKind::Corda => Arc::new(CordaConnector::new(
                network.system_id,
                network.contract_address.clone(),
                decoder.clone(),
                network.auth_system_id.unwrap_or(config.local_system_id),
                network.auth_contract_address.clone().unwrap_or_default(),
            )),
        };
        info!(system_id = network.system_id, kind = %network.kind, "ledger registered");
        ledgers.register(connector);
    }

    let ctx = Arc::new(OrchestratorContext {
        store,
        ledgers,
        decoder,
        callbacks,
        signers,
        state_budget: Duration::from_secs(config.scheduler.state_budget_secs),
        communication_budget: Duration::from_secs(config.scheduler.communication_budget_secs),
    });

    let poll_interval = Duration::from_millis(config.scheduler.poll_interval_ms);
    let machines: Vec<Arc<dyn InstructionMachine>> = vec![
        Arc::new(SettlementMachine),
        Arc::new(ValidatorMachine::set()),
        Arc::new(ValidatorMachine::update()),
        Arc::new(SwapMachine),
    ];
    let mut handles = Vec::new();
    let mut inboxes: HashMap<InstructionKind, _> = HashMap::new();
    for machine in machines {
        let handle = scheduler::spawn(ctx.clone(), machine.clone(), poll_interval);
        inboxes.insert(machine.kind(), handle.update_sender());
        handles.push(handle);
    }

    let api_state = ApiState {
        ctx,
        inboxes: Arc::new(inboxes),
        local_system_id: config.local_system_id,
        sync_wait: Duration::from_secs(config.api.sync_wait_secs),
        sync_poll: Duration::from_millis(250),
        started_at: Utc::now(),
    };
    let addr: SocketAddr = format!("{}:{}", config.api.bind_address, config.api.port).parse()?;

    tokio::select! {
        result = api::serve(addr, api_state) => result?,
        _ = wait_for_shutdown_signal() => {}
    }

    orchestrator::metrics::UP.set(0);
    info!("Shutting down schedulers");
    for handle in handles {
        handle.stop().await;
    }
    info!("LedgerLink orchestrator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,orchestrator=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
