//! Struja Node - OCPP 2.0.1 charging-session simulator
//!
//! Starts a central system on a local port, connects a charge point to
//! it over WebSocket, and runs a scripted negotiation:
//! boot → status → heartbeat → authorize → meter values → remote
//! start/stop with transaction events.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: listen on 127.0.0.1:9000, station EK3-001
//! struja-node
//!
//! # Custom station and port
//! struja-node --listen 127.0.0.1:9400 --station CP_1 --evse-count 2
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use parking_lot::RwLock;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use struja_roles::types::*;
use struja_roles::{
    CentralSystem, CentralSystemConfig, CentralSystemRegistry, ChargePoint, ChargePointRegistry,
    StationState, VENDOR_ID,
};
use struja_rpc::transport::{self, endpoint_url};
use struja_rpc::{Session, SessionConfig, OCPP_SUBPROTOCOL};

/// OCPP 2.0.1 charging-session simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Central system listen address
    #[arg(long, default_value = "127.0.0.1:9000")]
    listen: String,

    /// Charge point station ID
    #[arg(short, long, default_value = "EK3-001")]
    station: String,

    /// Vendor name
    #[arg(long, default_value = "Elektrokombinacija")]
    vendor: String,

    /// Model name
    #[arg(long, default_value = "EK3-OCPP")]
    model: String,

    /// Number of EVSEs
    #[arg(long, default_value = "1")]
    evse_count: u32,

    /// Heartbeat interval handed out by the central system (seconds)
    #[arg(long, default_value = "10")]
    heartbeat_interval: i32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║        Struja Node - OCPP 2.0.1 Charging Simulator           ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listen:   {:<50} ║", args.listen);
    println!("║  Station:  {:<50} ║", args.station);
    println!("║  Vendor:   {:<50} ║", args.vendor);
    println!("║  Model:    {:<50} ║", args.model);
    println!("║  EVSEs:    {:<50} ║", args.evse_count);
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Central system: accept loop, one session per connecting station.
    let listener = TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, "central system listening");

    let csms_registry = Arc::new(CentralSystemRegistry::new(CentralSystemConfig {
        heartbeat_interval: args.heartbeat_interval,
        ..Default::default()
    }));
    let (accepted_tx, mut accepted_rx) = mpsc::channel::<(String, Session)>(8);

    let accept_registry = csms_registry.clone();
    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    continue;
                }
            };
            let registry = accept_registry.clone();
            let accepted_tx = accepted_tx.clone();
            tokio::spawn(async move {
                match transport::accept(stream, &[OCPP_SUBPROTOCOL]).await {
                    Ok((transport, info)) => {
                        let station_id = info.station_id().to_string();
                        info!(%station_id, %peer, "station connected");
                        let (session, _) = Session::spawn(
                            transport,
                            registry,
                            station_id.clone(),
                            SessionConfig::default(),
                        );
                        let _ = accepted_tx.send((station_id, session)).await;
                    }
                    Err(e) => warn!(%peer, error = %e, "handshake rejected"),
                }
            });
        }
    });

    // Charge point: connect and run the scripted sequence.
    let url = endpoint_url(&format!("ws://{}", args.listen), &args.station);
    let cp_transport = transport::connect(&url, OCPP_SUBPROTOCOL).await?;

    let mut station = StationState::new(&args.station, &args.vendor, &args.model)
        .with_firmware(env!("CARGO_PKG_VERSION"));
    for i in 1..=args.evse_count {
        station.add_evse(i as i32, 1);
    }
    let station = Arc::new(RwLock::new(station));

    let (cp_session, _) = Session::spawn(
        cp_transport,
        Arc::new(ChargePointRegistry::new(station.clone())),
        args.station.clone(),
        SessionConfig::default(),
    );
    let charge_point = ChargePoint::new(cp_session, station);

    // The server-side session for this station drives remote commands.
    let (_, csms_session) = accepted_rx
        .recv()
        .await
        .ok_or("central system dropped the connection")?;
    let central_system = CentralSystem::new(csms_session);

    run_sequence(&charge_point, &central_system).await?;

    charge_point.session().close();
    central_system.session().close();
    tokio::time::sleep(Duration::from_millis(100)).await;

    info!("simulation finished");
    Ok(())
}

/// The scripted negotiation the simulator runs once connected.
async fn run_sequence(
    charge_point: &ChargePoint,
    central_system: &CentralSystem,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("→ BootNotification");
    let boot = charge_point.boot_notification(BootReason::PowerUp).await?;
    info!(status = ?boot.status, interval = boot.interval, "← BootNotification");

    info!("→ StatusNotification");
    charge_point.status_notification_all().await?;

    info!("→ Heartbeat");
    let heartbeat = charge_point.heartbeat().await?;
    info!(current_time = %heartbeat.current_time, "← Heartbeat");

    let token = IdToken::central(uuid::Uuid::new_v4().to_string());
    info!(token = %token.id_token, "→ Authorize");
    let authorize = charge_point.authorize(token.clone()).await?;
    info!(status = ?authorize.id_token_info.status, "← Authorize");

    // Simulated readings; the rng must not live across an await.
    let (power_w, soc) = {
        let mut rng = rand::thread_rng();
        (rng.gen_range(3_000.0..22_000.0), rng.gen_range(0.0..100.0))
    };
    info!(power_w, "→ MeterValues");
    charge_point
        .meter_values(
            1,
            vec![MeterValue {
                timestamp: Utc::now(),
                sampled_value: vec![
                    SampledValue {
                        value: power_w,
                        context: Some(ReadingContext::SamplePeriodic),
                        measurand: Some(Measurand::PowerActiveImport),
                        phase: None,
                    },
                    SampledValue {
                        value: soc,
                        context: Some(ReadingContext::SamplePeriodic),
                        measurand: Some(Measurand::SoC),
                        phase: None,
                    },
                ],
            }],
        )
        .await?;

    info!("→ RequestStartTransaction (remote)");
    let start = central_system
        .request_start_transaction(token.clone(), 1, Some(1))
        .await?;
    info!(status = ?start.status, transaction_id = ?start.transaction_id, "← RequestStartTransaction");

    if let Some(transaction_id) = start.transaction_id {
        info!(%transaction_id, "→ TransactionEvent(Started)");
        charge_point
            .transaction_event(TransactionEventRequest {
                event_type: TransactionEventType::Started,
                timestamp: Utc::now(),
                trigger_reason: "RemoteStart".to_string(),
                seq_no: 0,
                transaction_info: TransactionInfo {
                    transaction_id: transaction_id.clone(),
                    charging_state: Some(ChargingState::Charging),
                    remote_start_id: Some(1),
                },
                evse: Some(Evse {
                    id: 1,
                    connector_id: Some(1),
                }),
                id_token: Some(token),
                meter_value: None,
            })
            .await?;

        info!(%transaction_id, "→ RequestStopTransaction (remote)");
        let stop = central_system
            .request_stop_transaction(transaction_id.clone())
            .await?;
        info!(status = ?stop.status, "← RequestStopTransaction");

        let seq_no = charge_point
            .station()
            .write()
            .next_seq_no(&transaction_id)
            .unwrap_or(1);
        info!(%transaction_id, "→ TransactionEvent(Ended)");
        charge_point
            .transaction_event(TransactionEventRequest {
                event_type: TransactionEventType::Ended,
                timestamp: Utc::now(),
                trigger_reason: "RemoteStop".to_string(),
                seq_no,
                transaction_info: TransactionInfo {
                    transaction_id,
                    charging_state: Some(ChargingState::Idle),
                    remote_start_id: Some(1),
                },
                evse: None,
                id_token: None,
                meter_value: None,
            })
            .await?;
    }

    info!("→ DataTransfer");
    let transfer = charge_point
        .data_transfer(
            VENDOR_ID,
            Some("diagnostics".to_string()),
            Some(serde_json::json!({"uptime_s": 42})),
        )
        .await?;
    info!(status = ?transfer.status, "← DataTransfer");

    Ok(())
}
