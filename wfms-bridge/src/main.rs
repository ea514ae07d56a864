// WFMS Bridge - UART/MQTT bridge daemon
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # WFMS Bridge
//!
//! Runs the gateway service against a serial controller (or a simulated
//! one) and an MQTT broker, and serves the local admin interface.
//!
//! ## Usage
//!
//! ```bash
//! # Real controller
//! wfms-bridge --uart-port /dev/ttyACM0 --mqtt-host broker.local
//!
//! # No hardware, 20% ack loss
//! wfms-bridge --simulate --drop-ack-prob 0.2 --log-level debug
//! ```

mod admin;
mod cli;
mod logging;
mod metrics;

use admin::AppState;
use clap::Parser;
use cli::Args;
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};
use wfms_gateway::{
    GatewayError, GatewayService, MqttBus, SerialTransport, SimulatedTransport, Transport,
};

#[derive(Debug, Error)]
enum BridgeError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("admin interface on {address}: {source}")]
    Admin {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = match logging::init(&args.log_level) {
        Ok(level) => level,
        Err(e) => {
            eprintln!("wfms-bridge: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("WFMS Bridge v{}", env!("CARGO_PKG_VERSION"));

    match run(args, log_level).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "bridge failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, log_level: logging::LogLevel) -> Result<(), BridgeError> {
    let config = args.gateway_config()?;

    let transport: Arc<dyn Transport> = if args.simulate {
        info!(drop_ack_prob = args.drop_ack_prob, "using simulated controller");
        Arc::new(SimulatedTransport::new(args.simulated_config()?))
    } else {
        info!(port = %config.serial.port, baud = config.serial.baud, "using serial controller");
        Arc::new(SerialTransport::new(config.serial.clone()))
    };
    let (bus, events) = MqttBus::new(config.mqtt.clone());

    let address = config.admin.bind_address();
    let service = GatewayService::new(config, transport, Arc::new(bus), events)?;
    service.start().await?;

    let listener = match TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(source) => {
            service.stop().await?;
            return Err(BridgeError::Admin { address, source });
        }
    };
    info!("Admin interface on http://{}", address);
    info!("Metrics endpoint: http://{}/metrics", address);

    let state = Arc::new(AppState::for_service(&service, args.simulate, log_level));
    let served = axum::serve(listener, admin::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("shutting down");
    service.stop().await?;
    served.map_err(|source| BridgeError::Admin { address, source })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
