//! Host-based gateway for development and testing.
//!
//! Runs the full gateway (state machine, forwarder, backend socket) against
//! the simulated SX127x. Transmissions complete immediately; uplinks can be
//! synthesized periodically to exercise the backend path.
//!
//! # Usage
//!
//! ```bash
//! GATEWAY_CONFIG=gateway.json SYNTHETIC_UPLINK_SECS=10 cargo run --bin host-gateway
//! cargo run --bin host-gateway -- gateway.json
//! ```

#[cfg(not(target_os = "espidf"))]
mod host {
    use log::{error, info, warn};
    use lora_1ch_gateway::gateway::Clock;
    use lora_1ch_gateway::lora::SimulatedRadio;
    use lora_1ch_gateway::protocol::{GatewayEui, UdpTransport};
    use lora_1ch_gateway::{Gateway, GatewayConfig};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// EUI used when the configuration does not name one.
    const HOST_EUI: GatewayEui = GatewayEui([0xAA, 0x55, 0x5A, 0x00, 0x00, 0x00, 0x00, 0x01]);

    fn load_config() -> GatewayConfig {
        let path = std::env::var("GATEWAY_CONFIG")
            .ok()
            .or_else(|| std::env::args().nth(1));
        match path {
            Some(path) => match GatewayConfig::load(&path) {
                Ok(config) => {
                    info!("Configuration loaded from {}", path);
                    config
                }
                Err(e) => {
                    error!("{}", e);
                    std::process::exit(1);
                }
            },
            None => {
                info!("No configuration file given, using defaults");
                GatewayConfig::default()
            }
        }
    }

    /// Unconfirmed data-up frame from a fixed device address.
    fn synthetic_frame(counter: u16) -> Vec<u8> {
        let mut frame = vec![0x40, 0x01, 0x02, 0x03, 0x26, 0x00];
        frame.extend_from_slice(&counter.to_le_bytes());
        frame.push(0x01);
        frame.extend_from_slice(b"hello");
        frame.extend_from_slice(&[0x00; 4]);
        frame
    }

    #[tokio::main(flavor = "current_thread")]
    pub async fn main() {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

        info!("=== Single-channel LoRa gateway (host) starting ===");

        let config = load_config();
        let eui = config.gateway_eui.unwrap_or(HOST_EUI);
        info!("Gateway EUI {}", eui);

        let transport = match UdpTransport::connect(&config.server) {
            Ok(t) => t,
            Err(e) => {
                error!("Failed to open backend socket: {}", e);
                std::process::exit(1);
            }
        };

        let clock = Clock::new();
        let radio = SimulatedRadio::new(config.chip);
        radio.set_clock(clock);
        radio.set_auto_complete(true);

        let mut gateway = match Gateway::new(&config, radio.clone(), transport, eui) {
            Ok(gateway) => gateway.with_clock(clock),
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        };
        radio.connect_irq(gateway.handle().irq());
        if let Err(e) = gateway.start(gateway.now_us()) {
            error!("{}", e);
            std::process::exit(1);
        }

        let cancel = CancellationToken::new();
        let handle = gateway.handle();

        let uplink_period = std::env::var("SYNTHETIC_UPLINK_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs);
        if let Some(period) = uplink_period {
            info!("Synthetic uplink every {:?}", period);
            let uplink_radio = radio.clone();
            let uplink_cancel = cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                let mut counter = 0u16;
                loop {
                    tokio::select! {
                        _ = uplink_cancel.cancelled() => break,
                        _ = interval.tick() => {
                            // RSSI -57 dBm, SNR +9.5 dB
                            uplink_radio.inject_packet(&synthetic_frame(counter), 100, 38);
                            counter = counter.wrapping_add(1);
                        }
                    }
                }
            });
        }

        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down...");
                signal_cancel.cancel();
            }
        });

        info!("Entering main loop (Ctrl+C to exit)...");
        let loop_cancel = cancel.clone();
        let gateway_task = tokio::task::spawn_blocking(move || {
            gateway.run(|| !loop_cancel.is_cancelled());
        });
        if let Err(e) = gateway_task.await {
            error!("Gateway task error: {}", e);
        }
        if handle.restart_requested() {
            warn!("Backend requested a restart; exiting");
        }
        cancel.cancel();

        let stats = handle.stats();
        info!(
            "Received {} ({} pushed, {} acknowledged), transmitted {}",
            stats.counters.rx_ok,
            stats.counters.push_sent,
            stats.counters.push_acked,
            stats.counters.tx_ok
        );
        info!("Shutdown complete");
    }
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    host::main();
}

#[cfg(target_os = "espidf")]
fn main() {
    println!("host-gateway runs on the host only; flash the 'gateway' binary instead.");
}
