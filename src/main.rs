//! Single-channel LoRa gateway firmware.
//!
//! Wi-Fi credentials and an optional JSON configuration are baked in at
//! build time:
//!
//! ```text
//! WIFI_SSID=... WIFI_PASSWORD=... GATEWAY_CONFIG_JSON='{"region":"au915"}' \
//!     cargo build --release --features esp32
//! ```

#[cfg(feature = "esp32")]
mod firmware {
    use esp_idf_hal::modem::Modem;
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
    use esp_idf_sys::EspError;
    use log::{error, info, warn};
    use lora_1ch_gateway::gateway::{level_filter, Clock, Gateway};
    use lora_1ch_gateway::lora::esp::{reset_transceiver, timer_us, DioInterrupts, EspSpiBus};
    use lora_1ch_gateway::protocol::{GatewayEui, UdpTransport};
    use lora_1ch_gateway::GatewayConfig;
    use std::time::Duration;

    /// Delay before restarting after a fatal error.
    const RESTART_DELAY: Duration = Duration::from_secs(10);

    fn gateway_config() -> GatewayConfig {
        match option_env!("GATEWAY_CONFIG_JSON") {
            Some(json) => GatewayConfig::from_json(json).unwrap_or_else(|e| {
                error!("Built-in configuration rejected ({}), using defaults", e);
                GatewayConfig::default()
            }),
            None => GatewayConfig::default(),
        }
    }

    fn connect_wifi(
        modem: Modem,
        sysloop: EspSystemEventLoop,
    ) -> Result<BlockingWifi<EspWifi<'static>>, EspError> {
        let ssid = option_env!("WIFI_SSID").unwrap_or("");
        let password = option_env!("WIFI_PASSWORD").unwrap_or("");
        info!("Connecting to WiFi: {}", ssid);

        let mut wifi = BlockingWifi::wrap(EspWifi::new(modem, sysloop.clone(), None)?, sysloop)?;
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };
        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: ssid.try_into().unwrap_or_default(),
            password: password.try_into().unwrap_or_default(),
            auth_method,
            ..Default::default()
        }))?;
        wifi.start()?;
        wifi.connect()?;
        wifi.wait_netif_up()?;

        let ip_info = wifi.wifi().sta_netif().get_ip_info()?;
        info!("Connected to WiFi, IP: {}", ip_info.ip);
        Ok(wifi)
    }

    fn run() -> Result<(), Box<dyn std::error::Error>> {
        let config = gateway_config();
        log::set_max_level(level_filter(config.debug_level));

        let peripherals = Peripherals::take()?;
        let sysloop = EspSystemEventLoop::take()?;

        // Must stay alive for the backend socket.
        let wifi = connect_wifi(peripherals.modem, sysloop)?;
        let eui = match config.gateway_eui {
            Some(eui) => eui,
            None => GatewayEui::from_mac(wifi.wifi().sta_netif().get_mac()?),
        };
        info!("Gateway EUI {}", eui);

        let pins = peripherals.pins;
        let _reset = reset_transceiver(pins.gpio14)?;
        let bus = EspSpiBus::new(
            peripherals.spi2,
            pins.gpio5,
            pins.gpio27,
            pins.gpio19,
            pins.gpio18,
        )?;
        let transport = UdpTransport::connect(&config.server)?;

        let clock = Clock::with_elapsed(Duration::from_micros(timer_us()));
        let mut gateway = Gateway::new(&config, bus, transport, eui)?.with_clock(clock);
        let mut dio = DioInterrupts::new(pins.gpio26, pins.gpio33, gateway.handle().irq())?;

        gateway.start(gateway.now_us())?;
        gateway.run(|| {
            if let Err(e) = dio.rearm() {
                warn!("Re-enabling DIO interrupts failed: {}", e);
            }
            true
        });
        Ok(())
    }

    pub fn main() {
        // Link ESP-IDF patches (must be first!)
        esp_idf_sys::link_patches();
        esp_idf_svc::log::EspLogger::initialize_default();
        info!("=== Single-channel LoRa gateway starting ===");

        match run() {
            Ok(()) => info!("Restart requested"),
            Err(e) => {
                error!("Gateway failed: {}", e);
                std::thread::sleep(RESTART_DELAY);
            }
        }
        // SAFETY: esp_restart does not return.
        unsafe { esp_idf_sys::esp_restart() };
    }
}

#[cfg(feature = "esp32")]
fn main() {
    firmware::main();
}

#[cfg(not(feature = "esp32"))]
fn main() {
    println!("This binary requires the 'esp32' feature.");
    println!("Use 'cargo run --bin host-gateway' to run against a simulated radio.");
}
