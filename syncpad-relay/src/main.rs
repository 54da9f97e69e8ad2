//! Relay entry point.
//!
//! Configuration is a single knob: `SYNCPAD_PORT` overrides the listen
//! port (all interfaces); without it the relay binds the default local
//! address. Log verbosity follows `RUST_LOG` as usual.

use syncpad_relay::{Relay, RelayConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = match std::env::var("SYNCPAD_PORT") {
        Ok(raw) => RelayConfig {
            bind_addr: format!("0.0.0.0:{}", raw.parse::<u16>()?),
            ..RelayConfig::default()
        },
        Err(_) => RelayConfig::default(),
    };

    Relay::new(config).run().await
}
