use jaguar_bridge::{LinkError, SerialLink, jaguar::JaguarId, serial};
use log::{info, warn};

#[tokio::main]
async fn main() -> Result<(), LinkError> {
    simplelog::TermLogger::init(
        log::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Always,
    )
    .unwrap();

    let port = std::env::args()
        .nth(1)
        .unwrap_or_else(|| serial::DEFAULT_PORT.to_string());

    for found in serial::find_ports()? {
        info!("Found {} ({:?})", found.name(), found.product());
    }

    let link = SerialLink::open(&port)?;
    info!("Listening on {}", port);

    loop {
        match link.receive().await {
            Ok(message) => {
                let id = JaguarId::from(&message);
                info!(
                    "type {:#04x} mfr {:#04x} api {:#06x} dev {:2}: {:02x?}",
                    id.device_type(),
                    id.manufacturer(),
                    id.api(),
                    id.device_number(),
                    message.payload()
                );
            }
            Err(LinkError::LinkClosed) => break,
            Err(e) => warn!("Read failed: {}", e),
        }
    }

    Ok(())
}
