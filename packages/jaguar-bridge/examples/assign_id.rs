use std::{io::Write, time::Duration};

use jaguar_bridge::{LinkError, SerialLink, jaguar::Jaguar, serial};
use log::{error, info};
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), LinkError> {
    simplelog::TermLogger::init(
        log::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Always,
    )
    .unwrap();

    let mut args = std::env::args().skip(1);
    let Some(new_id) = args.next().and_then(|arg| arg.parse::<u8>().ok()) else {
        error!("usage: assign_id <device id> [port]");
        std::process::exit(1);
    };

    // Fall back to the first USB serial port, then the usual Linux adapter name
    let port = match args.next() {
        Some(port) => port,
        None => serial::find_ports()?
            .first()
            .map(|port| port.name().to_string())
            .unwrap_or_else(|| serial::DEFAULT_PORT.to_string()),
    };

    info!("Opening bridge on {}", port);
    let link = SerialLink::open(&port)?;
    let jaguar = Jaguar::new(&link, 2)?;

    // Give the bridge a moment to come up after the port opens
    sleep(Duration::from_secs(1)).await;

    jaguar.device_assignment(new_id).await?;

    print!("Press the button on the desired Jaguar.\n>>> Waiting... 5");
    std::io::stdout().flush()?;
    for remaining in (1..=4).rev() {
        sleep(Duration::from_secs(1)).await;
        print!(" {}", remaining);
        std::io::stdout().flush()?;
    }
    sleep(Duration::from_secs(1)).await;
    println!(" ...Done.");

    link.close().await;

    Ok(())
}
