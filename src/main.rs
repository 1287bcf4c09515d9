use log::{error, info, warn};

use tokio_stream::StreamExt;

use sysgpio::{EdgeDetect, GpioConfig, GpioPin, SysfsGpio, attach_with};

fn level(value: bool) -> &'static str {
    if value { "high" } else { "low" }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GPIO_WATCH_CONFIG").ok())
        .unwrap_or_else(|| "gpio.json".to_string());
    let config = GpioConfig::load_from_file(&config_path)
        .unwrap_or_else(|e| panic!("Failed to load config: {e}"));

    let gpio = SysfsGpio::from_config(&config);

    let mut names: Vec<String> = config.gpios.keys().cloned().collect();
    names.sort();

    let mut cancellers = Vec::new();
    let mut watchers = Vec::new();

    for name in names {
        let pin_cfg = &config.gpios[&name];
        let pin = match gpio.open_pin(pin_cfg) {
            Ok(pin) => pin,
            Err(e) => {
                error!("Failed to open {name}: {e}");
                continue;
            }
        };

        if pin_cfg.edge == EdgeDetect::None {
            match pin.state() {
                Ok(value) => info!("{name} ({}) is {}", pin.name(), level(value)),
                Err(e) => warn!("Failed to read {name}: {e}"),
            }
            continue;
        }

        let mut stream = match attach_with(pin, &config.monitor) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to monitor {name}: {e}");
                continue;
            }
        };
        cancellers.push(stream.canceller());

        watchers.push(tokio::spawn(async move {
            while let Some(value) = stream.next().await {
                info!("{name}: {}", level(value));
            }
            // joins the monitor thread
            match tokio::task::spawn_blocking(move || stream.close()).await {
                Ok(Ok(())) => info!("{name}: monitor stopped"),
                Ok(Err(e)) => error!("{name}: monitor failed: {e}"),
                Err(e) => error!("{name}: monitor task failed: {e}"),
            }
        }));
    }

    if watchers.is_empty() {
        warn!("No pins with edge detection configured in {config_path}");
        return Ok(());
    }

    info!("Watching {} pins...", watchers.len());
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    for canceller in &cancellers {
        canceller.cancel();
    }
    for watcher in watchers {
        let _ = watcher.await;
    }

    Ok(())
}
