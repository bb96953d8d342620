use marstek2mqtt::{metering_marstek::transport::UdpTransport, mqtt::{internal_commands::CommandHandler, publish_uptime, MqttManager}, MarstekManager, CONFIG};
use tokio::task::JoinHandle;
use std::{sync::Arc, time::Duration};
use log::{error, info};


#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    let default_filter =  std::env::var("E2M_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let mqtt_config = match CONFIG.read() {
        Ok(c) => c.config.mqtt.clone(),
        Err(e) => {
            error!("Config lock poisoned: {e}");
            return Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
        }
    };

    // we need a channel for the subparts to send metering data to the handler
    let (mut mqtt, tx) = MqttManager::new(&mqtt_config);

    let mut threads: Vec<JoinHandle<()>> = Vec::new();

    threads.push(tokio::spawn(async move {
        mqtt.start_thread().await;
    }));

    // Start the Marstek pollers
    let mut marstek = MarstekManager::new(tx.clone());
    threads.push(tokio::spawn(async move {
        marstek.start_thread().await;
    }));

    /* Make sure to handle the dirty flag of the configuration */
    threads.push(tokio::spawn(async move {
        loop {
            let _ = tokio::time::sleep(Duration::from_secs(60)).await;
            let Ok(mut c) = CONFIG.write() else {
                error!("Config lock poisoned, stop saving");
                return;
            };
            if c.is_dirty() {
                if let Err(e) = c.save() {
                    error!("Saving the config failed: {e}");
                }
            }
        }
    }));

    /* Periodic uptime publishing */
    let uptime_sender = tx.clone();
    threads.push(tokio::spawn(async move {
        // Publish immediately on startup
        publish_uptime(&uptime_sender).await;

        let mut interval = tokio::time::interval(Duration::from_secs(10));
        interval.tick().await; // Skip first immediate tick since we already published

        loop {
            interval.tick().await;
            publish_uptime(&uptime_sender).await;
        }
    }));

    /* Last but not least start our command handling */
    let mut command = CommandHandler::new(tx, Arc::new(UdpTransport::new()));
    threads.push(tokio::spawn(async move {
        command.start_thread().await;
    }));


    info!("All modules started, now waiting for a signal to exit");
    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        let kill_all_tasks = threads.iter().any(|task| task.is_finished());

        if kill_all_tasks {
            for task in threads.iter_mut() {
                task.abort();
            }
            break;
        }
    }
    Ok(())
}
