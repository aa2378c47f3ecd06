//! interactiond - turn MQTT object detections into interaction events.
//!
//! This daemon:
//! 1. Subscribes to the detection feed (and optionally Frigate events)
//! 2. Tracks overlapping label pairs per camera with min/expire debouncing
//! 3. Publishes retained ON/OFF events, plus Home Assistant discovery if enabled

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use interaction_tracker::config::{InteractionConfig, CONFIG_ENV};
use interaction_tracker::publish::DiscoveryPublisher;
use interaction_tracker::transport::{
    parse_frigate_event, MqttEventSink, MqttPublisher, MqttSubscriber,
};
use interaction_tracker::{CameraRouter, EventPublisher};

#[derive(Parser, Debug)]
#[command(author, version, about = "Detect object interactions from MQTT detections")]
struct Args {
    /// Config file (.toml, otherwise JSON). Defaults apply when omitted.
    #[arg(long, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,

    /// Validate the configuration and exit.
    #[arg(long)]
    check_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config = InteractionConfig::load_from(args.config.as_deref())?;
    log_summary(&config);
    if args.check_config {
        log::info!("configuration OK");
        return Ok(());
    }
    if config.mqtt.allow_remote {
        log::warn!("Remote MQTT enabled - ensure broker is in a trusted network");
    }

    let mqtt = config.mqtt_settings()?;
    let mqtt_publisher = MqttPublisher::connect(&mqtt, &config.availability_topic())?;
    let sink = MqttEventSink::new(
        mqtt_publisher.client(),
        &config.mqtt.prefix,
        &config.mqtt.events,
        DiscoveryPublisher::new(config.discovery_settings()),
    );
    let publisher = EventPublisher::spawn(sink, config.publish)?;
    let mut router =
        CameraRouter::new(&config.cameras, config.fallback_camera(), publisher.queue())?;

    let detection_topics = config.detection_topics();
    let mut topics = vec![detection_topics.subscription()];
    let frigate_topic = config.frigate.enabled.then(|| config.frigate.topic.clone());
    topics.extend(frigate_topic.clone());
    let subscriber = MqttSubscriber::connect(&mqtt, topics)?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;
    let stopper = subscriber.stopper();
    std::thread::Builder::new()
        .name("shutdown".to_string())
        .spawn(move || {
            if rx.recv().is_ok() {
                log::info!("shutdown signal received, stopping ingest...");
                stopper.stop();
            }
        })?;

    log::info!("interactiond running (Ctrl-C to stop)");
    subscriber.run(|topic, payload| {
        let decoded = if detection_topics.matches(topic) {
            detection_topics.decode(topic, payload)
        } else if frigate_topic.as_deref() == Some(topic) {
            parse_frigate_event(payload)
        } else {
            log::debug!("ignoring message on {}", topic);
            return;
        };
        match decoded {
            Ok(input) => {
                if let Err(e) = router.route(input) {
                    log::error!("failed to route detections from {}: {}", topic, e);
                }
            }
            Err(e) => log::warn!("skipping message on {}: {}", topic, e),
        }
    });

    router.shutdown()?;
    let stats = publisher.shutdown()?;
    log::info!(
        "published {} events ({} retries, {} dropped)",
        stats.published,
        stats.retried,
        stats.dropped
    );
    mqtt_publisher.disconnect()?;
    Ok(())
}

fn log_summary(config: &InteractionConfig) {
    log::info!("Interaction tracker starting");
    log::info!("  MQTT broker: {}", config.mqtt.broker_addr);
    log::info!("  Topic prefix: {}", config.mqtt.prefix);
    for definition in &config.interactions {
        log::info!(
            "  Interaction {}: [{}] x [{}] threshold {} min {}s expire {}s",
            definition.name,
            definition
                .slot_a
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
            definition
                .slot_b
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
            definition.threshold,
            definition.timing.min_time,
            definition.timing.expire_time
        );
    }
    log::info!(
        "  Cameras: {}{}",
        config
            .cameras
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        if config.accept_unknown_cameras {
            " (+ any camera seen on the bus)"
        } else {
            ""
        }
    );
    if config.home_assistant.discovery_enabled {
        log::info!(
            "  HA discovery: {} ({})",
            config.home_assistant.discovery_prefix,
            config.home_assistant.entity_prefix
        );
    }
    if config.frigate.enabled {
        log::info!("  Frigate topic: {}", config.frigate.topic);
    }
}
