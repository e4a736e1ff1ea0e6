use async_trait::async_trait;
use cdc_dispatch::config::ListenerConfig;
use cdc_dispatch::kafka::KafkaSource;
use cdc_dispatch::message::MutationKind;
use cdc_dispatch::{
    Config, ConsumerClient, EntityMetadata, EntryListener, ListenerRegistry, MessageHandler,
    Result, TypedRow,
};
use clap::Parser;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "cdc-dispatch")]
#[command(about = "Consumes CDC row changes from Kafka and dispatches them to table listeners", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

type Record = Map<String, Value>;

/// Logs every change of its table with the configured columns.
struct LoggingListener;

#[async_trait]
impl EntryListener<Record> for LoggingListener {
    async fn on_row_change(&self, rows: &[TypedRow<Record>], kind: MutationKind) -> anyhow::Result<()> {
        let images: Vec<String> = rows
            .iter()
            .map(|row| Value::Object(row.entity.clone()).to_string())
            .collect();
        info!(%kind, rows = ?images, "Row change");
        Ok(())
    }
}

fn record_metadata(listener: &ListenerConfig) -> EntityMetadata<Record> {
    listener
        .columns
        .iter()
        .fold(EntityMetadata::new(&listener.schema, &listener.table), |metadata, column| {
            let name = column.clone();
            metadata.column(column.as_str(), move |record: &mut Record, raw| {
                record.insert(name.clone(), Value::String(raw.to_string()));
                Ok(())
            })
        })
}

fn build_registry(listeners: &[ListenerConfig]) -> Result<ListenerRegistry> {
    let mut builder = ListenerRegistry::builder();
    for listener in listeners {
        builder = builder.bind(record_metadata(listener), LoggingListener)?;
    }
    Ok(builder.build())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting cdc-dispatch");
    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config).and_then(|cfg| {
        cfg.validate()?;
        Ok(cfg)
    }) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    info!(
        kafka_brokers = ?config.kafka.brokers,
        kafka_topic = %config.kafka.topic,
        kafka_group_id = %config.kafka.group_id,
        batch_size = config.consumer.batch_size,
        flat_message = config.consumer.flat_message,
        async_dispatch = config.consumer.async_dispatch,
        filter = %config.consumer.filter,
        "Configuration summary"
    );

    let registry = build_registry(&config.listeners)?;
    if registry.is_empty() {
        warn!("No listeners configured, changes will be acknowledged without handling");
    }

    let handler = MessageHandler::from_config(&config.consumer, Arc::new(registry));
    let source = KafkaSource::new(&config.kafka)?;
    let handle = ConsumerClient::new(source, handler, &config.consumer)?.start();

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    handle.stop().await?;
    info!("Shutdown complete");

    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("cdc_dispatch=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cdc_dispatch=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
