use clap::Parser;
use pg_kinesis_relay::config::LogFormat;
use pg_kinesis_relay::{Result, Settings, Supervisor};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-kinesis-relay")]
#[command(about = "PostgreSQL logical replication to Kinesis CDC relay", long_about = None)]
#[command(version)]
struct Args {
    #[arg(short, long, help = "Force JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-kinesis-relay v{}", env!("CARGO_PKG_VERSION"));

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            eprintln!("\nRequired environment variables:");
            eprintln!("  PGUSER             - PostgreSQL username");
            eprintln!("  PGPASSWORD         - PostgreSQL password");
            eprintln!("  PGDATABASE         - PostgreSQL database name");
            eprintln!("  REPLICATION_SLOT   - logical replication slot name");
            eprintln!("  KINESIS_STREAM     - destination Kinesis stream name");
            std::process::exit(1);
        }
    };

    info!(
        postgres_host = %settings.postgres.host,
        postgres_port = %settings.postgres.port,
        postgres_database = %settings.postgres.database,
        replication_slot = %settings.postgres.slot_name,
        output_plugin = %settings.postgres.output_plugin,
        kinesis_stream = %settings.kinesis.stream_name,
        "Configuration summary"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        }
    });

    let supervisor = Supervisor::new(settings);
    match supervisor.run(shutdown).await {
        Ok(()) => {
            info!("Relay stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!("Relay failed: {}", e);
            Err(e)
        }
    }
}

fn init_logging(json_logs: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_kinesis_relay=debug,info")
    } else if let Ok(level) = std::env::var("LOG_LEVEL") {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pg_kinesis_relay=info,warn"))
    };

    let format = if json_logs {
        LogFormat::Json
    } else {
        std::env::var("LOG_FORMAT")
            .ok()
            .and_then(|raw| raw.parse::<LogFormat>().ok())
            .unwrap_or_default()
    };

    let fmt_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed(),
        LogFormat::Plain => tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
