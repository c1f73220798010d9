//! ha-probe - watch the subscription queue topology of a cache cluster
//!
//! Connects a pool to the given servers, keeps the configured redundancy
//! level and reports which server hosts the primary and secondary queues.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use cache_ha_client::client::TcpConnectionFactory;
use cache_ha_client::config::{ClientConfig, CliArgs, OutputFormat, TestHooks};
use cache_ha_client::ha::{EndpointInfo, PoolHaManager, TopologySnapshot};

fn setup_logging(verbose: bool, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn print_banner(config: &ClientConfig) {
    println!("ha-probe v{}", env!("CARGO_PKG_VERSION"));
    println!("====================================");
    println!(
        "Servers: {:?}",
        config.servers.iter().map(|s| s.to_string()).collect::<Vec<_>>()
    );
    if config.subscription_enabled {
        println!(
            "Redundancy level: {}{}",
            config.redundancy_level,
            if config.is_durable { " (durable)" } else { "" }
        );
    } else {
        println!("Subscriptions: disabled");
    }
    println!("====================================\n");
}

fn describe(info: &EndpointInfo) -> String {
    format!(
        "{} [{:?}, queue {} / {} events, failures {}]",
        info.name,
        info.state,
        info.queue_status.as_str(),
        info.queue_size,
        info.failures
    )
}

fn report(snapshot: &TopologySnapshot, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(snapshot)?),
        OutputFormat::Text => {
            match snapshot.primary {
                Some(ref primary) => println!("primary:      {}", describe(primary)),
                None => println!("primary:      <none>"),
            }
            for secondary in &snapshot.secondaries {
                println!("secondary:    {}", describe(secondary));
            }
            for other in &snapshot.nonredundant {
                println!("nonredundant: {}", describe(other));
            }
            println!();
        }
    }
    Ok(())
}

fn run() -> Result<()> {
    let args = CliArgs::parse_args();
    setup_logging(args.verbose, args.quiet);

    let config = ClientConfig::from_cli(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    if !args.quiet {
        print_banner(&config);
    }

    let factory = Arc::new(TcpConnectionFactory::from_config(&config));
    let durable = config.is_durable;
    let pool = PoolHaManager::new(config, factory, None, TestHooks::default()).context("Failed to create pool")?;

    if durable {
        pool.ready_for_events().context("Ready for events failed")?;
    }

    let deadline = Instant::now() + Duration::from_secs(args.watch_secs);
    let interval = Duration::from_millis(args.report_interval_ms.max(1));
    loop {
        report(&pool.topology(), args.output)?;
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(interval.min(deadline.saturating_duration_since(Instant::now())));
    }

    info!("Shutting down");
    pool.close(args.keep_alive);
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
