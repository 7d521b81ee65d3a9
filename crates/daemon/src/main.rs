use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgAction, Command};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipeline::{BatteryProbe, FileLogSink, Multiplexer};
use relay_transport::{MockTransport, RelayManager};
use telemetry_daemon::config::load_config;
use telemetry_daemon::connection_manager::ConnectionManager;
use telemetry_daemon::orchestrator::{SessionOrchestrator, SessionSettings};
use telemetry_daemon::shutdown::StopSignal;
use telemetry_types::{ConnectionEvent, ConnectionState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "telemetry_daemon=info,pipeline=info,relay_transport=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Telemetry daemon starting...");

    // --- Argument Parsing ---
    let matches = Command::new("telemetry_daemon")
        .about("Implant telemetry logger")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("JSON configuration file"),
        )
        .arg(
            Arg::new("log-path")
                .long("log-path")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("Telemetry log file, overriding the configuration"),
        )
        .arg(
            Arg::new("mock")
                .long("mock")
                .action(ArgAction::SetTrue)
                .help("Use the simulated relay and device instead of real hardware"),
        )
        .arg(
            Arg::new("health-period-secs")
                .long("health-period-secs")
                .value_name("SECS")
                .value_parser(value_parser!(u64))
                .help("Health sampling period, overriding the configuration"),
        )
        .get_matches();

    let mut config = load_config(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))?;
    if let Some(path) = matches.get_one::<PathBuf>("log-path") {
        config.log.path = path.clone();
    }
    if let Some(secs) = matches.get_one::<u64>("health-period-secs") {
        config.health_period_secs = *secs;
    }
    config.validate()?;

    // --- Transport ---
    let manager: Box<dyn RelayManager> = if matches.get_flag("mock") {
        tracing::info!("Using simulated relay transport for project {}", config.project_id);
        let (transport, _handle) = MockTransport::new(config.mock.clone());
        Box::new(transport)
    } else {
        bail!(
            "no vendor telemetry binding is linked into this build; \
             run with --mock to use the simulated transport"
        );
    };

    // --- Log sink ---
    let sink = Arc::new(
        FileLogSink::open(&config.log)
            .with_context(|| format!("opening {}", config.log.path.display()))?,
    );
    let mux = Multiplexer::new(sink);

    // --- Stop signal: Ctrl-C or Enter ---
    let stop = StopSignal::new();
    let ctrl_c_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received");
            ctrl_c_stop.trigger();
        }
    });
    let stdin_stop = stop.clone();
    thread::Builder::new()
        .name("stdin_stop".into())
        .spawn(move || {
            let mut line = String::new();
            // EOF means no console is attached; only Ctrl-C can stop then.
            if let Ok(n) = std::io::stdin().lock().read_line(&mut line) {
                if n > 0 {
                    stdin_stop.trigger();
                }
            }
        })?;

    // --- Progress events ---
    let (event_tx, event_rx) = flume::unbounded();
    let events_task = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            print_event(&event);
        }
    });

    // --- Session ---
    let settings = SessionSettings::from(&config);
    let probe = BatteryProbe::new(config.battery_capacity_path.clone());
    let discovery = config.discovery;
    let session_open = config.session_open;
    let report = tokio::task::spawn_blocking(move || {
        let mut connection =
            ConnectionManager::new(manager, discovery, session_open, stop.token())
                .with_events(event_tx);
        SessionOrchestrator::new(settings, mux, probe, stop).run(&mut connection)
    })
    .await??;

    let _ = events_task.await;

    tracing::info!(
        "Session finished in state {} after {} initialization error(s)",
        report.final_state,
        report.initialization_retries
    );
    for (kind, stats) in &report.adapters {
        tracing::info!(
            "{} adapter: {} batches, {} written, {} failed, {} skipped",
            kind,
            stats.batches,
            stats.written,
            stats.failed,
            stats.skipped
        );
    }
    for (tag, stats) in &report.channels {
        tracing::info!("{}: {} written, {} failed", tag, stats.written, stats.failed);
    }
    tracing::info!(
        "Health sampler: {} tick(s), {} written",
        report.health.ticks,
        report.health.written
    );
    println!("Teardown complete.");
    Ok(())
}

/// Console progress for the operator.
fn print_event(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::StateChanged(ConnectionState::Failed(reason)) => {
            println!("Connection failed: {}", reason)
        }
        ConnectionEvent::StateChanged(_) => {}
        ConnectionEvent::RelaysFound(relays) => {
            println!("Bonded relays found:");
            for relay in relays {
                println!("\t{}", relay.serial_number);
            }
        }
        ConnectionEvent::RelayConnectResult {
            serial_number,
            connected,
        } => println!(
            "Connecting to relay {}: {}",
            serial_number,
            if *connected { "success" } else { "failed" }
        ),
        ConnectionEvent::DevicesDiscovered(devices) => {
            println!("Implanted devices found during discovery:");
            for device in devices {
                println!("\t{}", device);
            }
        }
        ConnectionEvent::SessionAttemptFailed { attempt, reason } => {
            println!("Session attempt {} failed: {}", attempt, reason)
        }
        ConnectionEvent::SessionOpened { attempts, warnings } => println!(
            "Session opened after {} attempt(s), warnings: {}",
            attempts, warnings
        ),
    }
}
