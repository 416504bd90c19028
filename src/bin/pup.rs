use clap::Parser;
use pup::controller::Pup;
use pup::event::channel::{pub_sub, EventPublisher};
use pup::event::ApplicationEvent;
use pup::logging;
use pup::plan::{Plan, DEFAULT_CONFIG_FILE};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::exit;
use tracing::{error, info};

const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_BUS_CONFLICT: i32 = 2;
const EXIT_INTERNAL_ERROR: i32 = 3;

/// Universal process supervisor.
#[derive(Debug, Parser)]
#[command(name = "pup", version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log level upperbound (the PUP_LOG environment variable wins)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let cli = Cli::parse();

    let plan = match Plan::load(&cli.config) {
        Ok(plan) => plan,
        Err(err) => {
            eprintln!("configuration error: {err}");
            exit(EXIT_CONFIG_ERROR);
        }
    };

    // Keep the file appender alive for the whole run.
    let _logger_guard = match logging::init_tracing(&plan.logger, &cli.log_level) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("configuration error: could not open the log file: {err}");
            exit(EXIT_CONFIG_ERROR);
        }
    };

    if let Err(code) = run(plan) {
        exit(code);
    }
    info!("exiting gracefully");
}

fn run(plan: Plan) -> Result<(), i32> {
    let (command_publisher, command_consumer) = pub_sub();
    let (application_event_publisher, application_event_consumer) = pub_sub();

    create_shutdown_signal_handler(application_event_publisher).map_err(|err| {
        error!("could not set the signal handler: {err}");
        EXIT_INTERNAL_ERROR
    })?;

    #[cfg(target_family = "unix")]
    let bus = {
        use pup::ipc::server::{BusError, BusServer};
        match BusServer::start(&plan.socket_path, command_publisher.clone()) {
            Ok(bus) => bus,
            Err(err @ BusError::Conflict(_)) => {
                error!("{err}");
                return Err(EXIT_BUS_CONFLICT);
            }
            Err(err) => {
                error!("{err}");
                return Err(EXIT_INTERNAL_ERROR);
            }
        }
    };
    #[cfg(not(target_family = "unix"))]
    {
        tracing::warn!("control bus is not available on this platform");
        let _ = command_publisher;
    }

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        Pup::new(&plan).run(command_consumer, application_event_consumer)
    }));

    #[cfg(target_family = "unix")]
    bus.stop();

    outcome.map_err(|_| {
        error!("fatal internal error; core state is no longer trustworthy");
        EXIT_INTERNAL_ERROR
    })
}

fn create_shutdown_signal_handler(
    publisher: EventPublisher<ApplicationEvent>,
) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!("received termination signal; stopping pup");
        let _ = publisher.publish(ApplicationEvent::StopRequested);
    })
}
