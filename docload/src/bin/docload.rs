use std::{env, io::Read, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};
use docload::{
    config::{self, Config},
    engine::{self, Engine},
    telemetry::{Telemetry, push},
};
use tokio::{runtime::Builder, signal};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid docload config: {0}")]
    Config(#[from] config::Error),
    #[error("Load run failed: {0}")]
    Engine(#[from] engine::Error),
}

fn default_config_path() -> String {
    "/etc/docload/docload.yaml".to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// format of log output
    #[clap(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Run docload with specified configuration
    Run(Box<RunCommand>),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// override the configured run duration, in seconds
    #[clap(long)]
    duration_seconds: Option<u64>,
    /// override the configured number of writers
    #[clap(long)]
    writers: Option<usize>,
    /// override the configured number of readers
    #[clap(long)]
    readers: Option<usize>,
    /// override the configured MongoDB connection string
    #[clap(long)]
    connection_string: Option<String>,
    /// push telemetry to this Prometheus push gateway address
    #[clap(long)]
    push_gateway: Option<String>,
    /// the maximum time to wait, in seconds, for tasks to exit after the run
    #[clap(long, default_value_t = 10)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

fn load_config_contents(config_path: &str) -> Result<String, Error> {
    if let Ok(env_var_value) = env::var("DOCLOAD_CONFIG") {
        debug!("Using config from env var 'DOCLOAD_CONFIG'");
        Ok(env_var_value)
    } else {
        debug!("Attempting to open configuration file at: {config_path}");
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .open(config_path)
            .map_err(|err| {
                error!("Could not read config file '{config_path}': {err}");
                err
            })?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(contents)
    }
}

fn parse_config(contents: &str) -> Result<Config, Error> {
    Config::from_yaml(contents).map_err(|err| {
        error!("Configuration validation failed: {err}");
        Error::Config(err)
    })
}

fn get_config(args: &RunCommand) -> Result<Config, Error> {
    let contents = load_config_contents(&args.config_path)?;
    let mut config = parse_config(&contents)?;

    if let Some(duration_seconds) = args.duration_seconds {
        config.duration_seconds = duration_seconds;
    }
    if let Some(writers) = args.writers {
        config.writers = writers;
    }
    if let Some(readers) = args.readers {
        config.readers = readers;
    }
    if let Some(connection_string) = &args.connection_string {
        config.mongodb.connection_string.clone_from(connection_string);
    }
    if let Some(server) = &args.push_gateway {
        let push_gateway = config
            .telemetry
            .push_gateway
            .get_or_insert_with(push::Config::default);
        push_gateway.server.clone_from(server);
    }
    // Overrides may have produced a run that cannot happen.
    config.validate().map_err(|err| {
        error!("Configuration validation failed: {err}");
        Error::Config(err)
    })?;
    Ok(config)
}

async fn inner_main(config: Config) -> Result<(), Error> {
    let telemetry = Arc::new(Telemetry::new(&config.telemetry));
    let engine = Engine::init(&config, telemetry)
        .await
        .map_err(|err| {
            error!("Failed to initialize load run: {err}");
            err
        })?;
    let queue = engine.queue();

    let (cancel_watcher, cancel_broadcaster) = docload_signal::signal();
    let run = engine.start(cancel_watcher);
    tokio::pin!(run);
    let finished = tokio::select! {
        res = &mut run => Some(res),
        _ = signal::ctrl_c() => None,
    };
    let res = match finished {
        Some(res) => res,
        None => {
            info!("received ctrl-c, stopping load run early");
            cancel_broadcaster.signal();
            run.await
        }
    };
    let report = res.map_err(|err| {
        error!("Load run failed: {err}");
        err
    })?;
    info!("Load run complete.\n{report}");

    match queue.size().await {
        Ok(size) => info!(size, "items remaining in queue"),
        Err(err) => warn!("could not read queue size: {err}"),
    }
    match queue.head().await {
        Ok(Some(item)) => info!(
            identifier = %item.identifier,
            origin = %item.origin,
            timestamp = item.timestamp,
            "queue head"
        ),
        Ok(None) => {}
        Err(err) => warn!("could not read queue head: {err}"),
    }
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .finish()
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .finish()
            .init(),
    }
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting docload {version}.");

    let args = match cli.command {
        Commands::Run(run_cmd) => run_cmd,
        Commands::ConfigCheck(config_check_cmd) => {
            let valid = load_config_contents(&config_check_cmd.config_path)
                .and_then(|contents| parse_config(&contents));
            match valid {
                Ok(_) => {
                    info!("Configuration file is valid");
                    std::process::exit(0)
                }
                Err(_) => std::process::exit(1),
            }
        }
    };

    let config = get_config(&args)?;
    let max_shutdown_delay = Duration::from_secs(args.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config));
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res
}

#[cfg(test)]
mod test {
    use super::*;

    fn run_command(config_path: &str) -> RunCommand {
        RunCommand {
            config_path: config_path.to_string(),
            duration_seconds: None,
            writers: None,
            readers: None,
            connection_string: None,
            push_gateway: None,
            max_shutdown_delay: 10,
        }
    }

    #[test]
    fn cli_overrides_config_file() {
        let dir = tempfile::tempdir().expect("directory could not be created");
        let path = dir.path().join("docload.yaml");
        std::fs::write(&path, "writers: 3\nreaders: 0\n").expect("write config");

        let mut args = run_command(path.to_str().expect("utf8 path"));
        args.duration_seconds = Some(5);
        args.readers = Some(2);
        args.connection_string = Some("mongodb://db.internal:27017".to_string());
        args.push_gateway = Some("gateway.internal:9091".to_string());

        let config = get_config(&args).expect("config");
        assert_eq!(config.duration_seconds, 5);
        assert_eq!(config.writers, 3);
        assert_eq!(config.readers, 2);
        assert_eq!(config.mongodb.connection_string, "mongodb://db.internal:27017");
        let push = config.telemetry.push_gateway.expect("push gateway");
        assert_eq!(push.server, "gateway.internal:9091");
        assert_eq!(push.frequency_seconds, 30);
    }

    #[test]
    fn overrides_are_validated() {
        let dir = tempfile::tempdir().expect("directory could not be created");
        let path = dir.path().join("docload.yaml");
        std::fs::write(&path, "writers: 3\nreaders: 0\n").expect("write config");

        let mut args = run_command(path.to_str().expect("utf8 path"));
        args.writers = Some(0);
        assert!(matches!(
            get_config(&args),
            Err(Error::Config(config::Error::NoWorkers))
        ));
    }

    #[test]
    fn subcommands_parse() {
        let cli = Cli::try_parse_from([
            "docload",
            "run",
            "--config-path",
            "/tmp/docload.yaml",
            "--writers",
            "4",
            "--log-format",
            "json",
        ])
        .expect("run parses");
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.config_path, "/tmp/docload.yaml");
                assert_eq!(args.writers, Some(4));
            }
            Commands::ConfigCheck(_) => panic!("expected run"),
        }

        let cli = Cli::try_parse_from(["docload", "config-check"]).expect("config-check parses");
        assert!(matches!(cli.command, Commands::ConfigCheck(_)));
    }
}
