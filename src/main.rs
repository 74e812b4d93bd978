use anyhow::Result;
use devherd::configuration::{self, Config};
use slog::{o, Drain, Logger};
use slog_json::Json;
use slog_logfmt::Logfmt;
use slog_scope::{crit, debug};
use std::io;
use std::path::PathBuf;
use structopt::StructOpt;

fn setup_logger(config: &configuration::LogConfig) -> Logger {
    use configuration::LogFormat;
    use configuration::LogOutput::*;

    let output: Box<dyn io::Write + Send + Sync> = match config.output {
        Stderr => Box::new(io::stderr()),
        Stdout => Box::new(io::stdout()),
    };
    let level: slog::Level = config.level.into();
    match config.format {
        LogFormat::Json => {
            let drain = Json::new(output)
                .add_default_keys()
                .build()
                .filter_level(level)
                .fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            Logger::root(drain, o!("logger" => "devherd"))
        }
        LogFormat::Logfmt { print_prefix } => {
            let mut builder = Logfmt::new(output);
            if !print_prefix {
                builder = builder.no_prefix().print_msg(true);
            }
            let drain = builder.build().filter_level(level).fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            Logger::root(drain, o!("logger" => "devherd"))
        }
    }
}

#[derive(StructOpt, Debug)]
enum Command {
    /// Launch all services, wait for them to become ready and keep them running until
    /// interrupted. This is the default.
    Start,

    /// Stop the services a running `start` launched, going by its PID file.
    Stop,
}

/// Runs a fixed set of local development services and tears them down again.
#[derive(StructOpt, Debug)]
#[structopt(name = "devherd")]
struct Opt {
    /// Path to the configuration file listing the services.
    #[structopt(short = "f", long, default_value = "./devherd.toml")]
    config_file: PathBuf,

    #[structopt(subcommand)]
    command: Option<Command>,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();
    let settings = Config::from_file(&opt.config_file)?;
    let log = setup_logger(&settings.log);
    let _guard = slog_scope::set_global_logger(log);
    debug!("loaded configuration"; "services" => settings.services.len(), "base_dir" => ?settings.base_dir);

    let res = smol::run(async {
        match opt.command.unwrap_or(Command::Start) {
            Command::Start => devherd::start(&settings).await,
            Command::Stop => devherd::stop(&settings).await,
        }
    });
    if let Err(e) = &res {
        crit!("exiting"; "error" => ?e);
    }
    res
}
