mod config;
mod connection;
mod reactor;

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{App, Arg};
use common::logging::{self, error, info, warn, LogTarget};

use config::Config;
use reactor::Reactor;

fn main() {
    let matches = App::new("Chat Server")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs the chat server core: framing, state store and dispatch over TCP.")
        .arg(Arg::with_name("HOST").long("host").takes_value(true).help("Bind host (overrides config file)"))
        .arg(Arg::with_name("PORT").long("port").takes_value(true).help("Bind port (overrides config file)"))
        .arg(Arg::with_name("CONFIG").long("config").takes_value(true).help("Path to a TOML configuration file"))
        .arg(Arg::with_name("LOG_FILE").long("log-file").takes_value(true).help("Write logs to this file instead of stderr"))
        .get_matches();

    let config_path = matches.value_of("CONFIG").map(PathBuf::from);
    let mut config = Config::load_layered(config_path.as_ref());

    if let Some(host) = matches.value_of("HOST") {
        config.host = host.to_string();
    }
    if let Some(port) = matches.value_of("PORT") {
        config.port = port.parse().expect("--port must be a valid u16");
    }
    if let Some(log_file) = matches.value_of("LOG_FILE") {
        config.log_file = Some(PathBuf::from(log_file));
    }

    let target = match &config.log_file {
        Some(path) => LogTarget::File(path.clone()),
        None => LogTarget::Stderr,
    };
    let log = logging::init(target, &config.log_level);

    info!(log, "starting chat server"; "bind" => %config.bind_address());

    let mut reactor = match Reactor::bind(&config, log.clone()) {
        Ok(reactor) => reactor,
        Err(err) => {
            error!(log, "failed to bind listener"; "error" => %err, "bind" => %config.bind_address());
            process::exit(1);
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        if let Err(err) = ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst)) {
            warn!(log, "failed to install SIGINT handler"; "error" => %err);
        }
    }

    reactor.run(&shutdown);
    info!(log, "clean shutdown complete");
    process::exit(0);
}
