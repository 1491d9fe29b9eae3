#![deny(unused_must_use)]
use fathom_sender::config::Config;
use fathom_sender::{Estimator, Sender};
use tracing_subscriber::EnvFilter;

fn init_tracing(level: &str) {
    // result lines go to stdout; everything diagnostic goes to stderr with
    // minimal framing so the !! / ## message prefixes stay readable
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr);
    match EnvFilter::try_new(level) {
        Ok(filter) => builder.with_env_filter(filter).init(),
        Err(e) => {
            eprintln!("Warning: invalid log level '{}': {}. Using info.", level, e);
            tracing_subscriber::fmt()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr)
                .with_env_filter(EnvFilter::new("info"))
                .init();
        }
    }
}

fn main() {
    let mut config = Config::load_or_default();
    if let Some(target) = std::env::args().nth(1) {
        config.sender.target = target;
    }

    init_tracing(&config.logging.level);

    if let Err(e) = config.sender.validate() {
        tracing::error!("!! {}", e);
        std::process::exit(2);
    }

    let mut sender = match Sender::new(config.sender) {
        Ok(sender) => sender,
        Err(e) => {
            tracing::error!("!! error setting up measurement: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = sender.setup_run() {
        tracing::error!(
            "!! error doing initial jig with remote: {}.  bailing out. (restart receiver and try again.)",
            e
        );
        sender.cleanup();
        std::process::exit(1);
    }

    // run() only returns on a fatal error
    if let Err(e) = sender.run() {
        tracing::error!("!! {}", e);
    }
    sender.cleanup();
    tracing::error!("!! fathom sender exiting");
    std::process::exit(1);
}
