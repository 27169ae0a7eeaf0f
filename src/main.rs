use anyhow::{Context, Result};

mod classifier;
mod config;
mod filter;
mod forge;
mod interceptor;
mod nfqueue_handler;
mod packet;
mod tcp;

use config::{Config, ConfigError, Settings, TargetRule, DEFAULT_SETTINGS_PATH, SETTINGS_ENV};
use filter::Filter;
use forge::PacketForge;
use interceptor::Interceptor;
use nfqueue_handler::NfqueueTransport;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let rule = match TargetRule::from_args(&args) {
        Ok(rule) => rule,
        Err(e @ ConfigError::Usage(_)) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(rule) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(rule: TargetRule) -> Result<()> {
    let settings_path =
        std::env::var(SETTINGS_ENV).unwrap_or_else(|_| DEFAULT_SETTINGS_PATH.to_string());
    let settings = Settings::load_or_default(&settings_path)
        .with_context(|| format!("failed to load settings from {}", settings_path))?;
    let config = Config::new(rule, settings);
    let filter = Filter::from_rule(&config.rule);

    log::info!("=================================================");
    log::info!("port: {}", config.rule.port);
    log::info!("target host: {}", config.rule.target_host);
    log::info!("replacement host: {}", config.rule.replacement_host);
    log::info!("loopback: {}", config.rule.include_loopback);
    log::info!("filter: {}", filter);
    log::info!("queue: {}", config.settings.queue_num);
    log::info!("=================================================");

    let forge = PacketForge::new(&config).context("failed to build forged packet templates")?;
    let transport = NfqueueTransport::open(&filter, &config.settings)
        .context("failed to open the packet transport (are you root?)")?;

    let installed = transport.rule().map(|rule| rule.args().to_vec());
    ctrlc::set_handler(move || {
        log::info!("Received termination signal, shutting down");
        if let Some(args) = &installed {
            nfqueue_handler::remove_rule(args);
        }
        std::process::exit(0);
    })
    .context("failed to install signal handler")?;

    log::info!("Open success, receiving on queue {}", transport.queue_num());
    let mut interceptor = Interceptor::new(transport, &config, forge);
    interceptor.run()
}
