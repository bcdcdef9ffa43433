//! jobservice - command-line entry point

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use tracing::{debug, info};

use jobservice::backends::JobInfo;
use jobservice::cli::{Cli, Commands};
use jobservice::config::ServiceConfig;
use jobservice::proxy::ServiceProxy;
use jobservice::sls::Setting;

fn setup_logging(verbose: bool) {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::WARN };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

/// Locale hint from the environment, in the usual precedence
fn env_locale() -> String {
    ["LC_ALL", "LC_MESSAGES", "LANG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|value| !value.is_empty())
        .unwrap_or_default()
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize output")?);
    Ok(())
}

fn print_job(info: &JobInfo) {
    println!("{}", info.name);
    if !info.description.is_empty() {
        println!("  description: {}", info.description);
    }
    if !info.version.is_empty() {
        println!("  version:     {}", info.version);
    }
    if !info.author.is_empty() {
        println!("  author:      {}", info.author);
    }
    println!("  backend:     {}", info.backend);
    println!("  running:     {}", info.running);
    println!("  automatic:   {}", info.automatic);
    if let Some(pid) = info.pid {
        println!("  pid:         {}", pid);
    }
    if !info.starton.is_empty() {
        println!("  start on:    {}", info.starton.join(", "));
    }
    if !info.stopon.is_empty() {
        println!("  stop on:     {}", info.stopon.join(", "));
    }
    println!(
        "  settings:    {}",
        match (info.descriptor_settings, info.backend_settings) {
            (true, true) => "descriptor, backend",
            (true, false) => "descriptor",
            (false, true) => "backend",
            (false, false) => "none",
        }
    );
}

fn print_settings(settings: &[Setting]) {
    for setting in settings {
        println!("{} ({}) = {}", setting.name, setting.kind, setting.value);
        if !setting.description.is_empty() {
            println!("    {}", setting.description);
        }
        if !setting.values.is_empty() {
            let names: Vec<&str> = setting.values.iter().map(|v| v.name.as_str()).collect();
            println!("    values: {}", names.join(", "));
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    setup_logging(cli.verbose);
    debug!("CLI arguments parsed");

    if let Commands::CheckConfig { path } = &cli.command {
        let config = ServiceConfig::load_from_file(path)?;
        config.validate().context("Configuration validation failed")?;
        println!("Configuration is valid: {}", path.display());
        return Ok(());
    }

    let config = ServiceConfig::load_or_default(cli.config.as_deref())?;
    config.validate().context("Configuration validation failed")?;

    let mut proxy = ServiceProxy::from_config(&config);
    info!(backends = ?proxy.backend_names(), "Service proxy ready");
    let jobs = proxy.enumerate();

    match cli.command {
        Commands::List => {
            if cli.json {
                print_json(&jobs)?;
            } else {
                for job in &jobs {
                    println!("{}", job);
                }
            }
        }
        Commands::Show { job } => {
            let info = proxy.describe(&job)?;
            if cli.json {
                print_json(&info)?;
            } else {
                print_job(&info);
            }
        }
        Commands::Start { job } => proxy.start(&job)?,
        Commands::Stop { job } => proxy.stop(&job)?,
        Commands::Enable { job } => proxy.set_automatic(&job, true)?,
        Commands::Disable { job } => proxy.set_automatic(&job, false)?,
        Commands::Settings { job, locale } => {
            let locale = locale.unwrap_or_else(env_locale);
            let settings = proxy.get_settings(&job, &locale)?;
            if cli.json {
                print_json(&settings)?;
            } else {
                print_settings(&settings);
            }
        }
        Commands::Set { job, assignments } => {
            let proposed: BTreeMap<String, String> = assignments.into_iter().collect();
            proxy.set_settings(&job, &proposed)?;
        }
        Commands::Validate { job, key, value } => {
            proxy.validate_setting(&job, &key, &value)?;
            println!("{} = {} is valid", key, value);
        }
        Commands::Toggle { job, key, on, .. } => proxy.toggle_setting(&job, &key, on)?,
        Commands::CheckConfig { .. } => {}
    }

    Ok(())
}
