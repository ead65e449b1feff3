use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::*;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use recon_engine::{
    aggregate::{keys, order, Aggregator},
    config::ReconConfig,
    orchestrator::Orchestrator,
    output::{write_report, OutputFormat},
    probe::{HttpProbe, Probe, ReachabilityProbe, ResolveProbe},
    session::HttpTransport,
    target::{Target, TargetExpander},
    ReconError,
};

const PROBES: [&str; 3] = ["reachability", "resolve", "http"];

fn cli() -> Command {
    Command::new("recon")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Concurrent network reconnaissance: expand targets, probe, aggregate")
        .arg(
            Arg::new("targets")
                .short('t')
                .long("targets")
                .value_name("TARGETS")
                .help("Comma separated targets: addresses, CIDR blocks, domains, URLs"),
        )
        .arg(
            Arg::new("probe")
                .short('P')
                .long("probe")
                .value_name("NAME")
                .help("Probe to run (repeatable)")
                .value_parser(PROBES)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("ports")
                .short('p')
                .long("ports")
                .value_name("PORTS")
                .help("Ports for the reachability probe, e.g. 22,80,8000-8100"),
        )
        .arg(
            Arg::new("concurrency")
                .short('c')
                .long("concurrency")
                .value_name("N")
                .help("Worker tasks per probe")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("rate-limit")
                .long("rate-limit")
                .value_name("N")
                .help("Admissions per window for each probe, 0 for unlimited")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("rate-limit-window")
                .long("rate-limit-window")
                .value_name("SECONDS")
                .help("Rate limit window in seconds")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("retries")
                .long("retries")
                .value_name("N")
                .help("Additional attempts after a transient failure")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("SECONDS")
                .help("Per-attempt timeout in seconds")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("PATH")
                .help("Write the report to this file instead of stdout")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_name("FORMAT")
                .help("Report format: text, json or csv (default: from --output extension, else text)"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file (default: ~/.recon.toml)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Debug logging")
                .action(ArgAction::SetTrue),
        )
}

fn parse_ports(port_spec: &str) -> anyhow::Result<Vec<u16>> {
    let mut ports = Vec::new();

    for part in port_spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let start: u16 = start
                .trim()
                .parse()
                .with_context(|| format!("Invalid start port '{}'", start))?;
            let end: u16 = end
                .trim()
                .parse()
                .with_context(|| format!("Invalid end port '{}'", end))?;
            if start == 0 || end == 0 {
                anyhow::bail!("Port 0 is not valid");
            }
            if start > end {
                anyhow::bail!("Start port {} cannot be greater than end port {}", start, end);
            }
            ports.extend(start..=end);
        } else {
            let port: u16 = part
                .parse()
                .with_context(|| format!("Invalid port '{}'", part))?;
            if port == 0 {
                anyhow::bail!("Port 0 is not valid");
            }
            ports.push(port);
        }
    }

    if ports.is_empty() {
        anyhow::bail!("No ports given");
    }
    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}

fn seconds(value: f64, flag: &str) -> anyhow::Result<Duration> {
    if !value.is_finite() || value <= 0.0 {
        anyhow::bail!("--{} must be a positive number of seconds", flag);
    }
    Ok(Duration::from_secs_f64(value))
}

/// Defaults, then the config file, then flags
fn load_config(matches: &ArgMatches) -> anyhow::Result<ReconConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => ReconConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ReconConfig::load_default_config().context("Failed to load default config")?,
    };

    if let Some(targets) = matches.get_one::<String>("targets") {
        config.targets = targets.clone();
    }
    if let Some(probes) = matches.get_many::<String>("probe") {
        config.probes = probes.cloned().collect();
    }
    if let Some(ports) = matches.get_one::<String>("ports") {
        config.ports = parse_ports(ports)?;
    }
    if let Some(&concurrency) = matches.get_one::<usize>("concurrency") {
        config.concurrency = concurrency;
    }
    if let Some(&rate_limit) = matches.get_one::<u32>("rate-limit") {
        config.rate_limit = rate_limit;
    }
    if let Some(&window) = matches.get_one::<f64>("rate-limit-window") {
        config.rate_limit_window_ms = seconds(window, "rate-limit-window")?.as_millis() as u64;
    }
    if let Some(&retries) = matches.get_one::<u32>("retries") {
        config.retries = retries;
    }
    if let Some(&timeout) = matches.get_one::<f64>("timeout") {
        config.timeout_ms = seconds(timeout, "timeout")?.as_millis().max(1) as u64;
    }

    if config.targets.trim().is_empty() {
        anyhow::bail!("No targets given (use --targets or set `targets` in the config file)");
    }
    config.validate()?;
    Ok(config)
}

fn init_logging(config: &ReconConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.log_level.as_str() };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn build_probe(name: &str, config: &ReconConfig, orchestrator: &Orchestrator) -> anyhow::Result<Arc<dyn Probe>> {
    let limiter = orchestrator.rate_limiter();
    let probe: Arc<dyn Probe> = match name {
        "reachability" => Arc::new(
            ReachabilityProbe::new(config.ports.clone(), config.timeout()).with_rate_limiter(limiter),
        ),
        "resolve" => Arc::new(ResolveProbe::new(config.resolve_timeout()).with_rate_limiter(limiter)),
        "http" => {
            let transport = HttpTransport::with_options(config.timeout(), true)?;
            Arc::new(HttpProbe::new(Arc::new(transport), limiter, config.retry_policy()))
        }
        other => return Err(ReconError::UnknownProbe(other.to_string()).into()),
    };
    Ok(probe)
}

fn output_format(matches: &ArgMatches) -> anyhow::Result<OutputFormat> {
    if let Some(format) = matches.get_one::<String>("format") {
        return Ok(format.parse::<OutputFormat>()?);
    }
    Ok(matches
        .get_one::<PathBuf>("output")
        .and_then(|path| OutputFormat::from_path(path))
        .unwrap_or(OutputFormat::Text))
}

fn report_aggregator(probes: &[String]) -> Aggregator {
    if probes.len() == 1 && probes[0] == "reachability" {
        Aggregator::port_scan()
    } else {
        Aggregator::new(|r| format!("{}|{}", r.source, keys::ip_port(r))).with_order(|a, b| {
            order::by_target(a, b).then_with(|| order::insecure_first_then_port(a, b))
        })
    }
}

async fn run(matches: ArgMatches) -> anyhow::Result<()> {
    let config = load_config(&matches)?;
    init_logging(&config, matches.get_flag("verbose"));
    let format = output_format(&matches)?;

    let targets = TargetExpander::new(config.max_expansion)
        .expand_list(&config.targets)
        .context("Invalid targets")?;

    let orchestrator = Arc::new(Orchestrator::from_config(&config)?);
    log::info!(
        "[{}] {} targets, probes: {}",
        orchestrator.run_id(),
        targets.len(),
        config.probes.join(", ")
    );

    let mut selected: Vec<(String, Vec<Target>)> = Vec::new();
    for name in &config.probes {
        let probe = build_probe(name, &config, &orchestrator)?;
        let accepted: Vec<Target> = targets
            .iter()
            .filter(|t| probe.accepts(t.kind()))
            .cloned()
            .collect();
        if accepted.len() < targets.len() {
            log::info!(
                "[{}] Skipping {} target(s) of kinds it does not handle",
                name,
                targets.len() - accepted.len()
            );
        }
        orchestrator.register(probe).await?;
        selected.push((name.clone(), accepted));
    }
    for (name, accepted) in selected {
        orchestrator.start(&name, accepted).await?;
    }

    let stopper = orchestrator.clone();
    let grace = config.stop_grace();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "[~] Interrupted, stopping probes...".bright_yellow());
            stopper.stop_all(grace).await;
        }
    });

    orchestrator.wait().await;

    let results = orchestrator.results().await;
    let report = report_aggregator(&config.probes).aggregate(results);
    write_report(&report, format, matches.get_one::<PathBuf>("output").map(PathBuf::as_path))?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    if let Err(e) = run(matches).await {
        eprintln!("{} {:#}", "Error:".bright_red(), e);
        process::exit(1);
    }
}
