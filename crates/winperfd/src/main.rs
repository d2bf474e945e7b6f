//! winperfd - Windows performance-data exporter daemon.
//!
//! Polls .NET CLR, VMware guest and Task Scheduler data on an interval and
//! publishes it in the Prometheus text format, either on stdout or as an
//! atomically replaced textfile for a node exporter's textfile collector.

mod exposition;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use winperf_core::config::{ConfigError, NameList, parse_duration};
use winperf_core::metric::{DescRegistry, NAMESPACE, fq_name};
use winperf_core::{Config, NativeSession, Registry, Sample, Scrape, ValueKind};

/// Windows performance-data exporter.
#[derive(Parser, Debug, Default)]
#[command(name = "winperfd", about = "Windows performance-data exporter", version)]
struct Args {
    /// YAML configuration file. Flags given on the command line override it.
    #[arg(long = "config.file", value_name = "PATH")]
    config_file: Option<PathBuf>,

    /// Comma-separated list of collectors to enable.
    #[arg(long = "collectors.enabled", value_name = "LIST")]
    collectors_enabled: Option<String>,

    /// Regexp of task paths to include (e.g. "/Microsoft/.+").
    #[arg(long = "collector.scheduled_task.include", value_name = "REGEX")]
    scheduled_task_include: Option<String>,

    /// Regexp of task paths to exclude.
    #[arg(long = "collector.scheduled_task.exclude", value_name = "REGEX")]
    scheduled_task_exclude: Option<String>,

    /// Comma-separated list of .NET sub-collectors (clrexceptions, clrjit).
    #[arg(long = "collector.netframework.enabled", value_name = "LIST")]
    netframework_enabled: Option<String>,

    /// Regexp of process names to include.
    #[arg(long = "collector.netframework.include", value_name = "REGEX")]
    netframework_include: Option<String>,

    /// Regexp of process names to exclude.
    #[arg(long = "collector.netframework.exclude", value_name = "REGEX")]
    netframework_exclude: Option<String>,

    /// Per-scrape deadline for all collectors (e.g. "10s", "500ms").
    #[arg(long = "scrape.timeout", value_name = "DURATION", value_parser = parse_duration)]
    scrape_timeout: Option<Duration>,

    /// Time between scrapes.
    #[arg(short, long, default_value = "15s", value_parser = parse_duration)]
    interval: Duration,

    /// Where to write the metrics: "-" for stdout, otherwise a file path.
    #[arg(short, long, default_value = "-")]
    output: String,

    /// Scrape once, write the result and exit.
    #[arg(long)]
    once: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// `RUST_LOG` directives are honoured on top of it.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["winperfd", "winperf_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    // Logs go to stderr; stdout may carry the metrics.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Loads the configuration file (if any) and applies command-line overrides.
fn load_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = match &args.config_file {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(list) = &args.collectors_enabled {
        config.collectors.enabled = NameList::parse(list);
    }

    let tasks = &mut config.collector.scheduled_task.filter;
    if let Some(include) = &args.scheduled_task_include {
        tasks.include = include.clone();
    }
    if let Some(exclude) = &args.scheduled_task_exclude {
        tasks.exclude = exclude.clone();
    }

    let netframework = &mut config.collector.netframework;
    if let Some(list) = &args.netframework_enabled {
        netframework.enabled = NameList::parse(list);
    }
    if let Some(include) = &args.netframework_include {
        netframework.filter.include = include.clone();
    }
    if let Some(exclude) = &args.netframework_exclude {
        netframework.filter.exclude = exclude.clone();
    }

    if let Some(timeout) = args.scrape_timeout {
        config.scrape.timeout = timeout;
    }

    config.validate()?;
    Ok(config)
}

#[cfg(windows)]
fn native_session() -> Arc<dyn NativeSession> {
    Arc::new(winperf_core::session::WindowsSession::new())
}

#[cfg(not(windows))]
fn native_session() -> Arc<dyn NativeSession> {
    warn!("Not running on Windows: serving a simulated host");
    Arc::new(winperf_core::MockSession::typical_host())
}

/// `windows_exporter_build_info{version,revision} 1`
fn build_info() -> Option<Sample> {
    let mut descs = DescRegistry::new();
    let desc = descs
        .register(
            fq_name(NAMESPACE, "exporter", "build_info"),
            "A metric with a constant '1' value labeled by version and revision from which winperfd was built.",
            &["version", "revision"],
        )
        .ok()?;
    Some(Sample {
        desc,
        kind: ValueKind::Gauge,
        value: 1.0,
        label_values: vec![
            env!("CARGO_PKG_VERSION").to_string(),
            env!("GIT_SHA").to_string(),
        ],
    })
}

/// Logs the outcome of a scrape.
fn report(scrape: &Scrape, number: u64) {
    for (collector, e) in scrape.failures() {
        warn!(collector, error = %e, "Collector failed");
    }
    let ok = scrape.outcomes.iter().filter(|o| o.succeeded()).count();
    info!(
        "Scrape #{} at {}: {} samples, {}/{} collectors succeeded",
        number,
        scrape.started_at.format("%H:%M:%S"),
        scrape.samples.len(),
        ok,
        scrape.outcomes.len()
    );
}

fn publish(output: &str, body: &str) -> std::io::Result<()> {
    if output == "-" {
        use std::io::Write;
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(body.as_bytes())?;
        stdout.flush()
    } else {
        exposition::write_textfile(std::path::Path::new(output), body)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("winperfd {} ({}) starting", env!("CARGO_PKG_VERSION"), env!("GIT_SHA"));

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut registry = match Registry::from_config(&config) {
        Ok(registry) => registry,
        Err(e) => {
            error!("Failed to set up collectors: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Config: collectors=[{}], interval={:?}, timeout={:?}, output={}",
        registry.names().join(","),
        args.interval,
        registry.timeout(),
        args.output
    );

    if let Err(e) = registry.build(native_session()) {
        // Broken collectors are dropped; the rest keep running.
        warn!("Some collectors are disabled: {}", e);
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let build_info = build_info();
    let mut scrape_count: u64 = 0;
    let mut exit = ExitCode::SUCCESS;

    while running.load(Ordering::SeqCst) {
        let mut scrape = registry.scrape();
        scrape_count += 1;
        report(&scrape, scrape_count);

        if scrape.is_failed() {
            error!("Every collector failed in scrape #{}", scrape_count);
            exit = ExitCode::FAILURE;
        } else {
            exit = ExitCode::SUCCESS;
        }

        scrape.samples.extend(build_info.clone());
        let body = exposition::encode(&scrape.samples);
        match publish(&args.output, &body) {
            Ok(()) => debug!("Wrote {} bytes to {}", body.len(), args.output),
            Err(e) => {
                error!("Failed to write metrics to {}: {}", args.output, e);
                exit = ExitCode::FAILURE;
            }
        }

        if args.once {
            break;
        }

        // Sleep with periodic checks for shutdown signal
        let sleep_interval = Duration::from_millis(100);
        let mut remaining = args.interval;
        while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
            let sleep_time = remaining.min(sleep_interval);
            std::thread::sleep(sleep_time);
            remaining = remaining.saturating_sub(sleep_time);
        }
    }

    info!("Shutting down...");
    if let Err(e) = registry.close() {
        error!("Failed to close collectors: {}", e);
    }
    info!("Shutdown complete");
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use winperf_core::CollectorKind;

    #[test]
    fn args_parse_dotted_flags() {
        let args = Args::try_parse_from([
            "winperfd",
            "--collectors.enabled",
            "vmware,scheduled_task",
            "--collector.scheduled_task.include",
            "/Microsoft/.+",
            "--scrape.timeout",
            "2s",
            "--interval",
            "500ms",
            "--once",
            "-vv",
        ])
        .unwrap();

        assert_eq!(args.collectors_enabled.as_deref(), Some("vmware,scheduled_task"));
        assert_eq!(args.scrape_timeout, Some(Duration::from_secs(2)));
        assert_eq!(args.interval, Duration::from_millis(500));
        assert!(args.once);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.output, "-");
    }

    #[test]
    fn flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "collectors:\n  enabled: netframework,vmware\n\
             collector:\n  netframework:\n    enabled: [clrjit]\n    include: w3wp\n\
             scrape:\n  timeout: 3s\n"
        )
        .unwrap();

        let args = Args {
            config_file: Some(file.path().to_path_buf()),
            netframework_exclude: Some("dotnet".to_string()),
            scrape_timeout: Some(Duration::from_secs(1)),
            ..Args::default()
        };
        let config = load_config(&args).unwrap();

        assert_eq!(
            config.enabled_collectors().unwrap(),
            vec![CollectorKind::NetFramework, CollectorKind::Vmware]
        );
        let netframework = &config.collector.netframework;
        assert_eq!(netframework.enabled.names(), &["clrjit".to_string()]);
        assert_eq!(netframework.filter.include, "w3wp");
        assert_eq!(netframework.filter.exclude, "dotnet");
        assert_eq!(config.scrape.timeout, Duration::from_secs(1));
    }

    #[test]
    fn invalid_override_is_rejected() {
        let args = Args {
            scheduled_task_include: Some("(unclosed".to_string()),
            ..Args::default()
        };
        assert!(matches!(
            load_config(&args),
            Err(ConfigError::InvalidPattern { .. })
        ));

        let args = Args {
            collectors_enabled: Some("netframework,cpu".to_string()),
            ..Args::default()
        };
        assert!(matches!(
            load_config(&args),
            Err(ConfigError::UnknownCollector(name)) if name == "cpu"
        ));
    }

    #[test]
    fn build_info_is_a_constant_gauge() {
        let sample = build_info().unwrap();
        assert_eq!(sample.desc.fq_name(), "windows_exporter_build_info");
        assert_eq!(sample.value, 1.0);
        assert_eq!(sample.label("version"), Some(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn simulated_scrape_renders_every_collector() {
        let mut registry = Registry::from_config(&Config::default()).unwrap();
        registry
            .build(Arc::new(winperf_core::MockSession::typical_host()))
            .unwrap();
        let scrape = registry.scrape();
        let body = exposition::encode(&scrape.samples);
        registry.close().unwrap();

        assert!(body.contains("# TYPE windows_netframework_clrjit_jit_time_percent gauge\n"));
        assert!(body.contains(
            "windows_netframework_clrjit_jit_time_percent{process=\"w3wp\"} 0.5\n"
        ));
        assert!(body.contains(
            "windows_scheduled_task_state{task=\"/Sync\",state=\"running\"} 1\n"
        ));
        assert!(body.contains("windows_exporter_collector_success{collector=\"vmware\"} 1\n"));
    }
}
