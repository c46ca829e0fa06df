use anyhow::{bail, Context, Result};
use chi_monitor::{logging, Monitor};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG: &str = "monitor_config.json";

struct Args {
    config: PathBuf,
    interval: Duration,
    once: bool,
    check: bool,
}

fn usage() -> &'static str {
    "usage: chi-monitor [CONFIG] [--interval SECONDS] [--once] [--check]"
}

fn parse_args() -> Result<Args> {
    let mut config: Option<PathBuf> = None;
    let mut interval = Duration::from_secs(2);
    let mut once = false;
    let mut check = false;
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--once" => once = true,
            "--check" => check = true,
            "--interval" => {
                let raw = it.next().context("--interval needs a value")?;
                let secs: f64 = raw
                    .parse()
                    .with_context(|| format!("invalid --interval '{raw}'"))?;
                if !(secs > 0.0) {
                    bail!("--interval must be greater than zero");
                }
                interval = Duration::from_secs_f64(secs);
            }
            "-h" | "--help" => {
                println!("{}", usage());
                std::process::exit(0);
            }
            other if other.starts_with('-') => bail!("unknown option '{other}'\n{}", usage()),
            other => config = Some(PathBuf::from(other)),
        }
    }
    let config = config
        .or_else(|| std::env::var("CHI_MONITOR_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    Ok(Args {
        config,
        interval,
        once,
        check,
    })
}

fn main() -> Result<()> {
    logging::init()?;
    let args = parse_args()?;

    if args.check {
        let loaded = chi_monitor::load(&args.config)?;
        for e in &loaded.errors {
            println!("{e}");
        }
        println!(
            "{} target(s), {} problem(s)",
            loaded.targets.len(),
            loaded.errors.len()
        );
        if !loaded.errors.is_empty() {
            std::process::exit(1);
        }
        return Ok(());
    }

    let monitor = Monitor::from_path(&args.config)
        .with_context(|| format!("starting monitor for {}", args.config.display()))?;
    let stdout = std::io::stdout();
    loop {
        std::thread::sleep(args.interval);
        let line = serde_json::to_string(&monitor.snapshot())?;
        let mut out = stdout.lock();
        writeln!(out, "{line}")?;
        out.flush()?;
        if args.once {
            break;
        }
    }
    monitor.shutdown();
    Ok(())
}
