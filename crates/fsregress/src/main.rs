use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use env_logger::Env;
use fsregress_lib::affinity::pin_to_core;
use fsregress_lib::cli::{Cli, USAGE_EXIT};
use fsregress_lib::{HarnessConfig, Registry, RunContext, Sequencer, Status};
use log::{error, info};
use std::io;
use std::process;

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version come through here too
            let code = if e.use_stderr() { USAGE_EXIT } else { 0 };
            let _ = e.print();
            process::exit(code);
        }
    };

    // Initialize logger with specified or default log level
    let env = match cli.log_level {
        Some(ref log_level) => Env::default().filter_or("RUST_LOG", log_level),
        None => Env::default().filter_or("RUST_LOG", "info"),
    };
    env_logger::init_from_env(env);

    match run(&cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    let registry = Registry::default_suite();
    if cli.list {
        for (i, case) in registry.iter().enumerate() {
            println!("{:>2}. {}", i + 1, case.name());
        }
        return Ok(0);
    }

    let mut config = HarnessConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;
    config.apply_cli(cli)?;
    config.validate().context("Invalid configuration")?;

    let core = config.core_mask()?.single_core()?;
    pin_to_core(core).with_context(|| format!("Failed to pin to core {}", core))?;

    let mut engine = config
        .build_engine()
        .context("Failed to initialize storage engine")?;
    info!(
        "fsregress {} using engine {}",
        fsregress_lib::version(),
        engine.name()
    );

    println!(
        " Perform test {} ... (engine {}, {})",
        config.tier.label(),
        engine.name(),
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );

    let report = {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let mut ctx = RunContext::new(
            engine.as_mut(),
            config.tier,
            config.aio_settings(),
            &mut out,
        );
        Sequencer::new(&registry).run(&mut ctx)
    };
    // Tear the engine down before exiting; process::exit skips destructors
    drop(engine);

    let status = report.status();
    match status {
        Status::Success => println!(
            " All {} regression tests passed successfully.",
            report.results.len()
        ),
        Status::Failed(code) => println!(
            " Regression run failed at test {} with status {}.",
            report.first_failure.unwrap_or(0),
            code
        ),
    }
    Ok(status.code())
}
