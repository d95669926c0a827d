use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use honeyjar::features::Features;
use honeyjar::scenario;
use honeyjar::settings::Settings;
use honeyjar::{HookSpec, Link, Program, ProgramSpec, asm};
use log::info;
use tokio::signal;

#[derive(Debug, Parser)]
#[command(name = "honeyjar", about = "Load, run and attach raw eBPF programs")]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// YAML settings file; HONEYJAR_* variables override it
    #[arg(long, env = "HONEYJAR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Report which kernel capabilities are available
    Features,

    /// Run the built-in scenarios
    Run {
        /// Only run these scenarios
        #[arg(long)]
        only: Vec<String>,
    },

    /// Attach a no-op program to a hook until Ctrl-C or the timeout
    Attach {
        /// Hook as kind:target, e.g. tracepoint:sched:sched_switch
        hook: HookSpec,

        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if opt.verbose { "info" } else { "warn" },
    ))
    .init();

    let settings = Settings::load(opt.config.as_deref()).context("Failed to load settings")?;
    if settings.bump_memlock() {
        honeyjar::bump_memlock_rlimit();
    }

    match opt.command {
        Command::Features => {
            let features = tokio::task::spawn_blocking(Features::detect).await?;
            println!("{features}");
        }
        Command::Run { only } => run(settings, only).await?,
        Command::Attach { hook, seconds } => attach(hook, Duration::from_secs(seconds)).await?,
    }

    Ok(())
}

async fn run(settings: Settings, only: Vec<String>) -> Result<()> {
    let all = scenario::builtin();
    if let Some(unknown) = only.iter().find(|name| !all.iter().any(|s| s.name() == name.as_str())) {
        bail!("unknown scenario {unknown}");
    }

    let mut failed = 0;
    for s in all {
        if !only.is_empty() && !only.iter().any(|name| name == s.name()) {
            continue;
        }
        let name = s.name();
        let settings = settings.clone();
        let result = tokio::task::spawn_blocking(move || scenario::run_scenario(s.as_ref(), &settings))
            .await
            .with_context(|| format!("scenario {name} panicked"))?;
        match result {
            Ok(outcome) => println!("{name:<24} {outcome}"),
            Err(e) => {
                failed += 1;
                println!("{name:<24} FAILED: {e:#}");
            }
        }
    }

    if failed > 0 {
        bail!("{failed} scenario(s) failed");
    }
    Ok(())
}

async fn attach(hook: HookSpec, timeout: Duration) -> Result<()> {
    let spec = ProgramSpec::new("honeyjar_noop", hook.kind.program_type(), asm::return_imm(0));
    let program = Program::new(&spec).context("Failed to load program")?;
    let link = Link::attach(&program, &hook).with_context(|| format!("Failed to attach {hook}"))?;

    info!("Attached to {hook}. Press Ctrl-C to exit.");
    tokio::select! {
        res = signal::ctrl_c() => res?,
        _ = tokio::time::sleep(timeout) => {}
    }
    link.close();
    info!("Exiting...");
    Ok(())
}
