use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build and test honeyjar")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the honeyjar binary
    Build {
        /// Build in release mode
        #[arg(long)]
        release: bool,

        /// Target architecture for cross-compilation (e.g., x86_64-unknown-linux-gnu, aarch64-unknown-linux-gnu)
        #[arg(long)]
        target: Option<String>,
    },

    /// Run the test-suite, optionally as root so kernel tests do not skip
    Test {
        /// Run test binaries through `sudo -E`
        #[arg(long)]
        privileged: bool,

        /// Extra arguments passed to `cargo test`
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Build honeyjar and run its built-in scenarios
    Scenarios {
        /// Run through `sudo -E`
        #[arg(long)]
        privileged: bool,

        /// Only run these scenarios
        #[arg(long)]
        only: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { release, target } => {
            build(release, target.as_deref())?;
        }
        Commands::Test { privileged, args } => {
            test(privileged, &args)?;
        }
        Commands::Scenarios { privileged, only } => {
            scenarios(privileged, &only)?;
        }
    }

    Ok(())
}

fn project_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .context("xtask has no parent directory")
}

fn sudo() -> Result<PathBuf> {
    which::which("sudo").context("--privileged needs sudo on PATH")
}

fn host_triple() -> Result<String> {
    let output = Command::new("rustc")
        .arg("-vV")
        .output()
        .context("Failed to run rustc -vV")?;
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|line| line.strip_prefix("host: "))
        .map(str::to_string)
        .context("rustc -vV did not report a host triple")
}

/// `CARGO_TARGET_<TRIPLE>_RUNNER` for `triple`.
fn runner_var(triple: &str) -> String {
    format!(
        "CARGO_TARGET_{}_RUNNER",
        triple.to_uppercase().replace(['-', '.'], "_")
    )
}

fn build(release: bool, target: Option<&str>) -> Result<()> {
    let root = project_root()?;

    println!("🔨 Building honeyjar...");

    // Determine if we need cross-compilation (Linux target from non-Linux host)
    let is_cross_compile =
        target.map(|t| t.contains("linux")).unwrap_or(false) && !cfg!(target_os = "linux");

    let build_cmd = if is_cross_compile {
        if which::which("cross").is_ok() {
            println!("   Using 'cross' for cross-compilation");
            "cross"
        } else {
            bail!(
                "Cross-compilation to Linux requires 'cross' tool.\n\
                 Install with: cargo install cross\n\
                 Also requires Docker to be running."
            );
        }
    } else {
        "cargo"
    };

    let mut cmd = Command::new(build_cmd);
    cmd.current_dir(&root);
    cmd.arg("build");

    if release {
        cmd.arg("--release");
    }

    if let Some(t) = target {
        cmd.arg("--target").arg(t);
        println!("   Target: {}", t);
    }

    cmd.arg("-p").arg("honeyjar");

    let status = cmd.status().context("Failed to run cargo build")?;

    if !status.success() {
        bail!("Build failed");
    }

    let profile = if release { "release" } else { "debug" };
    let binary_path = match target {
        Some(t) => root.join("target").join(t).join(profile).join("honeyjar"),
        None => root.join("target").join(profile).join("honeyjar"),
    };

    println!("✅ Build complete: {}", binary_path.display());

    Ok(())
}

fn test(privileged: bool, args: &[String]) -> Result<()> {
    let root = project_root()?;

    let mut cmd = Command::new("cargo");
    cmd.current_dir(&root).arg("test").arg("--workspace");
    if privileged {
        let runner = format!("{} -E", sudo()?.display());
        println!("🔐 Running tests through {runner}");
        cmd.env(runner_var(&host_triple()?), runner);
    }
    if !args.is_empty() {
        cmd.arg("--").args(args);
    }

    let status = cmd.status().context("Failed to run cargo test")?;
    if !status.success() {
        bail!("Tests failed");
    }
    println!("✅ Tests passed");
    Ok(())
}

fn scenarios(privileged: bool, only: &[String]) -> Result<()> {
    build(false, None)?;
    let binary = project_root()?.join("target").join("debug").join("honeyjar");

    let mut cmd = if privileged {
        let mut cmd = Command::new(sudo()?);
        cmd.arg("-E").arg(&binary);
        cmd
    } else {
        Command::new(&binary)
    };
    cmd.arg("-v").arg("run");
    for name in only {
        cmd.arg("--only").arg(name);
    }

    let status = cmd.status().context("Failed to run honeyjar")?;
    if !status.success() {
        bail!("Scenarios failed");
    }
    Ok(())
}
