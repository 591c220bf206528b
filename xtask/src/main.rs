//! Build automation tasks for the broker-pool workspace.
//!
//! Run with `cargo xtask <command>`.
//!
//! ## Available Commands
//!
//! - `ci`: Run all CI checks (format, lint, test, deny)
//! - `fmt`: Check/apply code formatting
//! - `clippy`: Run clippy lints
//! - `test`: Run all tests
//! - `deny`: Run cargo-deny checks
//! - `doc`: Generate documentation
//! - `clean`: Clean build artifacts
//! - `broker`: Start or stop a local RabbitMQ container for integration tests
//! - `coverage`: Run code coverage
//! - `semver`: Check publishable crates for semver violations

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

/// Crates published to crates.io.
const PUBLISHED_CRATES: [&str; 2] = ["broker-pool", "broker-amqp"];

/// Name of the container started by `cargo xtask broker up`.
const BROKER_CONTAINER: &str = "broker-pool-rabbitmq";

#[derive(Parser)]
#[command(name = "xtask", about = "Build automation for broker-pool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run all checks (format, lint, test, deny)
    Ci,
    /// Run cargo fmt (--check by default, --fix to apply)
    Fmt {
        /// Apply formatting fixes
        #[arg(long)]
        fix: bool,
    },
    /// Run clippy with all features
    Clippy {
        /// Apply clippy suggestions
        #[arg(long)]
        fix: bool,
    },
    /// Run all tests
    Test {
        /// Test a specific package
        #[arg(short, long)]
        package: Option<String>,
        /// Also run ignored tests that need Docker or a live broker
        #[arg(long)]
        integration: bool,
    },
    /// Run cargo-deny checks
    Deny,
    /// Generate documentation
    Doc {
        /// Open documentation in browser
        #[arg(long)]
        open: bool,
    },
    /// Clean build artifacts
    Clean,
    /// Manage a local RabbitMQ container (requires Docker)
    Broker {
        #[command(subcommand)]
        action: BrokerAction,
    },
    /// Run code coverage
    Coverage {
        /// Output format (html, lcov, json)
        #[arg(long, default_value = "html")]
        format: String,
    },
    /// Check for semver violations (requires cargo-semver-checks)
    Semver,
}

#[derive(Subcommand)]
enum BrokerAction {
    /// Start RabbitMQ with the management plugin on the default ports
    Up {
        /// Image tag to run
        #[arg(long, default_value = "3.13-management-alpine")]
        tag: String,
    },
    /// Stop and remove the container
    Down,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    // Change to workspace root
    let workspace_root = workspace_root()?;
    sh.change_dir(&workspace_root);

    match cli.command {
        Command::Ci => {
            println!("Running CI checks...");
            fmt(&sh, false)?;
            clippy(&sh, false)?;
            test(&sh, None, false)?;
            deny(&sh)?;
            println!("\n✅ All CI checks passed!");
        }
        Command::Fmt { fix } => fmt(&sh, fix)?,
        Command::Clippy { fix } => clippy(&sh, fix)?,
        Command::Test {
            package,
            integration,
        } => test(&sh, package.as_deref(), integration)?,
        Command::Deny => deny(&sh)?,
        Command::Doc { open } => doc(&sh, open)?,
        Command::Clean => clean(&sh)?,
        Command::Broker { action } => broker(&sh, action)?,
        Command::Coverage { format } => coverage(&sh, &format)?,
        Command::Semver => semver(&sh)?,
    }

    Ok(())
}

fn workspace_root() -> Result<PathBuf> {
    let output = std::process::Command::new("cargo")
        .args(["locate-project", "--workspace", "--message-format=plain"])
        .output()
        .context("failed to run cargo locate-project")?;

    let path = String::from_utf8(output.stdout)
        .context("invalid UTF-8 in cargo output")?
        .trim()
        .to_string();

    Ok(PathBuf::from(path)
        .parent()
        .context("failed to get workspace root")?
        .to_path_buf())
}

fn fmt(sh: &Shell, fix: bool) -> Result<()> {
    if fix {
        println!("Applying formatting...");
        cmd!(sh, "cargo fmt --all").run()?;
        println!("✅ Formatting applied.");
    } else {
        println!("Checking formatting...");
        cmd!(sh, "cargo fmt --all -- --check").run()?;
        println!("✅ Formatting check passed.");
    }
    Ok(())
}

fn clippy(sh: &Shell, fix: bool) -> Result<()> {
    if fix {
        println!("Applying clippy suggestions...");
        cmd!(
            sh,
            "cargo clippy --all-features --all-targets --fix --allow-dirty"
        )
        .run()?;
        println!("✅ Clippy suggestions applied.");
    } else {
        println!("Running clippy...");
        cmd!(
            sh,
            "cargo clippy --all-features --all-targets -- -D warnings"
        )
        .run()?;
        println!("✅ Clippy check passed.");
    }
    Ok(())
}

fn test(sh: &Shell, package: Option<&str>, integration: bool) -> Result<()> {
    println!("Running tests...");

    let mut args = vec!["test"];

    if let Some(pkg) = package {
        args.push("-p");
        args.push(pkg);
    } else {
        args.push("--workspace");
    }

    args.push("--all-features");

    if integration {
        args.push("--");
        args.push("--include-ignored");
    }

    cmd!(sh, "cargo {args...}").run()?;
    println!("✅ All tests passed.");
    Ok(())
}

fn deny(sh: &Shell) -> Result<()> {
    println!("Running cargo-deny...");
    cmd!(sh, "cargo deny check").run()?;
    println!("✅ Cargo-deny check passed.");
    Ok(())
}

fn doc(sh: &Shell, open: bool) -> Result<()> {
    println!("Generating documentation...");
    if open {
        cmd!(sh, "cargo doc --all-features --no-deps --open").run()?;
    } else {
        cmd!(sh, "cargo doc --all-features --no-deps").run()?;
    }
    println!("✅ Documentation generated.");
    Ok(())
}

fn clean(sh: &Shell) -> Result<()> {
    println!("Cleaning build artifacts...");
    cmd!(sh, "cargo clean").run()?;
    println!("✅ Clean complete.");
    Ok(())
}

fn broker(sh: &Shell, action: BrokerAction) -> Result<()> {
    match action {
        BrokerAction::Up { tag } => {
            println!("Starting RabbitMQ ({tag})...");
            let image = format!("rabbitmq:{tag}");
            cmd!(
                sh,
                "docker run -d --name {BROKER_CONTAINER} -p 5672:5672 -p 15672:15672 -e RABBITMQ_DEFAULT_USER=admin -e RABBITMQ_DEFAULT_PASS=admin {image}"
            )
            .run()?;
            println!("✅ RabbitMQ started. Run the live tests with:");
            println!("   RABBITMQ_HOST=localhost cargo xtask test --integration");
        }
        BrokerAction::Down => {
            println!("Stopping RabbitMQ...");
            cmd!(sh, "docker rm -f {BROKER_CONTAINER}").run()?;
            println!("✅ RabbitMQ stopped.");
        }
    }
    Ok(())
}

fn coverage(sh: &Shell, format: &str) -> Result<()> {
    println!("Running code coverage...");

    // Requires cargo-llvm-cov
    match format {
        "html" => {
            cmd!(sh, "cargo llvm-cov --workspace --all-features --html").run()?;
            println!("✅ Coverage report: target/llvm-cov/html/index.html");
        }
        "lcov" => {
            cmd!(
                sh,
                "cargo llvm-cov --workspace --all-features --lcov --output-path target/lcov.info"
            )
            .run()?;
            println!("✅ Coverage report: target/lcov.info");
        }
        "json" => {
            cmd!(
                sh,
                "cargo llvm-cov --workspace --all-features --json --output-path target/coverage.json"
            )
            .run()?;
            println!("✅ Coverage report: target/coverage.json");
        }
        _ => {
            bail!(
                "Unknown coverage format: {}. Use html, lcov, or json.",
                format
            );
        }
    }

    Ok(())
}

fn semver(sh: &Shell) -> Result<()> {
    println!("Checking for semver violations...");

    for crate_name in PUBLISHED_CRATES {
        println!("  Checking {crate_name}...");
        cmd!(sh, "cargo semver-checks check-release -p {crate_name}").run()?;
    }

    println!("✅ No semver violations detected.");
    Ok(())
}
