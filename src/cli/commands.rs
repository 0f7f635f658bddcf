use std::io::Read;

use tracing::info;

use crate::classifier::classify;
use crate::cli::args::{ClassifyArgs, ConfigAction, ConfigArgs, ExecArgs, InitArgs, OutputFormat, StatusArgs};
use crate::config::loader::get_config_path;
use crate::config::types::PyrunConfig;
use crate::coordinator::{Coordinator, ExecutionRequest, ExecutionResult, ExecutorStatus};
use crate::error::{PyrunError, Result};
use crate::sandbox::ImageProvisioner;

// ============================================================================
// Execution Commands
// ============================================================================

/// Execute code once and print the normalized result
pub async fn exec(args: ExecArgs, mut config: PyrunConfig, format: OutputFormat) -> Result<()> {
    if let Some(backend) = args.backend {
        config.sandbox.backend = backend;
    }

    let code = match (&args.file, args.code.as_deref()) {
        (Some(path), _) => std::fs::read_to_string(path)?,
        (None, Some(code)) if code != "-" => code.to_string(),
        _ => read_stdin()?,
    };

    let coordinator = Coordinator::from_config(&config.sandbox).await?;

    let mut request = ExecutionRequest::new(code);
    if let Some(timeout) = args.timeout {
        request = request.with_timeout(timeout);
    }

    info!(timeout = ?request.timeout_seconds, "Executing one-shot code");
    let result = coordinator.execute(request).await?;

    output_execution_result(&result, format)?;

    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

/// Report executor availability
pub async fn status(args: StatusArgs, mut config: PyrunConfig, format: OutputFormat) -> Result<()> {
    if let Some(backend) = args.backend {
        config.sandbox.backend = backend;
    }

    let coordinator = Coordinator::from_config(&config.sandbox).await?;
    let status = coordinator.status();

    match format {
        OutputFormat::Text => {
            print_status(&status);
            println!();
            println!("{:<10} {:<10} DESCRIPTION", "BACKEND", "AVAILABLE");
            println!("{}", "-".repeat(70));
            for backend in coordinator.backends() {
                println!(
                    "{:<10} {:<10} {}{}",
                    backend.name,
                    if backend.available { "yes" } else { "no" },
                    backend.description,
                    backend
                        .unavailable_reason
                        .filter(|_| !backend.available)
                        .map(|reason| format!(" ({})", reason))
                        .unwrap_or_default()
                );
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "status": status,
                    "backends": coordinator.backends(),
                }))?
            );
        }
    }

    Ok(())
}

/// Classify raw error text without executing anything
pub async fn classify_text(args: ClassifyArgs, format: OutputFormat) -> Result<()> {
    let text = match args.text.as_deref() {
        Some(text) if text != "-" => text.to_string(),
        _ => read_stdin()?,
    };

    let classified = classify(&text);

    match format {
        OutputFormat::Text => {
            println!("[{}] {}", classified.kind, classified);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&classified)?);
        }
    }

    Ok(())
}

/// Build or pull the sandbox image ahead of time
pub async fn provision(config: PyrunConfig, format: OutputFormat) -> Result<()> {
    let outcome = ImageProvisioner::new(&config.sandbox.docker)
        .ensure_ready()
        .await;

    match format {
        OutputFormat::Text => println!("{:?}", outcome),
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "ready": outcome.is_ready(),
                    "image": outcome.image(),
                })
            );
        }
    }

    if !outcome.is_ready() {
        std::process::exit(1);
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn init(args: InitArgs) -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    // Create parent directories if needed
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Write default configuration
    let default_config = PyrunConfig::default();
    let toml_str =
        toml::to_string_pretty(&default_config).map_err(|e| PyrunError::Config(e.to_string()))?;

    std::fs::write(&config_path, toml_str)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Run a snippet");
    println!("  pyrun exec \"print('hello')\"");
    println!();
    println!("  # Run a file with a 5 second deadline");
    println!("  pyrun exec --file script.py --timeout 5");
    println!();
    println!("  # Check which sandbox is in use");
    println!("  pyrun status");

    Ok(())
}

pub async fn config(args: ConfigArgs, config: PyrunConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str =
                toml::to_string_pretty(&config).map_err(|e| PyrunError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf)?;
    Ok(buf)
}

fn output_execution_result(result: &ExecutionResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("{}", result.display_output());
            if let Some(error) = &result.error {
                eprintln!("{}", error);
            }
            if result.truncated {
                eprintln!("(output truncated)");
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "output": result.display_output(),
                    "result": result,
                })
            );
        }
    }
    Ok(())
}

fn print_status(status: &ExecutorStatus) {
    println!(
        "Active executor:     {}",
        status.active_executor.as_deref().unwrap_or("none")
    );
    println!("Container isolation: {}", status.container_available);
    if let Some(image) = &status.image {
        println!("Image:               {}", image);
    }
    if let Some(reason) = &status.reason {
        println!("Reason:              {}", reason);
    }
    println!(
        "Probed at:           {}",
        status.probed_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(version) = &status.interpreter_version {
        println!("Interpreter:         {}", version);
    }
    println!("Max concurrent:      {}", status.max_concurrent);

    let mut details: Vec<_> = status.details.iter().collect();
    details.sort();
    for (key, value) in details {
        println!("  {:<18} {}", format!("{}:", key), value);
    }
}
