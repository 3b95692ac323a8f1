//! FlowRunner CLI Entry Point
//!
//! Runs one flow instance against a scripted agent.
//!
//! # Usage
//!
//! ```bash
//! # Dump ACPI tables, answering agent requests from a script
//! flowrunner DumpACPITable acpi.yaml --agent-script agent.yaml
//!
//! # Dump the flash image of a specific client, checkpointing as it goes
//! flowrunner DumpFlashImage flash.yaml --client C.1000000000000000 \
//!     --agent-script agent.yaml --state-dir .flowrunner
//!
//! # List the available flows
//! flowrunner --list
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info, warn};

use flowrunner::agent::{QueueTransport, ScriptedAgent};
use flowrunner::flows::builtin_registry;
use flowrunner::storage::FsStore;
use flowrunner::{load_args, FlowEngine, InstanceId, InstanceStatus, APP_NAME, VERSION};

/// Client id used when none is specified.
const DEFAULT_CLIENT: &str = "C.0000000000000001";

/// Default artifact store directory.
const DEFAULT_STORE_DIR: &str = "flowrunner-store";

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    flow_name: Option<String>,
    args_path: Option<String>,
    client_id: String,
    agent_script: Option<String>,
    store_dir: PathBuf,
    state_dir: Option<PathBuf>,
    list: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flow_name: None,
            args_path: None,
            client_id: DEFAULT_CLIENT.to_string(),
            agent_script: None,
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            state_dir: None,
            list: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Durable Collection Flow Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowrunner [OPTIONS] <FLOW_NAME> <ARGS_FILE>");
    println!();
    println!("Arguments:");
    println!("  <FLOW_NAME>          Name of the flow to start");
    println!("  <ARGS_FILE>          Path to the flow arguments (YAML or JSON)");
    println!();
    println!("Options:");
    println!("  --client ID          Client to run against (default: {})", DEFAULT_CLIENT);
    println!("  --agent-script PATH  Answer agent requests from a YAML script");
    println!("  --store-dir PATH     Artifact store directory (default: {})", DEFAULT_STORE_DIR);
    println!("  --state-dir PATH     Checkpoint instances into this directory");
    println!("  --list               List available flows");
    println!("  --verbose            Enable debug logging");
    println!("  --help               Show this help message");
    println!("  --version            Show version information");
    println!();
    println!("Examples:");
    println!("  flowrunner DumpACPITable acpi.yaml --agent-script agent.yaml");
    println!("  flowrunner DumpFlashImage flash.yaml --client C.1000000000000000 --state-dir .flowrunner");
}

/// Takes the value following an option.
fn option_value(args: &[String], i: &mut usize, option: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{} requires a value", option))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--list" => {
                config.list = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--client" => {
                config.client_id = option_value(args, &mut i, "--client")?;
            }
            "--agent-script" => {
                config.agent_script = Some(option_value(args, &mut i, "--agent-script")?);
            }
            "--store-dir" => {
                config.store_dir = PathBuf::from(option_value(args, &mut i, "--store-dir")?);
            }
            "--state-dir" => {
                config.state_dir = Some(PathBuf::from(option_value(args, &mut i, "--state-dir")?));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                // Positional argument
                match positional_index {
                    0 => config.flow_name = Some(arg.clone()),
                    1 => config.args_path = Some(arg.clone()),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    if !config.list && (config.flow_name.is_none() || config.args_path.is_none()) {
        return Err("A flow name and an argument file are required".to_string());
    }

    Ok(config)
}

/// Prints the flows the engine knows about.
fn print_flows() {
    let registry = builtin_registry();
    println!("Available flows:");
    for name in registry.names() {
        println!("  {}", name);
    }
}

/// Prints the outcome of an instance and its children.
fn print_report(engine: &FlowEngine, id: InstanceId) {
    let Some(instance) = engine.instance(id) else {
        return;
    };

    println!();
    println!("{} {} ({})", "Flow".bold(), instance.flow_name, id);

    for entry in &instance.log {
        println!("  {} {}", entry.timestamp.format("%H:%M:%S"), entry.message);
    }

    if !instance.state.is_empty() {
        println!();
        println!("State:");
        for key in instance.state.keys() {
            let owner = instance.state.owner_of(key).unwrap_or("?");
            let value = instance.state.get_value(key).map(|v| v.to_string()).unwrap_or_default();
            println!("  {} [{}]: {}", key.cyan(), owner, value);
        }
    }

    if !instance.replies.is_empty() {
        println!();
        println!("Replies:");
        for artifact in &instance.replies {
            println!("  {}: {}", artifact.name.cyan(), artifact.payload);
        }
    }

    for child in engine.children(id) {
        if let Some(child) = engine.instance(child) {
            println!("  child {} ({}): {:?}", child.flow_name, child.id, child.status);
        }
    }

    println!();
    println!("{}", instance.timeline.summary());

    match &instance.status {
        InstanceStatus::Completed => println!("Status: {}", "COMPLETED".green().bold()),
        InstanceStatus::Failed(status) => {
            println!("Status: {} {}", "FAILED".red().bold(), status)
        }
        InstanceStatus::Running => println!(
            "Status: {} ({} outstanding call(s))",
            "RUNNING".yellow().bold(),
            instance.pending.len()
        ),
    }
}

/// Main application entry point.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    if config.list {
        print_flows();
        return Ok(true);
    }

    // Print banner
    print_banner();

    let (Some(flow_name), Some(args_path)) = (config.flow_name, config.args_path) else {
        return Err("A flow name and an argument file are required".into());
    };

    let flow_args = load_args(&args_path).map_err(|e| {
        error!("Failed to load flow arguments: {}", e);
        format!("Could not load arguments from '{}': {}", args_path, e)
    })?;

    // Create and configure engine
    info!("Artifact store: {}", config.store_dir.display());
    let store = Arc::new(FsStore::open(&config.store_dir)?);
    let outbox = QueueTransport::new();
    let mut engine = FlowEngine::new(builtin_registry(), outbox.clone(), store);

    if let Some(dir) = config.state_dir {
        info!("Checkpoints: {}", dir.display());
        engine.set_state_dir(dir);
    }

    let id = engine.start_flow(&flow_name, &config.client_id, flow_args)?;
    info!("Started {} ({}) on {}", flow_name, id, config.client_id);

    // Answer agent requests
    match config.agent_script {
        Some(path) => {
            let mut agent = ScriptedAgent::load(&path)?;
            let delivered = agent.drive(&mut engine, &outbox)?;
            info!("Delivered {} agent reply(s)", delivered);
            if agent.remaining() > 0 {
                warn!("{} scripted reply(s) were never used", agent.remaining());
            }
        }
        None => {
            for request in outbox.drain() {
                warn!(
                    "No agent script; request {} ({}) left unanswered",
                    request.request_id, request.action
                );
            }
        }
    }

    print_report(&engine, id);

    Ok(matches!(engine.status(id), Some(InstanceStatus::Completed)))
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
