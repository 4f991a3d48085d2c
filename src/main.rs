//! `rust_tsp` command-line tool.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use rust_tsp::catalog;
use rust_tsp::codec::{self, ScriptFormat};
use rust_tsp::config::{DeployConfig, DEFAULT_CONFIG_PATH};
use rust_tsp::logging;
use rust_tsp::maintenance::{self, LineTrimmer};
use rust_tsp::model_mask;
use rust_tsp::transport::{SimulatedScript, SimulatedTransport, TransportPacing};
use rust_tsp::{DeploymentCoordinator, NodeIdentity, VersionStatus};

#[derive(Parser)]
#[command(name = "rust_tsp", version, about = "TSP firmware script deployment")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the configured scripts
    Catalog,
    /// Print the detected format of a script file
    Classify { file: PathBuf },
    /// Compress a script file
    Compress {
        file: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Decompress a compressed script file
    Decompress {
        file: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Check a model number against a model mask
    Matches { model: String, mask: String },
    /// Print the release file name of a script for a node
    FileName {
        title: String,
        build: String,
        /// Node model number
        #[arg(long)]
        model: Option<String>,
        /// Node firmware version
        #[arg(long)]
        firmware: Option<String>,
    },
    /// Trim script files whose released version is marked with '+'
    Maintain {
        #[arg(long)]
        extension: Option<String>,
    },
    /// Deploy the catalog to a simulated instrument network
    Simulate {
        /// Controller model number
        #[arg(long)]
        model: String,
        #[arg(long, default_value = "0")]
        serial: String,
        /// Subordinate node model numbers, assigned nodes 2, 3, ...
        #[arg(long = "node")]
        nodes: Vec<String>,
        /// Pre-install every script at version 0.0 so it must be replaced
        #[arg(long)]
        stale: bool,
        /// Print the final state as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DeployConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    if cli.json_logs {
        logging::init_json(&config.application.log_level);
    } else {
        logging::init(&config.application.log_level);
    }

    match cli.command {
        Command::Catalog => print_catalog(&config),
        Command::Classify { file } => classify(&file),
        Command::Compress { file, output } => {
            let text = read_text(&file)?;
            let encoded = codec::encode(&text, ScriptFormat::COMPRESSED)?;
            write_output(output.as_deref(), &encoded)
        }
        Command::Decompress { file, output } => {
            let text = read_text(&file)?;
            let plain = codec::decompress(&codec::unwrap(&text)?)
                .with_context(|| format!("{} is not a valid compressed script", file.display()))?;
            write_output(output.as_deref(), &plain)
        }
        Command::Matches { model, mask } => {
            let matched = model_mask::matches(&model, &mask);
            println!("{model} {} {mask}", if matched { "matches" } else { "does not match" });
            Ok(())
        }
        Command::FileName {
            title,
            build,
            model,
            firmware,
        } => {
            let extension = &config.maintenance.script_extension;
            let name = match model {
                Some(model) => {
                    let mut node = NodeIdentity::controller(&model, "0", 1);
                    if let Some(firmware) = firmware {
                        node = node.with_firmware_version(&firmware);
                    }
                    catalog::script_file_name_for_node(&title, &build, &node, extension)
                }
                None => catalog::script_file_name(&title, &build, None, extension),
            };
            println!("{name}");
            Ok(())
        }
        Command::Maintain { extension } => {
            let extension = extension.unwrap_or_else(|| config.maintenance.debug_extension.clone());
            let descriptors = catalog::build_descriptors(&config)?;
            let written = maintenance::maintain_catalog(&descriptors, &LineTrimmer, &extension)?;
            for path in &written {
                println!("wrote {}", path.display());
            }
            println!("{} file(s) trimmed", written.len());
            Ok(())
        }
        Command::Simulate {
            model,
            serial,
            nodes,
            stale,
            json,
        } => simulate(&config, &model, &serial, &nodes, stale, json).await,
    }
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn write_output(output: Option<&Path>, text: &str) -> Result<()> {
    match output {
        Some(path) => fs::write(path, text).with_context(|| format!("Failed to write {}", path.display())),
        None => {
            println!("{text}");
            Ok(())
        }
    }
}

fn print_catalog(config: &DeployConfig) -> Result<()> {
    for descriptor in catalog::build_descriptors(config)? {
        let mut flags = Vec::new();
        for (set, flag) in [
            (descriptor.is_boot_script(), "boot"),
            (descriptor.is_primary_script(), "primary"),
            (descriptor.is_support_script(), "support"),
            (descriptor.save_as_binary(), "binary"),
            (descriptor.embed_to_non_volatile_memory(), "embed"),
            (descriptor.convert_to_byte_code(), "byte-code"),
            (descriptor.requires_read_parse_write(), "read-parse-write"),
        ] {
            if set {
                flags.push(flag);
            }
        }
        println!(
            "{:<24} {:<10} {:<10} {}",
            descriptor.to_string(),
            descriptor.released_version(),
            descriptor.firmware_version_getter(),
            flags.join(",")
        );
    }
    for legacy in &config.legacy_scripts {
        println!("{:<24} legacy", legacy.name);
    }
    Ok(())
}

fn classify(path: &Path) -> Result<()> {
    let text = read_text(path)?;
    let (_, format) = codec::decode(&text)?;
    let label = match (
        format.contains(ScriptFormat::COMPRESSED),
        format.contains(ScriptFormat::BINARY),
    ) {
        (true, true) => "compressed binary",
        (true, false) => "compressed",
        (false, true) => "binary",
        (false, false) => "plain",
    };
    println!("{}: {label}", path.display());
    Ok(())
}

/// Seeds the simulated network with the behavior of every catalog script.
fn seed_network(transport: &SimulatedTransport, coordinator: &DeploymentCoordinator, stale: bool) -> Result<()> {
    for node in coordinator.node_numbers() {
        for instance in coordinator.node_scripts(node)?.iter() {
            let descriptor = instance.descriptor();
            let mut script = SimulatedScript::new(descriptor.name())
                .with_source(descriptor.source());
            if !descriptor.top_namespace().is_empty() {
                script = script.with_namespace(descriptor.top_namespace());
            }
            let released = descriptor.comparable_released_version();
            if descriptor.has_version_getter() {
                let version = if stale { "0.0" } else { released };
                script = script.with_version(descriptor.firmware_version_getter(), version);
            }
            if stale {
                script = script.embedded().activated().upgrades_to(released);
            }
            transport.define_script(node, script);
        }
    }
    Ok(())
}

/// Final state of one script on one node.
#[derive(Serialize)]
struct ScriptState<'a> {
    node: u8,
    model: &'a str,
    name: &'a str,
    loaded: bool,
    embedded: bool,
    activated: bool,
    version: VersionStatus,
}

async fn simulate(
    config: &DeployConfig,
    model: &str,
    serial: &str,
    nodes: &[String],
    stale: bool,
    json: bool,
) -> Result<()> {
    if config.scripts.is_empty() {
        bail!("No scripts configured in the catalog");
    }
    let controller = NodeIdentity::controller(model, serial, 1);
    let mut coordinator = catalog::build_coordinator(config, controller, true)?;
    let transport = SimulatedTransport::new(1).with_pacing(TransportPacing::from_millis(
        config.pacing.command_delay_ms,
        config.pacing.line_delay_ms,
    ));
    for (index, node_model) in nodes.iter().enumerate() {
        let number = u8::try_from(index + 2).context("Too many subordinate nodes")?;
        coordinator.register_node(NodeIdentity::subordinate(node_model, serial, number))?;
        transport.add_node(number);
    }
    seed_network(&transport, &coordinator, stale)?;

    let report = coordinator.deploy(&transport).await?;
    let mut states = Vec::new();
    for node in coordinator.node_numbers() {
        let scripts = coordinator.node_scripts(node)?;
        for instance in scripts.iter() {
            states.push(ScriptState {
                node,
                model: scripts.node().model_number(),
                name: instance.name(),
                loaded: instance.is_loaded(),
                embedded: instance.is_embedded(),
                activated: instance.is_activated(),
                version: instance.version_status(),
            });
        }
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&states)?);
    } else {
        for state in &states {
            println!(
                "node {} ({}) {:<24} loaded={:<5} embedded={:<5} activated={:<5} version={}",
                state.node, state.model, state.name, state.loaded, state.embedded, state.activated, state.version
            );
        }
    }
    let current = coordinator.all_versions_current();
    let outdated = coordinator.is_program_outdated();
    println!("versions current: {current}, outdated program: {outdated}");
    if !report.success {
        bail!(
            "{} failed to run:\n{}",
            report.failed_script.unwrap_or_default(),
            report.details
        );
    }
    Ok(())
}
