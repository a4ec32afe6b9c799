// Thresher CLI - run sample processes against the configured message bus
// Run with: cargo run --bin thresher -- demo store-output

//! # Thresher Command Line
//!
//! Runs built-in sample processes so the engine can be watched end to end:
//!
//! - `store-output`: store `x = 10`, then print it
//! - `send-receive`: one instance sends `letter_X`, another receives and prints it
//! - `exclusive`: an exclusive gateway picks the branch whose condition holds
//! - `fork`: an activity forks two parallel tracks
//!
//! Configuration comes from `thresher.{toml,yaml,json}` (or `--config`), then
//! `THRESHER_*` environment variables, then the command-line flags.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use thresher::{
    BusBackend, FlowCondition, GatewayDirection, GatewayKind, Instance, Message, MessageDirection,
    MessageVariable, Node, OutputSink, Process, TaskDefinition, Thresher, ThresherConfig, Variable,
};

#[derive(Parser)]
#[command(name = "thresher")]
#[command(about = "Thresher - BPMN process execution engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (toml, yaml or json)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Message bus backend
    #[arg(long, global = true)]
    bus: Option<BusBackend>,

    /// NATS server URL
    #[arg(long, env = "NATS_URL", global = true)]
    nats_url: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sample process
    Demo {
        #[arg(value_enum)]
        scenario: Scenario,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum Scenario {
    StoreOutput,
    SendReceive,
    Exclusive,
    Fork,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenv();
    let cli = Cli::parse();

    let mut config = ThresherConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(bus) = cli.bus {
        config.bus = bus;
    }
    if let Some(url) = cli.nats_url.clone() {
        config.nats.url = url;
    }

    let filter = if cli.verbose {
        EnvFilter::new("thresher=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Demo { scenario, timeout } => {
            info!(bus = ?config.bus, "starting thresher");
            let engine = Thresher::from_config(config);
            let instances = run_demo(&engine, scenario)?;
            for instance in instances {
                wait_for(&instance, Duration::from_secs(timeout)).await;
            }
            engine.shutdown().await;
        }
    }

    Ok(())
}

async fn wait_for(instance: &Arc<Instance>, limit: Duration) {
    if tokio::time::timeout(limit, instance.wait()).await.is_err() {
        warn!(instance = %instance.id(), "instance still running, cancelling");
        instance.cancel();
        instance.wait().await;
    }
    for track in instance.tracks() {
        match &track.error {
            Some(error) => warn!(track = %track.id, state = %track.state, error = %error, "track result"),
            None => info!(track = %track.id, state = %track.state, node = %track.node_name, "track result"),
        }
    }
}

fn run_demo(engine: &Thresher, scenario: Scenario) -> Result<Vec<Arc<Instance>>> {
    let instances = match scenario {
        Scenario::StoreOutput => vec![engine.run_process(store_output()?.snapshot()?, Vec::new())?],
        Scenario::SendReceive => {
            let receiver = engine.run_process(receiver()?.snapshot()?, Vec::new())?;
            let sender = engine.run_process(sender()?.snapshot()?, Vec::new())?;
            vec![sender, receiver]
        }
        Scenario::Exclusive => vec![engine.run_process(exclusive()?.snapshot()?, Vec::new())?],
        Scenario::Fork => vec![engine.run_process(fork()?.snapshot()?, Vec::new())?],
    };
    Ok(instances)
}

fn store_output() -> Result<Process> {
    let mut process = Process::new("store-output");
    let store = process.add_node(Node::task(
        "store x",
        TaskDefinition::store(vec![Variable::int("x", 10)]),
    ))?;
    let print = process.add_node(Node::task(
        "print x",
        TaskDefinition::output(vec!["x"], OutputSink::stdout()),
    ))?;
    process.link(store, print)?;
    Ok(process)
}

fn letter(direction: MessageDirection) -> Message {
    Message::new(
        "letter_X",
        direction,
        vec![MessageVariable::required(Variable::int("x", 0))],
    )
}

fn sender() -> Result<Process> {
    let mut process = Process::new("sender");
    process.add_message(letter(MessageDirection::Outgoing))?;
    let store = process.add_node(Node::task(
        "store x",
        TaskDefinition::store(vec![Variable::int("x", 42)]),
    ))?;
    let send = process.add_node(Node::task("send letter", TaskDefinition::send("letter_X", "Q")))?;
    process.link(store, send)?;
    Ok(process)
}

fn receiver() -> Result<Process> {
    let mut process = Process::new("receiver");
    process.add_message(letter(MessageDirection::Incoming))?;
    let recv = process.add_node(Node::task(
        "receive letter",
        TaskDefinition::receive("letter_X", "Q"),
    ))?;
    let print = process.add_node(Node::task(
        "print x",
        TaskDefinition::output(vec!["x"], OutputSink::stdout()),
    ))?;
    process.link(recv, print)?;
    Ok(process)
}

fn exclusive() -> Result<Process> {
    let mut process = Process::new("exclusive");
    let store = process.add_node(Node::task(
        "store x",
        TaskDefinition::store(vec![Variable::int("x", 5)]),
    ))?;
    let gw = process.add_node(Node::gateway(
        "x above 3?",
        GatewayKind::Exclusive,
        GatewayDirection::Diverging,
    ))?;
    let big = process.add_node(Node::task(
        "store big",
        TaskDefinition::store(vec![Variable::string("verdict", "big")]),
    ))?;
    let small = process.add_node(Node::task(
        "store small",
        TaskDefinition::store(vec![Variable::string("verdict", "small")]),
    ))?;
    let print_big = process.add_node(Node::task(
        "print big",
        TaskDefinition::output(vec!["x", "verdict"], OutputSink::stdout()),
    ))?;
    let print_small = process.add_node(Node::task(
        "print small",
        TaskDefinition::output(vec!["x", "verdict"], OutputSink::stdout()),
    ))?;
    process.link(store, gw)?;
    process.link_when(gw, big, FlowCondition::expr("x > 3"))?;
    let otherwise = process.link(gw, small)?;
    process.set_default_flow(gw, otherwise)?;
    process.link(big, print_big)?;
    process.link(small, print_small)?;
    Ok(process)
}

fn fork() -> Result<Process> {
    let mut process = Process::new("fork");
    let fork = process.add_node(Node::task("fork", TaskDefinition::Service))?;
    let a = process.add_node(Node::task(
        "store a",
        TaskDefinition::store(vec![Variable::int("a", 1)]),
    ))?;
    let b = process.add_node(Node::task(
        "store b",
        TaskDefinition::store(vec![Variable::int("b", 1)]),
    ))?;
    let print_a = process.add_node(Node::task(
        "print a",
        TaskDefinition::output(vec!["a"], OutputSink::stdout()),
    ))?;
    let print_b = process.add_node(Node::task(
        "print b",
        TaskDefinition::output(vec!["b"], OutputSink::stdout()),
    ))?;
    process.link(fork, a)?;
    process.link(fork, b)?;
    process.link(a, print_a)?;
    process.link(b, print_b)?;
    Ok(process)
}
