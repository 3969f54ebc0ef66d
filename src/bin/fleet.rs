//! Fleet CLI binary.
//!
//! # Commands
//!
//! - `simulate` - Run a contract negotiation between in-process agents
//! - `config` - Print the effective configuration

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use fleet::{
    Agency, AgentHandle, AgentRuntime, Config, Contractor, ContractorContext, Interest, Manager,
    ManagerContext, MemoryBus, Message, Recipient, Registry, TokioClock, VERSION,
};
use fleet::message::Bid;
use serde_json::{json, Value};

const PROTOCOL: &str = "simulate";

#[derive(Parser)]
#[command(name = "fleet")]
#[command(version = VERSION)]
#[command(about = "Fleet - contract and request protocols for cooperating agents", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/fleet/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a contract negotiation over the in-process bus
    Simulate {
        /// Number of contractors
        #[arg(short = 'n', long, default_value = "3")]
        contractors: usize,

        /// How many of them never answer
        #[arg(short, long, default_value = "0")]
        silent: usize,

        /// Bid collection window in seconds (default: from config)
        #[arg(long)]
        announce_timeout: Option<u64>,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate {
            contractors,
            silent,
            announce_timeout,
        } => {
            init_logging(&config, cli.verbose);
            cmd_simulate(config, contractors, silent, announce_timeout)
        },
        Commands::Config => cmd_config(&config),
    }
}

fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}

/// Announces one job and reports who won.
struct Dispatcher;

impl Manager for Dispatcher {
    fn initiate(&mut self, ctx: &mut ManagerContext) -> anyhow::Result<()> {
        ctx.announce(json!({ "job": "render", "frames": 120 }));
        Ok(())
    }

    fn bid(&mut self, bid: &Message) {
        tracing::info!(from = %bid.sender, cost = ?bid.as_bid().and_then(Bid::best_cost), "Bid received");
    }
}

/// Bids a fixed cost and finishes as soon as it is granted.
struct Worker {
    name: String,
    cost: i64,
}

impl Contractor for Worker {
    fn announced(&mut self, _announcement: &Message, ctx: &mut ContractorContext) -> anyhow::Result<()> {
        ctx.bid(Bid::single(self.cost, json!({ "worker": self.name })));
        Ok(())
    }

    fn granted(&mut self, _grant: &Message, ctx: &mut ContractorContext) -> anyhow::Result<()> {
        ctx.final_report(json!({ "worker": self.name, "frames": 120 }));
        Ok(())
    }
}

fn cmd_simulate(
    mut config: Config,
    contractors: usize,
    silent: usize,
    announce_timeout: Option<u64>,
) -> anyhow::Result<()> {
    anyhow::ensure!(contractors > 0, "need at least one contractor");
    anyhow::ensure!(silent <= contractors, "more silent contractors than contractors");
    if let Some(secs) = announce_timeout {
        config.agency.announce_timeout_secs = secs;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let bus = MemoryBus::new();
        let shard = config.agency.shard.clone();
        let clock = TokioClock::new();

        let mut workers = Vec::new();
        // silent agents are bound but never read their inbox
        let mut mute_inboxes = Vec::new();
        for i in 0..contractors {
            let name = format!("worker-{i}");
            let address = Recipient::agent(&shard, &name);
            let inbox = bus.connect(address.clone());
            let cost = 100 - (i as i64 * 7) % 50;
            let registry = Registry::builder()
                .register(Interest::contractor(PROTOCOL, move || Worker {
                    name: name.clone(),
                    cost,
                }))?
                .build();
            let agency = Agency::builder(address)
                .config(config.agency.clone())
                .registry(registry)
                .channel(Arc::new(bus.clone()))
                .clock(Arc::new(clock))
                .build()?;
            if i < silent {
                mute_inboxes.push(inbox);
            } else {
                let (runtime, handle) = AgentRuntime::new(agency, inbox, clock);
                workers.push((handle, runtime.spawn()));
            }
        }

        let address = Recipient::agent(&shard, "dispatcher");
        let inbox = bus.connect(address.clone());
        let agency = Agency::builder(address)
            .config(config.agency.clone())
            .channel(Arc::new(bus.clone()))
            .clock(Arc::new(clock))
            .build()?;
        let (runtime, dispatcher) = AgentRuntime::new(agency, inbox, clock);
        let task = runtime.spawn();

        let session = dispatcher
            .initiate_manager(PROTOCOL, Dispatcher, vec![Recipient::broadcast(PROTOCOL, &shard)])
            .await?;
        println!("session {}", session.session_id());
        match session.notify_finish().await {
            Ok(value) => println!("completed: {}", serde_json::to_string_pretty(&value)?),
            Err(failure) => println!("failed: {failure}"),
        }

        shutdown(dispatcher, task).await?;
        for (handle, task) in workers {
            // let the acknowledgement land before stopping
            while !handle.is_idle().await? {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            shutdown(handle, task).await?;
        }
        drop(mute_inboxes);
        Ok::<_, anyhow::Error>(())
    })
}

async fn shutdown(handle: AgentHandle, task: tokio::task::JoinHandle<Agency>) -> anyhow::Result<()> {
    let name = handle.address().to_string();
    drop(handle);
    let agency = task.await?;
    if let Some(sessions) = live_sessions(&agency) {
        tracing::warn!(agent = %name, sessions = %sessions, "Stopped with live sessions");
    }
    Ok(())
}

/// Summary of the sessions an agency still holds, if any.
fn live_sessions(agency: &Agency) -> Option<Value> {
    let live: Vec<Value> = agency
        .sessions()
        .into_iter()
        .map(|s| json!({ "session_id": s.session_id, "role": s.role.to_string(), "state": s.state }))
        .collect();
    if live.is_empty() {
        None
    } else {
        Some(Value::Array(live))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet::{RequestContext, Requester};

    struct Ask;

    impl Requester for Ask {
        fn initiate(&mut self, ctx: &mut RequestContext) -> anyhow::Result<()> {
            ctx.request(json!("ping"));
            Ok(())
        }
    }

    #[test]
    fn test_live_sessions_summary() {
        let bus = MemoryBus::new();
        let peer = Recipient::agent("default", "peer");
        let _peer_inbox = bus.connect(peer.clone());
        let mut agency = Agency::builder(Recipient::agent("default", "me"))
            .channel(Arc::new(bus))
            .build()
            .unwrap();
        assert!(live_sessions(&agency).is_none());

        let _handle = agency.initiate_request("ping", Ask, vec![peer], None);
        let summary = live_sessions(&agency).unwrap();
        assert_eq!(summary[0]["role"], "requester");
        assert_eq!(summary.as_array().map(Vec::len), Some(1));
    }
}
