use anyhow::Result;
use clap::Parser;
use ringdht::{Config, Node};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .thread_name("ring")
        .enable_all()
        .build()?;

    runtime.block_on(run(Config::parse()))
}

async fn run(config: Config) -> Result<()> {
    let node = Node::start(&config).await?;
    info!("I am {} with key {}", node.address(), node.key());
    node.join(config.join.as_ref()).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_command(&node, line.trim()).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    if !node.is_stopped() {
        node.leave().await?;
    }
    node.wait().await
}

// returns false once the node should leave
async fn handle_command(node: &Node, line: &str) -> bool {
    let mut words = line.split_whitespace();
    match (words.next(), words.next()) {
        (Some("put"), Some(name)) => {
            if let Err(e) = node.put(name).await {
                error!("put {name} failed: {e:#}");
            }
        }
        (Some("get"), Some(name)) => match node.get(name).await {
            Ok(Some(found)) => println!("found {found}"),
            Ok(None) => println!("{name} not found"),
            Err(e) => error!("get {name} failed: {e:#}"),
        },
        (Some("state"), None) => {
            let state = node.state().await;
            println!(
                "successor {} predecessor {} backup {}",
                state.successor, state.predecessor, state.backup_successor
            );
            println!("files {:?}", state.files);
            println!("backup files {:?}", state.backup_files);
        }
        (Some("leave"), None) => return false,
        (None, _) => {}
        _ => println!("commands: put <name> | get <name> | state | leave"),
    }
    true
}
