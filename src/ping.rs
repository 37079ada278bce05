use crate::messages::RingMessage;
use crate::{net, Shared};
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::{
    sync::watch,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

/// Pings the successor every `ping_interval` until the node stops.
pub(crate) async fn run(s: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let mut ticker = time::interval(s.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {}
        }
        if s.stopped() {
            break;
        }
        if let Err(e) = ping_round(&s).await {
            warn!("[{}] Ping round failed: {:#}", s.me, e);
        }
    }
    debug!("[{}] Ping loop stopped", s.me);
}

/// One probe of the successor. Fails over to the backup successor when the
/// successor cannot be reached, then folds the reply into our state.
pub(crate) async fn ping_round(s: &Arc<Shared>) -> Result<()> {
    let (target, files) = {
        let state = s.state.lock().await;
        (
            state.successor.clone(),
            state.files.iter().cloned().collect::<Vec<_>>(),
        )
    };

    let (target, mut stream) = match net::connect(&target).await {
        Ok(stream) => (target, stream),
        Err(e) => {
            let backup = {
                let mut state = s.state.lock().await;
                // someone may already have repaired the pointer
                if state.successor == target {
                    state.successor = state.backup_successor.clone();
                }
                state.successor.clone()
            };
            info!(
                "[{}] Successor {} unreachable ({:#}), failing over to {}",
                s.me, target, e, backup
            );
            let stream = net::connect(&backup).await?;
            (backup, stream)
        }
    };

    let ping = RingMessage::Ping {
        files,
        sender: s.me.clone(),
    };
    net::send_msg(&mut stream, &ping)
        .await
        .with_context(|| format!("pinging {}", target))?;
    let reply = time::timeout(s.ping_timeout, net::recv_msg(&mut stream))
        .await
        .map_err(|_| anyhow!("no ping reply from {} within {:?}", target, s.ping_timeout))??;

    let (files, successor) = match reply {
        RingMessage::PingResponse {
            files, successor, ..
        } => (files, successor),
        other => {
            return Err(anyhow!(
                "expected ping_response from {}, got {}",
                target,
                other.kind()
            ))
        }
    };

    let mut state = s.state.lock().await;
    for file in files {
        // a gap opened ahead of us and this file now falls in our range
        if s.lookup_file(&state, &file) {
            state.files.insert(file);
        } else {
            state.backup_files.insert(file);
        }
    }
    state.backup_successor = successor;
    Ok(())
}
