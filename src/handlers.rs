use crate::error::WireError;
use crate::messages::{Address, RingMessage};
use crate::{net, Shared};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

// what a join handler does once the ring state has been updated
enum JoinStep {
    Reply(RingMessage),
    Forward(Address),
}

/// Reads one message off an accepted connection and dispatches it. At most
/// one reply goes back on `stream`.
pub(crate) async fn handle_connection(s: &Arc<Shared>, mut stream: TcpStream) -> Result<()> {
    let msg = match net::recv_msg(&mut stream).await {
        Ok(msg) => msg,
        Err(WireError::UnknownType(kind)) => {
            warn!("[{}] Ignoring message of unknown type {:?}", s.me, kind);
            return Ok(());
        }
        Err(e) => return Err(e).context("reading request"),
    };
    debug!("[{}] Got {} from {}", s.me, msg.kind(), msg.sender());

    match msg {
        RingMessage::Join { key, sender } => handle_join(s, key, sender).await,
        RingMessage::JoinResponse {
            successor,
            predecessor,
            ..
        } => {
            handle_join_response(s, successor, predecessor).await;
            Ok(())
        }
        RingMessage::SuccLeft { new_successor, .. } => handle_succ_left(s, new_successor).await,
        RingMessage::UpdatePred {
            new_predecessor, ..
        } => {
            handle_update_pred(s, new_predecessor).await;
            Ok(())
        }
        RingMessage::PredLeft {
            files,
            backup_files,
            sender,
        } => {
            handle_pred_left(s, files, backup_files, sender).await;
            Ok(())
        }
        RingMessage::Put { filename, sender } => {
            let lapped = sender == s.me;
            place_file(s, filename, sender, lapped).await
        }
        RingMessage::Get { filename, sender } => {
            handle_get(s, &mut stream, filename, sender).await
        }
        RingMessage::Ping { files, sender } => handle_ping(s, &mut stream, files, sender).await,
        reply @ (RingMessage::GetResponse { .. }
        | RingMessage::NotFound { .. }
        | RingMessage::PingResponse { .. }) => {
            warn!(
                "[{}] Unsolicited {} from {}",
                s.me,
                reply.kind(),
                reply.sender()
            );
            Ok(())
        }
    }
}

pub(crate) async fn handle_join(s: &Arc<Shared>, key: u64, joiner: Address) -> Result<()> {
    let step = {
        let mut state = s.state.lock().await;
        if state.is_alone(&s.me) {
            // second member: the joiner is both neighbours
            state.successor = joiner.clone();
            state.predecessor = joiner.clone();
            state.backup_successor = s.me.clone();
            JoinStep::Reply(RingMessage::JoinResponse {
                successor: s.me.clone(),
                predecessor: s.me.clone(),
                sender: s.me.clone(),
            })
        } else if s.lookup_node(&state, key) {
            // old successor's predecessor is fixed by the joiner's first ping
            let old_successor = std::mem::replace(&mut state.successor, joiner.clone());
            state.backup_successor = old_successor.clone();
            JoinStep::Reply(RingMessage::JoinResponse {
                successor: old_successor,
                predecessor: s.me.clone(),
                sender: s.me.clone(),
            })
        } else {
            JoinStep::Forward(state.successor.clone())
        }
    };

    match step {
        JoinStep::Reply(response) => {
            info!("[{}] Placed {} (key {}) after us", s.me, joiner, key);
            net::notify(&joiner, &response).await
        }
        JoinStep::Forward(successor) => {
            debug!("[{}] Forwarding join of key {} to {}", s.me, key, successor);
            let msg = RingMessage::Join {
                key,
                sender: joiner,
            };
            net::notify(&successor, &msg).await
        }
    }
}

pub(crate) async fn handle_join_response(s: &Arc<Shared>, successor: Address, predecessor: Address) {
    info!(
        "[{}] Joined: successor {}, predecessor {}",
        s.me, successor, predecessor
    );
    let mut state = s.state.lock().await;
    state.successor = successor;
    state.predecessor = predecessor;
}

pub(crate) async fn handle_succ_left(s: &Arc<Shared>, new_successor: Address) -> Result<()> {
    info!("[{}] Successor left, now {}", s.me, new_successor);
    {
        let mut state = s.state.lock().await;
        state.successor = new_successor.clone();
        if new_successor == s.me {
            // the ring shrank to just us
            state.predecessor = s.me.clone();
            state.backup_successor = s.me.clone();
            return Ok(());
        }
    }
    let msg = RingMessage::UpdatePred {
        new_predecessor: s.me.clone(),
        sender: s.me.clone(),
    };
    net::notify(&new_successor, &msg).await
}

pub(crate) async fn handle_update_pred(s: &Arc<Shared>, new_predecessor: Address) {
    info!("[{}] Predecessor is now {}", s.me, new_predecessor);
    s.state.lock().await.predecessor = new_predecessor;
}

pub(crate) async fn handle_pred_left(
    s: &Arc<Shared>,
    files: Vec<String>,
    backup_files: Vec<String>,
    leaver: Address,
) {
    let mut state = s.state.lock().await;
    let before = (state.files.len(), state.backup_files.len());
    state.files.extend(files);
    state.backup_files.extend(backup_files);
    info!(
        "[{}] Predecessor {} left, took over {} files and {} backups",
        s.me,
        leaver,
        state.files.len() - before.0,
        state.backup_files.len() - before.1
    );
}

/// Stores `filename` if this node owns it, or forwards the put to the
/// successor with `origin` unchanged. A put that comes back to its origin
/// (`lapped`) found no owner on the way and is kept here.
pub(crate) async fn place_file(
    s: &Arc<Shared>,
    filename: String,
    origin: Address,
    lapped: bool,
) -> Result<()> {
    let successor = {
        let state = s.state.lock().await;
        if lapped || s.lookup_file(&state, &filename) {
            None
        } else {
            Some(state.successor.clone())
        }
    };

    let Some(successor) = successor else {
        if lapped {
            warn!("[{}] Put of {} went round the ring unclaimed, keeping it", s.me, filename);
        }
        if let Err(e) = s.store.persist(&filename).await {
            // the name is still recorded as owned
            error!("[{}] Could not persist {}: {:#}", s.me, filename, e);
        }
        s.state.lock().await.files.insert(filename.clone());
        info!("[{}] Stored {}", s.me, filename);
        return Ok(());
    };

    debug!("[{}] Forwarding put {} to {}", s.me, filename, successor);
    let msg = RingMessage::Put {
        filename,
        sender: origin,
    };
    net::notify(&successor, &msg).await
}

pub(crate) async fn handle_get(
    s: &Arc<Shared>,
    stream: &mut TcpStream,
    filename: String,
    requester: Address,
) -> Result<()> {
    #[cfg(test)]
    s.gets_seen
        .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

    if requester == s.me {
        // came all the way round without a hit
        let reply = RingMessage::NotFound {
            filename,
            sender: s.me.clone(),
        };
        net::send_msg(stream, &reply).await?;
        return Ok(());
    }

    let successor = {
        let state = s.state.lock().await;
        if state.files.contains(&filename) {
            None
        } else {
            Some(state.successor.clone())
        }
    };

    let Some(successor) = successor else {
        let reply = RingMessage::GetResponse {
            filename,
            sender: s.me.clone(),
        };
        net::send_msg(stream, &reply).await?;
        return Ok(());
    };

    // block on the rest of the chain and relay whatever comes back untouched
    let mut upstream = net::connect(&successor).await?;
    let msg = RingMessage::Get {
        filename,
        sender: requester,
    };
    net::send_msg(&mut upstream, &msg).await?;
    let reply = net::read_frame(&mut upstream)
        .await
        .with_context(|| format!("waiting for get reply from {}", successor))?;
    net::write_frame(stream, &reply).await?;
    Ok(())
}

pub(crate) async fn handle_ping(
    s: &Arc<Shared>,
    stream: &mut TcpStream,
    files: Vec<String>,
    sender: Address,
) -> Result<()> {
    let reply = {
        let mut state = s.state.lock().await;
        if state.predecessor != sender {
            // the old predecessor is gone or was overtaken, our backup is now the real copy
            let old = std::mem::replace(&mut state.predecessor, sender.clone());
            let absorbed = state.absorb_backups();
            info!(
                "[{}] Predecessor changed {} -> {}, absorbed {} backup files",
                s.me, old, sender, absorbed
            );
        }
        state.backup_files.extend(files);
        RingMessage::PingResponse {
            files: state.files.iter().cloned().collect(),
            successor: state.successor.clone(),
            sender: s.me.clone(),
        }
    };
    net::send_msg(stream, &reply).await?;
    Ok(())
}
