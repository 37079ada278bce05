mod config;
mod error;
mod handlers;
mod messages;
mod net;
mod ping;
mod ring;
mod store;

use anyhow::{bail, Context, Result};
pub use config::Config;
pub use error::{AddressParseError, WireError};
pub use messages::{Address, RingMessage};
pub use ring::{in_interval, RingSpace};
pub use store::FileStore;
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio::{
    net::TcpListener,
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

/// Everything about the ring this node can change. Guarded by one lock in
/// [`Shared`]; no network I/O happens while it is held.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RingState {
    pub successor: Address,
    pub predecessor: Address,
    // the successor's successor, where the ping loop fails over to
    pub backup_successor: Address,
    // authoritative: names this node owns
    pub files: BTreeSet<String>,
    // passive copy of the neighbours' lists, promoted when the predecessor changes
    pub backup_files: BTreeSet<String>,
}

impl RingState {
    fn new(me: &Address) -> Self {
        Self {
            successor: me.clone(),
            predecessor: me.clone(),
            backup_successor: me.clone(),
            files: BTreeSet::new(),
            backup_files: BTreeSet::new(),
        }
    }

    fn is_alone(&self, me: &Address) -> bool {
        self.successor == *me && self.predecessor == *me
    }

    // relabels every backup entry as owned, returns how many were new
    fn absorb_backups(&mut self) -> usize {
        let before = self.files.len();
        self.files.extend(self.backup_files.iter().cloned());
        self.files.len() - before
    }
}

pub(crate) struct Shared {
    pub(crate) me: Address,
    pub(crate) key: u64,
    pub(crate) space: RingSpace,
    pub(crate) state: Mutex<RingState>,
    pub(crate) store: FileStore,
    pub(crate) ping_interval: Duration,
    pub(crate) ping_timeout: Duration,
    stop: watch::Sender<bool>,
    #[cfg(test)]
    pub(crate) gets_seen: std::sync::atomic::AtomicUsize,
}

impl Shared {
    pub(crate) fn hash_address(&self, addr: &Address) -> u64 {
        self.space.hash(&addr.ring_name())
    }

    // would `key` sit between this node and its successor
    pub(crate) fn lookup_node(&self, state: &RingState, key: u64) -> bool {
        in_interval(key, self.key, self.hash_address(&state.successor))
    }

    // does this node own `filename` given its current predecessor
    pub(crate) fn lookup_file(&self, state: &RingState, filename: &str) -> bool {
        in_interval(
            self.space.hash(filename),
            self.hash_address(&state.predecessor),
            self.key,
        )
    }

    pub(crate) fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub(crate) fn stop(&self) {
        self.stop.send_replace(true);
    }
}

/// A running ring member: its accept loop and ping loop run until
/// [`Node::leave`] or [`Node::kill`].
pub struct Node {
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
    ping_task: JoinHandle<()>,
}

impl Node {
    /// Binds the listener and starts the accept and ping loops. The node
    /// begins as the only member of its own ring.
    pub async fn start(config: &Config) -> Result<Self> {
        let space = RingSpace::new(config.bits)?;
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("binding {}:{}", config.host, config.port))?;
        let me = Address::new(config.host.clone(), listener.local_addr()?.port());
        let key = space.hash(&me.ring_name());
        let store = FileStore::open(&config.data_dir, &config.source_dir, &me).await?;
        let (stop, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            state: Mutex::new(RingState::new(&me)),
            me,
            key,
            space,
            store,
            ping_interval: config.ping_interval(),
            ping_timeout: config.ping_timeout(),
            stop,
            #[cfg(test)]
            gets_seen: Default::default(),
        });
        info!(
            "[{}] Listening with key {} in a ring of {}",
            shared.me,
            key,
            space.size()
        );

        let accept_task = tokio::spawn(net::serve(
            shared.clone(),
            listener,
            shared.stop.subscribe(),
        ));
        let ping_task = tokio::spawn(ping::run(shared.clone(), shared.stop.subscribe()));

        Ok(Self {
            shared,
            accept_task,
            ping_task,
        })
    }

    pub fn address(&self) -> &Address {
        &self.shared.me
    }

    pub fn key(&self) -> u64 {
        self.shared.key
    }

    pub fn space(&self) -> RingSpace {
        self.shared.space
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped()
    }

    /// A copy of the current pointers and file sets.
    pub async fn state(&self) -> RingState {
        self.shared.state.lock().await.clone()
    }

    pub async fn successor(&self) -> Address {
        self.shared.state.lock().await.successor.clone()
    }

    pub async fn predecessor(&self) -> Address {
        self.shared.state.lock().await.predecessor.clone()
    }

    pub async fn lookup_node(&self, key: u64) -> bool {
        let state = self.shared.state.lock().await;
        self.shared.lookup_node(&state, key)
    }

    pub async fn lookup_file(&self, filename: &str) -> bool {
        let state = self.shared.state.lock().await;
        self.shared.lookup_file(&state, filename)
    }

    /// Asks `bootstrap` to place this node in its ring. Returns once the
    /// request is sent; the placement arrives later as a `join_response`.
    pub async fn join(&self, bootstrap: Option<&Address>) -> Result<()> {
        let Some(bootstrap) = bootstrap else {
            info!("[{}] Starting a new ring", self.shared.me);
            return Ok(());
        };
        info!("[{}] Joining through {}", self.shared.me, bootstrap);
        let msg = RingMessage::Join {
            key: self.shared.key,
            sender: self.shared.me.clone(),
        };
        net::notify(bootstrap, &msg).await
    }

    /// Stores `filename` here if this node owns it, otherwise hands it to the
    /// successor. There is no acknowledgement.
    pub async fn put(&self, filename: &str) -> Result<()> {
        if self.is_stopped() {
            bail!("[{}] cannot put {}: node has left the ring", self.shared.me, filename);
        }
        handlers::place_file(&self.shared, filename.to_string(), self.shared.me.clone(), false)
            .await
    }

    /// `Some(filename)` if any node in the ring owns it, `None` once the
    /// request has gone all the way around without a hit.
    pub async fn get(&self, filename: &str) -> Result<Option<String>> {
        // our address is on no successor path any more, so a forwarded get would never come back
        if self.is_stopped() {
            bail!("[{}] cannot get {}: node has left the ring", self.shared.me, filename);
        }
        let successor = {
            let state = self.shared.state.lock().await;
            if state.files.contains(filename) {
                return Ok(Some(filename.to_string()));
            }
            state.successor.clone()
        };

        let msg = RingMessage::Get {
            filename: filename.to_string(),
            sender: self.shared.me.clone(),
        };
        match net::request(&successor, &msg).await? {
            RingMessage::GetResponse { sender, .. } => {
                info!("[{}] {} found on {}", self.shared.me, filename, sender);
                Ok(Some(filename.to_string()))
            }
            RingMessage::NotFound { .. } => {
                info!("[{}] {} not found in the ring", self.shared.me, filename);
                Ok(None)
            }
            other => {
                warn!(
                    "[{}] Unexpected {} in reply to get {}",
                    self.shared.me,
                    other.kind(),
                    filename
                );
                Ok(None)
            }
        }
    }

    /// Hands this node's neighbours to each other and its file lists to the
    /// successor, then stops. A neighbour that cannot be reached is skipped.
    pub async fn leave(&self) -> Result<()> {
        let s = &self.shared;
        let state = self.state().await;

        if state.predecessor != s.me {
            let msg = RingMessage::SuccLeft {
                new_successor: state.successor.clone(),
                sender: s.me.clone(),
            };
            if let Err(e) = net::notify(&state.predecessor, &msg).await {
                warn!("[{}] Could not tell predecessor we left: {:#}", s.me, e);
            }
        }

        if state.successor != s.me {
            let msg = RingMessage::PredLeft {
                files: state.files.iter().cloned().collect(),
                backup_files: state.backup_files.iter().cloned().collect(),
                sender: s.me.clone(),
            };
            if let Err(e) = net::notify(&state.successor, &msg).await {
                warn!("[{}] Could not hand files to successor: {:#}", s.me, e);
            }
        }

        s.stop();
        info!("[{}] Left the ring", s.me);
        Ok(())
    }

    /// Stops both loops without telling anyone, as if the process died.
    pub fn kill(&self) {
        self.shared.stop();
        info!("[{}] Killed", self.shared.me);
    }

    /// Waits for the accept and ping loops to finish.
    pub async fn wait(self) -> Result<()> {
        self.accept_task.await?;
        self.ping_task.await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
