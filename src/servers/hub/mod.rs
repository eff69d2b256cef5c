pub mod auction;
pub mod charstatus;
pub mod db;
pub mod login;
pub mod memstore;
pub mod packet;
pub mod persist;
pub mod relay;
pub mod session;
pub mod timer;
pub mod world;

use anyhow::Result;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Mutex;

use crate::config::ServerConfig;
use auction::{AuctionHouse, AuctionNotice};
use db::{CharStore, Statement};
use persist::CharCache;
use relay::Relay;
use session::{Notice, SessionCache, WorldId};
use timer::{TimerId, Timers};

/// Fired timers, handled by the hub's event task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubEvent {
    DisconnectTimeout { account_id: u32, timer: TimerId },
    AuctionExpired { auction_id: u32, timer: TimerId },
}

/// One connected world server.
#[derive(Debug)]
pub struct WorldLink {
    pub tx: mpsc::Sender<Vec<u8>>,
    pub ip: u32,
    pub port: u16,
}

impl WorldLink {
    /// Public address the world server announced in its auth frame.
    pub fn addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.ip.to_le_bytes()), self.port)
    }
}

pub struct HubState {
    pub config: ServerConfig,
    pub store: Arc<dyn CharStore>,
    /// slot → WorldLink
    pub worlds: Mutex<Vec<Option<WorldLink>>>,
    /// sender to the login server connection task
    pub login_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    pub sessions: Mutex<SessionCache>,
    pub chars: CharCache,
    pub auctions: Mutex<AuctionHouse>,
    pub relay: Mutex<Relay>,
    pub timers: Timers,
}

/// Seconds since the epoch, the unit auction timestamps are stored in.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl HubState {
    /// Build the hub. The returned receiver must be handed to [`HubState::serve`].
    pub fn new(
        store: Arc<dyn CharStore>,
        config: ServerConfig,
    ) -> (Self, UnboundedReceiver<HubEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let timers = Timers::new();
        let limits = config.limits.clone();
        let state = Self {
            sessions: Mutex::new(SessionCache::new(
                timers.clone(),
                events_tx.clone(),
                limits.disconnect_timeout(),
            )),
            chars: CharCache::new(Arc::clone(&store)),
            auctions: Mutex::new(AuctionHouse::new(
                Arc::clone(&store),
                timers.clone(),
                events_tx,
                limits.auction(),
            )),
            relay: Mutex::new(Relay::new(limits.relay_ttl(), limits.relay_max_pending)),
            worlds: Mutex::new(Vec::new()),
            login_tx: Mutex::new(None),
            store,
            config,
            timers,
        };
        (state, events_rx)
    }

    pub async fn run(
        state: Arc<Self>,
        events: UnboundedReceiver<HubEvent>,
        bind_addr: &str,
    ) -> Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        Self::serve(state, events, listener).await
    }

    /// Startup work, background tasks, then the accept loop.
    pub async fn serve(
        state: Arc<Self>,
        events: UnboundedReceiver<HubEvent>,
        listener: TcpListener,
    ) -> Result<()> {
        state.startup().await?;

        tokio::spawn(handle_events(Arc::clone(&state), events));
        tokio::spawn(relay_sweeper(Arc::clone(&state)));
        tokio::spawn(online_cleanup(Arc::clone(&state)));

        tracing::info!("[hub] [ready] addr={}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            let s = Arc::clone(&state);
            tokio::spawn(async move {
                world::handle_world_server(s, stream, peer).await;
            });
        }
    }

    /// Nobody is online after a restart; auctions pick up where they were.
    async fn startup(&self) -> Result<()> {
        self.store.execute(&Statement::SetAllOffline).await?;
        self.send_to_login(packet::login_all_offline()).await;
        let loaded = self.auctions.lock().await.recover(unix_now()).await?;
        tracing::info!("[hub] [started] {} auction(s) pending", loaded);
        Ok(())
    }

    /// Stop every timer. Listings stay stored and are re-armed on next start.
    pub async fn shutdown(&self) {
        self.auctions.lock().await.shutdown();
        self.timers.cancel_all();
        tracing::info!("[hub] [shutdown] timers stopped");
    }

    pub async fn world_count(&self) -> usize {
        self.worlds.lock().await.iter().flatten().count()
    }

    pub async fn send_to_world(&self, idx: WorldId, msg: Vec<u8>) {
        let tx = {
            let worlds = self.worlds.lock().await;
            match worlds.get(idx) {
                Some(Some(w)) => w.tx.clone(),
                _ => {
                    tracing::debug!("[hub] [world] drop frame for missing world {}", idx);
                    return;
                }
            }
        };
        let _ = tx.send(msg).await;
    }

    /// Send to every connected world server.
    pub async fn broadcast(&self, msg: Vec<u8>) {
        self.broadcast_except(None, msg).await;
    }

    pub async fn broadcast_except(&self, skip: Option<WorldId>, msg: Vec<u8>) {
        let txs: Vec<mpsc::Sender<Vec<u8>>> = {
            let worlds = self.worlds.lock().await;
            worlds
                .iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != skip)
                .filter_map(|(_, w)| w.as_ref().map(|w| w.tx.clone()))
                .collect()
        };
        for tx in txs {
            let _ = tx.send(msg.clone()).await;
        }
    }

    /// Queue a frame for the login server. Dropped while the link is down;
    /// the link resends the online list when it comes back.
    pub async fn send_to_login(&self, msg: Vec<u8>) {
        let tx = self.login_tx.lock().await.clone();
        if let Some(tx) = tx {
            let _ = tx.send(msg).await;
        }
    }

    /// Carry out what the session cache decided.
    pub async fn apply_notices(&self, notices: Vec<Notice>) {
        for n in notices {
            match n {
                Notice::Kick { world, account_id, char_id, reason } => {
                    let frame = packet::kick(account_id, char_id, reason as u8);
                    self.send_to_world(world, frame).await;
                }
                Notice::CharOnline { char_id, online } => {
                    let flag = Statement::SetCharOnline { char_id, online };
                    if let Err(e) = self.store.execute(&flag).await {
                        tracing::error!("[hub] [session] online flag char_id={}: {}", char_id, e);
                    }
                }
                Notice::AccountOnline(account_id) => {
                    self.send_to_login(packet::login_account_online(account_id)).await;
                }
                Notice::AccountOffline(account_id) => {
                    self.send_to_login(packet::login_account_offline(account_id)).await;
                }
                Notice::AllOffline => {
                    self.send_to_login(packet::login_all_offline()).await;
                }
            }
        }
    }

    /// Mail out auction settlements and tell the world servers.
    pub async fn deliver_auction(&self, notices: Vec<AuctionNotice>) {
        for n in notices {
            match n {
                AuctionNotice::Mail(mail) => relay::deliver_mail(self, mail).await,
                AuctionNotice::Message { char_id, auction_id, code } => {
                    self.broadcast(packet::auction_message(char_id, auction_id, code)).await;
                }
            }
        }
    }
}

async fn handle_events(state: Arc<HubState>, mut events: UnboundedReceiver<HubEvent>) {
    while let Some(ev) = events.recv().await {
        match ev {
            HubEvent::DisconnectTimeout { account_id, timer } => {
                let notices = state.sessions.lock().await.disconnect_timeout(account_id, timer);
                state.apply_notices(notices).await;
            }
            HubEvent::AuctionExpired { auction_id, timer } => {
                let notices =
                    state.auctions.lock().await.expire(auction_id, timer, unix_now()).await;
                state.deliver_auction(notices).await;
            }
        }
    }
}

async fn relay_sweeper(state: Arc<HubState>) {
    let mut ticker = tokio::time::interval(state.config.limits.relay_sweep());
    loop {
        ticker.tick().await;
        let dropped = state.relay.lock().await.sweep(tokio::time::Instant::now());
        if dropped > 0 {
            tracing::debug!("[hub] [relay] swept {} expired message(s)", dropped);
        }
    }
}

async fn online_cleanup(state: Arc<HubState>) {
    let mut ticker = tokio::time::interval(state.config.limits.online_cleanup());
    // first tick completes at once
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let notices = state.sessions.lock().await.cleanup();
        state.apply_notices(notices).await;
    }
}
