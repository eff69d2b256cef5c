//! Outbound link to the authentication tier.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use super::packet::{self, FrameReader, LoginMessage, LOGIN_PACKETS};
use super::HubState;

const RETRY: Duration = Duration::from_secs(5);
const PING_EVERY: Duration = Duration::from_secs(30);

/// Keep a connection to the login server for the life of the process.
pub async fn connect_to_login(state: Arc<HubState>) {
    let mut ticker = interval(RETRY);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let addr = format!("{}:{}", state.config.login_ip, state.config.login_port);
        tracing::info!("[hub] [login] Connecting to login server at {}", addr);
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                run_login_connection(Arc::clone(&state), stream).await;
                *state.login_tx.lock().await = None;
                tracing::warn!("[hub] [login] link to login server lost");
            }
            Err(e) => tracing::warn!("[hub] [login] Connect failed: {}", e),
        }
    }
}

async fn run_login_connection(state: Arc<HubState>, stream: TcpStream) {
    let (rh, mut wh) = stream.into_split();
    let mut reader = FrameReader::new(rh, &LOGIN_PACKETS);

    let auth = packet::login_auth(&state.config.login_id, &state.config.login_pw);
    if wh.write_all(&auth).await.is_err() {
        return;
    }
    match reader.next_frame().await {
        Ok(Some(frame)) => match LoginMessage::decode(&frame) {
            Some(LoginMessage::AuthResult { ok: true }) => {}
            other => {
                tracing::error!("[hub] [login] login server refused the hub: {:?}", other);
                return;
            }
        },
        Ok(None) => return,
        Err(e) => {
            tracing::warn!("[hub] [login] bad auth reply: {}", e);
            return;
        }
    }
    tracing::info!("[hub] [login] connected to login server");

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if wh.write_all(&msg).await.is_err() {
                break;
            }
        }
    });

    // resync: everything offline, then whoever is actually here
    let online = state.sessions.lock().await.online_accounts();
    let _ = tx.send(packet::login_all_offline()).await;
    for account_id in online {
        let _ = tx.send(packet::login_account_online(account_id)).await;
    }
    *state.login_tx.lock().await = Some(tx.clone());

    let mut ping = interval(PING_EVERY);
    ping.tick().await;
    loop {
        tokio::select! {
            next = reader.next_frame() => match next {
                Ok(Some(frame)) => handle_login_message(&state, LoginMessage::decode(&frame)).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("[hub] [login] framing error: {}", e);
                    break;
                }
            },
            _ = ping.tick() => {
                if tx.send(packet::login_ping()).await.is_err() {
                    break;
                }
            }
        }
    }
    writer.abort();
}

async fn handle_login_message(state: &Arc<HubState>, msg: Option<LoginMessage>) {
    match msg {
        Some(LoginMessage::Kick { account_id }) => {
            tracing::info!("[hub] [login] kick requested for account_id={}", account_id);
            let notices = state.sessions.lock().await.request_kick(account_id);
            state.apply_notices(notices).await;
        }
        Some(LoginMessage::Pong) => tracing::trace!("[hub] [login] pong"),
        Some(LoginMessage::AuthResult { .. }) => {
            tracing::warn!("[hub] [login] unexpected auth result");
        }
        None => {}
    }
}
