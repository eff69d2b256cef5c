//! World server links: admission, the per-link reader loop and dispatch.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::auction::{BidOutcome, RESULT_OK};
use super::packet::{self, FrameReader, OfflineKind, WorldRequest, WORLD_PACKETS};
use super::session::{UnbindReason, WorldId};
use super::{relay, unix_now, HubState, WorldLink};
use crate::config::ServerConfig;
use crate::network::acl;

/// Why a world server was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    Address,
    Credentials,
    Full,
}

/// Address and credential check for a world server's auth frame.
pub fn check_admission(
    config: &ServerConfig,
    peer: IpAddr,
    id: &str,
    pw: &str,
) -> Result<(), Refusal> {
    let permitted = match peer {
        IpAddr::V4(ip) => acl::allowed(&config.world_acl(), ip),
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => acl::allowed(&config.world_acl(), v4),
            None => config.world_allow.is_empty(),
        },
    };
    if !permitted {
        return Err(Refusal::Address);
    }
    if id != config.hub_id || pw != config.hub_pw {
        return Err(Refusal::Credentials);
    }
    Ok(())
}

/// Take the lowest free slot. Counting and claiming happen under one lock
/// so concurrent auths cannot overshoot `max`. Slot ids travel as a byte.
pub fn claim_slot(
    worlds: &mut Vec<Option<WorldLink>>,
    max: usize,
    link: WorldLink,
) -> Result<u8, Refusal> {
    if worlds.iter().flatten().count() >= max {
        return Err(Refusal::Full);
    }
    let idx = worlds.iter().position(|w| w.is_none()).unwrap_or(worlds.len());
    let slot = u8::try_from(idx).map_err(|_| Refusal::Full)?;
    if idx == worlds.len() {
        worlds.push(Some(link));
    } else {
        worlds[idx] = Some(link);
    }
    Ok(slot)
}

pub async fn handle_world_server(state: Arc<HubState>, stream: TcpStream, peer: SocketAddr) {
    let (rh, mut wh) = stream.into_split();
    let mut reader = FrameReader::new(rh, &WORLD_PACKETS);

    let first = match reader.next_frame().await {
        Ok(Some(frame)) => frame,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!("[hub] [world] {} bad first frame: {}", peer, e);
            return;
        }
    };
    let (id, pw, ip, port) = match WorldRequest::decode(&first) {
        Ok(Some(WorldRequest::Auth { id, pw, ip, port })) => (id, pw, ip, port),
        _ => {
            tracing::warn!("[hub] [world] {} did not start with auth", peer);
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    let link = WorldLink { tx, ip, port };
    let public = link.addr();
    let admitted = match check_admission(&state.config, peer.ip(), &id, &pw) {
        Ok(()) => {
            let mut worlds = state.worlds.lock().await;
            claim_slot(&mut worlds, state.config.max_world_servers, link)
        }
        Err(why) => Err(why),
    };
    let slot = match admitted {
        Ok(slot) => slot,
        Err(why) => {
            tracing::warn!("[hub] [world] refused {} ({:?})", peer, why);
            let _ = wh.write_all(&packet::auth_result(packet::AUTH_REJECTED, 0, 0)).await;
            return;
        }
    };
    let idx = WorldId::from(slot);

    if wh
        .write_all(&packet::auth_result(packet::AUTH_OK, slot, state.config.save_time))
        .await
        .is_err()
    {
        state.worlds.lock().await[idx] = None;
        return;
    }
    tracing::info!(
        "[hub] [world] World Server connected id={} addr={} public={}",
        idx,
        peer,
        public
    );

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if wh.write_all(&msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        match reader.next_frame().await {
            Ok(Some(frame)) => dispatch_world_packet(&state, idx, &frame).await,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("[hub] [world] World Server #{} framing error: {}", idx, e);
                break;
            }
        }
    }

    // keep the slot until the sweep is done; a reconnect must not land in it first
    let notices = state.sessions.lock().await.sweep_world_server(idx, false);
    state.apply_notices(notices).await;
    let link = state.worlds.lock().await.get_mut(idx).and_then(Option::take);
    writer.abort();
    match link {
        Some(link) => {
            tracing::info!(
                "[hub] [world] World Server #{} disconnected public={}",
                idx,
                link.addr()
            )
        }
        None => tracing::info!("[hub] [world] World Server #{} disconnected", idx),
    }
}

async fn dispatch_world_packet(state: &Arc<HubState>, idx: WorldId, frame: &Bytes) {
    let req = match WorldRequest::decode(frame) {
        Ok(Some(req)) => req,
        Ok(None) => {
            tracing::debug!(
                "[hub] [world] skipped cmd={:02X}{:02X} from #{}",
                frame[1],
                frame[0],
                idx
            );
            return;
        }
        Err(e) => {
            tracing::warn!("[hub] [world] World Server #{} malformed frame: {}", idx, e);
            return;
        }
    };

    match req {
        WorldRequest::Auth { .. } => {
            tracing::warn!("[hub] [world] World Server #{} sent auth twice", idx);
        }
        WorldRequest::SetUsers { users } => {
            let notices = state.sessions.lock().await.sync_world(idx, &users);
            tracing::info!("[hub] [world] World Server #{} synced {} user(s)", idx, users.len());
            state.apply_notices(notices).await;
        }
        WorldRequest::CharOnline { account_id, char_id } => {
            let notices = state.sessions.lock().await.bind(account_id, idx, char_id);
            state.apply_notices(notices).await;
        }
        WorldRequest::CharOffline { account_id, char_id, kind } => {
            let reason = match kind {
                OfflineKind::Logout => UnbindReason::Logout,
                OfflineKind::CharSelect => UnbindReason::CharSelect(idx),
            };
            let notices = state.sessions.lock().await.unbind_from(account_id, idx, char_id, reason);
            state.apply_notices(notices).await;
        }
        WorldRequest::RequestChar { account_id, char_id } => {
            handle_request_char(state, idx, account_id, char_id).await;
        }
        WorldRequest::SaveChar { account_id, char_id, final_save, status } => {
            let ok = match state.chars.save(char_id, &status).await {
                Ok(_) => true,
                Err(e) => {
                    tracing::error!("[hub] [save] char_id={}: {}", char_id, e);
                    false
                }
            };
            if final_save {
                let notices = state
                    .sessions
                    .lock()
                    .await
                    .unbind_from(account_id, idx, char_id, UnbindReason::Logout);
                state.apply_notices(notices).await;
                state.send_to_world(idx, packet::save_ack(account_id, char_id, ok)).await;
            }
        }
        WorldRequest::OfflineAll => {
            let notices = state.sessions.lock().await.sweep_world_server(idx, true);
            state.apply_notices(notices).await;
        }
        WorldRequest::UserCount { count } => {
            state.sessions.lock().await.set_user_count(idx, count);
        }
        WorldRequest::Whisper { sender, recipient, message } => {
            relay::request(state, idx, &sender, &recipient, &message).await;
        }
        WorldRequest::WhisperReply { id, flag } => {
            relay::ack(state, id, flag).await;
        }
        WorldRequest::Broadcast { sender, message } => {
            state.broadcast_except(Some(idx), packet::broadcast(&sender, &message)).await;
        }
        WorldRequest::WisToGm { sender, min_level, message } => {
            state
                .broadcast_except(Some(idx), packet::wis_to_gm(&sender, min_level, &message))
                .await;
        }
        WorldRequest::AuctionList(q) => {
            let (pages, hits) = state.auctions.lock().await.search(&q);
            state.send_to_world(idx, packet::auction_list(q.char_id, pages, &hits)).await;
        }
        WorldRequest::AuctionRegister(listing) => {
            let seller = listing.seller_id;
            let result = state.auctions.lock().await.create(listing, unix_now()).await;
            let reply = match result {
                Ok(auction_id) => packet::auction_register(seller, RESULT_OK, auction_id),
                Err(e) => {
                    tracing::debug!("[hub] [auction] register by {} rejected: {}", seller, e);
                    packet::auction_register(seller, e.code(), 0)
                }
            };
            state.send_to_world(idx, reply).await;
        }
        WorldRequest::AuctionCancel { char_id, auction_id } => {
            let result = state.auctions.lock().await.cancel(auction_id, char_id, unix_now()).await;
            match result {
                Ok(notices) => {
                    state.send_to_world(idx, packet::auction_cancel(char_id, RESULT_OK)).await;
                    state.deliver_auction(notices).await;
                }
                Err(e) => {
                    tracing::debug!(
                        "[hub] [auction] cancel {} by {} rejected: {}",
                        auction_id,
                        char_id,
                        e
                    );
                    state.send_to_world(idx, packet::auction_cancel(char_id, e.code())).await;
                }
            }
        }
        WorldRequest::AuctionClose { char_id, auction_id } => {
            let result = state.auctions.lock().await.close(auction_id, char_id, unix_now()).await;
            match result {
                Ok(notices) => {
                    state.send_to_world(idx, packet::auction_close(char_id, RESULT_OK)).await;
                    state.deliver_auction(notices).await;
                }
                Err(e) => {
                    tracing::debug!(
                        "[hub] [auction] close {} by {} rejected: {}",
                        auction_id,
                        char_id,
                        e
                    );
                    state.send_to_world(idx, packet::auction_close(char_id, e.code())).await;
                }
            }
        }
        WorldRequest::AuctionBid { char_id, name, auction_id, bid } => {
            let result = state
                .auctions
                .lock()
                .await
                .bid(auction_id, char_id, &name, bid, unix_now())
                .await;
            match result {
                Ok((outcome, notices)) => {
                    let change = match outcome {
                        BidOutcome::Raised => 0,
                        BidOutcome::Sold { change } => change,
                    };
                    state.send_to_world(idx, packet::auction_bid(char_id, change, RESULT_OK)).await;
                    state.deliver_auction(notices).await;
                }
                Err(e) => {
                    // the whole bid goes back to the bidder
                    tracing::debug!(
                        "[hub] [auction] bid on {} by {} rejected: {}",
                        auction_id,
                        char_id,
                        e
                    );
                    state.send_to_world(idx, packet::auction_bid(char_id, bid, e.code())).await;
                }
            }
        }
        WorldRequest::Ping => {
            state.send_to_world(idx, packet::pong()).await;
        }
    }
}

async fn handle_request_char(state: &Arc<HubState>, idx: WorldId, account_id: u32, char_id: u32) {
    let loaded = match state.chars.load(char_id).await {
        Ok(Some(cs)) if cs.account_id == account_id => Some(cs),
        Ok(Some(_)) => {
            tracing::warn!(
                "[hub] [world] char_id={} does not belong to account_id={}",
                char_id,
                account_id
            );
            None
        }
        Ok(None) => None,
        Err(e) => {
            tracing::error!("[hub] [world] load char_id={}: {}", char_id, e);
            None
        }
    };
    match packet::char_data(account_id, char_id, loaded.as_ref()) {
        Ok(reply) => state.send_to_world(idx, reply).await,
        Err(e) => tracing::error!("[hub] [world] encode char_id={}: {}", char_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn link(tx: &mpsc::Sender<Vec<u8>>) -> WorldLink {
        WorldLink { tx: tx.clone(), ip: 0x0100007F, port: 5001 }
    }

    fn config(extra: &str) -> ServerConfig {
        let yaml = format!(
            r#"
sql_ip: "127.0.0.1"
sql_id: "user"
sql_pw: "pass"
sql_db: "testdb"
hub_id: "hubid"
hub_pw: "hubpw"
login_id: "loginid"
login_pw: "loginpw"
login_ip: "127.0.0.1"
max_world_servers: 2
{}
"#,
            extra
        );
        ServerConfig::from_str(&yaml).unwrap()
    }

    fn local() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn test_admission_credentials() {
        let c = config("");
        assert_eq!(check_admission(&c, local(), "hubid", "hubpw"), Ok(()));
        assert_eq!(check_admission(&c, local(), "hubid", "nope"), Err(Refusal::Credentials));
    }

    #[test]
    fn test_claim_slot_respects_capacity() {
        let c = config("");
        let (tx, _rx) = mpsc::channel(1);
        let mut worlds = Vec::new();
        assert_eq!(claim_slot(&mut worlds, c.max_world_servers, link(&tx)), Ok(0));
        assert_eq!(claim_slot(&mut worlds, c.max_world_servers, link(&tx)), Ok(1));
        assert_eq!(claim_slot(&mut worlds, c.max_world_servers, link(&tx)), Err(Refusal::Full));
        assert_eq!(worlds.len(), 2);

        // a freed slot is handed out again before the vector grows
        worlds[0] = None;
        assert_eq!(claim_slot(&mut worlds, c.max_world_servers, link(&tx)), Ok(0));
        assert_eq!(worlds.len(), 2);
    }

    #[test]
    fn test_link_reports_announced_address() {
        let (tx, _rx) = mpsc::channel(1);
        assert_eq!(link(&tx).addr().to_string(), "127.0.0.1:5001");
    }

    #[test]
    fn test_claim_slot_never_wraps_the_slot_byte() {
        let (tx, _rx) = mpsc::channel(1);
        let mut worlds: Vec<Option<WorldLink>> = (0..256).map(|_| Some(link(&tx))).collect();
        assert_eq!(claim_slot(&mut worlds, 1000, link(&tx)), Err(Refusal::Full));
        assert_eq!(worlds.len(), 256);

        worlds[255] = None;
        assert_eq!(claim_slot(&mut worlds, 1000, link(&tx)), Ok(255));
    }

    #[test]
    fn test_admission_allow_list() {
        let c = config("world_allow:\n  - \"10.0.0.0/8\"");
        assert_eq!(check_admission(&c, local(), "hubid", "hubpw"), Err(Refusal::Address));
        let inside = IpAddr::V4(Ipv4Addr::new(10, 2, 3, 4));
        assert_eq!(check_admission(&c, inside, "hubid", "hubpw"), Ok(()));
    }
}
