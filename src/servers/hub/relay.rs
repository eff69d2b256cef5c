//! Whisper relay and system mail delivery.
//!
//! A whisper whose recipient is not on the sender's own world server is
//! broadcast to every world server and parked here until one of them claims
//! it, all of them decline, or it ages past the TTL.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::auction::AuctionItem;
use super::db::Statement;
use super::packet;
use super::session::WorldId;
use super::HubState;

/// Whisper outcome flags carried on the wire.
pub const WIS_DELIVERED: u8 = 0;
pub const WIS_NOT_HERE: u8 = 1;
pub const WIS_IGNORED: u8 = 2;

pub const MAX_WHISPER: usize = 255;

#[derive(Debug, Clone)]
pub struct RelayMessage {
    pub id: u32,
    pub origin: WorldId,
    pub sender: String,
    pub recipient: String,
    pub message: String,
    pub enqueued: Instant,
    pub pending: usize,
}

/// Final answer for the world server that asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub origin: WorldId,
    pub sender: String,
    pub flag: u8,
}

pub struct Relay {
    pending: HashMap<u32, RelayMessage>,
    next_id: u32,
    ttl: Duration,
    cap: usize,
}

impl Relay {
    pub fn new(ttl: Duration, cap: usize) -> Self {
        Self { pending: HashMap::new(), next_id: 0, ttl, cap: cap.max(1) }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.pending.contains_key(&id)
    }

    /// Park a message that is about to go out to `worlds` servers.
    pub fn enqueue(
        &mut self,
        origin: WorldId,
        sender: &str,
        recipient: &str,
        message: &str,
        worlds: usize,
        now: Instant,
    ) -> u32 {
        if self.pending.len() >= self.cap {
            self.sweep(now);
        }
        while self.pending.len() >= self.cap {
            let Some(oldest) =
                self.pending.values().min_by_key(|m| (m.enqueued, m.id)).map(|m| m.id)
            else {
                break;
            };
            if let Some(m) = self.pending.remove(&oldest) {
                tracing::warn!(
                    "[hub] [relay] queue full, dropped whisper id={} {} -> {}",
                    m.id,
                    m.sender,
                    m.recipient
                );
            }
        }

        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0 && !self.pending.contains_key(&self.next_id) {
                break;
            }
        }
        let id = self.next_id;
        self.pending.insert(
            id,
            RelayMessage {
                id,
                origin,
                sender: sender.to_string(),
                recipient: recipient.to_string(),
                message: message.to_string(),
                enqueued: now,
                pending: worlds,
            },
        );
        id
    }

    /// One world server answered. Anything but "not here" settles the
    /// message, as does the last outstanding answer.
    pub fn ack(&mut self, id: u32, flag: u8) -> Option<Resolved> {
        let m = self.pending.get_mut(&id)?;
        m.pending = m.pending.saturating_sub(1);
        if m.pending > 0 && flag == WIS_NOT_HERE {
            return None;
        }
        let m = self.pending.remove(&id)?;
        Some(Resolved { origin: m.origin, sender: m.sender, flag })
    }

    /// Drop everything older than the TTL. The sender is not told.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.pending.len();
        self.pending.retain(|_, m| {
            let alive = now.saturating_duration_since(m.enqueued) <= ttl;
            if !alive {
                tracing::warn!(
                    "[hub] [relay] whisper id={} {} -> {} expired unresolved",
                    m.id,
                    m.sender,
                    m.recipient
                );
            }
            alive
        });
        before - self.pending.len()
    }
}

/// Validate and broadcast a whisper from world server `origin`.
pub async fn request(
    state: &HubState,
    origin: WorldId,
    sender: &str,
    recipient: &str,
    message: &str,
) {
    if message.is_empty() || message.len() > MAX_WHISPER {
        tracing::warn!(
            "[hub] [relay] dropped whisper from {} with length {}",
            sender,
            message.len()
        );
        return;
    }

    let target = match state.store.find_character(recipient).await {
        Ok(t) => t,
        Err(e) => {
            tracing::error!("[hub] [relay] recipient lookup failed: {}", e);
            None
        }
    };
    let online = match &target {
        Some(t) if t.name != sender => state.sessions.lock().await.is_online(t.account_id),
        _ => false,
    };
    let worlds = state.world_count().await;
    let target = match target {
        Some(t) if online && worlds > 0 => t,
        _ => {
            state.send_to_world(origin, packet::whisper_result(sender, WIS_NOT_HERE)).await;
            return;
        }
    };

    let id = state
        .relay
        .lock()
        .await
        .enqueue(origin, sender, &target.name, message, worlds, Instant::now());
    state.broadcast(packet::whisper(id, sender, &target.name, message)).await;
}

/// Route a world server's answer back to whoever asked.
pub async fn ack(state: &HubState, id: u32, flag: u8) {
    let resolved = state.relay.lock().await.ack(id, flag);
    if let Some(r) = resolved {
        state.send_to_world(r.origin, packet::whisper_result(&r.sender, r.flag)).await;
    }
}

/// A system mail, used for auction settlement.
#[derive(Debug, Clone, PartialEq)]
pub struct MailDraft {
    pub sender_id: u32,
    pub sender_name: String,
    pub dest_id: u32,
    pub dest_name: String,
    pub title: String,
    pub body: String,
    pub sent_at: i64,
    pub zeny: u32,
    pub item: Option<AuctionItem>,
}

/// Persist a mail and tell the world servers the recipient has post.
pub async fn deliver_mail(state: &HubState, mail: MailDraft) {
    match state.store.execute(&Statement::InsertMail(mail.clone())).await {
        Ok(done) => {
            tracing::info!(
                "[hub] [relay] mail to char_id={} zeny={} item={}",
                mail.dest_id,
                mail.zeny,
                mail.item.as_ref().map_or(0, |i| i.nameid)
            );
            // id 0 when the insert id does not fit
            let mail_id = u32::try_from(done.last_insert_id).unwrap_or_default();
            let notify = packet::mail_notify(mail.dest_id, mail_id, &mail.sender_name, &mail.title);
            state.broadcast(notify).await;
        }
        Err(e) => {
            tracing::error!("[hub] [relay] mail to char_id={} lost: {}", mail.dest_id, e);
        }
    }
}
