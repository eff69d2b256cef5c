//! Which account is on which world server.
//!
//! Operations never fail. Anything another process must hear about comes
//! back as a list of [`Notice`]s for the caller to deliver.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use super::timer::{TimerId, Timers};
use super::HubEvent;

pub type WorldId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Unbound,
    /// The owning world server dropped; the player may still be alive there.
    Unknown,
    World(WorldId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KickReason {
    Requested = 1,
    DuplicateLogin = 2,
    ServerShutdown = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnbindReason {
    Logout,
    /// Back to character select on `WorldId`; the account stays online.
    CharSelect(WorldId),
    Timeout,
    Cleanup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub account_id: u32,
    pub char_id: Option<u32>,
    pub location: Location,
    /// Link holding the account at character select, if any.
    pub connection: Option<WorldId>,
    pub disconnect_timer: Option<TimerId>,
}

impl Session {
    fn new(account_id: u32) -> Self {
        Self {
            account_id,
            char_id: None,
            location: Location::Unbound,
            connection: None,
            disconnect_timer: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Kick { world: WorldId, account_id: u32, char_id: u32, reason: KickReason },
    CharOnline { char_id: u32, online: bool },
    AccountOnline(u32),
    AccountOffline(u32),
    AllOffline,
}

pub struct SessionCache {
    sessions: HashMap<u32, Session>,
    users: HashMap<WorldId, u32>,
    timers: Timers,
    events: UnboundedSender<HubEvent>,
    disconnect_timeout: Duration,
}

impl SessionCache {
    pub fn new(
        timers: Timers,
        events: UnboundedSender<HubEvent>,
        disconnect_timeout: Duration,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            users: HashMap::new(),
            timers,
            events,
            disconnect_timeout,
        }
    }

    pub fn get(&self, account_id: u32) -> Option<&Session> {
        self.sessions.get(&account_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Live users on one world server.
    pub fn users(&self, world: WorldId) -> u32 {
        self.users.get(&world).copied().unwrap_or(0)
    }

    /// Bound somewhere, or possibly still alive on a lost world server.
    pub fn is_online(&self, account_id: u32) -> bool {
        self.sessions
            .get(&account_id)
            .is_some_and(|s| s.location != Location::Unbound)
    }

    /// Accounts the login server should consider online.
    pub fn online_accounts(&self) -> Vec<u32> {
        self.sessions
            .values()
            .filter(|s| s.location != Location::Unbound || s.connection.is_some())
            .map(|s| s.account_id)
            .collect()
    }

    /// World servers report their own count periodically.
    pub fn set_user_count(&mut self, world: WorldId, count: u32) {
        self.users.insert(world, count);
    }

    fn cancel_timer(timers: &Timers, session: &mut Session) {
        if let Some(id) = session.disconnect_timer.take() {
            timers.cancel(id);
        }
    }

    pub fn bind(&mut self, account_id: u32, world: WorldId, char_id: u32) -> Vec<Notice> {
        let mut out = Vec::new();
        let session = self.sessions.entry(account_id).or_insert_with(|| Session::new(account_id));

        if session.location == Location::World(world) && session.char_id == Some(char_id) {
            return out;
        }

        match session.location {
            Location::World(prev) if prev != world => {
                tracing::warn!(
                    "[hub] [session] account_id={} already on world {} while binding to {}, kicking",
                    account_id,
                    prev,
                    world
                );
                out.push(Notice::Kick {
                    world: prev,
                    account_id,
                    char_id: session.char_id.unwrap_or(char_id),
                    reason: KickReason::DuplicateLogin,
                });
                let n = self.users.entry(prev).or_insert(0);
                *n = n.saturating_sub(1);
                *self.users.entry(world).or_insert(0) += 1;
            }
            Location::World(_) => {}
            Location::Unbound | Location::Unknown => {
                *self.users.entry(world).or_insert(0) += 1;
            }
        }

        if let Some(old) = session.char_id.filter(|&c| c != char_id) {
            out.push(Notice::CharOnline { char_id: old, online: false });
        }
        Self::cancel_timer(&self.timers, session);
        session.char_id = Some(char_id);
        session.location = Location::World(world);
        session.connection = None;
        out.push(Notice::CharOnline { char_id, online: true });
        out.push(Notice::AccountOnline(account_id));
        tracing::debug!(
            "[hub] [session] bound account_id={} char_id={} world={}",
            account_id,
            char_id,
            world
        );
        out
    }

    /// Offline report from `world` for `char_id`. Ignored when the session
    /// has since moved to another world server or another character, so a
    /// late or kicked world cannot take down the live binding.
    pub fn unbind_from(
        &mut self,
        account_id: u32,
        world: WorldId,
        char_id: u32,
        reason: UnbindReason,
    ) -> Vec<Notice> {
        if let Some(session) = self.sessions.get(&account_id) {
            let other_world = match session.location {
                Location::World(w) => w != world,
                Location::Unbound => session.connection.is_some_and(|link| link != world),
                Location::Unknown => false,
            };
            if other_world || session.char_id.is_some_and(|c| c != char_id) {
                tracing::debug!(
                    "[hub] [session] ignored offline for account_id={} char_id={} from world {}",
                    account_id,
                    char_id,
                    world
                );
                return Vec::new();
            }
        }
        self.unbind(account_id, reason)
    }

    pub fn unbind(&mut self, account_id: u32, reason: UnbindReason) -> Vec<Notice> {
        let mut out = Vec::new();
        let Some(session) = self.sessions.get_mut(&account_id) else {
            if !matches!(reason, UnbindReason::CharSelect(_)) {
                out.push(Notice::AccountOffline(account_id));
            }
            return out;
        };

        if let Location::World(w) = session.location {
            let n = self.users.entry(w).or_insert(0);
            *n = n.saturating_sub(1);
        }
        Self::cancel_timer(&self.timers, session);
        if let Some(char_id) = session.char_id.take() {
            out.push(Notice::CharOnline { char_id, online: false });
        }
        session.location = Location::Unbound;
        if let UnbindReason::CharSelect(link) = reason {
            session.connection = Some(link);
        }
        if session.connection.is_none() {
            out.push(Notice::AccountOffline(account_id));
        }
        tracing::debug!("[hub] [session] unbound account_id={} reason={:?}", account_id, reason);
        out
    }

    /// A world server went away. Its sessions become `Unknown` unless
    /// `offline_all` is set, in which case every session everywhere is
    /// unbound and the world servers are told to drop their players.
    pub fn sweep_world_server(&mut self, world: WorldId, offline_all: bool) -> Vec<Notice> {
        let mut out = Vec::new();
        if offline_all {
            let ids: Vec<u32> = self.sessions.keys().copied().collect();
            for account_id in ids {
                let Some(session) = self.sessions.get_mut(&account_id) else { continue };
                if let (Location::World(w), Some(char_id)) = (session.location, session.char_id) {
                    out.push(Notice::Kick {
                        world: w,
                        account_id,
                        char_id,
                        reason: KickReason::ServerShutdown,
                    });
                }
                Self::cancel_timer(&self.timers, session);
                if let Some(char_id) = session.char_id.take() {
                    out.push(Notice::CharOnline { char_id, online: false });
                }
                session.location = Location::Unbound;
                session.connection = None;
            }
            self.users.clear();
            out.push(Notice::AllOffline);
            tracing::info!("[hub] [session] all sessions set offline");
            return out;
        }

        let mut moved = 0;
        for session in self.sessions.values_mut() {
            if session.location == Location::World(world) {
                session.location = Location::Unknown;
                moved += 1;
            }
            if session.connection == Some(world) {
                session.connection = None;
                if session.location == Location::Unbound {
                    out.push(Notice::AccountOffline(session.account_id));
                }
            }
        }
        self.users.remove(&world);
        tracing::info!("[hub] [session] world {} lost, {} session(s) now unknown", world, moved);
        out
    }

    /// The authentication tier wants `account_id` off the game. Bound
    /// sessions get a kick and a timer; the world server is expected to
    /// confirm with a logout before it fires.
    pub fn request_kick(&mut self, account_id: u32) -> Vec<Notice> {
        let Some(session) = self.sessions.get_mut(&account_id) else {
            return vec![Notice::AccountOffline(account_id)];
        };
        match session.location {
            Location::World(world) => {
                let mut out = vec![Notice::Kick {
                    world,
                    account_id,
                    char_id: session.char_id.unwrap_or(0),
                    reason: KickReason::Requested,
                }];
                if session.disconnect_timer.is_none() {
                    let events = self.events.clone();
                    let delay = self.disconnect_timeout;
                    let timer = self.timers.schedule(delay, move |timer| async move {
                        let _ = events.send(HubEvent::DisconnectTimeout { account_id, timer });
                    });
                    session.disconnect_timer = Some(timer);
                } else {
                    out.clear();
                }
                out
            }
            Location::Unknown | Location::Unbound => {
                session.connection = None;
                self.unbind(account_id, UnbindReason::Logout)
            }
        }
    }

    /// Fired pending-disconnect timer. Ignored unless the session still
    /// carries this exact timer.
    pub fn disconnect_timeout(&mut self, account_id: u32, timer: TimerId) -> Vec<Notice> {
        match self.sessions.get_mut(&account_id) {
            Some(s) if s.disconnect_timer == Some(timer) => {
                s.disconnect_timer = None;
                tracing::warn!(
                    "[hub] [session] account_id={} did not disconnect in time",
                    account_id
                );
                self.unbind(account_id, UnbindReason::Timeout)
            }
            _ => Vec::new(),
        }
    }

    /// Full user list from a (re)connected world server.
    pub fn sync_world(&mut self, world: WorldId, users: &[(u32, u32)]) -> Vec<Notice> {
        for session in self.sessions.values_mut() {
            if session.location == Location::World(world) {
                session.location = Location::Unknown;
            }
        }
        self.users.insert(world, 0);
        let mut out = Vec::new();
        for &(account_id, char_id) in users {
            out.extend(self.bind(account_id, world, char_id));
        }
        out
    }

    /// Periodic pass: unknown sessions go offline, dead records are dropped.
    pub fn cleanup(&mut self) -> Vec<Notice> {
        let unknown: Vec<u32> = self
            .sessions
            .values()
            .filter(|s| s.location == Location::Unknown)
            .map(|s| s.account_id)
            .collect();
        let mut out = Vec::new();
        for account_id in unknown {
            out.extend(self.unbind(account_id, UnbindReason::Cleanup));
        }
        let before = self.sessions.len();
        self.sessions.retain(|_, s| {
            s.location != Location::Unbound
                || s.connection.is_some()
                || s.disconnect_timer.is_some()
        });
        let dropped = before - self.sessions.len();
        if dropped > 0 {
            tracing::debug!("[hub] [session] cleanup dropped {} record(s)", dropped);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn cache() -> (SessionCache, mpsc::UnboundedReceiver<HubEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionCache::new(Timers::new(), tx, Duration::from_secs(20)), rx)
    }

    fn kicks(notices: &[Notice]) -> Vec<&Notice> {
        notices.iter().filter(|n| matches!(n, Notice::Kick { .. })).collect()
    }

    #[test]
    fn test_bind_is_idempotent() {
        let (mut c, _rx) = cache();
        let first = c.bind(1, 0, 100);
        assert!(first.contains(&Notice::AccountOnline(1)));
        assert!(c.bind(1, 0, 100).is_empty());
        assert_eq!(c.users(0), 1);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_rebind_kicks_previous_world_once() {
        let (mut c, _rx) = cache();
        c.bind(1, 1, 100);
        let out = c.bind(1, 2, 100);
        let k = kicks(&out);
        assert_eq!(k.len(), 1);
        assert_eq!(
            k[0],
            &Notice::Kick {
                world: 1,
                account_id: 1,
                char_id: 100,
                reason: KickReason::DuplicateLogin
            }
        );
        assert_eq!(c.get(1).unwrap().location, Location::World(2));
        assert_eq!(c.users(1), 0);
        assert_eq!(c.users(2), 1);
    }

    #[test]
    fn test_char_switch_on_same_world_marks_old_offline() {
        let (mut c, _rx) = cache();
        c.bind(1, 0, 100);
        let out = c.bind(1, 0, 101);
        assert!(kicks(&out).is_empty());
        assert!(out.contains(&Notice::CharOnline { char_id: 100, online: false }));
        assert!(out.contains(&Notice::CharOnline { char_id: 101, online: true }));
        assert_eq!(c.users(0), 1);
    }

    #[test]
    fn test_unbind_counter_never_negative() {
        let (mut c, _rx) = cache();
        c.bind(1, 0, 100);
        c.set_user_count(0, 0);
        let out = c.unbind(1, UnbindReason::Logout);
        assert_eq!(c.users(0), 0);
        assert!(out.contains(&Notice::AccountOffline(1)));
        assert_eq!(c.get(1).unwrap().location, Location::Unbound);
    }

    #[test]
    fn test_char_select_keeps_account_online() {
        let (mut c, _rx) = cache();
        c.bind(1, 3, 100);
        let out = c.unbind(1, UnbindReason::CharSelect(3));
        assert!(!out.contains(&Notice::AccountOffline(1)));
        assert_eq!(c.get(1).unwrap().connection, Some(3));

        // losing that link finally takes the account offline
        let out = c.sweep_world_server(3, false);
        assert_eq!(out, vec![Notice::AccountOffline(1)]);
    }

    #[test]
    fn test_offline_from_kicked_world_is_ignored() {
        let (mut c, _rx) = cache();
        c.bind(7, 1, 100);
        c.bind(7, 2, 100);
        // world 1 obeys its kick and reports the character offline
        assert!(c.unbind_from(7, 1, 100, UnbindReason::Logout).is_empty());
        assert_eq!(c.get(7).unwrap().location, Location::World(2));
        assert_eq!(c.users(2), 1);
        assert!(c.is_online(7));

        let out = c.unbind_from(7, 2, 100, UnbindReason::Logout);
        assert!(out.contains(&Notice::AccountOffline(7)));
        assert_eq!(c.users(2), 0);
    }

    #[test]
    fn test_offline_for_previous_char_is_ignored() {
        let (mut c, _rx) = cache();
        c.bind(7, 1, 100);
        c.bind(7, 2, 101);
        assert!(c.unbind_from(7, 1, 100, UnbindReason::Logout).is_empty());
        // same world, stale character
        assert!(c.unbind_from(7, 2, 100, UnbindReason::Logout).is_empty());
        let s = c.get(7).unwrap();
        assert_eq!(s.char_id, Some(101));
        assert_eq!(s.location, Location::World(2));
    }

    #[test]
    fn test_offline_after_world_loss_is_accepted() {
        let (mut c, _rx) = cache();
        c.bind(7, 1, 100);
        c.sweep_world_server(1, false);
        let out = c.unbind_from(7, 3, 100, UnbindReason::Logout);
        assert!(out.contains(&Notice::CharOnline { char_id: 100, online: false }));
        assert!(!c.is_online(7));
    }

    #[test]
    fn test_unbind_unknown_account_still_notifies() {
        let (mut c, _rx) = cache();
        assert_eq!(c.unbind(9, UnbindReason::Logout), vec![Notice::AccountOffline(9)]);
    }

    #[test]
    fn test_sweep_marks_unknown_not_offline() {
        let (mut c, _rx) = cache();
        c.bind(1, 0, 100);
        c.bind(2, 1, 200);
        let out = c.sweep_world_server(0, false);
        assert!(out.is_empty());
        assert_eq!(c.get(1).unwrap().location, Location::Unknown);
        assert_eq!(c.get(2).unwrap().location, Location::World(1));
        assert!(c.is_online(1));

        // coming back on another world does not kick anyone
        let out = c.bind(1, 1, 100);
        assert!(kicks(&out).is_empty());
    }

    #[test]
    fn test_sweep_offline_all() {
        let (mut c, _rx) = cache();
        c.bind(1, 0, 100);
        c.bind(2, 1, 200);
        let out = c.sweep_world_server(0, true);
        assert_eq!(kicks(&out).len(), 2);
        assert_eq!(out.last(), Some(&Notice::AllOffline));
        assert!(!c.is_online(1));
        assert!(!c.is_online(2));
        assert_eq!(c.users(1), 0);
    }

    #[test]
    fn test_cleanup_drops_unknown_and_dead() {
        let (mut c, _rx) = cache();
        c.bind(1, 0, 100);
        c.bind(2, 1, 200);
        c.sweep_world_server(0, false);
        let out = c.cleanup();
        assert!(out.contains(&Notice::AccountOffline(1)));
        assert!(c.get(1).is_none());
        assert!(c.get(2).is_some());
    }

    #[test]
    fn test_sync_world_rebinds_listed_users() {
        let (mut c, _rx) = cache();
        c.bind(1, 0, 100);
        c.bind(2, 0, 200);
        c.sync_world(0, &[(2, 200), (3, 300)]);
        assert_eq!(c.get(1).unwrap().location, Location::Unknown);
        assert_eq!(c.get(2).unwrap().location, Location::World(0));
        assert_eq!(c.get(3).unwrap().location, Location::World(0));
        assert_eq!(c.users(0), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kick_timeout_unbinds() {
        let (mut c, mut rx) = cache();
        c.bind(1, 0, 100);
        let out = c.request_kick(1);
        assert_eq!(kicks(&out).len(), 1);
        // a second request while waiting does not kick again
        assert!(c.request_kick(1).is_empty());

        let Some(HubEvent::DisconnectTimeout { account_id, timer }) = rx.recv().await else {
            panic!("expected timeout event");
        };
        assert_eq!(account_id, 1);
        let out = c.disconnect_timeout(account_id, timer);
        assert!(out.contains(&Notice::AccountOffline(1)));
        assert!(!c.is_online(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timeout_ignored_after_logout() {
        let (mut c, _rx) = cache();
        c.bind(1, 0, 100);
        c.request_kick(1);
        let timer = c.get(1).unwrap().disconnect_timer.unwrap();
        c.unbind(1, UnbindReason::Logout);
        c.bind(1, 0, 100);
        assert!(c.disconnect_timeout(1, timer).is_empty());
        assert!(c.is_online(1));
    }

    #[test]
    fn test_kick_of_unbound_account_goes_offline() {
        let (mut c, _rx) = cache();
        c.bind(1, 0, 100);
        c.unbind(1, UnbindReason::CharSelect(0));
        let out = c.request_kick(1);
        assert_eq!(out, vec![Notice::AccountOffline(1)]);
    }
}
