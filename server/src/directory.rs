//! Session directory: which characters are connected, and from where.
//!
//! The engines never see connections; they key everything by character id.
//! The directory is the network layer's bookkeeping for routing responses
//! and scoped events back to live sessions, enforcing the session cap and
//! dropping sessions that go quiet.

use log::info;
use shared::entities::CharacterId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// One connected character.
#[derive(Debug)]
pub struct Session {
    pub character_id: CharacterId,
    pub addr: SocketAddr,
    /// Last time any packet arrived from this session.
    pub last_seen: Instant,
}

impl Session {
    pub fn new(character_id: CharacterId, addr: SocketAddr) -> Self {
        Session {
            character_id,
            addr,
            last_seen: Instant::now(),
        }
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// All live sessions, keyed by character.
pub struct SessionDirectory {
    sessions: HashMap<CharacterId, Session>,
    max_sessions: usize,
}

impl SessionDirectory {
    pub fn new(max_sessions: usize) -> Self {
        SessionDirectory {
            sessions: HashMap::new(),
            max_sessions,
        }
    }

    /// Registers a character's session. A reconnect replaces the old
    /// address; a brand-new session is refused at capacity.
    pub fn connect(&mut self, character_id: CharacterId, addr: SocketAddr) -> bool {
        if !self.sessions.contains_key(&character_id)
            && self.sessions.len() >= self.max_sessions
        {
            return false;
        }
        info!("character {} connected from {}", character_id, addr);
        self.sessions
            .insert(character_id, Session::new(character_id, addr));
        true
    }

    pub fn disconnect(&mut self, character_id: CharacterId) -> bool {
        if self.sessions.remove(&character_id).is_some() {
            info!("character {} disconnected", character_id);
            true
        } else {
            false
        }
    }

    /// Resolves the actor behind an incoming packet.
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<CharacterId> {
        self.sessions
            .values()
            .find(|session| session.addr == addr)
            .map(|session| session.character_id)
    }

    pub fn addr_of(&self, character_id: CharacterId) -> Option<SocketAddr> {
        self.sessions.get(&character_id).map(|s| s.addr)
    }

    /// Marks a session as recently active.
    pub fn touch(&mut self, character_id: CharacterId) {
        if let Some(session) = self.sessions.get_mut(&character_id) {
            session.last_seen = Instant::now();
        }
    }

    /// Drops sessions that have gone quiet and returns who was removed.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<CharacterId> {
        let timed_out: Vec<CharacterId> = self
            .sessions
            .values()
            .filter(|session| session.is_timed_out(timeout))
            .map(|session| session.character_id)
            .collect();

        for character_id in &timed_out {
            self.disconnect(*character_id);
        }
        timed_out
    }

    /// All session addresses, for broadcasting scoped events.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.sessions.values().map(|session| session.addr).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
