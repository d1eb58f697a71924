//! Server network layer: UDP transport, request dispatch and event routing.
//!
//! Each inbound packet is one request/response unit: resolve the actor from
//! the session directory, run the external gates (rate limit, then
//! authorization), hand the request to the right engine, and send the typed
//! result back. Engine events flow out of the bus and are routed to
//! sessions by scope. Background tasks sweep combat deadlines, stuck
//! transits and quiet sessions.

use crate::access::{Authorizer, RateLimiter};
use crate::combat::CombatEngine;
use crate::directory::SessionDirectory;
use crate::events::EventEnvelope;
use crate::gateway::Gateway;
use crate::movement::MovementEngine;
use crate::trading::TradingEngine;
use crate::util::now_ms;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::entities::{CharacterId, CombatantId};
use shared::{EventScope, GameError, Operation, Packet, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};

/// Messages sent from network tasks to the main dispatch loop.
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    SessionTimeout { character_id: CharacterId },
}

/// Messages sent from the dispatch loop to the sender task.
#[derive(Debug)]
pub enum OutboundMessage {
    Send { packet: Packet, addr: SocketAddr },
    Broadcast { packet: Packet },
}

/// Where a scoped event envelope should be delivered.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    To(SocketAddr),
    All,
    Nowhere,
}

/// Character-scoped envelopes go to that character's session; wider scopes
/// are broadcast and membership filtering is left to the delivery
/// transport.
fn route_for(scope: EventScope, sessions: &SessionDirectory) -> Route {
    match scope {
        EventScope::Character(id) => match sessions.addr_of(id) {
            Some(addr) => Route::To(addr),
            None => Route::Nowhere,
        },
        EventScope::Corporation(_) | EventScope::Sector(_) => Route::All,
    }
}

/// Main server coordinating transport, gates, engines and sweepers.
pub struct Server {
    socket: Arc<UdpSocket>,
    sessions: Arc<RwLock<SessionDirectory>>,
    gateway: Arc<Gateway>,
    trading: Arc<TradingEngine>,
    combat: Arc<CombatEngine>,
    movement: Arc<MovementEngine>,
    authorizer: Arc<dyn Authorizer>,
    limiter: Arc<dyn RateLimiter>,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    out_tx: mpsc::UnboundedSender<OutboundMessage>,
    out_rx: Option<mpsc::UnboundedReceiver<OutboundMessage>>,
    events_rx: mpsc::UnboundedReceiver<EventEnvelope>,
}

impl Server {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        addr: &str,
        max_sessions: usize,
        gateway: Arc<Gateway>,
        trading: Arc<TradingEngine>,
        combat: Arc<CombatEngine>,
        movement: Arc<MovementEngine>,
        authorizer: Arc<dyn Authorizer>,
        limiter: Arc<dyn RateLimiter>,
        events_rx: mpsc::UnboundedReceiver<EventEnvelope>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("server listening on {}", addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            sessions: Arc::new(RwLock::new(SessionDirectory::new(max_sessions))),
            gateway,
            trading,
            combat,
            movement,
            authorizer,
            limiter,
            server_tx,
            server_rx,
            out_tx,
            out_rx: Some(out_rx),
            events_rx,
        })
    }

    /// The address the socket actually bound (useful with port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawns the task that continuously listens for incoming packets.
    fn spawn_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if server_tx
                                .send(ServerMessage::PacketReceived { packet, addr })
                                .is_err()
                            {
                                break;
                            }
                        } else {
                            warn!("failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns the task that drains the outbound queue onto the socket.
    fn spawn_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let sessions = Arc::clone(&self.sessions);
        let Some(mut out_rx) = self.out_rx.take() else {
            return;
        };

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                match message {
                    OutboundMessage::Send { packet, addr } => {
                        Self::send_impl(&socket, &packet, addr).await;
                    }
                    OutboundMessage::Broadcast { packet } => {
                        let addrs = {
                            let sessions = sessions.read().await;
                            sessions.addrs()
                        };
                        for addr in addrs {
                            Self::send_impl(&socket, &packet, addr).await;
                        }
                    }
                }
            }
        });
    }

    /// Spawns the session timeout checker.
    fn spawn_timeout_checker(&self) {
        let sessions = Arc::clone(&self.sessions);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let timed_out = {
                    let mut sessions = sessions.write().await;
                    sessions.check_timeouts(Duration::from_secs(30))
                };
                for character_id in timed_out {
                    if server_tx
                        .send(ServerMessage::SessionTimeout { character_id })
                        .is_err()
                    {
                        return;
                    }
                }
            }
        });
    }

    /// Spawns the deadline sweeper: force-resolves overdue combat rounds
    /// and finalizes transits whose arrival task died.
    fn spawn_sweeper(&self) {
        let combat = Arc::clone(&self.combat);
        let movement = Arc::clone(&self.movement);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let now = now_ms();
                let resolved = combat.force_resolve_due(now).await;
                if !resolved.is_empty() {
                    debug!("sweeper resolved {} overdue rounds", resolved.len());
                }
                let recovered = movement.recover_stuck_ships(now).await;
                if !recovered.is_empty() {
                    warn!("sweeper recovered {} stuck ships", recovered.len());
                }
            }
        });
    }

    async fn send_impl(socket: &UdpSocket, packet: &Packet, addr: SocketAddr) {
        match serialize(packet) {
            Ok(data) => {
                if let Err(e) = socket.send_to(&data, addr).await {
                    error!("failed to send to {}: {}", addr, e);
                }
            }
            Err(e) => error!("failed to serialize packet: {}", e),
        }
    }

    fn send(&self, packet: Packet, addr: SocketAddr) {
        if self
            .out_tx
            .send(OutboundMessage::Send { packet, addr })
            .is_err()
        {
            error!("outbound queue closed");
        }
    }

    fn broadcast(&self, packet: Packet) {
        if self.out_tx.send(OutboundMessage::Broadcast { packet }).is_err() {
            error!("outbound queue closed");
        }
    }

    /// Resolves the connected actor behind a request packet and applies the
    /// rate limit gate.
    async fn gate(
        &self,
        addr: SocketAddr,
        claimed: CharacterId,
        operation: Operation,
    ) -> Result<CharacterId, GameError> {
        let actor = {
            let sessions = self.sessions.read().await;
            sessions.find_by_addr(addr)
        };
        let actor = actor.ok_or_else(|| GameError::Denied {
            reason: "not connected".to_string(),
        })?;
        if actor != claimed {
            return Err(GameError::Denied {
                reason: format!("session belongs to character {}", actor),
            });
        }
        {
            let mut sessions = self.sessions.write().await;
            sessions.touch(actor);
        }
        self.limiter.check(actor, operation)?;
        Ok(actor)
    }

    /// Processes one inbound packet and queues the response.
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect {
                character_id,
                client_version,
            } => {
                if client_version != PROTOCOL_VERSION {
                    self.send(
                        Packet::Disconnected {
                            reason: format!(
                                "protocol version {} unsupported",
                                client_version
                            ),
                        },
                        addr,
                    );
                    return;
                }
                if self.gateway.characters.load(character_id).await.is_err() {
                    self.send(
                        Packet::Disconnected {
                            reason: format!("unknown character {}", character_id),
                        },
                        addr,
                    );
                    return;
                }
                let accepted = {
                    let mut sessions = self.sessions.write().await;
                    sessions.connect(character_id, addr)
                };
                if accepted {
                    self.send(Packet::Connected { character_id }, addr);
                } else {
                    self.send(
                        Packet::Disconnected {
                            reason: "server full".to_string(),
                        },
                        addr,
                    );
                }
            }

            Packet::Disconnect => {
                let character_id = {
                    let sessions = self.sessions.read().await;
                    sessions.find_by_addr(addr)
                };
                if let Some(character_id) = character_id {
                    let mut sessions = self.sessions.write().await;
                    sessions.disconnect(character_id);
                }
            }

            Packet::SubmitCombatAction {
                combat_id,
                combatant_id,
                action,
                round,
            } => {
                let result = async {
                    let claimed = match combatant_id {
                        CombatantId::Character(id) => id,
                        CombatantId::Garrison(_) => {
                            return Err(GameError::invalid(
                                "garrisons do not submit actions",
                            ))
                        }
                    };
                    self.gate(addr, claimed, Operation::SubmitCombatAction)
                        .await?;
                    self.combat
                        .submit_action(combat_id, combatant_id, action, round)
                        .await
                }
                .await;
                self.send(Packet::CombatActionResult { result }, addr);
            }

            Packet::ExecuteTrade {
                character_id,
                port_id,
                commodity,
                direction,
                quantity,
            } => {
                let result = async {
                    let actor = self
                        .gate(addr, character_id, Operation::ExecuteTrade)
                        .await?;
                    self.authorize_ship(actor).await?;
                    self.trading
                        .execute_trade(actor, port_id, commodity, direction, quantity)
                        .await
                }
                .await;
                self.send(Packet::TradeResult { result }, addr);
            }

            Packet::SubmitMove {
                character_id,
                destination,
            } => {
                let result = async {
                    let actor = self
                        .gate(addr, character_id, Operation::SubmitMove)
                        .await?;
                    self.authorize_ship(actor).await?;
                    self.movement.submit_move(actor, destination).await
                }
                .await;
                self.send(Packet::MoveResult { result }, addr);
            }

            _ => {
                warn!("unexpected packet type from {}", addr);
            }
        }
    }

    /// Ownership gate: the actor must control their active ship.
    async fn authorize_ship(&self, actor: CharacterId) -> Result<(), GameError> {
        let character = self.gateway.characters.load(actor).await?;
        let ship = self.gateway.ships.load(character.value.ship_id).await?;
        self.authorizer.authorize(&character.value, &ship.value)
    }

    /// Routes one event envelope to the sessions its scope names.
    async fn deliver_event(&self, envelope: EventEnvelope) {
        let route = {
            let sessions = self.sessions.read().await;
            route_for(envelope.scope, &sessions)
        };
        let packet = Packet::Event {
            scope: envelope.scope,
            event: envelope.event,
        };
        match route {
            Route::To(addr) => self.send(packet, addr),
            Route::All => self.broadcast(packet),
            Route::Nowhere => {}
        }
    }

    /// Main loop: dispatches inbound packets and outbound events.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_receiver();
        self.spawn_sender();
        self.spawn_timeout_checker();
        self.spawn_sweeper();

        info!("server started");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        }
                        Some(ServerMessage::SessionTimeout { character_id }) => {
                            debug!("session of character {} timed out", character_id);
                        }
                        None => {
                            info!("server shutting down");
                            break;
                        }
                    }
                },
                envelope = self.events_rx.recv() => {
                    match envelope {
                        Some(envelope) => self.deliver_event(envelope).await,
                        None => {
                            info!("event bus closed, shutting down");
                            break;
                        }
                    }
                },
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9100".parse().unwrap()
    }

    #[test]
    fn test_character_events_route_to_their_session() {
        let mut sessions = SessionDirectory::new(4);
        sessions.connect(1, addr());

        assert_eq!(
            route_for(EventScope::Character(1), &sessions),
            Route::To(addr())
        );
        assert_eq!(route_for(EventScope::Character(2), &sessions), Route::Nowhere);
    }

    #[test]
    fn test_wide_scopes_broadcast() {
        let sessions = SessionDirectory::new(4);
        assert_eq!(route_for(EventScope::Sector(9), &sessions), Route::All);
        assert_eq!(route_for(EventScope::Corporation(2), &sessions), Route::All);
    }

    #[test]
    fn test_server_message_carries_packet() {
        let msg = ServerMessage::PacketReceived {
            packet: Packet::Disconnect,
            addr: addr(),
        };
        match msg {
            ServerMessage::PacketReceived { packet, addr: a } => {
                assert_eq!(packet, Packet::Disconnect);
                assert_eq!(a, addr());
            }
            _ => panic!("unexpected message type"),
        }
    }
}
