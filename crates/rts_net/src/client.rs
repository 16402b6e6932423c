//! Client role: a lockstep state machine and its TCP connection.
//!
//! [`LockstepClient`] holds the local simulation and never advances past
//! the last tick the server sealed. [`ClientConnection`] moves messages
//! between it and the server.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use rts_core::command::{Action, Command, GameTick};
use rts_core::components::{PlayerId, UnitId};
use rts_core::error::GameError;
use rts_core::simulation::{Simulation, TickReport};

use crate::error::{NetError, Result};
use crate::protocol::{AbortReason, NetworkMessage};
use crate::transport::{read_message, write_message};

/// Something the local player should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A sealed tick was applied locally.
    Advanced(TickReport),
    /// Another player dropped out.
    PeerLost {
        /// Lost slot.
        slot: PlayerId,
        /// First tick without their commands.
        from_tick: GameTick,
    },
    /// The server aborted the match.
    Aborted(AbortReason),
    /// The server ended the match normally.
    MatchEnded,
}

/// Lockstep state for one player.
#[derive(Debug)]
pub struct LockstepClient {
    slot: PlayerId,
    input_delay: u64,
    sim: Simulation,
    sealed: BTreeMap<GameTick, Vec<Command>>,
    outbox: Vec<Command>,
    seq: u32,
    ended: bool,
}

impl LockstepClient {
    /// Client for `slot` starting from `sim`.
    #[must_use]
    pub fn new(slot: PlayerId, input_delay: u64, sim: Simulation) -> Self {
        Self {
            slot,
            input_delay,
            sim,
            sealed: BTreeMap::new(),
            outbox: Vec::new(),
            seq: 0,
            ended: false,
        }
    }

    /// This client's slot.
    #[must_use]
    pub const fn slot(&self) -> PlayerId {
        self.slot
    }

    /// The local simulation.
    #[must_use]
    pub const fn simulation(&self) -> &Simulation {
        &self.sim
    }

    /// True once the server ended or aborted the match.
    #[must_use]
    pub const fn is_ended(&self) -> bool {
        self.ended
    }

    /// Sealed ticks received but not yet applied.
    #[must_use]
    pub fn ready_ticks(&self) -> usize {
        self.sealed.len()
    }

    /// Queue a local order. It executes `input_delay` ticks from now.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Simulation`] with [`GameError::EntityNotFound`]
    /// if `unit` does not exist locally. Nothing is queued.
    pub fn issue(&mut self, unit: UnitId, action: Action) -> Result<Command> {
        self.sim.unit(unit)?;
        let command = Command::new(
            self.sim.tick() + self.input_delay,
            self.slot,
            unit,
            self.seq,
            action,
        );
        self.seq = self.seq.wrapping_add(1);
        self.outbox.push(command.clone());
        Ok(command)
    }

    /// Drain queued orders into a message for the server.
    pub fn take_outbox(&mut self) -> Option<NetworkMessage> {
        if self.outbox.is_empty() {
            return None;
        }
        Some(NetworkMessage::Commands {
            commands: std::mem::take(&mut self.outbox),
        })
    }

    /// Handle a message from the server.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Simulation`] with [`GameError::DesyncDetected`]
    /// if the server's confirmed checksum differs from ours, or
    /// [`NetError::Codec`] for a message that has no place mid-match.
    pub fn receive(&mut self, message: NetworkMessage) -> Result<Vec<ClientEvent>> {
        match message {
            NetworkMessage::TickAdvance {
                tick,
                commands,
                confirmed,
            } => {
                if tick < self.sim.tick() || self.sealed.contains_key(&tick) {
                    tracing::warn!(slot = self.slot, tick, "duplicate tick advance ignored");
                } else {
                    self.sealed.insert(tick, commands);
                }
                if let Some((confirmed_tick, checksum)) = confirmed {
                    match self.sim.verify_remote_checksum(confirmed_tick, checksum) {
                        Ok(()) | Err(GameError::ChecksumUnavailable(_)) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(Vec::new())
            }
            NetworkMessage::PeerLost { slot, from_tick } => {
                tracing::info!(slot, from_tick, "peer lost");
                Ok(vec![ClientEvent::PeerLost { slot, from_tick }])
            }
            NetworkMessage::Abort { reason } => {
                tracing::warn!(slot = self.slot, %reason, "match aborted by server");
                self.ended = true;
                Ok(vec![ClientEvent::Aborted(reason)])
            }
            NetworkMessage::Goodbye => {
                self.ended = true;
                Ok(vec![ClientEvent::MatchEnded])
            }
            other => Err(NetError::Codec(format!(
                "unexpected {:?} message during match",
                other.kind()
            ))),
        }
    }

    /// Apply the next tick if the server has sealed it. Returns the report
    /// and the acknowledgement to send back.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Simulation`] if the simulation is halted or
    /// rejects the tick.
    pub fn step(&mut self) -> Result<Option<(TickReport, NetworkMessage)>> {
        let Some(commands) = self.sealed.remove(&self.sim.tick()) else {
            return Ok(None);
        };
        let report = self.sim.advance_tick(&commands)?;
        let ack = NetworkMessage::TickAck {
            tick: report.tick,
            checksum: report.checksum,
        };
        Ok(Some((report, ack)))
    }
}

/// What the server told us when we joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    /// Our slot.
    pub slot: PlayerId,
    /// Number of slots in the match.
    pub slots: u8,
    /// Input delay in ticks.
    pub input_delay: u64,
    /// Server tick rate.
    pub tick_rate: u32,
}

/// A client's TCP connection to the server.
#[derive(Debug)]
pub struct ClientConnection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl ClientConnection {
    /// Connect, join, and wait for the match to start.
    ///
    /// Returns the connection, the session parameters, and the initial
    /// simulation every peer starts from.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Rejected`] if the server refuses the join,
    /// [`NetError::HandshakeTimeout`] if it does not answer within
    /// `timeout`, or any transport error.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        name: &str,
        timeout: Duration,
    ) -> Result<(Self, SessionInfo, Simulation)> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let mut conn = Self { reader, writer };

        conn.send(&NetworkMessage::Hello {
            name: name.to_string(),
        })
        .await?;

        let info = match tokio::time::timeout(timeout, conn.recv()).await {
            Err(_) => return Err(NetError::HandshakeTimeout),
            Ok(message) => match message? {
                NetworkMessage::Welcome {
                    slot,
                    slots,
                    input_delay,
                    tick_rate,
                } => SessionInfo {
                    slot,
                    slots,
                    input_delay,
                    tick_rate,
                },
                NetworkMessage::Abort { reason } => return Err(NetError::Rejected(reason.to_string())),
                other => {
                    return Err(NetError::Codec(format!(
                        "expected Welcome, got {:?}",
                        other.kind()
                    )))
                }
            },
        };
        tracing::info!(slot = info.slot, slots = info.slots, "joined match");

        let sim = match conn.recv().await? {
            NetworkMessage::Start { state } => Simulation::deserialize(&state)?,
            NetworkMessage::Abort { reason } => return Err(NetError::Rejected(reason.to_string())),
            other => {
                return Err(NetError::Codec(format!(
                    "expected Start, got {:?}",
                    other.kind()
                )))
            }
        };
        Ok((conn, info, sim))
    }

    /// Send one message.
    ///
    /// # Errors
    ///
    /// Returns encoding or transport errors.
    pub async fn send(&mut self, message: &NetworkMessage) -> Result<()> {
        write_message(&mut self.writer, message).await
    }

    /// Receive one message.
    ///
    /// # Errors
    ///
    /// Returns framing or transport errors.
    pub async fn recv(&mut self) -> Result<NetworkMessage> {
        read_message(&mut self.reader).await
    }

    /// Run the match loop until the server ends it or the local simulation
    /// reaches `until`.
    ///
    /// After each applied tick `input` is asked for new orders; they are
    /// tagged with the input delay and sent right away.
    ///
    /// # Errors
    ///
    /// On a detected desync an `Abort` is sent before the error is returned.
    /// Transport errors are returned as they are.
    pub async fn play<F>(
        &mut self,
        client: &mut LockstepClient,
        until: Option<GameTick>,
        mut input: F,
    ) -> Result<Vec<ClientEvent>>
    where
        F: FnMut(&LockstepClient) -> Vec<(UnitId, Action)>,
    {
        let mut events = Vec::new();
        let reached = |client: &LockstepClient| until.is_some_and(|t| client.simulation().tick() >= t);

        while !client.is_ended() && !reached(client) {
            let message = self.recv().await?;
            match client.receive(message) {
                Ok(received) => events.extend(received),
                Err(err) => {
                    if let NetError::Simulation(GameError::DesyncDetected { tick, .. }) = &err {
                        let abort = NetworkMessage::Abort {
                            reason: AbortReason::Desync { tick: *tick },
                        };
                        let _ = self.send(&abort).await;
                    }
                    return Err(err);
                }
            }

            while !client.is_ended() && !reached(client) {
                let Some((report, ack)) = client.step()? else {
                    break;
                };
                self.send(&ack).await?;
                events.push(ClientEvent::Advanced(report));
                for (unit, action) in input(client) {
                    if let Err(err) = client.issue(unit, action) {
                        tracing::warn!(unit, error = %err, "order dropped");
                    }
                }
                if let Some(commands) = client.take_outbox() {
                    self.send(&commands).await?;
                }
            }
        }
        Ok(events)
    }
}
