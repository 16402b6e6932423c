//! Server role: lobby, connection tasks, and the match loop.
//!
//! Handshakes run concurrently, so a silent or slow peer never holds up the
//! lobby. Once every slot is taken, later joiners are turned away with
//! `MatchFull`.
//!
//! Each seated connection gets a reader task and a writer task. Readers push
//! into one queue that the match loop drains; the loop feeds the
//! [`LockstepBarrier`] and fans its events out to the writers.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use rts_core::command::GameTick;
use rts_core::components::PlayerId;
use rts_core::simulation::Checksum;

use crate::barrier::{BarrierEvent, LockstepBarrier};
use crate::config::ServerConfig;
use crate::error::{NetError, Result};
use crate::protocol::{AbortReason, NetworkMessage, PROTOCOL_VERSION};
use crate::transport::{read_message, write_message};

/// How a match ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The tick limit was reached and acknowledged.
    Completed {
        /// Ticks played.
        ticks: GameTick,
        /// Agreed checksum after the last tick.
        checksum: Option<Checksum>,
    },
    /// Peers disagreed about a tick.
    Desync {
        /// Divergent tick.
        tick: GameTick,
    },
    /// Every player left.
    Abandoned,
    /// The server was told to stop.
    Shutdown {
        /// Ticks sealed before stopping.
        tick: GameTick,
    },
}

/// Pause after a failed `accept`, e.g. while out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// How long to wait for clients to hang up after the last message.
const LINGER: Duration = Duration::from_secs(2);

type Handshakes = JoinSet<(SocketAddr, Result<Seat>)>;

enum Inbound {
    Message(PlayerId, NetworkMessage),
    Closed(PlayerId),
}

struct Seat {
    name: String,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

/// A lockstep match server for a fixed number of slots.
#[derive(Debug)]
pub struct LockstepServer {
    listener: TcpListener,
    config: ServerConfig,
}

impl LockstepServer {
    /// Bind the listen socket.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Config`] for an invalid config, or
    /// [`NetError::Io`] if the address cannot be bound.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate().map_err(|message| NetError::Config {
            path: "<server>".into(),
            message,
        })?;
        let listener = TcpListener::bind(&config.bind).await.map_err(|e| {
            tracing::error!(address = %config.bind, error = %e, "failed to bind");
            e
        })?;
        Ok(Self { listener, config })
    }

    /// The bound address.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Io`] if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Fill every slot, start the match, and run it to the end.
    ///
    /// # Errors
    ///
    /// Returns an error if the scenario cannot be built. Per-connection
    /// failures never end the match.
    pub async fn run(self) -> Result<MatchOutcome> {
        self.run_until(std::future::pending()).await
    }

    /// Like [`run`](Self::run), but stop once `shutdown` completes. Seated
    /// players are sent `Abort { reason: Shutdown }` first.
    ///
    /// # Errors
    ///
    /// Returns an error if the scenario cannot be built.
    pub async fn run_until<F>(self, shutdown: F) -> Result<MatchOutcome>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let initial = self.config.scenario.build()?;
        let state = initial.serialize()?;
        tracing::info!(
            address = %self.local_addr()?,
            slots = self.config.slots,
            tick_rate = self.config.tick_rate,
            checksum = format_args!("{:#010x}", initial.state_hash()),
            "waiting for players"
        );

        let mut handshakes = JoinSet::new();
        let Some(seats) = self.fill_slots(&mut handshakes, shutdown.as_mut()).await else {
            tracing::info!("shut down before the match started");
            return Ok(MatchOutcome::Shutdown { tick: 0 });
        };
        let Self { listener, config } = self;
        let doorman = tokio::spawn(
            turn_away(listener, handshakes, config.handshake_timeout())
                .instrument(tracing::info_span!("doorman")),
        );

        let (inbound_tx, mut inbound_rx) = mpsc::channel(1024);
        let mut writers = Vec::with_capacity(seats.len());
        let mut writer_tasks = Vec::with_capacity(seats.len());
        let mut reader_tasks = Vec::with_capacity(seats.len());

        for (slot, seat) in (0..).zip(seats) {
            let span = tracing::info_span!("conn", slot, name = %seat.name);
            let (tx, rx) = mpsc::unbounded_channel();
            reader_tasks.push(tokio::spawn(
                reader_task(slot, seat.reader, inbound_tx.clone()).instrument(span.clone()),
            ));
            writer_tasks.push(tokio::spawn(writer_task(seat.writer, rx).instrument(span)));
            writers.push(Some(tx));
        }
        drop(inbound_tx);

        broadcast(&writers, &NetworkMessage::Start { state });
        tracing::info!("match started");

        let mut barrier = LockstepBarrier::new(
            config.slots,
            config.disconnect,
            config.tick_interval(),
            config.max_ticks,
        );
        // Poll more often than ticks are sealed; the barrier enforces the rate.
        let poll_period = (config.tick_interval() / 4).max(Duration::from_millis(1));
        let mut pacing = tokio::time::interval(poll_period);
        pacing.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            let mut client_desync = None;
            tokio::select! {
                Some(inbound) = inbound_rx.recv() => {
                    let now = Instant::now();
                    let events = match inbound {
                        Inbound::Message(slot, message) => {
                            handle_message(&mut barrier, slot, message, now, &mut client_desync)
                        }
                        Inbound::Closed(slot) => barrier.disconnect(slot, now),
                    };
                    dispatch(&mut writers, events);
                }
                _ = pacing.tick() => {}
                () = &mut shutdown => {
                    broadcast(
                        &writers,
                        &NetworkMessage::Abort {
                            reason: AbortReason::Shutdown,
                        },
                    );
                    break MatchOutcome::Shutdown {
                        tick: barrier.next_tick(),
                    };
                }
            }

            let events = barrier.poll(Instant::now());
            dispatch(&mut writers, events);

            if let Some(tick) = barrier.halted().or(client_desync) {
                broadcast(
                    &writers,
                    &NetworkMessage::Abort {
                        reason: AbortReason::Desync { tick },
                    },
                );
                break MatchOutcome::Desync { tick };
            }
            if barrier.is_complete() {
                broadcast(&writers, &NetworkMessage::Goodbye);
                break MatchOutcome::Completed {
                    ticks: barrier.next_tick(),
                    checksum: barrier.confirmed().map(|(_, checksum)| checksum),
                };
            }
            if barrier.is_abandoned() {
                break MatchOutcome::Abandoned;
            }
        };

        tracing::info!(?outcome, "match over");
        doorman.abort();
        drop(writers);
        for task in writer_tasks {
            let _ = task.await;
        }
        // Closing a socket with unread input resets it, which can discard the
        // final message on the client side. Drain until every client hangs up.
        let _ = tokio::time::timeout(LINGER, async {
            while inbound_rx.recv().await.is_some() {}
        })
        .await;
        for task in reader_tasks {
            task.abort();
        }
        Ok(outcome)
    }

    /// Accept and handshake until every slot is taken. Returns `None` if
    /// `shutdown` completes first; seated players are told so.
    async fn fill_slots<F>(
        &self,
        handshakes: &mut Handshakes,
        mut shutdown: Pin<&mut F>,
    ) -> Option<Vec<Seat>>
    where
        F: Future<Output = ()>,
    {
        let wanted = usize::from(self.config.slots);
        let mut seats: Vec<Seat> = Vec::with_capacity(wanted);
        while seats.len() < wanted {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "connection accepted");
                        let timeout = self.config.handshake_timeout();
                        handshakes.spawn(async move { (peer, handshake(stream, timeout).await) });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = handshakes.join_next() => {
                    let Ok((peer, result)) = joined else {
                        continue;
                    };
                    let Ok(slot) = PlayerId::try_from(seats.len()) else {
                        break;
                    };
                    match result {
                        Ok(mut seat) => match self.welcome(&mut seat, slot).await {
                            Ok(()) => {
                                tracing::info!(%peer, slot, name = %seat.name, "player joined");
                                seats.push(seat);
                            }
                            Err(err) => tracing::warn!(%peer, error = %err, "welcome failed"),
                        },
                        Err(err) => tracing::warn!(%peer, error = %err, "handshake failed"),
                    }
                }
                () = &mut shutdown => {
                    let abort = NetworkMessage::Abort {
                        reason: AbortReason::Shutdown,
                    };
                    for seat in &mut seats {
                        let _ = write_message(&mut seat.writer, &abort).await;
                    }
                    return None;
                }
            }
        }
        Some(seats)
    }

    async fn welcome(&self, seat: &mut Seat, slot: PlayerId) -> Result<()> {
        write_message(
            &mut seat.writer,
            &NetworkMessage::Welcome {
                slot,
                slots: self.config.slots,
                input_delay: self.config.input_delay,
                tick_rate: self.config.tick_rate,
            },
        )
        .await
    }
}

/// Read the peer's `Hello`. Peers that break protocol are answered with an
/// `Abort` before the error is returned.
async fn handshake(stream: TcpStream, timeout: Duration) -> Result<Seat> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let hello = tokio::time::timeout(timeout, read_message(&mut reader))
        .await
        .map_err(|_| NetError::HandshakeTimeout)?;

    let name = match hello {
        Ok(NetworkMessage::Hello { name }) => name,
        Ok(other) => {
            let abort = NetworkMessage::Abort {
                reason: AbortReason::UnexpectedMessage,
            };
            let _ = write_message(&mut writer, &abort).await;
            return Err(NetError::Codec(format!(
                "expected Hello, got {:?}",
                other.kind()
            )));
        }
        Err(err @ NetError::ProtocolMismatch { .. }) => {
            let abort = NetworkMessage::Abort {
                reason: AbortReason::ProtocolMismatch {
                    expected: PROTOCOL_VERSION,
                },
            };
            let _ = write_message(&mut writer, &abort).await;
            return Err(err);
        }
        Err(err) => return Err(err),
    };
    Ok(Seat {
        name,
        reader,
        writer,
    })
}

/// Answer everyone who joins after the lobby closed, including handshakes
/// still in flight, with `MatchFull`.
async fn turn_away(listener: TcpListener, mut handshakes: Handshakes, timeout: Duration) {
    let full = NetworkMessage::Abort {
        reason: AbortReason::MatchFull,
    };
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    handshakes.spawn(async move { (peer, handshake(stream, timeout).await) });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(joined) = handshakes.join_next() => {
                if let Ok((peer, Ok(mut seat))) = joined {
                    tracing::info!(%peer, name = %seat.name, "match is full, turning player away");
                    let _ = write_message(&mut seat.writer, &full).await;
                }
            }
        }
    }
}

fn handle_message(
    barrier: &mut LockstepBarrier,
    slot: PlayerId,
    message: NetworkMessage,
    now: Instant,
    client_desync: &mut Option<GameTick>,
) -> Vec<BarrierEvent> {
    match message {
        NetworkMessage::Commands { commands } => {
            barrier.submit(slot, commands);
            Vec::new()
        }
        NetworkMessage::TickAck { tick, checksum } => {
            barrier.acknowledge(slot, tick, checksum).into_iter().collect()
        }
        NetworkMessage::Goodbye => barrier.disconnect(slot, now),
        NetworkMessage::Abort {
            reason: AbortReason::Desync { tick },
        } => {
            tracing::error!(slot, tick, "client reported desync");
            *client_desync = Some(tick);
            Vec::new()
        }
        NetworkMessage::Abort { reason } => {
            tracing::warn!(slot, %reason, "client aborted");
            barrier.disconnect(slot, now)
        }
        other => {
            tracing::warn!(slot, kind = ?other.kind(), "unexpected message ignored");
            Vec::new()
        }
    }
}

fn dispatch(writers: &mut [Option<mpsc::UnboundedSender<NetworkMessage>>], events: Vec<BarrierEvent>) {
    for event in events {
        match event {
            BarrierEvent::Advance {
                tick,
                commands,
                confirmed,
            } => broadcast(
                writers,
                &NetworkMessage::TickAdvance {
                    tick,
                    commands,
                    confirmed,
                },
            ),
            BarrierEvent::PeerLost {
                slot, from_tick, ..
            } => {
                if let Some(writer) = writers.get_mut(usize::from(slot)) {
                    *writer = None;
                }
                broadcast(writers, &NetworkMessage::PeerLost { slot, from_tick });
            }
            BarrierEvent::SlotExcluded { .. } | BarrierEvent::Desync { .. } => {}
        }
    }
}

fn broadcast(writers: &[Option<mpsc::UnboundedSender<NetworkMessage>>], message: &NetworkMessage) {
    for writer in writers.iter().flatten() {
        // A closed writer is reported by its reader.
        let _ = writer.send(message.clone());
    }
}

async fn reader_task(slot: PlayerId, mut reader: OwnedReadHalf, inbound: mpsc::Sender<Inbound>) {
    loop {
        match read_message(&mut reader).await {
            Ok(message) => {
                let done = matches!(message, NetworkMessage::Goodbye | NetworkMessage::Abort { .. });
                if inbound.send(Inbound::Message(slot, message)).await.is_err() || done {
                    return;
                }
            }
            Err(err) => {
                match err {
                    NetError::ConnectionClosed => tracing::info!("connection closed"),
                    other => tracing::warn!(error = %other, "read failed"),
                }
                let _ = inbound.send(Inbound::Closed(slot)).await;
                return;
            }
        }
    }
}

async fn writer_task(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<NetworkMessage>,
) {
    while let Some(message) = outbound.recv().await {
        if let Err(err) = write_message(&mut writer, &message).await {
            tracing::debug!(error = %err, "write failed, dropping connection");
            break;
        }
    }
}
