//! The engine task: one loop that owns the [`SessionLifecycle`] and feeds it
//! signaling messages, peer callbacks and user commands one at a time.

pub mod util_api;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{NegotiationError, Result};
use crate::media::MediaSource;
use crate::peer::backend::{PeerEvent, PeerEventReceiver, PeerFactory};
use crate::session::{ChatEvent, SessionLifecycle, SessionStatus};
use crate::signaling::{decode_inbound, InboundSignal, SignalingChannel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    RequestOffer,
    AcceptPairing,
    Skip,
    Stop,
    SendChat(String),
    Shutdown,
}

#[derive(Debug)]
enum Input {
    Signal(InboundSignal),
    Peer(PeerEvent),
    Command(EngineCommand),
}

/// Cheap, cloneable front door to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    signals: mpsc::UnboundedSender<InboundSignal>,
    commands: mpsc::UnboundedSender<EngineCommand>,
    status: watch::Receiver<SessionStatus>,
    chat: broadcast::Sender<ChatEvent>,
}

fn stopped<T>(_: mpsc::error::SendError<T>) -> NegotiationError {
    NegotiationError::Signaling("engine is not running".into())
}

impl EngineHandle {
    /// Hands a message from the signaling relay to the engine.
    pub fn deliver(&self, signal: InboundSignal) -> Result<()> {
        self.signals.send(signal).map_err(stopped)
    }

    /// Same as [`Self::deliver`] for a raw JSON frame.
    pub fn deliver_raw(&self, raw: &str) -> Result<()> {
        self.deliver(decode_inbound(raw)?)
    }

    fn command(&self, command: EngineCommand) -> Result<()> {
        self.commands.send(command).map_err(stopped)
    }

    pub fn request_offer(&self) -> Result<()> {
        self.command(EngineCommand::RequestOffer)
    }

    pub fn accept_pairing(&self) -> Result<()> {
        self.command(EngineCommand::AcceptPairing)
    }

    pub fn skip(&self) -> Result<()> {
        self.command(EngineCommand::Skip)
    }

    pub fn stop(&self) -> Result<()> {
        self.command(EngineCommand::Stop)
    }

    pub fn send_chat(&self, message: impl Into<String>) -> Result<()> {
        self.command(EngineCommand::SendChat(message.into()))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.command(EngineCommand::Shutdown)
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Partner chat lines and relay notifications from now on.
    pub fn subscribe_chat(&self) -> broadcast::Receiver<ChatEvent> {
        self.chat.subscribe()
    }
}

/// Starts the engine on the current runtime.
pub fn spawn_engine(
    config: EngineConfig,
    factory: Arc<dyn PeerFactory>,
    media_source: Arc<dyn MediaSource>,
    signaling: Arc<dyn SignalingChannel>,
) -> (EngineHandle, JoinHandle<()>) {
    let (lifecycle, peer_events) = SessionLifecycle::new(config, factory, media_source, signaling);
    let status = lifecycle.subscribe();
    let chat = lifecycle.chat_sender();
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(run(lifecycle, peer_events, signal_rx, command_rx));
    let handle = EngineHandle {
        signals: signal_tx,
        commands: command_tx,
        status,
        chat,
    };
    (handle, task)
}

async fn dispatch(lifecycle: &mut SessionLifecycle, input: Input) -> Result<()> {
    match input {
        Input::Signal(signal) => lifecycle.handle_signal(signal).await,
        Input::Peer(event) => lifecycle.handle_peer_event(event).await,
        Input::Command(EngineCommand::RequestOffer) => lifecycle.request_offer().await.map(drop),
        Input::Command(EngineCommand::AcceptPairing) => lifecycle.accept_pairing().await,
        Input::Command(EngineCommand::Skip) => lifecycle.skip().await,
        Input::Command(EngineCommand::Stop) => lifecycle.stop().await,
        Input::Command(EngineCommand::SendChat(message)) => lifecycle.send_chat(&message).await,
        Input::Command(EngineCommand::Shutdown) => Ok(()),
    }
}

async fn run(
    mut lifecycle: SessionLifecycle,
    mut peer_events: PeerEventReceiver,
    mut signals: mpsc::UnboundedReceiver<InboundSignal>,
    mut commands: mpsc::UnboundedReceiver<EngineCommand>,
) {
    let route = lifecycle.route();
    // Signals that arrived while a handler was running, in arrival order.
    let mut deferred: VecDeque<InboundSignal> = VecDeque::new();
    info!("engine started");

    loop {
        let input = match deferred.pop_front() {
            Some(signal) => Input::Signal(signal),
            None => tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(EngineCommand::Shutdown) | None => break,
                    Some(command) => Input::Command(command),
                },
                Some(signal) = signals.recv() => Input::Signal(signal),
                Some(event) = peer_events.recv() => Input::Peer(event),
            },
        };

        let result = {
            let mut handler = std::pin::pin!(dispatch(&mut lifecycle, input));
            loop {
                tokio::select! {
                    biased;
                    result = &mut handler => break result,
                    Some(signal) = signals.recv() => {
                        // Candidates overtake the busy handler only if no
                        // earlier signal is still waiting.
                        let signal = match signal {
                            InboundSignal::Candidate { peer_identity, candidate }
                                if deferred.is_empty() =>
                            {
                                match route.buffer(&peer_identity, candidate) {
                                    Ok(()) => None,
                                    Err(candidate) => Some(InboundSignal::Candidate {
                                        peer_identity,
                                        candidate,
                                    }),
                                }
                            }
                            other => Some(other),
                        };
                        if let Some(signal) = signal {
                            deferred.push_back(signal);
                        }
                    }
                }
            }
        };

        match result {
            Ok(()) => {}
            Err(err) if err.is_recoverable() => debug!(error = %err, "operation discarded"),
            Err(err) => warn!(error = %err, "engine operation failed"),
        }
        let applied = route.flush().await;
        if applied > 0 {
            debug!(applied, "applied candidates buffered during the last operation");
        }
    }

    lifecycle.reset().await;
    info!("engine stopped");
}
