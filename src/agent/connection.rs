//! Websocket connections to the game servers.
//!
//! The manager holds one logical slot per configured endpoint. Sockets are
//! opened lazily on first use and reopened after a failure; maps are pinned
//! to a slot by a stable hash so the same map always talks to the same
//! endpoint within a run.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::agent::protocol::{ClientMessage, GameMap, GraphObs, ServerMessage};
use crate::{AgentError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One `step` exchange: the next state graph, the reward for this action and
/// whether the server ended the episode.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub observation: GraphObs,
    pub reward: f64,
    pub done: bool,
}

#[derive(Debug)]
struct Slot {
    url: String,
    stream: Option<WsStream>,
}

/// Owns the live game-server connections for the duration of a run.
#[derive(Debug)]
pub struct ConnectionManager {
    slots: Vec<Slot>,
    step_timeout: Duration,
}

impl ConnectionManager {
    /// Build a manager with one slot per endpoint. Sockets are not opened yet.
    pub fn new(endpoints: Vec<String>, step_timeout: Duration) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(AgentError::Configuration(
                "at least one game-server endpoint is required".to_string(),
            ));
        }
        let slots = endpoints
            .into_iter()
            .map(|url| Slot { url, stream: None })
            .collect();
        Ok(Self {
            slots,
            step_timeout,
        })
    }

    /// Ask the servers which maps are available for evaluation.
    ///
    /// Endpoints are tried in configuration order; the first reachable one
    /// answers. A reachable endpoint replying with malformed or unexpected
    /// data is a protocol error, not something to paper over by moving on.
    pub async fn get_validation_maps(&mut self) -> Result<Vec<GameMap>> {
        for idx in 0..self.slots.len() {
            match self.request(idx, &ClientMessage::GetAllMaps).await {
                Ok(ServerMessage::Maps { maps }) => {
                    log::info!(
                        "discovered {} validation maps via {}",
                        maps.len(),
                        self.slots[idx].url
                    );
                    return Ok(maps);
                }
                Ok(ServerMessage::ServerError { message }) => {
                    return Err(AgentError::Protocol(format!(
                        "{} rejected map discovery: {message}",
                        self.slots[idx].url
                    )));
                }
                Ok(_) => {
                    return Err(AgentError::Protocol(format!(
                        "{} sent an unexpected reply to get_all_maps",
                        self.slots[idx].url
                    )));
                }
                Err(AgentError::Connection(e)) => {
                    log::warn!("endpoint {} unreachable: {e}", self.slots[idx].url);
                }
                Err(other) => return Err(other),
            }
        }
        Err(AgentError::Connection(
            "no game-server endpoint is reachable".to_string(),
        ))
    }

    /// Begin an episode on `map_id`, returning the initial state graph.
    pub async fn start_episode(&mut self, map_id: &str) -> Result<GraphObs> {
        let idx = self.slot_for(map_id);
        let reply = self
            .request(
                idx,
                &ClientMessage::Start {
                    map_id: map_id.to_string(),
                },
            )
            .await?;
        match reply {
            ServerMessage::GameState { observation } => Ok(observation),
            ServerMessage::ServerError { message } => Err(AgentError::Protocol(format!(
                "start on map {map_id} failed: {message}"
            ))),
            _ => Err(AgentError::Protocol(format!(
                "unexpected reply to start on map {map_id}"
            ))),
        }
    }

    /// Expand state `state_id` on `map_id` and collect the server's verdict.
    pub async fn step(&mut self, map_id: &str, state_id: i64) -> Result<StepOutcome> {
        let idx = self.slot_for(map_id);
        let reply = self
            .request(
                idx,
                &ClientMessage::Step {
                    map_id: map_id.to_string(),
                    state_id,
                },
            )
            .await?;
        match reply {
            ServerMessage::StepResult {
                observation,
                reward,
                done,
            } => Ok(StepOutcome {
                observation,
                reward,
                done,
            }),
            ServerMessage::ServerError { message } => Err(AgentError::Protocol(format!(
                "step on map {map_id} failed: {message}"
            ))),
            _ => Err(AgentError::Protocol(format!(
                "unexpected reply to step on map {map_id}"
            ))),
        }
    }

    /// Close every open socket. Safe to call more than once; individual close
    /// failures are logged and swallowed so no socket is left behind.
    pub async fn close(&mut self) {
        for slot in &mut self.slots {
            if let Some(mut ws) = slot.stream.take() {
                if let Err(e) = ws.close(None).await {
                    log::warn!("error closing connection to {}: {e}", slot.url);
                }
            }
        }
    }

    fn slot_for(&self, map_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        map_id.hash(&mut hasher);
        (hasher.finish() as usize) % self.slots.len()
    }

    async fn ensure_connected(&mut self, idx: usize) -> Result<()> {
        if self.slots[idx].stream.is_some() {
            return Ok(());
        }
        let url = self.slots[idx].url.clone();
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| AgentError::Connection(format!("connect to {url} failed: {e}")))?;
        log::debug!("connected to game server at {url}");
        self.slots[idx].stream = Some(stream);
        Ok(())
    }

    /// One request/reply exchange on slot `idx`, bounded by the step timeout.
    /// The socket is dropped on any failure so the next exchange reconnects.
    async fn request(&mut self, idx: usize, msg: &ClientMessage) -> Result<ServerMessage> {
        self.ensure_connected(idx).await?;
        let payload = msg.to_json()?;
        let timeout = self.step_timeout;
        let url = self.slots[idx].url.clone();
        let stream = self.slots[idx]
            .stream
            .as_mut()
            .ok_or_else(|| AgentError::Connection(format!("no live connection to {url}")))?;

        let exchange = async {
            stream
                .send(Message::text(payload))
                .await
                .map_err(|e| AgentError::Connection(format!("send to {url} failed: {e}")))?;
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(raw))) => {
                        return ServerMessage::from_json(raw.as_str())
                    }
                    Some(Ok(Message::Close(_))) => {
                        return Err(AgentError::Connection(format!(
                            "{url} closed the connection"
                        )))
                    }
                    // control frames between replies are fine
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Err(AgentError::Connection(format!("read from {url}: {e}")))
                    }
                    None => {
                        return Err(AgentError::Connection(format!("{url} dropped the socket")))
                    }
                }
            }
        };

        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(res) => res,
            Err(_) => Err(AgentError::Connection(format!(
                "no reply from {url} within {timeout:?}"
            ))),
        };
        if result.is_err() {
            self.slots[idx].stream = None;
        }
        result
    }
}
