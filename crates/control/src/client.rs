//! Control plane client
//!
//! `WsControlClient` owns the WebSocket to the room server: a single
//! socket task serializes outgoing messages, correlates SIP
//! request/response pairs, forwards job assignments and room events, and
//! reconnects with exponential backoff (capped at 30s) without touching
//! running sessions. Registration is replayed on every reconnect.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use callagent_config::ControlConfig;

use crate::protocol::{
    ClientMessage, CreateSipParticipant, JobPayload, JobState, ServerMessage, SipCommand,
    SipResult,
};
use crate::ControlError;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
/// SIP requests block until the callee answers; allow a full ring cycle.
const SIP_REQUEST_TIMEOUT: Duration = Duration::from_secs(75);
const OUTGOING_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 32;

/// Events surfaced to the dispatcher
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// Control channel (re)established
    Connected,
    /// Control channel lost; reconnection is underway
    Disconnected { reason: String },
    /// A job was assigned to this worker
    JobAssigned(JobPayload),
    /// A participant left one of our rooms
    ParticipantLeft { room_name: String, identity: String },
}

/// Operations the worker performs against the room server
#[async_trait]
pub trait RoomControl: Send + Sync {
    /// Declare worker identity and capabilities
    async fn register_worker(
        &self,
        name: &str,
        capabilities: &[String],
    ) -> Result<String, ControlError>;

    /// Report a job lifecycle change
    async fn send_job_status(
        &self,
        job_id: &str,
        state: JobState,
        reason: Option<&str>,
    ) -> Result<(), ControlError>;

    /// Create an outbound SIP participant; blocks until answered or a
    /// terminal SIP status arrives
    async fn create_sip_participant(
        &self,
        request: CreateSipParticipant,
    ) -> Result<SipResult, ControlError>;

    /// Transfer a SIP participant to another number
    async fn transfer_sip_participant(
        &self,
        room_name: &str,
        identity: &str,
        transfer_to: &str,
    ) -> Result<SipResult, ControlError>;

    /// Delete a room (hangs up everyone in it)
    async fn delete_room(&self, room_name: &str) -> Result<(), ControlError>;
}

type RegisterWaiter = oneshot::Sender<Result<String, ControlError>>;

/// WebSocket control plane client
pub struct WsControlClient {
    outgoing: mpsc::Sender<ClientMessage>,
    pending_sip: Arc<Mutex<HashMap<String, oneshot::Sender<SipResult>>>>,
    pending_register: Arc<Mutex<Option<RegisterWaiter>>>,
    registration: Arc<Mutex<Option<(String, Vec<String>)>>>,
    auth_failure: Arc<Mutex<Option<ControlError>>>,
}

impl WsControlClient {
    /// Start the socket task and return the client plus its event stream
    pub fn connect(
        config: &ControlConfig,
        cancel: CancellationToken,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ControlEvent>), ControlError> {
        // Fail fast on an unusable URL.
        build_request(config)?;

        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

        let client = Arc::new(Self {
            outgoing: outgoing_tx,
            pending_sip: Arc::new(Mutex::new(HashMap::new())),
            pending_register: Arc::new(Mutex::new(None)),
            registration: Arc::new(Mutex::new(None)),
            auth_failure: Arc::new(Mutex::new(None)),
        });

        tokio::spawn(socket_task(
            config.clone(),
            cancel,
            outgoing_rx,
            events_tx,
            Arc::clone(&client.pending_sip),
            Arc::clone(&client.pending_register),
            Arc::clone(&client.registration),
            Arc::clone(&client.auth_failure),
        ));

        Ok((client, events_rx))
    }

    async fn send(&self, message: ClientMessage) -> Result<(), ControlError> {
        self.outgoing
            .send(message)
            .await
            .map_err(|_| ControlError::Closed)
    }

    async fn sip_request(&self, command: SipCommand) -> Result<SipResult, ControlError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_sip.lock().insert(request_id.clone(), tx);

        self.send(ClientMessage::SipRequest {
            request_id: request_id.clone(),
            command,
        })
        .await?;

        match timeout(SIP_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(ControlError::Closed),
            Err(_) => {
                self.pending_sip.lock().remove(&request_id);
                Err(ControlError::Timeout)
            }
        }
    }
}

#[async_trait]
impl RoomControl for WsControlClient {
    async fn register_worker(
        &self,
        name: &str,
        capabilities: &[String],
    ) -> Result<String, ControlError> {
        if let Some(auth) = self.auth_failure.lock().clone() {
            return Err(auth);
        }
        *self.registration.lock() = Some((name.to_string(), capabilities.to_vec()));

        let (tx, rx) = oneshot::channel();
        *self.pending_register.lock() = Some(tx);

        self.send(ClientMessage::Register {
            worker_name: name.to_string(),
            capabilities: capabilities.to_vec(),
        })
        .await?;

        match timeout(REGISTER_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ControlError::Closed),
            Err(_) => {
                // The handshake may have failed with an auth error while
                // we were waiting.
                if let Some(auth) = self.auth_failure.lock().clone() {
                    return Err(auth);
                }
                Err(ControlError::Timeout)
            }
        }
    }

    async fn send_job_status(
        &self,
        job_id: &str,
        state: JobState,
        reason: Option<&str>,
    ) -> Result<(), ControlError> {
        self.send(ClientMessage::JobStatus {
            job_id: job_id.to_string(),
            state,
            reason: reason.map(str::to_string),
            completed_at: chrono::Utc::now(),
        })
        .await
    }

    async fn create_sip_participant(
        &self,
        request: CreateSipParticipant,
    ) -> Result<SipResult, ControlError> {
        self.sip_request(SipCommand::CreateParticipant {
            room_name: request.room_name,
            trunk_id: request.trunk_id,
            callee: request.callee,
            identity: request.identity,
            wait_until_answered: request.wait_until_answered,
        })
        .await
    }

    async fn transfer_sip_participant(
        &self,
        room_name: &str,
        identity: &str,
        transfer_to: &str,
    ) -> Result<SipResult, ControlError> {
        self.sip_request(SipCommand::TransferParticipant {
            room_name: room_name.to_string(),
            identity: identity.to_string(),
            transfer_to: transfer_to.to_string(),
        })
        .await
    }

    async fn delete_room(&self, room_name: &str) -> Result<(), ControlError> {
        let result = self
            .sip_request(SipCommand::DeleteRoom {
                room_name: room_name.to_string(),
            })
            .await?;
        match result {
            SipResult::Ok { .. } => Ok(()),
            SipResult::Failed { sip_status, reason } => Err(ControlError::Protocol(format!(
                "delete_room failed with {}: {}",
                sip_status, reason
            ))),
        }
    }
}

fn build_request(config: &ControlConfig) -> Result<Request<()>, ControlError> {
    let mut request = config
        .url
        .clone()
        .into_client_request()
        .map_err(|e| ControlError::Connection(e.to_string()))?;

    let headers = request.headers_mut();
    headers.insert(
        "x-api-key",
        config
            .api_key
            .parse()
            .map_err(|_| ControlError::Connection("invalid api key header".to_string()))?,
    );
    headers.insert(
        "x-api-secret",
        config
            .api_secret
            .parse()
            .map_err(|_| ControlError::Connection("invalid api secret header".to_string()))?,
    );
    Ok(request)
}

fn is_auth_error(err: &tokio_tungstenite::tungstenite::Error) -> bool {
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            let status = response.status();
            status.as_u16() == 401 || status.as_u16() == 403
        }
        _ => false,
    }
}

#[allow(clippy::too_many_arguments)]
async fn socket_task(
    config: ControlConfig,
    cancel: CancellationToken,
    mut outgoing: mpsc::Receiver<ClientMessage>,
    events: mpsc::Sender<ControlEvent>,
    pending_sip: Arc<Mutex<HashMap<String, oneshot::Sender<SipResult>>>>,
    pending_register: Arc<Mutex<Option<RegisterWaiter>>>,
    registration: Arc<Mutex<Option<(String, Vec<String>)>>>,
    auth_failure: Arc<Mutex<Option<ControlError>>>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let request = match build_request(&config) {
            Ok(request) => request,
            Err(err) => {
                tracing::error!(error = %err, "control plane request cannot be built");
                break;
            }
        };

        match connect_async(request).await {
            Ok((socket, _response)) => {
                tracing::info!(url = %config.url, "control plane connected");
                backoff = INITIAL_BACKOFF;
                let _ = events.send(ControlEvent::Connected).await;

                let reason = run_socket(
                    socket,
                    &cancel,
                    &mut outgoing,
                    &events,
                    &pending_sip,
                    &pending_register,
                    &registration,
                )
                .await;

                // Outstanding SIP requests cannot complete on a dead
                // socket; dropping the waiters surfaces `Closed`.
                pending_sip.lock().clear();

                tracing::warn!(reason = %reason, "control plane disconnected");
                let _ = events
                    .send(ControlEvent::Disconnected { reason })
                    .await;
            }
            Err(err) => {
                if is_auth_error(&err) {
                    let auth = ControlError::Auth(err.to_string());
                    *auth_failure.lock() = Some(auth.clone());
                    if let Some(waiter) = pending_register.lock().take() {
                        let _ = waiter.send(Err(auth));
                    }
                    let _ = events
                        .send(ControlEvent::Disconnected {
                            reason: "authentication rejected".to_string(),
                        })
                        .await;
                    tracing::error!(error = %err, "control plane rejected credentials");
                    break;
                }
                tracing::warn!(error = %err, backoff_ms = backoff.as_millis() as u64,
                    "control plane connect failed, backing off");
                let _ = events
                    .send(ControlEvent::Disconnected {
                        reason: err.to_string(),
                    })
                    .await;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Drive one live socket until it drops; returns the disconnect reason
async fn run_socket(
    socket: Socket,
    cancel: &CancellationToken,
    outgoing: &mut mpsc::Receiver<ClientMessage>,
    events: &mpsc::Sender<ControlEvent>,
    pending_sip: &Arc<Mutex<HashMap<String, oneshot::Sender<SipResult>>>>,
    pending_register: &Arc<Mutex<Option<RegisterWaiter>>>,
    registration: &Arc<Mutex<Option<(String, Vec<String>)>>>,
) -> String {
    let (mut sink, mut stream) = socket.split();

    // Replay registration on every (re)connect.
    let replay_registration = registration.lock().clone();
    if let Some((worker_name, capabilities)) = replay_registration {
        let message = ClientMessage::Register {
            worker_name,
            capabilities,
        };
        if let Ok(encoded) = serde_json::to_string(&message) {
            if sink.send(Message::Text(encoded)).await.is_err() {
                return "send failed during registration replay".to_string();
            }
        }
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return "worker shutdown".to_string();
            }
            message = outgoing.recv() => {
                let Some(message) = message else {
                    return "client dropped".to_string();
                };
                let encoded = match serde_json::to_string(&message) {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to encode control message");
                        continue;
                    }
                };
                if sink.send(Message::Text(encoded)).await.is_err() {
                    return "send failed".to_string();
                }
            }
            incoming = stream.next() => {
                let Some(Ok(frame)) = incoming else {
                    return "socket closed".to_string();
                };
                let text = match frame {
                    Message::Text(text) => text,
                    Message::Ping(payload) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                        continue;
                    }
                    Message::Close(_) => return "server closed".to_string(),
                    _ => continue,
                };

                let message: ServerMessage = match serde_json::from_str(&text) {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::warn!(error = %err, "unparseable control message");
                        continue;
                    }
                };

                match message {
                    ServerMessage::Registered { worker_id } => {
                        tracing::info!(worker_id = %worker_id, "worker registered");
                        if let Some(waiter) = pending_register.lock().take() {
                            let _ = waiter.send(Ok(worker_id));
                        }
                    }
                    ServerMessage::JobAssignment { job } => {
                        if events.send(ControlEvent::JobAssigned(job)).await.is_err() {
                            return "event consumer dropped".to_string();
                        }
                    }
                    ServerMessage::SipResponse { request_id, result } => {
                        if let Some(waiter) = pending_sip.lock().remove(&request_id) {
                            let _ = waiter.send(result);
                        } else {
                            tracing::warn!(request_id = %request_id, "unmatched sip response");
                        }
                    }
                    ServerMessage::ParticipantLeft { room_name, identity } => {
                        let event = ControlEvent::ParticipantLeft { room_name, identity };
                        if events.send(event).await.is_err() {
                            return "event consumer dropped".to_string();
                        }
                    }
                    ServerMessage::Ping => {
                        if let Ok(encoded) = serde_json::to_string(&ClientMessage::Pong) {
                            let _ = sink.send(Message::Text(encoded)).await;
                        }
                    }
                }
            }
        }
    }
}
