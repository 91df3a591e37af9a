//! WebSocket endpoints: the judge update feed and the interactive shell.
//!
//! Both run a writer and a reader side by side. The writer pings on a fixed
//! period and bounds every write; the reader drops the connection once the
//! peer has been silent past the read deadline.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::GatewayState;
use crate::config::KeepaliveConfig;
use crate::keepalive::{write_within, Heartbeat, ReadDeadline};
use crate::proto::judge as pb;
use crate::sandbox::TermSize;
use crate::shell::{ClientFrame, ServerFrame};

/// Largest frame accepted from an update observer.
const OBSERVER_READ_LIMIT: usize = 512;
const SHELL_INPUT_BUFFER: usize = 64;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

pub async fn judge(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> Response {
    ws.max_message_size(OBSERVER_READ_LIMIT)
        .on_upgrade(move |socket| observe(socket, state))
}

async fn observe(socket: WebSocket, state: GatewayState) {
    let mut observer = match state.hub.subscribe().await {
        Ok(observer) => observer,
        Err(e) => {
            tracing::error!(error = %e, "Cannot register update observer");
            return;
        }
    };
    let observer_id = observer.id();
    tracing::debug!(observer_id, "Update observer connected");

    let keepalive = state.config.keepalive;
    let (mut sink, stream) = socket.split();
    let cancel = CancellationToken::new();

    let writer = {
        let cancel = cancel.clone();
        async move {
            let _guard = cancel.clone().drop_guard();
            let mut heartbeat = Heartbeat::new(keepalive.ping_period);
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = heartbeat.tick() => Message::Ping(Default::default()),
                    payload = observer.recv() => match payload {
                        Some(message) => message,
                        None => {
                            tracing::info!(observer_id, "Update observer evicted");
                            let _ = close(&mut sink, &keepalive, close_code::POLICY, "too slow").await;
                            break;
                        }
                    },
                };
                if !send(&mut sink, &keepalive, message).await {
                    break;
                }
            }
        }
    };

    tokio::join!(writer, drain(stream, keepalive, cancel));
    tracing::debug!(observer_id, "Update observer disconnected");
}

/// Read and discard inbound frames until the peer leaves or goes silent.
async fn drain(mut stream: WsStream, keepalive: KeepaliveConfig, cancel: CancellationToken) {
    let _guard = cancel.clone().drop_guard();
    let mut deadline = ReadDeadline::new(keepalive.pong_wait);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = deadline.read(stream.next()) => next,
        };
        match next {
            Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => break,
            Ok(Some(Ok(_))) => deadline.reset(),
            Err(e) => {
                tracing::debug!(error = %e, "Dropping silent WebSocket peer");
                break;
            }
        }
    }
}

async fn send(sink: &mut WsSink, keepalive: &KeepaliveConfig, message: Message) -> bool {
    match write_within(keepalive.write_wait, sink.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "WebSocket write failed");
            false
        }
        Err(e) => {
            tracing::debug!(error = %e, "WebSocket write stalled");
            false
        }
    }
}

async fn close(sink: &mut WsSink, keepalive: &KeepaliveConfig, code: u16, reason: &str) -> bool {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    send(sink, keepalive, Message::Close(Some(frame))).await
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResizeMessage {
    rows: u32,
    cols: u32,
}

/// Text holding exactly `{"rows": r, "cols": c}` is a resize; any other text
/// or binary frame is keystrokes.
pub fn client_frame(message: Message) -> Option<ClientFrame> {
    match message {
        Message::Text(text) => match serde_json::from_str::<ResizeMessage>(text.as_str()) {
            Ok(size) => Some(ClientFrame::Resize(TermSize {
                rows: size.rows,
                cols: size.cols,
                x: 0,
                y: 0,
            })),
            Err(_) => Some(ClientFrame::Keys(text.as_str().as_bytes().to_vec())),
        },
        Message::Binary(bytes) => Some(ClientFrame::Keys(bytes.to_vec())),
        _ => None,
    }
}

pub async fn shell(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> Response {
    ws.on_upgrade(move |socket| relay_shell(socket, state))
}

async fn relay_shell(socket: WebSocket, state: GatewayState) {
    let keepalive = state.config.keepalive;
    let (mut sink, stream) = socket.split();
    let (input_tx, input_rx) = mpsc::channel::<pb::ShellInput>(SHELL_INPUT_BUFFER);

    let mut client = state.client.clone();
    let mut outbound = match client.shell(ReceiverStream::new(input_rx)).await {
        Ok(response) => response.into_inner(),
        Err(status) => {
            tracing::warn!(error = %status.message(), "Shell session refused by broker");
            let text = format!("shell error: {}", status.message());
            if send(&mut sink, &keepalive, Message::Text(text.into())).await {
                let _ = close(&mut sink, &keepalive, close_code::ERROR, "").await;
            }
            return;
        }
    };
    tracing::info!("Shell session opened");

    let cancel = CancellationToken::new();

    let writer = {
        let cancel = cancel.clone();
        async move {
            let _guard = cancel.clone().drop_guard();
            let mut heartbeat = Heartbeat::new(keepalive.ping_period);
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = heartbeat.tick() => {
                        if !send(&mut sink, &keepalive, Message::Ping(Default::default())).await {
                            break;
                        }
                        continue;
                    }
                    next = outbound.message() => next,
                };
                let Some(next) = server_frame(next) else {
                    continue;
                };
                match next {
                    Ok(Some(ServerFrame::Output(bytes))) => {
                        if !send(&mut sink, &keepalive, Message::Binary(bytes.into())).await {
                            break;
                        }
                    }
                    Ok(Some(ServerFrame::Exited { status, exit_status })) => {
                        tracing::info!(status = %status, exit_status, "Shell process exited");
                        let _ = close(&mut sink, &keepalive, close_code::NORMAL, &status).await;
                        break;
                    }
                    Ok(None) => {
                        let _ = close(&mut sink, &keepalive, close_code::NORMAL, "").await;
                        break;
                    }
                    Err(status) => {
                        let text = format!("shell error: {}", status.message());
                        if send(&mut sink, &keepalive, Message::Text(text.into())).await {
                            let _ = close(&mut sink, &keepalive, close_code::ERROR, "").await;
                        }
                        break;
                    }
                }
            }
        }
    };

    tokio::join!(writer, forward_keys(stream, input_tx, keepalive, cancel));
    tracing::info!("Shell session closed");
}

/// Decode one item of the broker's shell stream. `None` means there is
/// nothing to relay; `Ok(None)` is the end of the session.
fn server_frame(
    next: Result<Option<pb::ShellOutput>, tonic::Status>,
) -> Option<Result<Option<ServerFrame>, tonic::Status>> {
    match next {
        Ok(Some(output)) => ServerFrame::from_proto(output).map(|frame| Ok(Some(frame))),
        Ok(None) => Some(Ok(None)),
        Err(status) => Some(Err(status)),
    }
}

/// Forward terminal input to the broker. Dropping `input` ends the broker
/// side of the session.
async fn forward_keys(
    mut stream: WsStream,
    input: mpsc::Sender<pb::ShellInput>,
    keepalive: KeepaliveConfig,
    cancel: CancellationToken,
) {
    let _guard = cancel.clone().drop_guard();
    let mut deadline = ReadDeadline::new(keepalive.pong_wait);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = deadline.read(stream.next()) => next,
        };
        let message = match next {
            Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => break,
            Ok(Some(Ok(message))) => message,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping silent shell client");
                break;
            }
        };
        deadline.reset();
        if let Some(frame) = client_frame(message) {
            if input.send(frame.into()).await.is_err() {
                break;
            }
        }
    }
}
