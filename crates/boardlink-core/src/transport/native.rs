//! WebSocket connection for native platforms.
//!
//! The socket lives on a background thread. It reports through a channel that
//! [`Connection::poll_events`] drains, and it keeps reconnecting with a fixed
//! delay until [`Connection::close`] is called or the handle is dropped.

use std::net::TcpStream;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError, channel};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tungstenite::client::IntoClientRequest;
use tungstenite::handshake::client::Request;
use tungstenite::http::HeaderValue;
use tungstenite::http::header::AUTHORIZATION;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use super::{Connection, Endpoint, LinkEvent, TransportError, bearer, validate_endpoint};

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

/// Commands sent to the WebSocket thread.
enum WsCommand {
    Send(String),
    Close,
}

/// How a connected session or a backoff wait ended.
enum Exit {
    Retry,
    Stop,
}

/// WebSocket client for native platforms.
///
/// Uses a background thread for non-blocking operation.
#[derive(Default)]
pub struct NativeWebSocket {
    /// Channel to send commands to the WebSocket thread.
    cmd_tx: Option<Sender<WsCommand>>,
    /// Channel to receive events from the WebSocket thread.
    event_rx: Option<Receiver<LinkEvent>>,
    /// Handle to the WebSocket thread.
    _thread: Option<JoinHandle<()>>,
}

impl NativeWebSocket {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connection for NativeWebSocket {
    fn open(&mut self, endpoint: &Endpoint) -> Result<(), TransportError> {
        if self.cmd_tx.is_some() {
            return Err(TransportError::AlreadyConnected);
        }
        validate_endpoint(endpoint)?;

        let (cmd_tx, cmd_rx) = channel::<WsCommand>();
        let (event_tx, event_rx) = channel::<LinkEvent>();
        let endpoint = endpoint.clone();
        let handle = thread::spawn(move || run(endpoint, cmd_rx, event_tx));

        self.cmd_tx = Some(cmd_tx);
        self.event_rx = Some(event_rx);
        self._thread = Some(handle);
        Ok(())
    }

    fn send(&self, text: String) -> Result<(), TransportError> {
        match &self.cmd_tx {
            Some(tx) => tx
                .send(WsCommand::Send(text))
                .map_err(|e| TransportError::Send(e.to_string())),
            None => Err(TransportError::NotConnected),
        }
    }

    fn poll_events(&mut self) -> Vec<LinkEvent> {
        match &self.event_rx {
            Some(rx) => rx.try_iter().collect(),
            None => Vec::new(),
        }
    }

    fn close(&mut self) {
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(WsCommand::Close);
        }
        self.event_rx = None;
        self._thread = None;
    }
}

impl Drop for NativeWebSocket {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_request(endpoint: &Endpoint) -> Result<Request, String> {
    let mut request = endpoint
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| format!("Invalid request: {}", e))?;
    if let Some(token) = &endpoint.token {
        let value = HeaderValue::from_str(&bearer(token)).map_err(|e| format!("Invalid token: {}", e))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

fn run(endpoint: Endpoint, cmd_rx: Receiver<WsCommand>, event_tx: Sender<LinkEvent>) {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        log::info!("WebSocket thread: connecting to {} (attempt {})", endpoint.url, attempt);

        let request = match build_request(&endpoint) {
            Ok(request) => request,
            Err(message) => {
                let _ = event_tx.send(LinkEvent::Error(message));
                return;
            }
        };

        match tungstenite::connect(request) {
            Ok((mut socket, response)) => {
                log::info!("WebSocket connected, status: {}", response.status());
                attempt = 0;
                if let Exit::Stop = discard_queued(&cmd_rx) {
                    let _ = socket.close(None);
                    let _ = event_tx.send(LinkEvent::Disconnected);
                    log::info!("WebSocket thread exiting");
                    return;
                }
                if event_tx.send(LinkEvent::Connected).is_err() {
                    let _ = socket.close(None);
                    return;
                }
                set_timeouts(&mut socket);
                let exit = pump(&mut socket, &cmd_rx, &event_tx);
                if event_tx.send(LinkEvent::Disconnected).is_err() {
                    return;
                }
                if let Exit::Stop = exit {
                    log::info!("WebSocket thread exiting");
                    return;
                }
            }
            Err(e) => {
                log::warn!("WebSocket connection failed: {}", e);
                if event_tx.send(LinkEvent::Error(format!("Connection failed: {}", e))).is_err() {
                    return;
                }
            }
        }

        if let Exit::Stop = backoff(&cmd_rx, endpoint.reconnect_delay) {
            log::info!("WebSocket thread exiting");
            return;
        }
    }
}

/// First 100 characters, for log lines.
fn preview(text: &str) -> &str {
    match text.char_indices().nth(100) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// Short read timeout so the loop can interleave outgoing commands.
fn set_timeouts(socket: &mut Socket) {
    match socket.get_mut() {
        MaybeTlsStream::Plain(tcp) => {
            let _ = tcp.set_read_timeout(Some(Duration::from_millis(50)));
            let _ = tcp.set_write_timeout(Some(Duration::from_secs(5)));
        }
        #[allow(unreachable_patterns)]
        _ => {
            log::debug!("TLS or other stream - using default timeout handling");
        }
    }
}

fn pump(socket: &mut Socket, cmd_rx: &Receiver<WsCommand>, event_tx: &Sender<LinkEvent>) -> Exit {
    loop {
        loop {
            match cmd_rx.try_recv() {
                Ok(WsCommand::Send(msg)) => {
                    log::debug!("WebSocket sending: {}", preview(&msg));
                    if let Err(e) = socket.send(Message::Text(msg)) {
                        log::error!("WebSocket send error: {}", e);
                        return Exit::Retry;
                    }
                }
                Ok(WsCommand::Close) => {
                    log::info!("WebSocket close requested");
                    let _ = socket.close(None);
                    let _ = socket.flush();
                    return Exit::Stop;
                }
                Err(TryRecvError::Disconnected) => {
                    log::info!("WebSocket command channel disconnected");
                    let _ = socket.close(None);
                    return Exit::Stop;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        match socket.read() {
            Ok(Message::Text(txt)) => {
                log::debug!("WebSocket received: {}", preview(&txt));
                if event_tx.send(LinkEvent::Text(txt)).is_err() {
                    let _ = socket.close(None);
                    return Exit::Stop;
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = socket.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => {
                log::info!("WebSocket received close frame");
                return Exit::Retry;
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                log::error!("WebSocket read error: {}", e);
                return Exit::Retry;
            }
        }
    }
}

/// Drop frames issued before the link came up. Nothing is replayed.
fn discard_queued(cmd_rx: &Receiver<WsCommand>) -> Exit {
    loop {
        match cmd_rx.try_recv() {
            Ok(WsCommand::Send(_)) => log::debug!("Discarding frame queued while connecting"),
            Ok(WsCommand::Close) | Err(TryRecvError::Disconnected) => return Exit::Stop,
            Err(TryRecvError::Empty) => return Exit::Retry,
        }
    }
}

/// Wait out the reconnect delay. Publishes issued meanwhile are discarded.
fn backoff(cmd_rx: &Receiver<WsCommand>, delay: Duration) -> Exit {
    let deadline = Instant::now() + delay;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Exit::Retry;
        }
        match cmd_rx.recv_timeout(remaining) {
            Ok(WsCommand::Send(_)) => log::debug!("Discarding frame while reconnecting"),
            Ok(WsCommand::Close) | Err(RecvTimeoutError::Disconnected) => return Exit::Stop,
            Err(RecvTimeoutError::Timeout) => return Exit::Retry,
        }
    }
}
