//! In-process PTY host: the server half of the event contract.
//!
//! Owns the real shell processes, tracks their working directory and last
//! activity, and buffers output for detached sessions so a reattaching
//! client sees what it missed. [`LoopbackTransport`] serves the channel
//! contract directly against a host in the same process, which is how the
//! integration tests (and embeddings that do not split client from server)
//! run the whole stack without a network.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, PtyPair, PtySize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::protocol::{ClientEvent, ClientRequest, ServerEvent, ServerReply, SessionDescriptor};
use crate::transport::{Transport, TransportEvent};

/// How sessions are spawned.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Program or command line to run. A value containing whitespace is run
    /// through `sh -c`; otherwise it is executed directly. Defaults to
    /// `$SHELL`, falling back to `/bin/sh`.
    pub shell: Option<String>,
    /// Working directory for new sessions; `~` is expanded.
    pub working_dir: Option<String>,
    /// Bytes of output retained per detached session. Older output is
    /// discarded first; scrollback beyond this does not survive a detach.
    pub backlog_limit: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            shell: None,
            working_dir: None,
            backlog_limit: 256 * 1024,
        }
    }
}

struct HostSession {
    pair: PtyPair,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    working_dir: Option<String>,
    last_activity: DateTime<Utc>,
    attached: bool,
    /// Output held back while detached, or while a reattached client has not
    /// yet been sent its replay. Kept non-empty until flushed so replay and
    /// live output never reorder.
    backlog: Vec<u8>,
}

/// Session table plus the push side of the event channel.
pub struct PtyHost {
    config: HostConfig,
    sessions: Arc<Mutex<HashMap<String, Arc<Mutex<HostSession>>>>>,
    push_tx: broadcast::Sender<TransportEvent>,
}

impl PtyHost {
    pub fn new(config: HostConfig) -> Arc<Self> {
        let (push_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            push_tx,
        })
    }

    /// Live sessions, attached or not.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Mark every session detached, as when the client side of the channel
    /// disappears without closing. Their output starts accumulating in the
    /// backlog until someone reconnects.
    pub fn detach_all(&self) {
        let sessions = self.sessions.lock();
        for session in sessions.values() {
            session.lock().attached = false;
        }
    }

    fn handle_request(&self, request: ClientRequest) -> ServerReply {
        match request {
            ClientRequest::Discover => ServerReply::Sessions {
                sessions: self.discover(),
            },
            ClientRequest::Create { cols, rows } => match self.spawn_session(cols, rows) {
                Ok(session_id) => ServerReply::Attached { session_id },
                Err(error) => ServerReply::Refused { error },
            },
            ClientRequest::Reconnect { session_id } => self.reconnect(session_id),
        }
    }

    fn discover(&self) -> Vec<SessionDescriptor> {
        let sessions = self.sessions.lock();
        let mut detached: Vec<SessionDescriptor> = sessions
            .iter()
            .filter_map(|(session_id, session)| {
                let session = session.lock();
                if session.attached {
                    return None;
                }
                Some(SessionDescriptor {
                    session_id: session_id.clone(),
                    working_dir: session.working_dir.clone(),
                    last_activity: session.last_activity,
                })
            })
            .collect();
        detached.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        detached
    }

    fn reconnect(&self, session_id: String) -> ServerReply {
        let session = {
            let sessions = self.sessions.lock();
            sessions.get(&session_id).cloned()
        };
        let Some(session) = session else {
            return ServerReply::Refused {
                error: format!("no session {session_id}"),
            };
        };
        let mut session = session.lock();
        if session.attached {
            // one session, one window
            return ServerReply::Refused {
                error: format!("session {session_id} is attached to another window"),
            };
        }
        session.attached = true;
        session.last_activity = Utc::now();
        ServerReply::Attached { session_id }
    }

    fn spawn_session(&self, cols: u16, rows: u16) -> Result<String, String> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| e.to_string())?;

        let shell = self.config.shell.clone().unwrap_or_else(|| {
            std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
        });
        let mut cmd = if shell.contains(char::is_whitespace) {
            let mut cmd = CommandBuilder::new("/bin/sh");
            cmd.args(["-c", shell.as_str()]);
            cmd
        } else {
            CommandBuilder::new(&shell)
        };
        cmd.env("TERM", "xterm-256color");

        let working_dir = self
            .config
            .working_dir
            .as_deref()
            .map(|dir| shellexpand::tilde(dir).to_string());
        if let Some(dir) = &working_dir {
            cmd.cwd(dir);
        }

        let child = pair.slave.spawn_command(cmd).map_err(|e| e.to_string())?;
        let writer = pair.master.take_writer().map_err(|e| e.to_string())?;
        let mut reader = pair.master.try_clone_reader().map_err(|e| e.to_string())?;

        let session_id = Uuid::new_v4().to_string();
        let session = Arc::new(Mutex::new(HostSession {
            pair,
            writer,
            child,
            working_dir,
            last_activity: Utc::now(),
            attached: true,
            backlog: Vec::new(),
        }));
        self.sessions.lock().insert(session_id.clone(), session.clone());
        debug!(%session_id, "spawned pty session");

        // Reader thread: relay output while attached, hold it back otherwise.
        let sessions = self.sessions.clone();
        let push_tx = self.push_tx.clone();
        let backlog_limit = self.config.backlog_limit;
        let reader_session_id = session_id.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut s = session.lock();
                        s.last_activity = Utc::now();
                        if s.attached && s.backlog.is_empty() {
                            drop(s);
                            let data = String::from_utf8_lossy(&buf[..n]).to_string();
                            let _ = push_tx.send(TransportEvent::Server(ServerEvent::Output {
                                session_id: reader_session_id.clone(),
                                data,
                            }));
                        } else {
                            s.backlog.extend_from_slice(&buf[..n]);
                            if s.backlog.len() > backlog_limit {
                                let excess = s.backlog.len() - backlog_limit;
                                s.backlog.drain(..excess);
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
            // the shell exited (or was killed): drop the session and tell
            // whoever is listening
            sessions.lock().remove(&reader_session_id);
            let _ = push_tx.send(TransportEvent::Server(ServerEvent::Closed {
                session_id: reader_session_id,
            }));
        });

        Ok(session_id)
    }

    fn handle_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::Input { session_id, data } => {
                let Some(session) = self.get_session(&session_id) else {
                    debug!(%session_id, "input for unknown session");
                    return;
                };
                let mut session = session.lock();
                self.flush_backlog(&session_id, &mut session);
                session.last_activity = Utc::now();
                if let Err(error) = session
                    .writer
                    .write_all(data.as_bytes())
                    .and_then(|_| session.writer.flush())
                {
                    warn!(%session_id, %error, "failed to write to pty");
                }
            }
            ClientEvent::Resize {
                session_id,
                cols,
                rows,
            } => {
                let Some(session) = self.get_session(&session_id) else {
                    debug!(%session_id, "resize for unknown session");
                    return;
                };
                let mut session = session.lock();
                // the first post-attach event carries the replay out first
                self.flush_backlog(&session_id, &mut session);
                if let Err(error) = session.pair.master.resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                }) {
                    warn!(%session_id, %error, "failed to resize pty");
                }
            }
            ClientEvent::Close { session_id } => {
                let removed = self.sessions.lock().remove(&session_id);
                if let Some(session) = removed {
                    let _ = session.lock().child.kill();
                    debug!(%session_id, "session closed by client");
                }
            }
        }
    }

    fn get_session(&self, session_id: &str) -> Option<Arc<Mutex<HostSession>>> {
        self.sessions.lock().get(session_id).cloned()
    }

    fn flush_backlog(&self, session_id: &str, session: &mut HostSession) {
        if !session.attached || session.backlog.is_empty() {
            return;
        }
        let data = String::from_utf8_lossy(&session.backlog).to_string();
        session.backlog.clear();
        let _ = self.push_tx.send(TransportEvent::Server(ServerEvent::Output {
            session_id: session_id.to_string(),
            data,
        }));
    }
}

/// A [`Transport`] wired straight to a [`PtyHost`] in the same process.
///
/// Frames cross the loopback as JSON, exactly as they would on the real
/// socket channel, so the wire shapes get exercised end to end. Must be
/// created inside a tokio runtime.
pub struct LoopbackTransport {
    host: Arc<PtyHost>,
    link_up: Arc<AtomicBool>,
    push_tx: broadcast::Sender<TransportEvent>,
}

impl LoopbackTransport {
    pub fn new(host: Arc<PtyHost>) -> Arc<Self> {
        let (push_tx, _) = broadcast::channel(256);
        let link_up = Arc::new(AtomicBool::new(true));

        // Relay host pushes to subscribers while the link is up.
        let mut host_rx = host.push_tx.subscribe();
        let relay_tx = push_tx.clone();
        let relay_link = link_up.clone();
        tokio::spawn(async move {
            loop {
                match host_rx.recv().await {
                    Ok(event) => {
                        if relay_link.load(Ordering::SeqCst) {
                            let _ = relay_tx.send(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "loopback relay lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Arc::new(Self {
            host,
            link_up,
            push_tx,
        })
    }

    /// Simulate losing the channel: every session detaches (the host has no
    /// client any more) and subscribers see `Down`.
    pub fn drop_link(&self) {
        self.link_up.store(false, Ordering::SeqCst);
        self.host.detach_all();
        let _ = self.push_tx.send(TransportEvent::Down);
    }

    /// Simulate the channel's own reconnect succeeding.
    pub fn restore_link(&self) {
        self.link_up.store(true, Ordering::SeqCst);
        let _ = self.push_tx.send(TransportEvent::Up);
    }
}

impl Transport for LoopbackTransport {
    fn emit(&self, event: ClientEvent) {
        if !self.link_up.load(Ordering::SeqCst) {
            return;
        }
        let framed = serde_json::to_string(&event)
            .and_then(|frame| serde_json::from_str::<ClientEvent>(&frame));
        match framed {
            Ok(event) => self.host.handle_event(event),
            Err(error) => warn!(%error, "dropping malformed client event"),
        }
    }

    fn request(
        &self,
        request: ClientRequest,
    ) -> BoxFuture<'static, Result<ServerReply, TransportError>> {
        if !self.link_up.load(Ordering::SeqCst) {
            return Box::pin(async { Err(TransportError::ChannelDown) });
        }
        let host = self.host.clone();
        Box::pin(async move {
            let frame = serde_json::to_string(&request)
                .map_err(|e| TransportError::Ack(e.to_string()))?;
            let request: ClientRequest =
                serde_json::from_str(&frame).map_err(|e| TransportError::Ack(e.to_string()))?;
            let reply = host.handle_request(request);
            let frame =
                serde_json::to_string(&reply).map_err(|e| TransportError::Ack(e.to_string()))?;
            serde_json::from_str(&frame).map_err(|e| TransportError::Ack(e.to_string()))
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.push_tx.subscribe()
    }
}
