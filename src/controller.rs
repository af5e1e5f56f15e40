//! Per-window connection controller: the session lifecycle state machine.
//!
//! Each controller is a single tokio task owning all of its mutable state.
//! It consumes a mailbox of [`InstanceEvent`]s (surface input, resizes,
//! transport pushes, close) and drives at most one acknowledged transport
//! operation at a time. There is no locking: which operations are legal is
//! gated entirely by [`ConnectionState`], and interleaved events arriving
//! while an operation is in flight are handled between polls of that
//! operation.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::negotiator::{Choice, ReconnectNegotiator};
use crate::persist::SessionStore;
use crate::protocol::{ClientEvent, ClientRequest, Geometry, ServerEvent, ServerReply};
use crate::surface::RenderSurface;
use crate::transport::{Transport, TransportEvent};

/// Lifecycle states of one terminal instance.
///
/// `Connected` and `Reconnecting` transition back and forth; every state
/// except `Closed` can transition to `Closed`, and `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Discovering,
    AwaitingChoice,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Init => "starting",
            ConnectionState::Discovering => "looking for sessions",
            ConnectionState::AwaitingChoice => "waiting for choice",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Snapshot of a controller, published on a watch channel after every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub state: ConnectionState,
    pub session_id: Option<String>,
    /// The server closed the session; the controller reports this and then
    /// sends nothing further until the window itself is closed.
    pub inert: bool,
}

/// Events delivered to a controller's mailbox.
#[derive(Debug, Clone)]
pub enum InstanceEvent {
    /// Keystrokes from the render surface.
    Input(String),
    /// The render surface changed size.
    Resize(Geometry),
    /// Explicit user request to retry a failed create.
    Retry,
    /// The owning window is closing.
    Close,
    /// Anything the transport pushed at us.
    Channel(TransportEvent),
}

/// Cheap cloneable handle to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    window_id: String,
    events: mpsc::UnboundedSender<InstanceEvent>,
    status: watch::Receiver<InstanceStatus>,
    join: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl ControllerHandle {
    pub fn window_id(&self) -> &str {
        &self.window_id
    }

    /// Forward user keystrokes. Dropped unless the instance is connected.
    pub fn input(&self, data: impl Into<String>) {
        let _ = self.events.send(InstanceEvent::Input(data.into()));
    }

    /// Report a new surface size. Outside `Connected` this only updates the
    /// last known geometry, which is synced once on the next attach.
    pub fn resize(&self, geometry: Geometry) {
        let _ = self.events.send(InstanceEvent::Resize(geometry));
    }

    /// Retry a failed session create.
    pub fn retry(&self) {
        let _ = self.events.send(InstanceEvent::Retry);
    }

    /// Current snapshot.
    pub fn status(&self) -> InstanceStatus {
        self.status.borrow().clone()
    }

    /// Wait until the published status satisfies `pred`.
    pub async fn wait_for(
        &self,
        mut pred: impl FnMut(&InstanceStatus) -> bool,
    ) -> InstanceStatus {
        let mut rx = self.status.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if pred(&current) {
                    return current.clone();
                }
            }
            if rx.changed().await.is_err() {
                // controller gone; last value is all we will ever see
                return rx.borrow().clone();
            }
        }
    }

    /// Drive the controller to `Closed` and wait for its task to finish.
    /// Safe to call from several handles at once; only one of them gets the
    /// join handle, the rest wait on the published status.
    pub async fn close(&self) {
        let _ = self.events.send(InstanceEvent::Close);
        let join = self.join.lock().take();
        if let Some(join) = join {
            let _ = join.await;
        } else {
            self.wait_for(|s| s.state == ConnectionState::Closed).await;
        }
    }
}

/// What the controller asked the transport to do with a create/reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Intent {
    Create,
    Reconnect(String),
}

/// The single in-flight acknowledged operation, if any.
enum Pending {
    Discover(BoxFuture<'static, Result<ServerReply, TransportError>>),
    Choice(BoxFuture<'static, Choice>),
    Attach {
        intent: Intent,
        request: BoxFuture<'static, Result<ServerReply, TransportError>>,
    },
}

enum Outcome {
    Discovered(Result<ServerReply, TransportError>),
    Chosen(Choice),
    Attached(Intent, Result<ServerReply, TransportError>),
}

impl Pending {
    async fn outcome(&mut self) -> Outcome {
        match self {
            Pending::Discover(fut) => Outcome::Discovered(fut.as_mut().await),
            Pending::Choice(fut) => Outcome::Chosen(fut.as_mut().await),
            Pending::Attach { intent, request } => {
                let result = request.as_mut().await;
                Outcome::Attached(intent.clone(), result)
            }
        }
    }
}

enum Step {
    Event(Option<InstanceEvent>),
    Finished(Outcome),
}

/// State machine for a single terminal instance.
pub struct ConnectionController {
    window_id: String,
    transport: Arc<dyn Transport>,
    surface: Box<dyn RenderSurface>,
    negotiator: Arc<dyn ReconnectNegotiator>,
    store: Arc<dyn SessionStore>,
    state: ConnectionState,
    session_id: Option<String>,
    geometry: Geometry,
    inert: bool,
    status_tx: watch::Sender<InstanceStatus>,
}

impl ConnectionController {
    /// Construct a controller for `window_id` and start its task. Discovery
    /// begins immediately; no user input is required to reach a session.
    pub fn spawn(
        window_id: String,
        transport: Arc<dyn Transport>,
        surface: Box<dyn RenderSurface>,
        negotiator: Arc<dyn ReconnectNegotiator>,
        store: Arc<dyn SessionStore>,
    ) -> ControllerHandle {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Pump transport pushes into the mailbox so the run loop has a
        // single event source. Ends once the controller task is gone.
        let mut pushes = transport.subscribe();
        let push_tx = event_tx.clone();
        tokio::spawn(async move {
            loop {
                match pushes.recv().await {
                    Ok(event) => {
                        if push_tx.send(InstanceEvent::Channel(event)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "transport push events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let geometry = surface.geometry();
        let (status_tx, status_rx) = watch::channel(InstanceStatus {
            state: ConnectionState::Init,
            session_id: None,
            inert: false,
        });

        let controller = Self {
            window_id: window_id.clone(),
            transport,
            surface,
            negotiator,
            store,
            state: ConnectionState::Init,
            session_id: None,
            geometry,
            inert: false,
            status_tx,
        };

        let join = tokio::spawn(controller.run(event_rx));

        ControllerHandle {
            window_id,
            events: event_tx,
            status: status_rx,
            join: Arc::new(parking_lot::Mutex::new(Some(join))),
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<InstanceEvent>) {
        let mut pending = Some(self.begin_discovery());

        loop {
            if self.state == ConnectionState::Closed {
                break;
            }

            let has_pending = pending.is_some();
            let step = tokio::select! {
                event = events.recv() => Step::Event(event),
                outcome = async { pending.as_mut().expect("pending").outcome().await },
                    if has_pending => Step::Finished(outcome),
            };

            match step {
                // A dropped handle set is treated like a window close so a
                // forgotten instance cannot leak a live session.
                Step::Event(None) | Step::Event(Some(InstanceEvent::Close)) => {
                    let in_flight = pending.take();
                    self.teardown(in_flight).await;
                }
                Step::Event(Some(event)) => self.handle_event(event, &mut pending),
                Step::Finished(outcome) => {
                    pending = None;
                    self.handle_outcome(outcome, &mut pending);
                }
            }
        }
    }

    fn begin_discovery(&mut self) -> Pending {
        self.set_state(ConnectionState::Discovering);
        Pending::Discover(self.transport.request(ClientRequest::Discover))
    }

    fn begin_attach(&mut self, intent: Intent) -> Pending {
        self.set_state(ConnectionState::Connecting);
        let request = match &intent {
            Intent::Create => ClientRequest::Create {
                cols: self.geometry.cols,
                rows: self.geometry.rows,
            },
            Intent::Reconnect(session_id) => ClientRequest::Reconnect {
                session_id: session_id.clone(),
            },
        };
        Pending::Attach {
            request: self.transport.request(request),
            intent,
        }
    }

    fn handle_event(&mut self, event: InstanceEvent, pending: &mut Option<Pending>) {
        match event {
            InstanceEvent::Input(data) => {
                if self.state == ConnectionState::Connected && !self.inert {
                    if let Some(session_id) = &self.session_id {
                        self.transport.emit(ClientEvent::Input {
                            session_id: session_id.clone(),
                            data,
                        });
                    }
                }
                // Outside Connected there is no session to type into.
            }
            InstanceEvent::Resize(geometry) => {
                self.geometry = geometry;
                match self.state {
                    ConnectionState::Connected if !self.inert => {
                        if let Some(session_id) = &self.session_id {
                            self.transport.emit(ClientEvent::Resize {
                                session_id: session_id.clone(),
                                cols: geometry.cols,
                                rows: geometry.rows,
                            });
                        }
                    }
                    // A resize is a natural trigger to retry a failed create.
                    ConnectionState::Connecting if pending.is_none() => {
                        *pending = Some(self.begin_attach(Intent::Create));
                    }
                    // Otherwise captured as last known geometry and synced
                    // once on attach.
                    _ => {}
                }
            }
            InstanceEvent::Retry => {
                if self.state == ConnectionState::Connecting && pending.is_none() {
                    *pending = Some(self.begin_attach(Intent::Create));
                }
            }
            InstanceEvent::Channel(TransportEvent::Down) => {
                if self.state == ConnectionState::Connected && !self.inert {
                    self.set_state(ConnectionState::Reconnecting);
                    self.surface
                        .write("\r\n[connection lost, waiting for the channel to return]\r\n");
                }
            }
            InstanceEvent::Channel(TransportEvent::Up) => {
                if self.state == ConnectionState::Reconnecting && pending.is_none() {
                    let intent = match &self.session_id {
                        Some(session_id) => Intent::Reconnect(session_id.clone()),
                        None => Intent::Create,
                    };
                    *pending = Some(self.begin_attach(intent));
                }
            }
            InstanceEvent::Channel(TransportEvent::Server(event)) => {
                self.handle_server_event(event);
            }
            // Close is intercepted by the run loop.
            InstanceEvent::Close => {}
        }
    }

    fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Output { session_id, data } => {
                if self.session_id.as_deref() == Some(session_id.as_str()) {
                    self.surface.write(&data);
                } else {
                    debug!(%session_id, "dropping output tagged with a stale session");
                }
            }
            ServerEvent::Error { session_id, error } => {
                if self.session_id.as_deref() == Some(session_id.as_str()) {
                    self.surface
                        .write(&format!("\r\n[session error: {error}]\r\n"));
                }
            }
            ServerEvent::Closed { session_id } => {
                if self.session_id.as_deref() == Some(session_id.as_str()) && !self.inert {
                    // Server-initiated close is terminal for the session but
                    // not for the window: report it and go inert rather than
                    // silently swapping in a fresh shell.
                    self.inert = true;
                    self.store.clear(&self.window_id);
                    self.surface
                        .write("\r\n[session ended on the server]\r\n");
                    self.publish();
                } else {
                    debug!(%session_id, "ignoring closed event for a stale or inert session");
                }
            }
        }
    }

    fn handle_outcome(&mut self, outcome: Outcome, pending: &mut Option<Pending>) {
        match outcome {
            Outcome::Discovered(Ok(ServerReply::Sessions { sessions }))
                if !sessions.is_empty() =>
            {
                // Fast path: if the persisted record for this window is still
                // discoverable, reattach without prompting. The record is
                // only a hint; the discovery response is what proves the
                // session still exists.
                if let Some(hint) = self.store.load(&self.window_id) {
                    if sessions.iter().any(|s| s.session_id == hint) {
                        *pending = Some(self.begin_attach(Intent::Reconnect(hint)));
                        return;
                    }
                }
                self.set_state(ConnectionState::AwaitingChoice);
                *pending = Some(Pending::Choice(self.negotiator.present(sessions)));
            }
            Outcome::Discovered(Ok(_)) => {
                // Nothing to reclaim; skip the choice step entirely.
                *pending = Some(self.begin_attach(Intent::Create));
            }
            Outcome::Discovered(Err(error)) => {
                // Discovery failure must never block terminal usability, and
                // is not worth a user-visible message.
                debug!(%error, "discovery failed, creating a fresh session");
                *pending = Some(self.begin_attach(Intent::Create));
            }
            Outcome::Chosen(Choice::Reconnect { session_id }) => {
                *pending = Some(self.begin_attach(Intent::Reconnect(session_id)));
            }
            Outcome::Chosen(Choice::CreateNew) => {
                *pending = Some(self.begin_attach(Intent::Create));
            }
            Outcome::Attached(intent, result) => {
                self.handle_attach_result(intent, result, pending);
            }
        }
    }

    fn handle_attach_result(
        &mut self,
        intent: Intent,
        result: Result<ServerReply, TransportError>,
        pending: &mut Option<Pending>,
    ) {
        let error = match result {
            Ok(ServerReply::Attached { session_id }) => {
                if let Intent::Reconnect(requested) = &intent {
                    if *requested != session_id {
                        warn!(
                            requested = %requested,
                            attached = %session_id,
                            "server reattached a different session; adopting server truth"
                        );
                    }
                }
                self.session_id = Some(session_id.clone());
                self.inert = false;
                self.store.save(&self.window_id, &session_id);
                self.set_state(ConnectionState::Connected);
                // Sync geometry exactly once on entering Connected. This also
                // replays the most recent resize captured while not connected.
                self.transport.emit(ClientEvent::Resize {
                    session_id,
                    cols: self.geometry.cols,
                    rows: self.geometry.rows,
                });
                return;
            }
            Ok(ServerReply::Refused { error }) => error,
            Ok(other) => {
                warn!(?other, "unexpected reply to an attach request");
                "unexpected reply from server".to_string()
            }
            Err(error) => error.to_string(),
        };

        match intent {
            // A stale or expired session is expected; degrade to a fresh one
            // rather than dead-ending.
            Intent::Reconnect(_) => {
                self.surface.write(&format!(
                    "\r\n[could not reconnect: {error}; starting a new session]\r\n"
                ));
                *pending = Some(self.begin_attach(Intent::Create));
            }
            // One visible message per failure, then wait for the next
            // natural trigger (a resize or an explicit retry).
            Intent::Create => {
                self.surface
                    .write(&format!("\r\n[could not start session: {error}]\r\n"));
                self.set_state(ConnectionState::Connecting);
            }
        }
    }

    async fn teardown(&mut self, in_flight: Option<Pending>) {
        // An attach still in flight may hand us a live session after the
        // window is gone; wait for it so the close below can release it.
        if let Some(Pending::Attach { request, .. }) = in_flight {
            if let Ok(ServerReply::Attached { session_id }) = request.await {
                self.session_id = Some(session_id);
                self.inert = false;
            }
        }

        if let Some(session_id) = self.session_id.take() {
            if !self.inert {
                self.transport.emit(ClientEvent::Close { session_id });
            }
        }
        self.store.clear(&self.window_id);
        self.surface.dispose();
        self.set_state(ConnectionState::Closed);
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.status_tx.send_replace(InstanceStatus {
            state: self.state,
            session_id: self.session_id.clone(),
            inert: self.inert,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::negotiator::AutoCreate;
    use crate::persist::MemoryStore;
    use crate::protocol::SessionDescriptor;

    /// One scripted reply per acknowledged request, in order.
    enum Scripted {
        Reply(Result<ServerReply, TransportError>),
        /// The request is never acknowledged (transport hangs forever).
        Never,
        /// Acknowledged after a delay.
        Delayed(Duration, Result<ServerReply, TransportError>),
    }

    struct MockTransport {
        replies: Mutex<VecDeque<Scripted>>,
        requests: Mutex<Vec<ClientRequest>>,
        emitted: Mutex<Vec<ClientEvent>>,
        push_tx: broadcast::Sender<TransportEvent>,
    }

    impl MockTransport {
        fn new(replies: Vec<Scripted>) -> Arc<Self> {
            let (push_tx, _) = broadcast::channel(64);
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
                emitted: Mutex::new(Vec::new()),
                push_tx,
            })
        }

        fn push(&self, event: TransportEvent) {
            let _ = self.push_tx.send(event);
        }

        fn requests(&self) -> Vec<ClientRequest> {
            self.requests.lock().clone()
        }

        fn emitted(&self) -> Vec<ClientEvent> {
            self.emitted.lock().clone()
        }
    }

    impl Transport for MockTransport {
        fn emit(&self, event: ClientEvent) {
            self.emitted.lock().push(event);
        }

        fn request(
            &self,
            request: ClientRequest,
        ) -> BoxFuture<'static, Result<ServerReply, TransportError>> {
            self.requests.lock().push(request);
            let scripted = self
                .replies
                .lock()
                .pop_front()
                .unwrap_or(Scripted::Reply(Err(TransportError::ChannelDown)));
            match scripted {
                Scripted::Reply(reply) => Box::pin(async move { reply }),
                Scripted::Never => Box::pin(futures::future::pending()),
                Scripted::Delayed(delay, reply) => Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    reply
                }),
            }
        }

        fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
            self.push_tx.subscribe()
        }
    }

    #[derive(Clone)]
    struct CaptureSurface {
        written: Arc<Mutex<String>>,
        disposed: Arc<AtomicBool>,
        geometry: Geometry,
    }

    impl CaptureSurface {
        fn new(geometry: Geometry) -> Self {
            Self {
                written: Arc::new(Mutex::new(String::new())),
                disposed: Arc::new(AtomicBool::new(false)),
                geometry,
            }
        }

        fn contents(&self) -> String {
            self.written.lock().clone()
        }
    }

    impl RenderSurface for CaptureSurface {
        fn write(&self, text: &str) {
            self.written.lock().push_str(text);
        }

        fn geometry(&self) -> Geometry {
            self.geometry
        }

        fn dispose(&mut self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    struct ScriptedNegotiator {
        choice: Choice,
        invoked: Arc<AtomicBool>,
    }

    impl ScriptedNegotiator {
        fn new(choice: Choice) -> (Arc<Self>, Arc<AtomicBool>) {
            let invoked = Arc::new(AtomicBool::new(false));
            (
                Arc::new(Self {
                    choice,
                    invoked: invoked.clone(),
                }),
                invoked,
            )
        }
    }

    impl ReconnectNegotiator for ScriptedNegotiator {
        fn present(&self, _sessions: Vec<SessionDescriptor>) -> BoxFuture<'static, Choice> {
            self.invoked.store(true, Ordering::SeqCst);
            let choice = self.choice.clone();
            Box::pin(async move { choice })
        }
    }

    struct NeverNegotiator;

    impl ReconnectNegotiator for NeverNegotiator {
        fn present(&self, _sessions: Vec<SessionDescriptor>) -> BoxFuture<'static, Choice> {
            Box::pin(futures::future::pending())
        }
    }

    fn descriptor(session_id: &str) -> SessionDescriptor {
        SessionDescriptor {
            session_id: session_id.to_string(),
            working_dir: Some("/home/x".to_string()),
            last_activity: chrono::Utc::now(),
        }
    }

    fn sessions_reply(ids: &[&str]) -> Scripted {
        Scripted::Reply(Ok(ServerReply::Sessions {
            sessions: ids.iter().map(|id| descriptor(id)).collect(),
        }))
    }

    fn attached(session_id: &str) -> Scripted {
        Scripted::Reply(Ok(ServerReply::Attached {
            session_id: session_id.to_string(),
        }))
    }

    fn refused(error: &str) -> Scripted {
        Scripted::Reply(Ok(ServerReply::Refused {
            error: error.to_string(),
        }))
    }

    async fn eventually(mut pred: impl FnMut() -> bool) {
        for _ in 0..400 {
            if pred() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn spawn(
        transport: &Arc<MockTransport>,
        negotiator: Arc<dyn ReconnectNegotiator>,
        store: &Arc<MemoryStore>,
    ) -> (ControllerHandle, CaptureSurface) {
        let surface = CaptureSurface::new(Geometry { cols: 80, rows: 24 });
        let transport: Arc<dyn Transport> = transport.clone();
        let store: Arc<dyn SessionStore> = store.clone();
        let handle = ConnectionController::spawn(
            "w1".to_string(),
            transport,
            Box::new(surface.clone()),
            negotiator,
            store,
        );
        (handle, surface)
    }

    #[tokio::test]
    async fn empty_discovery_short_circuits_to_create() {
        let transport = MockTransport::new(vec![sessions_reply(&[]), attached("b")]);
        let store = Arc::new(MemoryStore::new());
        let (negotiator, invoked) = ScriptedNegotiator::new(Choice::CreateNew);
        let (handle, _surface) = spawn(&transport, negotiator, &store);

        handle
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await;

        assert!(!invoked.load(Ordering::SeqCst), "choice step must be skipped");
        assert_eq!(handle.status().session_id, Some("b".to_string()));
        assert_eq!(store.load("w1"), Some("b".to_string()));
        assert_eq!(
            transport.requests(),
            vec![
                ClientRequest::Discover,
                ClientRequest::Create { cols: 80, rows: 24 },
            ]
        );
        // geometry is synced exactly once on entering Connected
        let resizes: Vec<_> = transport
            .emitted()
            .into_iter()
            .filter(|e| matches!(e, ClientEvent::Resize { .. }))
            .collect();
        assert_eq!(
            resizes,
            vec![ClientEvent::Resize {
                session_id: "b".to_string(),
                cols: 80,
                rows: 24,
            }]
        );
    }

    #[tokio::test]
    async fn discovery_failure_falls_back_to_create() {
        let transport = MockTransport::new(vec![
            Scripted::Reply(Err(TransportError::Ack("timeout".into()))),
            attached("b"),
        ]);
        let store = Arc::new(MemoryStore::new());
        let (handle, surface) = spawn(&transport, Arc::new(AutoCreate), &store);

        handle
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await;
        // never surfaced as an error to the user
        assert!(!surface.contents().contains("timeout"));
    }

    #[tokio::test]
    async fn picking_new_creates_and_forgets_the_old_session() {
        let transport = MockTransport::new(vec![sessions_reply(&["a"]), attached("b")]);
        let store = Arc::new(MemoryStore::new());
        let (negotiator, invoked) = ScriptedNegotiator::new(Choice::CreateNew);
        let (handle, _surface) = spawn(&transport, negotiator, &store);

        let status = handle
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await;

        assert!(invoked.load(Ordering::SeqCst));
        assert_eq!(status.session_id, Some("b".to_string()));
        assert_eq!(store.load("w1"), Some("b".to_string()));
        assert!(matches!(
            transport.requests()[1],
            ClientRequest::Create { .. }
        ));
    }

    #[tokio::test]
    async fn picking_a_session_reconnects_to_it() {
        let transport = MockTransport::new(vec![sessions_reply(&["a"]), attached("a")]);
        let store = Arc::new(MemoryStore::new());
        let (negotiator, _) = ScriptedNegotiator::new(Choice::Reconnect {
            session_id: "a".to_string(),
        });
        let (handle, _surface) = spawn(&transport, negotiator, &store);

        handle
            .wait_for(|s| s.session_id.as_deref() == Some("a"))
            .await;
        assert_eq!(
            transport.requests()[1],
            ClientRequest::Reconnect {
                session_id: "a".to_string()
            }
        );
    }

    #[tokio::test]
    async fn persisted_record_skips_the_choice_step() {
        let transport = MockTransport::new(vec![sessions_reply(&["a", "c"]), attached("a")]);
        let store = Arc::new(MemoryStore::new());
        store.save("w1", "a");
        let (negotiator, invoked) = ScriptedNegotiator::new(Choice::CreateNew);
        let (handle, _surface) = spawn(&transport, negotiator, &store);

        handle
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await;
        assert!(!invoked.load(Ordering::SeqCst));
        assert_eq!(handle.status().session_id, Some("a".to_string()));
    }

    #[tokio::test]
    async fn stale_record_falls_through_to_the_choice_flow() {
        let transport = MockTransport::new(vec![sessions_reply(&["a"]), attached("b")]);
        let store = Arc::new(MemoryStore::new());
        store.save("w1", "gone");
        let (negotiator, invoked) = ScriptedNegotiator::new(Choice::CreateNew);
        let (handle, _surface) = spawn(&transport, negotiator, &store);

        handle
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await;
        assert!(invoked.load(Ordering::SeqCst));
        assert_eq!(store.load("w1"), Some("b".to_string()));
    }

    #[tokio::test]
    async fn reconnect_failure_degrades_to_create() {
        let transport = MockTransport::new(vec![
            sessions_reply(&["a"]),
            refused("session expired"),
            attached("b"),
        ]);
        let store = Arc::new(MemoryStore::new());
        let (negotiator, _) = ScriptedNegotiator::new(Choice::Reconnect {
            session_id: "a".to_string(),
        });
        let (handle, surface) = spawn(&transport, negotiator, &store);

        let status = handle
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await;
        assert_eq!(status.session_id, Some("b".to_string()));
        assert!(surface.contents().contains("session expired"));
        assert!(matches!(
            transport.requests()[2],
            ClientRequest::Create { .. }
        ));
    }

    #[tokio::test]
    async fn create_failure_reports_once_and_waits_for_a_trigger() {
        let transport = MockTransport::new(vec![sessions_reply(&[]), refused("busy")]);
        let store = Arc::new(MemoryStore::new());
        let (handle, surface) = spawn(&transport, Arc::new(AutoCreate), &store);

        let surface_probe = surface.clone();
        eventually(move || surface_probe.contents().contains("busy")).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        // exactly one visible message, no automatic retry loop
        assert_eq!(surface.contents().matches("busy").count(), 1);
        assert_eq!(handle.status().state, ConnectionState::Connecting);
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn resize_retries_a_failed_create_with_fresh_geometry() {
        let transport =
            MockTransport::new(vec![sessions_reply(&[]), refused("busy"), attached("b")]);
        let store = Arc::new(MemoryStore::new());
        let (handle, surface) = spawn(&transport, Arc::new(AutoCreate), &store);

        let surface_probe = surface.clone();
        eventually(move || surface_probe.contents().contains("busy")).await;

        handle.resize(Geometry {
            cols: 132,
            rows: 50,
        });
        handle
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await;

        assert_eq!(
            transport.requests()[2],
            ClientRequest::Create {
                cols: 132,
                rows: 50
            }
        );
        // the captured resize is replayed exactly once, after attach
        let resizes: Vec<_> = transport
            .emitted()
            .into_iter()
            .filter(|e| matches!(e, ClientEvent::Resize { .. }))
            .collect();
        assert_eq!(
            resizes,
            vec![ClientEvent::Resize {
                session_id: "b".to_string(),
                cols: 132,
                rows: 50,
            }]
        );
    }

    #[tokio::test]
    async fn stale_output_is_dropped_silently() {
        let transport = MockTransport::new(vec![sessions_reply(&[]), attached("b")]);
        let store = Arc::new(MemoryStore::new());
        let (handle, surface) = spawn(&transport, Arc::new(AutoCreate), &store);

        handle
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await;

        transport.push(TransportEvent::Server(ServerEvent::Output {
            session_id: "z".to_string(),
            data: "ghost".to_string(),
        }));
        transport.push(TransportEvent::Server(ServerEvent::Output {
            session_id: "b".to_string(),
            data: "real".to_string(),
        }));

        let surface_probe = surface.clone();
        eventually(move || surface_probe.contents().contains("real")).await;
        assert!(!surface.contents().contains("ghost"));
        assert_eq!(handle.status().state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn error_pushes_render_for_the_current_session_only() {
        let transport = MockTransport::new(vec![sessions_reply(&[]), attached("b")]);
        let store = Arc::new(MemoryStore::new());
        let (handle, surface) = spawn(&transport, Arc::new(AutoCreate), &store);

        handle
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await;

        transport.push(TransportEvent::Server(ServerEvent::Error {
            session_id: "z".to_string(),
            error: "ghost failure".to_string(),
        }));
        transport.push(TransportEvent::Server(ServerEvent::Error {
            session_id: "b".to_string(),
            error: "disk full".to_string(),
        }));

        let surface_probe = surface.clone();
        eventually(move || surface_probe.contents().contains("disk full")).await;
        assert!(!surface.contents().contains("ghost failure"));

        // an error line is informational only
        let status = handle.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert!(!status.inert);
        assert_eq!(status.session_id, Some("b".to_string()));
    }

    #[tokio::test]
    async fn server_close_goes_inert_without_replacing_the_shell() {
        let transport = MockTransport::new(vec![sessions_reply(&[]), attached("b")]);
        let store = Arc::new(MemoryStore::new());
        let (handle, surface) = spawn(&transport, Arc::new(AutoCreate), &store);

        handle
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await;

        transport.push(TransportEvent::Server(ServerEvent::Closed {
            session_id: "b".to_string(),
        }));
        handle.wait_for(|s| s.inert).await;

        assert_eq!(store.load("w1"), None);
        assert_eq!(handle.status().state, ConnectionState::Connected);

        // input after the session ended goes nowhere
        handle.input("ls\r");
        // a second closed push for the same session is a no-op
        transport.push(TransportEvent::Server(ServerEvent::Closed {
            session_id: "b".to_string(),
        }));
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(surface.contents().matches("session ended").count(), 1);
        assert!(!transport
            .emitted()
            .iter()
            .any(|e| matches!(e, ClientEvent::Input { .. })));
    }

    #[tokio::test]
    async fn closed_push_for_an_unrelated_session_is_ignored_while_connecting() {
        let transport = MockTransport::new(vec![sessions_reply(&[]), Scripted::Never]);
        let store = Arc::new(MemoryStore::new());
        let (handle, surface) = spawn(&transport, Arc::new(AutoCreate), &store);

        handle
            .wait_for(|s| s.state == ConnectionState::Connecting)
            .await;

        transport.push(TransportEvent::Server(ServerEvent::Closed {
            session_id: "z".to_string(),
        }));
        tokio::time::sleep(Duration::from_millis(30)).await;

        let status = handle.status();
        assert_eq!(status.state, ConnectionState::Connecting);
        assert!(!status.inert);
        assert!(!surface.contents().contains("session ended"));
    }

    #[tokio::test]
    async fn input_and_resize_are_not_sent_before_connected() {
        let transport = MockTransport::new(vec![Scripted::Never]);
        let store = Arc::new(MemoryStore::new());
        let (handle, _surface) = spawn(&transport, Arc::new(AutoCreate), &store);

        handle
            .wait_for(|s| s.state == ConnectionState::Discovering)
            .await;
        handle.input("echo hi\r");
        handle.resize(Geometry { cols: 100, rows: 30 });
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(transport.emitted().is_empty());
    }

    #[tokio::test]
    async fn close_tears_down_and_notifies_the_server() {
        let transport = MockTransport::new(vec![sessions_reply(&[]), attached("b")]);
        let store = Arc::new(MemoryStore::new());
        let (handle, surface) = spawn(&transport, Arc::new(AutoCreate), &store);

        handle
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await;
        handle.close().await;

        assert_eq!(handle.status().state, ConnectionState::Closed);
        assert_eq!(store.load("w1"), None);
        assert!(surface.disposed.load(Ordering::SeqCst));
        assert!(transport.emitted().iter().any(|e| matches!(
            e,
            ClientEvent::Close { session_id } if session_id == "b"
        )));
    }

    #[tokio::test]
    async fn concurrent_closes_both_wait_for_teardown() {
        let transport = MockTransport::new(vec![sessions_reply(&[]), attached("b")]);
        let store = Arc::new(MemoryStore::new());
        let (handle, surface) = spawn(&transport, Arc::new(AutoCreate), &store);

        handle
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await;

        // only one close gets the join handle; the other must still not
        // return before the task has torn down
        let other = handle.clone();
        tokio::join!(handle.close(), other.close());

        assert_eq!(handle.status().state, ConnectionState::Closed);
        assert_eq!(other.status().state, ConnectionState::Closed);
        assert!(surface.disposed.load(Ordering::SeqCst));
        assert_eq!(store.load("w1"), None);
    }

    #[tokio::test]
    async fn close_while_awaiting_choice_cleans_up_without_a_session() {
        let transport = MockTransport::new(vec![sessions_reply(&["a"])]);
        let store = Arc::new(MemoryStore::new());
        let (handle, surface) = spawn(&transport, Arc::new(NeverNegotiator), &store);

        handle
            .wait_for(|s| s.state == ConnectionState::AwaitingChoice)
            .await;
        handle.close().await;

        assert_eq!(handle.status().state, ConnectionState::Closed);
        assert!(surface.disposed.load(Ordering::SeqCst));
        assert!(!transport
            .emitted()
            .iter()
            .any(|e| matches!(e, ClientEvent::Close { .. })));
    }

    #[tokio::test]
    async fn close_during_attach_releases_the_session_it_was_handed() {
        let transport = MockTransport::new(vec![
            sessions_reply(&[]),
            Scripted::Delayed(
                Duration::from_millis(100),
                Ok(ServerReply::Attached {
                    session_id: "b".to_string(),
                }),
            ),
        ]);
        let store = Arc::new(MemoryStore::new());
        let (handle, _surface) = spawn(&transport, Arc::new(AutoCreate), &store);

        handle
            .wait_for(|s| s.state == ConnectionState::Connecting)
            .await;
        // The close lands while the create is still in flight; the session
        // it eventually hands back must be released, never leaked.
        handle.close().await;

        assert!(transport.emitted().iter().any(|e| matches!(
            e,
            ClientEvent::Close { session_id } if session_id == "b"
        )));
        assert_eq!(store.load("w1"), None);
    }

    #[tokio::test]
    async fn channel_drop_and_return_reattaches_the_same_session() {
        let transport = MockTransport::new(vec![sessions_reply(&[]), attached("b"), attached("b")]);
        let store = Arc::new(MemoryStore::new());
        let (handle, _surface) = spawn(&transport, Arc::new(AutoCreate), &store);

        handle
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await;

        transport.push(TransportEvent::Down);
        handle
            .wait_for(|s| s.state == ConnectionState::Reconnecting)
            .await;

        // input while reconnecting goes nowhere
        handle.input("stranded\r");

        transport.push(TransportEvent::Up);
        handle
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await;

        assert_eq!(handle.status().session_id, Some("b".to_string()));
        assert_eq!(
            transport.requests()[2],
            ClientRequest::Reconnect {
                session_id: "b".to_string()
            }
        );
        assert!(!transport.emitted().iter().any(|e| matches!(
            e,
            ClientEvent::Input { data, .. } if data.contains("stranded")
        )));
    }
}
