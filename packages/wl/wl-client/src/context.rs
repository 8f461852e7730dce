//! The connection context: object table, request sending and event dispatch.
//!
//! A [`Context`] owns the connection to the compositor. Objects are registered
//! in its table and receive ids in increasing order. Events are read by a
//! single worker task, one per [`Context::dispatch`] call, so at most one
//! event is in flight at any time and handlers run in arrival order.

use std::{
    collections::BTreeMap,
    ffi::OsStr,
    fmt,
    os::{fd::BorrowedFd, unix::net::UnixStream},
    sync::{Arc, OnceLock, Weak},
};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use wl_core::{
    id_manager::{IdManager, IdManagerError},
    wire::serde::{ObjectId, SerdeError},
};

use crate::{
    connection::{self, ConnectionError, DisplayConfig, ReadError, RecvSocket, SendError, SendSocket},
    event::Event,
    proxy::{DecodeMessageError, Dispatch, Object},
};

/// How events addressed to a registered object are handled.
#[derive(Clone)]
pub enum Route {
    /// Events are passed to the object's [`Dispatch`] implementation.
    Handler(Arc<dyn Dispatch>),
    /// The object only sends requests. Its events are dropped.
    Passive,
}

/// A table entry.
#[derive(Clone)]
pub struct Registered {
    object: Arc<dyn Object>,
    route: Route,
}

impl Registered {
    /// The registered object.
    #[must_use]
    pub const fn object(&self) -> &Arc<dyn Object> {
        &self.object
    }

    /// How its events are handled.
    #[must_use]
    pub const fn route(&self) -> &Route {
        &self.route
    }

    /// The event handler, unless the object is passive.
    #[must_use]
    pub const fn handler(&self) -> Option<&Arc<dyn Dispatch>> {
        match &self.route {
            Route::Handler(handler) => Some(handler),
            Route::Passive => None,
        }
    }
}

impl fmt::Debug for Registered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registered")
            .field("interface", &self.object.interface())
            .field("id", &self.object.id())
            .field("passive", &self.handler().is_none())
            .finish()
    }
}

#[derive(Default)]
struct ObjectTable {
    ids: IdManager,
    objects: BTreeMap<ObjectId, Registered>,
}

/// The outcome of one successful [`Context::dispatch`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// The event was handled by its target.
    Delivered {
        /// Target object.
        object_id: ObjectId,
        /// Event opcode.
        opcode: u16,
    },
    /// No object with this id is registered. The event was dropped.
    UnknownObject {
        /// Target object.
        object_id: ObjectId,
        /// Event opcode.
        opcode: u16,
    },
    /// The target is registered without a handler. The event was dropped.
    NoHandler {
        /// Target object.
        object_id: ObjectId,
        /// Event opcode.
        opcode: u16,
    },
    /// The target's interface has no such event. The event was dropped.
    UnknownOpcode {
        /// Target object.
        object_id: ObjectId,
        /// Event opcode.
        opcode: u16,
    },
}

impl Dispatched {
    /// Returns `true` if a handler consumed the event.
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// An error that ended a session.
///
/// Kept by the context and returned to every later dispatch call.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// Reading from the connection failed.
    #[error("failed to read an event from the compositor")]
    Transport(#[source] Arc<ReadError>),
    /// A handler could not decode its event.
    #[error("failed to decode event {opcode} for {interface}@{object_id}")]
    Decode {
        /// Target object.
        object_id: ObjectId,
        /// Event opcode.
        opcode: u16,
        /// Interface of the target.
        interface: &'static str,
        /// The decoding failure.
        #[source]
        source: Arc<SerdeError>,
    },
}

/// An error returned by [`Context::dispatch`].
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The context was closed, either locally or by the compositor hanging up.
    #[error("the context is closed")]
    Closed,
    /// The session failed.
    #[error(transparent)]
    Fatal(#[from] SessionError),
}

/// An error returned when registering an object.
#[derive(Debug, Error)]
pub enum RegisterError {
    /// The object's proxy is already bound to an id.
    #[error("object is already registered as {0}")]
    AlreadyRegistered(ObjectId),
    /// The context was closed.
    #[error("the context is closed")]
    Closed,
    /// No ids are left.
    #[error(transparent)]
    OutOfIds(#[from] IdManagerError),
}

type DispatchReply = oneshot::Sender<Result<Dispatched, DispatchError>>;

struct ContextInner {
    table: RwLock<ObjectTable>,
    requests: mpsc::Sender<DispatchReply>,
    shutdown: CancellationToken,
    session_error: OnceLock<SessionError>,
    send: Mutex<Option<Arc<SendSocket>>>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A client connection to a Wayland compositor.
///
/// Cloning is cheap and all clones share the same connection and table.
#[derive(Clone)]
pub struct Context(Arc<ContextInner>);

/// A non-owning handle to a [`Context`].
#[derive(Clone, Debug)]
pub struct WeakContext(Weak<ContextInner>);

impl WeakContext {
    /// Upgrades to a [`Context`] if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Context> {
        self.0.upgrade().map(Context)
    }
}

impl Context {
    /// Connects to the display `name`, or to the one named by the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be found or connected, or if
    /// called outside of a tokio runtime.
    pub fn connect(name: Option<&OsStr>) -> Result<Self, ConnectionError> {
        Self::connect_with(&DisplayConfig::from_env(), name)
    }

    /// Like [`Context::connect`], with an explicit configuration.
    ///
    /// # Errors
    ///
    /// See [`Context::connect`].
    pub fn connect_with(config: &DisplayConfig, name: Option<&OsStr>) -> Result<Self, ConnectionError> {
        Self::from_stream(connection::open(config, name)?)
    }

    /// Creates a context over an already connected stream.
    ///
    /// # Errors
    ///
    /// Returns an error if called outside of a tokio runtime or if the stream
    /// cannot be adopted.
    pub fn from_stream(stream: UnixStream) -> Result<Self, ConnectionError> {
        let runtime = Handle::try_current().map_err(|_| ConnectionError::NoRuntime)?;
        let _entered = runtime.enter();

        let (send, recv) = connection::split(stream)?;
        let (requests, request_receiver) = mpsc::channel(1);
        let shutdown = CancellationToken::new();

        let inner = Arc::new(ContextInner {
            table: RwLock::new(ObjectTable::default()),
            requests,
            shutdown: shutdown.clone(),
            session_error: OnceLock::new(),
            send: Mutex::new(Some(Arc::new(send))),
        });

        let worker = Worker {
            context: WeakContext(Arc::downgrade(&inner)),
            recv,
            requests: request_receiver,
            shutdown,
        };
        runtime.spawn(worker.run());

        Ok(Self(inner))
    }

    /// A non-owning handle to this context.
    #[must_use]
    pub fn downgrade(&self) -> WeakContext {
        WeakContext(Arc::downgrade(&self.0))
    }

    /// Registers an object whose events are passed to its handler.
    ///
    /// # Errors
    ///
    /// Fails if the object is already registered, the context is closed or
    /// the id space is exhausted. A failed registration consumes no id.
    pub fn register<T: Dispatch>(&self, object: Arc<T>) -> Result<ObjectId, RegisterError> {
        let handler: Arc<dyn Dispatch> = object.clone();
        self.insert(object, Route::Handler(handler))
    }

    /// Registers an object that has no event handler.
    ///
    /// # Errors
    ///
    /// See [`Context::register`].
    pub fn register_passive<T: Object>(&self, object: Arc<T>) -> Result<ObjectId, RegisterError> {
        self.insert(object, Route::Passive)
    }

    fn insert(&self, object: Arc<dyn Object>, route: Route) -> Result<ObjectId, RegisterError> {
        if self.is_closed() {
            return Err(RegisterError::Closed);
        }

        let mut table = self.0.table.write();
        let id = table.ids.peek_next_id()?;
        object.proxy().bind(id, self.downgrade())?;
        table.ids.alloc_id()?;

        tracing::trace!(id, interface = object.interface(), "registered object");
        table.objects.insert(id, Registered { object, route });
        Ok(id)
    }

    /// Looks up a registered object.
    #[must_use]
    pub fn lookup(&self, id: ObjectId) -> Option<Registered> {
        self.0.table.read().objects.get(&id).cloned()
    }

    /// Removes an object from the table. Its id is not reused.
    ///
    /// Events for it that arrive later are dropped. Objects registered in a
    /// different context are left alone and yield `None`.
    pub fn unregister(&self, object: &dyn Object) -> Option<Registered> {
        if object.context().as_ref() != Some(self) {
            return None;
        }
        self.unregister_id(object.id()?)
    }

    /// Removes the object registered as `id`.
    pub fn unregister_id(&self, id: ObjectId) -> Option<Registered> {
        let removed = self.0.table.write().objects.remove(&id);
        if let Some(entry) = &removed {
            tracing::trace!(id, interface = entry.object.interface(), "unregistered object");
        }
        removed
    }

    /// The number of registered objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.0.table.read().objects.len()
    }

    /// Sends an encoded request, along with file descriptors.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Closed`] after [`Context::close`], or the error
    /// from writing to the socket.
    pub async fn send(&self, message: &[u8], fds: &[BorrowedFd<'_>]) -> Result<(), SendError> {
        let socket = self.0.send.lock().clone().ok_or(SendError::Closed)?;
        socket.send(message, fds).await
    }

    /// Reads one event and hands it to its target.
    ///
    /// Concurrent calls are served one at a time, in the order they were made.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Closed`] once the context is closed or the
    /// compositor has hung up, and [`DispatchError::Fatal`] once the session
    /// has failed.
    pub async fn dispatch(&self) -> Result<Dispatched, DispatchError> {
        if self.is_closed() {
            return Err(self.stopped());
        }

        let (reply, outcome) = oneshot::channel();
        tokio::select! {
            biased;
            sent = self.0.requests.send(reply) => {
                if sent.is_err() {
                    return Err(self.stopped());
                }
            }
            () = self.0.shutdown.cancelled() => return Err(self.stopped()),
        }

        outcome.await.unwrap_or_else(|_| Err(self.stopped()))
    }

    /// Closes the connection. Pending and later dispatch calls return
    /// [`DispatchError::Closed`]. Closing twice is harmless.
    pub fn close(&self) {
        if !self.0.shutdown.is_cancelled() {
            tracing::debug!("closing context");
        }
        self.0.shutdown.cancel();
        self.0.send.lock().take();
    }

    /// Returns `true` once the session has ended for any reason.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.shutdown.is_cancelled()
    }

    /// The error that ended the session, if it failed.
    #[must_use]
    pub fn session_error(&self) -> Option<SessionError> {
        self.0.session_error.get().cloned()
    }

    fn stopped(&self) -> DispatchError {
        self.session_error()
            .map_or(DispatchError::Closed, DispatchError::Fatal)
    }

    fn fail(&self, error: SessionError) {
        tracing::error!(error = %error, "wayland session failed");
        drop(self.0.session_error.set(error));
        self.close();
    }

    fn deliver(&self, event: &mut Event) -> Result<Dispatched, SessionError> {
        let object_id = event.object_id();
        let opcode = event.opcode();

        let Some(entry) = self.lookup(object_id) else {
            tracing::warn!(object_id, opcode, "dropping event for unknown object");
            return Ok(Dispatched::UnknownObject { object_id, opcode });
        };

        let Route::Handler(handler) = entry.route else {
            tracing::debug!(object_id, opcode, "dropping event for passive object");
            return Ok(Dispatched::NoHandler { object_id, opcode });
        };

        match handler.dispatch(self, event) {
            Ok(()) => Ok(Dispatched::Delivered { object_id, opcode }),
            Err(DecodeMessageError::UnknownOpcode { interface, .. }) => {
                tracing::warn!(object_id, opcode, interface, "dropping event with unknown opcode");
                Ok(Dispatched::UnknownOpcode { object_id, opcode })
            }
            Err(DecodeMessageError::DecodeError(source)) => Err(SessionError::Decode {
                object_id,
                opcode,
                interface: handler.interface(),
                source: Arc::new(source),
            }),
        }
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("objects", &self.object_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Reads events on behalf of queued dispatch calls.
struct Worker {
    context: WeakContext,
    recv: RecvSocket,
    requests: mpsc::Receiver<DispatchReply>,
    shutdown: CancellationToken,
}

enum Stop {
    Clean,
    Fatal(SessionError),
}

impl Worker {
    async fn run(mut self) {
        tracing::debug!("dispatch worker started");

        loop {
            let reply = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(reply) => reply,
                    None => break,
                },
            };

            let read = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    drop(reply.send(Err(DispatchError::Closed)));
                    break;
                }
                read = self.recv.read_event() => read,
            };

            let Some(context) = self.context.upgrade() else {
                drop(reply.send(Err(DispatchError::Closed)));
                break;
            };

            let outcome = match read {
                Ok(mut event) => {
                    let delivered = context.deliver(&mut event);
                    self.recv.reclaim(event);
                    delivered.map_err(Stop::Fatal)
                }
                Err(err) if err.is_clean_shutdown() => Err(Stop::Clean),
                Err(err) => Err(Stop::Fatal(SessionError::Transport(Arc::new(err)))),
            };

            match outcome {
                Ok(dispatched) => {
                    drop(reply.send(Ok(dispatched)));
                }
                Err(Stop::Clean) => {
                    tracing::debug!("compositor closed the connection");
                    context.close();
                    drop(reply.send(Err(DispatchError::Closed)));
                    break;
                }
                Err(Stop::Fatal(error)) => {
                    context.fail(error.clone());
                    drop(reply.send(Err(DispatchError::Fatal(error))));
                    break;
                }
            }
        }

        tracing::debug!("dispatch worker stopped");
    }
}
