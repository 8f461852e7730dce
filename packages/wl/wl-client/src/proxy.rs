//! Client side protocol objects.
//!
//! Every object embeds a [`Proxy`], which starts out unbound and receives its
//! id and owning context exactly once, when the object is registered. The
//! [`Object`] trait exposes the proxy to the runtime, and objects that decode
//! their own events additionally implement [`Dispatch`].

use std::sync::OnceLock;

use thiserror::Error;
use wl_core::wire::serde::{ObjectId, SerdeError};

use crate::{
    context::{Context, RegisterError, WeakContext},
    event::Event,
};

/// The binding between an object and the context it is registered in.
///
/// The context is held weakly so that objects kept alive by application code
/// do not keep a closed connection alive.
#[derive(Debug, Default)]
pub struct Proxy {
    id: OnceLock<ObjectId>,
    context: OnceLock<WeakContext>,
}

impl Proxy {
    /// Creates an unbound proxy.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            id: OnceLock::new(),
            context: OnceLock::new(),
        }
    }

    /// The id assigned at registration, if registered.
    #[must_use]
    pub fn id(&self) -> Option<ObjectId> {
        self.id.get().copied()
    }

    /// The context this proxy is registered in, while it is still alive.
    #[must_use]
    pub fn context(&self) -> Option<Context> {
        self.context.get().and_then(WeakContext::upgrade)
    }

    /// Returns `true` once the proxy has been registered.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.id.get().is_some()
    }

    /// Binds the proxy to `id` in `context`. A proxy binds only once.
    pub(crate) fn bind(&self, id: ObjectId, context: WeakContext) -> Result<(), RegisterError> {
        if let Err(id) = self.id.set(id) {
            return Err(RegisterError::AlreadyRegistered(
                self.id.get().copied().unwrap_or(id),
            ));
        }
        drop(self.context.set(context));
        Ok(())
    }
}

/// A protocol object that can be registered in a [`Context`].
pub trait Object: Send + Sync + 'static {
    /// The proxy embedded in this object.
    fn proxy(&self) -> &Proxy;

    /// The protocol interface name, e.g. `wl_registry`.
    fn interface(&self) -> &'static str;

    /// Shorthand for [`Proxy::id`].
    fn id(&self) -> Option<ObjectId> {
        self.proxy().id()
    }

    /// Shorthand for [`Proxy::context`].
    fn context(&self) -> Option<Context> {
        self.proxy().context()
    }
}

/// An object that decodes and handles its own events.
pub trait Dispatch: Object {
    /// Handles one event addressed to this object.
    ///
    /// Runs on the dispatch worker with no runtime locks held, so it may
    /// register and unregister objects. It must not block on
    /// [`Context::dispatch`].
    ///
    /// # Errors
    ///
    /// [`DecodeMessageError::UnknownOpcode`] drops the event and keeps the
    /// session running. [`DecodeMessageError::DecodeError`] ends the session.
    fn dispatch(&self, ctx: &Context, event: &mut Event) -> Result<(), DecodeMessageError>;
}

/// An error raised while handling an event.
#[derive(Debug, Error)]
pub enum DecodeMessageError {
    /// The opcode does not name an event of the interface.
    #[error("{interface} has no event with opcode {opcode}")]
    UnknownOpcode {
        /// Interface of the handling object.
        interface: &'static str,
        /// The unrecognized opcode.
        opcode: u16,
    },
    /// The event body did not match the event's signature.
    #[error(transparent)]
    DecodeError(#[from] SerdeError),
}
