//! An async Wayland client runtime.
//!
//! [`Context`] connects to a compositor and owns the table of protocol
//! objects. Objects embed a [`Proxy`] and implement [`Object`], plus
//! [`Dispatch`] if they handle events. Each call to [`Context::dispatch`]
//! reads exactly one event and hands it to its target.
//!
//! ```no_run
//! use wl_client::Context;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = Context::connect(None)?;
//! loop {
//!     let dispatched = ctx.dispatch().await?;
//!     println!("{dispatched:?}");
//! }
//! # }
//! ```

pub mod connection;
pub mod context;
pub mod event;
pub mod proxy;

pub use connection::{ConnectionError, DisplayConfig, ReadError, SendError};
pub use context::{
    Context, DispatchError, Dispatched, RegisterError, Registered, Route, SessionError,
    WeakContext,
};
pub use event::Event;
pub use proxy::{DecodeMessageError, Dispatch, Object, Proxy};
pub use wl_core::{
    handler::{ListenerId, Listeners},
    wire::{Fixed, MessageEncoder, serde::ObjectId},
};
