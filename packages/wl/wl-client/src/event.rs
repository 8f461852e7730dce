//! A single received message and the file descriptors available to it.

use std::{collections::VecDeque, os::fd::OwnedFd, sync::Arc};

use wl_core::wire::{
    Fixed, MessageDecoder,
    serde::{MessageHeader, ObjectId, SerdeError},
};

use crate::{context::Context, proxy::Object};

/// An event read from the compositor, waiting to be decoded by its target.
///
/// Body fields are read in order through the typed readers. File descriptors
/// are taken with [`Event::read_fd`] in the order they arrived on the
/// connection. The event sees every descriptor received so far and not yet
/// taken, since the kernel may deliver them ahead of the message they belong
/// to. The dispatch worker returns the untaken ones to the connection.
#[derive(Debug)]
pub struct Event {
    header: MessageHeader,
    body: MessageDecoder<Vec<u8>>,
    fds: VecDeque<OwnedFd>,
}

impl Event {
    /// Wraps a received message.
    #[must_use]
    pub fn new(
        header: MessageHeader,
        body: Vec<u8>,
        fds: impl IntoIterator<Item = OwnedFd>,
    ) -> Self {
        Self {
            header,
            body: MessageDecoder::new(body),
            fds: fds.into_iter().collect(),
        }
    }

    /// The object the event is addressed to.
    #[must_use]
    pub const fn object_id(&self) -> ObjectId {
        self.header.object_id
    }

    /// The event's opcode within the target's interface.
    #[must_use]
    pub const fn opcode(&self) -> u16 {
        self.header.opcode
    }

    /// The raw message header.
    #[must_use]
    pub const fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// Body bytes not yet read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.body.remaining()
    }

    /// File descriptors not yet taken.
    #[must_use]
    pub fn pending_fds(&self) -> usize {
        self.fds.len()
    }

    /// # Errors
    ///
    /// Returns [`SerdeError::InvalidSize`] if the body is exhausted.
    pub fn read_u32(&mut self) -> Result<u32, SerdeError> {
        self.body.read_u32()
    }

    /// # Errors
    ///
    /// Returns [`SerdeError::InvalidSize`] if the body is exhausted.
    pub fn read_i32(&mut self) -> Result<i32, SerdeError> {
        self.body.read_i32()
    }

    /// # Errors
    ///
    /// Returns [`SerdeError::InvalidSize`] if the body is exhausted.
    pub fn read_fixed(&mut self) -> Result<Fixed, SerdeError> {
        self.body.read_fixed()
    }

    /// # Errors
    ///
    /// Returns [`SerdeError::InvalidSize`] if the body is exhausted.
    pub fn read_f32(&mut self) -> Result<f32, SerdeError> {
        self.body.read_f32()
    }

    /// # Errors
    ///
    /// Returns an error if the string runs past the body or is not UTF-8.
    pub fn read_string(&mut self) -> Result<String, SerdeError> {
        self.body.read_string()
    }

    /// # Errors
    ///
    /// Returns [`SerdeError::InvalidSize`] if the array runs past the body.
    pub fn read_array(&mut self) -> Result<Vec<i32>, SerdeError> {
        self.body.read_array()
    }

    /// Reads a raw object id, as used for `new_id` arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SerdeError::InvalidSize`] if the body is exhausted.
    pub fn read_object_id(&mut self) -> Result<ObjectId, SerdeError> {
        self.body.read_object_id()
    }

    /// Reads an object reference and resolves it in `ctx`.
    ///
    /// Yields `None` for the null id and for ids that are not registered.
    ///
    /// # Errors
    ///
    /// Returns [`SerdeError::InvalidSize`] if the body is exhausted.
    pub fn read_object(&mut self, ctx: &Context) -> Result<Option<Arc<dyn Object>>, SerdeError> {
        let id = self.read_object_id()?;
        if id == 0 {
            return Ok(None);
        }
        Ok(ctx.lookup(id).map(|entry| entry.object().clone()))
    }

    /// Takes the next file descriptor that arrived with this event.
    ///
    /// # Errors
    ///
    /// Returns [`SerdeError::MissingFileDescriptor`] when none are left.
    pub fn read_fd(&mut self) -> Result<OwnedFd, SerdeError> {
        self.fds
            .pop_front()
            .ok_or(SerdeError::MissingFileDescriptor)
    }

    pub(crate) fn into_fds(self) -> VecDeque<OwnedFd> {
        self.fds
    }
}
