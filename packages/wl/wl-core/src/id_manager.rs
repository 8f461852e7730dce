//! Allocation of client side object ids.
//!
//! Ids are handed out in strictly increasing order starting at
//! [`CLIENT_MIN_ID`], which always belongs to the display object. An id is
//! never handed out twice within a session, even after the object owning it
//! is destroyed.
//!
//! The allocator itself is not synchronized. It is meant to live inside the
//! lock that guards the object table, so that allocating an id and inserting
//! the object are one atomic step.
//!
//! # Example
//!
//! ```
//! use wl_core::id_manager::IdManager;
//!
//! let mut ids = IdManager::new();
//! let display = ids.alloc_id().unwrap();
//! let registry = ids.alloc_id().unwrap();
//! assert_eq!(display, 1);
//! assert!(registry > display);
//! ```

use thiserror::Error;

use crate::wire::serde::ObjectId;

/// The first id in the client range. Reserved for the display object.
pub const CLIENT_MIN_ID: ObjectId = 0x0000_0001;
/// The last id in the client range. Ids above it belong to the server.
pub const CLIENT_MAX_ID: ObjectId = 0xfeff_ffff;

/// A monotonic allocator for client object ids.
#[derive(Debug, Clone)]
pub struct IdManager {
    next: ObjectId,
}

impl IdManager {
    /// Creates a new `IdManager`.
    ///
    /// The first id allocated will be [`CLIENT_MIN_ID`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: CLIENT_MIN_ID,
        }
    }

    /// Peeks at the next id without allocating it.
    ///
    /// # Errors
    ///
    /// This function will return an error if all client ids have been exhausted.
    pub const fn peek_next_id(&self) -> Result<ObjectId, IdManagerError> {
        if self.next > CLIENT_MAX_ID {
            return Err(IdManagerError::OutOfClientIds(self.next));
        }
        Ok(self.next)
    }

    /// Allocates the next id.
    ///
    /// # Errors
    ///
    /// This function will return an error if all client ids have been exhausted.
    pub const fn alloc_id(&mut self) -> Result<ObjectId, IdManagerError> {
        match self.peek_next_id() {
            Ok(id) => {
                self.next = id + 1;
                Ok(id)
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for IdManager {
    fn default() -> Self {
        Self::new()
    }
}

/// An error that may occur when allocating a new client id.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdManagerError {
    /// All client ids have been exhausted
    #[error(
        "All client IDs have been exhausted (ID {0} is out of the range of {CLIENT_MIN_ID} - {CLIENT_MAX_ID})"
    )]
    OutOfClientIds(ObjectId),
}
