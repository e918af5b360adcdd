//! Service layer
//!
//! Contains business logic separated from HTTP handlers.
//! Services orchestrate the store, the resolver and delivery.

mod account;
mod note;

pub use account::AccountService;
pub use note::{MAX_NOTE_CHARS, NoteService, PublishNote, WithDelivery};
