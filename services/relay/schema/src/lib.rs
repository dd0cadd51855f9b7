//! sea-orm entities owned by the relay service.

pub mod outbox_messages;
