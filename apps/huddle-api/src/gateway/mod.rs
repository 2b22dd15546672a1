pub mod channel;
pub mod dispatcher;
pub mod events;
pub mod registry;
pub mod server;
