// Client-side stack: protocol engine, local chat store, HTTP facade

pub mod engine;
pub mod facade;
pub mod store;

pub use engine::{ClientEngine, ClientError, EngineState};
pub use store::{MessageStore, StorageError, StoredMessage};
