//! MessageBus port adapters: Redis (pub/sub + durable stream mirror) for
//! production, in-memory broadcast for tests and local development.

pub mod memory;
pub mod redis;

pub use memory::InMemoryMessageBus;
pub use redis::RedisMessageBus;
