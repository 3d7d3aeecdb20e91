pub mod gateway;
pub mod message;
pub mod queue;
