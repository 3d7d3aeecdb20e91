pub mod broker;
pub mod transport;
