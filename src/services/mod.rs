pub mod bootstrap;
pub mod probe;
pub mod sender;
