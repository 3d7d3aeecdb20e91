pub mod broker_factory;
