pub mod config_provider;
pub mod forwarder;
pub mod http_client;
pub mod monitor;
