pub mod api_resolver;
pub mod error;
pub mod executor;
pub mod http_client;
pub mod http_errors;
pub mod manager;
pub mod post_process;
pub mod queue_controller;
pub mod resolver;
pub mod store;
pub mod task;
pub mod transport;
