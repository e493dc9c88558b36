//! Connection handlers

pub mod websocket;

pub use websocket::handle_gateway_client;
