pub mod client;
pub mod handler;
pub mod server;

pub use client::SupervisorClient;
pub use handler::{RequestHandler, SupervisorHandler};
pub use server::{shutdown_signal, SupervisorServer};
