pub mod broker;
pub mod consumer;
pub mod http;
pub mod pipeline;
pub mod propagation;
pub mod resolver;
pub mod server;

pub use broker::{Broker, Delivery, Receiver};
pub use resolver::{CausalityResolver, Disposition};
pub use server::{run_services, serve};
