pub mod apikey;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod pipeline;
pub mod route;
pub mod transformer;

pub use cancel::{CancelHandle, CancelOnDrop, CancelSignal, cancel_pair};
pub use config::{ProviderEntry, ProviderKind, RouterConfig, RouterRules};
pub use error::RouterError;
pub use pipeline::Pipeline;
