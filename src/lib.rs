mod error;

pub mod chat;
pub mod config;
pub mod credential;
pub mod dispatch;
pub mod env;
pub mod logging;
pub mod relay;
pub mod rotation;
pub mod selector;
pub mod service;
pub mod upstream;
pub mod utils;

#[cfg(feature = "server")]
pub mod server;

pub use error::{RelayError, Result};

pub use chat::{ChatRequest, ModelAliases, PreparedChat};
pub use config::{RelayConfig, RotationBackend};
pub use credential::{Credential, KeyPool};
pub use dispatch::{Dispatched, Dispatcher, FailedAttempt, FailureKind};
pub use env::Env;
pub use relay::{RelayEvent, RelayLimits};
pub use rotation::{FileRotationCounter, MemoryRotationCounter, RotationCounter};
pub use selector::{KeySelector, Selection};
pub use service::RelayService;
pub use upstream::GeminiClient;
