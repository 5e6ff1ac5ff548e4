//! Model backends for OpsClaw.
//!
//! All providers implement the `opsclaw_core::Provider` trait.
//! The router selects the correct provider based on configuration.

pub mod capabilities;
pub mod fallback;
pub mod mock;
pub mod openai_compat;
pub mod router;

pub use capabilities::ModelRegistry;
pub use fallback::{CASCADE_PROVIDER, FallbackProvider};
pub use mock::{DEFAULT_MOCK_REPLY, MockProvider};
pub use openai_compat::{Dialect, OpenAiCompatProvider};
pub use router::{NULL_PROVIDER, ProviderRouter, build_from_config};
