pub mod env;
pub mod store;
pub mod types;

pub use env::EnvSecretProvider;
pub use store::{MemorySecretProvider, SecretError, SecretProvider};
pub use types::DnsCredentials;
