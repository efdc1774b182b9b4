pub mod gateway;
pub mod loader;

pub use gateway::{GatewayConfig, HttpConfig, MediaConfig, SipConfig, StreamsConfig, SystemConfig};
pub use loader::{validate_config, ConfigLoader, ENV_PREFIX};
