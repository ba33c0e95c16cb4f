pub mod proxy;
pub mod rate_limit;

pub use proxy::ProxyRotator;
pub use rate_limit::{ConnectionGate, TokenBucket};
