pub mod health;
pub use self::health::health;

pub mod auth;
pub use self::auth::{auth, AuthGateway, AuthHandler, UpstreamAuthHandler};
