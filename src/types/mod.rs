pub mod artifact;
pub mod config;
pub mod request;

pub use artifact::*;
pub use config::*;
pub use request::*;
