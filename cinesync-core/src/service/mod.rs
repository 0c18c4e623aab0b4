pub mod auth;
pub mod catalog;
pub mod encoder;
pub mod state;

pub use auth::AuthStore;
pub use catalog::{StreamEntry, VideoCatalog};
pub use encoder::{Encoder, FfmpegEncoder};
pub use state::{StateCore, StateObserver, TimeReport};
