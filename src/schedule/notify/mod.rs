pub mod hub;
pub mod webhook;

pub use hub::{NotificationHub, Observer, DEFAULT_OBSERVER_BUFFER};
pub use webhook::HttpCallback;
