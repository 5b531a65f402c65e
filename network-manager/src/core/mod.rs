pub mod executor;
pub mod network_state;
pub mod observer;
pub mod source;
