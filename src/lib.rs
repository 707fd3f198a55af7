pub mod audio;
pub mod config;
pub mod error;
pub mod net;
pub mod session;
