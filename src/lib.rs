//! Per-session H.264 capture, late-join caching, and subscriber fan-out for
//! headless browser streaming.
//!
//! A [`manager::SessionManager`] atomically brings up a display
//! ([`display`]), a browser pointed at it ([`browser`]), and an encoder
//! ([`encoder`]) feeding a [`session::StreamSession`], which segments the
//! encoder's Annex-B byte stream into NAL units ([`nal`]) and fans them out
//! to any number of subscribers with a late-join cache. Transport (HTTP,
//! WebSocket, or anything else a subscriber might ride in on) is left to the
//! embedding application.

pub mod browser;
pub mod config;
pub mod display;
pub mod encoder;
pub mod error;
pub mod log;
pub mod manager;
pub mod nal;
pub mod session;

pub use browser::{Automation, Browser, Launcher};
pub use config::{DisplayPoolConfig, EncoderConfig, StreamConfig};
pub use display::{Display, DisplayAllocator, DisplayPool};
pub use encoder::EncoderSource;
pub use error::{Error, Result};
pub use log::LogConfig;
pub use manager::SessionManager;
pub use nal::Extractor;
pub use session::{StreamSession, Subscription};
