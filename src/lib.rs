//! childwin - a minimal X11 client
//!
//! Connects to a display, tiles a 500x500 top-level window with a small
//! background pixmap, optionally registers with the window manager, maps
//! the window and then either reports events or sleeps.
//!
//! ```text
//! childwin                      # event loop on :9
//! childwin --display :0 run --wm --honor-close-request
//! childwin sleep --seconds 30
//! childwin test-display --display 9
//! ```

pub mod app;
pub mod background;
pub mod config;
pub mod error;
pub mod events;
pub mod session;
pub mod test_display;
pub mod window;
pub mod wm;

pub use config::Config;
pub use error::{Error, Result};
