//! Display connection and screen metadata

use x11rb::connection::Connection;
use x11rb::protocol::xproto::{Screen, Visualid, Window};
use x11rb::rust_connection::RustConnection;

use crate::error::{Error, Result};

/// The parts of the default screen the client needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenInfo {
    pub root: Window,
    pub root_depth: u8,
    pub root_visual: Visualid,
    pub white_pixel: u32,
    pub black_pixel: u32,
    pub width_in_pixels: u16,
    pub height_in_pixels: u16,
}

impl From<&Screen> for ScreenInfo {
    fn from(screen: &Screen) -> Self {
        Self {
            root: screen.root,
            root_depth: screen.root_depth,
            root_visual: screen.root_visual,
            white_pixel: screen.white_pixel,
            black_pixel: screen.black_pixel,
            width_in_pixels: screen.width_in_pixels,
            height_in_pixels: screen.height_in_pixels,
        }
    }
}

/// An open display connection. Dropping it closes the connection.
pub struct Session {
    conn: RustConnection,
    screen_num: usize,
    screen: ScreenInfo,
}

impl Session {
    /// Connect to `display`, or to `$DISPLAY` when `None`.
    pub fn connect(display: Option<&str>) -> Result<Self> {
        let name = display.unwrap_or("$DISPLAY").to_string();
        let (conn, screen_num) = RustConnection::connect(display).map_err(|source| Error::Connect {
            display: name.clone(),
            source,
        })?;

        let screen = conn
            .setup()
            .roots
            .get(screen_num)
            .map(ScreenInfo::from)
            .ok_or(Error::NoSuchScreen(screen_num))?;

        tracing::info!(
            display = %name,
            screen_num,
            root = screen.root,
            depth = screen.root_depth,
            "connected to {}x{} screen",
            screen.width_in_pixels,
            screen.height_in_pixels
        );

        Ok(Self {
            conn,
            screen_num,
            screen,
        })
    }

    pub fn conn(&self) -> &RustConnection {
        &self.conn
    }

    pub fn screen_num(&self) -> usize {
        self.screen_num
    }

    pub fn screen(&self) -> ScreenInfo {
        self.screen
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.conn.flush() {
            tracing::debug!("flush on close failed: {e}");
        }
        tracing::debug!("display connection closed");
    }
}
