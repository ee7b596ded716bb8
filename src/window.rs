//! The top-level window

use x11rb::connection::Connection;
use x11rb::protocol::xproto::{
    ConnectionExt, CreateWindowAux, EventMask, Pixmap, Window, WindowClass,
};
use x11rb::COPY_FROM_PARENT;

use crate::config::Config;
use crate::error::Result;
use crate::session::ScreenInfo;

/// Events the window asks for. Nothing outside this mask reaches the loop.
pub fn event_mask() -> EventMask {
    EventMask::STRUCTURE_NOTIFY | EventMask::BUTTON_RELEASE
}

/// Position, size and border of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
    pub border_width: u16,
}

impl Geometry {
    pub fn from_config(config: &Config) -> Self {
        Self {
            x: config.x,
            y: config.y,
            width: config.width,
            height: config.height,
            border_width: config.border_width,
        }
    }
}

/// A child of the root window, destroyed on drop.
pub struct ChildWindow<'c, C: Connection> {
    conn: &'c C,
    id: Window,
    mapped: bool,
    destroyed: bool,
}

impl<'c, C: Connection> ChildWindow<'c, C> {
    /// Create the window unmapped, tiled with `background`.
    pub fn create(
        conn: &'c C,
        screen: &ScreenInfo,
        geometry: Geometry,
        background: Pixmap,
    ) -> Result<Self> {
        let id = conn.generate_id()?;
        let values = CreateWindowAux::new()
            .background_pixmap(background)
            .event_mask(event_mask())
            .colormap(COPY_FROM_PARENT);

        conn.create_window(
            screen.root_depth,
            id,
            screen.root,
            geometry.x,
            geometry.y,
            geometry.width,
            geometry.height,
            geometry.border_width,
            WindowClass::INPUT_OUTPUT,
            COPY_FROM_PARENT,
            &values,
        )?;

        tracing::debug!(window = id, ?geometry, "window created");
        Ok(Self {
            conn,
            id,
            mapped: false,
            destroyed: false,
        })
    }

    /// Make the window visible and push all queued requests to the server.
    pub fn map(&mut self) -> Result<()> {
        self.conn.map_window(self.id)?;
        self.conn.flush()?;
        self.mapped = true;
        tracing::info!(window = self.id, "window mapped");
        Ok(())
    }

    pub fn id(&self) -> Window {
        self.id
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    /// The server already destroyed the window; drop must not name it again.
    pub fn mark_destroyed(&mut self) {
        self.destroyed = true;
        self.mapped = false;
    }
}

impl<C: Connection> Drop for ChildWindow<'_, C> {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        let result = self
            .conn
            .destroy_window(self.id)
            .and_then(|_| self.conn.flush());
        if let Err(e) = result {
            tracing::debug!(window = self.id, "destroy_window failed: {e}");
        }
    }
}
