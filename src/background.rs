//! Background tile: a small pixmap used as the window's background

use x11rb::connection::Connection;
use x11rb::protocol::xproto::{
    self, ChangeGCAux, ConnectionExt, CreateGCAux, Gcontext, Pixmap, Rectangle,
};
use x11rb::NONE;

use crate::config::BackgroundStyle;
use crate::error::Result;
use crate::session::ScreenInfo;

/// One full circle in X11 angle units (1/64 degree)
const FULL_CIRCLE: i16 = 360 * 64;

/// Pixmap and graphics context backing the window background.
///
/// Both server resources are freed on drop, including when construction
/// fails half way.
pub struct Background<'c, C: Connection> {
    conn: &'c C,
    pixmap: Pixmap,
    gc: Gcontext,
    size: u16,
}

impl<'c, C: Connection> Background<'c, C> {
    pub fn create(
        conn: &'c C,
        screen: &ScreenInfo,
        size: u16,
        style: BackgroundStyle,
    ) -> Result<Self> {
        let pixmap = conn.generate_id()?;
        conn.create_pixmap(screen.root_depth, pixmap, screen.root, size, size)?;
        let mut background = Self {
            conn,
            pixmap,
            gc: NONE,
            size,
        };

        let gc = conn.generate_id()?;
        conn.create_gc(
            gc,
            pixmap,
            &CreateGCAux::new()
                .foreground(screen.white_pixel)
                .background(screen.black_pixel),
        )?;
        background.gc = gc;

        background.draw(screen, style)?;
        tracing::debug!(pixmap, gc, size, ?style, "background tile ready");
        Ok(background)
    }

    fn draw(&self, screen: &ScreenInfo, style: BackgroundStyle) -> Result<()> {
        let tile = Rectangle {
            x: 0,
            y: 0,
            width: self.size,
            height: self.size,
        };

        match style {
            BackgroundStyle::Solid => {
                self.conn.poly_fill_rectangle(self.pixmap, self.gc, &[tile])?;
            }
            BackgroundStyle::FourArcPattern => {
                self.conn.change_gc(
                    self.gc,
                    &ChangeGCAux::new().foreground(screen.black_pixel),
                )?;
                self.conn.poly_fill_rectangle(self.pixmap, self.gc, &[tile])?;
                self.conn.change_gc(
                    self.gc,
                    &ChangeGCAux::new().foreground(screen.white_pixel),
                )?;
                self.conn
                    .poly_arc(self.pixmap, self.gc, &four_arcs(self.size))?;
            }
        }
        Ok(())
    }

    pub fn pixmap(&self) -> Pixmap {
        self.pixmap
    }

    pub fn gc(&self) -> Gcontext {
        self.gc
    }

    pub fn size(&self) -> u16 {
        self.size
    }
}

impl<C: Connection> Drop for Background<'_, C> {
    fn drop(&mut self) {
        if self.gc != NONE {
            if let Err(e) = self.conn.free_gc(self.gc) {
                tracing::debug!(gc = self.gc, "free_gc failed: {e}");
            }
        }
        if let Err(e) = self.conn.free_pixmap(self.pixmap) {
            tracing::debug!(pixmap = self.pixmap, "free_pixmap failed: {e}");
        }
    }
}

/// Four tile-sized circles centred on the midpoints of the tile edges.
pub fn four_arcs(size: u16) -> [xproto::Arc; 4] {
    let half = (size / 2) as i16;
    let arc = |x, y| xproto::Arc {
        x,
        y,
        width: size,
        height: size,
        angle1: 0,
        angle2: FULL_CIRCLE,
    };
    [arc(-half, 0), arc(half, 0), arc(0, -half), arc(0, half)]
}
