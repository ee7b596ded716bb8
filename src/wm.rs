//! ICCCM window-manager negotiation
//!
//! Names the window, advertises `WM_DELETE_WINDOW` in `WM_PROTOCOLS`, and
//! hands the window manager an initial state and size hints.

use x11rb::connection::Connection;
use x11rb::properties::{WmHints, WmHintsState, WmSizeHints, WmSizeHintsSpecification};
use x11rb::protocol::xproto::{Atom, AtomEnum, PropMode, Window};
use x11rb::wrapper::ConnectionExt as _;

use crate::config::WmConfig;
use crate::error::Result;
use crate::window::Geometry;

x11rb::atom_manager! {
    pub Atoms: AtomsCookie {
        WM_PROTOCOLS,
        WM_DELETE_WINDOW,
    }
}

impl Atoms {
    pub fn intern<C: Connection>(conn: &C) -> Result<Self> {
        let atoms = Self::new(conn)?.reply()?;
        tracing::debug!(
            wm_protocols = atoms.WM_PROTOCOLS,
            wm_delete_window = atoms.WM_DELETE_WINDOW,
            "interned ICCCM atoms"
        );
        Ok(atoms)
    }

    /// A `WM_PROTOCOLS` client message asking the client to close its window.
    pub fn is_delete_request(&self, message_type: Atom, format: u8, data: &[u32]) -> bool {
        message_type == self.WM_PROTOCOLS
            && format == 32
            && data.first() == Some(&self.WM_DELETE_WINDOW)
    }
}

/// `WM_CLASS` value: instance and class, each NUL terminated.
pub fn wm_class(instance: &str, class: &str) -> Vec<u8> {
    let mut value = Vec::with_capacity(instance.len() + class.len() + 2);
    value.extend_from_slice(instance.as_bytes());
    value.push(0);
    value.extend_from_slice(class.as_bytes());
    value.push(0);
    value
}

/// Set the ICCCM properties on `window`.
pub fn register<C: Connection>(
    conn: &C,
    window: Window,
    atoms: &Atoms,
    wm: &WmConfig,
    geometry: Geometry,
) -> Result<()> {
    conn.change_property8(
        PropMode::REPLACE,
        window,
        AtomEnum::WM_NAME,
        AtomEnum::STRING,
        wm.name.as_bytes(),
    )?;
    conn.change_property8(
        PropMode::REPLACE,
        window,
        AtomEnum::WM_ICON_NAME,
        AtomEnum::STRING,
        wm.icon_name.as_bytes(),
    )?;
    conn.change_property8(
        PropMode::REPLACE,
        window,
        AtomEnum::WM_CLASS,
        AtomEnum::STRING,
        &wm_class(&wm.instance, &wm.class),
    )?;
    conn.change_property32(
        PropMode::REPLACE,
        window,
        atoms.WM_PROTOCOLS,
        AtomEnum::ATOM,
        &[atoms.WM_DELETE_WINDOW],
    )?;

    let mut hints = WmHints::new();
    hints.initial_state = Some(WmHintsState::Normal);
    hints.set(conn, window)?;

    let mut size_hints = WmSizeHints::new();
    size_hints.position = Some((
        WmSizeHintsSpecification::ProgramSpecified,
        geometry.x.into(),
        geometry.y.into(),
    ));
    size_hints.size = Some((
        WmSizeHintsSpecification::ProgramSpecified,
        geometry.width.into(),
        geometry.height.into(),
    ));
    size_hints.min_size = Some((wm.min_width, wm.min_height));
    size_hints.set_normal_hints(conn, window)?;

    tracing::info!(window, name = %wm.name, "registered with window manager");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atoms() -> Atoms {
        Atoms {
            WM_PROTOCOLS: 300,
            WM_DELETE_WINDOW: 301,
        }
    }

    #[test]
    fn class_is_two_nul_terminated_strings() {
        assert_eq!(wm_class("childwin", "XlibExample"), b"childwin\0XlibExample\0");
        assert_eq!(wm_class("", ""), b"\0\0");
    }

    #[test]
    fn delete_request_needs_protocols_type_and_format_32() {
        let atoms = atoms();
        assert!(atoms.is_delete_request(300, 32, &[301, 0, 0, 0, 0]));
        assert!(!atoms.is_delete_request(300, 8, &[301, 0, 0, 0, 0]));
        assert!(!atoms.is_delete_request(999, 32, &[301, 0, 0, 0, 0]));
        assert!(!atoms.is_delete_request(300, 32, &[302, 301, 0, 0, 0]));
        assert!(!atoms.is_delete_request(300, 32, &[]));
    }
}
