//! Simulated X11 display server
//!
//! Speaks the slice of the core protocol a simple client needs (windows,
//! pixmaps, GCs, fills, arcs, atoms, properties, SendEvent), keeps the
//! resulting server state inspectable, and routes events between
//! connections so a second client can inject synthetic events.
//!
//! Only little-endian clients are accepted and no extensions are offered.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, Mutex};

#[cfg(unix)]
use tokio::net::UnixListener;

const X11_UNIX_DIR: &str = "/tmp/.X11-unix";
const X11_TCP_BASE: u16 = 6000;

pub const ROOT_WINDOW: u32 = 1;
pub const ROOT_DEPTH: u8 = 24;
pub const WHITE_PIXEL: u32 = 0x00ff_ffff;
pub const BLACK_PIXEL: u32 = 0;

const DEFAULT_COLORMAP: u32 = 0x20;
const ROOT_VISUAL: u32 = 0x21;
const RESOURCE_ID_MASK: u32 = 0x001f_ffff;
const VENDOR: &[u8] = b"childwin-test";

const STRUCTURE_NOTIFY_MASK: u32 = 0x0002_0000;

/// Predefined atoms a client may use without interning
const PREDEFINED_ATOMS: &[(&str, u32)] = &[
    ("ATOM", 4),
    ("CARDINAL", 6),
    ("INTEGER", 19),
    ("PIXMAP", 20),
    ("STRING", 31),
    ("WINDOW", 33),
    ("WM_HINTS", 35),
    ("WM_ICON_NAME", 37),
    ("WM_NAME", 39),
    ("WM_NORMAL_HINTS", 40),
    ("WM_SIZE_HINTS", 41),
    ("WM_CLASS", 67),
];
const FIRST_CLIENT_ATOM: u32 = 69;

pub mod opcode {
    pub const CREATE_WINDOW: u8 = 1;
    pub const CHANGE_WINDOW_ATTRIBUTES: u8 = 2;
    pub const GET_WINDOW_ATTRIBUTES: u8 = 3;
    pub const DESTROY_WINDOW: u8 = 4;
    pub const MAP_WINDOW: u8 = 8;
    pub const UNMAP_WINDOW: u8 = 10;
    pub const CONFIGURE_WINDOW: u8 = 12;
    pub const GET_GEOMETRY: u8 = 14;
    pub const QUERY_TREE: u8 = 15;
    pub const INTERN_ATOM: u8 = 16;
    pub const GET_ATOM_NAME: u8 = 17;
    pub const CHANGE_PROPERTY: u8 = 18;
    pub const DELETE_PROPERTY: u8 = 19;
    pub const GET_PROPERTY: u8 = 20;
    pub const SEND_EVENT: u8 = 25;
    pub const GET_INPUT_FOCUS: u8 = 43;
    pub const CREATE_PIXMAP: u8 = 53;
    pub const FREE_PIXMAP: u8 = 54;
    pub const CREATE_GC: u8 = 55;
    pub const CHANGE_GC: u8 = 56;
    pub const FREE_GC: u8 = 60;
    pub const POLY_ARC: u8 = 68;
    pub const POLY_FILL_RECTANGLE: u8 = 70;
    pub const QUERY_EXTENSION: u8 = 98;
}

mod error_code {
    pub const BAD_WINDOW: u8 = 3;
    pub const BAD_PIXMAP: u8 = 4;
    pub const BAD_ATOM: u8 = 5;
    pub const BAD_DRAWABLE: u8 = 9;
    pub const BAD_GC: u8 = 13;
    pub const BAD_LENGTH: u8 = 16;
    pub const BAD_IMPLEMENTATION: u8 = 17;
}

const DESTROY_NOTIFY: u8 = 17;
const MAP_NOTIFY: u8 = 19;

/// A window property as last written by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub type_: u32,
    pub format: u8,
    pub data: Vec<u8>,
}

impl Property {
    /// The value as 32-bit items (format 32 properties).
    pub fn as_u32s(&self) -> Vec<u32> {
        self.data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRecord {
    pub owner: u32,
    pub parent: u32,
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
    pub border_width: u16,
    pub depth: u8,
    pub mapped: bool,
    pub event_mask: u32,
    pub background_pixmap: Option<u32>,
    pub properties: HashMap<u32, Property>,
}

/// A drawing request applied to a pixmap, with the GC foreground in effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOp {
    FillRectangle {
        foreground: u32,
        x: i16,
        y: i16,
        width: u16,
        height: u16,
    },
    Arc {
        foreground: u32,
        x: i16,
        y: i16,
        width: u16,
        height: u16,
        angle1: i16,
        angle2: i16,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixmapRecord {
    pub owner: u32,
    pub depth: u8,
    pub width: u16,
    pub height: u16,
    pub ops: Vec<DrawOp>,
}

#[derive(Debug, Clone, Copy)]
struct GcRecord {
    owner: u32,
    foreground: u32,
}

/// An X error the server sent back to a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolError {
    pub client: u32,
    pub code: u8,
    pub bad_value: u32,
    pub major: u8,
}

struct ClientRecord {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    sequence: u16,
}

/// Server-side state shared by every connection
pub struct DisplayState {
    width: u16,
    height: u16,
    windows: HashMap<u32, WindowRecord>,
    pixmaps: HashMap<u32, PixmapRecord>,
    gcs: HashMap<u32, GcRecord>,
    atoms: HashMap<String, u32>,
    next_atom: u32,
    clients: HashMap<u32, ClientRecord>,
    next_client: u32,
    errors: Vec<ProtocolError>,
}

impl DisplayState {
    pub fn new(width: u16, height: u16) -> Self {
        let mut windows = HashMap::new();
        windows.insert(
            ROOT_WINDOW,
            WindowRecord {
                owner: u32::MAX,
                parent: 0,
                x: 0,
                y: 0,
                width,
                height,
                border_width: 0,
                depth: ROOT_DEPTH,
                mapped: true,
                event_mask: 0,
                background_pixmap: None,
                properties: HashMap::new(),
            },
        );
        let atoms = PREDEFINED_ATOMS
            .iter()
            .map(|&(name, id)| (name.to_string(), id))
            .collect();

        Self {
            width,
            height,
            windows,
            pixmaps: HashMap::new(),
            gcs: HashMap::new(),
            atoms,
            next_atom: FIRST_CLIENT_ATOM,
            clients: HashMap::new(),
            next_client: 0,
            errors: Vec::new(),
        }
    }

    pub fn window(&self, id: u32) -> Option<&WindowRecord> {
        self.windows.get(&id)
    }

    pub fn pixmap(&self, id: u32) -> Option<&PixmapRecord> {
        self.pixmaps.get(&id)
    }

    /// Children of the root, lowest id first
    pub fn top_level_windows(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .windows
            .iter()
            .filter(|(_, w)| w.parent == ROOT_WINDOW)
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn atom(&self, name: &str) -> Option<u32> {
        self.atoms.get(name).copied()
    }

    /// Every error sent so far, oldest first
    pub fn errors(&self) -> &[ProtocolError] {
        &self.errors
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn register_client(&mut self, tx: mpsc::UnboundedSender<Vec<u8>>) -> u32 {
        let id = self.next_client;
        self.next_client += 1;
        self.clients.insert(id, ClientRecord { tx, sequence: 0 });
        id
    }

    /// Forget a client and every resource it created.
    fn remove_client(&mut self, id: u32) {
        self.clients.remove(&id);
        self.windows.retain(|_, w| w.owner != id);
        self.pixmaps.retain(|_, p| p.owner != id);
        self.gcs.retain(|_, g| g.owner != id);
    }

    fn send(&self, client: u32, bytes: Vec<u8>) {
        if let Some(record) = self.clients.get(&client) {
            let _ = record.tx.send(bytes);
        }
    }

    /// Queue an event for `client`, stamped with its latest sequence number.
    fn post_event(&self, client: u32, mut event: [u8; 32]) {
        if let Some(record) = self.clients.get(&client) {
            event[2..4].copy_from_slice(&record.sequence.to_le_bytes());
            let _ = record.tx.send(event.to_vec());
        }
    }

    fn structure_notify(&self, window: u32, code: u8) {
        let Some(record) = self.windows.get(&window) else {
            return;
        };
        if record.event_mask & STRUCTURE_NOTIFY_MASK == 0 {
            return;
        }
        let mut event = [0u8; 32];
        event[0] = code;
        event[4..8].copy_from_slice(&window.to_le_bytes());
        event[8..12].copy_from_slice(&window.to_le_bytes());
        self.post_event(record.owner, event);
    }

    fn is_drawable(&self, id: u32) -> bool {
        self.windows.contains_key(&id) || self.pixmaps.contains_key(&id)
    }
}

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn i16_at(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn pad4(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

/// Walk an X11 value list: `(bit, value)` for every bit set in `mask`.
fn value_list(mask: u32, values: &[u8]) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    let mut offset = 0;
    for bit in 0..32 {
        if mask & (1 << bit) == 0 {
            continue;
        }
        if offset + 4 > values.len() {
            break;
        }
        out.push((bit, u32_at(values, offset)));
        offset += 4;
    }
    out
}

fn setup_reply(resource_id_base: u32, width: u16, height: u16) -> Vec<u8> {
    let vendor_len = VENDOR.len();
    let vendor_pad = pad4(vendor_len);
    let num_formats = 1u8;
    let format_size = 8;
    let screen_size = 40;
    let depth_size = 8 + 24;
    let fixed_size = 32;
    let additional_data_len =
        fixed_size + vendor_len + vendor_pad + format_size + screen_size + depth_size;
    let additional_words = additional_data_len / 4;

    let mut reply = Vec::with_capacity(8 + additional_data_len);
    reply.push(1); // success
    reply.push(0);
    reply.extend_from_slice(&11u16.to_le_bytes());
    reply.extend_from_slice(&0u16.to_le_bytes());
    reply.extend_from_slice(&(additional_words as u16).to_le_bytes());

    reply.extend_from_slice(&0u32.to_le_bytes()); // release
    reply.extend_from_slice(&resource_id_base.to_le_bytes());
    reply.extend_from_slice(&RESOURCE_ID_MASK.to_le_bytes());
    reply.extend_from_slice(&0u32.to_le_bytes()); // motion buffer
    reply.extend_from_slice(&(vendor_len as u16).to_le_bytes());
    reply.extend_from_slice(&0xffffu16.to_le_bytes()); // max request length
    reply.push(1); // screens
    reply.push(num_formats);
    reply.push(0); // image byte order: LSB first
    reply.push(0); // bitmap bit order
    reply.push(8); // scanline unit
    reply.push(32); // scanline pad
    reply.push(8); // min keycode
    reply.push(255); // max keycode
    reply.extend_from_slice(&[0u8; 4]);

    reply.extend_from_slice(VENDOR);
    reply.extend(std::iter::repeat(0).take(vendor_pad));

    // pixmap format
    reply.push(ROOT_DEPTH);
    reply.push(32);
    reply.push(32);
    reply.extend_from_slice(&[0u8; 5]);

    // screen
    reply.extend_from_slice(&ROOT_WINDOW.to_le_bytes());
    reply.extend_from_slice(&DEFAULT_COLORMAP.to_le_bytes());
    reply.extend_from_slice(&WHITE_PIXEL.to_le_bytes());
    reply.extend_from_slice(&BLACK_PIXEL.to_le_bytes());
    reply.extend_from_slice(&0u32.to_le_bytes()); // current input masks
    reply.extend_from_slice(&width.to_le_bytes());
    reply.extend_from_slice(&height.to_le_bytes());
    reply.extend_from_slice(&(width / 4).to_le_bytes());
    reply.extend_from_slice(&(height / 4).to_le_bytes());
    reply.extend_from_slice(&1u16.to_le_bytes()); // min installed maps
    reply.extend_from_slice(&1u16.to_le_bytes()); // max installed maps
    reply.extend_from_slice(&ROOT_VISUAL.to_le_bytes());
    reply.push(0); // backing stores
    reply.push(1); // save unders
    reply.push(ROOT_DEPTH);
    reply.push(1); // allowed depths

    // depth
    reply.push(ROOT_DEPTH);
    reply.push(0);
    reply.extend_from_slice(&1u16.to_le_bytes());
    reply.extend_from_slice(&[0u8; 4]);

    // visual
    reply.extend_from_slice(&ROOT_VISUAL.to_le_bytes());
    reply.push(4); // TrueColor
    reply.push(8);
    reply.extend_from_slice(&256u16.to_le_bytes());
    reply.extend_from_slice(&0x00ff0000u32.to_le_bytes());
    reply.extend_from_slice(&0x0000ff00u32.to_le_bytes());
    reply.extend_from_slice(&0x000000ffu32.to_le_bytes());
    reply.extend_from_slice(&[0u8; 4]);

    reply
}

/// Per-connection protocol state
struct ClientHandler {
    id: u32,
    sequence: u16,
}

impl ClientHandler {
    fn new(id: u32) -> Self {
        Self { id, sequence: 0 }
    }

    fn resource_id_base(&self) -> u32 {
        (self.id + 1) << 21
    }

    fn reply(&self, data_byte: u8, extra_words: u32) -> Vec<u8> {
        let mut reply = vec![1u8, data_byte];
        reply.extend_from_slice(&self.sequence.to_le_bytes());
        reply.extend_from_slice(&extra_words.to_le_bytes());
        reply
    }

    fn error(&self, state: &mut DisplayState, code: u8, bad_value: u32, major: u8) {
        tracing::debug!(client = self.id, code, bad_value, major, "sending error");
        state.errors.push(ProtocolError {
            client: self.id,
            code,
            bad_value,
            major,
        });
        let mut error = vec![0u8, code];
        error.extend_from_slice(&self.sequence.to_le_bytes());
        error.extend_from_slice(&bad_value.to_le_bytes());
        error.extend_from_slice(&0u16.to_le_bytes()); // minor opcode
        error.push(major);
        error.extend_from_slice(&[0u8; 21]);
        state.send(self.id, error);
    }

    fn process(&mut self, state: &mut DisplayState, data: &[u8]) {
        self.sequence = self.sequence.wrapping_add(1);
        if let Some(record) = state.clients.get_mut(&self.id) {
            record.sequence = self.sequence;
        }

        let op = data[0];
        if data.len() < min_request_len(op) {
            return self.error(state, error_code::BAD_LENGTH, 0, op);
        }
        match op {
            opcode::CREATE_WINDOW => self.create_window(state, data),
            opcode::CHANGE_WINDOW_ATTRIBUTES => self.change_window_attributes(state, data),
            opcode::GET_WINDOW_ATTRIBUTES => self.get_window_attributes(state, data),
            opcode::DESTROY_WINDOW => self.destroy_window(state, data),
            opcode::MAP_WINDOW => self.map_window(state, data),
            opcode::UNMAP_WINDOW => self.unmap_window(state, data),
            opcode::CONFIGURE_WINDOW => self.configure_window(state, data),
            opcode::GET_GEOMETRY => self.get_geometry(state, data),
            opcode::QUERY_TREE => self.query_tree(state, data),
            opcode::INTERN_ATOM => self.intern_atom(state, data),
            opcode::GET_ATOM_NAME => self.get_atom_name(state, data),
            opcode::CHANGE_PROPERTY => self.change_property(state, data),
            opcode::DELETE_PROPERTY => self.delete_property(state, data),
            opcode::GET_PROPERTY => self.get_property(state, data),
            opcode::SEND_EVENT => self.send_event(state, data),
            opcode::GET_INPUT_FOCUS => self.get_input_focus(state),
            opcode::CREATE_PIXMAP => self.create_pixmap(state, data),
            opcode::FREE_PIXMAP => self.free_pixmap(state, data),
            opcode::CREATE_GC => self.create_gc(state, data),
            opcode::CHANGE_GC => self.change_gc(state, data),
            opcode::FREE_GC => self.free_gc(state, data),
            opcode::POLY_ARC => self.poly_arc(state, data),
            opcode::POLY_FILL_RECTANGLE => self.poly_fill_rectangle(state, data),
            opcode::QUERY_EXTENSION => self.query_extension(state, data),
            _ => {
                tracing::warn!(client = self.id, opcode = op, len = data.len(), "unhandled opcode");
                self.error(state, error_code::BAD_IMPLEMENTATION, 0, op);
            }
        }
    }

    fn create_window(&mut self, state: &mut DisplayState, data: &[u8]) {
        if data.len() < 32 {
            return self.error(state, error_code::BAD_LENGTH, 0, opcode::CREATE_WINDOW);
        }
        let depth = data[1];
        let wid = u32_at(data, 4);
        let parent = u32_at(data, 8);
        let Some(parent_depth) = state.windows.get(&parent).map(|w| w.depth) else {
            return self.error(state, error_code::BAD_WINDOW, parent, opcode::CREATE_WINDOW);
        };

        let mut window = WindowRecord {
            owner: self.id,
            parent,
            x: i16_at(data, 12),
            y: i16_at(data, 14),
            width: u16_at(data, 16),
            height: u16_at(data, 18),
            border_width: u16_at(data, 20),
            depth: if depth == 0 { parent_depth } else { depth },
            mapped: false,
            event_mask: 0,
            background_pixmap: None,
            properties: HashMap::new(),
        };
        apply_window_values(&mut window, u32_at(data, 28), &data[32..]);

        tracing::debug!(client = self.id, wid, parent, ?window, "create window");
        state.windows.insert(wid, window);
    }

    fn change_window_attributes(&mut self, state: &mut DisplayState, data: &[u8]) {
        if data.len() < 12 {
            return self.error(state, error_code::BAD_LENGTH, 0, opcode::CHANGE_WINDOW_ATTRIBUTES);
        }
        let wid = u32_at(data, 4);
        match state.windows.get_mut(&wid) {
            Some(window) => apply_window_values(window, u32_at(data, 8), &data[12..]),
            None => self.error(state, error_code::BAD_WINDOW, wid, opcode::CHANGE_WINDOW_ATTRIBUTES),
        }
    }

    fn get_window_attributes(&mut self, state: &mut DisplayState, data: &[u8]) {
        let wid = u32_at(data, 4);
        let Some(window) = state.windows.get(&wid) else {
            return self.error(state, error_code::BAD_WINDOW, wid, opcode::GET_WINDOW_ATTRIBUTES);
        };
        let map_state = if !window.mapped {
            0 // Unmapped
        } else if is_viewable(state, wid) {
            2 // Viewable
        } else {
            1 // Unviewable
        };

        let mut reply = self.reply(0, 3); // backing-store NotUseful
        reply.extend_from_slice(&ROOT_VISUAL.to_le_bytes());
        reply.extend_from_slice(&1u16.to_le_bytes()); // InputOutput
        reply.push(0); // bit-gravity
        reply.push(1); // win-gravity NorthWest
        reply.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // backing-planes
        reply.extend_from_slice(&0u32.to_le_bytes()); // backing-pixel
        reply.push(0); // save-under
        reply.push(1); // map-is-installed
        reply.push(map_state);
        reply.push(0); // override-redirect
        reply.extend_from_slice(&DEFAULT_COLORMAP.to_le_bytes());
        reply.extend_from_slice(&window.event_mask.to_le_bytes()); // all-event-masks
        let your_mask = if window.owner == self.id {
            window.event_mask
        } else {
            0
        };
        reply.extend_from_slice(&your_mask.to_le_bytes());
        reply.extend_from_slice(&0u16.to_le_bytes()); // do-not-propagate-mask
        reply.extend_from_slice(&[0u8; 2]);
        state.send(self.id, reply);
    }

    fn destroy_window(&mut self, state: &mut DisplayState, data: &[u8]) {
        let wid = u32_at(data, 4);
        if wid == ROOT_WINDOW {
            return;
        }
        if !state.windows.contains_key(&wid) {
            return self.error(state, error_code::BAD_WINDOW, wid, opcode::DESTROY_WINDOW);
        }

        // children first, as the server would report them
        let mut doomed = vec![wid];
        let mut i = 0;
        while i < doomed.len() {
            let parent = doomed[i];
            doomed.extend(
                state
                    .windows
                    .iter()
                    .filter(|(_, w)| w.parent == parent)
                    .map(|(&id, _)| id),
            );
            i += 1;
        }
        for id in doomed.into_iter().rev() {
            state.structure_notify(id, DESTROY_NOTIFY);
            state.windows.remove(&id);
        }
        tracing::debug!(client = self.id, wid, "destroy window");
    }

    fn map_window(&mut self, state: &mut DisplayState, data: &[u8]) {
        let wid = u32_at(data, 4);
        match state.windows.get_mut(&wid) {
            Some(window) if window.mapped => {}
            Some(window) => {
                window.mapped = true;
                state.structure_notify(wid, MAP_NOTIFY);
                tracing::debug!(client = self.id, wid, "map window");
            }
            None => self.error(state, error_code::BAD_WINDOW, wid, opcode::MAP_WINDOW),
        }
    }

    fn unmap_window(&mut self, state: &mut DisplayState, data: &[u8]) {
        let wid = u32_at(data, 4);
        match state.windows.get_mut(&wid) {
            Some(window) => window.mapped = false,
            None => self.error(state, error_code::BAD_WINDOW, wid, opcode::UNMAP_WINDOW),
        }
    }

    fn configure_window(&mut self, state: &mut DisplayState, data: &[u8]) {
        if data.len() < 12 {
            return self.error(state, error_code::BAD_LENGTH, 0, opcode::CONFIGURE_WINDOW);
        }
        let wid = u32_at(data, 4);
        let mask = u16_at(data, 8) as u32;
        let Some(window) = state.windows.get_mut(&wid) else {
            return self.error(state, error_code::BAD_WINDOW, wid, opcode::CONFIGURE_WINDOW);
        };
        for (bit, value) in value_list(mask, &data[12..]) {
            match bit {
                0 => window.x = value as i16,
                1 => window.y = value as i16,
                2 => window.width = value as u16,
                3 => window.height = value as u16,
                4 => window.border_width = value as u16,
                _ => {}
            }
        }
    }

    fn get_geometry(&mut self, state: &mut DisplayState, data: &[u8]) {
        let drawable = u32_at(data, 4);
        let geometry = if let Some(w) = state.windows.get(&drawable) {
            (w.depth, w.x, w.y, w.width, w.height, w.border_width)
        } else if let Some(p) = state.pixmaps.get(&drawable) {
            (p.depth, 0, 0, p.width, p.height, 0)
        } else {
            return self.error(state, error_code::BAD_DRAWABLE, drawable, opcode::GET_GEOMETRY);
        };
        let (depth, x, y, width, height, border_width) = geometry;

        let mut reply = self.reply(depth, 0);
        reply.extend_from_slice(&ROOT_WINDOW.to_le_bytes());
        reply.extend_from_slice(&x.to_le_bytes());
        reply.extend_from_slice(&y.to_le_bytes());
        reply.extend_from_slice(&width.to_le_bytes());
        reply.extend_from_slice(&height.to_le_bytes());
        reply.extend_from_slice(&border_width.to_le_bytes());
        reply.extend_from_slice(&[0u8; 10]);
        state.send(self.id, reply);
    }

    fn query_tree(&mut self, state: &mut DisplayState, data: &[u8]) {
        let wid = u32_at(data, 4);
        let Some(parent) = state.windows.get(&wid).map(|w| w.parent) else {
            return self.error(state, error_code::BAD_WINDOW, wid, opcode::QUERY_TREE);
        };
        let mut children: Vec<u32> = state
            .windows
            .iter()
            .filter(|(_, w)| w.parent == wid)
            .map(|(&id, _)| id)
            .collect();
        children.sort_unstable();

        let mut reply = self.reply(0, children.len() as u32);
        reply.extend_from_slice(&ROOT_WINDOW.to_le_bytes());
        reply.extend_from_slice(&parent.to_le_bytes());
        reply.extend_from_slice(&(children.len() as u16).to_le_bytes());
        reply.extend_from_slice(&[0u8; 14]);
        for child in children {
            reply.extend_from_slice(&child.to_le_bytes());
        }
        state.send(self.id, reply);
    }

    fn intern_atom(&mut self, state: &mut DisplayState, data: &[u8]) {
        let only_if_exists = data[1] != 0;
        let name_len = u16_at(data, 4) as usize;
        if data.len() < 8 + name_len {
            return self.error(state, error_code::BAD_LENGTH, 0, opcode::INTERN_ATOM);
        }
        let name = String::from_utf8_lossy(&data[8..8 + name_len]).to_string();

        let atom = if let Some(&id) = state.atoms.get(&name) {
            id
        } else if only_if_exists {
            0
        } else {
            let id = state.next_atom;
            state.next_atom += 1;
            state.atoms.insert(name.clone(), id);
            id
        };
        tracing::trace!(client = self.id, %name, atom, "intern atom");

        let mut reply = self.reply(0, 0);
        reply.extend_from_slice(&atom.to_le_bytes());
        reply.extend_from_slice(&[0u8; 20]);
        state.send(self.id, reply);
    }

    fn get_atom_name(&mut self, state: &mut DisplayState, data: &[u8]) {
        let atom = u32_at(data, 4);
        let Some(name) = state
            .atoms
            .iter()
            .find(|(_, v)| **v == atom)
            .map(|(k, _)| k.clone())
        else {
            return self.error(state, error_code::BAD_ATOM, atom, opcode::GET_ATOM_NAME);
        };
        let pad = pad4(name.len());

        let mut reply = self.reply(0, ((name.len() + pad) / 4) as u32);
        reply.extend_from_slice(&(name.len() as u16).to_le_bytes());
        reply.extend_from_slice(&[0u8; 22]);
        reply.extend_from_slice(name.as_bytes());
        reply.extend(std::iter::repeat(0).take(pad));
        state.send(self.id, reply);
    }

    fn change_property(&mut self, state: &mut DisplayState, data: &[u8]) {
        if data.len() < 24 {
            return self.error(state, error_code::BAD_LENGTH, 0, opcode::CHANGE_PROPERTY);
        }
        let mode = data[1];
        let wid = u32_at(data, 4);
        let property = u32_at(data, 8);
        let type_ = u32_at(data, 12);
        let format = data[16];
        let units = u32_at(data, 20) as usize;
        let byte_len = units * (format as usize / 8);
        if data.len() < 24 + byte_len {
            return self.error(state, error_code::BAD_LENGTH, 0, opcode::CHANGE_PROPERTY);
        }
        let value = &data[24..24 + byte_len];

        let Some(window) = state.windows.get_mut(&wid) else {
            return self.error(state, error_code::BAD_WINDOW, wid, opcode::CHANGE_PROPERTY);
        };
        let entry = window.properties.entry(property).or_insert_with(|| Property {
            type_,
            format,
            data: Vec::new(),
        });
        entry.type_ = type_;
        entry.format = format;
        match mode {
            1 => {
                let mut data = value.to_vec();
                data.extend_from_slice(&entry.data);
                entry.data = data;
            }
            2 => entry.data.extend_from_slice(value),
            _ => entry.data = value.to_vec(),
        }
        tracing::trace!(client = self.id, wid, property, type_, format, len = byte_len, "change property");
    }

    fn delete_property(&mut self, state: &mut DisplayState, data: &[u8]) {
        let wid = u32_at(data, 4);
        let property = u32_at(data, 8);
        match state.windows.get_mut(&wid) {
            Some(window) => {
                window.properties.remove(&property);
            }
            None => self.error(state, error_code::BAD_WINDOW, wid, opcode::DELETE_PROPERTY),
        }
    }

    fn get_property(&mut self, state: &mut DisplayState, data: &[u8]) {
        if data.len() < 24 {
            return self.error(state, error_code::BAD_LENGTH, 0, opcode::GET_PROPERTY);
        }
        let wid = u32_at(data, 4);
        let property = u32_at(data, 8);
        let requested_type = u32_at(data, 12);
        let long_offset = u32_at(data, 16) as usize;
        let long_length = u32_at(data, 20) as usize;

        let Some(window) = state.windows.get(&wid) else {
            return self.error(state, error_code::BAD_WINDOW, wid, opcode::GET_PROPERTY);
        };

        let reply = match window.properties.get(&property) {
            None => {
                let mut reply = self.reply(0, 0);
                reply.extend_from_slice(&[0u8; 24]);
                reply
            }
            Some(prop) if requested_type != 0 && requested_type != prop.type_ => {
                let mut reply = self.reply(prop.format, 0);
                reply.extend_from_slice(&prop.type_.to_le_bytes());
                reply.extend_from_slice(&(prop.data.len() as u32).to_le_bytes());
                reply.extend_from_slice(&0u32.to_le_bytes());
                reply.extend_from_slice(&[0u8; 12]);
                reply
            }
            Some(prop) => {
                let start = (long_offset * 4).min(prop.data.len());
                let end = start
                    .saturating_add(long_length.saturating_mul(4))
                    .min(prop.data.len());
                let value = &prop.data[start..end];
                let unit = (prop.format as usize / 8).max(1);
                let pad = pad4(value.len());

                let mut reply = self.reply(prop.format, ((value.len() + pad) / 4) as u32);
                reply.extend_from_slice(&prop.type_.to_le_bytes());
                reply.extend_from_slice(&((prop.data.len() - end) as u32).to_le_bytes());
                reply.extend_from_slice(&((value.len() / unit) as u32).to_le_bytes());
                reply.extend_from_slice(&[0u8; 12]);
                reply.extend_from_slice(value);
                reply.extend(std::iter::repeat(0).take(pad));
                reply
            }
        };
        state.send(self.id, reply);
    }

    fn send_event(&mut self, state: &mut DisplayState, data: &[u8]) {
        if data.len() < 44 {
            return self.error(state, error_code::BAD_LENGTH, 0, opcode::SEND_EVENT);
        }
        let destination = u32_at(data, 4);
        let event_mask = u32_at(data, 8);
        let Some(window) = state.windows.get(&destination) else {
            return self.error(state, error_code::BAD_WINDOW, destination, opcode::SEND_EVENT);
        };

        // empty mask: the creator of the window; otherwise whoever selected it
        let recipient = if event_mask == 0 || window.event_mask & event_mask != 0 {
            Some(window.owner)
        } else {
            None
        };

        let mut event = [0u8; 32];
        event.copy_from_slice(&data[12..44]);
        event[0] |= 0x80; // synthetic

        tracing::debug!(
            client = self.id,
            destination,
            event_mask,
            code = event[0] & 0x7f,
            ?recipient,
            "send event"
        );
        if let Some(owner) = recipient {
            state.post_event(owner, event);
        }
    }

    fn get_input_focus(&mut self, state: &mut DisplayState) {
        let mut reply = self.reply(1, 0); // revert-to PointerRoot
        reply.extend_from_slice(&ROOT_WINDOW.to_le_bytes());
        reply.extend_from_slice(&[0u8; 20]);
        state.send(self.id, reply);
    }

    fn create_pixmap(&mut self, state: &mut DisplayState, data: &[u8]) {
        if data.len() < 16 {
            return self.error(state, error_code::BAD_LENGTH, 0, opcode::CREATE_PIXMAP);
        }
        let pid = u32_at(data, 4);
        let drawable = u32_at(data, 8);
        if !state.is_drawable(drawable) {
            return self.error(state, error_code::BAD_DRAWABLE, drawable, opcode::CREATE_PIXMAP);
        }
        let pixmap = PixmapRecord {
            owner: self.id,
            depth: data[1],
            width: u16_at(data, 12),
            height: u16_at(data, 14),
            ops: Vec::new(),
        };
        tracing::debug!(client = self.id, pid, ?pixmap, "create pixmap");
        state.pixmaps.insert(pid, pixmap);
    }

    fn free_pixmap(&mut self, state: &mut DisplayState, data: &[u8]) {
        let pid = u32_at(data, 4);
        if state.pixmaps.remove(&pid).is_none() {
            self.error(state, error_code::BAD_PIXMAP, pid, opcode::FREE_PIXMAP);
        }
    }

    fn create_gc(&mut self, state: &mut DisplayState, data: &[u8]) {
        if data.len() < 16 {
            return self.error(state, error_code::BAD_LENGTH, 0, opcode::CREATE_GC);
        }
        let cid = u32_at(data, 4);
        let drawable = u32_at(data, 8);
        if !state.is_drawable(drawable) {
            return self.error(state, error_code::BAD_DRAWABLE, drawable, opcode::CREATE_GC);
        }
        let mut gc = GcRecord {
            owner: self.id,
            foreground: 0,
        };
        apply_gc_values(&mut gc, u32_at(data, 12), &data[16..]);
        state.gcs.insert(cid, gc);
    }

    fn change_gc(&mut self, state: &mut DisplayState, data: &[u8]) {
        if data.len() < 12 {
            return self.error(state, error_code::BAD_LENGTH, 0, opcode::CHANGE_GC);
        }
        let cid = u32_at(data, 4);
        match state.gcs.get_mut(&cid) {
            Some(gc) => apply_gc_values(gc, u32_at(data, 8), &data[12..]),
            None => self.error(state, error_code::BAD_GC, cid, opcode::CHANGE_GC),
        }
    }

    fn free_gc(&mut self, state: &mut DisplayState, data: &[u8]) {
        let cid = u32_at(data, 4);
        if state.gcs.remove(&cid).is_none() {
            self.error(state, error_code::BAD_GC, cid, opcode::FREE_GC);
        }
    }

    /// Look up the drawable and GC of a drawing request.
    fn draw_target(&self, state: &mut DisplayState, data: &[u8], major: u8) -> Option<(u32, u32)> {
        if data.len() < 12 {
            self.error(state, error_code::BAD_LENGTH, 0, major);
            return None;
        }
        let drawable = u32_at(data, 4);
        let gc = u32_at(data, 8);
        if !state.is_drawable(drawable) {
            self.error(state, error_code::BAD_DRAWABLE, drawable, major);
            return None;
        }
        match state.gcs.get(&gc) {
            Some(record) => Some((drawable, record.foreground)),
            None => {
                self.error(state, error_code::BAD_GC, gc, major);
                None
            }
        }
    }

    fn poly_fill_rectangle(&mut self, state: &mut DisplayState, data: &[u8]) {
        let Some((drawable, foreground)) = self.draw_target(state, data, opcode::POLY_FILL_RECTANGLE)
        else {
            return;
        };
        let ops = data[12..].chunks_exact(8).map(|r| DrawOp::FillRectangle {
            foreground,
            x: i16_at(r, 0),
            y: i16_at(r, 2),
            width: u16_at(r, 4),
            height: u16_at(r, 6),
        });
        if let Some(pixmap) = state.pixmaps.get_mut(&drawable) {
            pixmap.ops.extend(ops);
        }
    }

    fn poly_arc(&mut self, state: &mut DisplayState, data: &[u8]) {
        let Some((drawable, foreground)) = self.draw_target(state, data, opcode::POLY_ARC) else {
            return;
        };
        let ops = data[12..].chunks_exact(12).map(|a| DrawOp::Arc {
            foreground,
            x: i16_at(a, 0),
            y: i16_at(a, 2),
            width: u16_at(a, 4),
            height: u16_at(a, 6),
            angle1: i16_at(a, 8),
            angle2: i16_at(a, 10),
        });
        if let Some(pixmap) = state.pixmaps.get_mut(&drawable) {
            pixmap.ops.extend(ops);
        }
    }

    fn query_extension(&mut self, state: &mut DisplayState, data: &[u8]) {
        let name_len = u16_at(data, 4) as usize;
        let end = (8 + name_len).min(data.len());
        let name = String::from_utf8_lossy(&data[8..end]).to_string();
        tracing::debug!(client = self.id, %name, "query extension (not present)");

        let mut reply = self.reply(0, 0);
        reply.push(0); // present
        reply.push(0); // major-opcode
        reply.push(0); // first-event
        reply.push(0); // first-error
        reply.extend_from_slice(&[0u8; 20]);
        state.send(self.id, reply);
    }
}

/// Shortest well-formed request for `op`; shorter ones get BadLength.
fn min_request_len(op: u8) -> usize {
    match op {
        opcode::GET_INPUT_FOCUS => 4,
        opcode::CHANGE_WINDOW_ATTRIBUTES
        | opcode::CONFIGURE_WINDOW
        | opcode::DELETE_PROPERTY
        | opcode::CHANGE_GC
        | opcode::POLY_ARC
        | opcode::POLY_FILL_RECTANGLE => 12,
        opcode::CREATE_PIXMAP | opcode::CREATE_GC => 16,
        opcode::CHANGE_PROPERTY | opcode::GET_PROPERTY => 24,
        opcode::CREATE_WINDOW => 32,
        opcode::SEND_EVENT => 44,
        opcode::GET_WINDOW_ATTRIBUTES
        | opcode::DESTROY_WINDOW
        | opcode::MAP_WINDOW
        | opcode::UNMAP_WINDOW
        | opcode::GET_GEOMETRY
        | opcode::QUERY_TREE
        | opcode::INTERN_ATOM
        | opcode::GET_ATOM_NAME
        | opcode::FREE_PIXMAP
        | opcode::FREE_GC
        | opcode::QUERY_EXTENSION => 8,
        _ => 4,
    }
}

fn apply_window_values(window: &mut WindowRecord, mask: u32, values: &[u8]) {
    for (bit, value) in value_list(mask, values) {
        match bit {
            0 => window.background_pixmap = (value != 0).then_some(value),
            11 => window.event_mask = value,
            _ => {}
        }
    }
}

fn apply_gc_values(gc: &mut GcRecord, mask: u32, values: &[u8]) {
    for (bit, value) in value_list(mask, values) {
        if bit == 2 {
            gc.foreground = value;
        }
    }
}

fn is_viewable(state: &DisplayState, mut wid: u32) -> bool {
    while let Some(window) = state.windows.get(&wid) {
        if !window.mapped {
            return false;
        }
        if wid == ROOT_WINDOW {
            return true;
        }
        wid = window.parent;
    }
    false
}

/// Bytes needed for the connection setup request, once its header is in.
fn setup_request_len(pending: &[u8]) -> Option<usize> {
    if pending.len() < 12 {
        return None;
    }
    let name_len = u16_at(pending, 6) as usize;
    let data_len = u16_at(pending, 8) as usize;
    Some(12 + name_len + pad4(name_len) + data_len + pad4(data_len))
}

async fn handle_client<S>(stream: S, state: Arc<Mutex<DisplayState>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let client_id = state.lock().await.register_client(tx);
    tracing::debug!(client = client_id, "client connected");

    let mut handler = ClientHandler::new(client_id);
    let mut buf = vec![0u8; 65536];
    let mut pending = Vec::new();
    let mut connected = false;

    'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(client = client_id, "read error: {e}");
                break;
            }
        };
        pending.extend_from_slice(&buf[..n]);

        loop {
            if !connected {
                if pending[0] != b'l' {
                    tracing::warn!(client = client_id, "only little-endian clients are supported");
                    break 'read;
                }
                let Some(needed) = setup_request_len(&pending) else {
                    break;
                };
                if pending.len() < needed {
                    break;
                }
                pending.drain(..needed);
                connected = true;
                let st = state.lock().await;
                st.send(
                    client_id,
                    setup_reply(handler.resource_id_base(), st.width, st.height),
                );
                continue;
            }

            if pending.len() < 4 {
                break;
            }
            let needed = match u16_at(&pending, 2) as usize * 4 {
                0 => 4,
                len => len,
            };
            if pending.len() < needed {
                break;
            }

            let mut st = state.lock().await;
            handler.process(&mut st, &pending[..needed]);
            drop(st);
            pending.drain(..needed);
        }
    }

    state.lock().await.remove_client(client_id);
    let _ = writer_task.await;
    tracing::debug!(client = client_id, "client disconnected");
}

async fn accept_tcp(listener: TcpListener, state: Arc<Mutex<DisplayState>>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let _ = stream.set_nodelay(true);
                tokio::spawn(handle_client(stream, Arc::clone(&state)));
            }
            Err(e) => {
                tracing::warn!("accept failed: {e}");
                return;
            }
        }
    }
}

/// Bind a loopback port usable as an X11 TCP display (above port 6000).
async fn bind_loopback() -> Result<TcpListener> {
    for _ in 0..16 {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        if listener.local_addr()?.port() > X11_TCP_BASE {
            return Ok(listener);
        }
    }
    bail!("no loopback port above {X11_TCP_BASE} available")
}

/// An in-process display reachable over TCP on 127.0.0.1.
///
/// Runs on its own tokio runtime; dropping it closes every connection.
pub struct TestDisplay {
    state: Arc<Mutex<DisplayState>>,
    display_name: String,
    _runtime: Runtime,
}

impl TestDisplay {
    pub fn start() -> Result<Self> {
        Self::with_size(1280, 720)
    }

    pub fn with_size(width: u16, height: u16) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .context("failed to start test display runtime")?;
        let state = Arc::new(Mutex::new(DisplayState::new(width, height)));

        let listener = runtime.block_on(bind_loopback())?;
        let port = listener.local_addr()?.port();
        runtime.spawn(accept_tcp(listener, Arc::clone(&state)));

        let display_name = format!("127.0.0.1:{}", port - X11_TCP_BASE);
        tracing::debug!(%display_name, "test display listening");
        Ok(Self {
            state,
            display_name,
            _runtime: runtime,
        })
    }

    /// Display string for x11rb / `$DISPLAY`
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Run `probe` against the current state.
    pub fn inspect<T>(&self, probe: impl FnOnce(&DisplayState) -> T) -> T {
        let state = self.state.blocking_lock();
        probe(&state)
    }

    /// Poll until `probe` yields a value or `timeout` passes.
    pub fn wait_for<T>(
        &self,
        timeout: Duration,
        mut probe: impl FnMut(&DisplayState) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.inspect(&mut probe) {
                return Some(value);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// First mapped child of the root.
    pub fn wait_for_mapped_window(&self, timeout: Duration) -> Option<u32> {
        self.wait_for(timeout, |state| {
            state
                .top_level_windows()
                .into_iter()
                .find(|&id| state.window(id).is_some_and(|w| w.mapped))
        })
    }

    pub fn window(&self, id: u32) -> Option<WindowRecord> {
        self.inspect(|state| state.window(id).cloned())
    }

    pub fn pixmap(&self, id: u32) -> Option<PixmapRecord> {
        self.inspect(|state| state.pixmap(id).cloned())
    }
}

/// Serve a simulated display on `:display_num` until interrupted.
pub async fn run_test_display(display_num: u32, width: u16, height: u16) -> Result<()> {
    let state = Arc::new(Mutex::new(DisplayState::new(width, height)));

    let tcp_port = X11_TCP_BASE + display_num as u16;
    let tcp_listener = TcpListener::bind(format!("127.0.0.1:{}", tcp_port))
        .await
        .context("failed to bind X11 TCP port")?;
    eprintln!("listening on TCP port {} (DISPLAY=127.0.0.1:{})", tcp_port, display_num);

    #[cfg(unix)]
    {
        let socket_path = format!("{}/X{}", X11_UNIX_DIR, display_num);
        let _ = std::fs::remove_file(&socket_path);
        std::fs::create_dir_all(X11_UNIX_DIR)?;
        let unix_listener =
            UnixListener::bind(&socket_path).context("failed to create X11 socket")?;
        eprintln!("listening on Unix socket {} (DISPLAY=:{})", socket_path, display_num);

        loop {
            tokio::select! {
                Ok((stream, _)) = tcp_listener.accept() => {
                    tokio::spawn(handle_client(stream, Arc::clone(&state)));
                }
                Ok((stream, _)) = unix_listener.accept() => {
                    tokio::spawn(handle_client(stream, Arc::clone(&state)));
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        let _ = std::fs::remove_file(&socket_path);
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = accept_tcp(tcp_listener, Arc::clone(&state)) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }

    eprintln!("test display :{} stopped", display_num);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(state: &mut DisplayState) -> (ClientHandler, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.register_client(tx);
        (ClientHandler::new(id), rx)
    }

    fn create_window_request(wid: u32, event_mask: u32) -> Vec<u8> {
        let mut req = vec![opcode::CREATE_WINDOW, 0];
        req.extend_from_slice(&9u16.to_le_bytes());
        req.extend_from_slice(&wid.to_le_bytes());
        req.extend_from_slice(&ROOT_WINDOW.to_le_bytes());
        req.extend_from_slice(&20i16.to_le_bytes());
        req.extend_from_slice(&200i16.to_le_bytes());
        req.extend_from_slice(&500u16.to_le_bytes());
        req.extend_from_slice(&500u16.to_le_bytes());
        req.extend_from_slice(&0u16.to_le_bytes());
        req.extend_from_slice(&1u16.to_le_bytes());
        req.extend_from_slice(&0u32.to_le_bytes());
        req.extend_from_slice(&(1u32 << 11).to_le_bytes());
        req.extend_from_slice(&event_mask.to_le_bytes());
        req
    }

    fn window_request(op: u8, wid: u32) -> Vec<u8> {
        let mut req = vec![op, 0];
        req.extend_from_slice(&2u16.to_le_bytes());
        req.extend_from_slice(&wid.to_le_bytes());
        req
    }

    #[test]
    fn setup_reply_length_matches_header() {
        let reply = setup_reply(0x0020_0000, 1280, 720);
        let words = u16_at(&reply, 6) as usize;
        assert_eq!(reply.len(), 8 + words * 4);
        assert_eq!(reply[0], 1);
    }

    #[test]
    fn setup_request_includes_padded_auth() {
        let mut req = vec![b'l', 0, 11, 0, 0, 0];
        req.extend_from_slice(&18u16.to_le_bytes());
        req.extend_from_slice(&16u16.to_le_bytes());
        req.extend_from_slice(&[0, 0]);
        assert_eq!(setup_request_len(&req), Some(12 + 20 + 16));
        assert_eq!(setup_request_len(&req[..8]), None);
    }

    #[test]
    fn value_list_skips_unset_bits() {
        let mut values = Vec::new();
        values.extend_from_slice(&7u32.to_le_bytes());
        values.extend_from_slice(&9u32.to_le_bytes());
        assert_eq!(value_list(0b1001, &values), vec![(0, 7), (3, 9)]);
    }

    #[test]
    fn map_and_destroy_notify_the_owner() {
        let mut state = DisplayState::new(640, 480);
        let (mut client, mut rx) = connected(&mut state);

        client.process(&mut state, &create_window_request(0x200001, STRUCTURE_NOTIFY_MASK));
        client.process(&mut state, &window_request(opcode::MAP_WINDOW, 0x200001));
        let map_notify = rx.try_recv().unwrap();
        assert_eq!(map_notify[0], MAP_NOTIFY);
        assert_eq!(u16_at(&map_notify, 2), 2);
        assert!(state.window(0x200001).unwrap().mapped);

        client.process(&mut state, &window_request(opcode::DESTROY_WINDOW, 0x200001));
        let destroy_notify = rx.try_recv().unwrap();
        assert_eq!(destroy_notify[0], DESTROY_NOTIFY);
        assert_eq!(u32_at(&destroy_notify, 8), 0x200001);
        assert!(state.window(0x200001).is_none());
    }

    #[test]
    fn unknown_window_is_an_error() {
        let mut state = DisplayState::new(640, 480);
        let (mut client, mut rx) = connected(&mut state);

        client.process(&mut state, &window_request(opcode::MAP_WINDOW, 0xdead));
        let error = rx.try_recv().unwrap();
        assert_eq!(error.len(), 32);
        assert_eq!((error[0], error[1]), (0, error_code::BAD_WINDOW));
        assert_eq!(u32_at(&error, 4), 0xdead);
    }

    #[test]
    fn send_event_reaches_window_owner_marked_synthetic() {
        let mut state = DisplayState::new(640, 480);
        let (mut owner, mut owner_rx) = connected(&mut state);
        let (mut other, _other_rx) = connected(&mut state);

        owner.process(&mut state, &create_window_request(0x200001, 0));

        let mut req = vec![opcode::SEND_EVENT, 0];
        req.extend_from_slice(&11u16.to_le_bytes());
        req.extend_from_slice(&0x200001u32.to_le_bytes());
        req.extend_from_slice(&0u32.to_le_bytes());
        let mut event = [0u8; 32];
        event[0] = 5; // ButtonRelease
        event[1] = 1;
        req.extend_from_slice(&event);
        other.process(&mut state, &req);

        let delivered = owner_rx.try_recv().unwrap();
        assert_eq!(delivered[0], 0x85);
        assert_eq!(delivered[1], 1);
        assert_eq!(u16_at(&delivered, 2), 1);
    }

    #[test]
    fn disconnect_releases_client_resources() {
        let mut state = DisplayState::new(640, 480);
        let (mut client, _rx) = connected(&mut state);
        client.process(&mut state, &create_window_request(0x200001, 0));
        assert_eq!(state.top_level_windows(), vec![0x200001]);

        state.remove_client(client.id);
        assert!(state.top_level_windows().is_empty());
        assert_eq!(state.client_count(), 0);
        assert!(state.window(ROOT_WINDOW).is_some());
    }

    #[test]
    fn truncated_requests_get_bad_length() {
        let mut state = DisplayState::new(640, 480);
        let (mut client, mut rx) = connected(&mut state);

        let ops = [
            opcode::GET_WINDOW_ATTRIBUTES,
            opcode::DESTROY_WINDOW,
            opcode::MAP_WINDOW,
            opcode::UNMAP_WINDOW,
            opcode::GET_GEOMETRY,
            opcode::DELETE_PROPERTY,
            opcode::FREE_PIXMAP,
            opcode::FREE_GC,
            opcode::POLY_FILL_RECTANGLE,
        ];
        for op in ops {
            client.process(&mut state, &[op, 0, 1, 0]);
            let error = rx.try_recv().unwrap();
            assert_eq!((error[0], error[1], error[10]), (0, error_code::BAD_LENGTH, op));
        }

        assert_eq!(state.errors().len(), ops.len());
        assert!(state
            .errors()
            .iter()
            .all(|e| e.client == client.id && e.code == error_code::BAD_LENGTH));
        assert_eq!(state.top_level_windows(), Vec::<u32>::new());
    }
}
