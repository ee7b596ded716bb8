//! Event loop tail
//!
//! Blocks on the display connection and reports the three event kinds the
//! window selects for. The loop is a two-state machine: it starts
//! [`LoopState::Running`] and moves to [`LoopState::Destroyed`] once a
//! `DestroyNotify` arrives. Whether that ends the loop is configurable.

use std::io::Write;

use x11rb::connection::Connection;
use x11rb::protocol::Event;
use x11rb::protocol::xproto::{Atom, Window};

use crate::error::Result;
use crate::wm::Atoms;

pub const DESTROYED_LINE: &str = "Window destroyed";
pub const MOVING_LINE: &str = "Moving child window.";
pub const CLIENT_MESSAGE_LINE: &str = "Message for client";
pub const STOP_LINE: &str = "Stop now";

/// The events the loop cares about, decoded from the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    Destroyed {
        window: Window,
    },
    ButtonReleased {
        window: Window,
        button: u8,
    },
    ClientMessage {
        window: Window,
        message_type: Atom,
        format: u8,
        data: [u32; 5],
    },
    Other,
}

impl WindowEvent {
    pub fn from_x11(event: &Event) -> Self {
        match event {
            Event::DestroyNotify(ev) => WindowEvent::Destroyed { window: ev.window },
            Event::ButtonRelease(ev) => WindowEvent::ButtonReleased {
                window: ev.event,
                button: ev.detail,
            },
            Event::ClientMessage(ev) => WindowEvent::ClientMessage {
                window: ev.window,
                message_type: ev.type_,
                format: ev.format,
                data: ev.data.as_data32(),
            },
            Event::Error(err) => {
                tracing::warn!(?err, "X11 error delivered as event");
                WindowEvent::Other
            }
            _ => WindowEvent::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoopState {
    #[default]
    Running,
    Destroyed,
}

/// Why the loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Destroyed,
    CloseRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit(ExitReason),
}

pub struct EventLoop<W: Write> {
    out: W,
    atoms: Option<Atoms>,
    honor_close_request: bool,
    exit_on_destroy: bool,
    state: LoopState,
}

impl<W: Write> EventLoop<W> {
    /// `atoms` is only consulted when `honor_close_request` is set; without
    /// them a close request can never be recognised.
    pub fn new(out: W, atoms: Option<Atoms>, honor_close_request: bool, exit_on_destroy: bool) -> Self {
        if honor_close_request && atoms.is_none() {
            tracing::warn!("close requests cannot be honoured without WM integration");
        }
        Self {
            out,
            atoms,
            honor_close_request,
            exit_on_destroy,
            state: LoopState::Running,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Apply one event to the state machine, printing its line if it has one.
    pub fn handle(&mut self, event: WindowEvent) -> std::io::Result<Flow> {
        match event {
            WindowEvent::Destroyed { window } => {
                self.print(DESTROYED_LINE)?;
                self.state = LoopState::Destroyed;
                tracing::debug!(window, exit = self.exit_on_destroy, "destroy notify");
                if self.exit_on_destroy {
                    return Ok(Flow::Exit(ExitReason::Destroyed));
                }
            }
            WindowEvent::ButtonReleased { window, button } => {
                if button == 1 {
                    self.print(MOVING_LINE)?;
                } else {
                    tracing::trace!(window, button, "ignored button release");
                }
            }
            WindowEvent::ClientMessage {
                window,
                message_type,
                format,
                data,
            } => {
                self.print(CLIENT_MESSAGE_LINE)?;
                let close = match (&self.atoms, self.honor_close_request) {
                    (Some(atoms), true) => atoms.is_delete_request(message_type, format, &data),
                    _ => false,
                };
                if close {
                    self.print(STOP_LINE)?;
                    tracing::info!(window, "close requested by window manager");
                    return Ok(Flow::Exit(ExitReason::CloseRequested));
                }
            }
            WindowEvent::Other => tracing::trace!("ignored event"),
        }
        Ok(Flow::Continue)
    }

    /// Block on `conn` until the state machine asks to stop.
    pub fn run<C: Connection>(&mut self, conn: &C) -> Result<ExitReason> {
        conn.flush()?;
        loop {
            let event = conn.wait_for_event()?;
            if let Flow::Exit(reason) = self.handle(WindowEvent::from_x11(&event))? {
                return Ok(reason);
            }
        }
    }

    fn print(&mut self, line: &str) -> std::io::Result<()> {
        writeln!(self.out, "{line}")?;
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x11rb::protocol::xproto::{ClientMessageEvent, DestroyNotifyEvent, DESTROY_NOTIFY_EVENT};

    const PROTOCOLS: Atom = 300;
    const DELETE: Atom = 301;

    fn atoms() -> Atoms {
        Atoms {
            WM_PROTOCOLS: PROTOCOLS,
            WM_DELETE_WINDOW: DELETE,
        }
    }

    fn output(event_loop: EventLoop<Vec<u8>>) -> String {
        String::from_utf8(event_loop.into_output()).unwrap()
    }

    fn close_request() -> WindowEvent {
        WindowEvent::ClientMessage {
            window: 7,
            message_type: PROTOCOLS,
            format: 32,
            data: [DELETE, 0, 0, 0, 0],
        }
    }

    #[test]
    fn button_one_prints_moving() {
        let mut event_loop = EventLoop::new(Vec::new(), None, false, true);
        let flow = event_loop
            .handle(WindowEvent::ButtonReleased { window: 7, button: 1 })
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(output(event_loop), "Moving child window.\n");
    }

    #[test]
    fn other_buttons_are_silent() {
        let mut event_loop = EventLoop::new(Vec::new(), None, false, true);
        for button in [2, 3, 4, 5] {
            event_loop
                .handle(WindowEvent::ButtonReleased { window: 7, button })
                .unwrap();
        }
        assert_eq!(output(event_loop), "");
    }

    #[test]
    fn destroy_exits_by_default() {
        let mut event_loop = EventLoop::new(Vec::new(), None, false, true);
        let flow = event_loop.handle(WindowEvent::Destroyed { window: 7 }).unwrap();
        assert_eq!(flow, Flow::Exit(ExitReason::Destroyed));
        assert_eq!(event_loop.state(), LoopState::Destroyed);
        assert_eq!(output(event_loop), "Window destroyed\n");
    }

    #[test]
    fn destroy_can_keep_the_loop_blocking() {
        let mut event_loop = EventLoop::new(Vec::new(), None, false, false);
        let flow = event_loop.handle(WindowEvent::Destroyed { window: 7 }).unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(event_loop.state(), LoopState::Destroyed);

        let flow = event_loop
            .handle(WindowEvent::ButtonReleased { window: 7, button: 1 })
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(event_loop.state(), LoopState::Destroyed);
        assert_eq!(output(event_loop), "Window destroyed\nMoving child window.\n");
    }

    #[test]
    fn close_request_ignored_unless_honoured() {
        let mut event_loop = EventLoop::new(Vec::new(), Some(atoms()), false, true);
        assert_eq!(event_loop.handle(close_request()).unwrap(), Flow::Continue);
        assert_eq!(output(event_loop), "Message for client\n");
    }

    #[test]
    fn close_request_honoured() {
        let mut event_loop = EventLoop::new(Vec::new(), Some(atoms()), true, true);
        assert_eq!(
            event_loop.handle(close_request()).unwrap(),
            Flow::Exit(ExitReason::CloseRequested)
        );
        assert_eq!(event_loop.state(), LoopState::Running);
        assert_eq!(output(event_loop), "Message for client\nStop now\n");
    }

    #[test]
    fn unrelated_client_message_does_not_close() {
        let mut event_loop = EventLoop::new(Vec::new(), Some(atoms()), true, true);
        let event = WindowEvent::ClientMessage {
            window: 7,
            message_type: 999,
            format: 32,
            data: [DELETE, 0, 0, 0, 0],
        };
        assert_eq!(event_loop.handle(event).unwrap(), Flow::Continue);
    }

    #[test]
    fn other_events_are_silent() {
        let mut event_loop = EventLoop::new(Vec::new(), None, false, true);
        assert_eq!(event_loop.handle(WindowEvent::Other).unwrap(), Flow::Continue);
        assert_eq!(output(event_loop), "");
    }

    #[test]
    fn decodes_x11_events() {
        let destroy = Event::DestroyNotify(DestroyNotifyEvent {
            response_type: DESTROY_NOTIFY_EVENT,
            sequence: 0,
            event: 7,
            window: 7,
        });
        assert_eq!(WindowEvent::from_x11(&destroy), WindowEvent::Destroyed { window: 7 });

        let message = Event::ClientMessage(ClientMessageEvent::new(32, 7, PROTOCOLS, [DELETE, 1, 2, 3, 4]));
        assert_eq!(
            WindowEvent::from_x11(&message),
            WindowEvent::ClientMessage {
                window: 7,
                message_type: PROTOCOLS,
                format: 32,
                data: [DELETE, 1, 2, 3, 4],
            }
        );
    }
}
