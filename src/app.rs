//! Bootstrap sequence and tail selection
//!
//! connect → background tile → window → (WM properties) → map → tail

use std::io::Write;
use std::time::Duration;

use x11rb::connection::Connection;

use crate::background::Background;
use crate::config::{Config, Tail};
use crate::error::Result;
use crate::events::{EventLoop, ExitReason, LoopState};
use crate::session::{ScreenInfo, Session};
use crate::window::{ChildWindow, Geometry};
use crate::wm::{self, Atoms};

/// What to do once the window is on screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailBehavior {
    EventLoop,
    FixedSleep(Duration),
}

impl TailBehavior {
    pub fn from_config(config: &Config) -> Self {
        match config.tail {
            Tail::EventLoop => TailBehavior::EventLoop,
            Tail::Sleep => TailBehavior::FixedSleep(config.sleep_duration()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    EventLoop(ExitReason),
    Slept(Duration),
}

/// Connect to the configured display and run the whole sequence.
pub fn run_session<W: Write>(config: &Config, out: W) -> Result<Outcome> {
    let session = Session::connect(config.display_name())?;
    run(session.conn(), &session.screen(), config, out)
}

/// Run the sequence on an existing connection.
///
/// Every server resource created here is released before returning,
/// whichever way the function exits.
pub fn run<C: Connection, W: Write>(
    conn: &C,
    screen: &ScreenInfo,
    config: &Config,
    out: W,
) -> Result<Outcome> {
    let background = Background::create(
        conn,
        screen,
        config.background_size,
        config.background_style,
    )?;

    let geometry = Geometry::from_config(config);
    let mut window = ChildWindow::create(conn, screen, geometry, background.pixmap())?;

    let atoms = if config.wm_integration {
        let atoms = Atoms::intern(conn)?;
        wm::register(conn, window.id(), &atoms, &config.wm, geometry)?;
        Some(atoms)
    } else {
        None
    };

    window.map()?;

    match TailBehavior::from_config(config) {
        TailBehavior::EventLoop => {
            let mut event_loop =
                EventLoop::new(out, atoms, config.honor_close_request, config.exit_on_destroy);
            let result = event_loop.run(conn);
            if event_loop.state() == LoopState::Destroyed {
                window.mark_destroyed();
            }
            let reason = result?;
            tracing::info!(?reason, "event loop finished");
            Ok(Outcome::EventLoop(reason))
        }
        TailBehavior::FixedSleep(duration) => {
            tracing::info!(?duration, "sleeping");
            std::thread::sleep(duration);
            Ok(Outcome::Slept(duration))
        }
    }
}
