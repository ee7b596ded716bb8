//! Helpers for driving the client against the simulated display.

#![allow(dead_code)]

use std::io::Write;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use childwin::app::{self, Outcome};
use childwin::test_display::TestDisplay;
use childwin::Config;
use x11rb::rust_connection::RustConnection;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// `Write` handle whose bytes can be read back from another thread
#[derive(Clone, Default)]
pub struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl SharedOutput {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Poll until the output contains `needle`.
    pub fn wait_for(&self, needle: &str) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if self.contents().contains(needle) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// The client running on its own thread
pub struct ClientRun {
    pub output: SharedOutput,
    result: mpsc::Receiver<childwin::Result<Outcome>>,
}

impl ClientRun {
    /// Wait for the client to return, whatever the result.
    pub fn result(&self) -> childwin::Result<Outcome> {
        self.result
            .recv_timeout(TIMEOUT)
            .expect("client did not return")
    }

    pub fn finish(&self) -> Outcome {
        self.result().expect("client failed")
    }
}

pub fn config_for(display: &TestDisplay) -> Config {
    Config {
        display: display.display_name().to_string(),
        ..Config::default()
    }
}

pub fn spawn_client(config: Config) -> ClientRun {
    let output = SharedOutput::default();
    let writer = output.clone();
    let (tx, result) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(app::run_session(&config, writer));
    });
    ClientRun { output, result }
}

/// Second connection used to inspect the client's window and poke it with events.
pub fn tester(display: &TestDisplay) -> RustConnection {
    let (conn, _) = RustConnection::connect(Some(display.display_name())).unwrap();
    conn
}

pub fn mapped_window(display: &TestDisplay) -> u32 {
    display
        .wait_for_mapped_window(TIMEOUT)
        .expect("client never mapped a window")
}
