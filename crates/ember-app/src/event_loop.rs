//! Front-end loop: redraws on wake, forwards input, tears down on exit.
//!
//! Runs on the tokio runtime. Each round waits for whichever comes first:
//! a wake from the collector, an input line, Ctrl+C on the host terminal,
//! or the fallback tick. The session lock is held only while a frame is
//! extracted.

use std::io::{self, Write};
use std::time::Duration;

use ember_pty::{ChildExit, ControlKey, PtyError, Session, SessionBuffer, WakeReceiver};
use ember_scrollback::{ScrollDirection, Viewport};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::time::MissedTickBehavior;

use crate::input::{parse_line, Command};

const CLEAR_SCREEN: &[u8] = b"\x1b[H\x1b[2J";

/// What the user sees and where the window sits in the scrollback.
pub struct View {
    viewport: Viewport,
    placeholder: u8,
    scroll_lines: usize,
    /// Keep the newest output in view.
    following: bool,
    clear: bool,
    /// The last frame could not be written to the host terminal.
    output_failed: bool,
}

impl View {
    pub fn new(viewport: Viewport, placeholder: u8, scroll_lines: usize, clear: bool) -> Self {
        Self {
            viewport,
            placeholder,
            scroll_lines,
            following: true,
            clear,
            output_failed: false,
        }
    }

    pub fn scroll_lines(&self) -> usize {
        self.scroll_lines
    }

    /// Move the window. Scrolling up stops following; reaching the bottom
    /// again resumes it.
    pub fn scroll(&mut self, buffer: &mut SessionBuffer, direction: ScrollDirection, lines: usize) {
        if self.following {
            buffer.follow_newest(self.viewport);
        }
        let moved = buffer.scroll(direction, lines);
        match direction {
            ScrollDirection::Up => {
                if moved > 0 {
                    self.following = false;
                }
            }
            ScrollDirection::Down => {
                if buffer.at_bottom(self.viewport) {
                    self.following = true;
                }
            }
        }
        debug!("scrolled {direction} {moved}/{lines} lines, following={}", self.following);
    }

    pub fn follow(&mut self) {
        self.following = true;
    }

    /// Draw the current window into `out`.
    pub fn render(&self, buffer: &mut SessionBuffer, out: &mut impl Write) -> io::Result<()> {
        if self.following {
            buffer.follow_newest(self.viewport);
        }
        let lines = buffer.extract_window(self.viewport, self.placeholder);

        if self.clear {
            out.write_all(CLEAR_SCREEN)?;
        }
        for line in &lines {
            out.write_all(line.as_bytes())?;
            out.write_all(b"\n")?;
        }
        if !self.following {
            out.write_all(b"-- scrolled back, :bottom to follow --\n")?;
        }
        out.flush()
    }

    /// Render, logging host terminal failures instead of ending the session.
    /// Only the first of a run of failures is logged.
    pub fn draw(&mut self, buffer: &mut SessionBuffer, out: &mut impl Write) -> bool {
        match self.render(buffer, out) {
            Ok(()) => {
                if std::mem::take(&mut self.output_failed) {
                    info!("drawing to the terminal works again");
                }
                true
            }
            Err(e) => {
                if !std::mem::replace(&mut self.output_failed, true) {
                    warn!("drawing to the terminal failed: {e}");
                }
                false
            }
        }
    }
}

enum Flow {
    Continue,
    Quit,
}

/// Drive `session` until its child exits or the user quits.
///
/// Returns the child's exit status once the session is shut down.
pub async fn run(
    mut session: Session,
    mut wake: WakeReceiver,
    mut view: View,
    tick: Duration,
) -> Result<Option<ChildExit>, PtyError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut wake_open = true;

    // Ctrl+C on the host terminal is meant for the child.
    let mut interrupts = match signal(SignalKind::interrupt()) {
        Ok(interrupts) => Some(interrupts),
        Err(e) => {
            warn!("cannot intercept SIGINT, Ctrl+C will stop ember: {e}");
            None
        }
    };

    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // The first frame is drawn even if the child stays silent.
    let mut redraw = true;

    loop {
        tokio::select! {
            woke = wake.wait(), if wake_open => {
                if !woke {
                    debug!("collector finished, no more wakes");
                    wake_open = false;
                }
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let command = parse_line(&line, view.scroll_lines());
                    match dispatch(command, &mut session, &mut view)? {
                        Flow::Continue => redraw = true,
                        Flow::Quit => {
                            info!("quit requested");
                            break;
                        }
                    }
                }
                Ok(None) => {
                    debug!("stdin closed");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("reading stdin failed: {e}");
                    stdin_open = false;
                }
            },
            _ = next_interrupt(&mut interrupts) => {
                forward(&mut session, |s| s.send_control(ControlKey::Interrupt))?;
            }
            _ = interval.tick() => {}
        }

        let exited = session.child_exited();
        {
            let mut buffer = session.buffer();
            if buffer.take_changed() || redraw || exited {
                view.draw(&mut buffer, &mut io::stdout().lock());
            }
        }
        redraw = false;

        if exited {
            info!("child exited with {:?}", session.exit_code());
            break;
        }
    }

    Ok(session.shutdown())
}

async fn next_interrupt(interrupts: &mut Option<Signal>) {
    if let Some(interrupts) = interrupts {
        if interrupts.recv().await.is_some() {
            return;
        }
    }
    std::future::pending().await
}

fn dispatch(command: Command, session: &mut Session, view: &mut View) -> Result<Flow, PtyError> {
    match command {
        Command::Line(text) => forward(session, |s| {
            s.write_input(text.as_bytes())?;
            s.send_control(ControlKey::Enter)
        })?,
        Command::Control(key) => forward(session, |s| s.send_control(key))?,
        Command::Erase => forward(session, Session::erase_last)?,
        Command::Scroll(direction, lines) => {
            let mut buffer = session.buffer();
            view.scroll(&mut buffer, direction, lines);
        }
        Command::Bottom => view.follow(),
        Command::Quit => return Ok(Flow::Quit),
        Command::Unknown(line) => warn!("unknown command: {line}"),
    }
    Ok(Flow::Continue)
}

/// Run a write against the child. Once the child is gone its PTY rejects
/// input; that is expected and not fatal.
fn forward(
    session: &mut Session,
    write: impl FnOnce(&mut Session) -> Result<(), PtyError>,
) -> Result<(), PtyError> {
    match write(session) {
        Err(e) if session.child_exited() => {
            debug!("dropping input for exited child: {e}");
            Ok(())
        }
        result => result,
    }
}
