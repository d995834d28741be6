//! Decoding front-end input lines.
//!
//! The host terminal stays in line mode, so keys the child needs to see as
//! single bytes are spelled as `:` commands. Anything else is text for the
//! child followed by Enter. A leading `::` sends a literal `:`.

use ember_pty::ControlKey;
use ember_scrollback::ScrollDirection;

/// One decoded input line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Text for the child, sent with a trailing Enter.
    Line(String),
    Control(ControlKey),
    /// Backspace.
    Erase,
    Scroll(ScrollDirection, usize),
    /// Jump back to the newest output and follow it.
    Bottom,
    Quit,
    Unknown(String),
}

pub fn parse_line(line: &str, default_lines: usize) -> Command {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let Some(rest) = line.strip_prefix(':') else {
        return Command::Line(line.to_string());
    };
    if rest.starts_with(':') {
        return Command::Line(rest.to_string());
    }

    let mut words = rest.split_whitespace();
    let name = words.next().unwrap_or("");
    let count = words.next();

    if let Ok(direction) = name.parse::<ScrollDirection>() {
        return match count.map(str::parse::<usize>) {
            None => Command::Scroll(direction, default_lines),
            Some(Ok(lines)) => Command::Scroll(direction, lines),
            Some(Err(_)) => Command::Unknown(line.to_string()),
        };
    }

    match name {
        "bottom" => Command::Bottom,
        "intr" => Command::Control(ControlKey::Interrupt),
        "eof" => Command::Control(ControlKey::EndOfFile),
        "susp" => Command::Control(ControlKey::Suspend),
        "enter" => Command::Control(ControlKey::Enter),
        "bs" => Command::Erase,
        "quit" => Command::Quit,
        _ => match ctrl_letter(name) {
            Some(key) => Command::Control(key),
            None => Command::Unknown(line.to_string()),
        },
    }
}

/// `^c` style spelling of a control key.
fn ctrl_letter(name: &str) -> Option<ControlKey> {
    let mut chars = name.strip_prefix('^')?.chars();
    let letter = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    ControlKey::from_ctrl(letter)
}
