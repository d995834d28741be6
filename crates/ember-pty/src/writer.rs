//! Forwarding user input to the PTY master.

use std::io::{ErrorKind, Write};

use crate::pty::PtyError;

const CARRIAGE_RETURN: u8 = b'\r';

/// Erases the character before the cursor in the child's line editor.
pub const ERASE: u8 = 0x7f;

/// Named control bytes the input layer can send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlKey {
    /// Ctrl+C (ETX).
    Interrupt,
    /// Ctrl+D (EOT).
    EndOfFile,
    /// Ctrl+Z (SUB).
    Suspend,
    /// Return (CR).
    Enter,
}

impl ControlKey {
    pub fn byte(self) -> u8 {
        match self {
            ControlKey::Interrupt => 0x03,
            ControlKey::EndOfFile => 0x04,
            ControlKey::Suspend => 0x1a,
            ControlKey::Enter => CARRIAGE_RETURN,
        }
    }

    /// Key sent by Ctrl plus `letter`, if it is one we forward.
    pub fn from_ctrl(letter: char) -> Option<Self> {
        match letter.to_ascii_lowercase() {
            'c' => Some(ControlKey::Interrupt),
            'd' => Some(ControlKey::EndOfFile),
            'z' => Some(ControlKey::Suspend),
            _ => None,
        }
    }
}

/// Writes input to the master side of the PTY.
///
/// Writes are retried until every byte is accepted; only interruption and
/// would-block count as retryable.
pub struct InputWriter<W: Write> {
    inner: W,
}

impl<W: Write> InputWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write all of `data` exactly as given.
    pub fn write_raw(&mut self, mut data: &[u8]) -> Result<(), PtyError> {
        while !data.is_empty() {
            match self.inner.write(data) {
                Ok(0) => {
                    return Err(PtyError::IoError(std::io::Error::new(
                        ErrorKind::WriteZero,
                        "PTY master accepted no bytes",
                    )))
                }
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => return Err(e.into()),
            }
        }
        self.inner.flush()?;
        Ok(())
    }

    /// Write `data`, sending every carriage return as a write of its own.
    pub fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        for piece in split_carriage_returns(data) {
            self.write_raw(piece)?;
        }
        Ok(())
    }

    pub fn send_control(&mut self, key: ControlKey) -> Result<(), PtyError> {
        self.write_raw(&[key.byte()])
    }

    /// Backspace.
    pub fn erase_last(&mut self) -> Result<(), PtyError> {
        self.write_raw(&[ERASE])
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

/// Split `data` so each `\r` stands alone: `"abc\rdef"` becomes
/// `["abc", "\r", "def"]`.
pub fn split_carriage_returns(mut data: &[u8]) -> Vec<&[u8]> {
    let mut pieces = Vec::new();
    while !data.is_empty() {
        let end = match data.iter().position(|&b| b == CARRIAGE_RETURN) {
            Some(0) => 1,
            Some(i) => i,
            None => data.len(),
        };
        let (piece, rest) = data.split_at(end);
        pieces.push(piece);
        data = rest;
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// Records each successful write call; scripted failures come first.
    #[derive(Default)]
    struct Recorder {
        writes: Vec<Vec<u8>>,
        failures: VecDeque<io::ErrorKind>,
        max_chunk: Option<usize>,
    }

    impl Write for Recorder {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(kind) = self.failures.pop_front() {
                return Err(io::Error::from(kind));
            }
            let n = self.max_chunk.map_or(buf.len(), |max| buf.len().min(max));
            self.writes.push(buf[..n].to_vec());
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_split_isolates_carriage_returns() {
        assert_eq!(
            split_carriage_returns(b"abc\rdef"),
            vec![&b"abc"[..], b"\r", b"def"]
        );
        assert_eq!(split_carriage_returns(b"\r\r"), vec![&b"\r"[..], b"\r"]);
        assert_eq!(split_carriage_returns(b"ls"), vec![&b"ls"[..]]);
        assert!(split_carriage_returns(b"").is_empty());
    }

    #[test]
    fn test_write_issues_three_device_writes() {
        let mut writer = InputWriter::new(Recorder::default());
        writer.write(b"abc\rdef").unwrap();
        assert_eq!(
            writer.get_ref().writes,
            vec![b"abc".to_vec(), b"\r".to_vec(), b"def".to_vec()]
        );
    }

    #[test]
    fn test_write_raw_retries_transient_errors() {
        let recorder = Recorder {
            failures: VecDeque::from([io::ErrorKind::Interrupted, io::ErrorKind::WouldBlock]),
            ..Recorder::default()
        };
        let mut writer = InputWriter::new(recorder);
        writer.write_raw(b"hello").unwrap();
        assert_eq!(writer.get_ref().writes, vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_write_raw_finishes_short_writes() {
        let recorder = Recorder {
            max_chunk: Some(2),
            ..Recorder::default()
        };
        let mut writer = InputWriter::new(recorder);
        writer.write_raw(b"hello").unwrap();
        assert_eq!(writer.get_ref().writes.concat(), b"hello");
        assert_eq!(writer.get_ref().writes.len(), 3);
    }

    #[test]
    fn test_write_raw_fails_on_broken_channel() {
        let recorder = Recorder {
            failures: VecDeque::from([io::ErrorKind::BrokenPipe]),
            ..Recorder::default()
        };
        let mut writer = InputWriter::new(recorder);
        let err = writer.write_raw(b"x").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_control_keys() {
        let mut writer = InputWriter::new(Recorder::default());
        writer.send_control(ControlKey::Interrupt).unwrap();
        writer.send_control(ControlKey::EndOfFile).unwrap();
        writer.send_control(ControlKey::Suspend).unwrap();
        writer.send_control(ControlKey::Enter).unwrap();
        writer.erase_last().unwrap();
        assert_eq!(
            writer.get_ref().writes,
            vec![vec![0x03], vec![0x04], vec![0x1a], vec![b'\r'], vec![0x7f]]
        );
    }

    #[test]
    fn test_from_ctrl() {
        assert_eq!(ControlKey::from_ctrl('c'), Some(ControlKey::Interrupt));
        assert_eq!(ControlKey::from_ctrl('D'), Some(ControlKey::EndOfFile));
        assert_eq!(ControlKey::from_ctrl('z'), Some(ControlKey::Suspend));
        assert_eq!(ControlKey::from_ctrl('x'), None);
    }
}
