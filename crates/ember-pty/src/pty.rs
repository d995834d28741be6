use std::fs::File;
use std::io::Write;
use std::os::fd::BorrowedFd;
use std::path::PathBuf;

use log::info;
use nix::unistd::{getuid, User};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

/// `TERM` value exported to every child.
pub const DEFAULT_TERM: &str = "ember";

/// Geometry variables a child must not inherit from our own environment.
const STALE_GEOMETRY_VARS: [&str; 3] = ["COLUMNS", "LINES", "TERMCAP"];

/// Errors from PTY operations.
#[derive(Debug)]
pub enum PtyError {
    UserLookup(String),
    OpenFailed(String),
    SpawnFailed(String),
    IoError(std::io::Error),
    ResizeFailed(String),
}

impl PtyError {
    /// Whether the terminal is unusable after this error.
    ///
    /// Everything except a failed resize leaves no working channel to the child.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PtyError::ResizeFailed(_))
    }
}

impl std::fmt::Display for PtyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PtyError::UserLookup(msg) => write!(f, "cannot resolve current user: {msg}"),
            PtyError::OpenFailed(msg) => write!(f, "PTY open failed: {msg}"),
            PtyError::SpawnFailed(msg) => write!(f, "PTY spawn failed: {msg}"),
            PtyError::IoError(err) => write!(f, "PTY I/O error: {err}"),
            PtyError::ResizeFailed(msg) => write!(f, "PTY resize failed: {msg}"),
        }
    }
}

impl std::error::Error for PtyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PtyError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PtyError {
    fn from(err: std::io::Error) -> Self {
        PtyError::IoError(err)
    }
}

/// What to run inside a new terminal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Program and arguments, `argv[0]` first.
    pub argv: Vec<String>,
    /// Value exported as `TERM`.
    pub term: String,
    pub cols: u16,
    pub rows: u16,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            argv: vec![default_shell()],
            term: DEFAULT_TERM.to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

/// Login identity of the real user, from the password database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserIdentity {
    pub name: String,
    pub home: PathBuf,
}

impl UserIdentity {
    pub fn current() -> Result<Self, PtyError> {
        let uid = getuid();
        match User::from_uid(uid) {
            Ok(Some(user)) => Ok(Self {
                name: user.name,
                home: user.dir,
            }),
            Ok(None) => Err(PtyError::UserLookup(format!("no passwd entry for uid {uid}"))),
            Err(errno) => Err(PtyError::UserLookup(errno.to_string())),
        }
    }
}

/// Build the child command with a normalized environment.
///
/// Geometry variables are removed; `LOGNAME`, `USER` and `HOME` come from
/// `user`; `TERM` comes from the launch config.
pub fn build_command(config: &LaunchConfig, user: &UserIdentity) -> Result<CommandBuilder, PtyError> {
    let Some((program, args)) = config.argv.split_first() else {
        return Err(PtyError::SpawnFailed("empty command".into()));
    };

    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    for var in STALE_GEOMETRY_VARS {
        cmd.env_remove(var);
    }
    cmd.env("LOGNAME", &user.name);
    cmd.env("USER", &user.name);
    cmd.env("HOME", &user.home);
    cmd.env("TERM", &config.term);
    Ok(cmd)
}

/// Master side of the PTY pair, kept for window-size changes.
pub struct PtyMaster {
    inner: Box<dyn MasterPty + Send>,
}

impl PtyMaster {
    /// Resize the PTY to new dimensions.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.inner
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(format!("{e}")))
    }

    /// Duplicate the master descriptor for the output collector.
    pub fn clone_reader(&self) -> Result<File, PtyError> {
        let raw = self
            .inner
            .as_raw_fd()
            .ok_or_else(|| PtyError::OpenFailed("PTY master has no file descriptor".into()))?;
        // SAFETY: `raw` is owned by `self.inner`, which is alive for this borrow.
        let fd = unsafe { BorrowedFd::borrow_raw(raw) };
        Ok(File::from(fd.try_clone_to_owned()?))
    }
}

/// A freshly launched child attached to a new PTY.
pub struct PtyHandle {
    pub master: PtyMaster,
    pub writer: Box<dyn Write + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

impl PtyHandle {
    /// Allocate a PTY pair and start `config.argv` on its slave side.
    ///
    /// The child becomes a session leader with the slave as its controlling
    /// terminal and standard streams, and starts with default signal
    /// dispositions. The parent keeps only the master side.
    pub fn spawn(config: &LaunchConfig) -> Result<Self, PtyError> {
        let user = UserIdentity::current()?;
        let cmd = build_command(config, &user)?;

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::OpenFailed(format!("{e}")))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("{}: {e}", config.argv[0])))?;
        // Only the child holds the slave from here on, so its exit hangs up the master.
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::OpenFailed(format!("failed to take writer: {e}")))?;

        info!(
            "spawned {:?} (pid {:?}) on a {}x{} PTY",
            config.argv,
            child.process_id(),
            config.cols,
            config.rows
        );

        Ok(Self {
            master: PtyMaster { inner: pair.master },
            writer,
            child,
        })
    }
}

/// Returns the user's default shell, falling back to `/bin/sh`.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use portable_pty::ChildKiller;
    use std::ffi::OsStr;

    fn sh_config() -> LaunchConfig {
        LaunchConfig {
            argv: vec!["/bin/sh".into()],
            ..LaunchConfig::default()
        }
    }

    #[test]
    fn test_spawn_pty() {
        let mut handle = match PtyHandle::spawn(&sh_config()) {
            Ok(handle) => handle,
            Err(e) => panic!("Failed to spawn PTY: {e}"),
        };
        assert!(handle.child.process_id().is_some());
        assert!(matches!(handle.child.try_wait(), Ok(None)));
        handle.child.kill().unwrap();
    }

    #[test]
    fn test_resize() {
        let mut handle = PtyHandle::spawn(&sh_config()).unwrap();
        let result = handle.master.resize(120, 40);
        assert!(result.is_ok(), "Resize failed: {:?}", result.err());
        handle.child.kill().unwrap();
    }

    #[test]
    fn test_clone_reader() {
        let mut handle = PtyHandle::spawn(&sh_config()).unwrap();
        assert!(handle.master.clone_reader().is_ok());
        handle.child.kill().unwrap();
    }

    #[test]
    fn test_spawn_missing_program_fails() {
        let config = LaunchConfig {
            argv: vec!["/nonexistent/ember-test-binary".into()],
            ..LaunchConfig::default()
        };
        let err = PtyHandle::spawn(&config).err().expect("spawn should fail");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_empty_command_rejected() {
        let user = UserIdentity {
            name: "someone".into(),
            home: "/home/someone".into(),
        };
        let config = LaunchConfig {
            argv: Vec::new(),
            ..LaunchConfig::default()
        };
        assert!(matches!(
            build_command(&config, &user),
            Err(PtyError::SpawnFailed(_))
        ));
    }

    #[test]
    fn test_command_environment_is_normalized() {
        let user = UserIdentity {
            name: "someone".into(),
            home: "/home/someone".into(),
        };
        let config = LaunchConfig {
            argv: vec!["/bin/sh".into(), "-c".into(), "true".into()],
            term: "ember-test".into(),
            ..LaunchConfig::default()
        };
        let cmd = build_command(&config, &user).unwrap();

        for var in STALE_GEOMETRY_VARS {
            assert!(cmd.get_env(var).is_none(), "{var} should be unset");
        }
        assert_eq!(cmd.get_env("LOGNAME"), Some(OsStr::new("someone")));
        assert_eq!(cmd.get_env("USER"), Some(OsStr::new("someone")));
        assert_eq!(cmd.get_env("HOME"), Some(OsStr::new("/home/someone")));
        assert_eq!(cmd.get_env("TERM"), Some(OsStr::new("ember-test")));
        assert_eq!(cmd.get_argv().len(), 3);
    }

    #[test]
    fn test_current_user_resolves() {
        let user = UserIdentity::current().unwrap();
        assert!(!user.name.is_empty());
    }

    #[test]
    fn test_resize_error_is_not_fatal() {
        assert!(!PtyError::ResizeFailed("nope".into()).is_fatal());
        assert!(PtyError::UserLookup("nope".into()).is_fatal());
    }

    #[test]
    fn test_default_shell_detection() {
        let shell = default_shell();
        assert!(!shell.is_empty(), "Default shell should not be empty");
        assert!(
            shell.starts_with('/'),
            "Default shell should be an absolute path, got: {shell}"
        );
    }
}
