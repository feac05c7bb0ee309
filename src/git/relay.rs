//! Spawning a pack-protocol program and relaying its standard streams.
//!
//! The caller owns the client side of the conversation: it feeds
//! [`RunningCommand::take_stdin`] from the channel and hands an
//! [`OutputSink`] to [`RunningCommand::finish`], which drains stdout and
//! stderr and reports the exit code once both streams are exhausted.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, instrument, warn};

/// Exit code reported when the process status cannot be determined.
pub const EXIT_UNKNOWN: u32 = 1;

const READ_BUF_SIZE: usize = 32 * 1024;

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Fully resolved description of the process to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    /// Build the argv for `verb` acting on `repo`.
    ///
    /// A compound verb (`git upload-pack`) becomes two argv tokens; any other
    /// verb is the program itself.  The repository path is always last.
    pub fn new(verb: &str, repo: &Path, cwd: &Path) -> Self {
        let mut words = verb.splitn(2, ' ');
        let program = words.next().unwrap_or_default().to_string();
        let mut args: Vec<OsString> = words.map(OsString::from).collect();
        args.push(repo.as_os_str().to_owned());

        Self {
            program,
            args,
            cwd: cwd.to_path_buf(),
            env: Vec::new(),
        }
    }

    pub fn with_env<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(vars);
        self
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<OsString> {
        std::iter::once(OsString::from(&self.program))
            .chain(self.args.iter().cloned())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Output sink
// ---------------------------------------------------------------------------

/// Destination for the child's output streams.
#[async_trait::async_trait]
pub trait OutputSink: Send + Sync {
    /// Forward a chunk of standard output.
    async fn stdout(&self, data: &[u8]) -> Result<()>;
    /// Forward a chunk of standard error.
    async fn stderr(&self, data: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

// ---------------------------------------------------------------------------
// Running command
// ---------------------------------------------------------------------------

/// A spawned child whose three standard streams are piped.
#[derive(Debug)]
pub struct RunningCommand {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

/// Start `invocation` with all standard streams piped.
#[instrument(skip(invocation), fields(program = %invocation.program, cwd = %invocation.cwd.display()))]
pub fn spawn(invocation: &Invocation) -> Result<RunningCommand> {
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .current_dir(&invocation.cwd)
        .envs(invocation.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", invocation.program))?;

    let stdin = child.stdin.take();
    let stdout = child
        .stdout
        .take()
        .context("child stdout was not captured")?;
    let stderr = child
        .stderr
        .take()
        .context("child stderr was not captured")?;

    debug!(pid = ?child.id(), "spawned pack-protocol process");
    Ok(RunningCommand {
        child,
        stdin,
        stdout,
        stderr,
    })
}

impl RunningCommand {
    /// Hand out the child's stdin.  Dropping it signals EOF to the child.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Drain stdout and stderr into `sink`, then wait for the child.
    ///
    /// Both streams are read concurrently so a child that fills its stderr
    /// pipe while stdout is still open cannot stall.  Returns the exit code
    /// to report to the client.
    pub async fn finish<S: OutputSink>(mut self, sink: &S) -> Result<u32> {
        // A child that never reads stdin must not keep it open forever.
        drop(self.stdin.take());

        let (out_bytes, err_bytes) = tokio::join!(
            pump(&mut self.stdout, sink, Stream::Stdout),
            pump(&mut self.stderr, sink, Stream::Stderr),
        );
        debug!(stdout_bytes = out_bytes, stderr_bytes = err_bytes, "output drained");

        let status = self
            .child
            .wait()
            .await
            .context("failed to wait for child process")?;
        let code = exit_code(status);
        if code != 0 {
            warn!(%status, "pack-protocol process exited with non-zero status");
        }
        Ok(code)
    }
}

/// Copy `reader` into `sink` until EOF.
///
/// Once the sink refuses data the rest of the stream is read and discarded,
/// so the child can still run to completion.
async fn pump<R, S>(reader: &mut R, sink: &S, stream: Stream) -> u64
where
    R: AsyncRead + Unpin,
    S: OutputSink,
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut total = 0u64;
    let mut sink_open = true;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(?stream, error = %e, "error reading child output");
                break;
            }
        };
        total += n as u64;

        if sink_open {
            let sent = match stream {
                Stream::Stdout => sink.stdout(&buf[..n]).await,
                Stream::Stderr => sink.stderr(&buf[..n]).await,
            };
            if let Err(e) = sent {
                debug!(?stream, error = %e, "output sink closed; discarding remaining output");
                sink_open = false;
            }
        }
    }

    total
}

/// Map a process status to the 32-bit code carried by `exit-status`.
pub fn exit_code(status: ExitStatus) -> u32 {
    if let Some(code) = status.code() {
        return u32::try_from(code).unwrap_or(EXIT_UNKNOWN);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal.unsigned_abs();
        }
    }
    EXIT_UNKNOWN
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use anyhow::bail;
    use tokio::io::AsyncWriteExt;

    #[derive(Default)]
    struct Collector {
        stdout: Mutex<Vec<u8>>,
        stderr: Mutex<Vec<u8>>,
    }

    #[async_trait::async_trait]
    impl OutputSink for Collector {
        async fn stdout(&self, data: &[u8]) -> Result<()> {
            self.stdout.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        async fn stderr(&self, data: &[u8]) -> Result<()> {
            self.stderr.lock().unwrap().extend_from_slice(data);
            Ok(())
        }
    }

    struct ClosedSink;

    #[async_trait::async_trait]
    impl OutputSink for ClosedSink {
        async fn stdout(&self, _data: &[u8]) -> Result<()> {
            bail!("channel closed")
        }

        async fn stderr(&self, _data: &[u8]) -> Result<()> {
            bail!("channel closed")
        }
    }

    fn shell(script: &str, cwd: &Path) -> Invocation {
        Invocation {
            program: "sh".to_string(),
            args: vec!["-c".into(), script.into()],
            cwd: cwd.to_path_buf(),
            env: Vec::new(),
        }
    }

    #[test]
    fn simple_verb_argv() {
        let inv = Invocation::new(
            "git-upload-pack",
            Path::new("myrepo/project.git"),
            Path::new("myrepo"),
        );
        assert_eq!(
            inv.argv(),
            vec![
                OsString::from("git-upload-pack"),
                OsString::from("myrepo/project.git")
            ]
        );
        assert_eq!(inv.cwd, PathBuf::from("myrepo"));
    }

    #[test]
    fn compound_verb_argv() {
        let inv = Invocation::new("git upload-pack", Path::new("r/a.git"), Path::new("r"));
        assert_eq!(inv.program, "git");
        assert_eq!(
            inv.args,
            vec![OsString::from("upload-pack"), OsString::from("r/a.git")]
        );
    }

    #[tokio::test]
    async fn relays_both_streams_and_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let inv = shell("echo out; echo err >&2; exit 3", tmp.path());
        let running = spawn(&inv).unwrap();

        let sink = Collector::default();
        let code = running.finish(&sink).await.unwrap();

        assert_eq!(code, 3);
        assert_eq!(sink.stdout.lock().unwrap().as_slice(), b"out\n");
        assert_eq!(sink.stderr.lock().unwrap().as_slice(), b"err\n");
    }

    #[tokio::test]
    async fn stdin_reaches_child() {
        let tmp = tempfile::tempdir().unwrap();
        let mut running = spawn(&shell("cat", tmp.path())).unwrap();

        let mut stdin = running.take_stdin().unwrap();
        let writer = tokio::spawn(async move {
            stdin.write_all(b"want 0000\n").await.unwrap();
        });

        let sink = Collector::default();
        let code = running.finish(&sink).await.unwrap();
        writer.await.unwrap();

        assert_eq!(code, 0);
        assert_eq!(sink.stdout.lock().unwrap().as_slice(), b"want 0000\n");
    }

    #[tokio::test]
    async fn runs_in_repository_root_with_channel_env() {
        let tmp = tempfile::tempdir().unwrap();
        let inv = shell("pwd; printf %s \"$GIT_PROTOCOL\"", tmp.path())
            .with_env([("GIT_PROTOCOL".to_string(), "version=2".to_string())]);
        let sink = Collector::default();
        spawn(&inv).unwrap().finish(&sink).await.unwrap();

        let out = String::from_utf8(sink.stdout.lock().unwrap().clone()).unwrap();
        let mut lines = out.lines();
        let pwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(pwd.canonicalize().unwrap(), tmp.path().canonicalize().unwrap());
        assert_eq!(lines.next(), Some("version=2"));
    }

    #[tokio::test]
    async fn large_stderr_does_not_stall() {
        let tmp = tempfile::tempdir().unwrap();
        // Well past a pipe buffer on stderr before anything reaches stdout.
        let inv = shell("head -c 262144 /dev/zero >&2; echo done", tmp.path());
        let sink = Collector::default();
        let code = spawn(&inv).unwrap().finish(&sink).await.unwrap();

        assert_eq!(code, 0);
        assert_eq!(sink.stderr.lock().unwrap().len(), 262144);
        assert_eq!(sink.stdout.lock().unwrap().as_slice(), b"done\n");
    }

    #[tokio::test]
    async fn closed_sink_still_waits_for_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let inv = shell("head -c 262144 /dev/zero; exit 7", tmp.path());
        let code = spawn(&inv).unwrap().finish(&ClosedSink).await.unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let tmp = tempfile::tempdir().unwrap();
        let inv = Invocation::new(
            "git-definitely-not-installed",
            Path::new("x.git"),
            tmp.path(),
        );
        assert!(spawn(&inv).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signal_exit_is_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let inv = shell("kill -9 $$", tmp.path());
        let code = spawn(&inv).unwrap().finish(&Collector::default()).await.unwrap();
        assert_eq!(code, 128 + 9);
    }
}
