use std::{
    ffi::OsStr,
    io::{Error, ErrorKind, Read, Write},
    path::Path,
    process::{Child, Command, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use tracing::debug;
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to spawn {exec}: {source}")]
    Spawn { exec: String, source: Error },
    #[error("Failed to talk to child process: {0}")]
    Io(#[from] Error),
    #[error("{exec} did not finish within {timeout:?}")]
    Timeout { exec: String, timeout: Duration },
    #[error("{exec} exited with {status}: {stderr}")]
    Failed {
        exec: String,
        status: i32,
        stderr: String,
    },
}

/// Run `exec args...` with `input` on stdin, returning stdout of a successful run.
/// The child is killed once `timeout` passes.
///
/// stdin is fed and stdout/stderr are drained on their own threads, so a child
/// producing more than a pipe buffer of output never stalls.
pub fn run_with_input<I, S>(
    exec: &Path,
    args: I,
    input: &str,
    timeout: Duration,
) -> Result<String, CommandError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let name = exec.to_string_lossy().into_owned();
    let mut handle = Command::new(exec)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| CommandError::Spawn {
            exec: name.clone(),
            source,
        })?;

    let feeder = handle.stdin.take().map(|mut pipe| {
        let input = input.to_string();
        // the pipe is dropped at the end of the thread, giving the child a clear end of input
        thread::spawn(move || pipe.write_all(input.as_bytes()))
    });
    let stdout = handle.stdout.take().map(drain);
    let stderr = handle.stderr.take().map(drain);

    debug!("Waiting on {name} ({})", handle.id());
    let status = match handle.wait_timeout(timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            reap(&mut handle)?;

            return Err(CommandError::Timeout {
                exec: name,
                timeout,
            });
        }
        Err(error) => {
            reap(&mut handle)?;

            return Err(error.into());
        }
    };

    if let Some(feeder) = feeder {
        match joined(feeder) {
            // the child is done, it does not have to read all of its input
            Err(error) if error.kind() == ErrorKind::BrokenPipe => {}
            result => result?,
        }
    }
    let stdout = stdout.map(joined).transpose()?.unwrap_or_default();
    let stderr = stderr.map(joined).transpose()?.unwrap_or_default();

    if status.success() {
        Ok(stdout)
    } else {
        Err(CommandError::Failed {
            exec: name,
            status: status.code().unwrap_or(-1),
            stderr: stderr.trim().to_string(),
        })
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Result<String, Error>> {
    thread::spawn(move || {
        let mut output = String::new();
        pipe.read_to_string(&mut output).map(|_| output)
    })
}

fn joined<T>(thread: JoinHandle<Result<T, Error>>) -> Result<T, Error> {
    thread
        .join()
        .unwrap_or_else(|_| Err(Error::new(ErrorKind::Other, "pipe thread panicked")))
}

/// Kill and wait, so no zombie is left behind
fn reap(handle: &mut Child) -> Result<(), Error> {
    match handle.kill() {
        // already exited
        Err(error) if error.kind() == ErrorKind::InvalidInput => {}
        result => result?,
    }
    handle.wait().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_stdin() {
        let output = run_with_input(
            Path::new("/bin/cat"),
            Vec::<&str>::new(),
            "hello",
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(output, "hello");
    }

    #[test]
    fn reports_failures() {
        let result = run_with_input(
            Path::new("/bin/sh"),
            ["-c", "echo broken >&2; exit 3"],
            "",
            Duration::from_secs(5),
        );

        assert!(matches!(
            result,
            Err(CommandError::Failed { status: 3, ref stderr, .. }) if stderr == "broken"
        ));
    }

    #[test]
    fn output_beyond_a_pipe_buffer_is_collected() {
        let output = run_with_input(
            Path::new("/bin/sh"),
            ["-c", "head -c 200000 /dev/zero | tr '\\0' 'x'; echo; echo 4711"],
            "",
            Duration::from_secs(10),
        )
        .unwrap();

        assert_eq!(output.len(), 200_000 + "\n4711\n".len());
        assert!(output.ends_with("x\n4711\n"));
    }

    #[test]
    fn unread_input_beyond_a_pipe_buffer_does_not_block() {
        let input = "y".repeat(1 << 20);

        let output = run_with_input(
            Path::new("/bin/sh"),
            ["-c", "echo 4711"],
            &input,
            Duration::from_secs(10),
        )
        .unwrap();

        assert_eq!(output, "4711\n");
    }

    #[test]
    fn kills_on_timeout() {
        let result = run_with_input(
            Path::new("/bin/sleep"),
            ["5"],
            "",
            Duration::from_millis(100),
        );

        assert!(matches!(result, Err(CommandError::Timeout { .. })));
    }
}
