use crate::transport::{CommandOutput, TransportError};
use std::{
    io::Read,
    process::{Child, Command, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::warn;
use wait_timeout::ChildExt;

/// drain a pipe on its own thread so a chatty child can't block on a full pipe buffer
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = String::new();

        if let Some(mut pipe) = pipe {
            if let Err(error) = pipe.read_to_string(&mut buffer) {
                warn!(error = ?error, "Failed to read child output");
            }
        }

        buffer
    })
}

fn collect(handle: JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

fn kill(child: &mut Child) {
    if let Err(error) = child.kill() {
        warn!(error = ?error, "Failed to kill child");
    }
    let _ = child.wait();
}

/// spawn `command`, capture both streams and kill it once `timeout` passes
pub fn run_with_timeout(
    command: &mut Command,
    timeout: Option<Duration>,
) -> Result<CommandOutput, TransportError> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| TransportError::Spawn(error.to_string()))?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match timeout {
        Some(timeout) => match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                kill(&mut child);
                // grandchildren may still hold the pipes open, the readers are left detached
                drop((stdout, stderr));

                return Err(TransportError::Timeout(timeout));
            }
            Err(error) => {
                kill(&mut child);

                return Err(TransportError::Io(error.to_string()));
            }
        },
        None => child
            .wait()
            .map_err(|error| TransportError::Io(error.to_string()))?,
    };

    Ok(CommandOutput {
        // killed by a signal, treat like a failed command
        status: status.code().unwrap_or(-1),
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}
