use super::{CommandOutput, Transport, TransportError};
use crate::{cluster::Node, config::TransportConfig};
use crate::process::run_with_timeout;
use std::{path::Path, process::Command, time::Duration};
use tracing::{debug, trace, warn};

// exit code both ssh and scp use for their own (connection) failures
const SSH_FAILURE_STATUS: i32 = 255;

// what the ssh client itself prints when it cannot reach or keep a session
const CLIENT_FAILURES: [&str; 9] = [
    "ssh: connect to host",
    "Could not resolve hostname",
    "Connection timed out",
    "Connection refused",
    "No route to host",
    "Permission denied (publickey",
    "Host key verification failed",
    "kex_exchange_identification",
    "client_loop: send disconnect",
];

fn is_client_failure(stderr: &str) -> bool {
    CLIENT_FAILURES
        .iter()
        .any(|signature| stderr.contains(signature))
}

/// Transport backed by the OpenSSH client binaries
#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh: String,
    scp: String,
    options: Vec<String>,
    connect_timeout: Duration,
}

impl SshTransport {
    pub fn load(config: &TransportConfig) -> Self {
        Self {
            ssh: config.ssh.clone(),
            scp: config.scp.clone(),
            options: config.options.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout),
        }
    }

    fn common_args(&self, command: &mut Command) {
        command
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)));

        for option in self.options.iter() {
            command.arg("-o").arg(option);
        }
    }

    fn ssh_command(&self, node: &Node, remote: &str) -> Command {
        let mut command = Command::new(&self.ssh);
        self.common_args(&mut command);
        command.arg(node.to_string()).arg(remote);

        command
    }

    fn scp_command(&self, from: &str, to: &str) -> Command {
        let mut command = Command::new(&self.scp);
        self.common_args(&mut command);
        command.arg("-r").arg(from).arg(to);

        command
    }

    fn remote(
        &self,
        node: &Node,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, TransportError> {
        run_with_timeout(&mut self.ssh_command(node, command), timeout)
    }

    fn connection_error(node: &Node, output: &CommandOutput) -> TransportError {
        TransportError::Connection {
            address: node.address.clone(),
            reason: output.stderr.trim().to_owned(),
        }
    }

    fn transfer(&self, node: &Node, mut command: Command) -> Result<(), TransportError> {
        let output = run_with_timeout(&mut command, None)?;

        match output.status {
            0 => Ok(()),
            SSH_FAILURE_STATUS => Err(Self::connection_error(node, &output)),
            status => Err(TransportError::Io(format!(
                "scp exited with {status}: {}",
                output.stderr.trim()
            ))),
        }
    }
}

impl Transport for SshTransport {
    fn probe(&self, node: &Node, timeout: Duration) -> bool {
        match self.remote(node, "echo \"I'm alive!\"", Some(timeout)) {
            Ok(output) if output.success() => {
                trace!(node = %node.address, "{}", output.stdout.trim());

                true
            }
            Ok(output) => {
                warn!(node = %node.address, status = output.status, "Probe failed");

                false
            }
            Err(error) => {
                warn!(node = %node.address, error = %error, "Node unreachable");

                false
            }
        }
    }

    fn execute(
        &self,
        node: &Node,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, TransportError> {
        debug!(node = %node.address, command, "Running remote command");
        let output = self.remote(node, command, timeout)?;

        if output.status != SSH_FAILURE_STATUS {
            return Ok(output);
        }
        if is_client_failure(&output.stderr) {
            return Err(Self::connection_error(node, &output));
        }

        // remote programs may exit with 255 too (`exit(-1)`, `MPI_Abort(comm, -1)`)
        if self.probe(node, self.connect_timeout.max(Duration::from_secs(1))) {
            debug!(node = %node.address, "Exit status 255 came from the remote command");

            Ok(output)
        } else {
            Err(Self::connection_error(node, &output))
        }
    }

    fn upload_tree(&self, local: &Path, node: &Node, remote: &str) -> Result<(), TransportError> {
        debug!(node = %node.address, local = ?local, remote, "Uploading tree");
        let command = self.scp_command(&local.to_string_lossy(), &format!("{node}:{remote}"));

        self.transfer(node, command)
    }

    fn download_tree(
        &self,
        node: &Node,
        remote: &str,
        local: &Path,
    ) -> Result<(), TransportError> {
        debug!(node = %node.address, local = ?local, remote, "Downloading tree");
        let command = self.scp_command(&format!("{node}:{remote}"), &local.to_string_lossy());

        self.transfer(node, command)
    }
}
