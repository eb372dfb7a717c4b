use super::{LiveNode, ProvisionError, Provisioner};
use crate::{config::ProvisionerConfig, process::run_with_timeout, transport::CommandOutput};
use serde::Deserialize;
use std::{path::PathBuf, process::Command, time::Duration};
use tracing::{debug, info, instrument};

/// Provisioner driven through two shell commands, e.g. `terraform apply -auto-approve` and
/// `terraform output -json nodes`
///
/// The listing command must print a YAML (or JSON) sequence, either of plain addresses or of
/// `{address, state}` maps.
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    working_dir: PathBuf,
    converge_command: String,
    list_command: String,
    timeout: Option<Duration>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListedNode {
    Address(String),
    Detailed(LiveNode),
}

impl From<ListedNode> for LiveNode {
    fn from(listed: ListedNode) -> Self {
        match listed {
            ListedNode::Address(address) => LiveNode::running(address),
            ListedNode::Detailed(node) => node,
        }
    }
}

pub fn parse_listing(output: &str) -> Result<Vec<LiveNode>, ProvisionError> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }

    let listed: Vec<ListedNode> = serde_yaml::from_str(output)?;

    Ok(listed.into_iter().map(LiveNode::from).collect())
}

impl CommandProvisioner {
    pub fn load(config: &ProvisionerConfig) -> Self {
        Self {
            working_dir: config.working_dir.clone(),
            converge_command: config.converge_command.clone(),
            list_command: config.list_command.clone(),
            timeout: config.timeout.map(Duration::from_secs),
        }
    }

    fn shell(&self, script: &str) -> Result<CommandOutput, ProvisionError> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script).current_dir(&self.working_dir);

        let output = run_with_timeout(&mut command, self.timeout)?;

        if !output.success() {
            return Err(ProvisionError::Command {
                command: script.to_owned(),
                status: output.status,
                stderr: output.stderr.trim().to_owned(),
            });
        }

        Ok(output)
    }
}

impl Provisioner for CommandProvisioner {
    #[instrument(skip(self), level = "info")]
    fn converge(&self) -> Result<(), ProvisionError> {
        info!(command = %self.converge_command, "Converging infrastructure");
        let output = self.shell(&self.converge_command)?;
        debug!(stdout = %output.stdout, "Converge finished");

        Ok(())
    }

    fn list_live_nodes(&self, desired_count: usize) -> Result<Vec<LiveNode>, ProvisionError> {
        let output = self.shell(&self.list_command)?;
        let nodes = parse_listing(&output.stdout)?;

        debug!(listed = nodes.len(), desired = desired_count, "Listed live nodes");

        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::NodeState;

    fn provisioner(converge: &str, list: &str) -> CommandProvisioner {
        CommandProvisioner {
            working_dir: std::env::temp_dir(),
            converge_command: converge.to_owned(),
            list_command: list.to_owned(),
            timeout: Some(Duration::from_secs(10)),
        }
    }

    #[test]
    fn plain_json_listing_is_running() {
        let nodes = parse_listing(r#"["10.0.0.10", "10.0.0.11"]"#).unwrap();

        assert_eq!(
            nodes,
            vec![LiveNode::running("10.0.0.10"), LiveNode::running("10.0.0.11")]
        );
    }

    #[test]
    fn detailed_listing_keeps_states() {
        let nodes = parse_listing(
            "- address: 10.0.0.10\n  state: running\n- address: 10.0.0.13\n  state: pending\n",
        )
        .unwrap();

        assert_eq!(nodes[1].state, NodeState::Pending);
    }

    #[test]
    fn empty_listing_has_no_nodes() {
        assert!(parse_listing("\n").unwrap().is_empty());
    }

    #[test]
    fn listing_runs_in_working_dir() {
        let nodes = provisioner("true", "echo '[\"10.0.0.10\"]'")
            .list_live_nodes(1)
            .unwrap();

        assert_eq!(nodes, vec![LiveNode::running("10.0.0.10")]);
    }

    #[test]
    fn failing_converge_reports_the_command() {
        let error = provisioner("echo nope >&2; exit 2", "true")
            .converge()
            .unwrap_err();

        match error {
            ProvisionError::Command { status, stderr, .. } => {
                assert_eq!(status, 2);
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
