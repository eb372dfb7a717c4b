use crate::cluster::Node;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::debug;

/// OpenMPI placement file, one `<address> slots=<n>` line per node in node list order
pub fn render(nodes: &[Node], slots_per_node: u32) -> String {
    nodes
        .iter()
        .map(|node| format!("{} slots={slots_per_node}\n", node.address))
        .collect()
}

/// replace `<dir>/<name>` with a freshly rendered hostfile
pub fn write(dir: &Path, name: &str, nodes: &[Node], slots_per_node: u32) -> io::Result<PathBuf> {
    let path = dir.join(name);
    if path.exists() {
        fs::remove_file(&path)?;
    }
    fs::write(&path, render(nodes, slots_per_node))?;
    debug!(path = ?path, nodes = nodes.len(), "Wrote hostfile");

    Ok(path)
}
