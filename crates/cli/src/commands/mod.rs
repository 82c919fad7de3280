//! CLI Commands

use clap::Args;
use formprobe_harness::PlaywrightBridge;

pub mod check;
pub mod doctor;
pub mod run;
pub mod serve;

/// Where to find Node and the `playwright` package
#[derive(Args, Debug, Clone)]
pub struct BridgeArgs {
    /// Node executable used for the browser bridge
    #[arg(long, env = "FORMPROBE_NODE", default_value = "node")]
    pub node: String,

    /// NODE_PATH for resolving `playwright`
    #[arg(long, env = "FORMPROBE_NODE_PATH")]
    pub node_path: Option<String>,
}

impl BridgeArgs {
    pub fn bridge(&self) -> PlaywrightBridge {
        PlaywrightBridge::new(self.node.clone()).with_node_path(self.node_path.clone())
    }
}
