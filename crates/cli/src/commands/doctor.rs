//! Doctor Command
//!
//! Verifies that Node can load `playwright` before any scenario is run.

use anyhow::Result;
use clap::Args;

use super::BridgeArgs;
use crate::output::{print_error, print_info, print_success};

#[derive(Args, Debug)]
pub struct DoctorArgs {
    #[command(flatten)]
    pub bridge: BridgeArgs,
}

pub async fn execute(args: DoctorArgs) -> Result<bool> {
    let bridge = args.bridge.bridge();
    print_info(&format!("Checking that {} can load playwright...", bridge.node()));

    match bridge.check_available().await {
        Ok(()) => {
            print_success("Browser bridge is ready");
            Ok(true)
        }
        Err(e) => {
            print_error(&e.to_string());
            print_info("Install the bridge dependency with: npm install playwright && npx playwright install");
            Ok(false)
        }
    }
}
