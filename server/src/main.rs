use std::sync::Arc;

use switchboard_server::AgentProcessLauncher;
use switchboard_server::run_main;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    run_main(Arc::new(AgentProcessLauncher::default())).await
}
