#[tokio::main]
async fn main() -> anyhow::Result<()> {
    local_agent_dashboard_lib::run().await
}
