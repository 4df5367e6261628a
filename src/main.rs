use anyhow::Result;
use hpc_trainer::cli::interface::run_cli_interface;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    run_cli_interface().await?;
    Ok(())
}
