use company_directory::{init_tracing, run, AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    run(AppConfig::from_env()).await
}
