use clap::Parser;
use ringwatch_server::app;
use ringwatch_server::cli::Cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = match "ringwatch=info".parse() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Configuration error");
            std::process::exit(1);
        }
    };

    if let Err(e) = app::run(config).await {
        tracing::error!(error = %e, "Evaluator failed");
        std::process::exit(e.exit_code());
    }
}
