use chrono::Utc;
use gemini_engine::init_logging;
use news_curator::{run, Config};
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Configuration error");
            return ExitCode::FAILURE;
        }
    };

    info!(
        topics = config.topics.len(),
        model = %config.model_name,
        backend = config.backend.label(),
        history_days = config.history_days,
        "Starting news curator"
    );

    match run(&config, Utc::now()).await {
        Ok(report) => {
            report.log_summary();
            report.exit_code()
        }
        Err(e) => {
            error!(error = %e, "Run aborted");
            ExitCode::FAILURE
        }
    }
}
