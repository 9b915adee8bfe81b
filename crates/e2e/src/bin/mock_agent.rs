//! Stand-in automation agent for end-to-end tests

use agenticqa_e2e::agent::{self, AgentOptions};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mock-agent")]
#[command(about = "Scriptable automation agent speaking the AgenticQA bridge protocol")]
struct Args {
    #[command(flatten)]
    options: AgentOptions,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    // stdout carries the protocol; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let code = agent::run(args.options).await?;
    std::process::exit(code);
}
