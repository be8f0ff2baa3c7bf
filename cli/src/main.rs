mod arg_parser;
mod runner;

use arg_parser::{ArgParser, SubCommand};
use runner::Runner;

use clap::Parser;
use std::error;
use tracing_subscriber::EnvFilter;
use trackjob::{JobParameters, JsonFileJobRepository, LocalBlobStore};
use uuid::Uuid;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn error::Error>> {
    let args = ArgParser::parse();
    init_logging();

    let config = args.orchestrator_config();
    let runner = Runner::new(
        config,
        LocalBlobStore::new(&args.storage.blob_root),
        JsonFileJobRepository::new(&args.storage.state_file),
    );

    match args.sub_command {
        SubCommand::Run {
            job_id,
            source_key,
            kind,
            stems,
            base_prefix,
            owner,
            publish,
        } => {
            let kind = kind.into_job_kind(stems)?;
            let params = JobParameters {
                base_prefix,
                owner,
                publish_for_retrieval: publish,
            };
            let job_id = job_id.unwrap_or_else(Uuid::new_v4);
            runner.run_job(job_id, &source_key, kind, params).await?;
        }
        SubCommand::Status { job_id } => {
            runner.query_status(job_id).await?;
        }
        SubCommand::Abandon { job_id } => {
            runner.abandon(job_id).await?;
        }
        SubCommand::Purge { prefix } => {
            runner.purge(&prefix).await?;
        }
    }

    Ok(())
}
