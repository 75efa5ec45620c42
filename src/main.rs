mod cli;

use std::process::ExitCode;

use clap::Parser;
use cli::{Cli, Commands, SealArgs};
use timeseal::config::Config;
use timeseal::observability::init_tracing;
use timeseal::worker::{BatchEvent, BatchOrchestrator};
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load_with(cli.config.clone()) {
        Ok(config) => config,
        Err(e) => {
            init_tracing("info");
            error!(error = %e, "Invalid configuration");
            eprintln!("timeseal: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.logging.filter);

    match cli.command {
        Commands::Seal(args) => seal(config, args).await,
        Commands::Config => match toml::to_string_pretty(&config) {
            Ok(rendered) => {
                print!("{}", rendered);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("timeseal: cannot render configuration: {}", e);
                ExitCode::FAILURE
            }
        },
    }
}

async fn seal(mut config: Config, args: SealArgs) -> ExitCode {
    if let Some(url) = args.tsa_url {
        config.batch.tsa_url = url;
    }
    if let Some(suffix) = args.suffix {
        config.batch.output_suffix = suffix;
    }
    if args.no_repair {
        config.batch.repair_enabled = false;
    }
    if let Some(name) = args.field_name {
        config.batch.field_name = name;
    }
    if let Some(hash) = args.hash {
        config.batch.hash_algorithm = hash;
    }
    if let Err(e) = config.validate() {
        eprintln!("timeseal: {}", e);
        return ExitCode::FAILURE;
    }

    let mut orchestrator = BatchOrchestrator::new();
    if orchestrator.register(args.files) == 0 {
        eprintln!("timeseal: no PDF files given");
        return ExitCode::FAILURE;
    }

    let mut handle = orchestrator.spawn(config.batch_config());
    let mut total = 0;
    let mut finished = 0;
    while let Some(event) = handle.next_event().await {
        if args.json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => error!(error = %e, "Cannot serialize event"),
            }
            continue;
        }
        match event {
            BatchEvent::Started { total: count } => {
                total = count;
                println!("Sealing {} document(s)", count);
            }
            BatchEvent::JobStarted { .. } => {}
            BatchEvent::JobFinished {
                job_id,
                status,
                error,
            } => {
                finished += 1;
                match error {
                    Some(reason) => println!("[{}/{}] {} {}: {}", finished, total, status, job_id, reason),
                    None => println!("[{}/{}] {} {}", finished, total, status, job_id),
                }
            }
            BatchEvent::Aborted { reason } => println!("Aborted: {}", reason),
            BatchEvent::Finished(result) => println!(
                "Done: {} sealed, {} failed, {} not started{}",
                result.success_count,
                result.failure_count,
                result.remaining,
                if result.cancelled { " (cancelled)" } else { "" }
            ),
        }
    }

    match handle.join().await {
        Ok((_, Ok(result))) if result.all_succeeded() => ExitCode::SUCCESS,
        Ok((_, Ok(_))) => ExitCode::FAILURE,
        Ok((_, Err(e))) => {
            eprintln!("timeseal: {}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "Batch task did not complete");
            ExitCode::FAILURE
        }
    }
}
