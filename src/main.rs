use clap::Parser;

use whisper_backfill::cli::{Cli, Command, ShutdownController};
use whisper_backfill::clock::SystemClock;
use whisper_backfill::compute::Ec2CliApi;
use whisper_backfill::lock::LockClient;
use whisper_backfill::markers::FsMarkerStore;
use whisper_backfill::pipeline::SshWorker;
use whisper_backfill::process::SystemProcessController;
use whisper_backfill::storage::{FsArtifactStore, ReportLog};
use whisper_backfill::{BfResult, Orchestrator, Watchdog};

fn main() {
    whisper_backfill::logging::init();

    if let Err(e) = ShutdownController::install() {
        tracing::warn!("failed to install signal handler: {e}");
    }

    match run() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("error: {error}");
            std::process::exit(1);
        }
    }
}

fn run() -> BfResult<i32> {
    let cli = Cli::parse();
    let config = cli.config.to_config()?;

    let clock = SystemClock;
    let markers = FsMarkerStore::new(config.state_dir.clone());
    let storage = FsArtifactStore::new(config.storage_root.clone());

    match cli.command {
        Command::Run => {
            let compute = Ec2CliApi::new(config.resource_id.clone());
            let worker = SshWorker::new(config.worker_host.clone());
            let orchestrator =
                Orchestrator::new(&config, &markers, &storage, &compute, &worker, &clock);

            let report = orchestrator.run(&ShutdownController::is_shutting_down)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(report.status.exit_code())
        }
        Command::Watchdog => {
            let compute = Ec2CliApi::new(config.resource_id.clone());
            let processes = SystemProcessController;
            let watchdog = Watchdog::new(&config, &markers, &compute, &processes, &clock);

            let verdict = watchdog.check()?;
            println!("{verdict:?}");
            Ok(0)
        }
        Command::Scan => {
            let job = whisper_backfill::scanner::scan(&storage, &clock)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(0)
        }
        Command::LockStatus => {
            let lock = LockClient::new(&markers, config.lock_ttl());
            let status = lock.status(&clock);
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(0)
        }
        Command::Reports(args) => {
            let log = ReportLog::new(&config.state_dir);
            for report in log.recent(args.limit)? {
                println!("{}", serde_json::to_string(&report)?);
            }
            Ok(0)
        }
    }
}
