use anyhow::Result;
use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone)]
#[structopt(
    name = "rmv",
    about = "`rmv` migrates a directory tree onto another volume MUCH faster than a plain copy \
    when dealing with a large number of small files: small files travel in store-mode archives \
    while big files move individually, and source-disk and target-disk IO run in parallel. \
    Interrupted migrations resume where they stopped."
)]
struct Args {
    /// Directory tree to migrate
    #[structopt(parse(from_os_str))]
    source: std::path::PathBuf,

    /// Target directory; a folder named after the source is created inside it
    #[structopt(parse(from_os_str))]
    target: std::path::PathBuf,

    /// Number of workers in each of the two pools, 0 means number of cores
    #[structopt(long, default_value = "0")]
    max_workers: usize,

    /// Byte limit for a single pack archive
    #[structopt(long, default_value = "64MiB")]
    chunk_size_limit: bytesize::ByteSize,

    /// Upper bound on files per pack when no worker balance applies
    #[structopt(long, default_value = "2000")]
    chunk_file_limit: usize,

    /// Per-invocation archiver timeout in seconds
    #[structopt(long, default_value = "10")]
    subprocess_timeout_sec: u64,

    /// Archiver program used to pack and extract
    #[structopt(long, default_value = "tar", parse(from_os_str))]
    archiver: std::path::PathBuf,

    /// Copy instead of move: never delete source files or the source root
    #[structopt(long)]
    copy_only: bool,

    /// Replace the source root with a directory symlink after the move
    #[structopt(long)]
    create_symlink: bool,

    /// Resume a previously interrupted migration
    #[structopt(long)]
    resume: bool,

    /// Show transfer progress on stderr
    #[structopt(long)]
    progress: bool,

    /// Print summary at the end
    #[structopt(long)]
    summary: bool,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[structopt(short = "q", long = "quiet")]
    quiet: bool,
}

fn init_tracing(verbose: u8, quiet: bool) {
    if quiet {
        return;
    }
    let level = match verbose {
        0 => tracing::Level::ERROR,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn async_main(args: Args) -> Result<rmv::MigrateSummary> {
    let mut config = rmv::Config::new(args.source, args.target);
    config.worker_count = args.max_workers;
    config.chunk_size_limit = args.chunk_size_limit.0;
    config.chunk_file_limit = args.chunk_file_limit;
    config.subprocess_timeout = std::time::Duration::from_secs(args.subprocess_timeout_sec);
    config.archiver_program = args.archiver;
    config.copy_only = args.copy_only;
    config.create_symlink = args.create_symlink;
    config.resume_session = args.resume;
    let mut reporter = rmv::Reporter::new()
        .with_verbosity(rmv::Verbosity::from_occurrences(args.verbose));
    if args.progress {
        reporter = reporter.with_status(std::sync::Arc::new(
            |message: &str, percent: Option<u8>| match percent {
                Some(percent) => eprintln!("[{percent:>3}%] {message}"),
                None => eprintln!("{message}"),
            },
        ));
    }
    let engine = std::sync::Arc::new(rmv::Engine::new(config, reporter)?);
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, stopping");
                engine.stop();
            }
        });
    }
    engine.run().await
}

fn main() -> Result<()> {
    let args = Args::from_args();
    init_tracing(args.verbose, args.quiet);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let print_summary = args.summary || args.verbose > 0;
    match runtime.block_on(async_main(args)) {
        Ok(summary) => {
            if print_summary {
                println!("{summary}");
            }
            if summary.tasks_failed > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(error) => {
            tracing::error!("{:#}", error);
            std::process::exit(1);
        }
    }
}
