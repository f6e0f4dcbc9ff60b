use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use roz::adapters::{
    AmqpBus, NextflowRunner, OnyxClient, PathogenwatchClient, S3Store, S3StoreFactory, SlackWebhook,
};
use roz::config::{RozConfig, Settings, SiteCredentials};
use roz::core::announce::{channels_for, Announcer};
use roz::core::bucket_map::BucketMap;
use roz::core::controller::Controller;
use roz::core::ingest::IngestService;
use roz::core::matcher::Matcher;
use roz::core::notifications::NotificationService;
use roz::core::records::OnyxRecords;
use roz::core::validation::{self, ArtifactHandler, MscapeHandler, PathsafeHandler, Validator};
use roz::domain::ports::{MessageBus, ObjectStore, OnyxApi};
use roz::utils::{logger, validation::Validate};
use roz::RozError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "roz")]
#[command(about = "Ingest, match and validate sequencing artifacts uploaded to S3")]
struct Cli {
    /// TOML settings file; environment variables override it
    #[arg(long, env = "ROZ_SETTINGS", global = true)]
    settings: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Stem {
    Mscape,
    Pathsafe,
}

impl Stem {
    fn as_str(&self) -> &'static str {
        match self {
            Stem::Mscape => "mscape",
            Stem::Pathsafe => "pathsafe",
        }
    }
}

#[derive(clap::Args, Debug)]
struct ValidateArgs {
    stem: Stem,

    /// Directory receiving per-artifact pipeline output
    #[arg(long)]
    result_dir: PathBuf,

    #[arg(long)]
    nxf_config: Option<PathBuf>,

    #[arg(long, default_value = "nextflow")]
    nxf_executable: PathBuf,

    /// Kraken2 server host (mscape only)
    #[arg(long, default_value = "localhost")]
    k2_host: String,

    #[arg(long, default_value_t = validation::DEFAULT_WORKERS)]
    n_workers: usize,

    #[arg(long, default_value_t = 7200)]
    timeout_seconds: u64,

    /// Onyx project, defaults to the stem
    #[arg(long)]
    project: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll ingest buckets and publish S3 events
    Notifications {
        #[arg(long, default_value_t = 600)]
        sleep_interval: u64,
    },
    /// Group S3 events into complete artifacts
    Matcher {
        #[arg(long, default_value_t = 30)]
        sleep_time: u64,
    },
    /// Test-create matched artifacts in Onyx
    Ingest,
    /// Run the validation pipeline for a project
    Validate(ValidateArgs),
    /// Create buckets and repair their policies
    Controller {
        /// roz configuration JSON
        config: PathBuf,

        #[arg(long)]
        aws_credentials: PathBuf,

        /// Print what would happen, but don't actually do it
        #[arg(long)]
        dry_run: bool,
    },
    /// Relay announcements to Slack
    Announce { stem: Stem },
    /// Load and validate settings and the roz configuration
    CheckConfig,
}

impl Command {
    fn service(&self) -> &'static str {
        match self {
            Command::Notifications { .. } => "s3_notifications",
            Command::Matcher { .. } => "s3_matcher",
            Command::Ingest => "ingest",
            Command::Validate(_) => "validation",
            Command::Controller { .. } => "s3_controller",
            Command::Announce { .. } => "announce",
            Command::CheckConfig => "check_config",
        }
    }

    fn log_file<'a>(&self, settings: &'a Settings) -> Option<&'a Path> {
        let path = match self {
            Command::Notifications { .. } => &settings.logs.notifications,
            Command::Matcher { .. } => &settings.logs.matcher,
            Command::Ingest => &settings.logs.ingest,
            Command::Validate(_) => &settings.logs.validation,
            _ => return None,
        };
        path.as_deref()
    }
}

async fn connect_store(settings: &Settings) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let store = S3Store::connect(&settings.s3).await.context("S3 client setup failed")?;
    Ok(Arc::new(store))
}

async fn connect_bus(settings: &Settings) -> anyhow::Result<Arc<dyn MessageBus>> {
    let uri = settings.amqp_uri()?;
    let bus = AmqpBus::connect(&uri).await.context("could not connect to RabbitMQ")?;
    Ok(Arc::new(bus))
}

fn onyx_client(settings: &Settings) -> anyhow::Result<Arc<dyn OnyxApi>> {
    let client = OnyxClient::from_settings(&settings.onyx, settings.onyx_domain()?, settings.onyx_password()?)?;
    Ok(Arc::new(client))
}

async fn validate(args: ValidateArgs, settings: &Settings) -> anyhow::Result<()> {
    let project = args.project.clone().unwrap_or_else(|| args.stem.as_str().to_string());

    let (handler, pipe): (Arc<dyn ArtifactHandler>, &str) = match args.stem {
        Stem::Mscape => (
            Arc::new(MscapeHandler::new(&project, &args.k2_host)),
            validation::mscape::PIPELINE,
        ),
        Stem::Pathsafe => {
            let pathogenwatch = PathogenwatchClient::new(
                settings.pathogenwatch_endpoint()?,
                settings.pathogenwatch_api_key()?,
                settings.pathogenwatch.collection_id,
            );
            (
                Arc::new(PathsafeHandler::new(&project, pathogenwatch)),
                validation::pathsafe::PIPELINE,
            )
        }
    };

    std::fs::create_dir_all(&args.result_dir)
        .with_context(|| format!("could not create result dir {}", args.result_dir.display()))?;

    let runner = NextflowRunner::new(pipe, args.nxf_executable)
        .with_config(args.nxf_config)
        .with_profile(Some("docker".to_string()))
        .with_timeout(Duration::from_secs(args.timeout_seconds));

    let store = connect_store(settings).await?;
    let records = OnyxRecords::new(onyx_client(settings)?, Arc::clone(&store));
    let validator = Arc::new(Validator::new(
        handler,
        Arc::new(runner),
        store,
        records,
        connect_bus(settings).await?,
        args.result_dir,
    ));

    tracing::info!(project = %project, pipeline = pipe, workers = args.n_workers, "🚀 Starting validation workers");
    validator.run(args.n_workers).await?;
    Ok(())
}

async fn controller(settings: &Settings, config: &Path, aws_credentials: &Path, dry_run: bool) -> anyhow::Result<()> {
    let config = Arc::new(
        RozConfig::from_file(config).with_context(|| format!("could not load {}", config.display()))?,
    );
    let credentials = SiteCredentials::from_file(aws_credentials)
        .with_context(|| format!("could not load {}", aws_credentials.display()))?;
    let factory = S3StoreFactory::new(&settings.s3);

    let controller = Controller::new(config, &credentials, &factory)?;
    let report = controller.run(dry_run).await?;

    if report.dry_run {
        println!("Dry run, not applying policies");
        println!(
            "Would apply policies to {} site buckets and {} project buckets",
            report.site_bucket_count(),
            report.project_bucket_count()
        );
        return Ok(());
    }

    println!(
        "Applied policies to {} site buckets and {} project buckets",
        report.site_bucket_count(),
        report.project_bucket_count()
    );

    if report.is_converged() {
        println!("✅ All policies applied successfully");
        return Ok(());
    }

    println!("Buckets which still appear to have incorrect policies:");
    for bucket in &report.still_incorrect {
        match &bucket.site {
            Some(site) => println!("  {} in {} at {}", bucket.name, bucket.project, site),
            None => println!("  {} in {}", bucket.name, bucket.project),
        }
    }
    bail!("Policies not applied successfully")
}

fn check_config(settings: &Settings) -> anyhow::Result<()> {
    let config = settings.load_roz_config()?;
    let buckets = BucketMap::from_config(&config)?;

    for (project, mapped) in &buckets.projects {
        let site_buckets: usize = mapped.sites.values().map(Vec::len).sum();
        println!(
            "📋 {}: {} sites, {} project buckets, {} site buckets",
            project,
            mapped.sites.len(),
            mapped.project_buckets.len(),
            site_buckets
        );
    }

    if settings.varys_config.is_some() {
        settings.amqp_uri()?;
        println!("🐇 varys profile '{}' OK", settings.varys_profile);
    }

    println!("✅ Configuration is valid");
    Ok(())
}

async fn run(command: Command, settings: &Settings) -> anyhow::Result<()> {
    settings.validate()?;

    match command {
        Command::Notifications { sleep_interval } => {
            let config = settings.load_roz_config()?;
            let buckets = BucketMap::from_config(&config)?;
            let mut service =
                NotificationService::new(connect_store(settings).await?, connect_bus(settings).await?, &buckets);
            service.run(Duration::from_secs(sleep_interval)).await?;
        }
        Command::Matcher { sleep_time } => {
            let config = Arc::new(settings.load_roz_config()?);
            let mut matcher = Matcher::new(config, connect_bus(settings).await?, onyx_client(settings)?);
            matcher.run(Duration::from_secs(sleep_time)).await?;
        }
        Command::Ingest => {
            let service = IngestService::new(
                connect_store(settings).await?,
                connect_bus(settings).await?,
                onyx_client(settings)?,
            );
            service.run().await?;
        }
        Command::Validate(args) => validate(args, settings).await?,
        Command::Controller {
            config,
            aws_credentials,
            dry_run,
        } => controller(settings, &config, &aws_credentials, dry_run).await?,
        Command::Announce { stem } => {
            let channels = channels_for(stem.as_str(), &settings.slack)?;
            let announcer = Announcer::new(connect_bus(settings).await?, Arc::new(SlackWebhook::new()), channels);
            announcer.run().await?;
        }
        Command::CheckConfig => check_config(settings)?,
    }

    Ok(())
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<RozError>().map(RozError::exit_code).unwrap_or(1)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match Settings::load(cli.settings.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("❌ Failed to load settings: {}", e);
            eprintln!("💡 {}", e.recovery_suggestion());
            std::process::exit(e.exit_code());
        }
    };

    // 初始化日誌
    let level = if cli.verbose { "DEBUG" } else { settings.log_level.as_str() };
    let service = cli.command.service();
    if let Err(e) = logger::init_logger(service, cli.command.log_file(&settings), level, cli.json_logs) {
        eprintln!("❌ {}", e);
        std::process::exit(e.exit_code());
    }

    tracing::info!(service, "Starting roz");

    let result = tokio::select! {
        result = run(cli.command, &settings) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("🛑 Interrupted, shutting down");
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::error!(service, "❌ {:#}", e);
        eprintln!("❌ {:#}", e);
        if let Some(roz_error) = e.downcast_ref::<RozError>() {
            eprintln!("💡 建議: {}", roz_error.recovery_suggestion());
        }
        std::process::exit(exit_code(&e));
    }
}
