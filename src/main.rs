use argh::FromArgs;
use sensible_recorder::sample::now_ms;
use sensible_recorder::simulated::SimulatedFactory;
use sensible_recorder::storage::LocalStorage;
use sensible_recorder::{
    FinishReport, RecorderConfig, RecorderContext, RecordingSession, SessionError, SourceConfig,
    SourceKind,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(FromArgs)]
/// Record simulated sensors into a session folder
struct Args {
    /// session name
    #[argh(option, short = 'n')]
    name: Option<String>,

    /// recording length in seconds
    #[argh(option, short = 's', default = "5")]
    seconds: u64,

    /// source to attach (repeatable), e.g. accelerometer, microphone
    #[argh(option)]
    source: Vec<String>,

    /// label to apply (repeatable), spread evenly over the recording
    #[argh(option, short = 'l')]
    label: Vec<String>,

    /// delete the session instead of keeping it
    #[argh(switch)]
    discard: bool,

    /// folder receiving session folders, overrides the config file
    #[argh(option)]
    root: Option<PathBuf>,

    /// path to the configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Args = argh::from_env();

    let loaded = match &args.config {
        Some(path) => RecorderConfig::load_from(path),
        None => RecorderConfig::load(),
    };
    let mut config = match loaded {
        Ok(c) => c,
        Err(e) => {
            log::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(root) = args.root.clone() {
        config.save_root = root;
    }

    match run(args, config).await {
        Ok(report) => {
            println!("Session {}", report.state);
            for failure in &report.failures {
                println!("  {}: {}", failure.target, failure.error);
            }
            if !report.is_clean() {
                std::process::exit(2);
            }
        }
        Err(e) => {
            log::error!("Recording failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: Args, config: RecorderConfig) -> Result<FinishReport, SessionError> {
    let context = Arc::new(
        RecorderContext::open(
            config,
            Arc::new(LocalStorage::new()),
            Arc::new(SimulatedFactory::new()),
        )
        .await?,
    );
    let mut session = RecordingSession::create(context, args.name).await?;

    let sources = if args.source.is_empty() {
        vec![SourceKind::Accelerometer.to_string(), SourceKind::Microphone.to_string()]
    } else {
        args.source
    };
    for id in &sources {
        session.attach_source_id(id, SourceConfig::default()).await?;
    }

    let report = session.start().await?;
    for (kind, error) in &report.failed {
        log::warn!("{} is not recording: {}", kind, error);
    }

    let total = Duration::from_secs(args.seconds);
    let started = tokio::time::Instant::now();
    let mut labels = args.label.iter().enumerate().peekable();
    let mut tick = tokio::time::interval(Duration::from_millis(50));

    while started.elapsed() < total {
        tick.tick().await;
        if let Err(e) = session.ingest_pending() {
            log::warn!("Some samples were rejected: {}", e);
        }

        if let Some((i, name)) = labels.peek() {
            let due = total.mul_f64(*i as f64 / args.label.len() as f64);
            if started.elapsed() >= due {
                session.begin_label(name, now_ms())?;
                labels.next();
            }
        }
    }

    println!(
        "Recorded {} into {}",
        session.name(),
        session.folder().display()
    );
    session.finish(args.discard).await
}
