use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use arcfetch::app::Services;
use arcfetch::collab::{LoggingImport, LoggingListener, LoggingManifestLoader};
use arcfetch::config::Config;
use arcfetch::loader::LoadOutcome;
use arcfetch::manifest::{ArcQuery, ManifestBuilder};
use arcfetch::query::QueryRequest;
use arcfetch::scheduler::{Progress, TaskHandle};
use arcfetch::task::{RetrieveTask, TaskSinks, TaskState};
use arcfetch::transport::{PromptNodeChooser, TransportKind, WebNodeChooser};

/// Resolve DICOM studies against a remote archive and retrieve them
#[derive(Parser, Debug)]
#[command(name = "arcfetch", version)]
struct Cli {
    /// Configuration file
    #[arg(long, short, global = true, value_name = "FILE", default_value = "arcfetch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve over QIDO-RS and download the series over WADO-RS
    Load(RequestArgs),

    /// Retrieve whole studies over the configured transport
    Retrieve(RetrieveArgs),

    /// Resolve and write the manifest of the result
    Manifest(ManifestArgs),
}

/// Invoke Image Display parameters
#[derive(Args, Debug, Clone)]
struct RequestArgs {
    /// Raw query string, e.g. `requestType=STUDY&studyUID=1.2.3`
    #[arg(long)]
    query: Option<String>,

    #[arg(long)]
    request_type: Option<String>,

    #[arg(long = "patient-id")]
    patient_ids: Vec<String>,

    #[arg(long = "study-uid")]
    study_uids: Vec<String>,

    #[arg(long = "accession-number")]
    accession_numbers: Vec<String>,

    #[arg(long = "series-uid")]
    series_uids: Vec<String>,

    #[arg(long = "object-uid")]
    object_uids: Vec<String>,

    #[arg(long)]
    lower_date_time: Option<String>,

    #[arg(long)]
    upper_date_time: Option<String>,

    #[arg(long)]
    most_recent_results: Option<String>,

    #[arg(long)]
    modalities_in_study: Option<String>,

    #[arg(long)]
    keywords: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct RetrieveArgs {
    /// Study Instance UID (repeat for a batch)
    #[arg(long = "study", required = true)]
    studies: Vec<String>,

    /// Override `retrieve.transport` (CGET, CMOVE or WADO)
    #[arg(long)]
    transport: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct ManifestArgs {
    #[command(flatten)]
    request: RequestArgs,

    /// Output file; defaults to a `wado_*.xml` file in the temp folder
    #[arg(long, short)]
    output: Option<PathBuf>,
}

impl RequestArgs {
    fn to_request(&self) -> QueryRequest {
        if let Some(query) = &self.query {
            return QueryRequest::from_query_string(query);
        }
        let mut params: HashMap<String, Vec<String>> = HashMap::new();
        let mut put = |name: &str, values: Vec<String>| {
            if !values.is_empty() {
                params.insert(name.to_string(), values);
            }
        };
        put("requestType", self.request_type.iter().cloned().collect());
        put("patientID", self.patient_ids.clone());
        put("studyUID", self.study_uids.clone());
        put("accessionNumber", self.accession_numbers.clone());
        put("seriesUID", self.series_uids.clone());
        put("objectUID", self.object_uids.clone());
        put("lowerDateTime", self.lower_date_time.iter().cloned().collect());
        put("upperDateTime", self.upper_date_time.iter().cloned().collect());
        put("mostRecentResults", self.most_recent_results.iter().cloned().collect());
        put("modalitiesInStudy", self.modalities_in_study.iter().cloned().collect());
        put("keywords", self.keywords.iter().cloned().collect());
        QueryRequest::from_params(&params)
    }
}

async fn load(services: &Services, args: &RequestArgs) -> anyhow::Result<()> {
    let loader = services.loader(Arc::new(LoggingImport));
    match loader.load(&args.to_request()).await? {
        LoadOutcome::Started(handle) => {
            let cancel = handle.cancel.clone();
            let tasks = handle.tasks.clone();
            let progress = tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(2));
                loop {
                    interval.tick().await;
                    let p = Progress::aggregate(tasks.iter().map(TaskHandle::progress));
                    tracing::info!("download {}% ({} done, {} failed)", p.percent, p.completed, p.failed);
                }
            });
            let ctrl_c = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("cancelling downloads");
                    cancel.cancel();
                }
            });
            loader.complete(handle).await;
            progress.abort();
            ctrl_c.abort();
        }
        LoadOutcome::Deferred(plan) => {
            tracing::info!(
                "{} series resolved, downloads not started (download.start_immediately = false)",
                plan.jobs.len()
            );
        }
    }
    Ok(())
}

async fn retrieve(services: &Services, args: &RetrieveArgs) -> anyhow::Result<TaskState> {
    let chooser: Option<Arc<dyn WebNodeChooser>> = if services.config.retrieve.interactive {
        Some(Arc::new(PromptNodeChooser::stdio()))
    } else {
        None
    };
    let registry = services.registry(Some(services.store_listener()), chooser);
    let sinks = TaskSinks {
        listener: Arc::new(LoggingListener),
        import: Arc::new(LoggingImport),
        manifest_loader: Arc::new(LoggingManifestLoader),
    };
    let mut task = RetrieveTask::new(registry, args.studies.clone(), sinks, services.events.clone());
    if let Some(transport) = &args.transport {
        task = task.with_transport(transport.parse::<TransportKind>()?);
    }
    let task = Arc::new(task);

    let for_signal = Arc::clone(&task);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            for_signal.cancel();
        }
    });
    let state = task.run().await;
    ctrl_c.abort();
    Ok(state)
}

async fn manifest(services: &Services, args: &ManifestArgs) -> anyhow::Result<()> {
    let report = services.resolver().resolve(&args.request.to_request()).await;
    let mut builder = ManifestBuilder::new();
    builder.add_patients(services.model.snapshot_studies(&report.study_uids()));

    let archive = &services.config.archive;
    let arc = ArcQuery {
        arc_id: archive.id.clone(),
        base_url: archive.base_url.clone(),
        web_login: archive.web_login.clone(),
        http_tags: archive.retrieve_header_pairs(),
        ..ArcQuery::default()
    };
    let Some(xml) = builder.xml_manifest(&arc, None)? else {
        tracing::warn!("nothing resolved, no manifest written");
        return Ok(());
    };
    let path = match &args.output {
        Some(path) => {
            tokio::fs::write(path, xml.as_bytes())
                .await
                .with_context(|| format!("cannot write {}", path.display()))?;
            path.clone()
        }
        None => services
            .storage
            .write_manifest(&xml)
            .map_err(|e| anyhow::anyhow!("{}", e))?,
    };
    tracing::info!("manifest written to {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    arcfetch::init_logging(&config.logging)?;
    tracing::info!("🔧 Starting arcfetch for archive '{}'", config.archive.id);

    let services = Services::build(config)?;
    match &cli.command {
        Commands::Load(args) => load(&services, args).await?,
        Commands::Retrieve(args) => {
            let state = retrieve(&services, args).await?;
            if state == TaskState::Failure {
                anyhow::bail!("retrieve failed");
            }
        }
        Commands::Manifest(args) => manifest(&services, args).await?,
    }
    Ok(())
}
