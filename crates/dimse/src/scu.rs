//! Service Class User (SCU) implementation for outbound DIMSE operations
//!
//! C-FIND, C-GET and C-MOVE are executed through the DCMTK command line
//! tools (`findscu`, `getscu`, `movescu`). Every invocation carries explicit
//! connection (`-to`), association (`-ta`) and DIMSE (`-td`) timeouts.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use dicom_object::mem::InMemDicomObject;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{DimseConfig, RemoteNode};
use crate::types::{
    DimseState, DimseStatus, FindQuery, QueryLevel, RetrieveQuery, SubOperations,
    TransferContext,
};
use crate::{DimseError, Result};

const PROGRESS_POLL: Duration = Duration::from_millis(250);

/// Outbound query/retrieve operations.
///
/// [`DimseScu`] is the production implementation; tests substitute their own.
#[async_trait]
pub trait ScuOperations: Send + Sync {
    /// Calling AE title used for associations (and as C-MOVE destination)
    fn calling_aet(&self) -> &str;

    /// C-FIND: every matching identifier
    async fn find(&self, node: &RemoteNode, query: FindQuery) -> Result<Vec<InMemDicomObject>>;

    /// C-GET: instances are stored into `ctx.output_dir`
    async fn get(
        &self,
        node: &RemoteNode,
        query: RetrieveQuery,
        ctx: TransferContext,
    ) -> Result<DimseState>;

    /// C-MOVE towards `destination_aet`; `ctx.output_dir` is the listener's
    /// storage directory and is only watched for progress
    async fn move_to(
        &self,
        node: &RemoteNode,
        query: RetrieveQuery,
        destination_aet: &str,
        ctx: TransferContext,
    ) -> Result<DimseState>;
}

/// DIMSE Service Class User
#[derive(Debug, Clone)]
pub struct DimseScu {
    config: DimseConfig,
}

impl DimseScu {
    /// Create a new SCU with the given configuration
    pub fn new(config: DimseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DimseConfig {
        &self.config
    }

    /// Get connection timeout for a node (uses node-specific or global setting)
    fn get_connection_timeout(&self, node: &RemoteNode) -> Duration {
        node.connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.connect_timeout())
    }

    /// Association and timeout arguments shared by all tools
    fn association_args(&self, node: &RemoteNode) -> Vec<String> {
        vec![
            "-aet".into(),
            self.config.local_aet.clone(),
            "-aec".into(),
            node.ae_title.clone(),
            "-to".into(),
            timeout_secs(self.get_connection_timeout(node)),
            "-ta".into(),
            timeout_secs(self.config.accept_timeout()),
            "-td".into(),
            timeout_secs(self.config.dimse_timeout()),
        ]
    }

    fn find_args(&self, node: &RemoteNode, query: &FindQuery, out_dir: &Path) -> Vec<String> {
        let mut args = self.association_args(node);
        args.push(information_model(query.query_level).into());
        args.push("-k".into());
        args.push(format!("QueryRetrieveLevel={}", query.query_level));
        for (k, v) in query.parameters.iter() {
            args.push("-k".into());
            args.push(format!("{}={}", dcmtk_key(k), v));
        }
        args.push("-X".into());
        args.push("-od".into());
        args.push(out_dir.to_string_lossy().to_string());
        args.push(node.host.clone());
        args.push(node.port.to_string());
        args
    }

    fn retrieve_args(&self, node: &RemoteNode, query: &RetrieveQuery) -> Vec<String> {
        let mut args = self.association_args(node);
        args.push("-v".into());
        args.push("-S".into());
        args.push("-k".into());
        args.push(format!("QueryRetrieveLevel={}", query.query_level));
        args.push("-k".into());
        args.push(format!("(0020,000D)={}", query.study_uids.join("\\")));
        if !query.series_uids.is_empty() {
            args.push("-k".into());
            args.push(format!("(0020,000E)={}", query.series_uids.join("\\")));
        }
        args
    }

    /// Run a retrieve tool, polling the output directory for progress and
    /// killing the tool when the operation is cancelled
    async fn run_transfer(
        &self,
        program: &str,
        args: Vec<String>,
        query: &RetrieveQuery,
        ctx: &TransferContext,
    ) -> Result<DimseState> {
        debug!("Running {} args: {:?}", program, args);
        let mut child = Command::new(program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DimseError::operation_failed(format!("Failed to spawn {}: {}", program, e))
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = tokio::spawn(read_pipe(stdout));
        let err_task = tokio::spawn(read_pipe(stderr));

        let expected = query.expected_instances.unwrap_or(0);
        let mut ticker = tokio::time::interval(PROGRESS_POLL);
        let mut last_count = 0u32;

        let exit = loop {
            tokio::select! {
                status = child.wait() => break Some(status?),
                _ = ctx.cancel.cancelled() => {
                    info!("{} cancelled, stopping tool", program);
                    if let Err(e) = child.kill().await {
                        warn!("Failed to stop {}: {}", program, e);
                    }
                    break None;
                }
                _ = ticker.tick() => {
                    let count = count_files(&ctx.output_dir).await;
                    if count != last_count {
                        last_count = count;
                        ctx.report(progress_counts(count, expected));
                    }
                }
            }
        };

        let stdout = out_task.await.unwrap_or_default();
        let stderr = err_task.await.unwrap_or_default();
        let received = count_files(&ctx.output_dir).await;

        let Some(exit) = exit else {
            let sub_ops = progress_counts(received, expected);
            ctx.report(sub_ops);
            return Ok(DimseState::new(DimseStatus::Cancel).with_sub_ops(sub_ops));
        };

        let transcript = format!("{}\n{}", stdout, stderr);
        if !exit.success() {
            if let Some(err) = classify_failure(&transcript) {
                error!("{} failed: status={:?}, {}", program, exit.code(), err);
                return Err(err);
            }
        }

        let sub_ops = parse_sub_operations(&transcript)
            .unwrap_or_else(|| progress_counts(received, expected).finished());
        let status = final_status(parse_final_status(&transcript), exit.success(), &sub_ops);
        ctx.report(sub_ops);

        let mut state = DimseState::new(status).with_sub_ops(sub_ops);
        if !matches!(status, DimseStatus::Success | DimseStatus::Cancel) {
            if let Some(line) = last_diagnostic(&stderr) {
                state = state.with_message(line);
            }
        }
        info!(
            "{} finished: status={:?}, completed={}, failed={}",
            program, state.status, sub_ops.completed, sub_ops.failed
        );
        Ok(state)
    }
}

#[async_trait]
impl ScuOperations for DimseScu {
    fn calling_aet(&self) -> &str {
        &self.config.local_aet
    }

    async fn find(&self, node: &RemoteNode, query: FindQuery) -> Result<Vec<InMemDicomObject>> {
        info!("Sending C-FIND to {} (level: {})", node, query.query_level);
        node.validate()?;
        debug!("C-FIND query parameters: {:?}", query.parameters);

        let out_dir = self
            .config
            .storage_dir
            .join(format!("dcmtk_find_{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&out_dir).await?;

        let args = self.find_args(node, &query, &out_dir);
        debug!("Running findscu args: {:?}", args);
        let output = Command::new("findscu")
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DimseError::operation_failed(format!("Failed to spawn findscu: {}", e)));

        let result = match output {
            Ok(out) if out.status.success() => read_find_responses(&out_dir).await,
            Ok(out) => {
                let transcript = format!(
                    "{}\n{}",
                    String::from_utf8_lossy(&out.stdout),
                    String::from_utf8_lossy(&out.stderr)
                );
                warn!("findscu failed: status={:?}, {}", out.status.code(), transcript.trim());
                Err(classify_failure(&transcript).unwrap_or_else(|| {
                    DimseError::operation_failed(format!(
                        "findscu failed: {:?}",
                        out.status.code()
                    ))
                }))
            }
            Err(e) => Err(e),
        };

        if let Err(e) = tokio::fs::remove_dir_all(&out_dir).await {
            debug!("Failed to remove {:?}: {}", out_dir, e);
        }
        result
    }

    async fn get(
        &self,
        node: &RemoteNode,
        query: RetrieveQuery,
        ctx: TransferContext,
    ) -> Result<DimseState> {
        info!(
            "Sending C-GET to {} (level: {}, studies: {})",
            node,
            query.query_level,
            query.study_uids.len()
        );
        node.validate()?;
        tokio::fs::create_dir_all(&ctx.output_dir).await?;

        let mut args = self.retrieve_args(node, &query);
        args.push("-od".into());
        args.push(ctx.output_dir.to_string_lossy().to_string());
        args.push(node.host.clone());
        args.push(node.port.to_string());

        self.run_transfer("getscu", args, &query, &ctx).await
    }

    async fn move_to(
        &self,
        node: &RemoteNode,
        query: RetrieveQuery,
        destination_aet: &str,
        ctx: TransferContext,
    ) -> Result<DimseState> {
        info!(
            "Sending C-MOVE to {} (level: {}, dest: {})",
            node, query.query_level, destination_aet
        );
        node.validate()?;

        let mut args = self.retrieve_args(node, &query);
        args.push("-aem".into());
        args.push(destination_aet.to_string());
        args.push(node.host.clone());
        args.push(node.port.to_string());

        self.run_transfer("movescu", args, &query, &ctx).await
    }
}

impl SubOperations {
    fn finished(mut self) -> Self {
        self.remaining = 0;
        self
    }
}

fn information_model(level: QueryLevel) -> &'static str {
    match level {
        QueryLevel::Patient => "-P",
        _ => "-S",
    }
}

/// `0020000D` becomes `(0020,000D)`; keywords pass through unchanged
fn dcmtk_key(key: &str) -> String {
    if key.len() == 8 && key.chars().all(|c| c.is_ascii_hexdigit()) {
        format!("({},{})", &key[0..4], &key[4..8])
    } else {
        key.to_string()
    }
}

/// DCMTK takes timeouts in whole seconds
fn timeout_secs(d: Duration) -> String {
    let secs = (d.as_millis() as u64).div_ceil(1000).max(1);
    secs.to_string()
}

fn progress_counts(received: u32, expected: u32) -> SubOperations {
    SubOperations {
        completed: received,
        remaining: expected.saturating_sub(received),
        ..Default::default()
    }
}

async fn read_pipe<R>(pipe: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let mut bytes = Vec::new();
        if pipe.read_to_end(&mut bytes).await.is_ok() {
            buf = String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    buf
}

async fn count_files(dir: &Path) -> u32 {
    let mut count = 0;
    if let Ok(mut rd) = tokio::fs::read_dir(dir).await {
        while let Ok(Some(entry)) = rd.next_entry().await {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                count += 1;
            }
        }
    }
    count
}

async fn read_find_responses(out_dir: &Path) -> Result<Vec<InMemDicomObject>> {
    let mut paths = Vec::new();
    let mut rd = tokio::fs::read_dir(out_dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("dcm") {
            paths.push(path);
        }
    }
    // rsp0001.dcm, rsp0002.dcm, ... in response order
    paths.sort();

    let mut objects = Vec::with_capacity(paths.len());
    for path in paths {
        match dicom_object::open_file(&path) {
            Ok(obj) => objects.push(obj.into_inner()),
            Err(e) => warn!("Skipping unreadable C-FIND response {:?}: {}", path, e),
        }
    }
    info!("C-FIND completed with {} matches", objects.len());
    Ok(objects)
}

/// Map DCMTK diagnostics to an error, when they identify one
fn classify_failure(transcript: &str) -> Option<DimseError> {
    let lower = transcript.to_lowercase();
    let line = last_diagnostic(transcript).unwrap_or_default();
    if lower.contains("association rejected") {
        return Some(DimseError::AssociationRejected(line));
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        return Some(DimseError::Timeout(line));
    }
    if lower.contains("connection refused")
        || lower.contains("association request failed")
        || lower.contains("tcp initialization error")
    {
        return Some(DimseError::Network(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            line,
        )));
    }
    None
}

/// Last `0xNNNN` status reported by the tool
/// Status reported for a finished tool. A tool exiting non-zero never
/// reports success, whatever its last logged response said.
fn final_status(parsed: Option<u16>, exited_ok: bool, sub_ops: &SubOperations) -> DimseStatus {
    match (parsed.map(DimseStatus::from_code), exited_ok) {
        (Some(status), true) => status,
        (Some(status @ (DimseStatus::Failure(_) | DimseStatus::Cancel)), false) => status,
        // Processing failure
        (_, false) => DimseStatus::Failure(0x0110),
        (None, true) if sub_ops.failed > 0 => DimseStatus::Warning(0xB000),
        (None, true) => DimseStatus::Success,
    }
}

fn parse_final_status(transcript: &str) -> Option<u16> {
    transcript
        .lines()
        .filter(|l| l.to_lowercase().contains("status"))
        .filter_map(|l| {
            let idx = l.find("0x")?;
            let hex: String = l[idx + 2..]
                .chars()
                .take_while(|c| c.is_ascii_hexdigit())
                .collect();
            if hex.len() == 4 {
                u16::from_str_radix(&hex, 16).ok()
            } else {
                None
            }
        })
        .last()
}

/// Final sub-operation counters from a verbose C-GET/C-MOVE transcript
fn parse_sub_operations(transcript: &str) -> Option<SubOperations> {
    let mut ops = SubOperations::default();
    let mut seen = false;
    for line in transcript.lines() {
        let lower = line.to_lowercase();
        if !lower.contains("sub") || !lower.contains("operations") {
            continue;
        }
        let Some(value) = line
            .rsplit(':')
            .next()
            .and_then(|v| v.trim().parse::<u32>().ok())
        else {
            continue;
        };
        if lower.contains("remaining") {
            ops.remaining = value;
        } else if lower.contains("completed") {
            ops.completed = value;
        } else if lower.contains("failed") {
            ops.failed = value;
        } else if lower.contains("warning") {
            ops.warning = value;
        } else {
            continue;
        }
        seen = true;
    }
    seen.then_some(ops)
}

fn last_diagnostic(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| l.starts_with('E') || l.starts_with('F') || l.contains("rror"))
        .last()
        .map(|l| l.to_string())
}
