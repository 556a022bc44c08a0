//! Reconciliation pipeline orchestration: normalize fetched journal rows,
//! resolve the incremental watermark, merge with the published snapshot, and
//! replace it in the sink.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use calamine::{Data, Reader, Xlsx};
use chrono::{DateTime, Utc};
use jrex_core::{decide_country, CellValue, OutputRow, RawRow, RecordId, SNAPSHOT_COLUMNS};
use jrex_source::{
    completed_filter, journal_pipeline, map_document, DataApiConfig, DataApiStore, DocumentStore,
    SourceError, JOURNALS_COLLECTION,
};
use jrex_store::{load_service_account, DriveStore, ObjectStore};
use regex::Regex;
use rust_xlsxwriter::Workbook;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jrex-sync";

pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const DEFAULT_SNAPSHOT_NAME: &str = "journal-data.xlsx";
const SHEET_NAME: &str = "journals";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    MissingKey(&'static str),
    #[error("invalid run mode {0:?}; expected \"full\" or \"inc\"")]
    InvalidMode(String),
    #[error("reading config file {path}: {source}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("writing inline credential to {path}: {source}")]
    CredentialWrite {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("service-account file not found at {0}")]
    CredentialMissing(PathBuf),
}

/// Full re-fetches every completed journal; incremental resumes past the
/// snapshot watermark and appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Full,
    Incremental,
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "inc" | "incremental" => Ok(Self::Incremental),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub source: SourceSection,
    pub sink: SinkSection,
    pub run_mode: Option<String>,
    pub credentials: CredentialsSection,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct SourceSection {
    pub endpoint: Option<String>,
    pub data_source: Option<String>,
    pub database: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct SinkSection {
    pub container_id: Option<String>,
    pub snapshot_name: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialsSection {
    pub path: Option<PathBuf>,
    pub inline: Option<String>,
}

/// CLI-level knobs that outrank both environment and config file.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub mode: Option<RunMode>,
    pub snapshot_name: Option<String>,
    pub container_id: Option<String>,
}

/// Fully-resolved run configuration. Every required setting is present by the
/// time this exists; construction fails before any I/O otherwise.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub source_endpoint: String,
    pub source_data_source: String,
    pub source_database: String,
    pub source_api_key: String,
    pub container_id: String,
    pub snapshot_name: String,
    pub mode: RunMode,
    pub credential_path: PathBuf,
    pub credential_inline: Option<String>,
}

impl RunConfig {
    pub fn load(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let file = load_config_file(overrides.config_path.as_deref())?;
        Self::resolve(file, env_lookup, overrides)
    }

    fn resolve(
        file: ConfigFile,
        env: impl Fn(&str) -> Option<String>,
        overrides: &ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let pick = |key: &'static str, file_value: Option<String>| env(key).or(file_value);

        let source_endpoint = pick("JREX_SOURCE_ENDPOINT", file.source.endpoint)
            .ok_or(ConfigError::MissingKey("JREX_SOURCE_ENDPOINT"))?;
        let source_data_source = pick("JREX_SOURCE_CLUSTER", file.source.data_source)
            .ok_or(ConfigError::MissingKey("JREX_SOURCE_CLUSTER"))?;
        let source_database = pick("JREX_SOURCE_DATABASE", file.source.database)
            .ok_or(ConfigError::MissingKey("JREX_SOURCE_DATABASE"))?;
        let source_api_key = pick("JREX_SOURCE_API_KEY", file.source.api_key)
            .ok_or(ConfigError::MissingKey("JREX_SOURCE_API_KEY"))?;

        let container_id = overrides
            .container_id
            .clone()
            .or_else(|| pick("JREX_CONTAINER_ID", file.sink.container_id))
            .ok_or(ConfigError::MissingKey("JREX_CONTAINER_ID"))?;
        let snapshot_name = overrides
            .snapshot_name
            .clone()
            .or_else(|| pick("JREX_SNAPSHOT_NAME", file.sink.snapshot_name))
            .unwrap_or_else(|| DEFAULT_SNAPSHOT_NAME.to_string());

        let mode = match overrides.mode {
            Some(mode) => mode,
            None => match pick("JREX_RUN_MODE", file.run_mode) {
                Some(raw) => raw.parse()?,
                None => RunMode::Incremental,
            },
        };

        let credential_path = pick(
            "JREX_SA_PATH",
            file.credentials.path.map(|p| p.display().to_string()),
        )
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("drive-sa.json"));
        let credential_inline = pick("JREX_SA_JSON", file.credentials.inline);

        Ok(Self {
            source_endpoint,
            source_data_source,
            source_database,
            source_api_key,
            container_id,
            snapshot_name,
            mode,
            credential_path,
            credential_inline,
        })
    }

    /// Materialize the service-account file: inline JSON (the CI path) is
    /// written to `credential_path` first, then the path must exist.
    pub fn ensure_credentials(&self) -> Result<PathBuf, ConfigError> {
        if let Some(inline) = &self.credential_inline {
            std::fs::write(&self.credential_path, inline).map_err(|source| {
                ConfigError::CredentialWrite {
                    path: self.credential_path.clone(),
                    source,
                }
            })?;
        }
        if !self.credential_path.exists() {
            return Err(ConfigError::CredentialMissing(self.credential_path.clone()));
        }
        Ok(self.credential_path.clone())
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn load_config_file(explicit: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => match env_lookup("JREX_CONFIG") {
            Some(p) => Some(PathBuf::from(p)),
            None => {
                let default = PathBuf::from("jrex.yaml");
                default.exists().then_some(default)
            }
        },
    };
    let Some(path) = path else {
        return Ok(ConfigFile::default());
    };
    let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::File {
        path: path.clone(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })
}

/// Row normalization. Total over arbitrary input: malformed cells degrade to
/// per-field defaults, and the whole transform is stable under re-application
/// so a merged union can be cleaned again without drift.
pub struct Normalizer {
    whitespace: Regex,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Self {
            whitespace: Regex::new(r"\s{2,}").expect("static pattern compiles"),
        }
    }

    pub fn clean(&self, rows: Vec<RawRow>) -> Vec<OutputRow> {
        let cleaned: Vec<OutputRow> = rows.into_iter().map(|row| self.clean_row(row)).collect();
        dedup_last_wins(cleaned)
    }

    fn clean_row(&self, row: RawRow) -> OutputRow {
        let address_for_check = if row.address.is_empty() {
            row.n_place.as_str()
        } else {
            row.address.as_str()
        };
        // Rows coming back around through a merge no longer carry the
        // LocCountry intermediate; their previously resolved country stands
        // in for it so re-cleaning cannot wipe an explicit non-US value.
        let explicit_country = if row.loc_country.trim().is_empty() {
            row.country.as_str()
        } else {
            row.loc_country.as_str()
        };
        let country = decide_country(address_for_check, &row.state, explicit_country);

        OutputRow {
            journal_id: row.journal_id,
            user_name: row.user_name,
            user_email: row.user_email,
            timestamp: row.timestamp.to_text(),
            end_date_time: row.end_date_time.to_text(),
            n_name: row.n_name,
            city: row.city,
            state: row.state,
            zip: row.zip,
            country,
            n_place: self.tidy_place(&row.n_place),
            n_lati: row.n_lati.as_f64().map(round6),
            n_long: row.n_long.as_f64().map(round6),
            n_park_nbr: row.n_park_nbr,
        }
    }

    fn tidy_place(&self, place: &str) -> String {
        let collapsed = self.whitespace.replace_all(place, " ");
        collapsed.trim_matches(&[' ', ','][..]).to_string()
    }
}

fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// Keep the last occurrence of each `journal_id`, in its position; earlier
/// duplicates drop out. Concatenating new rows after old therefore makes the
/// newest fetch win a merge.
fn dedup_last_wins(rows: Vec<OutputRow>) -> Vec<OutputRow> {
    let mut last_index: HashMap<String, usize> = HashMap::new();
    for (index, row) in rows.iter().enumerate() {
        last_index.insert(row.journal_id.clone(), index);
    }
    rows.into_iter()
        .enumerate()
        .filter(|(index, row)| last_index[&row.journal_id] == *index)
        .map(|(_, row)| row)
        .collect()
}

/// Resume point recorded in a previously persisted snapshot: the maximum
/// parseable identity, compared as identities rather than strings.
/// Unparseable values are skipped; none parseable (or no rows) means the next
/// fetch runs full.
pub fn resolve_watermark(rows: &[RawRow]) -> Option<RecordId> {
    rows.iter()
        .filter_map(|row| row.journal_id.parse::<RecordId>().ok())
        .max()
}

/// Fetch completed journals newer than the watermark, already joined,
/// projected, and sorted. A watermark that fails to parse degrades to a full
/// fetch rather than failing the run.
pub async fn fetch_new(
    store: &dyn DocumentStore,
    watermark: Option<&str>,
) -> Result<(Vec<RawRow>, Option<RecordId>), SourceError> {
    let after = match watermark {
        None => None,
        Some(raw) => match raw.parse::<RecordId>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(watermark = raw, "watermark does not parse; running a full fetch");
                None
            }
        },
    };

    let pipeline = journal_pipeline(completed_filter(after.as_ref()));
    let documents = store.aggregate(JOURNALS_COLLECTION, &pipeline).await?;

    let mut rows: Vec<RawRow> = documents.iter().map(map_document).collect();
    rows.sort_by(|a, b| a.journal_id.cmp(&b.journal_id));
    let new_watermark = rows.last().and_then(|row| row.journal_id.parse().ok());
    Ok((rows, new_watermark))
}

/// Encode rows as the single-sheet snapshot: the fixed 14-column header, one
/// data row per journal, blank cells for absent coordinates.
pub fn encode_snapshot(rows: &[OutputRow]) -> anyhow::Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name(SHEET_NAME).context("naming snapshot sheet")?;

    for (col, header) in SNAPSHOT_COLUMNS.iter().enumerate() {
        sheet.write_string(0, col as u16, *header)?;
    }

    for (index, row) in rows.iter().enumerate() {
        let r = (index + 1) as u32;
        sheet.write_string(r, 0, row.journal_id.as_str())?;
        sheet.write_string(r, 1, row.user_name.as_str())?;
        sheet.write_string(r, 2, row.user_email.as_str())?;
        sheet.write_string(r, 3, row.timestamp.as_str())?;
        sheet.write_string(r, 4, row.end_date_time.as_str())?;
        sheet.write_string(r, 5, row.n_name.as_str())?;
        sheet.write_string(r, 6, row.city.as_str())?;
        sheet.write_string(r, 7, row.state.as_str())?;
        sheet.write_string(r, 8, row.zip.as_str())?;
        sheet.write_string(r, 9, row.country.as_str())?;
        sheet.write_string(r, 10, row.n_place.as_str())?;
        if let Some(lat) = row.n_lati {
            sheet.write_number(r, 11, lat)?;
        }
        if let Some(lng) = row.n_long {
            sheet.write_number(r, 12, lng)?;
        }
        sheet.write_string(r, 13, row.n_park_nbr.as_str())?;
    }

    workbook
        .save_to_buffer()
        .context("serializing snapshot workbook")
}

/// Decode a snapshot back into raw rows, cells as text; numeric and date
/// parsing stays the normalizer's job. Empty or unreadable bytes decode to no
/// rows (logged), never an error, so a missing or corrupt remote snapshot
/// simply means a full rebuild.
pub fn decode_snapshot(bytes: &[u8]) -> Vec<RawRow> {
    if bytes.is_empty() {
        return Vec::new();
    }

    let cursor = std::io::Cursor::new(bytes);
    let mut workbook: Xlsx<_> = match Xlsx::new(cursor) {
        Ok(workbook) => workbook,
        Err(err) => {
            warn!(error = %err, "existing snapshot is not readable; treating as empty");
            return Vec::new();
        }
    };
    let range = match workbook.worksheet_range_at(0) {
        Some(Ok(range)) => range,
        _ => {
            warn!("existing snapshot has no readable sheet; treating as empty");
            return Vec::new();
        }
    };

    let mut rows_iter = range.rows();
    let Some(header) = rows_iter.next() else {
        return Vec::new();
    };
    let index: HashMap<String, usize> = header
        .iter()
        .enumerate()
        .map(|(i, cell)| (cell_to_string(cell), i))
        .collect();
    let col = |name: &str| index.get(name).copied();
    let columns = [
        col("journal_id"),
        col("User Name"),
        col("User email"),
        col("Timestamp"),
        col("End Date Time"),
        col("n_Name"),
        col("City"),
        col("State"),
        col("Zip"),
        col("Country"),
        col("n_Place"),
        col("n_Lati"),
        col("n_Long"),
        col("n_park_nbr"),
    ];

    rows_iter
        .map(|cells| {
            let text = |slot: usize| column_text(cells, columns[slot]);
            RawRow {
                journal_id: text(0),
                user_name: text(1),
                user_email: text(2),
                timestamp: CellValue::from_text(text(3)),
                end_date_time: CellValue::from_text(text(4)),
                n_name: text(5),
                city: text(6),
                state: text(7),
                zip: text(8),
                country: text(9),
                n_place: text(10),
                n_lati: CellValue::from_text(text(11)),
                n_long: CellValue::from_text(text(12)),
                n_park_nbr: text(13),
                loc_country: String::new(),
                address: String::new(),
            }
        })
        .collect()
}

fn column_text(cells: &[Data], index: Option<usize>) -> String {
    index
        .and_then(|i| cells.get(i))
        .map(cell_to_string)
        .unwrap_or_default()
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(v) => v.to_string(),
        Data::Float(v) => v.to_string(),
        Data::Bool(v) => v.to_string(),
        Data::DateTime(dt) => dt.as_f64().to_string(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: RunMode,
    pub fetched_rows: usize,
    pub snapshot_rows: usize,
    pub snapshot_bytes: u64,
    pub snapshot_sha256: String,
    pub snapshot_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub enum RunOutcome {
    Uploaded(RunSummary),
    NoNewData,
}

/// One end-to-end reconciliation pass. All I/O is strictly sequential; the
/// snapshot is read at most once and replaced at most once, and a run that
/// finds nothing new leaves the sink untouched.
pub struct ReconciliationEngine {
    source: Arc<dyn DocumentStore>,
    sink: Arc<dyn ObjectStore>,
    normalizer: Normalizer,
    snapshot_name: String,
    mode: RunMode,
}

impl ReconciliationEngine {
    pub fn new(
        source: Arc<dyn DocumentStore>,
        sink: Arc<dyn ObjectStore>,
        snapshot_name: impl Into<String>,
        mode: RunMode,
    ) -> Self {
        Self {
            source,
            sink,
            normalizer: Normalizer::new(),
            snapshot_name: snapshot_name.into(),
            mode,
        }
    }

    pub async fn run_once(&self) -> anyhow::Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, mode = ?self.mode, snapshot = %self.snapshot_name, "starting reconciliation run");

        self.source
            .ping()
            .await
            .context("document store unreachable; check the source endpoint and api key")?;
        self.sink
            .check_container()
            .await
            .context("snapshot container inaccessible")?;

        // Incremental runs read the snapshot up front for the watermark and
        // keep the rows for the merge; full runs defer the read until a merge
        // is actually needed.
        let mut existing = match self.mode {
            RunMode::Full => Vec::new(),
            RunMode::Incremental => self.load_existing().await?,
        };
        let watermark = match self.mode {
            RunMode::Full => None,
            RunMode::Incremental => resolve_watermark(&existing),
        };
        info!(watermark = ?watermark.map(|id| id.to_string()), "resume point determined");

        let watermark_text = watermark.map(|id| id.to_string());
        let (new_rows, new_watermark) =
            fetch_new(self.source.as_ref(), watermark_text.as_deref())
                .await
                .context("fetching new journal records")?;
        let fetched_rows = new_rows.len();
        if new_rows.is_empty() {
            info!("no new journal records; leaving the existing snapshot untouched");
            return Ok(RunOutcome::NoNewData);
        }
        info!(rows = fetched_rows, watermark = ?new_watermark.map(|id| id.to_string()), "fetched new records");

        let cleaned_new = self.normalizer.clean(new_rows);

        if self.mode == RunMode::Full {
            existing = self.load_existing().await?;
        }

        let mut union = existing;
        union.extend(cleaned_new.into_iter().map(OutputRow::into_raw));
        let merged = self.normalizer.clean(union);

        let bytes = encode_snapshot(&merged)?;
        let snapshot_sha256 = hex::encode(Sha256::digest(&bytes));
        self.sink
            .upload(&self.snapshot_name, XLSX_CONTENT_TYPE, &bytes)
            .await
            .with_context(|| format!("uploading {}", self.snapshot_name))?;

        let finished_at = Utc::now();
        info!(rows = merged.len(), bytes = bytes.len(), "snapshot replaced");
        Ok(RunOutcome::Uploaded(RunSummary {
            run_id,
            started_at,
            finished_at,
            mode: self.mode,
            fetched_rows,
            snapshot_rows: merged.len(),
            snapshot_bytes: bytes.len() as u64,
            snapshot_sha256,
            snapshot_name: self.snapshot_name.clone(),
        }))
    }

    async fn load_existing(&self) -> anyhow::Result<Vec<RawRow>> {
        let bytes = self
            .sink
            .download(&self.snapshot_name)
            .await
            .with_context(|| format!("downloading {}", self.snapshot_name))?;
        Ok(decode_snapshot(&bytes))
    }
}

/// Wire up the real collaborators from config and run one pass.
pub async fn run_from_config(config: RunConfig) -> anyhow::Result<RunOutcome> {
    let (source, sink) = build_collaborators(&config)?;
    let engine = ReconciliationEngine::new(source, sink, config.snapshot_name.clone(), config.mode);
    engine.run_once().await
}

/// Connectivity checks only; nothing is fetched or written.
pub async fn check_from_config(config: RunConfig) -> anyhow::Result<()> {
    let (source, sink) = build_collaborators(&config)?;
    source
        .ping()
        .await
        .context("document store unreachable; check the source endpoint and api key")?;
    sink.check_container()
        .await
        .context("snapshot container inaccessible")?;
    info!("source and sink are both reachable");
    Ok(())
}

fn build_collaborators(
    config: &RunConfig,
) -> anyhow::Result<(Arc<dyn DocumentStore>, Arc<dyn ObjectStore>)> {
    let sa_path = config.ensure_credentials()?;
    let key = load_service_account(&sa_path)?;

    let source = DataApiStore::new(DataApiConfig {
        endpoint: config.source_endpoint.clone(),
        api_key: config.source_api_key.clone(),
        data_source: config.source_data_source.clone(),
        database: config.source_database.clone(),
        timeout: Duration::from_secs(60),
    })
    .context("building document store client")?;

    let sink = DriveStore::new(key, config.container_id.clone())
        .context("building snapshot store client")?;
    info!(principal = sink.principal(), container = %config.container_id, "collaborators ready");

    Ok((Arc::new(source), Arc::new(sink)))
}
