use chrono::Utc;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{error, info};

use crate::error::SweepError;
use crate::record::{ColumnSchema, ResultRecord};

/// Append-only collection of result rows with a fixed column schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultTable {
    schema: ColumnSchema,
    rows: Vec<ResultRecord>,
}

impl ResultTable {
    pub fn new(schema: ColumnSchema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, record: ResultRecord) {
        self.rows.push(record);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[ResultRecord] {
        &self.rows
    }

    pub fn schema(&self) -> ColumnSchema {
        self.schema
    }

    /// Renders the table as CSV. Rows are sorted so the bytes depend only on
    /// the set of records, not on the order jobs happened to finish in.
    pub fn to_csv(&self) -> String {
        let mut sorted: Vec<&ResultRecord> = self.rows.iter().collect();
        sorted.sort();
        let mut out = String::new();
        out.push_str(&self.schema.header().join(","));
        out.push('\n');
        for record in sorted {
            let fields = record.fields();
            let line = fields
                .iter()
                .map(|f| csv_field(f))
                .collect::<Vec<_>>()
                .join(",");
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    pub fn outcome_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.rows {
            *counts.entry(record.outcome.tag()).or_default() += 1;
        }
        counts
    }
}

fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// Thread-safe accumulator shared by every completing supervisor.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    table: Mutex<ResultTable>,
}

impl ResultAggregator {
    pub fn new(schema: ColumnSchema) -> Self {
        Self {
            table: Mutex::new(ResultTable::new(schema)),
        }
    }

    pub fn push(&self, record: ResultRecord) {
        self.lock().push(record);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> ResultTable {
        self.lock().clone()
    }

    /// Writes everything accumulated so far to `path` in one atomic write.
    pub fn persist(&self, path: &Path) -> Result<usize, SweepError> {
        let (csv, rows) = {
            let table = self.lock();
            (table.to_csv(), table.len())
        };
        atomic_write_bytes(path, csv.as_bytes()).map_err(|source| SweepError::Persist {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(rows)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ResultTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Guarantees the table reaches disk once, whichever way the run ends.
///
/// `finish` persists explicitly; if the guard is dropped without it (early
/// return, panic unwinding) the drop persists whatever has accumulated.
pub struct PersistGuard<'a> {
    aggregator: &'a ResultAggregator,
    path: PathBuf,
    done: bool,
}

impl<'a> PersistGuard<'a> {
    pub fn new(aggregator: &'a ResultAggregator, path: impl Into<PathBuf>) -> Self {
        Self {
            aggregator,
            path: path.into(),
            done: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(mut self) -> Result<usize, SweepError> {
        self.done = true;
        let rows = self.aggregator.persist(&self.path)?;
        info!(rows, path = %self.path.display(), "results persisted");
        Ok(rows)
    }
}

impl Drop for PersistGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        match self.aggregator.persist(&self.path) {
            Ok(rows) => info!(rows, path = %self.path.display(), "partial results persisted"),
            Err(err) => error!(error = %err, "failed to persist partial results"),
        }
    }
}

pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub(crate) fn atomic_write_json_pretty(path: &Path, value: &Value) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::JobDescriptor;
    use crate::record::Outcome;

    fn record(environment: &str, outcome: Outcome) -> ResultRecord {
        let job = JobDescriptor {
            work_variant: "zergling_rush".to_string(),
            own_side: "zerg".to_string(),
            opposing_side: "protoss".to_string(),
            difficulty: "medium".to_string(),
            environment: environment.to_string(),
            instrumented: false,
        };
        ResultRecord::for_job(&job, outcome)
    }

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!(
                "sweep_aggregator_{}_{}_{}",
                tag,
                std::process::id(),
                Utc::now().timestamp_micros()
            ))
            .join("results.csv")
    }

    #[test]
    fn csv_has_header_and_one_row_per_record() {
        let mut table = ResultTable::new(ColumnSchema::Standard);
        table.push(record("Abyssal", Outcome::Domain("Victory".to_string())));
        table.push(record("Persephone", Outcome::Timeout));
        assert_eq!(
            table.to_csv(),
            "work_variant,opposing_side,difficulty,environment,outcome\n\
             zergling_rush,protoss,medium,Abyssal,Victory\n\
             zergling_rush,protoss,medium,Persephone,TIMEOUT\n"
        );
    }

    #[test]
    fn csv_quotes_fields_that_need_it() {
        let mut table = ResultTable::new(ColumnSchema::Legacy);
        table.push(record(
            "Abyssal",
            Outcome::Exception("bad \"pipe\", retry".to_string()),
        ));
        let csv = table.to_csv();
        assert!(csv.starts_with("bot_strategy,opponent_race,difficulty,map,result\n"));
        assert!(csv.contains(",\"EXCEPTION:bad \"\"pipe\"\", retry\"\n"), "{}", csv);
    }

    #[test]
    fn persistence_is_idempotent_regardless_of_arrival_order() {
        let first = ResultAggregator::new(ColumnSchema::Standard);
        let second = ResultAggregator::new(ColumnSchema::Standard);
        let rows = vec![
            record("Abyssal", Outcome::Domain("Victory".to_string())),
            record("Magannatha", Outcome::Error),
            record("Persephone", Outcome::Timeout),
        ];
        for r in rows.iter().cloned() {
            first.push(r);
        }
        for r in rows.iter().rev().cloned() {
            second.push(r);
        }
        let path = temp_path("idempotent");
        first.persist(&path).expect("persist");
        let once = fs::read(&path).expect("read");
        first.persist(&path).expect("persist again");
        let twice = fs::read(&path).expect("read");
        second.persist(&path).expect("persist reordered");
        let reordered = fs::read(&path).expect("read");
        assert_eq!(once, twice);
        assert_eq!(once, reordered);
        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn dropped_guard_persists_exactly_the_accumulated_rows() {
        let aggregator = ResultAggregator::new(ColumnSchema::Standard);
        let path = temp_path("guard");
        {
            let _guard = PersistGuard::new(&aggregator, &path);
            aggregator.push(record("Abyssal", Outcome::Domain("Defeat".to_string())));
            aggregator.push(record("Magannatha", Outcome::NoResult));
        }
        let text = fs::read_to_string(&path).expect("guard wrote file");
        assert_eq!(text.lines().count(), 1 + 2);
        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn finished_guard_does_not_write_again_on_drop() {
        let aggregator = ResultAggregator::new(ColumnSchema::Standard);
        let path = temp_path("finish");
        let guard = PersistGuard::new(&aggregator, &path);
        aggregator.push(record("Abyssal", Outcome::BadResult));
        assert_eq!(guard.finish().expect("finish"), 1);
        fs::remove_file(&path).expect("remove");
        assert!(!path.exists());
        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn empty_table_still_writes_header() {
        let aggregator = ResultAggregator::new(ColumnSchema::Standard);
        let path = temp_path("empty");
        assert_eq!(aggregator.persist(&path).expect("persist"), 0);
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "work_variant,opposing_side,difficulty,environment,outcome\n"
        );
        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn unwritable_destination_reports_persist_error() {
        let aggregator = ResultAggregator::new(ColumnSchema::Standard);
        let blocker = temp_path("blocked");
        let parent = blocker.parent().expect("parent").to_path_buf();
        fs::create_dir_all(&parent).expect("dir");
        fs::write(parent.join("file"), b"x").expect("write");
        let path = parent.join("file").join("results.csv");
        match aggregator.persist(&path) {
            Err(SweepError::Persist { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected persist error, got {:?}", other),
        }
        let _ = fs::remove_dir_all(parent);
    }

    #[test]
    fn outcome_counts_group_by_tag() {
        let mut table = ResultTable::new(ColumnSchema::Standard);
        table.push(record("A", Outcome::Timeout));
        table.push(record("B", Outcome::Timeout));
        table.push(record("C", Outcome::Domain("Victory".to_string())));
        let counts = table.outcome_counts();
        assert_eq!(counts.get("TIMEOUT"), Some(&2));
        assert_eq!(counts.get("Victory"), Some(&1));
    }
}
