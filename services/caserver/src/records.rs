// Record definitions loaded at startup and a simulated scan thread that
// keeps numeric records changing.
use anyhow::{Context, Result, bail};
use caserve_db::{MemoryDatabase, PvValue};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct RecordFile {
    records: Vec<RecordDef>,
}

#[derive(Debug, Deserialize)]
struct RecordDef {
    name: String,
    #[serde(rename = "type")]
    kind: RecordKind,
    value: Vec<Literal>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RecordKind {
    String,
    Short,
    Float,
    Enum,
    Char,
    Long,
    Double,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Literal {
    Number(f64),
    Text(String),
}

impl RecordDef {
    fn to_value(&self) -> Result<PvValue> {
        if self.value.is_empty() {
            bail!("record {} has no elements", self.name);
        }
        let value = match self.kind {
            RecordKind::String => PvValue::String(
                self.value
                    .iter()
                    .map(|literal| match literal {
                        Literal::Text(text) => text.clone(),
                        Literal::Number(number) => number.to_string(),
                    })
                    .collect(),
            ),
            RecordKind::Short => PvValue::Short(self.numbers(|n| n as i16)?),
            RecordKind::Float => PvValue::Float(self.numbers(|n| n as f32)?),
            RecordKind::Enum => PvValue::Enum(self.numbers(|n| n as u16)?),
            RecordKind::Char => PvValue::Char(self.numbers(|n| n as u8)?),
            RecordKind::Long => PvValue::Long(self.numbers(|n| n as i32)?),
            RecordKind::Double => PvValue::Double(self.numbers(|n| n)?),
        };
        Ok(value)
    }

    fn numbers<T>(&self, convert: impl Fn(f64) -> T) -> Result<Vec<T>> {
        self.value
            .iter()
            .map(|literal| match literal {
                Literal::Number(number) => Ok(convert(*number)),
                Literal::Text(text) => text
                    .trim()
                    .parse::<f64>()
                    .map(&convert)
                    .with_context(|| format!("record {}: not a number: {text:?}", self.name)),
            })
            .collect()
    }
}

/// Parse a YAML record file and add every record to `db`. Returns the
/// number of records added.
pub fn load_records(db: &MemoryDatabase, contents: &str) -> Result<usize> {
    let file: RecordFile = serde_yaml::from_str(contents).with_context(|| "parse record yaml")?;
    let count = file.records.len();
    for record in &file.records {
        let value = record.to_value()?;
        tracing::debug!(
            pv = %record.name,
            kind = ?record.kind,
            elements = value.len(),
            "record loaded"
        );
        db.add_record(record.name.as_str(), value);
    }
    Ok(count)
}

pub fn load_records_file(db: &MemoryDatabase, path: &Path) -> Result<usize> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read record file: {}", path.display()))?;
    load_records(db, &contents)
}

/// Background thread that periodically bumps every numeric record, posting
/// monitor events from outside the async runtime. Stops on drop.
pub struct Scanner {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Scanner {
    pub fn start(db: Arc<MemoryDatabase>, interval: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("caserve-scan".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    let updated = scan_once(&db);
                    metrics::counter!("caserve_scan_updates_total").increment(updated as u64);
                }
            })
            .context("spawn scan thread")?;
        tracing::info!(interval_ms = interval.as_millis() as u64, "scanner started");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::warn!("scan thread panicked");
        }
    }
}

/// Advance every numeric record by one step. Returns how many changed.
pub fn scan_once(db: &MemoryDatabase) -> usize {
    let mut updated = 0;
    for name in db.record_names() {
        let Some(value) = db.value(&name) else {
            continue;
        };
        let Some(next) = step(value) else {
            continue;
        };
        match db.set(&name, next) {
            Ok(_) => updated += 1,
            Err(err) => tracing::debug!(pv = %name, error = %err, "scan update skipped"),
        }
    }
    updated
}

fn step(value: PvValue) -> Option<PvValue> {
    let next = match value {
        PvValue::String(_) => return None,
        PvValue::Short(v) => PvValue::Short(v.into_iter().map(|x| x.wrapping_add(1)).collect()),
        PvValue::Float(v) => PvValue::Float(v.into_iter().map(|x| x + 1.0).collect()),
        PvValue::Enum(v) => PvValue::Enum(v.into_iter().map(|x| x.wrapping_add(1)).collect()),
        PvValue::Char(v) => PvValue::Char(v.into_iter().map(|x| x.wrapping_add(1)).collect()),
        PvValue::Long(v) => PvValue::Long(v.into_iter().map(|x| x.wrapping_add(1)).collect()),
        PvValue::Double(v) => PvValue::Double(v.into_iter().map(|x| x + 1.0).collect()),
    };
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORDS: &str = r#"
records:
  - name: "TEMP:1"
    type: double
    value: [20.5]
  - name: "MODE"
    type: string
    value: ["auto", 3]
  - name: "WAVE"
    type: short
    value: [1, 2, "3"]
"#;

    #[test]
    fn loads_each_kind() -> Result<()> {
        let db = MemoryDatabase::new();
        assert_eq!(load_records(&db, RECORDS)?, 3);
        assert_eq!(db.value("TEMP:1"), Some(PvValue::Double(vec![20.5])));
        assert_eq!(
            db.value("MODE"),
            Some(PvValue::String(vec!["auto".to_string(), "3".to_string()]))
        );
        assert_eq!(db.value("WAVE"), Some(PvValue::Short(vec![1, 2, 3])));
        Ok(())
    }

    #[test]
    fn rejects_bad_records() {
        let db = MemoryDatabase::new();
        let empty = "records:\n  - name: X\n    type: long\n    value: []\n";
        assert!(load_records(&db, empty).is_err());
        let text = "records:\n  - name: X\n    type: long\n    value: [\"high\"]\n";
        assert!(load_records(&db, text).is_err());
        let kind = "records:\n  - name: X\n    type: quaternion\n    value: [1]\n";
        assert!(load_records(&db, kind).is_err());
        assert!(db.record_names().is_empty());
    }

    #[test]
    fn scan_bumps_numeric_records_only() -> Result<()> {
        let db = MemoryDatabase::new();
        load_records(&db, RECORDS)?;
        assert_eq!(scan_once(&db), 2);
        assert_eq!(db.value("TEMP:1"), Some(PvValue::Double(vec![21.5])));
        assert_eq!(db.value("WAVE"), Some(PvValue::Short(vec![2, 3, 4])));
        assert_eq!(
            db.value("MODE"),
            Some(PvValue::String(vec!["auto".to_string(), "3".to_string()]))
        );
        Ok(())
    }

    #[test]
    fn scanner_stops_on_drop() -> Result<()> {
        let db = Arc::new(MemoryDatabase::new());
        db.add_record("COUNT", PvValue::Long(vec![0]));
        let scanner = Scanner::start(Arc::clone(&db), Duration::from_millis(1))?;
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while db.value("COUNT") == Some(PvValue::Long(vec![0])) {
            assert!(std::time::Instant::now() < deadline, "scanner never ran");
            std::thread::sleep(Duration::from_millis(1));
        }
        drop(scanner);
        let settled = db.value("COUNT");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(db.value("COUNT"), settled);
        Ok(())
    }
}
