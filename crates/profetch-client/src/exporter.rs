//! Result exporters: JSON Lines for full fidelity, CSV for a summary sheet.

use std::io::Write;

use profetch_core::error::AppError;
use profetch_core::models::{OutcomeStatus, Record, record_hash};
use profetch_core::orchestrator::{DEFAULT_MIN_QUALITY, RunResult};
use profetch_core::quality::QualityReport;
use profetch_core::traits::Exporter;
use serde::Serialize;

#[derive(Serialize)]
struct JsonRow<'a> {
    key: &'a str,
    target: &'a str,
    status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    attempts: u32,
    total_delay_ms: u64,
    elapsed_ms: u64,
    below_quality: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    quality: Option<&'a QualityReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    record_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<&'a Record>,
}

/// Writes one JSON object per result, newline-delimited.
pub struct JsonLinesExporter<W: Write> {
    writer: W,
    min_quality: f64,
    written: u64,
}

impl<W: Write> JsonLinesExporter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            min_quality: DEFAULT_MIN_QUALITY,
            written: 0,
        }
    }

    pub fn with_min_quality(mut self, min_quality: f64) -> Self {
        self.min_quality = min_quality;
        self
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Exporter for JsonLinesExporter<W> {
    fn export(&mut self, result: &RunResult) -> Result<(), AppError> {
        let record = result.outcome.record();
        let row = JsonRow {
            key: result.operation.key(),
            target: result.operation.target(),
            status: result.status(),
            reason: result.outcome.reason(),
            attempts: result.timing.attempts,
            total_delay_ms: millis(result.timing.total_delay),
            elapsed_ms: millis(result.timing.elapsed),
            below_quality: result.is_below_quality(self.min_quality),
            quality: result.quality.as_ref(),
            record_hash: record.map(record_hash),
            record,
        };
        serde_json::to_writer(&mut self.writer, &row)?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), AppError> {
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct CsvRow<'a> {
    key: &'a str,
    target: &'a str,
    status: &'static str,
    reason: String,
    attempts: u32,
    total_delay_ms: u64,
    elapsed_ms: u64,
    completeness: Option<f64>,
    consistency: Option<f64>,
    overall: Option<f64>,
    below_quality: bool,
    missing_fields: String,
    record_hash: String,
}

/// Writes a header plus one summary row per result.
///
/// The extracted record itself is not included; use [`JsonLinesExporter`]
/// when the data matters.
pub struct CsvExporter<W: Write> {
    writer: csv::Writer<W>,
    min_quality: f64,
}

impl<W: Write> CsvExporter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(writer),
            min_quality: DEFAULT_MIN_QUALITY,
        }
    }

    pub fn with_min_quality(mut self, min_quality: f64) -> Self {
        self.min_quality = min_quality;
        self
    }

    pub fn into_inner(self) -> Result<W, AppError> {
        self.writer
            .into_inner()
            .map_err(|e| AppError::Export(format!("Failed to flush CSV output: {e}")))
    }
}

impl<W: Write> Exporter for CsvExporter<W> {
    fn export(&mut self, result: &RunResult) -> Result<(), AppError> {
        let quality = result.quality.as_ref();
        let row = CsvRow {
            key: result.operation.key(),
            target: result.operation.target(),
            status: result.status().as_str(),
            reason: result.outcome.reason().unwrap_or_default(),
            attempts: result.timing.attempts,
            total_delay_ms: millis(result.timing.total_delay),
            elapsed_ms: millis(result.timing.elapsed),
            completeness: quality.map(|q| round3(q.completeness_score)),
            consistency: quality.map(|q| round3(q.consistency_score)),
            overall: quality.map(|q| round3(q.overall_score)),
            below_quality: result.is_below_quality(self.min_quality),
            missing_fields: quality
                .map(|q| q.missing_fields().join(";"))
                .unwrap_or_default(),
            record_hash: result.outcome.record().map(record_hash).unwrap_or_default(),
        };
        self.writer
            .serialize(row)
            .map_err(|e| AppError::Export(format!("Failed to write CSV row: {e}")))
    }

    fn finish(&mut self) -> Result<(), AppError> {
        self.writer.flush()?;
        Ok(())
    }
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn round3(score: f64) -> f64 {
    (score * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use profetch_core::models::{Operation, TerminalOutcome, TimingSummary};
    use profetch_core::quality::{QualityAnalyzer, QualitySchema};
    use serde_json::json;

    use super::*;

    fn success() -> RunResult {
        let record = match json!({"name": "Jane Doe", "headline": "Staff Engineer at Acme"}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        let quality = QualityAnalyzer::new().score(&record, &QualitySchema::profile());
        RunResult {
            operation: Operation::new("jane", "https://example.com/in/jane"),
            outcome: TerminalOutcome::Success(record),
            quality: Some(quality),
            timing: TimingSummary {
                attempts: 2,
                total_delay: Duration::from_millis(1500),
                elapsed: Duration::from_millis(1700),
            },
        }
    }

    fn rejected() -> RunResult {
        RunResult {
            operation: Operation::new("john", "https://example.com/in/john"),
            outcome: TerminalOutcome::CircuitRejected {
                retry_after: Duration::from_secs(30),
            },
            quality: None,
            timing: TimingSummary::default(),
        }
    }

    #[test]
    fn test_json_lines() {
        let mut exporter = JsonLinesExporter::new(Vec::new());
        exporter.export(&success()).unwrap();
        exporter.export(&rejected()).unwrap();
        exporter.finish().unwrap();
        assert_eq!(exporter.written(), 2);

        let output = String::from_utf8(exporter.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);

        assert_eq!(lines[0]["key"], "jane");
        assert_eq!(lines[0]["status"], "success");
        assert_eq!(lines[0]["attempts"], 2);
        assert_eq!(lines[0]["total_delay_ms"], 1500);
        assert_eq!(lines[0]["record"]["name"], "Jane Doe");
        assert_eq!(lines[0]["record_hash"].as_str().unwrap().len(), 64);
        // name + headline: 0.5 * 0.45 + 0.5 * 1.0 passes the default threshold.
        assert_eq!(lines[0]["below_quality"], false);
        assert!(lines[0]["quality"]["overall_score"].is_number());
        assert_eq!(
            lines[0]["quality"]["suggestions"][0],
            "Improve extraction for missing fields: location, about, experience, education, skills"
        );

        assert_eq!(lines[1]["status"], "circuit_rejected");
        assert_eq!(lines[1]["reason"], "circuit open, retry after 30000ms");
        assert!(lines[1].get("record").is_none());
        assert!(lines[1].get("quality").is_none());
    }

    #[test]
    fn test_json_lines_min_quality() {
        let mut exporter = JsonLinesExporter::new(Vec::new()).with_min_quality(0.8);
        exporter.export(&success()).unwrap();
        let output = String::from_utf8(exporter.into_inner()).unwrap();
        let line: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(line["below_quality"], true);
    }

    #[test]
    fn test_csv() {
        let mut exporter = CsvExporter::new(Vec::new());
        exporter.export(&success()).unwrap();
        exporter.export(&rejected()).unwrap();
        exporter.finish().unwrap();
        let output = String::from_utf8(exporter.into_inner().unwrap()).unwrap();

        let mut reader = csv::Reader::from_reader(output.as_bytes());
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "key");
        assert_eq!(&headers[2], "status");
        assert_eq!(headers.len(), 13);

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][2], "success");
        assert_eq!(&rows[0][11], "location;about;experience;education;skills");
        assert_eq!(&rows[1][2], "circuit_rejected");
        assert_eq!(&rows[1][7], "");
        assert_eq!(&rows[1][12], "");
    }
}
