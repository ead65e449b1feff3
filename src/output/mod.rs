//! Report rendering
//!
//! Writers take the aggregator's final ordered sequence and render it. They
//! never reorder or filter.

use crate::error::{ReconError, ReconResult};
use crate::probe::{Outcome, Payload, ProbeResult};
use colored::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Text,
    Json,
    Csv,
}

impl OutputFormat {
    /// Format implied by a file extension, if any
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(ReconError::Output(format!("Unknown output format: {}", s))),
        }
    }
}

/// Flat view of a result shared by the tabular writers
#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub source: String,
    pub target: String,
    pub kind: String,
    pub status: &'static str,
    pub detail: String,
    pub insecure: bool,
    pub error: String,
    pub started_at: String,
    pub duration_ms: u64,
}

impl From<&ProbeResult> for ReportRow {
    fn from(result: &ProbeResult) -> Self {
        let (status, detail, insecure, error) = match &result.outcome {
            Outcome::Finding(payload) => {
                let insecure = payload.port().map(|p| p.insecure).unwrap_or(false);
                ("finding", describe(payload), insecure, String::new())
            }
            Outcome::Failure(error) => ("failure", String::new(), false, error.to_string()),
            Outcome::Empty => ("empty", String::new(), false, String::new()),
        };
        Self {
            source: result.source.clone(),
            target: result.target.value().to_string(),
            kind: result.target.kind().to_string(),
            status,
            detail,
            insecure,
            error,
            started_at: result.started_at.to_rfc3339(),
            duration_ms: result.duration.as_millis() as u64,
        }
    }
}

/// One-line summary of a payload
pub fn describe(payload: &Payload) -> String {
    match payload {
        Payload::Port(port) => format!(
            "{}:{}/tcp open {}",
            port.address,
            port.port,
            port.service.as_deref().unwrap_or("unknown")
        ),
        Payload::Resolution(resolution) => {
            let addresses: Vec<String> = resolution.addresses.iter().map(|a| a.to_string()).collect();
            format!("{} -> {}", resolution.name, addresses.join(" "))
        }
        Payload::Http(http) => {
            let mut line = format!("{} {}", http.url, http.status);
            if let Some(server) = &http.server {
                line.push_str(&format!(" [{}]", server));
            }
            if let Some(length) = http.content_length {
                line.push_str(&format!(" {}B", length));
            }
            line
        }
        Payload::Data(value) => value.to_string(),
    }
}

pub trait ReportWriter {
    fn write(&self, results: &[ProbeResult], out: &mut dyn Write) -> ReconResult<()>;
}

pub struct JsonWriter;

impl ReportWriter for JsonWriter {
    fn write(&self, results: &[ProbeResult], out: &mut dyn Write) -> ReconResult<()> {
        serde_json::to_writer_pretty(&mut *out, results)?;
        writeln!(out)?;
        Ok(())
    }
}

pub struct CsvWriter;

impl ReportWriter for CsvWriter {
    fn write(&self, results: &[ProbeResult], out: &mut dyn Write) -> ReconResult<()> {
        let mut writer = csv::Writer::from_writer(out);
        for result in results {
            writer.serialize(ReportRow::from(result))?;
        }
        writer.flush()?;
        Ok(())
    }
}

pub struct TextWriter {
    pub colored: bool,
}

impl TextWriter {
    fn paint(&self, text: &str, color: Color) -> String {
        if self.colored {
            text.color(color).to_string()
        } else {
            text.to_string()
        }
    }
}

impl ReportWriter for TextWriter {
    fn write(&self, results: &[ProbeResult], out: &mut dyn Write) -> ReconResult<()> {
        let findings = results.iter().filter(|r| r.is_finding()).count();
        let cancelled = results.iter().filter(|r| r.is_cancelled()).count();
        let failures = results.iter().filter(|r| r.is_failure()).count() - cancelled;

        for result in results {
            let row = ReportRow::from(result);
            let line = match &result.outcome {
                Outcome::Finding(_) if row.insecure => self.paint(
                    &format!("[!] {:<14} {:<24} {} (insecure)", row.source, row.target, row.detail),
                    Color::Red,
                ),
                Outcome::Finding(_) => self.paint(
                    &format!("[+] {:<14} {:<24} {}", row.source, row.target, row.detail),
                    Color::Green,
                ),
                Outcome::Failure(_) if result.is_cancelled() => self.paint(
                    &format!("[~] {:<14} {:<24} cancelled", row.source, row.target),
                    Color::BrightBlack,
                ),
                Outcome::Failure(_) => self.paint(
                    &format!("[-] {:<14} {:<24} {}", row.source, row.target, row.error),
                    Color::Yellow,
                ),
                Outcome::Empty => continue,
            };
            writeln!(out, "{}", line)?;
        }

        if cancelled > 0 {
            writeln!(
                out,
                "\n{} findings, {} failures, {} cancelled, {} results",
                findings,
                failures,
                cancelled,
                results.len()
            )?;
        } else {
            writeln!(
                out,
                "\n{} findings, {} failures, {} results",
                findings,
                failures,
                results.len()
            )?;
        }
        Ok(())
    }
}

pub fn writer_for(format: OutputFormat, colored: bool) -> Box<dyn ReportWriter> {
    match format {
        OutputFormat::Text => Box::new(TextWriter { colored }),
        OutputFormat::Json => Box::new(JsonWriter),
        OutputFormat::Csv => Box::new(CsvWriter),
    }
}

/// Render `results` to `path`, or to stdout when no path is given
pub fn write_report(
    results: &[ProbeResult],
    format: OutputFormat,
    path: Option<&Path>,
) -> ReconResult<()> {
    match path {
        Some(path) => {
            let mut file = File::create(path).map_err(|e| {
                ReconError::Output(format!("Failed to create {}: {}", path.display(), e))
            })?;
            writer_for(format, false).write(results, &mut file)?;
            log::info!("Wrote {} results to {}", results.len(), path.display());
        }
        None => {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            writer_for(format, true).write(results, &mut lock)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{PortStatus, Resolution};
    use crate::target::Target;

    fn sample() -> Vec<ProbeResult> {
        vec![
            ProbeResult::new(
                "reachability",
                Target::classify("10.0.0.1").unwrap(),
                Outcome::Finding(Payload::Port(PortStatus {
                    address: "10.0.0.1".parse().unwrap(),
                    port: 22,
                    open: true,
                    insecure: true,
                    service: Some("ssh".to_string()),
                })),
            ),
            ProbeResult::new(
                "resolve",
                Target::classify("example.com").unwrap(),
                Outcome::Finding(Payload::Resolution(Resolution {
                    name: "example.com".to_string(),
                    addresses: vec!["93.184.216.34".parse().unwrap()],
                })),
            ),
            ProbeResult::new(
                "reachability",
                Target::classify("10.0.0.2").unwrap(),
                Outcome::Failure((&ReconError::probe("reachability", "no route")).into()),
            ),
        ]
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("txt".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert!("xml".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::from_path(Path::new("out/report.csv")), Some(OutputFormat::Csv));
        assert_eq!(OutputFormat::from_path(Path::new("report")), None);
    }

    #[test]
    fn test_text_report() {
        let mut out = Vec::new();
        TextWriter { colored: false }.write(&sample(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("[!] reachability"));
        assert!(text.contains("10.0.0.1:22/tcp open ssh (insecure)"));
        assert!(text.contains("example.com -> 93.184.216.34"));
        assert!(text.contains("[-] reachability"));
        assert!(text.contains("2 findings, 1 failures, 3 results"));
    }

    #[test]
    fn test_cancelled_is_not_a_failure() {
        let mut results = sample();
        results.push(ProbeResult::new(
            "reachability",
            Target::classify("10.0.0.3").unwrap(),
            Outcome::Failure((&ReconError::Cancelled).into()),
        ));

        let mut out = Vec::new();
        TextWriter { colored: false }.write(&results, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("[~] reachability"));
        assert!(!text.contains("[-] reachability   10.0.0.3"));
        assert!(text.contains("2 findings, 1 failures, 1 cancelled, 4 results"));
    }

    #[test]
    fn test_csv_report() {
        let mut out = Vec::new();
        CsvWriter.write(&sample(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("source,target,kind,status"));
        assert_eq!(text.lines().count(), 4);
        assert!(text.contains("failure"));
    }

    #[test]
    fn test_json_report_round_trips() {
        let mut out = Vec::new();
        JsonWriter.write(&sample(), &mut out).unwrap();
        let back: Vec<ProbeResult> = serde_json::from_slice(&out).unwrap();
        let original = sample();
        assert_eq!(back.len(), original.len());
        for (parsed, expected) in back.iter().zip(&original) {
            assert_eq!(parsed.source, expected.source);
            assert_eq!(parsed.target, expected.target);
            assert_eq!(parsed.outcome, expected.outcome);
        }
    }

    #[test]
    fn test_write_report_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_report(&sample(), OutputFormat::Json, Some(&path)).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"source\": \"resolve\""));
    }
}
