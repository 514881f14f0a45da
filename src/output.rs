use std::io::{self, Write};

use serde::Serialize;

use crate::sync::SyncReport;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &SyncReport) -> io::Result<()> {
        Self::print_json(&mut io::stdout(), report)
    }

    pub fn write_report<W: Write>(writer: &mut W, report: &SyncReport) -> io::Result<()> {
        Self::print_json(writer, report)
    }

    fn print_json<W: Write, T: Serialize>(writer: &mut W, value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        writer.write_all(json.as_bytes())?;
        writer.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{CollectionAction, DatasetAction, DatasetOutcome};

    #[test]
    fn report_serializes_actions_in_lowercase() {
        let report = SyncReport {
            collection: CollectionAction::Cached,
            dandisets: vec![DatasetOutcome {
                id: "000003".parse().unwrap(),
                version: "draft".to_string(),
                action: DatasetAction::Refreshed,
                generations_purged: vec!["v6".to_string()],
                assets_loaded: 2,
                assets_cached: 1,
                budget_exhausted: false,
            }],
        };
        let mut buf = Vec::new();
        JsonOutput::write_report(&mut buf, &report).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["collection"], "cached");
        assert_eq!(value["dandisets"][0]["action"], "refreshed");
        assert_eq!(value["dandisets"][0]["id"], "000003");
    }
}
