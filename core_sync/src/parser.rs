use report_schema::{FactionNumber, Report};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportParseError {
    #[error("report is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("report file for faction {expected} belongs to faction {found}")]
    WrongFaction {
        expected: FactionNumber,
        found: FactionNumber,
    },
}

/// Turns a raw `report.<n>` blob into a [`Report`].
pub trait ReportParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<Report, ReportParseError>;

    /// Parse a report harvested for `faction`, rejecting reports owned by anyone else.
    fn parse_for(&self, faction: FactionNumber, bytes: &[u8]) -> Result<Report, ReportParseError> {
        let report = self.parse(bytes)?;
        if report.faction.number != faction {
            return Err(ReportParseError::WrongFaction {
                expected: faction,
                found: report.faction.number,
            });
        }
        Ok(report)
    }
}

/// Parser for engines that write their reports as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonReportParser;

impl ReportParser for JsonReportParser {
    fn parse(&self, bytes: &[u8]) -> Result<Report, ReportParseError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
