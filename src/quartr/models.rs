// src/quartr/models.rs
use std::fmt;
use std::str::FromStr;

use chrono::Datelike;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::utils::error::RequestError;

static TICKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.\-]{0,11}$").expect("Failed to compile TICKER_RE")
});

/// Upper-cases and validates a ticker symbol.
pub fn normalize_ticker(raw: &str) -> Result<String, RequestError> {
    let trimmed = raw.trim();
    if !TICKER_RE.is_match(trimmed) {
        return Err(RequestError::InvalidTicker(raw.to_string()));
    }
    Ok(trimmed.to_uppercase())
}

/// Fiscal quarter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Quarter {
    Q1,
    Q2,
    Q3,
    Q4,
}

impl Quarter {
    pub const ALL: [Quarter; 4] = [Quarter::Q1, Quarter::Q2, Quarter::Q3, Quarter::Q4];

    pub fn number(self) -> u8 {
        match self {
            Quarter::Q1 => 1,
            Quarter::Q2 => 2,
            Quarter::Q3 => 3,
            Quarter::Q4 => 4,
        }
    }

    fn from_number(n: u8) -> Option<Self> {
        Self::ALL.get(usize::from(n).checked_sub(1)?).copied()
    }
}

impl fmt::Display for Quarter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q{}", self.number())
    }
}

impl FromStr for Quarter {
    type Err = RequestError;

    /// Accepts "Q1", "q1" or "1".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix('Q')
            .or_else(|| trimmed.strip_prefix('q'))
            .unwrap_or(trimmed);
        digits
            .parse::<u8>()
            .ok()
            .and_then(Quarter::from_number)
            .ok_or_else(|| RequestError::InvalidQuarter(s.to_string()))
    }
}

/// One fiscal quarter of one fiscal year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub quarter: Quarter,
}

impl Period {
    pub fn new(year: i32, quarter: Quarter) -> Self {
        Self { year, quarter }
    }

    /// Text patterns tried in order when looking for this quarter in the UI.
    pub fn label_patterns(&self) -> Vec<String> {
        let q = self.quarter;
        let yy = format!("{:02}", self.year.rem_euclid(100));
        vec![
            format!("{} {}", q, self.year),
            format!("{} FY{}", q, self.year),
            format!("{} {}", q, yy),
            format!("{} FY{}", q, yy),
        ]
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.quarter, self.year)
    }
}

/// Earliest fiscal year the portal carries documents for.
pub const MIN_FISCAL_YEAR: i32 = 1990;

/// Latest fiscal year a request may name. Some companies already report
/// under next year's fiscal label.
pub fn max_fiscal_year() -> i32 {
    chrono::Utc::now().year() + 1
}

/// Inclusive year/quarter range walked by a backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiscalRange {
    pub start_year: i32,
    pub end_year: i32,
    pub start_quarter: Quarter,
    pub end_quarter: Quarter,
}

impl FiscalRange {
    pub fn new(
        start_year: i32,
        end_year: i32,
        start_quarter: Quarter,
        end_quarter: Quarter,
    ) -> Result<Self, RequestError> {
        let max_year = max_fiscal_year();
        for year in [start_year, end_year] {
            if !(MIN_FISCAL_YEAR..=max_year).contains(&year) {
                return Err(RequestError::YearOutOfRange { year, min: MIN_FISCAL_YEAR, max: max_year });
            }
        }
        if start_year > end_year {
            return Err(RequestError::YearsReversed { start: start_year, end: end_year });
        }
        if start_year == end_year && start_quarter > end_quarter {
            return Err(RequestError::QuartersReversed {
                start: start_quarter.to_string(),
                end: end_quarter.to_string(),
                year: start_year,
            });
        }
        Ok(Self { start_year, end_year, start_quarter, end_quarter })
    }

    /// Every period in the range, oldest first. The start quarter only bounds
    /// the first year and the end quarter only bounds the last year.
    pub fn periods(&self) -> Vec<Period> {
        let mut periods = Vec::new();
        for year in self.start_year..=self.end_year {
            let first = if year == self.start_year { self.start_quarter } else { Quarter::Q1 };
            let last = if year == self.end_year { self.end_quarter } else { Quarter::Q4 };
            periods.extend(
                Quarter::ALL
                    .iter()
                    .filter(|q| **q >= first && **q <= last)
                    .map(|q| Period::new(year, *q)),
            );
        }
        periods
    }
}

/// The document types fetched for each quarter, in fetch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Transcript,
    PressRelease,
    Presentation,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 3] = [
        DocumentKind::Transcript,
        DocumentKind::PressRelease,
        DocumentKind::Presentation,
    ];

    /// Text shown on the portal's document tile.
    pub fn label(self) -> &'static str {
        match self {
            DocumentKind::Transcript => "Transcript",
            DocumentKind::PressRelease => "Press Release",
            DocumentKind::Presentation => "Presentation",
        }
    }

    /// Value of the `file_type` column.
    pub fn file_type(self) -> &'static str {
        match self {
            DocumentKind::Transcript => "transcript",
            DocumentKind::PressRelease => "press_release",
            DocumentKind::Presentation => "presentation",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_type())
    }
}

/// Object storage key for a document's PDF.
pub fn storage_path(ticker: &str, period: Period, kind: DocumentKind) -> String {
    format!(
        "pdfs/{}/{}-{}/{}.pdf",
        ticker.to_uppercase(),
        period.year,
        period.quarter,
        kind.file_type()
    )
}

/// A document fetched from the portal.
#[derive(Debug, Clone)]
pub struct DownloadedDocument {
    pub bytes: Vec<u8>,
    pub source_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quarter_parsing() {
        assert_eq!("Q3".parse::<Quarter>().unwrap(), Quarter::Q3);
        assert_eq!("q2".parse::<Quarter>().unwrap(), Quarter::Q2);
        assert_eq!(" 4 ".parse::<Quarter>().unwrap(), Quarter::Q4);
        assert!("Q5".parse::<Quarter>().is_err());
        assert!("Q0".parse::<Quarter>().is_err());
        assert!("H1".parse::<Quarter>().is_err());
    }

    #[test]
    fn test_range_bounds_only_apply_to_edge_years() {
        let range = FiscalRange::new(2021, 2023, Quarter::Q3, Quarter::Q2).unwrap();
        let labels: Vec<String> = range.periods().iter().map(|p| p.to_string()).collect();
        assert_eq!(
            labels,
            vec![
                "Q3 2021", "Q4 2021", "Q1 2022", "Q2 2022", "Q3 2022", "Q4 2022", "Q1 2023", "Q2 2023"
            ]
        );
    }

    #[test]
    fn test_single_year_range() {
        let range = FiscalRange::new(2022, 2022, Quarter::Q2, Quarter::Q3).unwrap();
        assert_eq!(
            range.periods(),
            vec![Period::new(2022, Quarter::Q2), Period::new(2022, Quarter::Q3)]
        );
    }

    #[test]
    fn test_reversed_ranges_rejected() {
        assert_eq!(
            FiscalRange::new(2024, 2023, Quarter::Q1, Quarter::Q4),
            Err(RequestError::YearsReversed { start: 2024, end: 2023 })
        );
        assert!(FiscalRange::new(2023, 2023, Quarter::Q4, Quarter::Q1).is_err());
        // Later start quarter is fine when it is a different year.
        assert!(FiscalRange::new(2022, 2023, Quarter::Q4, Quarter::Q1).is_ok());
    }

    #[test]
    fn test_years_outside_window_rejected() {
        let max = max_fiscal_year();
        assert!(matches!(
            FiscalRange::new(i32::MIN, i32::MAX, Quarter::Q1, Quarter::Q4),
            Err(RequestError::YearOutOfRange { year: i32::MIN, .. })
        ));
        assert_eq!(
            FiscalRange::new(1989, 2000, Quarter::Q1, Quarter::Q4),
            Err(RequestError::YearOutOfRange { year: 1989, min: MIN_FISCAL_YEAR, max })
        );
        assert!(matches!(
            FiscalRange::new(2020, max + 1, Quarter::Q1, Quarter::Q4),
            Err(RequestError::YearOutOfRange { .. })
        ));
        assert!(FiscalRange::new(MIN_FISCAL_YEAR, max, Quarter::Q1, Quarter::Q4).is_ok());
    }

    #[test]
    fn test_label_patterns_order() {
        let patterns = Period::new(2023, Quarter::Q1).label_patterns();
        assert_eq!(patterns, vec!["Q1 2023", "Q1 FY2023", "Q1 23", "Q1 FY23"]);
        assert_eq!(Period::new(2005, Quarter::Q4).label_patterns()[2], "Q4 05");
    }

    #[test]
    fn test_storage_path_layout() {
        let p = storage_path("aapl", Period::new(2023, Quarter::Q2), DocumentKind::PressRelease);
        assert_eq!(p, "pdfs/AAPL/2023-Q2/press_release.pdf");
    }

    #[test]
    fn test_ticker_normalization() {
        assert_eq!(normalize_ticker(" brk.b ").unwrap(), "BRK.B");
        assert_eq!(normalize_ticker("RDS-A").unwrap(), "RDS-A");
        assert!(normalize_ticker("").is_err());
        assert!(normalize_ticker("AAPL; DROP").is_err());
        assert!(normalize_ticker("../etc").is_err());
    }
}
