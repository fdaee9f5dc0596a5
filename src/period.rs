use anyhow::Context;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt::Display;
use std::str::FromStr;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Granularity a counter is bucketed by.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PeriodType {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
    #[default]
    All,
}

impl PeriodType {
    pub const ALL_TYPES: [PeriodType; 8] = [
        Self::Second,
        Self::Minute,
        Self::Hour,
        Self::Day,
        Self::Week,
        Self::Month,
        Self::Year,
        Self::All,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
            Self::All => "all",
        }
    }

    /// Number of leading characters of `YYYY-MM-DD HH:MM:SS` kept by a plain truncation.
    fn prefix_len(&self) -> Option<usize> {
        match self {
            Self::Second => Some(19),
            Self::Minute => Some(16),
            Self::Hour => Some(13),
            Self::Day => Some(10),
            Self::Month => Some(7),
            Self::Year => Some(4),
            Self::Week | Self::All => None,
        }
    }

    /// Compute the canonical bucket label of `period` for this granularity.
    ///
    /// ```
    /// use livecount::period::{Period, PeriodType};
    ///
    /// let period: Period = "2011-06-16 18:11:32".parse().unwrap();
    /// assert_eq!(PeriodType::Hour.scope(&period), "2011-06-16 18");
    /// assert_eq!(PeriodType::Week.scope(&period), "2011-06-13week");
    /// assert_eq!(PeriodType::All.scope(&period), "all");
    /// ```
    pub fn scope(&self, period: &Period) -> String {
        match self {
            Self::Week => {
                let date = period.instant().date();
                let offset = date.weekday().num_days_from_monday() as i64;
                let monday = date - chrono::Duration::days(offset);
                format!("{}week", monday.format(DATE_FORMAT))
            }
            Self::All => "all".to_string(),
            _ => {
                let text = period.text();
                let len = self.prefix_len().unwrap_or(text.len());
                text.chars().take(len).collect()
            }
        }
    }
}

impl From<&str> for PeriodType {
    fn from(s: &str) -> Self {
        Self::ALL_TYPES
            .into_iter()
            .find(|ty| ty.as_str().eq_ignore_ascii_case(s.trim()))
            .unwrap_or(Self::All)
    }
}

impl From<String> for PeriodType {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<PeriodType> for String {
    fn from(ty: PeriodType) -> Self {
        ty.as_str().to_string()
    }
}

impl Display for PeriodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Repr {
    Instant(NaiveDateTime),
    Formatted { text: String, instant: NaiveDateTime },
}

/// The point in time a counter update belongs to: either a structured instant or a string
/// previously formatted as `YYYY-MM-DD HH:MM:SS[.frac]`.
///
/// The string form is validated on construction, so bucket computation never fails later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period(Repr);

impl Period {
    pub fn at(instant: NaiveDateTime) -> Self {
        Self(Repr::Instant(instant))
    }

    /// Current local time.
    pub fn now() -> Self {
        Self::at(chrono::Local::now().naive_local())
    }

    pub fn instant(&self) -> NaiveDateTime {
        match &self.0 {
            Repr::Instant(instant) => *instant,
            Repr::Formatted { instant, .. } => *instant,
        }
    }

    /// The textual form buckets are cut from. Formatted periods keep their original text.
    pub fn text(&self) -> Cow<'_, str> {
        match &self.0 {
            Repr::Instant(instant) => Cow::Owned(instant.format(DATETIME_FORMAT).to_string()),
            Repr::Formatted { text, .. } => Cow::Borrowed(text),
        }
    }
}

impl Default for Period {
    fn default() -> Self {
        Self::now()
    }
}

impl From<NaiveDateTime> for Period {
    fn from(instant: NaiveDateTime) -> Self {
        Self::at(instant)
    }
}

impl FromStr for Period {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let instant = match NaiveDateTime::parse_from_str(text, DATETIME_FORMAT) {
            Ok(instant) => instant,
            Err(_) => NaiveDate::parse_from_str(text, DATE_FORMAT)
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .with_context(|| {
                    format!("invalid period `{text}`, expect `YYYY-MM-DD HH:MM:SS`")
                })?,
        };

        Ok(Self(Repr::Formatted {
            text: text.to_string(),
            instant,
        }))
    }
}

impl TryFrom<String> for Period {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Period> for String {
    fn from(period: Period) -> Self {
        period.text().into_owned()
    }
}

impl Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text())
    }
}
