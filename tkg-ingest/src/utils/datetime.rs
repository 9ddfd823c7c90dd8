//! Validity bounds as written by the extraction model.
//!
//! Models answer with anything from full RFC 3339 timestamps to a bare year.
//! Values without an offset are read as UTC; partial dates resolve to the
//! start of the period they name.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

fn start_of(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// `YYYY` or `YYYY-MM`, which chrono will not parse without a day.
fn partial_date(s: &str) -> Option<NaiveDate> {
    let (year, month) = match s.split_once('-') {
        Some((y, m)) if m.len() == 2 => (y, m.parse().ok()?),
        None => (s, 1),
        _ => return None,
    };
    if year.len() != 4 || !year.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::from_ymd_opt(year.parse().ok()?, month, 1)
}

/// Parse a model-supplied instant. `None` when the text matches no known shape.
pub fn parse_flexible_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .map(|ndt| ndt.and_utc())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
                .or_else(|| partial_date(s))
                .map(start_of)
        })
}

/// Parse an optional model-supplied bound.
///
/// Missing values, blank strings and `"null"` are absent. Anything else must
/// parse; the offending text is returned as the error.
pub fn parse_optional_bound(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, String> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) if s.eq_ignore_ascii_case("null") => Ok(None),
        Some(s) => parse_flexible_datetime(s).map(Some).ok_or_else(|| s.to_string()),
    }
}
