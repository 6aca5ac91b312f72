use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use hindsight_schemas::TimeRange;
use regex::Regex;

const MONTH_NAMES: &str = "january|february|march|april|may|june|july|august|september|october|\
     november|december|jan|feb|mar|apr|jun|jul|aug|sept|sep|oct|nov|dec";

/// Extracts a half-open UTC interval from time expressions in a query.
///
/// Returns `None` when the query carries no time expression; that
/// decision gates the temporal retrieval strategy. Ambiguous phrases
/// resolve to the nearest past interval. `parse` is pure: no clock
/// access, no I/O.
pub struct TemporalParser {
    iso_range: Regex,
    between_months: Regex,
    relative_unit: Regex,
    season: Regex,
    month: Regex,
}

impl Default for TemporalParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TemporalParser {
    pub fn new() -> Self {
        Self {
            iso_range: Regex::new(
                r"(?:between\s+)?(\d{4}-\d{2}-\d{2})\s*(?:to|until|through|and|[-\x{2013}])\s*(\d{4}-\d{2}-\d{2})",
            )
            .unwrap(),
            between_months: Regex::new(&format!(
                r"between\s+({m})\s+and\s+({m})(?:\s+(\d{{4}}))?",
                m = MONTH_NAMES
            ))
            .unwrap(),
            relative_unit: Regex::new(r"\b(last|this|next)\s+(year|month|week)\b").unwrap(),
            season: Regex::new(r"\b(?:(last|this|next)\s+)?(spring|summer|autumn|fall|winter)\b")
                .unwrap(),
            month: Regex::new(&format!(
                r"\b(?:(last|this|next|in|during)\s+)?({m})\b(?:\s+(\d{{4}}))?",
                m = MONTH_NAMES
            ))
            .unwrap(),
        }
    }

    pub fn parse(&self, query: &str, now: DateTime<Utc>) -> Option<TimeRange> {
        let query = query.to_lowercase();

        if let Some(caps) = self.iso_range.captures(&query) {
            let start = parse_iso_date(&caps[1])?;
            let end = parse_iso_date(&caps[2])?;
            if end < start {
                return None;
            }
            // The spoken end date is inclusive.
            return Some(TimeRange::new(start, end + Duration::days(1)));
        }

        if let Some(caps) = self.between_months.captures(&query) {
            let start_month = month_number(&caps[1])?;
            let end_month = month_number(&caps[2])?;
            let year = caps.get(3).and_then(|y| y.as_str().parse::<i32>().ok());
            return Some(month_span(start_month, end_month, year, now));
        }

        if let Some(caps) = self.relative_unit.captures(&query) {
            let modifier = &caps[1];
            return Some(match &caps[2] {
                "year" => year_range(now.year() + modifier_offset(modifier)),
                "month" => {
                    let (y, m) = add_months(now.year(), now.month(), modifier_offset(modifier));
                    month_range(y, m)
                }
                _ => {
                    let monday = now.date_naive()
                        - Duration::days(now.weekday().num_days_from_monday() as i64);
                    let start = monday + Duration::weeks(modifier_offset(modifier) as i64);
                    TimeRange::new(day_start(start), day_start(start + Duration::weeks(1)))
                }
            });
        }

        if let Some(caps) = self.season.captures(&query) {
            let modifier = caps.get(1).map(|m| m.as_str());
            return Some(season_range(&caps[2], modifier, now));
        }

        if let Some(caps) = self.month.captures(&query) {
            let modifier = caps.get(1).map(|m| m.as_str());
            let month = month_number(&caps[2])?;
            let year = caps.get(3).and_then(|y| y.as_str().parse::<i32>().ok());

            // "may" and "march" double as ordinary English words; only
            // treat them as months with a cue word or an explicit year.
            if matches!(&caps[2], "may" | "march" | "mar") && modifier.is_none() && year.is_none() {
                return None;
            }

            return Some(match (year, modifier) {
                (Some(y), _) => month_range(y, month),
                (None, Some("next")) => {
                    // Earliest occurrence starting after now.
                    let y = if month_start(now.year(), month) > now {
                        now.year()
                    } else {
                        now.year() + 1
                    };
                    month_range(y, month)
                }
                (None, Some("last")) => {
                    // Most recent completed occurrence.
                    let y = if month_end(now.year(), month) <= now {
                        now.year()
                    } else {
                        now.year() - 1
                    };
                    month_range(y, month)
                }
                _ => {
                    // Nearest past (or ongoing) occurrence.
                    let y = if month_start(now.year(), month) <= now {
                        now.year()
                    } else {
                        now.year() - 1
                    };
                    month_range(y, month)
                }
            });
        }

        None
    }
}

fn modifier_offset(modifier: &str) -> i32 {
    match modifier {
        "last" => -1,
        "next" => 1,
        _ => 0,
    }
}

fn month_number(name: &str) -> Option<u32> {
    Some(match name {
        "january" | "jan" => 1,
        "february" | "feb" => 2,
        "march" | "mar" => 3,
        "april" | "apr" => 4,
        "may" => 5,
        "june" | "jun" => 6,
        "july" | "jul" => 7,
        "august" | "aug" => 8,
        "september" | "sept" | "sep" => 9,
        "october" | "oct" => 10,
        "november" | "nov" => 11,
        "december" | "dec" => 12,
        _ => return None,
    })
}

fn parse_iso_date(s: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(day_start)
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap())
}

fn month_start(year: i32, month: u32) -> DateTime<Utc> {
    day_start(NaiveDate::from_ymd_opt(year, month, 1).unwrap())
}

/// Exclusive end of a month: the first instant of the next one.
fn month_end(year: i32, month: u32) -> DateTime<Utc> {
    let (y, m) = add_months(year, month, 1);
    month_start(y, m)
}

fn month_range(year: i32, month: u32) -> TimeRange {
    TimeRange::new(month_start(year, month), month_end(year, month))
}

fn year_range(year: i32) -> TimeRange {
    TimeRange::new(month_start(year, 1), month_start(year + 1, 1))
}

fn add_months(year: i32, month: u32, delta: i32) -> (i32, u32) {
    let total = year * 12 + month as i32 - 1 + delta;
    (total.div_euclid(12), (total.rem_euclid(12) + 1) as u32)
}

/// "between March and May [2024]" — first day of the start month to the
/// first day after the end month. Without a year, the nearest past
/// occurrence of the whole span is used.
fn month_span(start_month: u32, end_month: u32, year: Option<i32>, now: DateTime<Utc>) -> TimeRange {
    let year = year.unwrap_or_else(|| {
        if month_start(now.year(), start_month) <= now {
            now.year()
        } else {
            now.year() - 1
        }
    });
    let end_year = if end_month < start_month { year + 1 } else { year };
    TimeRange::new(month_start(year, start_month), month_end(end_year, end_month))
}

/// Season boundaries by meteorological convention; winter belongs to the
/// year it starts in.
fn season_months(name: &str) -> (u32, u32) {
    match name {
        "spring" => (3, 5),
        "summer" => (6, 8),
        "autumn" | "fall" => (9, 11),
        _ => (12, 2),
    }
}

fn season_in_year(name: &str, year: i32) -> TimeRange {
    let (start_month, end_month) = season_months(name);
    let end_year = if end_month < start_month { year + 1 } else { year };
    TimeRange::new(
        month_start(year, start_month),
        month_end(end_year, end_month),
    )
}

fn season_range(name: &str, modifier: Option<&str>, now: DateTime<Utc>) -> TimeRange {
    // Latest occurrence that has started.
    let mut year = now.year();
    while season_in_year(name, year).start > now {
        year -= 1;
    }
    let nearest = season_in_year(name, year);

    match modifier {
        Some("next") => season_in_year(name, year + 1),
        Some("last") if nearest.end > now => season_in_year(name, year - 1),
        // "this"/bare: the ongoing occurrence, else the nearest past one.
        _ => nearest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn range(range: Option<TimeRange>) -> (String, String) {
        let r = range.expect("expected a temporal range");
        (
            r.start.format("%Y-%m-%d").to_string(),
            r.end.format("%Y-%m-%d").to_string(),
        )
    }

    #[test]
    fn test_no_time_expression() {
        let parser = TemporalParser::new();
        let now = at(2024, 2, 1);
        assert!(parser.parse("what is the weather", now).is_none());
        assert!(parser.parse("where does Alice work?", now).is_none());
        // Modal "may" is not a month without a cue.
        assert!(parser.parse("may I ask a question", now).is_none());
        assert!(parser.parse("they march in formation", now).is_none());
    }

    #[test]
    fn test_last_june_resolves_to_nearest_past() {
        let parser = TemporalParser::new();
        let got = range(parser.parse("What did I do last June?", at(2024, 2, 1)));
        assert_eq!(got, ("2023-06-01".into(), "2023-07-01".into()));

        // After June has completed, "last June" is this year's.
        let got = range(parser.parse("last June", at(2024, 8, 1)));
        assert_eq!(got, ("2024-06-01".into(), "2024-07-01".into()));
    }

    #[test]
    fn test_bare_month_and_explicit_year() {
        let parser = TemporalParser::new();
        let got = range(parser.parse("trips in June", at(2024, 2, 1)));
        assert_eq!(got, ("2023-06-01".into(), "2023-07-01".into()));

        let got = range(parser.parse("events in January 2020", at(2024, 2, 1)));
        assert_eq!(got, ("2020-01-01".into(), "2020-02-01".into()));

        // A cue word makes "May" a month again.
        let got = range(parser.parse("during May 2023", at(2024, 2, 1)));
        assert_eq!(got, ("2023-05-01".into(), "2023-06-01".into()));
    }

    #[test]
    fn test_relative_year_month_week() {
        let parser = TemporalParser::new();
        let now = at(2024, 2, 1); // a Thursday

        let got = range(parser.parse("what happened last year", now));
        assert_eq!(got, ("2023-01-01".into(), "2024-01-01".into()));

        let got = range(parser.parse("this year", now));
        assert_eq!(got, ("2024-01-01".into(), "2025-01-01".into()));

        let got = range(parser.parse("last month", now));
        assert_eq!(got, ("2024-01-01".into(), "2024-02-01".into()));

        // Weeks run Monday to Monday.
        let got = range(parser.parse("this week", now));
        assert_eq!(got, ("2024-01-29".into(), "2024-02-05".into()));
        let got = range(parser.parse("last week", now));
        assert_eq!(got, ("2024-01-22".into(), "2024-01-29".into()));
        let got = range(parser.parse("next week", now));
        assert_eq!(got, ("2024-02-05".into(), "2024-02-12".into()));
    }

    #[test]
    fn test_seasons() {
        let parser = TemporalParser::new();
        let now = at(2024, 2, 1);

        // Nearest completed spring is 2023's.
        let got = range(parser.parse("last spring", now));
        assert_eq!(got, ("2023-03-01".into(), "2023-06-01".into()));

        // Winter spans the year boundary and is ongoing on Feb 1.
        let got = range(parser.parse("this winter", now));
        assert_eq!(got, ("2023-12-01".into(), "2024-03-01".into()));
        let got = range(parser.parse("last winter", now));
        assert_eq!(got, ("2022-12-01".into(), "2023-03-01".into()));

        let got = range(parser.parse("next summer", now));
        assert_eq!(got, ("2024-06-01".into(), "2024-09-01".into()));

        // "fall" and "autumn" are synonyms.
        assert_eq!(
            range(parser.parse("last fall", now)),
            range(parser.parse("last autumn", now))
        );
    }

    #[test]
    fn test_between_months() {
        let parser = TemporalParser::new();
        // Range start in the future pushes the span to the prior year.
        let got = range(parser.parse("between March and May", at(2024, 2, 1)));
        assert_eq!(got, ("2023-03-01".into(), "2023-06-01".into()));

        let got = range(parser.parse("between March and May 2024", at(2024, 2, 1)));
        assert_eq!(got, ("2024-03-01".into(), "2024-06-01".into()));

        // Wrapping span crosses the year boundary.
        let got = range(parser.parse("between November and February 2022", at(2024, 2, 1)));
        assert_eq!(got, ("2022-11-01".into(), "2023-03-01".into()));
    }

    #[test]
    fn test_iso_ranges() {
        let parser = TemporalParser::new();
        let now = at(2024, 2, 1);

        let got = range(parser.parse("between 2024-01-01 and 2024-03-15", now));
        assert_eq!(got, ("2024-01-01".into(), "2024-03-16".into()));

        let got = range(parser.parse("2023-06-01 to 2023-06-30", now));
        assert_eq!(got, ("2023-06-01".into(), "2023-07-01".into()));

        assert!(parser.parse("2024-03-15 to 2024-01-01", now).is_none());
    }

    #[test]
    fn test_parse_is_pure_and_idempotent() {
        let parser = TemporalParser::new();
        let now = at(2024, 2, 1);
        let a = parser.parse("What did I do last June?", now);
        let b = parser.parse("What did I do last June?", now);
        assert_eq!(a, b);
    }
}
