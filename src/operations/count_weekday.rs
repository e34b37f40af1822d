use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Weekday};
use serde_json::{json, Value};

use super::{failed, is_file, succeeded, write_output};
use crate::sandbox::SandboxedPath;

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%Y.%m.%d",
    "%d-%b-%Y",
    "%d %b %Y",
    "%d %B %Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%m/%d/%Y",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug, Clone)]
pub struct CountWeekdayArgs {
    pub input: SandboxedPath,
    pub weekday: String,
    pub output: SandboxedPath,
}

pub async fn run(args: CountWeekdayArgs) -> Result<Value> {
    let Some(weekday) = parse_weekday(&args.weekday) else {
        return Ok(failed(format!("`{}` is not a weekday", args.weekday)));
    };
    if !is_file(&args.input).await {
        return Ok(failed(format!("input file not found at {}", args.input)));
    }

    let text = tokio::fs::read_to_string(args.input.as_path())
        .await
        .with_context(|| format!("failed reading {}", args.input))?;

    let mut count = 0_u64;
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(date) = parse_date(line) else {
            return Ok(failed(format!(
                "line {}: `{line}` is not a recognized date",
                index + 1
            )));
        };
        if date.weekday() == weekday {
            count += 1;
        }
    }

    write_output(&args.output, count.to_string()).await?;
    Ok(succeeded(
        format!(
            "counted {count} {}s in {} and wrote the result to {}",
            weekday_name(weekday),
            args.input,
            args.output
        ),
        json!({ "count": count, "output_file": args.output.relative() }),
    ))
}

/// Accepts full, three-letter and plural names in any case.
pub fn parse_weekday(raw: &str) -> Option<Weekday> {
    let lower = raw.trim().to_ascii_lowercase();
    let singular = lower
        .strip_suffix('s')
        .filter(|stem| stem.ends_with("day"))
        .unwrap_or(&lower);
    match singular {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" | "tues" => Some(Weekday::Tue),
        "wednesday" | "wed" | "weds" => Some(Weekday::Wed),
        "thursday" | "thu" | "thur" | "thurs" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Output file used when the task names none, e.g. `dates-wednesdays.txt`.
pub fn default_output_name(weekday: &str) -> String {
    let stem = match parse_weekday(weekday) {
        Some(day) => weekday_name(day).to_ascii_lowercase(),
        None => weekday.trim().to_ascii_lowercase(),
    };
    format!("dates-{stem}s.txt")
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let value = raw.trim();
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(date);
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(stamp) = NaiveDateTime::parse_from_str(value, format) {
            return Some(stamp.date());
        }
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|stamp| stamp.date_naive())
}
