//! Spanish long-form dates for template parameters ("miércoles 3 de septiembre").
use chrono::{DateTime, Datelike, NaiveDate, Weekday};

const WEEKDAYS: [&str; 7] = [
    "lunes",
    "martes",
    "miércoles",
    "jueves",
    "viernes",
    "sábado",
    "domingo",
];

const MONTHS: [&str; 12] = [
    "enero",
    "febrero",
    "marzo",
    "abril",
    "mayo",
    "junio",
    "julio",
    "agosto",
    "septiembre",
    "octubre",
    "noviembre",
    "diciembre",
];

/// Parse `YYYY-MM-DD`, or take the date part of an RFC 3339 timestamp.
pub fn parse_iso_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    raw.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

pub fn weekday_name(day: Weekday) -> &'static str {
    WEEKDAYS[day.num_days_from_monday() as usize]
}

pub fn month_name(month: u32) -> &'static str {
    MONTHS[(month.clamp(1, 12) - 1) as usize]
}

pub fn long_form(date: NaiveDate) -> String {
    format!(
        "{} {} de {}",
        weekday_name(date.weekday()),
        date.day(),
        month_name(date.month())
    )
}

/// `None` when the input is not a recognizable ISO date.
pub fn localize(raw: &str) -> Option<String> {
    parse_iso_date(raw).map(long_form)
}
