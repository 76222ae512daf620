//! Deployed certificate names

use chrono::{DateTime, TimeZone};

/// Name under which a certificate is imported
///
/// `{basename}-YYYY-MM-DD-{unix seconds}`, using the calendar date of `at`.
/// Every run produces a distinct name that still starts with the basename,
/// which is how earlier deployments are recognised for retirement.
pub fn certificate_name<Tz>(basename: &str, at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("{}-{}", basename, at.format("%Y-%m-%d-%s"))
}
