use core::str::FromStr;
use std::time::Duration;

use domain::base::Name;
use jiff::{Span, SpanRelativeTo};

use crate::error::Error;

/// Parse a domain name into its canonical absolute, lowercase form.
pub fn parse_name(arg: &str) -> Result<String, Error> {
    let name = Name::<Vec<u8>>::from_str(&arg.to_lowercase()).map_err(|e| Error::from(e.to_string()))?;
    let mut s = name.to_string();
    if !s.ends_with('.') {
        s.push('.');
    }
    Ok(s)
}

/// Parse a comma or space separated list of domain names.
pub fn parse_name_list(arg: &str) -> Result<Vec<String>, Error> {
    arg.split([',', ' ', '\t'])
        .filter(|s| !s.is_empty())
        .map(parse_name)
        .collect()
}

/// Parse a key specification, `tag` or `tag:zone`.
pub fn parse_key_spec(arg: &str) -> Result<(u16, Option<String>), Error> {
    let (tag, zone) = match arg.split_once(':') {
        Some((tag, zone)) => (tag, Some(parse_name(zone)?)),
        None => (arg, None),
    };
    let tag = tag
        .parse()
        .map_err(|_| Error::from(format!("invalid key tag '{tag}'")))?;
    Ok((tag, zone))
}

/// Parse a duration such as "30d", "6h 30m" or "P1W".
///
/// Days are taken to be 24 hours.
pub fn parse_duration(value: &str) -> Result<Duration, Error> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let span: Span = value
        .parse()
        .map_err::<Error, _>(|e| format!("unable to parse {value} as duration: {e}").into())?;
    let signeddur = span
        .to_duration(SpanRelativeTo::days_are_24_hours())
        .map_err::<Error, _>(|e| format!("unable to convert duration: {e}").into())?;
    Duration::try_from(signeddur).map_err(|e| format!("unable to convert duration: {e}").into())
}

/// Render a duration the way ages are shown to operators, e.g. "3d 04h 12m".
pub fn format_age(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (days, rest) = (secs / 86400, secs % 86400);
    let (hours, rest) = (rest / 3600, rest % 3600);
    let (minutes, seconds) = (rest / 60, rest % 60);
    if days > 0 {
        format!("{days}d {hours:02}h {minutes:02}m")
    } else if hours > 0 {
        format!("{hours}h {minutes:02}m")
    } else {
        format!("{minutes}m {seconds:02}s")
    }
}
