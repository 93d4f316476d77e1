use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use url::Url;

use crate::error::{Error, Result};

/// Remainder of `a / b` shifted into `[0, b)`.
pub fn modulo(a: i64, b: i64) -> i64 {
    let result = a % b;
    if result < 0 {
        result + b
    } else {
        result
    }
}

/// Clamp `a` into `[lower, upper]`.
pub fn bounded(a: i64, lower: i64, upper: i64) -> i64 {
    a.clamp(lower, upper)
}

/// Earliest of the given timestamps, ignoring `None`.
pub fn min_time(times: &[Option<DateTime<Utc>>]) -> Option<DateTime<Utc>> {
    times.iter().flatten().min().copied()
}

/// Latest of the given timestamps, ignoring `None`.
pub fn max_time(times: &[Option<DateTime<Utc>>]) -> Option<DateTime<Utc>> {
    times.iter().flatten().max().copied()
}

/// `after - before`, defined only when both sides are.
pub fn opt_sub(after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> Option<Duration> {
    Some(*after.as_ref()? - *before.as_ref()?)
}

/// Render a duration as `-`, `<1s`, `42s` or `3m07s`.
pub fn format_duration(d: Option<Duration>) -> String {
    let d = match d {
        Some(d) => d,
        None => return "-".to_owned(),
    };

    let minutes = d.num_minutes();
    let seconds = d.num_seconds() - minutes * 60;

    if minutes == 0 {
        if seconds == 0 {
            return "<1s".to_owned();
        }
        return format!("{seconds}s");
    }
    format!("{minutes}m{seconds:02}s")
}

/// Split a repository URL into (host, owner, name).
///
/// Accepts web URLs, scheme-less `host/owner/name` shorthands and scp-like
/// git URLs (`git@host:owner/name.git`).
pub fn repo_host_owner_name(repository_url: &str) -> Result<(String, String, String)> {
    // Turn "git@host:path.git" into "host/path" so that it is compatible
    // with Url::parse()
    let mut repository_url = repository_url.to_owned();
    if let Some(stripped) = repository_url.strip_prefix("git@") {
        repository_url = stripped.replacen(':', "/", 1);
    }
    if let Some(stripped) = repository_url.strip_suffix(".git") {
        repository_url = stripped.to_owned();
    }

    let url = match Url::parse(&repository_url) {
        Ok(url) if url.host_str().is_some() => url,
        // "example.com/aaa/bbb" parses as a relative path. Adding a scheme
        // makes the host explicit.
        _ => Url::parse(&format!("https://{repository_url}"))
            .map_err(|_| Error::UnknownRepositoryUrl(repository_url.clone()))?,
    };

    let host = url
        .host_str()
        .ok_or_else(|| Error::UnknownRepositoryUrl(repository_url.clone()))?
        .to_owned();

    let components: Vec<&str> = url
        .path()
        .split('/')
        .filter(|c| !c.is_empty())
        .collect();
    if components.len() < 2 {
        return Err(Error::UnknownRepositoryUrl(repository_url));
    }

    Ok((host, components[0].to_owned(), components[1].to_owned()))
}

/// Possible locations of a configuration file named `filename`, following
/// the XDG base directory specification.
pub fn xdg_config_locations(filename: &str) -> Vec<PathBuf> {
    let conf_home = match std::env::var("XDG_CONFIG_HOME") {
        Ok(home) if !home.is_empty() => PathBuf::from(home),
        _ => PathBuf::from(std::env::var("HOME").unwrap_or_default()).join(".config"),
    };

    let mut locations = vec![conf_home.join(filename)];

    let dirs = match std::env::var("XDG_CONFIG_DIRS") {
        Ok(dirs) if !dirs.is_empty() => dirs,
        _ => "/etc/xdg".to_owned(),
    };
    for dir in dirs.split(':') {
        locations.push(PathBuf::from(dir).join(filename));
    }

    locations
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn time(seconds: i64) -> Option<DateTime<Utc>> {
        Some(Utc.timestamp_opt(seconds, 0).unwrap())
    }

    #[test]
    fn test_modulo_is_never_negative() {
        assert_eq!(modulo(7, 3), 1);
        assert_eq!(modulo(-1, 3), 2);
        assert_eq!(modulo(-3, 3), 0);
        assert_eq!(modulo(0, 5), 0);
    }

    #[test]
    fn test_bounded() {
        assert_eq!(bounded(5, 0, 10), 5);
        assert_eq!(bounded(-5, 0, 10), 0);
        assert_eq!(bounded(15, 0, 10), 10);
    }

    #[test]
    fn test_min_max_time_ignore_none() {
        assert_eq!(min_time(&[None, time(3), time(1), None]), time(1));
        assert_eq!(max_time(&[None, time(3), time(1), None]), time(3));
        assert_eq!(min_time(&[None, None]), None);
        assert_eq!(max_time(&[]), None);
    }

    #[test]
    fn test_opt_sub() {
        assert_eq!(opt_sub(time(10), time(4)), Some(Duration::seconds(6)));
        assert_eq!(opt_sub(time(10), None), None);
        assert_eq!(opt_sub(None, time(4)), None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(None), "-");
        assert_eq!(format_duration(Some(Duration::milliseconds(300))), "<1s");
        assert_eq!(format_duration(Some(Duration::seconds(42))), "42s");
        assert_eq!(format_duration(Some(Duration::seconds(187))), "3m07s");
    }

    #[test]
    fn test_repo_host_owner_name() {
        for url in [
            "https://github.com/owner/repo",
            "github.com/owner/repo",
            "git@github.com:owner/repo.git",
            "https://github.com/owner/repo.git",
        ] {
            let (host, owner, name) = repo_host_owner_name(url).unwrap();
            assert_eq!(host, "github.com");
            assert_eq!(owner, "owner");
            assert_eq!(name, "repo");
        }

        assert!(repo_host_owner_name("github.com/owner").is_err());
    }
}
