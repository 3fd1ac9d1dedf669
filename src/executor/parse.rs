//! Line parsers that turn raw tool output into normalized records.
//!
//! Tools are run in their line-oriented modes. Each line is tried as JSON
//! first (the `-json`/`-jsonl` flavours of the ProjectDiscovery tools) and
//! then as plain text. Lines that match neither are dropped.

use crate::stage::{Record, Severity, StageKind, host_of, normalize_host};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static HOSTNAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)([a-z0-9_]([a-z0-9_-]{0,61}[a-z0-9])?\.)+[a-z0-9-]{2,63}\.?$").unwrap()
});

static HOST_PORT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[?([^\]\s]+?)\]?:(\d{1,5})$").unwrap());

static NUCLEI_TEXT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[([^\]]+)\]\s+\[[^\]]+\]\s+\[([a-zA-Z]+)\]\s+(\S+)").unwrap()
});

static HTTPX_STATUS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d{3})\]").unwrap());

/// Whether `s` looks like a DNS hostname.
pub fn is_hostname(s: &str) -> bool {
    HOSTNAME_REGEX.is_match(s.trim())
}

/// Parse one output line for the given stage.
pub fn parse_line(kind: StageKind, line: &str) -> Option<Record> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let json = if line.starts_with('{') {
        serde_json::from_str::<Value>(line).ok()
    } else {
        None
    };

    match kind {
        StageKind::EnumerateSubdomains => parse_subdomain(line, json.as_ref()),
        StageKind::ProbeLiveness => parse_live_host(line, json.as_ref()),
        StageKind::ScanPorts => parse_open_port(line, json.as_ref()),
        StageKind::Crawl | StageKind::HarvestUrls => parse_url(line, json.as_ref()),
        StageKind::DetectVulnerabilities => parse_finding(line, json.as_ref()),
    }
}

/// Parse a whole output buffer, skipping unrecognized lines.
pub fn parse_output(kind: StageKind, output: &str) -> Vec<Record> {
    output.lines().filter_map(|l| parse_line(kind, l)).collect()
}

fn str_field<'a>(json: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| json.get(*k).and_then(Value::as_str))
}

fn parse_subdomain(line: &str, json: Option<&Value>) -> Option<Record> {
    let host = match json {
        Some(v) => str_field(v, &["host", "name"])?,
        None => line,
    };
    is_hostname(host).then(|| Record::subdomain(host))
}

fn parse_live_host(line: &str, json: Option<&Value>) -> Option<Record> {
    match json {
        Some(v) => {
            let url = str_field(v, &["url"])?;
            let mut record = Record::live_host(url);
            if let Record::LiveHost {
                status_code,
                title,
                tech,
                ..
            } = &mut record
            {
                *status_code = v
                    .get("status_code")
                    .or_else(|| v.get("status-code"))
                    .and_then(Value::as_u64)
                    .and_then(|c| u16::try_from(c).ok());
                *title = str_field(v, &["title"]).map(str::to_string);
                *tech = v
                    .get("tech")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default();
            }
            Some(record)
        }
        None => {
            let url = line.split_whitespace().next()?;
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return None;
            }
            let mut record = Record::live_host(url);
            if let Record::LiveHost { status_code, .. } = &mut record {
                *status_code = HTTPX_STATUS_REGEX
                    .captures(line)
                    .and_then(|c| c[1].parse().ok());
            }
            Some(record)
        }
    }
}

fn parse_open_port(line: &str, json: Option<&Value>) -> Option<Record> {
    let (host, port) = match json {
        Some(v) => {
            let host = str_field(v, &["host", "ip"])?.to_string();
            let port = v.get("port").and_then(Value::as_u64)?;
            (host, u16::try_from(port).ok()?)
        }
        None => {
            let caps = HOST_PORT_REGEX.captures(line)?;
            (caps[1].to_string(), caps[2].parse().ok()?)
        }
    };
    if port == 0 || host.is_empty() {
        return None;
    }
    Some(Record::open_port(&host, port))
}

fn parse_url(line: &str, json: Option<&Value>) -> Option<Record> {
    let url = match json {
        Some(v) => str_field(v, &["url", "endpoint"]).or_else(|| {
            v.get("request")
                .and_then(|r| r.get("endpoint"))
                .and_then(Value::as_str)
        })?,
        None => line,
    };
    (url.starts_with("http://") || url.starts_with("https://")).then(|| Record::url(url))
}

fn parse_finding(line: &str, json: Option<&Value>) -> Option<Record> {
    match json {
        Some(v) => {
            let info = v.get("info");
            let name = info
                .and_then(|i| str_field(i, &["name"]))
                .or_else(|| str_field(v, &["template-id", "template_id"]))?;
            let severity = info
                .and_then(|i| str_field(i, &["severity"]))
                .map(Severity::parse_lenient)
                .unwrap_or_default();
            let target = str_field(v, &["matched-at", "matched_at", "host"])?;
            Some(Record::finding(target, name, severity))
        }
        None => {
            let caps = NUCLEI_TEXT_REGEX.captures(line)?;
            Some(Record::finding(
                &caps[3],
                &caps[1],
                Severity::parse_lenient(&caps[2]),
            ))
        }
    }
}

/// Host part of a subject, for tools that take bare hosts.
pub(crate) fn subject_host(subject: &str) -> String {
    if subject.contains("://") {
        host_of(subject)
    } else {
        normalize_host(subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subdomain_plain_and_json() {
        assert_eq!(
            parse_line(StageKind::EnumerateSubdomains, "API.example.com"),
            Some(Record::subdomain("api.example.com"))
        );
        assert_eq!(
            parse_line(
                StageKind::EnumerateSubdomains,
                r#"{"host":"dev.example.com","source":"crtsh"}"#
            ),
            Some(Record::subdomain("dev.example.com"))
        );
        assert_eq!(parse_line(StageKind::EnumerateSubdomains, "[INF] loading"), None);
    }

    #[test]
    fn test_live_host_json_carries_metadata() {
        let line = r#"{"url":"https://a.example.com","status_code":200,"title":"Login","tech":["nginx"]}"#;
        match parse_line(StageKind::ProbeLiveness, line) {
            Some(Record::LiveHost {
                host,
                status_code,
                title,
                tech,
                ..
            }) => {
                assert_eq!(host, "a.example.com");
                assert_eq!(status_code, Some(200));
                assert_eq!(title.as_deref(), Some("Login"));
                assert_eq!(tech, vec!["nginx"]);
            }
            other => panic!("Expected live host, got {other:?}"),
        }
    }

    #[test]
    fn test_live_host_plain_text() {
        let record = parse_line(StageKind::ProbeLiveness, "https://b.example.com [301] [Moved]").unwrap();
        assert_eq!(record.key(), "b.example.com");
        assert!(matches!(record, Record::LiveHost { status_code: Some(301), .. }));
    }

    #[test]
    fn test_open_port_forms() {
        assert_eq!(
            parse_line(StageKind::ScanPorts, "a.example.com:8443"),
            Some(Record::open_port("a.example.com", 8443))
        );
        assert_eq!(
            parse_line(StageKind::ScanPorts, r#"{"host":"a.example.com","ip":"1.2.3.4","port":22}"#),
            Some(Record::open_port("a.example.com", 22))
        );
        assert_eq!(parse_line(StageKind::ScanPorts, "a.example.com:99999"), None);
    }

    #[test]
    fn test_url_lines() {
        assert_eq!(
            parse_line(StageKind::HarvestUrls, "https://a.example.com/old.php?id=1"),
            Some(Record::url("https://a.example.com/old.php?id=1"))
        );
        assert_eq!(
            parse_line(
                StageKind::Crawl,
                r#"{"request":{"method":"GET","endpoint":"https://a.example.com/app.js"}}"#
            ),
            Some(Record::url("https://a.example.com/app.js"))
        );
        assert_eq!(parse_line(StageKind::Crawl, "not a url"), None);
    }

    #[test]
    fn test_findings() {
        let json = r#"{"template-id":"git-config","info":{"name":"Git Config Disclosure","severity":"medium"},"matched-at":"https://a.example.com/.git/config"}"#;
        assert_eq!(
            parse_line(StageKind::DetectVulnerabilities, json),
            Some(Record::finding(
                "https://a.example.com/.git/config",
                "Git Config Disclosure",
                Severity::Medium
            ))
        );
        let text = "[tech-detect:nginx] [http] [info] https://a.example.com";
        let record = parse_line(StageKind::DetectVulnerabilities, text).unwrap();
        assert_eq!(record.key(), "https://a.example.com|tech-detect:nginx");
    }

    #[test]
    fn test_parse_output_skips_noise() {
        let out = "a.example.com\n\n  \nnot_a host\nb.example.com\n";
        assert_eq!(parse_output(StageKind::EnumerateSubdomains, out).len(), 2);
    }

    #[test]
    fn test_subject_host() {
        assert_eq!(subject_host("https://A.example.com:8443/x"), "a.example.com");
        assert_eq!(subject_host("B.example.com."), "b.example.com");
    }
}
