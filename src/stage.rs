//! Stage kinds and the normalized records they produce.
//!
//! Every stage kind emits exactly one [`RecordKind`]. Records carry a stable
//! key derived from their identifying fields so the aggregator can merge
//! output from retries and duplicate deliveries without double counting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One discrete analysis step in a reconnaissance pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    /// Passive subdomain discovery (subfinder, amass)
    EnumerateSubdomains,
    /// HTTP liveness probing (httpx)
    ProbeLiveness,
    /// Open port discovery (naabu)
    ScanPorts,
    /// Active crawling of live hosts (katana)
    Crawl,
    /// Template-based vulnerability checks (nuclei)
    DetectVulnerabilities,
    /// Historical URL harvesting (gau)
    HarvestUrls,
}

impl StageKind {
    /// All stage kinds in canonical pipeline order.
    pub const ALL: [StageKind; 6] = [
        StageKind::EnumerateSubdomains,
        StageKind::ProbeLiveness,
        StageKind::ScanPorts,
        StageKind::Crawl,
        StageKind::DetectVulnerabilities,
        StageKind::HarvestUrls,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::EnumerateSubdomains => "enumerate-subdomains",
            StageKind::ProbeLiveness => "probe-liveness",
            StageKind::ScanPorts => "scan-ports",
            StageKind::Crawl => "crawl",
            StageKind::DetectVulnerabilities => "detect-vulnerabilities",
            StageKind::HarvestUrls => "harvest-urls",
        }
    }

    /// Parse a stage kind from its kebab-case name.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase().replace('_', "-");
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// The record kind this stage produces.
    pub fn output_kind(&self) -> RecordKind {
        match self {
            StageKind::EnumerateSubdomains => RecordKind::Subdomain,
            StageKind::ProbeLiveness => RecordKind::LiveHost,
            StageKind::ScanPorts => RecordKind::OpenPort,
            StageKind::Crawl | StageKind::HarvestUrls => RecordKind::Url,
            StageKind::DetectVulnerabilities => RecordKind::Finding,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for StageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| {
            anyhow::anyhow!(
                "Invalid stage kind '{}'. Valid values: {}",
                s,
                Self::ALL.map(|k| k.as_str()).join(", ")
            )
        })
    }
}

/// Type tag of a normalized record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    Subdomain,
    LiveHost,
    OpenPort,
    Url,
    Finding,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Subdomain => "subdomain",
            RecordKind::LiveHost => "live-host",
            RecordKind::OpenPort => "open-port",
            RecordKind::Url => "url",
            RecordKind::Finding => "finding",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Severity attached to a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Lenient parse used for tool output; unknown labels map to `Info`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().trim_matches(|c| c == '[' || c == ']').to_lowercase().as_str() {
            "low" => Severity::Low,
            "medium" => Severity::Medium,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A normalized result record emitted by a stage executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Record {
    Subdomain {
        host: String,
    },
    LiveHost {
        url: String,
        host: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tech: Vec<String>,
    },
    OpenPort {
        host: String,
        port: u16,
        protocol: String,
    },
    Url {
        url: String,
        host: String,
    },
    Finding {
        target: String,
        name: String,
        severity: Severity,
    },
}

impl Record {
    pub fn subdomain(host: &str) -> Self {
        Record::Subdomain {
            host: normalize_host(host),
        }
    }

    pub fn live_host(url: &str) -> Self {
        let url = url.trim().to_string();
        Record::LiveHost {
            host: host_of(&url),
            url,
            status_code: None,
            title: None,
            tech: Vec::new(),
        }
    }

    pub fn open_port(host: &str, port: u16) -> Self {
        Record::OpenPort {
            host: normalize_host(host),
            port,
            protocol: "tcp".to_string(),
        }
    }

    pub fn url(url: &str) -> Self {
        let url = url.trim().to_string();
        Record::Url {
            host: host_of(&url),
            url,
        }
    }

    pub fn finding(target: &str, name: &str, severity: Severity) -> Self {
        Record::Finding {
            target: target.trim().to_string(),
            name: name.trim().to_string(),
            severity,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Subdomain { .. } => RecordKind::Subdomain,
            Record::LiveHost { .. } => RecordKind::LiveHost,
            Record::OpenPort { .. } => RecordKind::OpenPort,
            Record::Url { .. } => RecordKind::Url,
            Record::Finding { .. } => RecordKind::Finding,
        }
    }

    /// Identity of the record within its kind. Two records with the same
    /// kind and key are the same asset.
    pub fn key(&self) -> String {
        match self {
            Record::Subdomain { host } => host.clone(),
            Record::LiveHost { host, .. } => host.clone(),
            Record::OpenPort {
                host,
                port,
                protocol,
            } => format!("{}:{}/{}", host, port, protocol),
            Record::Url { url, .. } => url.clone(),
            Record::Finding { target, name, .. } => format!("{}|{}", target, name),
        }
    }

    /// The host this record refers to.
    pub fn host(&self) -> &str {
        match self {
            Record::Subdomain { host }
            | Record::LiveHost { host, .. }
            | Record::OpenPort { host, .. }
            | Record::Url { host, .. } => host,
            Record::Finding { target, .. } => target,
        }
    }
}

/// Lowercase a hostname and strip a trailing root dot.
pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_lowercase()
}

/// Extract the host portion of a URL, falling back to the input.
pub fn host_of(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let authority = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let host = match authority.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => authority,
    };
    normalize_host(host)
}
