//! Errors - 処理失敗の分類
//!
//! `ErrorKind` is the closed taxonomy every processing failure is reported
//! with. Retry policy selection keys off this enum and nothing else.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Why a processing attempt failed.
///
/// # 分類
/// - Transient: timeout, network, rate_limited, upstream_unavailable, interrupted
/// - Permanent: resource_gone, auth_refused, unsupported_content, malformed_content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The processor (or the pool on its behalf) gave up waiting.
    Timeout,
    /// Connection refused/reset, DNS failure.
    Network,
    /// Upstream asked us to slow down.
    RateLimited,
    /// 5xx-equivalent from the upstream.
    UpstreamUnavailable,
    /// The attempt was cut short by a process restart.
    Interrupted,
    /// 404/410-equivalent: the resource is confirmed gone.
    ResourceGone,
    /// Authentication permanently refused.
    AuthRefused,
    /// Content type confirmed unsupported after fetch.
    UnsupportedContent,
    /// Content fetched but could not be parsed at all.
    MalformedContent,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::Timeout,
        ErrorKind::Network,
        ErrorKind::RateLimited,
        ErrorKind::UpstreamUnavailable,
        ErrorKind::Interrupted,
        ErrorKind::ResourceGone,
        ErrorKind::AuthRefused,
        ErrorKind::UnsupportedContent,
        ErrorKind::MalformedContent,
    ];

    /// Worth retrying at all?
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Network
                | ErrorKind::RateLimited
                | ErrorKind::UpstreamUnavailable
                | ErrorKind::Interrupted
        )
    }

    /// Does this failure say anything about the health of the upstream source?
    ///
    /// `Interrupted` is our own restart, not the source's fault.
    pub fn counts_against_source(self) -> bool {
        !matches!(self, ErrorKind::Interrupted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::ResourceGone => "resource_gone",
            ErrorKind::AuthRefused => "auth_refused",
            ErrorKind::UnsupportedContent => "unsupported_content",
            ErrorKind::MalformedContent => "malformed_content",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown error kind: {0}")]
pub struct UnknownErrorKind(pub String);

impl FromStr for ErrorKind {
    type Err = UnknownErrorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownErrorKind(s.to_string()))
    }
}
