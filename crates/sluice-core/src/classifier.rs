//! Classifier - 投入前の構造チェック
//!
//! Decides from the reference alone (plus an optional content-type hint)
//! whether an item can ever be processed, and which strategy applies.
//! Pure and deterministic: no I/O, no clock.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::domain::ReasonCode;

/// Processing strategy tag carried by every queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Article,
    Podcast,
    Feed,
    Document,
    Unprocessable,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Article => "article",
            Strategy::Podcast => "podcast",
            Strategy::Feed => "feed",
            Strategy::Document => "document",
            Strategy::Unprocessable => "unprocessable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationResult {
    pub strategy: Strategy,
    pub processable: bool,
    pub reason: Option<ReasonCode>,
}

impl ClassificationResult {
    fn accept(strategy: Strategy) -> Self {
        Self {
            strategy,
            processable: true,
            reason: None,
        }
    }

    fn reject(reason: ReasonCode) -> Self {
        Self {
            strategy: Strategy::Unprocessable,
            processable: false,
            reason: Some(reason),
        }
    }
}

/// Lists the classifier consults. Matching is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Hosts never fetched; a listed domain also covers its subdomains.
    pub unsupported_domains: Vec<String>,
    /// Extensions (without the dot) never processed.
    pub unsupported_extensions: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        let exts = [
            "exe", "dmg", "iso", "msi", "apk", "bin", "zip", "rar", "7z", "tar", "gz", "jpg",
            "jpeg", "png", "gif", "webp", "svg", "ico",
        ];
        Self {
            unsupported_domains: vec![
                "localhost".to_string(),
                "127.0.0.1".to_string(),
                "0.0.0.0".to_string(),
            ],
            unsupported_extensions: exts.iter().map(|e| e.to_string()).collect(),
        }
    }
}

const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "m4a", "aac", "ogg", "opus", "wav", "flac", "mp4", "m4v",
];
const FEED_EXTENSIONS: &[&str] = &["rss", "atom", "xml"];
const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "odt", "rtf", "epub", "txt", "md"];
const PODCAST_HOSTS: &[&str] = &[
    "podcasts.apple.com",
    "overcast.fm",
    "pca.st",
    "pocketcasts.com",
    "castro.fm",
];

#[derive(Debug, Clone, Default)]
pub struct Classifier {
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Self {
        let config = ClassifierConfig {
            unsupported_domains: config
                .unsupported_domains
                .iter()
                .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            unsupported_extensions: config
                .unsupported_extensions
                .iter()
                .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        };
        Self { config }
    }

    /// Classify a raw reference.
    pub fn classify(
        &self,
        raw_reference: &str,
        content_type_hint: Option<&str>,
    ) -> ClassificationResult {
        let reference = raw_reference.trim();
        if reference.is_empty() {
            return ClassificationResult::reject(ReasonCode::UnprocessableEmpty);
        }
        if has_drive_letter(reference) {
            return self.classify_path(reference, content_type_hint);
        }

        match Url::parse(reference) {
            Ok(url) if url.scheme().len() > 1 => self.classify_url(&url, content_type_hint),
            Ok(_) => self.classify_path(reference, content_type_hint),
            Err(url::ParseError::RelativeUrlWithoutBase) if looks_like_path(reference) => {
                self.classify_path(reference, content_type_hint)
            }
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                ClassificationResult::reject(ReasonCode::UnprocessableScheme)
            }
            Err(_) => ClassificationResult::reject(ReasonCode::UnprocessableMalformed),
        }
    }

    fn classify_url(&self, url: &Url, hint: Option<&str>) -> ClassificationResult {
        match url.scheme() {
            "http" | "https" => self.classify_web(url, hint, false),
            "feed" if url.host_str().is_some() => self.classify_web(url, hint, true),
            // `feed:example.com/rss` carries the address after the colon
            "feed" => {
                let rest = &url.as_str()[url.scheme().len() + 1..];
                match Url::parse(&format!("https:{rest}")) {
                    Ok(web) => self.classify_web(&web, hint, true),
                    Err(_) => ClassificationResult::reject(ReasonCode::UnprocessableMalformed),
                }
            }
            "file" => self.classify_path(url.path(), hint),
            _ => ClassificationResult::reject(ReasonCode::UnprocessableScheme),
        }
    }

    fn classify_web(&self, url: &Url, hint: Option<&str>, feed: bool) -> ClassificationResult {
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return ClassificationResult::reject(ReasonCode::UnprocessableMalformed);
        };
        if self.is_unsupported_domain(&host) {
            return ClassificationResult::reject(ReasonCode::UnprocessableDomain);
        }

        let ext = extension_of(url.path());
        if let Some(ext) = ext.as_deref()
            && self.is_unsupported_extension(ext)
        {
            return ClassificationResult::reject(ReasonCode::UnprocessableExtension);
        }

        if let Some(strategy) = strategy_from_hint(hint) {
            return ClassificationResult::accept(strategy);
        }
        if feed {
            return ClassificationResult::accept(Strategy::Feed);
        }
        if let Some(strategy) = ext.as_deref().and_then(strategy_from_extension) {
            return ClassificationResult::accept(strategy);
        }

        let host = host.strip_prefix("www.").unwrap_or(&host);
        let spotify_episode = host == "open.spotify.com" && url.path().starts_with("/episode");
        if contains(PODCAST_HOSTS, host) || spotify_episode {
            return ClassificationResult::accept(Strategy::Podcast);
        }
        let feedish = url
            .path_segments()
            .map(|mut segs| {
                segs.any(|s| s.eq_ignore_ascii_case("feed") || s.eq_ignore_ascii_case("rss"))
            })
            .unwrap_or(false);
        if feedish {
            return ClassificationResult::accept(Strategy::Feed);
        }

        ClassificationResult::accept(Strategy::Article)
    }

    fn classify_path(&self, path: &str, hint: Option<&str>) -> ClassificationResult {
        let ext = extension_of(path);
        if let Some(ext) = ext.as_deref()
            && self.is_unsupported_extension(ext)
        {
            return ClassificationResult::reject(ReasonCode::UnprocessableExtension);
        }

        let strategy = strategy_from_hint(hint)
            .or_else(|| ext.as_deref().and_then(strategy_from_extension))
            .unwrap_or(Strategy::Document);
        ClassificationResult::accept(strategy)
    }

    fn is_unsupported_domain(&self, host: &str) -> bool {
        self.config
            .unsupported_domains
            .iter()
            .any(|d| host == d || host.ends_with(&format!(".{d}")))
    }

    fn is_unsupported_extension(&self, ext: &str) -> bool {
        self.config.unsupported_extensions.iter().any(|e| e == ext)
    }
}

fn contains(list: &[&str], needle: &str) -> bool {
    list.iter().any(|entry| *entry == needle)
}

fn has_drive_letter(reference: &str) -> bool {
    let bytes = reference.as_bytes();
    bytes.len() > 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && matches!(bytes[2], b'\\' | b'/')
}

fn looks_like_path(reference: &str) -> bool {
    reference.starts_with('/')
        || reference.starts_with("./")
        || reference.starts_with("../")
        || reference.starts_with('~')
        || reference.contains('\\')
}

/// Lowercased extension of the last path segment, if it has one.
fn extension_of(path: &str) -> Option<String> {
    let last = path.rsplit(['/', '\\']).next()?;
    let (stem, ext) = last.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn strategy_from_extension(ext: &str) -> Option<Strategy> {
    if contains(AUDIO_EXTENSIONS, ext) {
        Some(Strategy::Podcast)
    } else if contains(FEED_EXTENSIONS, ext) {
        Some(Strategy::Feed)
    } else if contains(DOCUMENT_EXTENSIONS, ext) {
        Some(Strategy::Document)
    } else {
        None
    }
}

fn strategy_from_hint(hint: Option<&str>) -> Option<Strategy> {
    let mime = hint?.split(';').next()?.trim().to_ascii_lowercase();
    if mime.starts_with("audio/") || mime.starts_with("video/") {
        return Some(Strategy::Podcast);
    }
    match mime.as_str() {
        "application/rss+xml" | "application/atom+xml" | "application/xml" | "text/xml" => {
            Some(Strategy::Feed)
        }
        "application/pdf"
        | "application/msword"
        | "application/epub+zip"
        | "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        | "text/plain"
        | "text/markdown" => Some(Strategy::Document),
        "text/html" => Some(Strategy::Article),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn classifier() -> Classifier {
        Classifier::new(ClassifierConfig::default())
    }

    #[rstest]
    #[case("https://example.com/posts/hello", None, Strategy::Article)]
    #[case("http://example.com/episode.mp3", None, Strategy::Podcast)]
    #[case("https://example.com/feed", None, Strategy::Feed)]
    #[case("https://example.com/blog/index.xml", None, Strategy::Feed)]
    #[case("feed://example.com/latest", None, Strategy::Feed)]
    #[case("feed:example.com/rss", None, Strategy::Feed)]
    #[case("https://example.com/paper.pdf", None, Strategy::Document)]
    #[case("https://overcast.fm/+abc", None, Strategy::Podcast)]
    #[case("https://example.com/stream", Some("audio/mpeg"), Strategy::Podcast)]
    #[case("https://example.com/x", Some("application/rss+xml; charset=utf-8"), Strategy::Feed)]
    #[case("/uploads/report.docx", None, Strategy::Document)]
    #[case("file:///home/me/notes.md", None, Strategy::Document)]
    #[case("C:\\uploads\\talk.m4a", None, Strategy::Podcast)]
    fn processable_references(
        #[case] reference: &str,
        #[case] hint: Option<&str>,
        #[case] expected: Strategy,
    ) {
        let result = classifier().classify(reference, hint);
        assert!(result.processable, "{reference} should be processable");
        assert_eq!(result.strategy, expected);
        assert_eq!(result.reason, None);
    }

    #[rstest]
    #[case("", ReasonCode::UnprocessableEmpty)]
    #[case("   ", ReasonCode::UnprocessableEmpty)]
    #[case("mailto:someone@example.com", ReasonCode::UnprocessableScheme)]
    #[case("javascript:alert(1)", ReasonCode::UnprocessableScheme)]
    #[case("ftp://example.com/file.txt", ReasonCode::UnprocessableScheme)]
    #[case("just some words", ReasonCode::UnprocessableScheme)]
    #[case("https://example.com/setup.exe", ReasonCode::UnprocessableExtension)]
    #[case("/tmp/archive.ZIP", ReasonCode::UnprocessableExtension)]
    #[case("http://exa mple.com/a", ReasonCode::UnprocessableMalformed)]
    #[case("https://example.com:99999/a", ReasonCode::UnprocessableMalformed)]
    #[case("feed:", ReasonCode::UnprocessableMalformed)]
    #[case("http://localhost:8080/a", ReasonCode::UnprocessableDomain)]
    #[case("https://api.localhost/a", ReasonCode::UnprocessableDomain)]
    fn unprocessable_references(#[case] reference: &str, #[case] reason: ReasonCode) {
        let result = classifier().classify(reference, None);
        assert!(!result.processable);
        assert_eq!(result.strategy, Strategy::Unprocessable);
        assert_eq!(result.reason, Some(reason));
    }

    #[test]
    fn configured_lists_are_normalized() {
        let c = Classifier::new(ClassifierConfig {
            unsupported_domains: vec![".Paywalled.example".to_string()],
            unsupported_extensions: vec![".MOBI".to_string()],
        });
        assert_eq!(
            c.classify("https://news.paywalled.example/a", None).reason,
            Some(ReasonCode::UnprocessableDomain)
        );
        assert_eq!(
            c.classify("https://example.com/book.mobi", None).reason,
            Some(ReasonCode::UnprocessableExtension)
        );
        assert!(c.classify("https://example.com/photo.png", None).processable);
    }

    #[test]
    fn classification_is_deterministic() {
        let c = classifier();
        let a = c.classify("https://example.com/a.mp3", None);
        let b = c.classify("https://example.com/a.mp3", None);
        assert_eq!(a, b);
    }
}
