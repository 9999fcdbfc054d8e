//! Deduplicator - 正規化と重複排除
//!
//! Two layers:
//! - [`canonicalize`]: a total, idempotent normalization of a raw reference.
//! - [`Deduplicator`]: the key registry. It holds no lock of its own; the
//!   queue manager owns it behind its state mutex, which is what makes
//!   `register_or_reject` an atomic check-and-set.

use std::collections::HashMap;

use url::Url;
use url::form_urlencoded;

use crate::domain::{CanonicalKey, ContentFingerprint, ItemId};

/// Query parameters that only carry attribution, never identity.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "msclkid", "mc_cid", "mc_eid", "igshid", "yclid", "_hsenc",
    "_hsmi", "ref_src", "spm",
];

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.iter().any(|p| *p == key)
}

/// Normalize a raw reference into its canonical key.
///
/// Web references (`http`, `https`, `feed`):
/// - scheme collapsed to `https`, host lowercased, leading `www.` dropped
/// - default ports, userinfo and fragment dropped
/// - tracking parameters stripped, remaining parameters sorted
/// - trailing `/` stripped from the path
///
/// Other URLs lose their fragment and trailing `/`. Anything else is treated
/// as a path: surrounding whitespace and trailing separators are stripped,
/// case is kept.
///
/// Stripping a path can expose a parseable URL (`"http://a.com /"`), so the
/// rules are applied until the result stops changing.
///
/// `canonicalize(canonicalize(x).as_str()) == canonicalize(x)` for every input.
pub fn canonicalize(raw_reference: &str) -> CanonicalKey {
    let mut current = canonical_string(raw_reference.trim());
    for _ in 0..MAX_PASSES {
        let next = canonical_string(current.trim());
        if next == current {
            break;
        }
        current = next;
    }
    CanonicalKey::new(current)
}

/// Every rule shortens or fixes its input; real references settle in two.
const MAX_PASSES: usize = 8;

/// Circuit breaker source key for a reference: its canonical host, or
/// `local` when it has none (paths, `file:` and opaque URLs).
///
/// ```
/// use sluice_core::source_key_of;
/// assert_eq!(source_key_of("http://www.Example.com/a?utm_source=x"), "example.com");
/// assert_eq!(source_key_of("/home/me/notes.md"), "local");
/// ```
pub fn source_key_of(raw_reference: &str) -> String {
    let key = canonicalize(raw_reference);
    Url::parse(key.as_str())
        .ok()
        .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "local".to_string())
}

fn canonical_string(reference: &str) -> String {
    if is_drive_path(reference) {
        return canonical_path(reference);
    }
    match Url::parse(reference) {
        Ok(url) if url.scheme().len() > 1 => canonical_url(reference, url),
        _ => canonical_path(reference),
    }
}

fn canonical_url(reference: &str, url: Url) -> String {
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => canonical_web(&url),
        "feed" => {
            // `feed` is not a special scheme, so reparse the rest as https to
            // get the same host/path normalization http(s) gets.
            let rest = &reference[reference.find(':').map_or(0, |i| i + 1)..];
            match Url::parse(&format!("https:{rest}")) {
                Ok(web) if web.host_str().is_some() => canonical_web(&web),
                _ => canonical_other(url),
            }
        }
        _ => canonical_other(url),
    }
}

fn canonical_web(url: &Url) -> String {
    let mut host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    while let Some(rest) = host.strip_prefix("www.")
        && rest.contains('.')
    {
        host = rest.to_string();
    }

    let port = match url.port() {
        Some(80) | Some(443) | None => String::new(),
        Some(p) => format!(":{p}"),
    };

    let path = url.path().trim_end_matches('/');

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    let query = if pairs.is_empty() {
        String::new()
    } else {
        let encoded = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter())
            .finish();
        format!("?{encoded}")
    };

    format!("https://{host}{port}{path}{query}")
}

fn canonical_other(mut url: Url) -> String {
    url.set_fragment(None);
    if !url.cannot_be_a_base() {
        let trimmed = url.path().trim_end_matches('/').to_string();
        if !trimmed.is_empty() && trimmed.len() != url.path().len() {
            url.set_path(&trimmed);
        }
    }
    url.to_string()
}

fn canonical_path(reference: &str) -> String {
    reference
        .trim_end_matches(|c: char| c == '/' || c == '\\' || c.is_whitespace())
        .trim_start()
        .to_string()
}

fn is_drive_path(reference: &str) -> bool {
    let bytes = reference.as_bytes();
    bytes.len() > 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && matches!(bytes[2], b'\\' | b'/')
}

/// Result of the admission check-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    Admitted { item_id: ItemId, generation: u32 },
    DuplicateOfActive(ItemId),
    DuplicateOfCompleted(ItemId),
    DuplicateOfDeadLettered(ItemId),
}

/// Where the latest item for a key stands, as far as dedup cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Active,
    Completed,
    DeadLettered,
}

#[derive(Debug, Clone, Copy)]
struct KeyEntry {
    item_id: ItemId,
    generation: u32,
    state: KeyState,
}

impl KeyEntry {
    fn as_duplicate(&self) -> DedupOutcome {
        match self.state {
            KeyState::Active => DedupOutcome::DuplicateOfActive(self.item_id),
            KeyState::Completed => DedupOutcome::DuplicateOfCompleted(self.item_id),
            KeyState::DeadLettered => DedupOutcome::DuplicateOfDeadLettered(self.item_id),
        }
    }
}

/// Canonical-key and content-fingerprint registry.
#[derive(Debug, Default)]
pub struct Deduplicator {
    keys: HashMap<CanonicalKey, KeyEntry>,
    /// Fingerprints of completed items only.
    fingerprints: HashMap<ContentFingerprint, (ItemId, CanonicalKey)>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `key` if nothing is registered under it, otherwise report what is.
    pub fn register_or_reject(&mut self, key: &CanonicalKey) -> DedupOutcome {
        if let Some(entry) = self.keys.get(key) {
            return entry.as_duplicate();
        }
        let item_id = ItemId::derive(key, 0);
        self.keys.insert(
            key.clone(),
            KeyEntry {
                item_id,
                generation: 0,
                state: KeyState::Active,
            },
        );
        DedupOutcome::Admitted {
            item_id,
            generation: 0,
        }
    }

    /// Non-mutating form of `register_or_reject`: `None` means it would admit.
    pub fn check(&self, key: &CanonicalKey) -> Option<DedupOutcome> {
        self.keys.get(key).map(KeyEntry::as_duplicate)
    }

    /// Register a key that goes straight to quarantine (classifier rejection).
    ///
    /// Returns the existing outcome instead if the key is already known.
    pub fn register_quarantined(&mut self, key: &CanonicalKey) -> Result<ItemId, DedupOutcome> {
        if let Some(entry) = self.keys.get(key) {
            return Err(entry.as_duplicate());
        }
        let item_id = ItemId::derive(key, 0);
        self.keys.insert(
            key.clone(),
            KeyEntry {
                item_id,
                generation: 0,
                state: KeyState::DeadLettered,
            },
        );
        Ok(item_id)
    }

    /// Re-admit a dead-lettered key under the next generation.
    ///
    /// `None` if the key is unknown or not dead-lettered.
    pub fn readmit(&mut self, key: &CanonicalKey) -> Option<(ItemId, u32)> {
        let entry = self.keys.get_mut(key)?;
        if entry.state != KeyState::DeadLettered {
            return None;
        }
        entry.generation += 1;
        entry.item_id = ItemId::derive(key, entry.generation);
        entry.state = KeyState::Active;
        Some((entry.item_id, entry.generation))
    }

    /// Move the key's latest item to `state`. Returns false if the key is
    /// unknown or registered to a different item.
    pub fn set_state(&mut self, key: &CanonicalKey, item_id: ItemId, state: KeyState) -> bool {
        match self.keys.get_mut(key) {
            Some(entry) if entry.item_id == item_id => {
                entry.state = state;
                true
            }
            _ => false,
        }
    }

    pub fn state_of(&self, key: &CanonicalKey) -> Option<(ItemId, KeyState)> {
        self.keys.get(key).map(|e| (e.item_id, e.state))
    }

    /// Completed item with identical content under a *different* key.
    pub fn completed_with_fingerprint(
        &self,
        fingerprint: &ContentFingerprint,
        key: &CanonicalKey,
    ) -> Option<ItemId> {
        self.fingerprints
            .get(fingerprint)
            .filter(|(_, owner)| owner != key)
            .map(|(id, _)| *id)
    }

    /// Index the fingerprint of a completed item. First writer wins.
    pub fn record_fingerprint(
        &mut self,
        fingerprint: ContentFingerprint,
        item_id: ItemId,
        key: &CanonicalKey,
    ) {
        self.fingerprints
            .entry(fingerprint)
            .or_insert_with(|| (item_id, key.clone()));
    }

    /// Rebuild an entry from persisted state. Keeps the highest generation.
    pub fn restore(&mut self, key: &CanonicalKey, item_id: ItemId, generation: u32, state: KeyState) {
        let replace = self
            .keys
            .get(key)
            .is_none_or(|existing| existing.generation <= generation);
        if replace {
            self.keys.insert(
                key.clone(),
                KeyEntry {
                    item_id,
                    generation,
                    state,
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
