// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tag registry: maps tag names to dense 16-bit identifiers and gates which
//! identifiers may be written.
//!
//! Negotiation is optimistic: [`Tagger::negotiate`] hands out an identifier for any
//! well-formed name so the remote side can decide whether to accept it. Admission is
//! decided separately by the [`TagMask`], whose bit is only ever set for names that
//! match a configured pattern.

use std::hash::BuildHasherDefault;
use std::sync::{Mutex, OnceLock, PoisonError};

use fnv::FnvHasher;
use hashbrown::HashMap;
use regex::Regex;
use tracing::debug;

use crate::constants::{FORBIDDEN_TAG_CHARS, INTERNAL_TAG_NAME, MAX_TAG_LENGTH};
use crate::entry::EntryTag;
use crate::errors::TagError;

type FnvMap<K, V> = HashMap<K, V, BuildHasherDefault<FnvHasher>>;

const MASK_WORDS: usize = (u16::MAX as usize + 1) / 64;

/// Fixed 65,536-bit set; bit `i` set means tag `i` is permitted.
#[derive(Clone)]
pub struct TagMask {
    words: Box<[u64; MASK_WORDS]>,
}

impl TagMask {
    #[must_use]
    pub fn new() -> Self {
        Self {
            words: Box::new([0; MASK_WORDS]),
        }
    }

    #[inline]
    pub fn set(&mut self, tag: EntryTag) {
        let (word, bit) = Self::locate(tag);
        self.words[word] |= bit;
    }

    #[inline]
    pub fn clear(&mut self, tag: EntryTag) {
        let (word, bit) = Self::locate(tag);
        self.words[word] &= !bit;
    }

    #[inline]
    #[must_use]
    pub fn is_set(&self, tag: EntryTag) -> bool {
        let (word, bit) = Self::locate(tag);
        self.words[word] & bit != 0
    }

    #[inline]
    fn locate(tag: EntryTag) -> (usize, u64) {
        let id = usize::from(tag.0);
        (id / 64, 1u64 << (id % 64))
    }
}

impl Default for TagMask {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TagMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set: u32 = self.words.iter().map(|w| w.count_ones()).sum();
        write!(f, "TagMask({set} set)")
    }
}

/// A configured allow-pattern: a literal name, or a glob with exactly one `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagPattern {
    Literal(String),
    Wildcard { prefix: String, suffix: String },
}

impl TagPattern {
    pub fn parse(pattern: &str) -> Result<Self, TagError> {
        let invalid = |reason| TagError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };
        if pattern.is_empty() {
            return Err(invalid("empty pattern"));
        }
        if pattern.len() > MAX_TAG_LENGTH {
            return Err(invalid("pattern too long"));
        }
        match pattern.matches('*').count() {
            0 => {
                check_name(pattern).map_err(|_| invalid("forbidden characters"))?;
                Ok(Self::Literal(pattern.to_string()))
            }
            1 => {
                let (prefix, suffix) = pattern.split_once('*').ok_or_else(|| invalid("no wildcard"))?;
                for part in [prefix, suffix] {
                    if !part.is_empty() && forbidden().is_match(part) {
                        return Err(invalid("forbidden characters"));
                    }
                }
                Ok(Self::Wildcard {
                    prefix: prefix.to_string(),
                    suffix: suffix.to_string(),
                })
            }
            _ => Err(invalid("more than one wildcard")),
        }
    }

    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Literal(literal) => literal == name,
            Self::Wildcard { prefix, suffix } => {
                name.len() >= prefix.len() + suffix.len()
                    && name.starts_with(prefix.as_str())
                    && name.ends_with(suffix.as_str())
            }
        }
    }
}

fn forbidden() -> &'static Regex {
    static FORBIDDEN: OnceLock<Regex> = OnceLock::new();
    FORBIDDEN.get_or_init(|| {
        let class = regex::escape(FORBIDDEN_TAG_CHARS);
        #[allow(clippy::expect_used)]
        Regex::new(&format!(r"[\s{class}]")).expect("forbidden tag character class")
    })
}

/// Validates a concrete tag name (no wildcards allowed).
pub fn check_name(name: &str) -> Result<(), TagError> {
    if name.is_empty() {
        return Err(TagError::Empty);
    }
    if name.len() > MAX_TAG_LENGTH {
        return Err(TagError::TooLong {
            max: MAX_TAG_LENGTH,
        });
    }
    if forbidden().is_match(name) {
        return Err(TagError::ForbiddenCharacters(name.to_string()));
    }
    Ok(())
}

#[derive(Debug)]
struct TaggerState {
    ids: FnvMap<String, EntryTag>,
    // index == identifier value
    names: Vec<String>,
    mask: TagMask,
}

/// Thread-safe tag name registry.
#[derive(Debug)]
pub struct Tagger {
    patterns: Vec<TagPattern>,
    state: Mutex<TaggerState>,
}

impl Tagger {
    /// Builds a tagger from allow-patterns. Literal patterns are negotiated up front,
    /// in order, so configured tags get the lowest identifiers.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, TagError> {
        let patterns = patterns
            .iter()
            .map(|p| TagPattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut mask = TagMask::new();
        mask.set(EntryTag::INTERNAL);
        let tagger = Self {
            patterns,
            state: Mutex::new(TaggerState {
                ids: FnvMap::default(),
                names: Vec::new(),
                mask,
            }),
        };

        let literals: Vec<String> = tagger
            .patterns
            .iter()
            .filter_map(|p| match p {
                TagPattern::Literal(name) => Some(name.clone()),
                TagPattern::Wildcard { .. } => None,
            })
            .collect();
        for name in literals {
            tagger.negotiate(&name)?;
        }
        Ok(tagger)
    }

    #[must_use]
    pub fn patterns(&self) -> &[TagPattern] {
        &self.patterns
    }

    /// True iff `name` matches a configured literal or wildcard pattern.
    #[must_use]
    pub fn allowed_name(&self, name: &str) -> bool {
        name == INTERNAL_TAG_NAME || self.patterns.iter().any(|p| p.matches(name))
    }

    /// Resolves `name` to its identifier, allocating the next one when unseen.
    ///
    /// Succeeds for names no pattern allows; such identifiers are never marked
    /// allowed in the mask.
    pub fn negotiate(&self, name: &str) -> Result<EntryTag, TagError> {
        check_name(name)?;
        if name == INTERNAL_TAG_NAME {
            return Ok(EntryTag::INTERNAL);
        }
        let allowed = self.allowed_name(name);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tag) = state.ids.get(name) {
            return Ok(*tag);
        }
        // u16::MAX is reserved for the internal tag
        if state.names.len() >= usize::from(u16::MAX) {
            return Err(TagError::Exhausted);
        }
        let tag = EntryTag(u16::try_from(state.names.len()).map_err(|_| TagError::Exhausted)?);
        state.names.push(name.to_string());
        state.ids.insert(name.to_string(), tag);
        if allowed {
            state.mask.set(tag);
        }
        debug!("INGEST | negotiated tag {name} as {tag} (allowed: {allowed})");
        Ok(tag)
    }

    /// Pattern-checked negotiation: fails for names no pattern allows.
    pub fn negotiate_allowed(&self, name: &str) -> Result<EntryTag, TagError> {
        check_name(name)?;
        if !self.allowed_name(name) {
            return Err(TagError::NotAllowed(name.to_string()));
        }
        self.negotiate(name)
    }

    /// True iff the mask bit for `tag` is set.
    #[must_use]
    pub fn allowed(&self, tag: EntryTag) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .mask
            .is_set(tag)
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<EntryTag> {
        if name == INTERNAL_TAG_NAME {
            return Some(EntryTag::INTERNAL);
        }
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.ids.get(name).copied()
    }

    #[must_use]
    pub fn name_of(&self, tag: EntryTag) -> Option<String> {
        if tag == EntryTag::INTERNAL {
            return Some(INTERNAL_TAG_NAME.to_string());
        }
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.names.get(usize::from(tag.0)).cloned()
    }

    /// Negotiated tags in negotiation order.
    #[must_use]
    pub fn tags(&self) -> Vec<(String, EntryTag)> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .names
            .iter()
            .enumerate()
            .filter_map(|(i, name)| u16::try_from(i).ok().map(|id| (name.clone(), EntryTag(id))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PATTERNS: [&str; 4] = ["default", "gravwell", "foo*bar", "bar*baz"];

    #[test]
    fn test_mask_every_id() {
        let mut mask = TagMask::new();
        for id in 0..=u16::MAX {
            let tag = EntryTag(id);
            assert!(!mask.is_set(tag));
            mask.set(tag);
            assert!(mask.is_set(tag));
            mask.clear(tag);
            assert!(!mask.is_set(tag));
        }
    }

    #[test]
    fn test_mask_bits_are_independent() {
        let mut mask = TagMask::new();
        mask.set(EntryTag(63));
        mask.set(EntryTag(64));
        mask.clear(EntryTag(63));
        assert!(!mask.is_set(EntryTag(63)));
        assert!(mask.is_set(EntryTag(64)));
        assert!(!mask.is_set(EntryTag(65)));
    }

    #[test]
    fn test_allowed_name_patterns() {
        let tagger = Tagger::new(&PATTERNS).expect("tagger");
        assert!(tagger.allowed_name("foobar"));
        assert!(tagger.allowed_name("foofatbar"));
        assert!(!tagger.allowed_name("fatbar"));
        assert!(tagger.allowed_name("barbaz"));
        assert!(tagger.allowed_name("default"));
        assert!(!tagger.allowed_name("Default"));
        assert!(!tagger.allowed_name("foobarx"));
    }

    #[test]
    fn test_negotiate_is_stable_and_sets_mask() {
        let tagger = Tagger::new(&PATTERNS).expect("tagger");
        let first = tagger.negotiate("foobar").expect("negotiate");
        let second = tagger.negotiate("foobar").expect("negotiate");
        assert_eq!(first, second);

        let mut negotiated = vec![first];
        for name in ["default", "gravwell", "foofatbar", "barbaz"] {
            negotiated.push(tagger.negotiate(name).expect("negotiate"));
        }
        for tag in &negotiated {
            assert!(tagger.allowed(*tag));
        }
        for id in 0..u16::MAX {
            let tag = EntryTag(id);
            if !negotiated.contains(&tag) {
                assert!(!tagger.allowed(tag), "tag {id} should not be allowed");
            }
        }
    }

    #[test]
    fn test_literals_negotiated_in_config_order() {
        let tagger = Tagger::new(&PATTERNS).expect("tagger");
        assert_eq!(tagger.lookup("default"), Some(EntryTag(0)));
        assert_eq!(tagger.lookup("gravwell"), Some(EntryTag(1)));
        assert_eq!(tagger.negotiate("foobar").expect("negotiate"), EntryTag(2));
        assert_eq!(
            tagger.tags(),
            vec![
                ("default".to_string(), EntryTag(0)),
                ("gravwell".to_string(), EntryTag(1)),
                ("foobar".to_string(), EntryTag(2)),
            ]
        );
        assert_eq!(tagger.name_of(EntryTag(2)).as_deref(), Some("foobar"));
    }

    #[test]
    fn test_unconfigured_name_negotiates_but_is_not_allowed() {
        let tagger = Tagger::new(&PATTERNS).expect("tagger");
        let tag = tagger.negotiate("fatbar").expect("negotiate");
        assert!(!tagger.allowed(tag));
        assert!(matches!(
            tagger.negotiate_allowed("fatbar"),
            Err(TagError::NotAllowed(_))
        ));
        assert_eq!(tagger.negotiate_allowed("foozbar").ok(), tagger.lookup("foozbar"));
    }

    #[test]
    fn test_negotiate_rejects_malformed_names() {
        let tagger = Tagger::new(&PATTERNS).expect("tagger");
        assert!(matches!(tagger.negotiate(""), Err(TagError::Empty)));
        for bad in ["foo bar", "foo*bar", "a.b", "tab\there", "x|y", "q\"uote"] {
            assert!(
                matches!(tagger.negotiate(bad), Err(TagError::ForbiddenCharacters(_))),
                "{bad} should be rejected"
            );
        }
        let long = "a".repeat(MAX_TAG_LENGTH + 1);
        assert!(matches!(tagger.negotiate(&long), Err(TagError::TooLong { .. })));
    }

    #[test]
    fn test_malformed_patterns_are_configuration_errors() {
        for bad in ["", "a*b*c", "foo bar", "foo*b.r"] {
            assert!(
                matches!(Tagger::new(&[bad]), Err(TagError::InvalidPattern { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_internal_tag_is_reserved_and_allowed() {
        let tagger = Tagger::new(&["default"]).expect("tagger");
        assert_eq!(
            tagger.negotiate(INTERNAL_TAG_NAME).expect("negotiate"),
            EntryTag::INTERNAL
        );
        assert!(tagger.allowed(EntryTag::INTERNAL));
        assert_eq!(tagger.tags().len(), 1);
    }

    #[test]
    fn test_identifier_space_exhaustion() {
        let tagger = Tagger::new(&["t*"]).expect("tagger");
        for i in 0..u16::MAX {
            tagger.negotiate(&format!("t{i}")).expect("negotiate");
        }
        assert!(matches!(tagger.negotiate("tlast"), Err(TagError::Exhausted)));
        // already negotiated names still resolve
        assert_eq!(tagger.negotiate("t0").expect("negotiate"), EntryTag(0));
    }

    proptest! {
        #[test]
        fn prop_wildcard_matches_any_infix(infix in "[a-z0-9_-]{0,16}") {
            let pattern = TagPattern::parse("foo*bar").expect("pattern");
            let name = format!("foo{infix}bar");
            prop_assert!(pattern.matches(&name));
        }

        #[test]
        fn prop_negotiate_is_idempotent(names in proptest::collection::vec("[a-z]{1,8}", 1..32)) {
            let tagger = Tagger::new(&["*"]).expect("tagger");
            let first: Vec<EntryTag> = names.iter().map(|n| tagger.negotiate(n).expect("negotiate")).collect();
            let second: Vec<EntryTag> = names.iter().map(|n| tagger.negotiate(n).expect("negotiate")).collect();
            prop_assert_eq!(&first, &second);
            for tag in first {
                prop_assert!(tagger.allowed(tag));
            }
        }
    }
}
