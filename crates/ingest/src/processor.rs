// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process stage that can rewrite, drop or hold back entries before delivery.
//!
//! Processors run in registration order on every write. An entry dropped by one stage
//! never reaches the next. Anything a processor buffers is released through
//! [`Processor::flush`] and continues through the stages after it.

use std::collections::HashMap;

use async_trait::async_trait;
use regex::bytes::Regex;
use tracing::debug;

use crate::entry::Entry;
use crate::errors::ProcessorError;

#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    /// Applies a flat key/value configuration. Called before the first `process`.
    fn load_config(&mut self, vars: &HashMap<String, String>) -> Result<(), ProcessorError>;

    async fn process(&mut self, entries: Vec<Entry>) -> Result<Vec<Entry>, ProcessorError>;

    /// Releases anything held back. Called by `sync` and `close`.
    async fn flush(&mut self) -> Vec<Entry> {
        Vec::new()
    }
}

/// Ordered chain of processors.
#[derive(Default)]
pub struct ProcessorSet {
    stages: Vec<Box<dyn Processor>>,
}

impl ProcessorSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, processor: Box<dyn Processor>) {
        debug!("INGEST | registered processor {}", processor.name());
        self.stages.push(processor);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub async fn process(&mut self, entries: Vec<Entry>) -> Result<Vec<Entry>, ProcessorError> {
        self.process_from(0, entries).await
    }

    /// Flushes every stage, pushing each stage's output through the stages after it.
    pub async fn flush(&mut self) -> Result<Vec<Entry>, ProcessorError> {
        let mut released = Vec::new();
        for idx in 0..self.stages.len() {
            let flushed = self.stages[idx].flush().await;
            if flushed.is_empty() {
                continue;
            }
            released.extend(self.process_from(idx + 1, flushed).await?);
        }
        Ok(released)
    }

    async fn process_from(
        &mut self,
        start: usize,
        mut entries: Vec<Entry>,
    ) -> Result<Vec<Entry>, ProcessorError> {
        for stage in self.stages.iter_mut().skip(start) {
            if entries.is_empty() {
                break;
            }
            entries = stage.process(entries).await?;
        }
        Ok(entries)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleKind {
    ExcludeAtMatch,
    IncludeAtMatch,
    MaskSequences,
}

#[derive(Clone, Debug)]
pub struct Rule {
    pub kind: RuleKind,
    pub regex: Regex,
    pub placeholder: Vec<u8>,
}

/// Payload filter and masker.
///
/// Configuration keys:
/// - `exclude_at_match`: drop entries whose payload matches
/// - `include_at_match`: drop entries whose payload does not match
/// - `mask_sequences` with `mask_placeholder`: replace matches in the payload
///
/// Exclusions are checked first, then inclusions, then masks are applied to survivors.
#[derive(Default)]
pub struct RuleProcessor {
    rules: Vec<Rule>,
}

impl RuleProcessor {
    pub const NAME: &'static str = "rules";

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    fn compile(pattern: &str) -> Result<Regex, ProcessorError> {
        Regex::new(pattern).map_err(|e| ProcessorError {
            name: Self::NAME.to_string(),
            message: format!("invalid pattern {pattern:?}: {e}"),
        })
    }

    // true when the entry survives
    fn apply(&self, data: &mut Vec<u8>) -> bool {
        for rule in &self.rules {
            match rule.kind {
                RuleKind::ExcludeAtMatch => {
                    if rule.regex.is_match(&data[..]) {
                        return false;
                    }
                }
                RuleKind::IncludeAtMatch => {
                    if !rule.regex.is_match(&data[..]) {
                        return false;
                    }
                }
                RuleKind::MaskSequences => {}
            }
        }
        for rule in &self.rules {
            if rule.kind == RuleKind::MaskSequences {
                let masked = rule
                    .regex
                    .replace_all(&data[..], regex::bytes::NoExpand(&rule.placeholder[..]));
                if let std::borrow::Cow::Owned(masked) = masked {
                    *data = masked;
                }
            }
        }
        true
    }
}

#[async_trait]
impl Processor for RuleProcessor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn load_config(&mut self, vars: &HashMap<String, String>) -> Result<(), ProcessorError> {
        let mut rules = Vec::new();
        if let Some(pattern) = vars.get("exclude_at_match") {
            rules.push(Rule {
                kind: RuleKind::ExcludeAtMatch,
                regex: Self::compile(pattern)?,
                placeholder: Vec::new(),
            });
        }
        if let Some(pattern) = vars.get("include_at_match") {
            rules.push(Rule {
                kind: RuleKind::IncludeAtMatch,
                regex: Self::compile(pattern)?,
                placeholder: Vec::new(),
            });
        }
        if let Some(pattern) = vars.get("mask_sequences") {
            let placeholder = vars
                .get("mask_placeholder")
                .map(|p| p.as_bytes().to_vec())
                .ok_or_else(|| ProcessorError {
                    name: Self::NAME.to_string(),
                    message: "mask_sequences requires mask_placeholder".to_string(),
                })?;
            rules.push(Rule {
                kind: RuleKind::MaskSequences,
                regex: Self::compile(pattern)?,
                placeholder,
            });
        }
        self.rules = rules;
        Ok(())
    }

    async fn process(&mut self, mut entries: Vec<Entry>) -> Result<Vec<Entry>, ProcessorError> {
        if self.rules.is_empty() {
            return Ok(entries);
        }
        entries.retain_mut(|entry| self.apply(&mut entry.data));
        Ok(entries)
    }
}
