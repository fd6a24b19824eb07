//! Pattern matching engine.
//!
//! Pure functions over an immutable [`RuleSet`] snapshot: no side effects,
//! safe to run concurrently on independent artifacts without synchronization.

use super::{ArtifactKind, Finding, ScriptType};
use crate::rules::RuleSet;

/// Longest excerpt carried in a finding's `matched_text`.
const MAX_MATCH_EXCERPT: usize = 200;

/// Run every enabled rule against `text` and collect findings.
///
/// Infallible: every pattern was validated at rule-set load, and matching
/// itself cannot fault.
///
/// A rule may match at many sites; all non-overlapping sites are retained as
/// spans on a single [`Finding`], so repeated hits of the same rule count once
/// for scoring while every location stays reportable. Finding order follows
/// rule-store iteration order.
pub fn scan(ruleset: &RuleSet, artifact_id: &str, text: &str) -> Vec<Finding> {
    let mut findings = Vec::new();

    for rule in ruleset.enabled_rules() {
        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut first_text: Option<&str> = None;

        for m in rule.matcher.find_iter(text) {
            // Collapse overlapping sites for the same rule to the first one.
            if let Some(&(off, len)) = spans.last() {
                if m.start() < off + len {
                    continue;
                }
            }
            spans.push((m.start(), m.end() - m.start()));
            first_text.get_or_insert(m.as_str());
        }

        if let Some(matched) = first_text {
            findings.push(Finding {
                rule_id: rule.id.clone(),
                category: rule.category,
                spans,
                matched_text: truncate_excerpt(matched),
                severity_weight: rule.severity_weight,
            });
        }
    }

    tracing::debug!(
        artifact = %artifact_id,
        findings = findings.len(),
        "Scan complete"
    );
    findings
}

fn truncate_excerpt(s: &str) -> String {
    if s.len() <= MAX_MATCH_EXCERPT {
        return s.to_string();
    }
    let mut end = MAX_MATCH_EXCERPT;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Lexical script dialect sniffing, for reporting only.
pub fn sniff_script_type(content: &str) -> ScriptType {
    let lower = content.to_lowercase();
    if lower.contains("powershell") || lower.contains("invoke-expression") {
        ScriptType::PowerShell
    } else if lower.contains("#!/bin/bash") || lower.contains("bash") {
        ScriptType::Bash
    } else if lower.contains("#!/usr/bin/env python") || lower.contains("python") {
        ScriptType::Python
    } else {
        ScriptType::Unknown
    }
}

/// Slice the scannable portions out of an artifact.
///
/// Build logs wrap executed script content in `##[command] ... ##[section]Finishing`
/// markers; only those blocks are worth matching, the surrounding agent chatter
/// is noise. Definitions and build payloads are scanned whole.
pub fn scannable_blocks(kind: ArtifactKind, content: &str) -> Vec<&str> {
    match kind {
        ArtifactKind::Definition | ArtifactKind::Build => vec![content],
        ArtifactKind::Log => {
            let blocks = extract_command_blocks(content);
            if blocks.is_empty() {
                // No markers: treat the whole log as one block.
                vec![content]
            } else {
                blocks
            }
        }
    }
}

fn extract_command_blocks(log: &str) -> Vec<&str> {
    const START: &str = "##[command]";
    const END: &str = "##[section]Finishing";

    let mut blocks = Vec::new();
    let mut rest = log;
    while let Some(start) = rest.find(START) {
        let body = &rest[start..];
        match body.find(END) {
            Some(end) => {
                blocks.push(&body[..end + END.len()]);
                rest = &body[end + END.len()..];
            }
            None => {
                blocks.push(body);
                break;
            }
        }
    }
    blocks
}
