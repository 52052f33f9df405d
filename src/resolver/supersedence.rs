// src/resolver/supersedence.rs

//! Supersedence classification and priority arbitration
//!
//! Pure decision functions over two packages of the same family. An *update*
//! is binary-compatible (the candidate's binding policy covers the reference
//! version) and may silently replace the reference as current; an *upgrade*
//! is any other higher version and needs explicit client consent. The two
//! classifications are mutually exclusive by construction.
//!
//! Graph resolution uses two distinct version comparisons and they are
//! intentionally not unified: the liberal any-higher-version rule applies
//! when the request came directly from a client or is a hypothetical probe,
//! the strict binding-policy rule everywhere else. Unifying them would
//! collapse the update/upgrade distinction.

use crate::identity::CanonicalIdentity;
use crate::package::Package;
use std::cmp::Ordering;

/// True iff `candidate` is a binary-compatible update for `reference`:
/// same family, candidate declares a binding policy, and the policy range
/// contains the reference version
pub fn is_update_for(candidate: &Package, reference: &Package) -> bool {
    candidate.identity().is_same_family(reference.identity())
        && candidate
            .binding_policy()
            .is_some_and(|policy| policy.contains(reference.version()))
}

/// True iff `candidate` is an incompatible upgrade for `reference`:
/// same family, strictly higher version, and not an update
pub fn is_upgrade_for(candidate: &Package, reference: &Package) -> bool {
    candidate.identity().is_same_family(reference.identity())
        && candidate.version() > reference.version()
        && !is_update_for(candidate, reference)
}

/// Which comparison a supersedence scan applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanRule {
    /// Any strictly higher family version qualifies. Applied when the
    /// request is client-specified or a hypothetical probe.
    Liberal,
    /// Only binding-policy-compatible higher versions qualify.
    Strict,
}

impl ScanRule {
    /// Pick the rule for a request
    pub fn for_request(client_specified: bool, hypothetical: bool) -> Self {
        if client_specified || hypothetical {
            ScanRule::Liberal
        } else {
            ScanRule::Strict
        }
    }
}

/// Whether `candidate` supersedes `reference` under the given rule,
/// honoring the reference's pin flags
pub fn supersedes(candidate: &Package, reference: &Package, rule: ScanRule) -> bool {
    if !candidate.identity().is_same_family(reference.identity())
        || candidate.version() <= reference.version()
        || candidate.is_blocked()
    {
        return false;
    }

    let update = is_update_for(candidate, reference);
    if update && reference.do_not_update() {
        return false;
    }
    if !update && reference.do_not_upgrade() {
        return false;
    }

    match rule {
        ScanRule::Liberal => true,
        ScanRule::Strict => update,
    }
}

/// One rule inside a priority tier
///
/// A pattern is either a literal canonical name or a `prefix*` wildcard.
/// Match quality orders exact above wildcard, and longer wildcard prefixes
/// above shorter ones.
#[derive(Debug, Clone)]
pub struct MatchRule {
    pattern: String,
}

impl MatchRule {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    /// Match quality of an identity against this rule; 0 means no match
    pub fn match_quality(&self, identity: &CanonicalIdentity) -> u32 {
        if self.pattern == identity.name || self.pattern == identity.to_string() {
            return u32::MAX;
        }
        if let Some(prefix) = self.pattern.strip_suffix('*') {
            if identity.name.starts_with(prefix) {
                // Longer prefixes are more specific matches.
                return prefix.len() as u32 + 1;
            }
        }
        0
    }
}

/// An ordered arbitration tier: a named rule-set consulted before any tier
/// below it
#[derive(Debug, Clone)]
pub struct PriorityTier {
    pub name: String,
    pub rules: Vec<MatchRule>,
}

impl PriorityTier {
    pub fn new(name: impl Into<String>, patterns: &[&str]) -> Self {
        Self {
            name: name.into(),
            rules: patterns.iter().map(|p| MatchRule::new(*p)).collect(),
        }
    }

    /// Best match quality across this tier's rules
    pub fn match_quality(&self, identity: &CanonicalIdentity) -> u32 {
        self.rules
            .iter()
            .map(|rule| rule.match_quality(identity))
            .max()
            .unwrap_or(0)
    }
}

/// Priority arbitration between two conflicting packages
///
/// Walks the tiers highest-priority first; the first tier where the two
/// candidates score differently decides. If every tier ties and the two
/// differ only by version, the higher version wins. Otherwise undecided.
pub fn who_wins(a: &Package, b: &Package, tiers: &[PriorityTier]) -> Ordering {
    for tier in tiers {
        let score_a = tier.match_quality(a.identity());
        let score_b = tier.match_quality(b.identity());
        match score_a.cmp(&score_b) {
            Ordering::Equal => continue,
            decided => return decided,
        }
    }

    if a.identity().is_same_family(b.identity()) {
        return a.version().cmp(&b.version());
    }

    Ordering::Equal
}
