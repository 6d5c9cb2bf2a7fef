//! Dependency resolver: picks the best live provider for a declared
//! dependency given required/preferred/excluded tags and an optional
//! version constraint.

use chrono::{DateTime, Utc};
use semver::{Version, VersionReq};

use crate::models::{DependencyDeclaration, ProviderCandidate, ResolvedDependency, TagSet};

/// Freshness bonus: at most +10, decaying to 0 over 20 seconds since the
/// candidate's last heartbeat (SPEC_FULL §4.3 / §9).
fn freshness_bonus(last_heartbeat_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let elapsed = (now - last_heartbeat_at).num_seconds().max(0);
    let clamped = (20 - elapsed).clamp(0, 20);
    clamped / 2
}

fn version_satisfies(candidate_version: &str, constraint: &Option<String>) -> bool {
    let Some(constraint) = constraint else {
        return true;
    };
    match (Version::parse(candidate_version), VersionReq::parse(constraint)) {
        (Ok(version), Ok(req)) => req.matches(&version),
        // Non-semver versions/constraints: fall back to exact string match
        // rather than rejecting the candidate outright.
        _ => candidate_version == constraint,
    }
}

fn score_candidate(candidate: &ProviderCandidate, tags: &TagSet, now: DateTime<Utc>) -> Option<i64> {
    let candidate_tags: std::collections::BTreeSet<String> = candidate.tags.iter().cloned().collect();

    if tags.excluded.iter().any(|t| candidate_tags.contains(t)) {
        return None;
    }
    if !tags.required.iter().all(|t| candidate_tags.contains(t)) {
        return None;
    }
    if !version_satisfies(&candidate.version, &None) {
        return None;
    }

    let preferred_matches = tags.preferred.iter().filter(|t| candidate_tags.contains(*t)).count() as i64;
    Some(10 * preferred_matches + freshness_bonus(candidate.last_heartbeat_at, now))
}

/// Resolve a single dependency declaration against a set of live
/// candidates. Candidates must already be filtered to: same namespace
/// (or the declaration leaves namespace unset), advertising the
/// requested capability label, and not marked unhealthy.
pub fn resolve_dependency(
    declaration: &DependencyDeclaration,
    candidates: &[ProviderCandidate],
    now: DateTime<Utc>,
) -> Option<ResolvedDependency> {
    let tags = TagSet::parse(&declaration.tags);

    let mut scored: Vec<(i64, &ProviderCandidate)> = candidates
        .iter()
        .filter(|c| version_satisfies(&c.version, &declaration.version))
        .filter_map(|c| score_candidate(c, &tags, now).map(|score| (score, c)))
        .collect();

    // Tiebreak: score desc, then more recent heartbeat, then lexicographic agent_id.
    scored.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then_with(|| b.1.last_heartbeat_at.cmp(&a.1.last_heartbeat_at))
            .then_with(|| a.1.agent_id.cmp(&b.1.agent_id))
    });

    scored.first().map(|(score, candidate)| ResolvedDependency {
        agent_id: candidate.agent_id.clone(),
        function_name: candidate.function_name.clone(),
        endpoint: candidate.endpoint.clone(),
        capability: candidate.capability.clone(),
        score: *score,
    })
}
