//! Heuristic port matching.
//!
//! Backend keys are often just indices that shift when devices come and go.
//! [`find_closest_port`] re-finds a previously chosen port among a fresh
//! enumeration by scoring the metadata that survives a replug.

use super::PortHandle;
use crate::api::Api;

const W_HARDWARE_ID: i32 = 1000;
const W_SERIAL: i32 = 800;
const W_NAME_EXACT: i32 = 400;
const W_METADATA: i32 = 100;
const W_KEY: i32 = 50;

const P_HARDWARE_MISMATCH: i32 = -2000;
const P_SERIAL_MISMATCH: i32 = -1000;
const P_NAME_MISMATCH: i32 = -100;
const P_PRODUCT_MISMATCH: i32 = -10;

const FUZZY_THRESHOLD: f64 = 0.5;
const FUZZY_MAX_LEN: usize = 1024;

/// How well a candidate port matches a stored one.
///
/// Ordered so that a larger value is a better match; an API mismatch
/// disqualifies the candidate whatever its score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MatchScore {
    /// Sum of the matching identity and metadata fields, minus penalties.
    pub score: i32,
    /// Candidate belongs to a different backend.
    pub api_mismatch: bool,
}

impl MatchScore {
    /// Usable as a reconnect target.
    pub fn is_match(&self) -> bool {
        !self.api_mismatch && self.score > 0
    }
}

/// Case-insensitive Levenshtein similarity in `0.0..=1.0`.
fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().flat_map(char::to_lowercase).collect();
    let b: Vec<char> = b.chars().flat_map(char::to_lowercase).collect();
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };

    if long.is_empty() {
        return 1.0;
    }
    if short.is_empty() || long.len() > FUZZY_MAX_LEN {
        return 0.0;
    }

    let mut col: Vec<usize> = (0..=short.len()).collect();
    for (j, lc) in long.iter().enumerate() {
        let mut prev_diag = col[0];
        col[0] = j + 1;
        for i in 1..=short.len() {
            let prev = col[i];
            let cost = usize::from(short[i - 1] != *lc);
            col[i] = (col[i] + 1).min(col[i - 1] + 1).min(prev_diag + cost);
            prev_diag = prev;
        }
    }

    1.0 - col[short.len()] as f64 / long.len() as f64
}

fn score_text(score: &mut i32, target: Option<&str>, candidate: Option<&str>, reward: i32, penalty: i32) {
    let target = match target {
        Some(t) if !t.is_empty() => t,
        _ => return,
    };
    let candidate = candidate.unwrap_or("");
    let sim = similarity(candidate, target);
    if sim >= FUZZY_THRESHOLD {
        *score += (sim * reward as f64) as i32;
    } else if !candidate.is_empty() {
        *score += penalty;
    }
}

fn score_exact(score: &mut i32, target: Option<&str>, candidate: Option<&str>, reward: i32, penalty: i32) {
    match (target, candidate) {
        (Some(t), Some(c)) if t == c => *score += reward,
        (Some(_), Some(_)) => *score += penalty,
        _ => {}
    }
}

/// Scores how likely `candidate` is the same endpoint as `target`.
pub fn match_score(target: &PortHandle, candidate: &PortHandle) -> MatchScore {
    if (target.api() != Api::Default && target.api() != candidate.api())
        || target.direction() != candidate.direction()
    {
        return MatchScore {
            score: i32::MIN,
            api_mismatch: true,
        };
    }

    let (t, c) = (target.info(), candidate.info());
    let mut score = 0;

    score_exact(
        &mut score,
        t.hardware_id.as_deref(),
        c.hardware_id.as_deref(),
        W_HARDWARE_ID,
        P_HARDWARE_MISMATCH,
    );
    score_text(
        &mut score,
        t.manufacturer.as_deref(),
        c.manufacturer.as_deref(),
        W_METADATA,
        P_PRODUCT_MISMATCH,
    );
    score_text(
        &mut score,
        t.product.as_deref(),
        c.product.as_deref(),
        W_METADATA,
        P_PRODUCT_MISMATCH,
    );
    score_text(
        &mut score,
        t.serial.as_deref(),
        c.serial.as_deref(),
        W_SERIAL,
        P_SERIAL_MISMATCH,
    );
    score_text(
        &mut score,
        Some(t.display_name.as_str()),
        Some(c.display_name.as_str()),
        W_NAME_EXACT,
        P_NAME_MISMATCH,
    );
    score_text(
        &mut score,
        t.port_name.as_deref(),
        c.port_name.as_deref(),
        W_NAME_EXACT,
        P_NAME_MISMATCH,
    );
    score_text(
        &mut score,
        t.device_name.as_deref(),
        c.device_name.as_deref(),
        W_NAME_EXACT,
        P_NAME_MISMATCH,
    );

    // Tie-breaker for two identical controllers.
    if target.key() == candidate.key() {
        score += W_KEY;
    }

    MatchScore {
        score,
        api_mismatch: false,
    }
}

/// Best-scoring candidate for `target`, or `None` when nothing plausibly matches.
pub fn find_closest_port(target: &PortHandle, candidates: &[PortHandle]) -> Option<PortHandle> {
    candidates
        .iter()
        .map(|c| (match_score(target, c), c))
        .filter(|(s, _)| s.is_match())
        .fold(None::<(MatchScore, &PortHandle)>, |best, (s, c)| match best {
            Some((b, _)) if b.score >= s.score => best,
            _ => Some((s, c)),
        })
        .map(|(_, c)| c.clone())
}
