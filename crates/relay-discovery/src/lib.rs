//! # relay-discovery — fuzzy agent matching
//!
//! The scoring engine behind `find_agents` and filtered broadcast:
//! tokenization, bounded Levenshtein distance, and field-weighted fuzzy
//! matching against agent profiles. Everything here is a pure function of
//! its inputs so ranking stays deterministic.

/// Search filter shared by discovery and broadcast target selection.
/// `project`/`role`/`specialization` are hard filters; `query` is free
/// text matched across all profile fields.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub query: String,
    pub project: String,
    pub role: String,
    pub specialization: String,
    pub limit: usize,
}

impl SearchFilter {
    /// Lowercase and trim every field; a missing limit becomes 20.
    pub fn normalized(mut self) -> Self {
        self.query = self.query.trim().to_lowercase();
        self.project = self.project.trim().to_lowercase();
        self.role = self.role.trim().to_lowercase();
        self.specialization = self.specialization.trim().to_lowercase();
        if self.limit == 0 {
            self.limit = 20;
        }
        self
    }
}

/// Borrowed view of the profile fields discovery scores against.
#[derive(Debug, Clone, Copy)]
pub struct ProfileFields<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub project: &'a str,
    pub role: &'a str,
    pub specialization: &'a str,
    pub github: &'a str,
    pub branch: &'a str,
}

/// Result of matching one profile against a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOutcome {
    pub score: i64,
    pub matched_tokens: usize,
}

/// Number of tokens a free-text query contributes.
pub fn query_token_count(query: &str) -> usize {
    tokenize(query).len()
}

/// Score a profile against a normalized filter. Returns `None` when any
/// hard filter misses, or when a query is present but no token matches.
pub fn match_profile(fields: &ProfileFields<'_>, filter: &SearchFilter) -> Option<MatchOutcome> {
    let project = fields.project.to_lowercase();
    let role = fields.role.to_lowercase();
    let specialization = fields.specialization.to_lowercase();
    let name = fields.name.to_lowercase();
    let description = fields.description.to_lowercase();
    let github = fields.github.to_lowercase();
    let branch = fields.branch.to_lowercase();

    let mut score: i64 = 0;
    if !filter.project.is_empty() {
        score += 300 + fuzzy_field_match(&filter.project, &project)?;
    }
    if !filter.role.is_empty() {
        score += 250 + fuzzy_field_match(&filter.role, &role)?;
    }
    if !filter.specialization.is_empty() {
        score += 250 + fuzzy_field_match(&filter.specialization, &specialization)?;
    }

    let haystack = [
        name.as_str(),
        description.as_str(),
        project.as_str(),
        role.as_str(),
        specialization.as_str(),
        github.as_str(),
        branch.as_str(),
    ];

    let mut matched_tokens = 0;
    if !filter.query.is_empty() {
        let query_tokens = tokenize(&filter.query);
        for token in &query_tokens {
            let best = haystack
                .iter()
                .filter_map(|field| fuzzy_field_match(token, field))
                .max();
            if let Some(best) = best {
                matched_tokens += 1;
                score += best;
            }
        }
        // Query mode needs at least one meaningful hit.
        if matched_tokens == 0 {
            return None;
        }
        // Partial coverage is allowed but demoted.
        if matched_tokens < query_tokens.len() {
            score -= ((query_tokens.len() - matched_tokens) as i64) * 30;
        }
    } else if haystack.iter().any(|field| !field.trim().is_empty()) {
        // Without a query every populated candidate still ranks stably.
        score += 1;
    }

    Some(MatchOutcome {
        score,
        matched_tokens,
    })
}

/// Best fuzzy score of `needle` against `hay`, or `None` for no match.
/// Equality beats prefix beats substring beats per-token edit distance.
pub fn fuzzy_field_match(needle: &str, hay: &str) -> Option<i64> {
    let needle = needle.trim().to_lowercase();
    let hay = hay.trim().to_lowercase();
    if needle.is_empty() || hay.is_empty() {
        return None;
    }
    if hay == needle {
        return Some(200);
    }
    if hay.starts_with(&needle) {
        return Some(180);
    }
    if hay.contains(&needle) {
        return Some(160);
    }

    let mut best: i64 = 0;
    for word in tokenize(&hay) {
        if word == needle {
            best = best.max(200);
            continue;
        }
        if word.starts_with(&needle) || needle.starts_with(&word) {
            best = best.max(150);
            continue;
        }
        let distance = levenshtein(&needle, &word);
        let longer = needle.chars().count().max(word.chars().count());
        if distance <= allowed_distance(longer) {
            best = best.max(140 - (distance as i64) * 20);
        }
    }
    (best > 0).then_some(best)
}

/// Lowercase, split on anything that is neither a letter nor a digit,
/// drop empty runs.
pub fn tokenize(input: &str) -> Vec<String> {
    input
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Edit-distance allowance by the longer operand's length.
fn allowed_distance(len: usize) -> usize {
    match len {
        0..=4 => 1,
        5..=8 => 2,
        _ => 3,
    }
}

/// Row-level Levenshtein distance over characters.
pub fn levenshtein(a: &str, b: &str) -> usize {
    if a == b {
        return 0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            let deletion = prev[j] + 1;
            let insertion = curr[j - 1] + 1;
            let substitution = prev[j - 1] + cost;
            curr[j] = deletion.min(insertion).min(substitution);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
