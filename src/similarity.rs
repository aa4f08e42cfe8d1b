use once_cell::sync::Lazy;
use regex::Regex;
use strsim::jaro_winkler;

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());
static LEADING_THE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^the\s+").unwrap());

/// Normalizes a title or artist name for comparison: lowercase, leading
/// "the" stripped, punctuation collapsed to single spaces.
pub fn normalize(input: &str) -> String {
    let lower = input.trim().to_lowercase();
    let lower = LEADING_THE.replace(&lower, "");
    NON_ALNUM.replace_all(&lower, " ").trim().to_string()
}

/// Jaro-Winkler similarity over normalized forms, 0.0–1.0.
pub fn score(a: &str, b: &str) -> f64 {
    let (na, nb) = (normalize(a), normalize(b));
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    jaro_winkler(&na, &nb)
}

/// Lowercased, hyphen-separated genre token ("Hip Hop" -> "hip-hop").
pub fn genre_token(raw: &str) -> String {
    NON_ALNUM
        .replace_all(&raw.trim().to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}
