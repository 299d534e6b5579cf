use std::collections::BTreeSet;

/// Normalize user input into a bare lowercase host name.
///
/// Strips an `http://` / `https://` scheme, everything from the first `/`,
/// `?`, `#` or `:`, surrounding whitespace and a single leading `www.`.
/// Returns an empty string when nothing usable is left or when the name
/// still contains whitespace or control characters; callers skip those entries.
pub fn clean_domain(raw: &str) -> String {
    let mut s = raw.trim().to_ascii_lowercase();

    for scheme in ["https://", "http://"] {
        if let Some(rest) = s.strip_prefix(scheme) {
            s = rest.to_string();
            break;
        }
    }

    if let Some(pos) = s.find(['/', '?', '#', ':']) {
        s.truncate(pos);
    }

    let s = s.trim_end_matches('.').trim();
    // Anything left here would end up verbatim in a hosts line or rule name
    if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return String::new();
    }
    s.strip_prefix("www.").unwrap_or(s).to_string()
}

/// Clean every entry and collect the non-empty results, deduplicated and ordered.
pub fn clean_domains<'a, I>(raw: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a String>,
{
    raw.into_iter()
        .map(|d| clean_domain(d))
        .filter(|d| !d.is_empty())
        .collect()
}
