use regex::Regex;

/// A console pattern to wait for: either a plain substring or a regular
/// expression with optional capture groups.
#[derive(Debug, Clone)]
pub enum Pattern {
    Literal(String),
    Regex(Regex),
}

/// The location and text of a successful pattern match inside a buffer.
#[derive(Debug, Clone)]
pub struct PatternMatch {
    /// Byte offset of the start of the match.
    pub start: usize,
    /// Byte offset just past the end of the match.
    pub end: usize,
    /// The matched text.
    pub text: String,
    /// First capture group, when the pattern is a regex with groups.
    pub capture: Option<String>,
}

impl Pattern {
    pub fn literal(text: impl Into<String>) -> Self {
        Pattern::Literal(text.into())
    }

    pub fn regex(pattern: &str) -> anyhow::Result<Self> {
        let re = Regex::new(pattern)
            .map_err(|e| anyhow::anyhow!("invalid console pattern {:?}: {}", pattern, e))?;
        Ok(Pattern::Regex(re))
    }

    /// The source text this pattern was built from.
    pub fn source(&self) -> &str {
        match self {
            Pattern::Literal(s) => s,
            Pattern::Regex(re) => re.as_str(),
        }
    }

    /// Finds the earliest occurrence of this pattern in `haystack`.
    pub fn find(&self, haystack: &str) -> Option<PatternMatch> {
        match self {
            Pattern::Literal(needle) => haystack.find(needle).map(|start| PatternMatch {
                start,
                end: start + needle.len(),
                text: needle.clone(),
                capture: None,
            }),
            Pattern::Regex(re) => re.captures(haystack).map(|caps| {
                let whole = caps.get(0).expect("capture group 0 always exists");
                PatternMatch {
                    start: whole.start(),
                    end: whole.end(),
                    text: whole.as_str().to_string(),
                    capture: caps.get(1).map(|g| g.as_str().to_string()),
                }
            }),
        }
    }
}

/// Finds the pattern matching earliest in `buffer`. Ties are broken in favour
/// of the pattern listed first.
pub fn first_match(buffer: &str, patterns: &[Pattern]) -> Option<(usize, PatternMatch)> {
    let mut best: Option<(usize, PatternMatch)> = None;
    for (index, pattern) in patterns.iter().enumerate() {
        if let Some(m) = pattern.find(buffer) {
            let earlier = match &best {
                None => true,
                Some((_, b)) => m.start < b.start,
            };
            if earlier {
                best = Some((index, m));
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_finds_substring() {
        let p = Pattern::literal("login:");
        let m = p.find("FreeBSD/mips (beri)\nlogin: ").expect("should match");
        assert_eq!(m.text, "login:");
        assert_eq!(m.start, 20);
    }

    #[test]
    fn regex_extracts_ip_address() -> anyhow::Result<()> {
        let p = Pattern::regex(r"inet (.+) netmask ")?;
        let m = p
            .find("\tinet 10.0.2.15 netmask 0xffffff00 broadcast 10.0.2.255")
            .expect("should match");
        assert_eq!(m.capture.as_deref(), Some("10.0.2.15"));
        Ok(())
    }

    #[test]
    fn earliest_match_wins() -> anyhow::Result<()> {
        let patterns = vec![Pattern::literal("# "), Pattern::regex("root@.+:.+# ")?];
        let (index, m) = first_match("root@beri:~ # ", &patterns).expect("should match");
        // The full prompt starts earlier than the bare "# " suffix.
        assert_eq!(index, 1);
        assert_eq!(m.start, 0);
        Ok(())
    }

    #[test]
    fn tie_prefers_first_listed() {
        let patterns = vec![
            Pattern::literal("KDB: enter: "),
            Pattern::literal("KDB: enter: panic"),
        ];
        let (index, _) = first_match("KDB: enter: panic\n", &patterns).expect("should match");
        assert_eq!(index, 0);
    }

    #[test]
    fn no_match_returns_none() {
        let patterns = vec![Pattern::literal("never")];
        assert!(first_match("some console output", &patterns).is_none());
    }
}
