/// A single `/`-delimited glob pattern with its precomputed specificity.
#[derive(Debug, Clone)]
struct NameMatcher {
    parts: Vec<String>,
    weight: usize,
}

/// The set of name patterns bound to one repository.
///
/// `*` matches exactly one segment. A pattern's weight is one plus its
/// number of literal segments, so more specific patterns win the dispatch.
#[derive(Debug, Clone, Default)]
pub struct NameMatchers {
    matchers: Vec<NameMatcher>,
}

impl NameMatchers {
    pub fn new(mappings: &[String]) -> Self {
        let matchers = mappings
            .iter()
            .map(|mapping| {
                let parts: Vec<String> = mapping.split('/').map(str::to_string).collect();
                let weight = 1 + parts.iter().filter(|part| *part != "*").count();
                NameMatcher { parts, weight }
            })
            .collect();
        NameMatchers { matchers }
    }

    /// The best weight among patterns matching `name`, or 0 for no match.
    pub fn match_weight(&self, name: &[&str]) -> usize {
        let mut best = 0;
        for matcher in &self.matchers {
            if matcher.parts.len() != name.len() {
                continue;
            }
            let matched = matcher
                .parts
                .iter()
                .zip(name)
                .all(|(part, segment)| part == "*" || part == segment);
            if matched && matcher.weight > best {
                best = matcher.weight;
            }
        }
        best
    }
}
