use std::collections::BTreeMap;

use http_auth::parser::ChallengeParser;

use crate::error::UpstreamError;

/// One parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: String,
    pub params: BTreeMap<String, String>,
}

impl Challenge {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// Parse a `WWW-Authenticate` header into its challenges, in declared order.
///
/// Registries in the wild emit sloppy bearer challenges the strict parser
/// rejects; those fall back to a lenient `Bearer k="v", ...` reading before
/// the parse error is surfaced.
pub fn parse_www_authenticate(header: &str) -> Result<Vec<Challenge>, UpstreamError> {
    let header = header.trim();
    let mut challenges = Vec::new();
    let mut parse_error = None;
    for item in ChallengeParser::new(header) {
        match item {
            Ok(challenge) => {
                let params = challenge
                    .params
                    .iter()
                    .map(|(key, value)| (key.to_ascii_lowercase(), value.to_unescaped()))
                    .collect();
                challenges.push(Challenge {
                    scheme: challenge.scheme.to_string(),
                    params,
                });
            }
            Err(error) => parse_error = Some(error.to_string()),
        }
    }
    if challenges.is_empty() {
        if let Some(challenge) = parse_bearer_fallback(header) {
            return Ok(vec![challenge]);
        }
        if let Some(error) = parse_error {
            return Err(UpstreamError::ChallengeParse(error));
        }
    }
    Ok(challenges)
}

/// Lenient reading of a bearer challenge: comma-separated `k=v` pairs with
/// optional quotes, case-insensitive scheme.
fn parse_bearer_fallback(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let rest = header
        .get(..7)
        .filter(|prefix| prefix.eq_ignore_ascii_case("bearer "))
        .map(|_| header[6..].trim())?;
    let mut params = BTreeMap::new();
    for part in rest.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim().trim_matches('"');
        params.insert(key.to_ascii_lowercase(), value.to_string());
    }
    Some(Challenge {
        scheme: "Bearer".to_string(),
        params,
    })
}
