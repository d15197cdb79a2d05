/// Errors produced while reaching an upstream or computing its credentials.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid upstream url: {0}")]
    Url(#[from] url::ParseError),

    #[error("upstream transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("parse WWW-Authenticate challenge: {0}")]
    ChallengeParse(String),

    #[error("missing realm in challenge")]
    MissingRealm,

    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint { status: u16, body: String },

    #[error("token response missing token field")]
    TokenMissing,

    #[error("invalid upstream auth configuration: {0}")]
    Config(String),

    #[error("unsupported upstream auth provider {0:?}")]
    UnsupportedProvider(String),

    #[error("fetch ecr authorization token: {0}")]
    Ecr(String),
}
