/// Source of the bearer credential attached to every request.
///
/// Looked up per request so a refreshed credential is picked up without
/// rebuilding clients.
pub trait TokenProvider: Send + Sync {
    fn current(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticToken {
    fn current(&self) -> String {
        self.token.clone()
    }
}

/// Reads the credential from an environment variable on every call.
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl TokenProvider for EnvToken {
    fn current(&self) -> String {
        std::env::var(&self.var).unwrap_or_default()
    }
}
