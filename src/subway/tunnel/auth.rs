use std::collections::HashSet;

/// Decides whether a tunnel client may register.
pub trait AuthProvider: Send + Sync {
    fn authenticate(&self, token: &str) -> bool;
}

/// Fixed token list from configuration. An empty list admits everyone.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashSet<String>,
}

impl StaticTokens {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens = tokens
            .into_iter()
            .map(|t| t.as_ref().trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        Self { tokens }
    }

    pub fn is_open(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl AuthProvider for StaticTokens {
    fn authenticate(&self, token: &str) -> bool {
        self.tokens.is_empty() || self.tokens.contains(token.trim())
    }
}
