use std::collections::{HashMap, HashSet};

/// Username to secret mapping, loaded once at startup. Read-only afterwards.
pub struct CredentialStore {
    users: HashMap<String, String>,
}

impl CredentialStore {
    pub fn new(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            users: pairs.into_iter().collect(),
        }
    }

    /// Exact username/secret match.
    pub fn verify(&self, username: &str, secret: &str) -> bool {
        self.users.get(username).map(String::as_str) == Some(secret)
    }

    /// Whether the name is a known account. VRFY leans on this.
    pub fn contains(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }
}

/// Domains whose recipients may be relayed without authentication.
pub struct RelayPolicy {
    domains: HashSet<String>,
}

impl RelayPolicy {
    pub fn new(domains: impl IntoIterator<Item = String>) -> Self {
        Self {
            domains: domains.into_iter().collect(),
        }
    }

    // Exact match, same as the membership test this emulates.
    pub fn allows(&self, domain: &str) -> bool {
        self.domains.contains(domain)
    }
}
