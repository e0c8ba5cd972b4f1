use std::collections::HashMap;

/// UserTable holds username/password credentials as dictated server-side.
/// It is created lazily on the first add and only ever grows or overwrites
#[derive(Debug, Default)]
pub struct UserTable {
    entries: HashMap<String, String>,
}

/// UserTable implementation block
impl UserTable {
    /// new is a constructor for the UserTable type
    pub fn new() -> Self {
        Self::default()
    }

    /// add inserts or overwrites a credential entry
    pub fn add(&mut self, username: impl Into<String>, password: impl Into<String>) {
        self.entries.insert(username.into(), password.into());
    }

    /// verify checks a username/password pair against the table
    pub fn verify(&self, username: &str, password: &str) -> bool {
        self.entries.get(username).map(String::as_str) == Some(password)
    }

    /// len returns the number of stored entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// is_empty reports whether the table has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
