/// Key-construction helpers for the Redis backend.
#[derive(Debug, Clone)]
pub struct KeyContext<'a> {
    pub prefix: &'a str,
}

impl<'a> KeyContext<'a> {
    pub fn new(prefix: &'a str) -> Self {
        Self { prefix }
    }

    pub fn record(&self, kind: &str, id: &str) -> String {
        format!("{}:{}:{}", self.prefix, kind, id)
    }

    /// Set of index keys the record currently belongs to.
    pub fn record_indexes(&self, kind: &str, id: &str) -> String {
        format!("{}:{}:{}:indexes", self.prefix, kind, id)
    }

    pub fn index(&self, kind: &str, field: &str, token: &str) -> String {
        format!("{}:{}:idx:{}:{}", self.prefix, kind, field, token)
    }

    pub fn link(&self, kind: &str, relation: &str, owner_id: &str) -> String {
        format!("{}:rel:{}:{}:{}", self.prefix, kind, relation, owner_id)
    }

    pub fn link_reverse(&self, kind: &str, relation: &str, member_id: &str) -> String {
        format!("{}:rel:{}:{}_reverse:{}", self.prefix, kind, relation, member_id)
    }
}
