use serde_json::{Map, Value};

/// Key fragments that mark a config value as sensitive. Matching is a
/// case-insensitive substring test on the key.
pub const DEFAULT_SENSITIVE_PATTERNS: &[&str] = &[
    "password",
    "passwd",
    "pwd",
    "token",
    "key",
    "secret",
    "auth",
    "credential",
    "cred",
    "api_key",
    "apikey",
    "access_key",
    "private_key",
    "privatekey",
    "session",
    "sessionid",
    "bearer",
    "authorization",
    "jwt",
    "oauth",
    "refresh_token",
    "client_secret",
    "client_id",
    "encryption_key",
    "decryption_key",
    "salt",
    "hash",
    "checksum",
];

/// Masks sensitive values in a JSON document before it leaves the process.
#[derive(Debug, Clone)]
pub struct Redactor {
    patterns: Vec<String>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl Redactor {
    /// Built-in patterns plus `extra` (lowercased).
    pub fn new(extra: &[String]) -> Self {
        let mut patterns: Vec<String> = DEFAULT_SENSITIVE_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .collect();
        patterns.extend(extra.iter().map(|p| p.to_lowercase()));
        Self { patterns }
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.patterns.iter().any(|p| key.contains(p.as_str()))
    }

    /// Returns a redacted copy. List elements inherit the key of their parent.
    pub fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.redact_under(k, v));
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }

    fn redact_under(&self, key: &str, value: &Value) -> Value {
        match value {
            Value::Object(_) => self.redact(value),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.redact_under(key, v)).collect())
            }
            leaf if self.is_sensitive(key) => mask(leaf),
            leaf => leaf.clone(),
        }
    }
}

fn mask(value: &Value) -> Value {
    match value {
        Value::String(s) if !s.is_empty() => {
            let chars: Vec<char> = s.chars().collect();
            if chars.len() <= 4 {
                Value::String("*".repeat(chars.len()))
            } else {
                let head: String = chars[..2].iter().collect();
                let tail: String = chars[chars.len() - 2..].iter().collect();
                Value::String(format!("{head}{}{tail}", "*".repeat(chars.len() - 4)))
            }
        }
        Value::String(_) => Value::String("<string>".to_string()),
        Value::Number(_) => Value::String("<number>".to_string()),
        Value::Bool(_) => Value::String("<bool>".to_string()),
        Value::Null => Value::String("<null>".to_string()),
        // Objects and arrays are walked before reaching here.
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks_strings_by_length() {
        let r = Redactor::default();
        let out = r.redact(&json!({
            "source_token": "abcdefgh",
            "db_password": "abc",
            "source_url": "http://upstream/api",
        }));
        assert_eq!(out["source_token"], "ab****gh");
        assert_eq!(out["db_password"], "***");
        assert_eq!(out["source_url"], "http://upstream/api");
    }

    #[test]
    fn non_strings_show_type() {
        let r = Redactor::default();
        let out = r.redact(&json!({ "api_key": 12345, "auth_enabled": true, "secret": null }));
        assert_eq!(out["api_key"], "<number>");
        assert_eq!(out["auth_enabled"], "<bool>");
        assert_eq!(out["secret"], "<null>");
    }

    #[test]
    fn walks_nested_maps_and_lists() {
        let r = Redactor::default();
        let out = r.redact(&json!({
            "database": { "user": "vm", "Password": "hunter22" },
            "tokens": ["aaaaaa", "bb"],
            "cutoff_hour": 6,
        }));
        assert_eq!(out["database"]["user"], "vm");
        assert_eq!(out["database"]["Password"], "hu****22");
        assert_eq!(out["tokens"], json!(["aa**aa", "**"]));
        assert_eq!(out["cutoff_hour"], 6);
    }

    #[test]
    fn extra_patterns_apply() {
        let r = Redactor::new(&["Tenant".to_string()]);
        let out = r.redact(&json!({ "tenant_id": "acme-corp" }));
        assert_eq!(out["tenant_id"], "ac*****rp");
    }
}
