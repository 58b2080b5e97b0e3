use std::collections::BTreeMap;

const MAX_TOOL_NAME_LEN: usize = 64;

/// Forward + inverse mapping between client tool names and the sanitized
/// names sent to providers that reject characters outside `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolNameMap {
    forward: BTreeMap<String, String>,
    inverse: BTreeMap<String, String>,
}

impl ToolNameMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sanitize `name`, remembering the mapping. Distinct originals that
    /// collide after sanitization get a numeric suffix.
    pub fn sanitize(&mut self, name: &str) -> String {
        if let Some(existing) = self.forward.get(name) {
            return existing.clone();
        }

        let mut candidate = sanitize_tool_name(name);
        if self.inverse.contains_key(&candidate) {
            let mut n = 2usize;
            loop {
                let suffixed = join_with_suffix(&candidate, n);
                if !self.inverse.contains_key(&suffixed) {
                    candidate = suffixed;
                    break;
                }
                n += 1;
            }
        }

        self.forward.insert(name.to_string(), candidate.clone());
        self.inverse.insert(candidate.clone(), name.to_string());
        candidate
    }

    /// Map a wire name back to the client's original name; unknown names
    /// pass through unchanged.
    pub fn original(&self, wire_name: &str) -> String {
        self.inverse
            .get(wire_name)
            .cloned()
            .unwrap_or_else(|| wire_name.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn inverse_map(&self) -> &BTreeMap<String, String> {
        &self.inverse
    }
}

/// Replace characters outside `[A-Za-z0-9_-]` with `_` and cap the length.
pub fn sanitize_tool_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(MAX_TOOL_NAME_LEN);
    if out.is_empty() {
        out.push_str("tool");
    }
    out
}

fn join_with_suffix(base: &str, n: usize) -> String {
    let suffix = format!("_{n}");
    let keep = MAX_TOOL_NAME_LEN.saturating_sub(suffix.len()).min(base.len());
    format!("{}{}", &base[..keep], suffix)
}
