use std::collections::{BTreeSet, HashSet};

use crate::config::AliasTable;

/// Outcome of resolving a client-supplied model name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub provider: String,
    pub model: String,
    pub was_resolved: bool,
    /// Intermediate alias names followed, in order.
    pub path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Match {
    provider: String,
    alias: String,
    target: String,
    length: usize,
    is_exact: bool,
}

/// Maps a raw model string to a concrete `(provider, model)` pair through a
/// fixed priority chain: literal bypass, chained aliases, substring matching
/// plus ranking, then a provider-or-default fallback.
pub struct AliasResolver {
    aliases: AliasTable,
    provider_names: BTreeSet<String>,
    default_provider: String,
    max_chain_length: usize,
}

impl AliasResolver {
    pub fn new(
        aliases: AliasTable,
        provider_names: impl IntoIterator<Item = String>,
        default_provider: impl Into<String>,
        max_chain_length: usize,
    ) -> Self {
        Self {
            aliases,
            provider_names: provider_names.into_iter().collect(),
            default_provider: default_provider.into(),
            max_chain_length,
        }
    }

    pub fn resolve(&self, raw: &str, scope: Option<&str>) -> Resolution {
        // Literal bypass: a leading '!' skips alias resolution entirely.
        if let Some(rest) = raw.strip_prefix('!') {
            if rest.is_empty() {
                return self.fallback(raw, scope);
            }
            return match rest.split_once(':') {
                Some((provider, model)) => Resolution {
                    provider: provider.to_lowercase(),
                    model: model.to_string(),
                    was_resolved: false,
                    path: Vec::new(),
                },
                None => Resolution {
                    provider: self.scope_or_default(scope),
                    model: rest.to_string(),
                    was_resolved: false,
                    path: Vec::new(),
                },
            };
        }

        if raw.contains(':')
            && let Some(resolution) = self.resolve_chain(raw)
        {
            return resolution;
        }

        if let Some(resolution) = self.resolve_substring(raw, scope) {
            return resolution;
        }

        self.fallback(raw, scope)
    }

    fn scope_or_default(&self, scope: Option<&str>) -> String {
        scope
            .map(str::to_lowercase)
            .unwrap_or_else(|| self.default_provider.clone())
    }

    fn fallback(&self, raw: &str, scope: Option<&str>) -> Resolution {
        match raw.split_once(':') {
            Some((provider, model)) => Resolution {
                provider: provider.to_lowercase(),
                model: model.to_string(),
                was_resolved: false,
                path: Vec::new(),
            },
            None => Resolution {
                provider: self.scope_or_default(scope),
                model: raw.to_string(),
                was_resolved: false,
                path: Vec::new(),
            },
        }
    }

    /// Follow `provider:alias` chains to a fixed point. A cycle returns the
    /// last stable pair; running into the chain-length cap stops where the
    /// walk got to.
    fn resolve_chain(&self, raw: &str) -> Option<Resolution> {
        let mut resolved = raw.to_string();
        let mut seen: HashSet<String> = HashSet::new();
        let mut path: Vec<String> = Vec::new();

        for _ in 0..self.max_chain_length {
            let Some((provider, model)) = resolved.split_once(':') else {
                break;
            };
            let provider = provider.to_lowercase();
            let Some(provider_aliases) = self.aliases.get(&provider) else {
                break;
            };

            let visited_key = format!("{}:{}", provider, model.to_lowercase());
            if seen.contains(&visited_key) {
                return Some(Resolution {
                    provider,
                    model: model.to_string(),
                    was_resolved: true,
                    path,
                });
            }

            let Some(target) = provider_aliases.get(&model.to_lowercase()) else {
                break;
            };
            seen.insert(visited_key);
            path.push(model.to_string());

            resolved = if target.contains(':') {
                target.clone()
            } else {
                format!("{provider}:{target}")
            };
        }

        if resolved == raw {
            return None;
        }

        let (provider, model) = match resolved.split_once(':') {
            Some((provider, model)) => (provider.to_lowercase(), model.to_string()),
            None => (self.default_provider.clone(), resolved),
        };
        Some(Resolution {
            provider,
            model,
            was_resolved: true,
            path,
        })
    }

    fn resolve_substring(&self, raw: &str, scope: Option<&str>) -> Option<Resolution> {
        let model_lower = raw.to_lowercase();
        let (explicit_provider, for_match) = match model_lower.split_once(':') {
            Some((provider, model)) => (Some(provider.to_string()), model.to_string()),
            None => (None, model_lower.clone()),
        };

        let variations: BTreeSet<String> = BTreeSet::from([
            for_match.clone(),
            for_match.replace('_', "-"),
            for_match.replace('-', "_"),
        ]);

        let search_provider = explicit_provider.or_else(|| scope.map(str::to_lowercase));

        let mut matches: Vec<Match> = Vec::new();
        for (provider, provider_aliases) in &self.aliases {
            if let Some(search) = &search_provider
                && provider != search
            {
                continue;
            }
            for (alias, target) in provider_aliases {
                let alias_lower = alias.to_lowercase();
                if !variations.iter().any(|v| v.contains(&alias_lower)) {
                    continue;
                }
                // Exact means the alias equals any variation, independent of
                // which variation produced the substring hit.
                matches.push(Match {
                    provider: provider.clone(),
                    alias: alias.clone(),
                    target: target.clone(),
                    length: alias_lower.len(),
                    is_exact: variations.contains(&alias_lower),
                });
            }
        }

        if matches.is_empty() {
            return None;
        }

        // Rank: exact first, then longest, then default-provider preference,
        // then provider and alias name ascending.
        matches.sort_by(|a, b| {
            (!a.is_exact)
                .cmp(&!b.is_exact)
                .then(b.length.cmp(&a.length))
                .then((a.provider != self.default_provider).cmp(&(b.provider != self.default_provider)))
                .then(a.provider.cmp(&b.provider))
                .then(a.alias.cmp(&b.alias))
        });
        let best = &matches[0];

        let resolved = match best.target.split_once(':') {
            Some((target_provider, _)) if self.provider_names.contains(target_provider) => {
                best.target.clone()
            }
            _ => format!("{}:{}", best.provider, best.target),
        };

        // Follow any further chain from the selected target.
        if let Some(chained) = self.resolve_chain(&resolved) {
            let mut path = vec![best.alias.clone()];
            path.extend(chained.path);
            return Some(Resolution { path, ..chained });
        }

        let (provider, model) = match resolved.split_once(':') {
            Some((provider, model)) => (provider.to_lowercase(), model.to_string()),
            None => (best.provider.clone(), resolved),
        };
        Some(Resolution {
            provider,
            model,
            was_resolved: true,
            path: vec![best.alias.clone()],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolver(aliases: &[(&str, &[(&str, &str)])]) -> AliasResolver {
        let table: AliasTable = aliases
            .iter()
            .map(|(provider, pairs)| {
                (
                    provider.to_string(),
                    pairs
                        .iter()
                        .map(|(alias, target)| (alias.to_string(), target.to_string()))
                        .collect::<HashMap<_, _>>(),
                )
            })
            .collect();
        let mut names: Vec<String> = table.keys().cloned().collect();
        for extra in ["openai", "anthropic"] {
            names.push(extra.to_string());
        }
        AliasResolver::new(table, names, "openai", 10)
    }

    #[test]
    fn literal_bypass_with_provider() {
        let r = resolver(&[("openai", &[("gpt-4", "something-else")])]);
        let out = r.resolve("!poe:gpt-4", None);
        assert_eq!(out.provider, "poe");
        assert_eq!(out.model, "gpt-4");
        assert!(!out.was_resolved);
    }

    #[test]
    fn literal_bypass_uses_scope_then_default() {
        let r = resolver(&[]);
        assert_eq!(r.resolve("!gpt-4", Some("poe")).provider, "poe");
        assert_eq!(r.resolve("!gpt-4", None).provider, "openai");
    }

    #[test]
    fn chained_alias_follows_to_fixed_point() {
        let r = resolver(&[(
            "openai",
            &[("fast", "sonnet"), ("sonnet", "gpt-4o-mini")],
        )]);
        let out = r.resolve("openai:fast", None);
        assert_eq!(out.provider, "openai");
        assert_eq!(out.model, "gpt-4o-mini");
        assert!(out.was_resolved);
        assert_eq!(out.path, vec!["fast", "sonnet"]);
    }

    #[test]
    fn chained_alias_crosses_providers() {
        let r = resolver(&[
            ("openai", &[("fast", "poe:cheap")]),
            ("poe", &[("cheap", "gpt-4o-mini")]),
        ]);
        let out = r.resolve("openai:fast", None);
        assert_eq!(out.provider, "poe");
        assert_eq!(out.model, "gpt-4o-mini");
    }

    #[test]
    fn cycle_returns_last_stable_value() {
        let r = resolver(&[("openai", &[("a", "b"), ("b", "a")])]);
        let out = r.resolve("openai:a", None);
        assert_eq!(out.provider, "openai");
        // a -> b -> a is revisited; the last stable pair is returned.
        assert_eq!(out.model, "a");
        assert!(out.was_resolved);
    }

    #[test]
    fn exact_match_beats_longer_substring() {
        let r = resolver(&[(
            "openai",
            &[("fast", "gpt-4o-mini"), ("faster-still", "gpt-3.5")],
        )]);
        let out = r.resolve("fast", None);
        assert_eq!(out.model, "gpt-4o-mini");
        assert_eq!(out.path, vec!["fast"]);
    }

    #[test]
    fn substring_matches_inside_longer_names() {
        let r = resolver(&[("openai", &[("sonnet", "claude-sonnet-4")])]);
        let out = r.resolve("claude-sonnet-latest", None);
        assert_eq!(out.model, "claude-sonnet-4");
        assert!(out.was_resolved);
    }

    #[test]
    fn underscore_and_hyphen_variants_match() {
        let r = resolver(&[("openai", &[("gpt-4o-mini", "gpt-4o-mini-2024")])]);
        let out = r.resolve("gpt_4o_mini", None);
        assert_eq!(out.model, "gpt-4o-mini-2024");
    }

    #[test]
    fn default_provider_wins_ties() {
        let r = resolver(&[
            ("poe", &[("fast", "poe-model")]),
            ("openai", &[("fast", "openai-model")]),
        ]);
        let out = r.resolve("fast", None);
        assert_eq!(out.provider, "openai");
        assert_eq!(out.model, "openai-model");
    }

    #[test]
    fn provider_prefix_scopes_substring_search() {
        let r = resolver(&[
            ("poe", &[("fast", "poe-model")]),
            ("openai", &[("fast", "openai-model")]),
        ]);
        let out = r.resolve("poe:fast", None);
        assert_eq!(out.provider, "poe");
        assert_eq!(out.model, "poe-model");
    }

    #[test]
    fn ranked_match_follows_chain_afterwards() {
        let r = resolver(&[(
            "openai",
            &[("fast", "sonnet"), ("sonnet", "gpt-4o-mini")],
        )]);
        let out = r.resolve("fast", None);
        assert_eq!(out.model, "gpt-4o-mini");
        assert_eq!(out.path, vec!["fast", "sonnet"]);
    }

    #[test]
    fn unknown_model_falls_back_to_scope_or_default() {
        let r = resolver(&[]);
        let out = r.resolve("mystery-model", None);
        assert_eq!(out.provider, "openai");
        assert_eq!(out.model, "mystery-model");
        assert!(!out.was_resolved);

        let out = r.resolve("poe:mystery-model", None);
        assert_eq!(out.provider, "poe");
        assert_eq!(out.model, "mystery-model");
    }

    #[test]
    fn resolution_terminates_on_long_chains() {
        // 20 links but the cap is 10; must return without error.
        let pairs: Vec<(String, String)> = (0..20)
            .map(|i| (format!("a{i}"), format!("a{}", i + 1)))
            .collect();
        let table: AliasTable = HashMap::from([(
            "openai".to_string(),
            pairs.into_iter().collect::<HashMap<_, _>>(),
        )]);
        let r = AliasResolver::new(table, ["openai".to_string()], "openai", 10);
        let out = r.resolve("openai:a0", None);
        assert!(out.was_resolved);
        assert_eq!(out.model, "a10");
    }
}
