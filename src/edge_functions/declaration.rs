//! Edge function declarations and their merge order.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Where a declaration or function comes from. Earlier tiers route first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Written by the site developer.
    #[default]
    User,
    /// Generated by a framework at build time.
    Framework,
    /// Provided by an integration.
    Internal,
}

/// Header predicate as written in configuration: `true` (must exist),
/// `false` (must be missing) or a regular expression the value must match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderMatch {
    Present(bool),
    Pattern(String),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
    })
}

/// A route declaration binding a path or pattern to an edge function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Declaration {
    /// Function name.
    pub function: String,
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// URL path, with `*` wildcards and `:param` segments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Regular expression, used when no path is given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub excluded_path: Vec<String>,
    #[serde(deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub excluded_pattern: Vec<String>,
    /// Allowed methods; empty allows all.
    #[serde(deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub method: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, HeaderMatch>,
    /// `manual` routes run after the cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<String>,
    #[serde(skip)]
    pub tier: Tier,
}

impl Declaration {
    /// Declaration routing `path` to `function`.
    pub fn new(function: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method.push(method.into());
        self
    }

    pub fn excluded_path(mut self, path: impl Into<String>) -> Self {
        self.excluded_path.push(path.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, matcher: HeaderMatch) -> Self {
        self.header.insert(name.into().to_ascii_lowercase(), matcher);
        self
    }

    fn with_config(mut self, config: &FunctionConfig) -> Self {
        if config.name.is_some() {
            self.name = config.name.clone();
        }
        if config.cache.is_some() {
            self.cache = config.cache.clone();
        }
        if !config.method.is_empty() {
            self.method = config.method.clone();
        }
        if !config.header.is_empty() {
            self.header = config.header.clone();
        }
        self
    }
}

/// In-source configuration exported by an edge function, reported by the bundler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FunctionConfig {
    #[serde(deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    #[serde(deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub pattern: Vec<String>,
    #[serde(deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub excluded_path: Vec<String>,
    #[serde(deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub excluded_pattern: Vec<String>,
    #[serde(deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub method: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, HeaderMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
    /// Common misspelling of `path`, kept only to warn about it.
    #[serde(skip_serializing)]
    pub paths: Option<serde_json::Value>,
}

impl FunctionConfig {
    fn declares_routes(&self) -> bool {
        !self.path.is_empty() || !self.pattern.is_empty()
    }

    fn declarations(&self, function: &str, tier: Tier) -> Vec<Declaration> {
        let base = Declaration {
            function: function.to_string(),
            tier,
            ..Default::default()
        }
        .with_config(self);

        let paths = self.path.iter().map(|path| Declaration {
            path: Some(path.clone()),
            excluded_path: self.excluded_path.clone(),
            ..base.clone()
        });
        let patterns = self.pattern.iter().map(|pattern| Declaration {
            pattern: Some(pattern.clone()),
            excluded_pattern: self.excluded_pattern.clone(),
            ..base.clone()
        });
        paths.chain(patterns).collect()
    }
}

/// Merge declarations from every source into one ordered list.
///
/// Deploy-time declarations always apply. A configuration-file declaration
/// gives way to in-source routes for the same function, and otherwise picks
/// up in-source settings such as methods and cache mode. Functions that only
/// declare routes in source get declarations generated from them. The result
/// is ordered by tier, keeping source order within a tier.
pub fn merge_declarations(
    config_declarations: &[Declaration],
    user_configs: &HashMap<String, FunctionConfig>,
    internal_configs: &HashMap<String, FunctionConfig>,
    deploy_declarations: &[Declaration],
) -> Vec<Declaration> {
    let mut visited = HashSet::new();
    let mut declarations = Vec::new();

    for declaration in config_declarations {
        let function = &declaration.function;
        let config = user_configs.get(function).or_else(|| internal_configs.get(function));
        match config {
            Some(config) if config.declares_routes() => {}
            Some(config) => {
                visited.insert(function.clone());
                declarations.push(declaration.clone().with_config(config));
            }
            None => {
                visited.insert(function.clone());
                declarations.push(declaration.clone());
            }
        }
    }

    for declaration in deploy_declarations {
        visited.insert(declaration.function.clone());
        let mut declaration = declaration.clone();
        declaration.tier = Tier::Framework;
        declarations.push(declaration);
    }

    let mut from_source = |configs: &HashMap<String, FunctionConfig>, tier: Tier| {
        let mut names: Vec<&String> = configs.keys().collect();
        names.sort();
        for name in names {
            if visited.contains(name) {
                continue;
            }
            let config = &configs[name];
            if config.declares_routes() {
                visited.insert(name.clone());
                declarations.extend(config.declarations(name, tier));
            }
        }
    };
    from_source(user_configs, Tier::User);
    from_source(internal_configs, Tier::Internal);

    // Stable: keeps source order inside each tier.
    declarations.sort_by_key(|d| d.tier);
    declarations
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config(paths: &[&str]) -> FunctionConfig {
        FunctionConfig {
            path: paths.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_deserialize_one_or_many() {
        let config: FunctionConfig =
            serde_json::from_str(r#"{"path": "/a", "excludedPath": ["/a/b", "/a/c"]}"#).unwrap();
        assert_eq!(config.path, vec!["/a"]);
        assert_eq!(config.excluded_path, vec!["/a/b", "/a/c"]);

        let declaration: Declaration = serde_json::from_str(
            r#"{"function": "auth", "path": "/admin/*", "header": {"x-debug": true, "x-env": "^prod"}}"#,
        )
        .unwrap();
        assert_eq!(declaration.header["x-debug"], HeaderMatch::Present(true));
        assert_eq!(declaration.header["x-env"], HeaderMatch::Pattern("^prod".to_string()));
    }

    #[test]
    fn test_in_source_routes_replace_config_declarations() {
        let from_config = vec![Declaration::new("geo", "/old"), Declaration::new("auth", "/admin")];
        let mut user = HashMap::new();
        user.insert("geo".to_string(), config(&["/new", "/newer"]));

        let merged = merge_declarations(&from_config, &user, &HashMap::new(), &[]);
        let routes: Vec<_> = merged
            .iter()
            .map(|d| (d.function.as_str(), d.path.as_deref().unwrap_or_default()))
            .collect();
        assert_eq!(routes, vec![("auth", "/admin"), ("geo", "/new"), ("geo", "/newer")]);
    }

    #[test]
    fn test_in_source_settings_merge_into_config_declarations() {
        let from_config = vec![Declaration::new("cached", "/c")];
        let mut user = HashMap::new();
        user.insert(
            "cached".to_string(),
            FunctionConfig {
                cache: Some("manual".to_string()),
                method: vec!["GET".to_string()],
                ..Default::default()
            },
        );

        let merged = merge_declarations(&from_config, &user, &HashMap::new(), &[]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].cache.as_deref(), Some("manual"));
        assert_eq!(merged[0].method, vec!["GET"]);
    }

    #[test]
    fn test_tiers_order_user_before_framework_before_internal() {
        let mut internal = HashMap::new();
        internal.insert("integration".to_string(), config(&["/*"]));
        let deploy = vec![Declaration::new("framework", "/*")];
        let mut user = HashMap::new();
        user.insert("mine".to_string(), config(&["/*"]));

        let merged = merge_declarations(&[], &user, &internal, &deploy);
        let names: Vec<_> = merged.iter().map(|d| d.function.as_str()).collect();
        assert_eq!(names, vec!["mine", "framework", "integration"]);
    }

    #[test]
    fn test_deploy_declarations_win_over_in_source() {
        let deploy = vec![Declaration::new("ssr", "/deploy")];
        let mut internal = HashMap::new();
        internal.insert("ssr".to_string(), config(&["/source"]));

        let merged = merge_declarations(&[], &HashMap::new(), &internal, &deploy);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].path.as_deref(), Some("/deploy"));
        assert_eq!(merged[0].tier, Tier::Framework);
    }
}
