//! Prompt Version Resolver — staged rollout of prompt versions.
//!
//! A rollout policy splits traffic for one prompt across versions by integer
//! percentage. Each call hashes `(prompt, context key)` into a bucket in
//! `0..100`, so a given requester always lands on the same version while the
//! policy is unchanged. Pinned contexts bypass the buckets entirely.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::prompts::definition::{PromptDefinition, PromptVersion};
use crate::prompts::error::{ConfigError, PromptError};
use crate::prompts::store::PromptStore;

pub const BUCKETS: u8 = 100;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RolloutFile {
    prompt: String,
    versions: Vec<ShareEntry>,
    #[serde(default)]
    pinned: Vec<PinEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShareEntry {
    version: String,
    share: u32,
    #[serde(default)]
    default: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PinEntry {
    context: String,
    version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficShare {
    pub version: PromptVersion,
    pub share: u8,
}

/// Validated rollout policy for a single prompt.
#[derive(Debug, Clone, Serialize)]
pub struct RolloutPolicy {
    pub prompt: String,
    /// In declaration order; bucket ranges are assigned in this order.
    pub shares: Vec<TrafficShare>,
    pub default_version: Option<PromptVersion>,
    pub pinned: HashMap<String, PromptVersion>,
}

impl RolloutPolicy {
    /// Parses and validates a policy file. Version existence is checked later
    /// against the prompt store (see `RolloutTable::load`).
    pub fn parse(path: &Path, yaml: &str) -> Result<Self, ConfigError> {
        let file: RolloutFile = serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let prompt = file.prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(ConfigError::invalid(path, "prompt", "must not be empty"));
        }
        if file.versions.is_empty() {
            return Err(ConfigError::invalid(
                path,
                "versions",
                "at least one version is required",
            ));
        }

        let mut shares = Vec::with_capacity(file.versions.len());
        let mut seen = HashSet::new();
        let mut default_version = None;
        let mut total: u32 = 0;

        for (i, entry) in file.versions.iter().enumerate() {
            let version: PromptVersion = entry
                .version
                .parse()
                .map_err(|msg| ConfigError::invalid(path, format!("versions[{i}].version"), msg))?;
            if !seen.insert(version.clone()) {
                return Err(ConfigError::invalid(
                    path,
                    format!("versions[{i}].version"),
                    format!("{version} is listed more than once"),
                ));
            }
            if entry.share > u32::from(BUCKETS) {
                return Err(ConfigError::invalid(
                    path,
                    format!("versions[{i}].share"),
                    format!("{} exceeds 100", entry.share),
                ));
            }
            if entry.default {
                if default_version.is_some() {
                    return Err(ConfigError::invalid(
                        path,
                        format!("versions[{i}].default"),
                        "only one version may be marked default",
                    ));
                }
                default_version = Some(version.clone());
            }
            total += entry.share;
            shares.push(TrafficShare {
                version,
                share: entry.share as u8,
            });
        }

        if total != u32::from(BUCKETS) {
            return Err(ConfigError::invalid(
                path,
                "versions",
                format!("shares sum to {total}, expected exactly 100"),
            ));
        }

        let mut pinned = HashMap::new();
        for (i, pin) in file.pinned.iter().enumerate() {
            let context = pin.context.trim();
            if context.is_empty() {
                return Err(ConfigError::invalid(
                    path,
                    format!("pinned[{i}].context"),
                    "must not be empty",
                ));
            }
            let version: PromptVersion = pin
                .version
                .parse()
                .map_err(|msg| ConfigError::invalid(path, format!("pinned[{i}].version"), msg))?;
            if pinned.insert(context.to_string(), version).is_some() {
                return Err(ConfigError::invalid(
                    path,
                    format!("pinned[{i}].context"),
                    format!("`{context}` is pinned more than once"),
                ));
            }
        }

        Ok(RolloutPolicy {
            prompt,
            shares,
            default_version,
            pinned,
        })
    }

    /// Maps a bucket in `0..100` to a version by walking the cumulative shares.
    pub fn version_for_bucket(&self, bucket: u8) -> Option<&PromptVersion> {
        let mut upper: u32 = 0;
        for share in &self.shares {
            upper += u32::from(share.share);
            if u32::from(bucket) < upper {
                return Some(&share.version);
            }
        }
        None
    }

    /// Every version this policy can hand out.
    fn referenced_versions(&self) -> impl Iterator<Item = (String, &PromptVersion)> {
        let shares = self
            .shares
            .iter()
            .enumerate()
            .map(|(i, s)| (format!("versions[{i}].version"), &s.version));
        let pins = self
            .pinned
            .iter()
            .map(|(ctx, v)| (format!("pinned[{ctx}].version"), v));
        shares.chain(pins)
    }
}

/// Deterministic bucket for `(prompt, context_key)`: the first eight bytes of
/// SHA-256 read big-endian, modulo 100.
pub fn bucket_for(prompt: &str, context_key: &str) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(b":");
    hasher.update(context_key.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % u64::from(BUCKETS)) as u8
}

/// All loaded rollout policies, keyed by prompt name.
#[derive(Debug, Default, Clone)]
pub struct RolloutTable {
    policies: HashMap<String, RolloutPolicy>,
}

impl RolloutTable {
    /// Loads every policy under `dir` and checks each referenced version exists
    /// in `store`. A missing directory means "no rollouts": every prompt then
    /// resolves to its latest version.
    pub fn load(dir: &Path, store: &PromptStore) -> Result<Self, ConfigError> {
        if !dir.exists() {
            info!(
                "No rollout directory at {}; all prompts resolve to latest",
                dir.display()
            );
            return Ok(RolloutTable::default());
        }

        let mut table = RolloutTable::default();
        let mut sources: HashMap<String, PathBuf> = HashMap::new();

        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|source| ConfigError::Walk {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let is_yaml = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            );
            if !entry.file_type().is_file() || !is_yaml {
                continue;
            }

            let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let policy = RolloutPolicy::parse(path, &yaml)?;
            validate_against_store(path, &policy, store)?;

            if let Some(first) = sources.get(&policy.prompt) {
                return Err(ConfigError::invalid(
                    path,
                    "prompt",
                    format!(
                        "`{}` already has a rollout policy in {}",
                        policy.prompt,
                        first.display()
                    ),
                ));
            }
            sources.insert(policy.prompt.clone(), path.to_path_buf());
            table.policies.insert(policy.prompt.clone(), policy);
        }

        info!(
            "Loaded {} rollout polic(ies) from {}",
            table.policies.len(),
            dir.display()
        );
        Ok(table)
    }

    /// Builds a table from already-parsed policies, still checking them against `store`.
    pub fn from_policies(
        policies: impl IntoIterator<Item = RolloutPolicy>,
        store: &PromptStore,
    ) -> Result<Self, ConfigError> {
        let mut table = RolloutTable::default();
        for policy in policies {
            let origin = PathBuf::from(format!("<rollout:{}>", policy.prompt));
            validate_against_store(&origin, &policy, store)?;
            if table.policies.contains_key(&policy.prompt) {
                return Err(ConfigError::invalid(
                    origin,
                    "prompt",
                    "duplicate rollout policy",
                ));
            }
            table.policies.insert(policy.prompt.clone(), policy);
        }
        Ok(table)
    }

    pub fn policy(&self, prompt: &str) -> Option<&RolloutPolicy> {
        self.policies.get(prompt)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }
}

fn validate_against_store(
    path: &Path,
    policy: &RolloutPolicy,
    store: &PromptStore,
) -> Result<(), ConfigError> {
    if store.versions(&policy.prompt).is_empty() {
        return Err(ConfigError::invalid(
            path,
            "prompt",
            format!("no prompt named `{}` is loaded", policy.prompt),
        ));
    }
    for (field, version) in policy.referenced_versions() {
        if !store.contains(&policy.prompt, version) {
            return Err(ConfigError::invalid(
                path,
                field,
                format!("{}@{} is not loaded", policy.prompt, version),
            ));
        }
    }
    Ok(())
}

/// Why a particular version was served. Logged with every stage call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "bucket")]
pub enum ResolutionReason {
    Pinned,
    Bucket(u8),
    /// No policy exists for the prompt.
    Latest,
    /// The policy's pick is not in the store; served the policy default instead.
    DefaultFallback,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub definition: Arc<PromptDefinition>,
    pub reason: ResolutionReason,
}

/// Resolves versions against one consistent (store, rollouts) pair.
pub struct VersionResolver<'a> {
    store: &'a PromptStore,
    rollouts: &'a RolloutTable,
}

impl<'a> VersionResolver<'a> {
    pub fn new(store: &'a PromptStore, rollouts: &'a RolloutTable) -> Self {
        Self { store, rollouts }
    }

    pub fn resolve(&self, prompt: &str, context_key: &str) -> Result<Resolution, PromptError> {
        let Some(policy) = self.rollouts.policy(prompt) else {
            return Ok(Resolution {
                definition: self.store.latest(prompt)?,
                reason: ResolutionReason::Latest,
            });
        };

        let (picked, reason) = match policy.pinned.get(context_key) {
            Some(version) => (Some(version), ResolutionReason::Pinned),
            None => {
                let bucket = bucket_for(prompt, context_key);
                (
                    policy.version_for_bucket(bucket),
                    ResolutionReason::Bucket(bucket),
                )
            }
        };

        if let Some(definition) = picked.and_then(|v| self.store.get(prompt, v).ok()) {
            return Ok(Resolution { definition, reason });
        }

        warn!(
            "Rollout for `{prompt}` picked a version that is not loaded ({:?}); falling back",
            picked.map(PromptVersion::as_str)
        );
        if let Some(definition) = policy
            .default_version
            .as_ref()
            .and_then(|v| self.store.get(prompt, v).ok())
        {
            return Ok(Resolution {
                definition,
                reason: ResolutionReason::DefaultFallback,
            });
        }

        debug!("No usable default for `{prompt}`; serving latest");
        Ok(Resolution {
            definition: self.store.latest(prompt)?,
            reason: ResolutionReason::Latest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::definition::PromptDefinition;

    fn definition(version: &str) -> PromptDefinition {
        PromptDefinition::parse(
            Path::new("inline"),
            &format!(
                "name: structure_analysis\nversion: {version}\ntemplate: \"{version}: {{{{resume_text}}}}\"\nvariables: [resume_text]\n"
            ),
        )
        .unwrap()
    }

    fn store() -> PromptStore {
        PromptStore::from_definitions([definition("v1"), definition("v2"), definition("v3")])
            .unwrap()
    }

    fn policy(yaml: &str) -> Result<RolloutPolicy, ConfigError> {
        RolloutPolicy::parse(Path::new("rollouts/structure.yaml"), yaml)
    }

    fn field_of(err: ConfigError) -> String {
        match err {
            ConfigError::Invalid { field, .. } => field,
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    const SPLIT_70_30: &str = r#"
prompt: structure_analysis
versions:
  - version: v1
    share: 70
    default: true
  - version: v2
    share: 30
pinned:
  - context: consultant-7
    version: v3
"#;

    #[test]
    fn test_shares_must_sum_to_100() {
        let err = policy(
            "prompt: structure_analysis\nversions:\n  - version: v1\n    share: 60\n  - version: v2\n    share: 30\n",
        )
        .unwrap_err();
        assert_eq!(field_of(err), "versions");
    }

    #[test]
    fn test_negative_share_is_a_parse_error() {
        let err = policy(
            "prompt: structure_analysis\nversions:\n  - version: v1\n    share: -10\n  - version: v2\n    share: 110\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_two_defaults_rejected() {
        let err = policy(
            "prompt: structure_analysis\nversions:\n  - version: v1\n    share: 50\n    default: true\n  - version: v2\n    share: 50\n    default: true\n",
        )
        .unwrap_err();
        assert_eq!(field_of(err), "versions[1].default");
    }

    #[test]
    fn test_duplicate_pin_rejected() {
        let err = policy(
            "prompt: structure_analysis\nversions:\n  - version: v1\n    share: 100\npinned:\n  - context: a\n    version: v1\n  - context: a\n    version: v1\n",
        )
        .unwrap_err();
        assert_eq!(field_of(err), "pinned[1].context");
    }

    #[test]
    fn test_policy_referencing_unloaded_version_rejected() {
        let p = policy(
            "prompt: structure_analysis\nversions:\n  - version: v1\n    share: 50\n  - version: v7\n    share: 50\n",
        )
        .unwrap();
        let err = RolloutTable::from_policies([p], &store()).unwrap_err();
        assert_eq!(field_of(err), "versions[1].version");
    }

    #[test]
    fn test_policy_for_unknown_prompt_rejected() {
        let p = policy("prompt: summary\nversions:\n  - version: v1\n    share: 100\n").unwrap();
        let err = RolloutTable::from_policies([p], &store()).unwrap_err();
        assert_eq!(field_of(err), "prompt");
    }

    #[test]
    fn test_bucket_is_deterministic_and_in_range() {
        for key in ["a", "consultant-1", "", "ünïcode"] {
            let b = bucket_for("structure_analysis", key);
            assert!(b < BUCKETS);
            assert_eq!(b, bucket_for("structure_analysis", key));
        }
    }

    #[test]
    fn test_version_for_bucket_walks_cumulative_shares() {
        let p = policy(SPLIT_70_30).unwrap();
        assert_eq!(p.version_for_bucket(0).unwrap().as_str(), "v1");
        assert_eq!(p.version_for_bucket(69).unwrap().as_str(), "v1");
        assert_eq!(p.version_for_bucket(70).unwrap().as_str(), "v2");
        assert_eq!(p.version_for_bucket(99).unwrap().as_str(), "v2");
    }

    #[test]
    fn test_resolve_is_deterministic_per_context() {
        let store = store();
        let table = RolloutTable::from_policies([policy(SPLIT_70_30).unwrap()], &store).unwrap();
        let resolver = VersionResolver::new(&store, &table);

        let first = resolver.resolve("structure_analysis", "consultant-42").unwrap();
        for _ in 0..20 {
            let again = resolver.resolve("structure_analysis", "consultant-42").unwrap();
            assert_eq!(again.definition.version, first.definition.version);
            assert_eq!(again.reason, first.reason);
        }
    }

    #[test]
    fn test_resolve_distribution_tracks_shares() {
        let store = store();
        let table = RolloutTable::from_policies([policy(SPLIT_70_30).unwrap()], &store).unwrap();
        let resolver = VersionResolver::new(&store, &table);

        let total = 10_000;
        let v2 = (0..total)
            .filter(|i| {
                resolver
                    .resolve("structure_analysis", &format!("requester-{i}"))
                    .unwrap()
                    .definition
                    .version
                    .as_str()
                    == "v2"
            })
            .count();
        let ratio = v2 as f64 / total as f64;
        assert!((ratio - 0.30).abs() < 0.03, "v2 share was {ratio}");
    }

    #[test]
    fn test_pinned_override_beats_bucket() {
        let store = store();
        let table = RolloutTable::from_policies([policy(SPLIT_70_30).unwrap()], &store).unwrap();
        let resolution = VersionResolver::new(&store, &table)
            .resolve("structure_analysis", "consultant-7")
            .unwrap();
        assert_eq!(resolution.definition.version.as_str(), "v3");
        assert_eq!(resolution.reason, ResolutionReason::Pinned);
    }

    #[test]
    fn test_no_policy_resolves_latest() {
        let store = store();
        let table = RolloutTable::default();
        let resolution = VersionResolver::new(&store, &table)
            .resolve("structure_analysis", "anyone")
            .unwrap();
        assert_eq!(resolution.definition.version.as_str(), "v3");
        assert_eq!(resolution.reason, ResolutionReason::Latest);
    }

    #[test]
    fn test_missing_version_falls_back_to_default() {
        // Policy validated against the full store, then served from a store
        // that lost v2.
        let full = store();
        let p = policy(
            "prompt: structure_analysis\nversions:\n  - version: v1\n    share: 0\n    default: true\n  - version: v2\n    share: 100\n",
        )
        .unwrap();
        let table = RolloutTable::from_policies([p], &full).unwrap();
        let partial =
            PromptStore::from_definitions([definition("v1"), definition("v3")]).unwrap();

        let resolution = VersionResolver::new(&partial, &table)
            .resolve("structure_analysis", "anyone")
            .unwrap();
        assert_eq!(resolution.definition.version.as_str(), "v1");
        assert_eq!(resolution.reason, ResolutionReason::DefaultFallback);
    }

    #[test]
    fn test_unknown_prompt_is_not_found() {
        let store = store();
        let table = RolloutTable::default();
        let err = VersionResolver::new(&store, &table)
            .resolve("summary", "anyone")
            .unwrap_err();
        assert!(matches!(err, PromptError::NotFound { .. }));
    }
}
