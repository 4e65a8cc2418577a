//! Builds store backends from configuration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dbvault_store::{LocalStore, ObjectBackend, S3Options, Store, StoreError};

use crate::config::Config;

/// Constructs the stores named in `used`. Passing every configured name
/// (as `test` does) validates the whole storage section.
pub fn build_stores(
    cfg: &Config,
    used: &HashSet<String>,
) -> Result<HashMap<String, Arc<dyn Store>>, StoreError> {
    let mut out: HashMap<String, Arc<dyn Store>> = HashMap::with_capacity(used.len());

    for st in &cfg.storage {
        if !used.contains(&st.name) {
            continue;
        }
        match st.kind.as_str() {
            "local" => {
                let Some(local) = st.local.as_ref().filter(|l| !l.path.is_empty()) else {
                    return Err(StoreError::InvalidConfig {
                        name: st.name.clone(),
                        reason: "local.path is required".to_string(),
                    });
                };
                out.insert(
                    st.name.clone(),
                    Arc::new(LocalStore::new(st.name.clone(), local.path.clone())),
                );
            }
            "s3" => {
                let Some(s3) = st.s3.as_ref() else {
                    return Err(StoreError::InvalidConfig {
                        name: st.name.clone(),
                        reason: "s3 settings are missing".to_string(),
                    });
                };
                let backend = ObjectBackend::s3(
                    st.name.clone(),
                    &S3Options {
                        bucket: s3.bucket.clone(),
                        region: s3.region.clone(),
                        prefix: s3.prefix.clone(),
                        access_key: s3.access_key.clone(),
                        secret_key: s3.secret_key.clone(),
                    },
                )?;
                out.insert(st.name.clone(), Arc::new(backend));
            }
            other => {
                return Err(StoreError::InvalidConfig {
                    name: st.name.clone(),
                    reason: format!("unknown type {other:?}"),
                });
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn builds_only_used_stores() {
        let cfg = config(
            r#"
version: 1
storage:
  - name: a
    type: local
    local: { path: /tmp/a }
  - name: b
    type: local
    local: { path: /tmp/b }
"#,
        );
        let used: HashSet<String> = ["a".to_string()].into_iter().collect();
        let stores = build_stores(&cfg, &used).unwrap();
        assert!(stores.contains_key("a"));
        assert!(!stores.contains_key("b"));
    }

    #[test]
    fn local_requires_path() {
        let cfg = config(
            r#"
version: 1
storage:
  - name: a
    type: local
"#,
        );
        let used: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert!(build_stores(&cfg, &used).is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let cfg = config(
            r#"
version: 1
storage:
  - name: a
    type: tape
"#,
        );
        let used: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert!(build_stores(&cfg, &used).is_err());
    }
}
