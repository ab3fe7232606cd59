use anyhow::{Context, Result};
use ipm_ipt::Engine;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Rule files in `<data>/rules`, sorted by name
fn rule_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Apply the static rule files under `<data>/rules`.
///
/// Every line must address a known chain. With `rewrite`, root chains are
/// redirected to the configured default chain, so a file saying `-A INPUT`
/// lands in the managed input chain. Returns the number of rules applied.
pub async fn load_rules(engine: &Engine, data_path: &Path, rewrite: bool) -> Result<usize> {
    let dir = data_path.join("rules");
    if !dir.is_dir() {
        debug!("No static rules directory at {}", dir.display());
        return Ok(0);
    }

    let mut total = 0;
    for path in rule_files(&dir)? {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let lines = engine
            .sanitize_rules(&text, rewrite)
            .await
            .with_context(|| format!("Invalid rule in {}", path.display()))?;
        engine
            .create_rules(&lines)
            .await
            .with_context(|| format!("Failed to apply rules from {}", path.display()))?;

        info!("Loaded {} static rule(s) from {}", lines.len(), path.display());
        total += lines.len();
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipm_core::{Chain, TableName};
    use ipm_ipt::MemoryFirewall;
    use ipm_metrics::Metrics;
    use ipm_registry::Registry;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine(dir: &Path) -> (Arc<MemoryFirewall>, Engine) {
        let fw = Arc::new(MemoryFirewall::new());
        let registry = Arc::new(Registry::open(dir).unwrap());
        let engine = Engine::new(fw.clone(), registry, Arc::new(Metrics::new().unwrap()));
        (fw, engine)
    }

    #[tokio::test]
    async fn missing_directory_is_fine() {
        let dir = TempDir::new().unwrap();
        let (_fw, engine) = engine(dir.path());
        assert_eq!(load_rules(&engine, dir.path(), true).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn files_load_in_order_with_rewrite() {
        let dir = TempDir::new().unwrap();
        let rules = dir.path().join("rules");
        std::fs::create_dir(&rules).unwrap();
        std::fs::write(
            rules.join("10-ssh"),
            "# ssh\n-A INPUT -p tcp --dport 22 -j ACCEPT\n",
        )
        .unwrap();
        std::fs::write(
            rules.join("20-nat"),
            "-t nat -A POSTROUTING -o eth0 -j MASQUERADE\n\n",
        )
        .unwrap();
        std::fs::create_dir(rules.join("subdir")).unwrap();

        let (fw, engine) = engine(dir.path());
        engine
            .create_chain(TableName::Filter, &Chain::new("iptmgr-input", "input").as_default())
            .await
            .unwrap();

        assert_eq!(load_rules(&engine, dir.path(), true).await.unwrap(), 2);
        assert_eq!(fw.rules("filter", "iptmgr-input"), vec!["-p tcp --dport 22 -j ACCEPT"]);
        assert_eq!(fw.rules("nat", "POSTROUTING"), vec!["-o eth0 -j MASQUERADE"]);

        // applying again changes nothing
        load_rules(&engine, dir.path(), true).await.unwrap();
        assert_eq!(fw.rule_count(), 3);
    }

    #[tokio::test]
    async fn unknown_chain_aborts_loading() {
        let dir = TempDir::new().unwrap();
        let rules = dir.path().join("rules");
        std::fs::create_dir(&rules).unwrap();
        std::fs::write(rules.join("bad"), "-A missing-input -j DROP\n").unwrap();

        let (fw, engine) = engine(dir.path());
        assert!(load_rules(&engine, dir.path(), true).await.is_err());
        assert_eq!(fw.rule_count(), 0);
    }
}
