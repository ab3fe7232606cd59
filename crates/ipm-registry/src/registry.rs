use crate::epoch::Epoch;
use ipm_core::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

const SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LEN: usize = 8;

/// One stored rule set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub epoch: i64,
    pub rule: String,
}

/// Versioned, persisted store of rule sets.
///
/// Layout under the data directory:
/// - `registry/<id>` holds the rule text of one set
/// - `epoch` holds the logical clock
pub struct Registry {
    inner: Mutex<Inner>,
}

struct Inner {
    dir: PathBuf,
    epoch: Epoch,
    entries: HashMap<String, Entry>,
}

/// Epoch component of a rule-set id (`<epoch>+<suffix>`)
pub fn parse_name(id: &str) -> Option<i64> {
    let (epoch, suffix) = id.split_once('+')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| SUFFIX_ALPHABET.contains(&b)) {
        return None;
    }
    if epoch.is_empty() || !epoch.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    epoch.parse().ok().filter(|e| *e > 0)
}

/// Reject ids that could escape the registry directory or are not ours
pub fn validate_id(id: &str) -> Result<i64> {
    parse_name(id).ok_or_else(|| Error::invalid(format!("invalid rule set id ({})", id)))
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

impl Registry {
    /// Load the epoch and every stored rule set from `path`.
    ///
    /// Fails when rule sets exist on disk but the epoch file is missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let base = path.as_ref();
        let dir = base.join("registry");

        let mut epoch = Epoch::new(base.join("epoch"));
        let has_epoch = epoch.load()?;

        std::fs::create_dir_all(&dir).map_err(|e| Error::file(&dir, e))?;

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| Error::file(&dir, e))? {
            let entry = entry.map_err(|e| Error::file(&dir, e))?;
            if entry.file_type().map_err(|e| Error::file(entry.path(), e))?.is_file() {
                files.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        files.sort();

        if !has_epoch && !files.is_empty() {
            return Err(Error::Storage(format!(
                "found {} stored rule sets in {}, but the epoch file is missing",
                files.len(),
                dir.display()
            )));
        }

        let mut entries = HashMap::new();
        for name in files {
            let entry_epoch = parse_name(&name).ok_or_else(|| {
                Error::Storage(format!("invalid registry filename: {}", name))
            })?;

            let path = dir.join(&name);
            let rule = std::fs::read_to_string(&path).map_err(|e| Error::file(&path, e))?;

            info!(id = %name, "registry: loaded rule set");
            entries.insert(
                name,
                Entry {
                    epoch: entry_epoch,
                    rule,
                },
            );
        }

        Ok(Self {
            inner: Mutex::new(Inner {
                dir,
                epoch,
                entries,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// New id `<epoch>+<random8>` with its epoch
    pub fn generate_name(&self) -> (String, i64) {
        let epoch = self.lock().epoch.tick();
        (format!("{}+{}", epoch, random_suffix()), epoch)
    }

    /// Persist `rule` under `id` and advance the clock to `epoch`
    pub fn append(&self, id: &str, rule: &str, epoch: i64) -> Result<()> {
        let id_epoch = validate_id(id)?;
        let epoch = if epoch == 0 { id_epoch } else { epoch };

        let mut inner = self.lock();
        let path = inner.dir.join(id);
        std::fs::write(&path, rule).map_err(|e| Error::file(&path, e))?;

        inner.entries.insert(
            id.to_string(),
            Entry {
                epoch,
                rule: rule.to_string(),
            },
        );
        inner.epoch.update(epoch)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Entry> {
        self.lock().entries.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    /// All registered ids, sorted
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove `id`; the clock advances to `epoch` (or the entry's own epoch when 0).
    /// Returns the removed entry, `None` when the id was not registered.
    pub fn delete(&self, id: &str, epoch: i64) -> Result<Option<Entry>> {
        let mut inner = self.lock();
        let Some(entry) = inner.entries.get(id).cloned() else {
            return Ok(None);
        };

        let path = inner.dir.join(id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::file(&path, e)),
        }

        inner.entries.remove(id);
        inner
            .epoch
            .update(if epoch == 0 { entry.epoch } else { epoch })?;
        Ok(Some(entry))
    }

    /// Current logical clock
    pub fn epoch(&self) -> i64 {
        self.lock().epoch.current()
    }

    /// Fresh stamp for a local mutation (see [`Epoch::tick`])
    pub fn tick(&self) -> i64 {
        self.lock().epoch.tick()
    }
}
