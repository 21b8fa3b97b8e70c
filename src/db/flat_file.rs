//! JSON-file backed key/value databases (device and parameter databases).

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{MasterError, MasterResult};
use crate::protocol::Value;
use crate::sync_struct::{lock, Mod, Notifier, SharedNotifier};

/// A mapping loaded from a JSON file and written back on every change.
///
/// The contents live in a [`Notifier`] so that a publisher can serve them.
pub struct FlatFileDb {
    path: Option<PathBuf>,
    data: SharedNotifier,
}

impl FlatFileDb {
    /// Loads `path`. A missing file starts an empty database that will be
    /// created on the first write.
    pub fn open<P: AsRef<Path>>(path: P) -> MasterResult<Self> {
        let path = path.as_ref().to_path_buf();
        let data = match fs::read_to_string(&path) {
            Ok(text) => {
                let value: Value = serde_json::from_str(&text).map_err(|e| {
                    MasterError::Configuration(format!("{}: {}", path.display(), e))
                })?;
                if value.as_dict().is_none() {
                    return Err(MasterError::Configuration(format!(
                        "{}: top level must be a mapping, found {}",
                        path.display(),
                        value.kind()
                    )));
                }
                value
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("{} not found, starting empty", path.display());
                Value::dict()
            }
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {}", path.display());
        Ok(Self {
            path: Some(path),
            data: Notifier::shared(data),
        })
    }

    /// A database that is never written to disk.
    pub fn in_memory(initial: Value) -> Self {
        Self {
            path: None,
            data: Notifier::shared(initial),
        }
    }

    /// The notifier holding the contents, for publishing.
    pub fn notifier(&self) -> SharedNotifier {
        self.data.clone()
    }

    /// Value of `name`.
    pub fn request(&self, name: &str) -> MasterResult<Value> {
        lock(&self.data)
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MasterError::Lookup(format!("'{name}' not found")))
    }

    /// Inserts or replaces `name`. The file is rewritten first; memory and
    /// subscribers only see the change once it is on disk.
    pub fn set(&self, name: &str, value: Value) -> MasterResult<()> {
        let mut data = lock(&self.data);
        let change = Mod::Insert {
            i: Value::from(name),
            x: value,
        };
        let mut candidate = data.read().clone();
        change.apply(&mut candidate)?;
        self.save(&candidate)?;
        data.replay(change)
    }

    fn save(&self, contents: &Value) -> MasterResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = serde_json::to_string_pretty(contents)?;
        // Write then rename, so a crash never leaves a truncated file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_struct::ModSink;
    use std::sync::{Arc, Mutex};
    use tracing_test::traced_test;

    struct Recorder(Arc<Mutex<Vec<Mod>>>);

    impl ModSink for Recorder {
        fn publish(&self, m: &Mod) {
            self.0.lock().unwrap().push(m.clone());
        }
    }

    #[traced_test]
    #[test]
    fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = FlatFileDb::open(dir.path().join("pdb.json")).unwrap();
        assert_eq!(lock(&db.notifier()).read(), &Value::dict());
        assert!(logs_contain("starting empty"));
    }

    #[test]
    fn test_request_and_missing_key() {
        let db = FlatFileDb::in_memory(Value::from_pairs([("a", Value::Int(1))]));
        assert_eq!(db.request("a").unwrap(), Value::Int(1));
        assert!(matches!(db.request("b"), Err(MasterError::Lookup(_))));
    }

    #[test]
    fn test_set_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pdb.json");

        let db = FlatFileDb::open(&path).unwrap();
        db.set("flopping_peak", Value::Float(1.5e6)).unwrap();
        db.set("flopping_peak", Value::Float(2.5e6)).unwrap();
        drop(db);

        let reopened = FlatFileDb::open(&path).unwrap();
        assert_eq!(
            reopened.request("flopping_peak").unwrap(),
            Value::Float(2.5e6)
        );
        assert_eq!(
            lock(&reopened.notifier()).read().as_dict().map(<[_]>::len),
            Some(1)
        );
    }

    #[test]
    fn test_failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone").join("pdb.json");
        let db = FlatFileDb::open(&path).unwrap();
        let notifier = db.notifier();
        let events = Arc::new(Mutex::new(Vec::new()));
        lock(&notifier).set_sink(Arc::new(Recorder(events.clone())));

        assert!(matches!(
            db.set("flopping_peak", Value::Float(1.0)),
            Err(MasterError::Io(_))
        ));
        assert!(matches!(
            db.request("flopping_peak"),
            Err(MasterError::Lookup(_))
        ));
        assert!(events.lock().unwrap().is_empty());

        fs::create_dir(dir.path().join("gone")).unwrap();
        db.set("flopping_peak", Value::Float(2.0)).unwrap();
        assert_eq!(db.request("flopping_peak").unwrap(), Value::Float(2.0));
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_non_mapping_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ddb.json");
        fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(
            FlatFileDb::open(&path),
            Err(MasterError::Configuration(_))
        ));
    }
}
