use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use rand::Rng;
use serde_json::Value;
use log::{debug, warn};
use crate::engine::fetch::{self, FetchOptions};
use crate::engine::persistence::{self, ReadMode, WriteOptions};
use crate::engine::query::{loose_eq, Query};
use crate::engine::transform;
use crate::engine::vault::Cipher;
use crate::{Document, Error, Result};

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Spaces per level in the written file, 0 for compact output.
    pub indent: usize,
    /// Write the file after every mutation.
    pub autosave: bool,
    /// Order the written file by key.
    pub autosort: bool,
    /// Descending key order when [`Options::autosort`] is set.
    pub reverse: bool,
    /// How the file is opened; see [`ReadMode`].
    pub mode: ReadMode,
    /// Side file holding the encryption key.
    pub authfile: Option<PathBuf>,
    /// Propagate I/O and parse failures on load and reload instead of
    /// treating them as an empty file.
    pub strict: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            indent: 4,
            autosave: true,
            autosort: false,
            reverse: false,
            mode: ReadMode::ReadWrite,
            authfile: None,
            strict: false,
        }
    }
}

/// Post-processing applied by [`Arkivist::append_in`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOptions {
    /// Drop repeated items, keeping the first occurrence.
    pub unique: bool,
    /// Sort the sequence after appending.
    pub sort: bool,
}

#[derive(Debug)]
struct Inner {
    data: Document,
    filepath: Option<PathBuf>,
    authfile: Option<PathBuf>,
    cipher: Option<Cipher>,
    encrypt: bool,
}

/// An insertion-ordered JSON document store bound to an optional file.
///
/// Every public method takes the instance lock once, so a store can be shared
/// between threads behind an `Arc`.
#[derive(Debug)]
pub struct Arkivist {
    inner: Mutex<Inner>,
    options: Options,
}

fn recoverable(e: &Error) -> bool {
    matches!(e, Error::Io(_) | Error::Serialization(_) | Error::Internal(_))
}

/// Runs `f` on `data[parent]` when it holds a mapping, else on `data`.
fn with_target<R>(data: &mut Document, parent: Option<&str>, f: impl FnOnce(&mut Document) -> R) -> R {
    if let Some(Value::Object(nested)) = parent.and_then(|p| data.get_mut(p)) {
        return f(nested);
    }
    f(data)
}

fn target<'d>(data: &'d Document, parent: Option<&str>) -> &'d Document {
    match parent.and_then(|p| data.get(p)) {
        Some(Value::Object(nested)) => nested,
        _ => data,
    }
}

impl Arkivist {
    fn build(data: Document, filepath: Option<PathBuf>, cipher: Option<Cipher>, encrypt: bool, options: Options) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data,
                filepath,
                authfile: options.authfile.clone(),
                cipher,
                encrypt,
            }),
            options,
        }
    }

    /// An unbound store. Nothing is ever written unless [`Arkivist::save_as`] is called.
    pub fn in_memory() -> Self {
        Self::build(Document::new(), None, None, false, Options::default())
    }

    /// A store seeded with `data`, optionally bound to `filepath`.
    ///
    /// The file is not read; it is overwritten on the next save.
    pub fn with_data(data: Document, filepath: Option<PathBuf>, options: Options) -> Result<Self> {
        if let Some(path) = &filepath {
            persistence::validate_data_path(path)?;
        }
        let cipher = load_cipher(options.authfile.as_deref())?;
        Ok(Self::build(data, filepath, cipher, false, options))
    }

    /// Opens the store persisted at `path`.
    ///
    /// A missing file loads as empty. Unreadable or malformed files also load
    /// as empty unless [`Options::strict`] is set, and are left untouched on
    /// disk. An encrypted file requires a usable key in [`Options::authfile`].
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Self> {
        let path = persistence::validate_data_path(path.as_ref())?.to_path_buf();
        let cipher = load_cipher(options.authfile.as_deref())?;

        let (encrypt, data, recovered) = match persistence::read_document(&path, options.mode, cipher.as_ref()) {
            Ok((true, _)) if cipher.is_none() => return Err(Error::MissingCipher),
            Ok((encrypt, data)) => (encrypt, data, false),
            Err(e) if recoverable(&e) && !options.strict => {
                warn!("Could not load {:?}, starting empty: {}", path, e);
                (false, Document::new(), true)
            }
            Err(e) => return Err(e),
        };
        debug!("Loaded {} entries from {:?}", data.len(), path);

        let write_back = !recovered && options.mode != ReadMode::ReadOnly;
        let store = Self::build(data, Some(path), cipher, encrypt, options);
        if write_back {
            store.save()?;
        }
        Ok(store)
    }

    /// The options the store was opened with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_options(&self) -> WriteOptions {
        WriteOptions {
            indent: self.options.indent,
            sort: self.options.autosort,
            reverse: self.options.reverse,
        }
    }

    fn write_to(&self, inner: &Inner, path: &Path) -> Result<()> {
        let cipher = if inner.encrypt {
            Some(inner.cipher.as_ref().ok_or(Error::MissingCipher)?)
        } else {
            None
        };
        persistence::write_document(path, &inner.data, &self.write_options(), cipher)
    }

    fn autosave(&self, inner: &Inner) -> Result<()> {
        match (&inner.filepath, self.options.autosave) {
            (Some(path), true) => self.write_to(inner, path),
            _ => Ok(()),
        }
    }

    /// The bound data file, if any.
    pub fn filepath(&self) -> Option<PathBuf> {
        self.lock().filepath.clone()
    }

    /// The key file in use or to be used for encryption.
    pub fn authfile(&self) -> Option<PathBuf> {
        self.lock().authfile.clone()
    }

    /// Whether the file is written as an encrypted envelope.
    pub fn is_encrypted(&self) -> bool {
        self.lock().encrypt
    }

    // -- reads -------------------------------------------------------------

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().data.get(key).cloned()
    }

    /// Value at `key`, or `default` when it is absent or `null`.
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        match self.get(key) {
            Some(Value::Null) | None => default,
            Some(value) => value,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().data.contains_key(key)
    }

    pub fn count(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().data.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().data.keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.lock().data.values().cloned().collect()
    }

    /// A copy of the whole content.
    pub fn snapshot(&self) -> Document {
        self.lock().data.clone()
    }

    /// True iff `key` exists and holds `value`.
    pub fn doublecheck(&self, key: &str, value: &Value) -> bool {
        self.lock().data.get(key).map_or(false, |v| loose_eq(v, value))
    }

    /// The content expanded into dotted paths. See [`transform::flatten`].
    pub fn flatten(&self) -> Document {
        transform::flatten(&self.lock().data)
    }

    /// A uniformly chosen entry.
    pub fn random(&self) -> Option<(String, Value)> {
        let inner = self.lock();
        if inner.data.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..inner.data.len());
        inner.data.iter().nth(index).map(|(k, v)| (k.clone(), v.clone()))
    }

    /// Starts a query over the top-level entries.
    pub fn query(&self) -> Query<'_> {
        Query::new(self)
    }

    /// Scopes the next call to the mapping stored under `parent`.
    pub fn find(&self, parent: impl Into<String>) -> Scope<'_> {
        Scope { store: self, parent: parent.into() }
    }

    // -- writes ------------------------------------------------------------

    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<()> {
        self.set_at(None, key.into(), value)
    }

    fn set_at(&self, parent: Option<&str>, key: String, value: Value) -> Result<()> {
        let mut inner = self.lock();
        with_target(&mut inner.data, parent, |map| map.insert(key, value));
        self.autosave(&inner)
    }

    fn get_at(&self, parent: Option<&str>, key: &str) -> Option<Value> {
        let inner = self.lock();
        target(&inner.data, parent).get(key).cloned()
    }

    /// Removes `key`, keeping the order of the remaining entries.
    pub fn remove(&self, key: &str) -> Result<Option<Value>> {
        let mut inner = self.lock();
        let removed = inner.data.shift_remove(key);
        if removed.is_some() {
            self.autosave(&inner)?;
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.data.clear();
        self.autosave(&inner)
    }

    /// Merges `data` into the store.
    pub fn update(&self, data: Document) -> Result<()> {
        let mut inner = self.lock();
        inner.data.extend(data);
        self.autosave(&inner)
    }

    /// Replaces the whole content with `data`.
    pub fn load(&self, data: Document) -> Result<()> {
        let mut inner = self.lock();
        inner.data = data;
        self.autosave(&inner)
    }

    /// Replaces the whole content with the JSON object in `text`.
    ///
    /// Text that is not a JSON object empties the store, unless the store is
    /// strict, in which case the error is returned and nothing changes.
    pub fn load_str(&self, text: &str) -> Result<()> {
        let data = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            Ok(_) if self.options.strict => return Err(Error::Internal("expected a JSON object".to_string())),
            Err(e) if self.options.strict => return Err(e.into()),
            _ => {
                warn!("Ignoring content that is not a JSON object");
                Document::new()
            }
        };
        self.load(data)
    }

    /// Swaps keys and values. See [`transform::invert`]; on error nothing changes.
    pub fn invert(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.data = transform::invert(&inner.data)?;
        self.autosave(&inner)
    }

    pub fn append_in(&self, key: &str, value: Value, options: AppendOptions) -> Result<()> {
        self.append_at(None, key, value, options)
    }

    pub fn remove_in(&self, key: &str, value: Value) -> Result<()> {
        self.remove_at(None, key, value)
    }

    fn append_at(&self, parent: Option<&str>, key: &str, value: Value, options: AppendOptions) -> Result<()> {
        let mut inner = self.lock();
        let changed = with_target(&mut inner.data, parent, |map| -> Result<bool> {
            let mut items = match map.get(key) {
                None => Vec::new(),
                Some(Value::Array(items)) => items.clone(),
                Some(_) => {
                    debug!("append_in: `{}` is not a list, skipping", key);
                    return Ok(false);
                }
            };
            match value {
                Value::Array(values) => items.extend(values),
                other => items.push(other),
            }
            if options.sort {
                transform::sort_values(&mut items, key)?;
            }
            if options.unique {
                items = transform::dedup_values(items);
            }
            map.insert(key.to_string(), Value::Array(items));
            Ok(true)
        })?;
        if changed {
            self.autosave(&inner)?;
        }
        Ok(())
    }

    fn remove_at(&self, parent: Option<&str>, key: &str, value: Value) -> Result<()> {
        let remove = match value {
            Value::Array(values) => values,
            other => vec![other],
        };
        let mut inner = self.lock();
        let changed = with_target(&mut inner.data, parent, |map| match map.get_mut(key) {
            Some(Value::Array(items)) => {
                let kept = transform::difference(std::mem::take(items), &remove);
                *items = kept;
                true
            }
            _ => false,
        });
        if changed {
            self.autosave(&inner)?;
        }
        Ok(())
    }

    // -- persistence -------------------------------------------------------

    /// Writes the bound file regardless of [`Options::autosave`].
    pub fn save(&self) -> Result<()> {
        let inner = self.lock();
        let path = inner.filepath.clone().ok_or(Error::NoFilePath)?;
        self.write_to(&inner, &path)
    }

    /// Writes once to `path`; the store stays bound to its own file.
    pub fn save_as<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let inner = self.lock();
        self.write_to(&inner, path.as_ref())
    }

    /// Re-reads the bound file. The content is replaced only when the file
    /// yields a non-empty mapping.
    pub fn reload(&self) -> Result<()> {
        let mut inner = self.lock();
        let path = inner.filepath.clone().ok_or(Error::NoFilePath)?;
        let mode = match self.options.mode {
            ReadMode::Truncate => ReadMode::ReadWrite,
            mode => mode,
        };
        match persistence::read_document(&path, mode, inner.cipher.as_ref()) {
            Ok((true, _)) if inner.cipher.is_none() => Err(Error::MissingCipher),
            Ok((encrypt, data)) => {
                inner.encrypt = encrypt;
                if !data.is_empty() {
                    inner.data = data;
                }
                Ok(())
            }
            Err(e) if recoverable(&e) && !self.options.strict => {
                warn!("Could not reload {:?}, keeping current content: {}", path, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Turns at-rest encryption on or off and rewrites the bound file.
    ///
    /// Turning it on loads the key from the configured key file, or generates
    /// one next to the data file.
    pub fn encrypt(&self, state: bool) -> Result<()> {
        let mut inner = self.lock();
        if state && !inner.encrypt {
            let dir = match inner.filepath.as_deref().and_then(Path::parent) {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let (authfile, cipher) = Cipher::load_or_create(inner.authfile.as_deref(), &dir)?;
            inner.authfile = Some(authfile);
            inner.cipher = Some(cipher);
            inner.encrypt = true;
        } else if !state && inner.encrypt {
            inner.encrypt = false;
            inner.cipher = None;
        }
        match inner.filepath.clone() {
            Some(path) => self.write_to(&inner, &path),
            None => Ok(()),
        }
    }

    /// Replaces or merges the content with the JSON object served at `url`.
    ///
    /// Failures leave the store unchanged and are only logged, unless
    /// [`FetchOptions::strict`] is set.
    pub fn fetch(&self, url: &str, options: &FetchOptions) -> Result<()> {
        let fetched = match fetch::fetch_document(url, options.timeout) {
            Ok(doc) => doc,
            Err(e) if !options.strict => {
                warn!("Could not fetch {}: {}", url, e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let mut inner = self.lock();
        if !options.extend {
            inner.data.clear();
        }
        inner.data.extend(fetched);
        self.autosave(&inner)
    }
}

fn load_cipher(authfile: Option<&Path>) -> Result<Option<Cipher>> {
    match authfile {
        Some(path) if path.exists() => match Cipher::load(path) {
            Ok(cipher) => Ok(Some(cipher)),
            Err(Error::InvalidKey(e)) => {
                warn!("Key file {:?} is unusable, ignoring it: {}", path, e);
                Ok(None)
            }
            Err(e) => Err(e),
        },
        Some(path) => {
            debug!("Key file {:?} does not exist yet", path);
            Ok(None)
        }
        None => Ok(None),
    }
}

/// Access scoped to the mapping stored under one parent key.
///
/// Each method consumes the scope. When the parent is missing or does not
/// hold a mapping, the call falls through to the top level.
#[derive(Debug)]
pub struct Scope<'a> {
    store: &'a Arkivist,
    parent: String,
}

impl<'a> Scope<'a> {
    pub fn set(self, key: impl Into<String>, value: Value) -> Result<()> {
        self.store.set_at(Some(self.parent.as_str()), key.into(), value)
    }

    pub fn get(self, key: &str) -> Option<Value> {
        self.store.get_at(Some(self.parent.as_str()), key)
    }

    pub fn get_or(self, key: &str, default: Value) -> Value {
        match self.get(key) {
            Some(Value::Null) | None => default,
            Some(value) => value,
        }
    }

    pub fn append_in(self, key: &str, value: Value, options: AppendOptions) -> Result<()> {
        self.store.append_at(Some(self.parent.as_str()), key, value, options)
    }

    pub fn remove_in(self, key: &str, value: Value) -> Result<()> {
        self.store.remove_at(Some(self.parent.as_str()), key, value)
    }
}
