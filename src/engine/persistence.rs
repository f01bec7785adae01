use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;
use serde::Serialize;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use log::{debug, warn};
use crate::engine::vault::Cipher;
use crate::{Document, Error, Result};

/// Field carrying the envelope format version.
pub const FORMAT_FIELD: &str = "arkivist";
/// Field naming the cipher used for the content.
pub const ALGORITHM_FIELD: &str = "encryption";
/// Field carrying the hex-encoded ciphertext.
pub const CONTENT_FIELD: &str = "content";

/// Envelope version written by this codec.
pub const FORMAT_VERSION: f64 = 1.3;
/// Oldest envelope version this codec reads.
pub const MIN_FORMAT_VERSION: f64 = 1.2;
/// Algorithm tag written to and required from the envelope.
pub const ALGORITHM: &str = "aes-256-gcm";

const DEFAULT_INDENT: usize = 4;
const MAX_INDENT: usize = 4;

/// How the data file is opened on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// `r`: read only. A missing file loads as empty and is not created.
    ReadOnly,
    /// `r+`: read, creating an empty `{}` file when it is missing.
    #[default]
    ReadWrite,
    /// `w+`: discard whatever the file holds and start from `{}`.
    Truncate,
}

impl FromStr for ReadMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" => Ok(ReadMode::ReadOnly),
            "r+" => Ok(ReadMode::ReadWrite),
            "w+" => Ok(ReadMode::Truncate),
            other => Err(Error::UnsupportedReadMode(other.to_string())),
        }
    }
}

/// Formatting applied when the store is written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Spaces per level, 0 for compact output. Values above 4 fall back to 4.
    pub indent: usize,
    pub sort: bool,
    pub reverse: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { indent: DEFAULT_INDENT, sort: false, reverse: false }
    }
}

/// Clamps an indent width to the legal range.
pub fn clamp_indent(indent: usize) -> usize {
    if indent <= MAX_INDENT { indent } else { DEFAULT_INDENT }
}

/// Serializes a document with the given indent, keeping non-ASCII text as is.
pub fn to_json_string(data: &Document, indent: usize) -> Result<String> {
    let indent = clamp_indent(indent);
    if indent == 0 {
        return Ok(serde_json::to_string(data)?);
    }

    let pad = vec![b' '; indent];
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(&pad);
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    data.serialize(&mut ser)?;
    String::from_utf8(out).map_err(|e| Error::Internal(e.to_string()))
}

/// Returns a copy of `data` ordered by key.
pub fn sorted(data: &Document, reverse: bool) -> Document {
    let mut entries: Vec<(&String, &Value)> = data.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    if reverse {
        entries.reverse();
    }
    entries.into_iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

pub(crate) fn validate_data_path(path: &Path) -> Result<&Path> {
    match path.extension().and_then(|s| s.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("json") => Ok(path),
        _ => Err(Error::UnsupportedFile(path.to_path_buf(), "json")),
    }
}

/// Returns true when `doc` has exactly the three envelope fields.
pub fn is_envelope(doc: &Document) -> bool {
    doc.len() == 3
        && doc.contains_key(FORMAT_FIELD)
        && doc.contains_key(ALGORITHM_FIELD)
        && doc.contains_key(CONTENT_FIELD)
}

fn check_envelope(doc: &Document) -> Result<()> {
    let version = doc.get(FORMAT_FIELD).and_then(Value::as_f64);
    match version {
        Some(v) if v >= MIN_FORMAT_VERSION => {}
        _ => {
            return Err(Error::Incompatible(format!(
                "format version {} is older than {}",
                doc.get(FORMAT_FIELD).unwrap_or(&Value::Null),
                MIN_FORMAT_VERSION
            )))
        }
    }
    match doc.get(ALGORITHM_FIELD).and_then(Value::as_str) {
        Some(ALGORITHM) => Ok(()),
        _ => Err(Error::Incompatible(format!(
            "unsupported encryption {}",
            doc.get(ALGORITHM_FIELD).unwrap_or(&Value::Null)
        ))),
    }
}

fn open_envelope(doc: &Document, cipher: &Cipher) -> Result<Document> {
    let sealed = doc
        .get(CONTENT_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Incompatible("envelope content is not text".to_string()))?;
    let plaintext = cipher.decrypt(sealed)?;
    let plaintext = plaintext.trim();
    if plaintext.is_empty() {
        return Ok(Document::new());
    }
    parse_object(plaintext)
}

fn parse_object(text: &str) -> Result<Document> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Internal(format!("expected a JSON object, found {}", kind(&other)))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Reads the document stored at `path`.
///
/// Returns whether the file held an encrypted envelope, and its content. With
/// a cipher the envelope is opened; without one the raw envelope is returned
/// and callers must not mistake it for data.
pub fn read_document(path: &Path, mode: ReadMode, cipher: Option<&Cipher>) -> Result<(bool, Document)> {
    let path = validate_data_path(path)?;

    if mode == ReadMode::Truncate {
        fs::write(path, "{}")?;
        return Ok((false, Document::new()));
    }

    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("{:?} does not exist yet", path);
            if mode == ReadMode::ReadWrite {
                fs::write(path, "{}")?;
            }
            return Ok((false, Document::new()));
        }
        Err(e) => return Err(e.into()),
    };

    let text: String = raw.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    let text = text.trim();
    if text.is_empty() || text == "{}" {
        return Ok((false, Document::new()));
    }

    let doc = parse_object(text)?;
    if !is_envelope(&doc) {
        return Ok((false, doc));
    }

    check_envelope(&doc)?;
    match cipher {
        Some(cipher) => Ok((true, open_envelope(&doc, cipher)?)),
        None => Ok((true, doc)),
    }
}

/// Writes `data` to `path`, sealed with `cipher` when one is given.
///
/// The file is written to a temporary sibling first and then renamed over the
/// destination, so readers never observe a half-written document.
pub fn write_document(path: &Path, data: &Document, options: &WriteOptions, cipher: Option<&Cipher>) -> Result<()> {
    let path = validate_data_path(path)?;

    let snapshot;
    let data = if options.sort {
        snapshot = sorted(data, options.reverse);
        &snapshot
    } else {
        data
    };

    let content = match cipher {
        Some(cipher) => {
            let sealed = cipher.encrypt(&serde_json::to_string(data)?)?;
            let envelope = json!({
                FORMAT_FIELD: FORMAT_VERSION,
                ALGORITHM_FIELD: ALGORITHM,
                CONTENT_FIELD: sealed,
            });
            serde_json::to_string(&envelope)?
        }
        None => to_json_string(data, options.indent)?,
    };

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(content.as_bytes())?;
    temp.persist(path).map_err(|e| {
        warn!("Could not replace {:?}: {}", path, e.error);
        Error::Io(e.error)
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn people() -> Document {
        let value = json!({
            "ñino": {"name": "Ñino"},
            "boy": {"name": "Boy", "tags": ["a", "b"]},
            "girl": {"name": "Girl"}
        });
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_read_mode_from_str() {
        assert_eq!("r".parse::<ReadMode>().unwrap(), ReadMode::ReadOnly);
        assert_eq!("r+".parse::<ReadMode>().unwrap(), ReadMode::ReadWrite);
        assert_eq!("w+".parse::<ReadMode>().unwrap(), ReadMode::Truncate);
        assert!(matches!("a".parse::<ReadMode>(), Err(Error::UnsupportedReadMode(_))));
    }

    #[test]
    fn test_round_trip_every_indent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("people.json");
        for indent in 0..=6 {
            let options = WriteOptions { indent, ..Default::default() };
            write_document(&path, &people(), &options, None).unwrap();
            let (encrypted, loaded) = read_document(&path, ReadMode::ReadWrite, None).unwrap();
            assert!(!encrypted);
            assert_eq!(loaded, people());
        }
    }

    #[test]
    fn test_indent_is_clamped() {
        assert_eq!(clamp_indent(2), 2);
        assert_eq!(clamp_indent(0), 0);
        assert_eq!(clamp_indent(9), 4);

        let mut data = Document::new();
        data.insert("k".to_string(), json!(1));
        assert_eq!(to_json_string(&data, 2).unwrap(), "{\n  \"k\": 1\n}");
        assert_eq!(to_json_string(&data, 8).unwrap(), "{\n    \"k\": 1\n}");
        assert_eq!(to_json_string(&data, 0).unwrap(), "{\"k\":1}");
    }

    #[test]
    fn test_non_ascii_is_not_escaped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("people.json");
        write_document(&path, &people(), &WriteOptions::default(), None).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("Ñino"));
        assert!(!raw.contains("\\u"));
    }

    #[test]
    fn test_sorted_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("people.json");
        let options = WriteOptions { indent: 0, sort: true, reverse: true };
        write_document(&path, &people(), &options, None).unwrap();
        let (_, loaded) = read_document(&path, ReadMode::ReadOnly, None).unwrap();
        let keys: Vec<&String> = loaded.keys().collect();
        assert_eq!(keys, vec!["ñino", "girl", "boy"]);
    }

    #[test]
    fn test_missing_file_is_created_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let (encrypted, loaded) = read_document(&path, ReadMode::ReadWrite, None).unwrap();
        assert!(!encrypted);
        assert!(loaded.is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
        assert!(read_document(&path, ReadMode::ReadWrite, None).unwrap().1.is_empty());
    }

    #[test]
    fn test_read_only_does_not_create() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let (_, loaded) = read_document(&path, ReadMode::ReadOnly, None).unwrap();
        assert!(loaded.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_truncate_discards_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("people.json");
        write_document(&path, &people(), &WriteOptions::default(), None).unwrap();
        let (_, loaded) = read_document(&path, ReadMode::Truncate, None).unwrap();
        assert!(loaded.is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn test_line_breaks_are_stripped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("edited.json");
        fs::write(&path, "{\r\n\"a\":\r\n 1,\n\"b\": \"x\"\n}\n").unwrap();
        let (_, loaded) = read_document(&path, ReadMode::ReadOnly, None).unwrap();
        assert_eq!(Value::Object(loaded), json!({"a": 1, "b": "x"}));
    }

    #[test]
    fn test_malformed_and_non_object_documents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{\"a\": ").unwrap();
        assert!(matches!(read_document(&path, ReadMode::ReadWrite, None), Err(Error::Serialization(_))));
        fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(read_document(&path, ReadMode::ReadWrite, None), Err(Error::Internal(_))));
    }

    #[test]
    fn test_undecodable_file_is_left_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("latin1.json");
        let bytes = b"{\"caf\xe9\": 1}";
        fs::write(&path, bytes).unwrap();

        assert!(matches!(read_document(&path, ReadMode::ReadWrite, None), Err(Error::Io(_))));
        assert_eq!(fs::read(&path).unwrap(), bytes.to_vec());
    }

    #[test]
    fn test_wrong_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("people.yaml");
        assert!(matches!(read_document(&path, ReadMode::ReadWrite, None), Err(Error::UnsupportedFile(_, "json"))));
        assert!(matches!(
            write_document(&path, &people(), &WriteOptions::default(), None),
            Err(Error::UnsupportedFile(_, "json"))
        ));
    }

    #[test]
    fn test_encrypted_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secret.json");
        let cipher = Cipher::generate();
        write_document(&path, &people(), &WriteOptions::default(), Some(&cipher)).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("Ñino"));
        let envelope: Document = serde_json::from_str(&raw).unwrap();
        assert!(is_envelope(&envelope));
        assert_eq!(envelope[FORMAT_FIELD], json!(FORMAT_VERSION));
        assert_eq!(envelope[ALGORITHM_FIELD], json!(ALGORITHM));

        let (encrypted, loaded) = read_document(&path, ReadMode::ReadWrite, Some(&cipher)).unwrap();
        assert!(encrypted);
        assert_eq!(loaded, people());
    }

    #[test]
    fn test_encrypted_read_with_wrong_or_missing_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secret.json");
        write_document(&path, &people(), &WriteOptions::default(), Some(&Cipher::generate())).unwrap();

        let res = read_document(&path, ReadMode::ReadWrite, Some(&Cipher::generate()));
        assert!(matches!(res, Err(Error::Decryption)));

        let (encrypted, wrapper) = read_document(&path, ReadMode::ReadWrite, None).unwrap();
        assert!(encrypted);
        assert!(is_envelope(&wrapper));
    }

    #[test]
    fn test_empty_sealed_payload_is_empty_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secret.json");
        let cipher = Cipher::generate();
        let envelope = json!({
            FORMAT_FIELD: 1.2,
            ALGORITHM_FIELD: ALGORITHM,
            CONTENT_FIELD: cipher.encrypt("  ").unwrap(),
        });
        fs::write(&path, envelope.to_string()).unwrap();
        let (encrypted, loaded) = read_document(&path, ReadMode::ReadWrite, Some(&cipher)).unwrap();
        assert!(encrypted);
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_incompatible_envelopes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.json");
        let cipher = Cipher::generate();

        let old = json!({FORMAT_FIELD: 1.1, ALGORITHM_FIELD: ALGORITHM, CONTENT_FIELD: ""});
        fs::write(&path, old.to_string()).unwrap();
        assert!(matches!(read_document(&path, ReadMode::ReadWrite, Some(&cipher)), Err(Error::Incompatible(_))));

        let foreign = json!({FORMAT_FIELD: 1.3, ALGORITHM_FIELD: "fernet", CONTENT_FIELD: ""});
        fs::write(&path, foreign.to_string()).unwrap();
        assert!(matches!(read_document(&path, ReadMode::ReadWrite, None), Err(Error::Incompatible(_))));
    }

    #[test]
    fn test_three_other_fields_are_plain_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.json");
        fs::write(&path, r#"{"arkivist": 1, "encryption": "x", "extra": 2}"#).unwrap();
        let (encrypted, loaded) = read_document(&path, ReadMode::ReadWrite, None).unwrap();
        assert!(!encrypted);
        assert_eq!(loaded.len(), 3);
    }

    #[test]
    fn test_atomic_rename_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("people.json");
        write_document(&path, &people(), &WriteOptions::default(), None).unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
