use std::path::Path;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::gemini::ContinuationToken;

/// A generated story plan plus the token that continues its reasoning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbstractRecord {
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    #[serde(
        rename = "thought_signature",
        default,
        skip_serializing_if = "ContinuationToken::is_empty"
    )]
    pub continuation_token: ContinuationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbstractFormat {
    Yaml,
    Json,
    PlainText,
}

impl AbstractFormat {
    pub fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("yaml" | "yml") => Self::Yaml,
            Some("json") => Self::Json,
            _ => Self::PlainText,
        }
    }
}

/// Writes `record` as YAML. The extension of `path` does not change the format.
pub fn write(path: &Path, record: &AbstractRecord) -> anyhow::Result<()> {
    if record.abstract_text.trim().is_empty() {
        anyhow::bail!("refusing to write empty abstract: {}", path.display());
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create abstract dir: {}", parent.display()))?;
    }

    let yaml = serde_yaml::to_string(record).context("serialize abstract yaml")?;
    std::fs::write(path, yaml).with_context(|| format!("write abstract: {}", path.display()))?;
    Ok(())
}

/// Reads an abstract file.
///
/// `.yaml`/`.yml` and `.json` files are decoded as records. A file that fails
/// to decode, or has any other extension, is taken verbatim as the abstract
/// text with no continuation token. Only I/O failures are errors.
pub fn read(path: &Path) -> anyhow::Result<AbstractRecord> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read abstract file: {}", path.display()))?;

    let decoded = match AbstractFormat::from_path(path) {
        AbstractFormat::Yaml => serde_yaml::from_str::<AbstractRecord>(&raw)
            .map_err(anyhow::Error::from)
            .map(Some),
        AbstractFormat::Json => serde_json::from_str::<AbstractRecord>(&raw)
            .map_err(anyhow::Error::from)
            .map(Some),
        AbstractFormat::PlainText => Ok(None),
    };

    match decoded {
        Ok(Some(record)) => {
            tracing::info!(path = %path.display(), "parsed abstract record");
            Ok(record)
        }
        Ok(None) => {
            tracing::info!(
                path = %path.display(),
                "abstract file is not yaml or json; treating content as plain text"
            );
            Ok(plain_text(raw))
        }
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to decode abstract file; treating content as plain text"
            );
            Ok(plain_text(raw))
        }
    }
}

fn plain_text(raw: String) -> AbstractRecord {
    AbstractRecord {
        abstract_text: raw,
        continuation_token: ContinuationToken::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AbstractRecord {
        AbstractRecord {
            abstract_text: "Setting: a lighthouse.\n\nChapter 1: Arrival\nChapter 2: Storm\n"
                .to_owned(),
            continuation_token: ContinuationToken::new(vec![0, 159, 146, 150, 255, 10]),
        }
    }

    #[test]
    fn yaml_round_trip_preserves_text_and_token() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("abstract-1.yaml");

        write(&path, &record())?;
        let back = read(&path)?;

        assert_eq!(back, record());
        Ok(())
    }

    #[test]
    fn json_record_is_read_back() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("abstract-1.json");
        std::fs::write(&path, serde_json::to_string_pretty(&record())?)?;

        let back = read(&path)?;

        assert_eq!(back, record());
        Ok(())
    }

    #[test]
    fn write_always_produces_yaml() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("abstract.json");

        write(&path, &record())?;
        let raw = std::fs::read_to_string(&path)?;

        let parsed: AbstractRecord = serde_yaml::from_str(&raw)?;
        assert_eq!(parsed, record());
        assert!(raw.starts_with("abstract:"));
        Ok(())
    }

    #[test]
    fn token_is_omitted_when_empty() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("abstract.yaml");
        let record = AbstractRecord {
            abstract_text: "plan".to_owned(),
            continuation_token: ContinuationToken::default(),
        };

        write(&path, &record)?;

        let raw = std::fs::read_to_string(&path)?;
        assert!(!raw.contains("thought_signature"));
        assert_eq!(read(&path)?, record);
        Ok(())
    }

    #[test]
    fn empty_abstract_is_not_written() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("abstract.yaml");

        let err = write(&path, &AbstractRecord::default()).unwrap_err();

        assert!(err.to_string().contains("empty abstract"));
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn unknown_extension_is_plain_text() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("abstract.txt");
        std::fs::write(&path, "abstract: looks like yaml\n")?;

        let back = read(&path)?;

        assert_eq!(back.abstract_text, "abstract: looks like yaml\n");
        assert!(back.continuation_token.is_empty());
        Ok(())
    }

    #[test]
    fn malformed_yaml_and_json_fall_back_to_plain_text() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;

        let yaml_path = temp.path().join("abstract.YML");
        std::fs::write(&yaml_path, "just a story plan: [unclosed\n")?;
        let back = read(&yaml_path)?;
        assert_eq!(back.abstract_text, "just a story plan: [unclosed\n");
        assert!(back.continuation_token.is_empty());

        let json_path = temp.path().join("abstract.json");
        std::fs::write(&json_path, "{\"abstract\": ")?;
        let back = read(&json_path)?;
        assert_eq!(back.abstract_text, "{\"abstract\": ");
        assert!(back.continuation_token.is_empty());

        let missing_field = temp.path().join("other.yaml");
        std::fs::write(&missing_field, "title: no abstract key\n")?;
        assert_eq!(read(&missing_field)?.abstract_text, "title: no abstract key\n");
        Ok(())
    }

    #[test]
    fn null_token_reads_as_empty() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("abstract-null.json");
        std::fs::write(
            &path,
            r#"{"abstract":"Chapter 1: Arrival","thought_signature":null}"#,
        )?;

        let back = read(&path)?;

        assert_eq!(back.abstract_text, "Chapter 1: Arrival");
        assert!(back.continuation_token.is_empty());

        let yaml_path = temp.path().join("abstract-null.yaml");
        std::fs::write(&yaml_path, "abstract: Chapter 1\nthought_signature: null\n")?;
        assert_eq!(read(&yaml_path)?.abstract_text, "Chapter 1");
        Ok(())
    }

    #[test]
    fn token_stored_as_byte_list_is_accepted() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let yaml_path = temp.path().join("abstract-bytes.yaml");
        std::fs::write(
            &yaml_path,
            "abstract: Chapter 1 plan\nthought_signature:\n  - 18\n  - 52\n",
        )?;

        let back = read(&yaml_path)?;

        assert_eq!(back.abstract_text, "Chapter 1 plan");
        assert_eq!(back.continuation_token, ContinuationToken::new(vec![18, 52]));

        let json_path = temp.path().join("abstract-bytes.json");
        std::fs::write(
            &json_path,
            r#"{"abstract":"Chapter 1 plan","thought_signature":[0,255,7]}"#,
        )?;
        assert_eq!(
            read(&json_path)?.continuation_token,
            ContinuationToken::new(vec![0, 255, 7])
        );
        Ok(())
    }

    #[test]
    fn missing_file_is_an_error_naming_the_path() {
        let err = read(Path::new("/nonexistent/abstract.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/abstract.yaml"));
    }

    #[test]
    fn format_is_inferred_case_insensitively() {
        assert_eq!(AbstractFormat::from_path(Path::new("a.YAML")), AbstractFormat::Yaml);
        assert_eq!(AbstractFormat::from_path(Path::new("a.yml")), AbstractFormat::Yaml);
        assert_eq!(AbstractFormat::from_path(Path::new("a.Json")), AbstractFormat::Json);
        assert_eq!(AbstractFormat::from_path(Path::new("a.md")), AbstractFormat::PlainText);
        assert_eq!(AbstractFormat::from_path(Path::new("abstract")), AbstractFormat::PlainText);
    }
}
