//! EXIF tag extraction from stored images.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use exif::{Exif, Field, In, Reader, Tag, Value};
use serde::Serialize;
use serde_json::Number;
use thiserror::Error;

/// Opaque blobs larger than this are left out of the tag set.
const MAX_UNDEFINED_BYTES: usize = 64;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("{} is not a recognized image: {reason}", path.display())]
    Unrecognized { path: PathBuf, reason: String },
    #[error("metadata extraction task failed: {0}")]
    Task(String),
}

/// Tag name to value, built once per asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MetadataTagSet(BTreeMap<String, serde_json::Value>);

impl MetadataTagSet {
    pub fn get(&self, tag: &str) -> Option<&serde_json::Value> {
        self.0.get(tag)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Read the EXIF block of the image at `path`.
///
/// A recognized container without EXIF data yields an empty set.
pub fn extract(path: &Path) -> Result<MetadataTagSet, MetadataError> {
    let file = File::open(path).map_err(|source| MetadataError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    let exif = match Reader::new().read_from_container(&mut reader) {
        Ok(exif) => exif,
        Err(exif::Error::NotFound(_)) => return Ok(MetadataTagSet::default()),
        Err(exif::Error::Io(source)) => {
            return Err(MetadataError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(error) => {
            return Err(MetadataError::Unrecognized {
                path: path.to_path_buf(),
                reason: error.to_string(),
            })
        }
    };

    Ok(collect_tags(&exif))
}

/// [`extract`] on the blocking pool.
pub async fn extract_async(path: PathBuf) -> Result<MetadataTagSet, MetadataError> {
    tokio::task::spawn_blocking(move || extract(&path))
        .await
        .map_err(|error| MetadataError::Task(error.to_string()))?
}

fn collect_tags(exif: &Exif) -> MetadataTagSet {
    let mut tags = BTreeMap::new();

    for field in exif.fields().filter(|field| field.ifd_num == In::PRIMARY) {
        if matches!(
            field.tag,
            Tag::MakerNote
                | Tag::GPSLatitude
                | Tag::GPSLongitude
                | Tag::GPSLatitudeRef
                | Tag::GPSLongitudeRef
        ) {
            continue;
        }
        if let Some(value) = field_value(field) {
            tags.insert(field.tag.to_string(), value);
        }
    }

    for (coord_tag, ref_tag) in [
        (Tag::GPSLatitude, Tag::GPSLatitudeRef),
        (Tag::GPSLongitude, Tag::GPSLongitudeRef),
    ] {
        if let Some(degrees) = gps_coordinate(exif, coord_tag, ref_tag) {
            if let Some(number) = Number::from_f64(degrees) {
                tags.insert(coord_tag.to_string(), serde_json::Value::Number(number));
            }
        }
    }

    MetadataTagSet(tags)
}

fn field_value(field: &Field) -> Option<serde_json::Value> {
    use serde_json::Value as Json;

    let single = match &field.value {
        Value::Ascii(strings) => {
            let text = strings
                .iter()
                .map(|bytes| String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Some(Json::String(text.trim().to_string()));
        }
        Value::Byte(v) if v.len() == 1 => Some(Json::from(v[0])),
        Value::Short(v) if v.len() == 1 => Some(Json::from(v[0])),
        Value::Long(v) if v.len() == 1 => Some(Json::from(v[0])),
        Value::SByte(v) if v.len() == 1 => Some(Json::from(v[0])),
        Value::SShort(v) if v.len() == 1 => Some(Json::from(v[0])),
        Value::SLong(v) if v.len() == 1 => Some(Json::from(v[0])),
        Value::Rational(v) if v.len() == 1 && v[0].denom != 0 => {
            Number::from_f64(v[0].to_f64()).map(Json::Number)
        }
        Value::SRational(v) if v.len() == 1 && v[0].denom != 0 => {
            Number::from_f64(v[0].to_f64()).map(Json::Number)
        }
        Value::Float(v) if v.len() == 1 => Number::from_f64(f64::from(v[0])).map(Json::Number),
        Value::Double(v) if v.len() == 1 => Number::from_f64(v[0]).map(Json::Number),
        Value::Undefined(bytes, _) if bytes.len() > MAX_UNDEFINED_BYTES => return None,
        Value::Unknown(..) => return None,
        _ => None,
    };

    single.or_else(|| {
        let text = field.display_value().to_string();
        Some(Json::String(text.trim_matches('"').to_string()))
    })
}

/// Degrees/minutes/seconds to signed decimal degrees.
fn gps_coordinate(exif: &Exif, coord_tag: Tag, ref_tag: Tag) -> Option<f64> {
    let coord = exif.get_field(coord_tag, In::PRIMARY)?;
    let reference = exif.get_field(ref_tag, In::PRIMARY)?;

    let degrees = match &coord.value {
        Value::Rational(parts) if parts.len() >= 3 => {
            parts[0].to_f64() + parts[1].to_f64() / 60.0 + parts[2].to_f64() / 3600.0
        }
        _ => return None,
    };
    if !degrees.is_finite() {
        return None;
    }

    let reference = reference.display_value().to_string();
    let sign = if reference.contains('S') || reference.contains('W') {
        -1.0
    } else {
        1.0
    };
    Some(sign * degrees)
}


#[cfg(test)]
mod tests {
    use super::fixtures::{bare_jpeg, jpeg_with_exif};
    use super::*;
    use tempfile::tempdir;

    fn write_temp(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).expect("write fixture");
        path
    }

    #[test]
    fn extracts_ascii_and_numeric_tags() {
        let temp = tempdir().expect("tempdir");
        let path = write_temp(temp.path(), "exif.jpg", &jpeg_with_exif());

        let tags = extract(&path).expect("extract tags");
        assert_eq!(tags.get("Make"), Some(&serde_json::json!("Test")));
        assert_eq!(tags.get("Orientation"), Some(&serde_json::json!(1)));
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn serializes_as_flat_object() {
        let temp = tempdir().expect("tempdir");
        let path = write_temp(temp.path(), "exif.jpg", &jpeg_with_exif());

        let json = serde_json::to_value(extract(&path).expect("extract tags")).unwrap();
        assert_eq!(json, serde_json::json!({"Make": "Test", "Orientation": 1}));
    }

    #[test]
    fn container_without_exif_yields_empty_set() {
        let temp = tempdir().expect("tempdir");
        let path = write_temp(temp.path(), "plain.jpg", &bare_jpeg());

        let tags = extract(&path).expect("extract tags");
        assert!(tags.is_empty());
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        let temp = tempdir().expect("tempdir");
        let path = write_temp(temp.path(), "notes.jpg", b"definitely not an image");

        let err = extract(&path).expect_err("garbage must fail");
        assert!(matches!(err, MetadataError::Unrecognized { .. }));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = extract(Path::new("/nonexistent/file.jpg")).expect_err("missing file");
        assert!(matches!(err, MetadataError::Read { .. }));
    }

    #[tokio::test]
    async fn extract_async_matches_sync_result() {
        let temp = tempdir().expect("tempdir");
        let path = write_temp(temp.path(), "exif.jpg", &jpeg_with_exif());

        let sync = extract(&path).expect("sync extract");
        let from_pool = extract_async(path).await.expect("async extract");
        assert_eq!(sync, from_pool);
    }
}
