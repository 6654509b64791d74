use anyhow::Result;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// What can be learned about a file without decoding its pixels
#[derive(Debug, Clone, Default)]
pub struct PhotoMetadata {
    pub size_bytes: i64,
    pub modified_at: Option<String>,

    // Header dimensions, as stored (before orientation)
    pub width: Option<u32>,
    pub height: Option<u32>,

    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub captured_at: Option<String>,

    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,

    /// EXIF orientation in clockwise degrees
    pub rotation: u32,

    /// Set when the image header could not be parsed
    pub header_error: Option<String>,
}

impl PhotoMetadata {
    /// Dimensions as displayed, i.e. after applying EXIF orientation
    pub fn oriented_dimensions(&self) -> Option<(u32, u32)> {
        let (w, h) = (self.width?, self.height?);
        if self.rotation == 90 || self.rotation == 270 {
            Some((h, w))
        } else {
            Some((w, h))
        }
    }
}

/// Read file, header and EXIF metadata. Only I/O errors on the file itself
/// are returned; unreadable headers are reported in `header_error`.
pub fn extract_metadata(path: &Path) -> Result<PhotoMetadata> {
    let mut metadata = PhotoMetadata::default();

    let fs_meta = std::fs::metadata(path)?;
    metadata.size_bytes = fs_meta.len() as i64;
    if let Ok(modified) = fs_meta.modified() {
        let modified: chrono::DateTime<chrono::Utc> = modified.into();
        metadata.modified_at = Some(modified.format("%Y-%m-%dT%H:%M:%S").to_string());
    }

    match image::ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|e| e.to_string())
        .and_then(|r| r.into_dimensions().map_err(|e| e.to_string()))
    {
        Ok((w, h)) => {
            metadata.width = Some(w);
            metadata.height = Some(h);
        }
        Err(e) => metadata.header_error = Some(e),
    }

    if let Ok(file) = File::open(path) {
        let mut bufreader = BufReader::new(file);
        if let Ok(exif) = exif::Reader::new().read_from_container(&mut bufreader) {
            if let Some(field) = exif.get_field(exif::Tag::Make, exif::In::PRIMARY) {
                metadata.camera_make = Some(field.display_value().to_string().trim_matches('"').to_string());
            }

            if let Some(field) = exif.get_field(exif::Tag::Model, exif::In::PRIMARY) {
                metadata.camera_model = Some(field.display_value().to_string().trim_matches('"').to_string());
            }

            if let Some(field) = exif.get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY) {
                let raw = field.display_value().to_string();
                metadata.captured_at = normalize_exif_datetime(raw.trim_matches('"'));
            }

            if let Some(field) = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY) {
                if let Some(orientation) = field.value.get_uint(0) {
                    metadata.rotation = exif_orientation_to_degrees(orientation);
                }
            }

            if let (Some(lat_field), Some(lat_ref), Some(lon_field), Some(lon_ref)) = (
                exif.get_field(exif::Tag::GPSLatitude, exif::In::PRIMARY),
                exif.get_field(exif::Tag::GPSLatitudeRef, exif::In::PRIMARY),
                exif.get_field(exif::Tag::GPSLongitude, exif::In::PRIMARY),
                exif.get_field(exif::Tag::GPSLongitudeRef, exif::In::PRIMARY),
            ) {
                if let (exif::Value::Rational(lat_vals), exif::Value::Rational(lon_vals)) =
                    (&lat_field.value, &lon_field.value)
                {
                    if lat_vals.len() >= 3 && lon_vals.len() >= 3 {
                        let lat = dms_to_decimal(
                            lat_vals[0].to_f64(),
                            lat_vals[1].to_f64(),
                            lat_vals[2].to_f64(),
                        );
                        let lon = dms_to_decimal(
                            lon_vals[0].to_f64(),
                            lon_vals[1].to_f64(),
                            lon_vals[2].to_f64(),
                        );

                        let lat_ref_str = lat_ref.display_value().to_string();
                        let lon_ref_str = lon_ref.display_value().to_string();

                        metadata.gps_latitude = Some(if lat_ref_str.contains('S') { -lat } else { lat });
                        metadata.gps_longitude = Some(if lon_ref_str.contains('W') { -lon } else { lon });
                    }
                }
            }
        }
    }

    Ok(metadata)
}

/// Read only the EXIF orientation, in clockwise degrees
pub fn read_rotation(path: &Path) -> u32 {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return 0,
    };

    let mut reader = BufReader::new(file);
    let exif = match exif::Reader::new().read_from_container(&mut reader) {
        Ok(e) => e,
        Err(_) => return 0,
    };

    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .map(exif_orientation_to_degrees)
        .unwrap_or(0)
}

/// Convert EXIF orientation value (1-8) to rotation degrees (0, 90, 180, 270)
fn exif_orientation_to_degrees(orientation: u32) -> u32 {
    match orientation {
        6 => 90,
        3 => 180,
        8 => 270,
        _ => 0,
    }
}

fn dms_to_decimal(degrees: f64, minutes: f64, seconds: f64) -> f64 {
    degrees + minutes / 60.0 + seconds / 3600.0
}

/// EXIF writes `2021:06:01 12:00:00`; the display form uses dashes
fn normalize_exif_datetime(raw: &str) -> Option<String> {
    ["%Y:%m:%d %H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_exif_datetime() {
        assert_eq!(
            normalize_exif_datetime("2021:06:01 12:30:00").as_deref(),
            Some("2021-06-01T12:30:00")
        );
        assert_eq!(
            normalize_exif_datetime("2021-06-01 12:30:00").as_deref(),
            Some("2021-06-01T12:30:00")
        );
        assert!(normalize_exif_datetime("yesterday").is_none());
    }

    #[test]
    fn test_extract_metadata_reads_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.png");
        image::RgbImage::new(64, 48).save(&path).unwrap();

        let meta = extract_metadata(&path).unwrap();
        assert_eq!(meta.width, Some(64));
        assert_eq!(meta.height, Some(48));
        assert!(meta.header_error.is_none());
        assert!(meta.size_bytes > 0);
        assert_eq!(meta.oriented_dimensions(), Some((64, 48)));
    }

    #[test]
    fn test_extract_metadata_flags_corrupt_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();

        let meta = extract_metadata(&path).unwrap();
        assert!(meta.width.is_none());
        assert!(meta.header_error.is_some());
    }
}
