use std::io::Cursor;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use tracing::{debug, info, warn};

use crate::error::BoothError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Portrait {
    bytes: Vec<u8>,
    mime_type: String,
}

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    if data.len() > 12 {
        let ftyp = &data[4..12];
        if ftyp.starts_with(b"ftyp") {
            let brand = &ftyp[4..8];
            if brand == b"heic" || brand == b"heif" || brand == b"hevc" {
                return Some("image/heic".to_string());
            }
        }
    }

    infer::get(data).map(|kind| kind.mime_type().to_string())
}

pub fn normalize_image_mime(mime_type: &str) -> String {
    let lowered = mime_type.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "image/jpg" => "image/jpeg".to_string(),
        _ => lowered,
    }
}

pub fn split_data_url(value: &str) -> (Option<&str>, &str) {
    let trimmed = value.trim();
    let Some(rest) = trimmed.strip_prefix("data:") else {
        return (None, trimmed);
    };
    match rest.split_once(',') {
        Some((header, payload)) => {
            let mime = header.split(';').next().filter(|value| !value.is_empty());
            (mime, payload)
        }
        None => (None, rest),
    }
}

impl Portrait {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, BoothError> {
        if bytes.is_empty() {
            return Err(BoothError::Capture("image is empty".to_string()));
        }
        let mime_type = detect_mime_type(&bytes)
            .map(|mime| normalize_image_mime(&mime))
            .filter(|mime| mime.starts_with("image/"))
            .ok_or_else(|| BoothError::Capture("unrecognized image format".to_string()))?;
        if mime_type != "image/heic" {
            image::load_from_memory(&bytes)
                .map_err(|err| BoothError::Capture(format!("image could not be decoded: {err}")))?;
        }
        Ok(Portrait { bytes, mime_type })
    }

    pub async fn from_file(path: &Path) -> Result<Self, BoothError> {
        let bytes = tokio::fs::read(path).await.map_err(|err| {
            BoothError::Capture(format!("failed to read {}: {err}", path.display()))
        })?;
        let portrait = Self::from_bytes(bytes)?;
        info!(
            "Loaded portrait from {} ({}, {} bytes)",
            path.display(),
            portrait.mime_type,
            portrait.bytes.len()
        );
        Ok(portrait)
    }

    pub fn from_data_url(value: &str) -> Result<Self, BoothError> {
        let (_, payload) = split_data_url(value);
        let bytes = general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|err| BoothError::Capture(format!("invalid base64 image: {err}")))?;
        Self::from_bytes(bytes)
    }

    pub fn from_frame(frame: &RgbImage, mirror: bool, quality: u8) -> Result<Self, BoothError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(BoothError::Capture("camera returned an empty frame".to_string()));
        }
        let mirrored;
        let frame = if mirror {
            mirrored = image::imageops::flip_horizontal(frame);
            &mirrored
        } else {
            frame
        };

        let mut buffer = Cursor::new(Vec::new());
        JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(frame)?;
        Ok(Portrait {
            bytes: buffer.into_inner(),
            mime_type: "image/jpeg".to_string(),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.bytes)
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    User,
    Environment,
}

pub trait FrameSource: Send {
    fn open(&mut self) -> Result<(), BoothError>;
    fn grab_frame(&mut self) -> Result<RgbImage, BoothError>;
    fn close(&mut self);
    fn facing(&self) -> Facing;
}

pub struct Camera {
    source: Box<dyn FrameSource>,
    jpeg_quality: u8,
}

impl Camera {
    pub fn acquire(mut source: Box<dyn FrameSource>, jpeg_quality: u8) -> Result<Self, BoothError> {
        if let Err(err) = source.open() {
            source.close();
            warn!("Camera could not be opened: {err}");
            return Err(err);
        }
        debug!("Camera acquired (facing={:?})", source.facing());
        Ok(Camera {
            source,
            jpeg_quality,
        })
    }

    pub fn capture(&mut self) -> Result<Portrait, BoothError> {
        let frame = self.source.grab_frame()?;
        let mirror = self.source.facing() == Facing::User;
        Portrait::from_frame(&frame, mirror, self.jpeg_quality)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.source.close();
        debug!("Camera released");
    }
}

pub struct StillFrameSource {
    path: PathBuf,
    facing: Facing,
    frame: Option<RgbImage>,
}

impl StillFrameSource {
    pub fn new(path: impl Into<PathBuf>, facing: Facing) -> Self {
        Self {
            path: path.into(),
            facing,
            frame: None,
        }
    }
}

impl FrameSource for StillFrameSource {
    fn open(&mut self) -> Result<(), BoothError> {
        let image = image::open(&self.path).map_err(|err| {
            BoothError::Capture(format!(
                "camera source {} is unavailable: {err}",
                self.path.display()
            ))
        })?;
        self.frame = Some(image.to_rgb8());
        Ok(())
    }

    fn grab_frame(&mut self) -> Result<RgbImage, BoothError> {
        self.frame
            .clone()
            .ok_or_else(|| BoothError::Capture("camera is not open".to_string()))
    }

    fn close(&mut self) {
        self.frame = None;
    }

    fn facing(&self) -> Facing {
        self.facing
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use image::{DynamicImage, ImageFormat, Rgb};

    use super::*;

    pub(crate) fn sample_png() -> Vec<u8> {
        let mut image = RgbImage::new(4, 2);
        image.put_pixel(0, 0, Rgb([255, 0, 0]));
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut buffer, ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    pub(crate) fn sample_portrait() -> Portrait {
        Portrait::from_bytes(sample_png()).unwrap()
    }

    struct TrackingSource {
        released: Arc<AtomicBool>,
        fail_open: bool,
        facing: Facing,
    }

    impl FrameSource for TrackingSource {
        fn open(&mut self) -> Result<(), BoothError> {
            if self.fail_open {
                return Err(BoothError::Capture("permission denied".to_string()));
            }
            Ok(())
        }

        fn grab_frame(&mut self) -> Result<RgbImage, BoothError> {
            // left half red, right half blue
            let mut frame = RgbImage::from_pixel(16, 8, Rgb([0, 0, 255]));
            for y in 0..8 {
                for x in 0..8 {
                    frame.put_pixel(x, y, Rgb([255, 0, 0]));
                }
            }
            Ok(frame)
        }

        fn close(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }

        fn facing(&self) -> Facing {
            self.facing
        }
    }

    fn tracking(fail_open: bool, facing: Facing) -> (Box<dyn FrameSource>, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        let source = TrackingSource {
            released: released.clone(),
            fail_open,
            facing,
        };
        (Box::new(source), released)
    }

    #[test]
    fn png_bytes_become_a_portrait() {
        let portrait = sample_portrait();
        assert_eq!(portrait.mime_type(), "image/png");
        assert!(portrait.to_data_url().starts_with("data:image/png;base64,"));
    }

    #[test]
    fn non_image_bytes_are_rejected() {
        let err = Portrait::from_bytes(b"definitely not an image".to_vec()).unwrap_err();
        assert!(matches!(err, BoothError::Capture(_)));
        assert!(Portrait::from_bytes(Vec::new()).is_err());
    }

    #[test]
    fn data_urls_and_bare_base64_are_accepted() {
        let portrait = sample_portrait();
        let from_url = Portrait::from_data_url(&portrait.to_data_url()).unwrap();
        let from_bare = Portrait::from_data_url(&portrait.to_base64()).unwrap();
        assert_eq!(from_url, portrait);
        assert_eq!(from_bare, portrait);
    }

    #[test]
    fn split_data_url_extracts_mime() {
        assert_eq!(
            split_data_url("data:image/webp;base64,AAAA"),
            (Some("image/webp"), "AAAA")
        );
        assert_eq!(split_data_url("AAAA"), (None, "AAAA"));
    }

    #[test]
    fn front_camera_frames_are_mirrored() {
        let (source, _) = tracking(false, Facing::User);
        let mut camera = Camera::acquire(source, 95).unwrap();
        let portrait = camera.capture().unwrap();
        assert_eq!(portrait.mime_type(), "image/jpeg");

        let decoded = image::load_from_memory(portrait.bytes()).unwrap().to_rgb8();
        let left = decoded.get_pixel(1, 4);
        assert!(left[2] > 200 && left[0] < 60, "left side should be blue, got {left:?}");
    }

    #[test]
    fn rear_camera_frames_keep_orientation() {
        let (source, _) = tracking(false, Facing::Environment);
        let mut camera = Camera::acquire(source, 95).unwrap();
        let decoded = image::load_from_memory(camera.capture().unwrap().bytes())
            .unwrap()
            .to_rgb8();
        let left = decoded.get_pixel(1, 4);
        assert!(left[0] > 200 && left[2] < 60, "left side should be red, got {left:?}");
    }

    #[test]
    fn camera_is_released_on_drop() {
        let (source, released) = tracking(false, Facing::User);
        let camera = Camera::acquire(source, 90).unwrap();
        assert!(!released.load(Ordering::SeqCst));
        drop(camera);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn camera_is_released_when_open_is_denied() {
        let (source, released) = tracking(true, Facing::User);
        assert!(Camera::acquire(source, 90).is_err());
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn portrait_file_is_read_asynchronously() {
        let path = std::env::temp_dir().join(format!("chronos-portrait-{}.png", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, sample_png()).await.unwrap();

        let portrait = Portrait::from_file(&path).await.unwrap();
        assert_eq!(portrait.mime_type(), "image/png");
        assert_eq!(portrait.bytes(), sample_png().as_slice());
        tokio::fs::remove_file(&path).await.ok();

        let missing = Portrait::from_file(&path).await.unwrap_err();
        assert!(matches!(missing, BoothError::Capture(message) if message.contains("failed to read")));
    }
}
