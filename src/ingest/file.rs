//! Local still-image frame source.
//!
//! `FileSource` decodes one JPEG/PNG from local disk on `open` and replays it on
//! every `read`. It stands in for a camera when commissioning a zone against a
//! reference snapshot, and it never fetches remote URLs.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};

use super::{FrameSource, ReleaseError};

pub struct FileSource {
    path: PathBuf,
    image: Option<RgbImage>,
    frames_read: u64,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let as_str = path.to_string_lossy();
        if as_str.trim().is_empty() {
            return Err(anyhow!("file source requires a path"));
        }
        if as_str.contains("://") {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes)"
            ));
        }
        Ok(Self {
            path: path.to_path_buf(),
            image: None,
            frames_read: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }
}

impl FrameSource for FileSource {
    fn open(&mut self) -> Result<()> {
        let image = image::open(&self.path)
            .with_context(|| format!("decode {}", self.path.display()))?
            .to_rgb8();
        log::info!(
            "FileSource: loaded {} ({}x{})",
            self.path.display(),
            image.width(),
            image.height()
        );
        self.image = Some(image);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RgbImage>> {
        let image = self
            .image
            .as_ref()
            .ok_or_else(|| anyhow!("file source {} is not open", self.path.display()))?;
        self.frames_read += 1;
        Ok(Some(image.clone()))
    }

    fn release(&mut self) -> Result<(), ReleaseError> {
        self.image = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.image.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn replays_still_image() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("still.png");
        RgbImage::from_pixel(8, 6, Rgb([10, 20, 30])).save(&path)?;

        let mut source = FileSource::new(&path)?;
        assert!(source.read().is_err());
        source.open()?;
        for _ in 0..3 {
            let frame = source.read()?.expect("frame");
            assert_eq!(frame.dimensions(), (8, 6));
            assert_eq!(frame.get_pixel(0, 0), &Rgb([10, 20, 30]));
        }
        assert_eq!(source.frames_read(), 3);

        assert_eq!(source.release(), Ok(()));
        assert_eq!(source.release(), Ok(()));
        assert!(!source.is_open());
        Ok(())
    }

    #[test]
    fn missing_file_fails_to_open() {
        let mut source = FileSource::new("/nonexistent/still.jpg").unwrap();
        assert!(source.open().is_err());
    }

    #[test]
    fn rejects_url_schemes() {
        assert!(FileSource::new("http://example.com/a.jpg").is_err());
        assert!(FileSource::new("").is_err());
    }
}
