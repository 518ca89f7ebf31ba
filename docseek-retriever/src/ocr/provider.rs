//! Text recognition backends.

use anyhow::Result;
use async_trait::async_trait;
use docseek_context::OcrRegion;
use std::path::Path;

/// Recognizes the text of one region of a file.
#[async_trait]
pub trait OcrProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Text found in `region` of the file at `path`. An empty string means
    /// the region was readable but held no text.
    async fn recognize(&self, path: &Path, region: &OcrRegion) -> Result<String>;
}

/// Tesseract language string for a list of language codes (`eng+deu`).
pub fn tesseract_languages(languages: &[String]) -> String {
    if languages.is_empty() {
        "eng".to_string()
    } else {
        languages.join("+")
    }
}

/// Tesseract through `leptess`, for whole-file image regions.
#[cfg(feature = "tesseract")]
#[derive(Debug, Clone)]
pub struct TesseractOcrProvider {
    languages: String,
}

#[cfg(feature = "tesseract")]
impl TesseractOcrProvider {
    pub fn new(languages: &[String]) -> Self {
        Self {
            languages: tesseract_languages(languages),
        }
    }

    fn recognize_bytes(languages: &str, image_data: &[u8]) -> Result<String> {
        use anyhow::Context;
        use std::io::Cursor;

        let img = image::load_from_memory(image_data).context("Failed to load image")?;

        // leptess reads PNG from memory
        let mut png_data = Vec::new();
        img.write_to(&mut Cursor::new(&mut png_data), image::ImageFormat::Png)
            .context("Failed to convert image")?;

        let mut lt = leptess::LepTess::new(None, languages)
            .map_err(|e| anyhow::anyhow!("Failed to initialize Tesseract: {e}"))?;
        lt.set_image_from_mem(&png_data)
            .map_err(|e| anyhow::anyhow!("Failed to set image for OCR: {e}"))?;
        lt.get_utf8_text()
            .map_err(|e| anyhow::anyhow!("OCR failed: {e}"))
    }
}

#[cfg(feature = "tesseract")]
#[async_trait]
impl OcrProvider for TesseractOcrProvider {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn recognize(&self, path: &Path, region: &OcrRegion) -> Result<String> {
        use anyhow::Context;

        if let Some(page) = region.page {
            anyhow::bail!(
                "Tesseract provider cannot render page {} of {}",
                page,
                path.display()
            );
        }
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let languages = self.languages.clone();
        tokio::task::spawn_blocking(move || Self::recognize_bytes(&languages, &bytes))
            .await
            .context("OCR task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tesseract_languages() {
        assert_eq!(tesseract_languages(&[]), "eng");
        assert_eq!(
            tesseract_languages(&["eng".to_string(), "deu".to_string()]),
            "eng+deu"
        );
    }

    #[cfg(feature = "tesseract")]
    #[tokio::test]
    async fn test_invalid_image_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.png");
        tokio::fs::write(&path, b"not valid image data").await?;

        let provider = TesseractOcrProvider::new(&["eng".to_string()]);
        let err = provider
            .recognize(&path, &OcrRegion::whole_file())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("Failed to load image"));
        Ok(())
    }
}
