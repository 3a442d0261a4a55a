//! Image byte sources, decoding and resizing

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::imageops::FilterType;
use image::DynamicImage;
use reqwest::{StatusCode, Url};
use tracing::debug;

use super::{ImageError, ImageSize};

/// Source of raw image bytes
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, ImageError>;
}

/// Fetches `file://` URLs from disk and `http(s)://` URLs over the network.
///
/// Requests are bounded by the client timeout and never retried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, ImageError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("logger/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ImageError::network)?;
        Ok(Self { client })
    }

    async fn fetch_file(&self, url: &Url) -> Result<Vec<u8>, ImageError> {
        let path = url
            .to_file_path()
            .map_err(|_| ImageError::RequestBad(format!("Not a local file URL: {url}")))?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ImageError::ImageNotFound,
            _ => ImageError::network(e),
        })
    }

    async fn fetch_http(&self, url: &Url) -> Result<Vec<u8>, ImageError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(ImageError::network)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(ImageError::ImageNotFound);
        }
        if !status.is_success() {
            return Err(ImageError::RequestBad(format!("HTTP {status} for {url}")));
        }

        let bytes = response.bytes().await.map_err(ImageError::network)?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, ImageError> {
        debug!(%url, "Fetching image");
        match url.scheme() {
            "file" => self.fetch_file(url).await,
            "http" | "https" => self.fetch_http(url).await,
            scheme => Err(ImageError::RequestBad(format!(
                "Unsupported URL scheme '{scheme}'"
            ))),
        }
    }
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, ImageError> {
    image::load_from_memory(bytes).map_err(|e| {
        debug!(error = %e, "Image failed to decode");
        ImageError::ImageMalformed
    })
}

/// Scale to fit within `size`, keeping the aspect ratio
pub fn resize(image: &DynamicImage, size: ImageSize) -> Result<DynamicImage, ImageError> {
    if size.width == 0 || size.height == 0 || image.width() == 0 || image.height() == 0 {
        return Err(ImageError::ImageMalformed);
    }
    Ok(image.resize(size.width, size.height, FilterType::Lanczos3))
}

/// Decode and optionally resize off the async workers
pub(super) async fn decode_blocking(bytes: Vec<u8>) -> Result<DynamicImage, ImageError> {
    tokio::task::spawn_blocking(move || decode(&bytes))
        .await
        .map_err(|_| ImageError::Unknown)?
}

pub(super) async fn resize_blocking(
    image: Arc<DynamicImage>,
    size: ImageSize,
) -> Result<DynamicImage, ImageError> {
    tokio::task::spawn_blocking(move || resize(&image, size))
        .await
        .map_err(|_| ImageError::Unknown)?
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;
    use tempfile::TempDir;

    /// PNG bytes of a solid `width` x `height` image
    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            width,
            height,
            Rgba([200, 30, 30, 255]),
        ));
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    #[test]
    fn test_decode() {
        let image = decode(&png_bytes(6, 3)).unwrap();
        assert_eq!((image.width(), image.height()), (6, 3));

        assert!(matches!(decode(b"not an image"), Err(ImageError::ImageMalformed)));
    }

    #[test]
    fn test_resize_keeps_aspect_ratio() {
        let image = decode(&png_bytes(40, 20)).unwrap();
        let resized = resize(&image, ImageSize::new(10, 10)).unwrap();
        assert_eq!((resized.width(), resized.height()), (10, 5));

        assert!(matches!(
            resize(&image, ImageSize::new(0, 10)),
            Err(ImageError::ImageMalformed)
        ));
    }

    #[tokio::test]
    async fn test_fetch_file_url() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("1.png");
        std::fs::write(&path, png_bytes(2, 2)).unwrap();

        let fetcher = HttpFetcher::new(Duration::from_secs(1)).unwrap();
        let url = Url::from_file_path(&path).unwrap();
        let bytes = fetcher.fetch(&url).await.unwrap();
        assert_eq!(bytes, png_bytes(2, 2));

        let missing = Url::from_file_path(temp_dir.path().join("missing.png")).unwrap();
        assert!(matches!(
            fetcher.fetch(&missing).await,
            Err(ImageError::ImageNotFound)
        ));
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let fetcher = HttpFetcher::new(Duration::from_secs(1)).unwrap();
        let url = Url::parse("ftp://img.test/a.png").unwrap();
        assert!(matches!(
            fetcher.fetch(&url).await,
            Err(ImageError::RequestBad(_))
        ));
    }
}
