//! Attachment relay: resolves URLs and data URIs into bytes and uploads them
//! to the vendor.

use crate::auth::TokenCache;
use crate::cli::{FilesConfig, UpstreamConfig};
use crate::providers::{FileReference, FileUpload, GlmUpstream, ProviderError, UploadTarget};
use base64::{engine::general_purpose, Engine as _};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use secrecy::ExposeSecret;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, info};

static DATA_URI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^data:([\w.+-]+/[\w.+-]+);base64,(.+)$").unwrap());

/// Where attachment bytes come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource<'a> {
    DataUri { mime: &'a str, payload: &'a str },
    Url(&'a str),
}

impl<'a> FileSource<'a> {
    pub fn parse(source: &'a str) -> Self {
        match DATA_URI.captures(source) {
            Some(caps) => match (caps.get(1), caps.get(2)) {
                (Some(mime), Some(payload)) => FileSource::DataUri {
                    mime: mime.as_str(),
                    payload: payload.as_str(),
                },
                _ => FileSource::Url(source),
            },
            None => FileSource::Url(source),
        }
    }
}

/// File extension for a MIME type, preferring the subtype name
fn extension_for(mime: &str) -> String {
    let subtype = mime.split('/').nth(1).unwrap_or_default();
    match mime_guess::get_mime_extensions_str(mime) {
        Some(exts) if exts.contains(&subtype) => subtype.to_string(),
        Some(exts) if !exts.is_empty() => exts[0].to_string(),
        _ => "bin".to_string(),
    }
}

/// Last path segment of a URL, used as the upload name
fn filename_from_url(source: &str) -> String {
    url::Url::parse(source)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(|s| s.to_string()))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "file".to_string())
}

/// Geometry of the video reference image: scale to `max_width`, then keep
/// at most `max_height` rows around the vertical centre.
/// Returns `(scaled_height, top, crop_height)`.
pub fn video_crop_geometry(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32, u32) {
    let scaled_height = ((height as f64) * (max_width as f64) / (width.max(1) as f64)).round().max(1.0) as u32;
    let crop_height = scaled_height.min(max_height);
    let top = (scaled_height - crop_height) / 2;
    (scaled_height, top, crop_height)
}

pub struct FileRelay {
    client: Client,
    files: FilesConfig,
    upstream_config: UpstreamConfig,
    upstream: Arc<dyn GlmUpstream>,
    tokens: TokenCache,
}

impl FileRelay {
    pub fn new(
        files: &FilesConfig,
        upstream_config: &UpstreamConfig,
        upstream: Arc<dyn GlmUpstream>,
        tokens: TokenCache,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: Client::builder().build()?,
            files: files.clone(),
            upstream_config: upstream_config.clone(),
            upstream,
            tokens,
        })
    }

    /// Resolve an attachment and upload it to the vendor
    pub async fn upload(
        &self,
        source: &str,
        refresh_token: &str,
        for_video_image: bool,
    ) -> Result<FileReference, ProviderError> {
        let mut file = self.fetch(source).await?;
        let target = if for_video_image {
            file = self.prepare_video_image(file)?;
            UploadTarget::VideoImage
        } else {
            UploadTarget::Chat
        };

        info!("📎 Uploading {} ({} bytes)", file.filename, file.bytes.len());
        let token = self.tokens.acquire(refresh_token).await?;
        let result = self
            .upstream
            .upload_file(token.expose_secret(), file, target)
            .await;
        if let Err(e) = &result {
            if e.is_auth_failure() {
                self.tokens.invalidate(refresh_token);
            }
        }
        result
    }

    /// Upload several attachments concurrently, keeping their order
    pub async fn upload_all(&self, sources: &[&str], refresh_token: &str) -> Result<Vec<FileReference>, ProviderError> {
        if !sources.is_empty() {
            info!("📎 Uploading {} attachment(s) for this request", sources.len());
        }
        futures::future::try_join_all(sources.iter().map(|source| self.upload(source, refresh_token, false))).await
    }

    /// Validate a source and load its bytes
    pub async fn fetch(&self, source: &str) -> Result<FileUpload, ProviderError> {
        match FileSource::parse(source) {
            FileSource::DataUri { mime, payload } => {
                let bytes = general_purpose::STANDARD
                    .decode(payload.trim())
                    .map_err(|e| ProviderError::FileInvalid(format!("base64 payload is not valid: {}", e)))?;
                self.check_size(bytes.len() as u64, "data URI")?;
                Ok(FileUpload {
                    filename: format!("{}.{}", uuid::Uuid::new_v4(), extension_for(mime)),
                    mime: mime.to_string(),
                    bytes,
                })
            }
            FileSource::Url(url) => {
                self.probe(url).await?;
                let bytes = self.download(url).await?;
                let filename = filename_from_url(url);
                let mime = mime_guess::from_path(&filename)
                    .first_raw()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                Ok(FileUpload { filename, mime, bytes })
            }
        }
    }

    fn check_size(&self, size: u64, what: &str) -> Result<(), ProviderError> {
        if size > self.files.max_size_bytes {
            return Err(ProviderError::FileInvalid(format!(
                "{} exceeds the {} byte limit",
                what, self.files.max_size_bytes
            )));
        }
        Ok(())
    }

    /// Metadata-only probe of a remote file
    async fn probe(&self, url: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .head(url)
            .timeout(self.upstream_config.auth_timeout())
            .send()
            .await
            .map_err(|e| ProviderError::FileInvalid(format!("File {} is not reachable: {}", url, e)))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(ProviderError::FileInvalid(format!(
                "File {} is not valid: [{}]",
                url, status
            )));
        }
        let length = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if let Some(length) = length {
            self.check_size(length, url)?;
        }
        Ok(())
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ProviderError> {
        let mut response = self
            .client
            .get(url)
            .timeout(self.upstream_config.transfer_timeout())
            .send()
            .await
            .map_err(|e| ProviderError::FileInvalid(format!("File {} is not reachable: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(ProviderError::FileInvalid(format!(
                "File {} download failed: [{}]",
                url,
                response.status()
            )));
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ProviderError::FileInvalid(format!("File {} download failed: {}", url, e)))?
        {
            self.check_size((bytes.len() + chunk.len()) as u64, url)?;
            bytes.extend_from_slice(&chunk);
        }
        debug!("Downloaded {} bytes from {}", bytes.len(), url);
        Ok(bytes)
    }

    /// Scale and centre-crop an image for video generation
    pub fn prepare_video_image(&self, file: FileUpload) -> Result<FileUpload, ProviderError> {
        let source_format = image::guess_format(&file.bytes).unwrap_or(ImageFormat::Png);
        let image = image::load_from_memory(&file.bytes)
            .map_err(|e| ProviderError::FileInvalid(format!("not a readable image: {}", e)))?;

        let max_width = self.files.video_image_max_width;
        let (scaled_height, top, crop_height) = video_crop_geometry(
            image.width(),
            image.height(),
            max_width,
            self.files.video_image_max_height,
        );
        let cropped = image
            .resize_exact(max_width, scaled_height, FilterType::Lanczos3)
            .crop_imm(0, top, max_width, crop_height);

        let (bytes, format) = match encode(&cropped, source_format) {
            Ok(bytes) => (bytes, source_format),
            Err(_) => (encode(&cropped, ImageFormat::Png)?, ImageFormat::Png),
        };

        let stem = file
            .filename
            .rsplit_once('.')
            .map(|(stem, _)| stem.to_string())
            .unwrap_or(file.filename);
        let ext = format.extensions_str().first().copied().unwrap_or("png");
        Ok(FileUpload {
            filename: format!("{}.{}", stem, ext),
            mime: format.to_mime_type().to_string(),
            bytes,
        })
    }
}

fn encode(image: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, ProviderError> {
    let mut buffer = Cursor::new(Vec::new());
    let result = match format {
        // JPEG has no alpha channel
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()).write_to(&mut buffer, format),
        _ => image.write_to(&mut buffer, format),
    };
    result.map_err(|e| ProviderError::FileInvalid(format!("image encoding failed: {}", e)))?;
    Ok(buffer.into_inner())
}
