//! Image content resolution and preprocessing.
//!
//! An image item is either an HTTP(S) URL or an inline base64 payload,
//! optionally carrying a `data:image/...;base64,` header. Both decode to an
//! RGB `DynamicImage` before any model sees them. A single failing item
//! fails the whole batch.

use std::path::Path;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;
use tracing::debug;

use crate::artifacts::read_json;
use crate::error::EmbeddingError;

/// Where an image item comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource<'a> {
    Url(&'a str),
    Inline(&'a str),
}

impl<'a> ImageSource<'a> {
    pub fn parse(item: &'a str) -> Self {
        if item.starts_with("http://") || item.starts_with("https://") {
            ImageSource::Url(item)
        } else {
            ImageSource::Inline(item)
        }
    }
}

/// Fetches and decodes image items.
#[derive(Debug, Clone)]
pub struct ImageResolver {
    client: reqwest::Client,
    timeout: Duration,
}

impl ImageResolver {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Resolve every item in order, failing on the first bad one.
    pub async fn resolve_all(&self, items: &[String]) -> Result<Vec<DynamicImage>, EmbeddingError> {
        let mut images = Vec::with_capacity(items.len());
        for item in items {
            let image = match ImageSource::parse(item) {
                ImageSource::Url(url) => self.fetch(url).await?,
                ImageSource::Inline(payload) => decode_inline(payload)?,
            };
            images.push(image);
        }
        Ok(images)
    }

    async fn fetch(&self, url: &str) -> Result<DynamicImage, EmbeddingError> {
        let fetch_err = |reason: String| EmbeddingError::Fetch {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?
            .error_for_status()
            .map_err(|e| fetch_err(e.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;

        debug!(url, bytes = bytes.len(), "Fetched image");
        decode_bytes(&bytes)
    }
}

/// Decode a base64 payload, stripping a data-URI header when present.
pub fn decode_inline(payload: &str) -> Result<DynamicImage, EmbeddingError> {
    let data = if payload.starts_with("data:image") {
        payload
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| EmbeddingError::Decode("data URI without payload".to_string()))?
    } else {
        payload
    };

    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| EmbeddingError::Decode(format!("invalid base64: {}", e)))?;
    decode_bytes(&bytes)
}

fn decode_bytes(bytes: &[u8]) -> Result<DynamicImage, EmbeddingError> {
    let image = image::load_from_memory(bytes).map_err(|e| EmbeddingError::Decode(e.to_string()))?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}

/// CLIP image normalization constants.
pub const CLIP_IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Resize, center-crop and normalize images into model input tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePreprocessor {
    pub size: usize,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    /// Resize straight to `size x size`, ignoring aspect ratio, instead of
    /// shortest-edge resize plus center crop.
    pub squash: bool,
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self::clip(224)
    }
}

impl ImagePreprocessor {
    pub fn clip(size: usize) -> Self {
        Self {
            size,
            mean: CLIP_IMAGE_MEAN,
            std: CLIP_IMAGE_STD,
            squash: false,
        }
    }

    /// Read a transformers `preprocessor_config.json`.
    pub fn from_processor_config(path: &Path) -> Result<Self, EmbeddingError> {
        let value = read_json(path)?;
        let size = value
            .get("crop_size")
            .and_then(|c| c.as_u64().or_else(|| c.get("height").and_then(|h| h.as_u64())))
            .map(|s| s as usize)
            .unwrap_or(224);
        Ok(Self {
            size,
            mean: triple(value.get("image_mean")).unwrap_or(CLIP_IMAGE_MEAN),
            std: triple(value.get("image_std")).unwrap_or(CLIP_IMAGE_STD),
            squash: false,
        })
    }

    /// Read an `open_clip_config.json`.
    pub fn from_open_clip_config(path: &Path) -> Result<Self, EmbeddingError> {
        let value = read_json(path)?;
        let size = value
            .pointer("/model_cfg/vision_cfg/image_size")
            .and_then(|s| s.as_u64())
            .map(|s| s as usize)
            .unwrap_or(224);
        Ok(Self {
            size,
            mean: triple(value.pointer("/preprocess_cfg/mean")).unwrap_or(CLIP_IMAGE_MEAN),
            std: triple(value.pointer("/preprocess_cfg/std")).unwrap_or(CLIP_IMAGE_STD),
            squash: value
                .pointer("/preprocess_cfg/resize_mode")
                .and_then(|m| m.as_str())
                == Some("squash"),
        })
    }

    /// One image as a `(3, size, size)` tensor.
    pub fn preprocess(&self, image: &DynamicImage, device: &Device) -> Result<Tensor, EmbeddingError> {
        let size = self.size as u32;
        let rgb = if self.squash {
            image.resize_exact(size, size, FilterType::CatmullRom).to_rgb8()
        } else {
            let (w, h) = (image.width().max(1), image.height().max(1));

            // Resize shortest edge to target while preserving aspect ratio
            let scale = size as f32 / w.min(h) as f32;
            let new_w = ((w as f32) * scale).round().max(size as f32) as u32;
            let new_h = ((h as f32) * scale).round().max(size as f32) as u32;
            let resized = image.resize_exact(new_w, new_h, FilterType::CatmullRom);

            // Center crop to (size, size)
            let start_x = (new_w - size) / 2;
            let start_y = (new_h - size) / 2;
            resized.crop_imm(start_x, start_y, size, size).to_rgb8()
        };

        let plane = self.size * self.size;
        let mut data = vec![0f32; 3 * plane];
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let offset = y as usize * self.size + x as usize;
            for c in 0..3 {
                data[c * plane + offset] = (pixel[c] as f32 / 255.0 - self.mean[c]) / self.std[c];
            }
        }

        Ok(Tensor::from_vec(data, (3, self.size, self.size), device)?)
    }

    /// Stack a batch into `(batch, 3, size, size)`.
    pub fn preprocess_batch(
        &self,
        images: &[DynamicImage],
        device: &Device,
    ) -> Result<Tensor, EmbeddingError> {
        let tensors = images
            .iter()
            .map(|image| self.preprocess(image, device))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Tensor::stack(&tensors, 0)?)
    }
}

fn triple(value: Option<&serde_json::Value>) -> Option<[f32; 3]> {
    let arr = value?.as_array()?;
    if arr.len() != 3 {
        return None;
    }
    let mut out = [0f32; 3];
    for (slot, v) in out.iter_mut().zip(arr) {
        *slot = v.as_f64()? as f32;
    }
    Some(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    /// Base64 PNG of a single pixel.
    pub(crate) fn one_pixel_png_base64(color: [u8; 3]) -> String {
        let img = RgbImage::from_pixel(1, 1, Rgb(color));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        STANDARD.encode(buf.into_inner())
    }

    #[test]
    fn test_parse_source() {
        assert_eq!(
            ImageSource::parse("https://cdn.example.com/a.png"),
            ImageSource::Url("https://cdn.example.com/a.png")
        );
        assert!(matches!(ImageSource::parse("iVBORw0"), ImageSource::Inline(_)));
    }

    #[test]
    fn test_decode_inline_with_and_without_header() {
        let b64 = one_pixel_png_base64([255, 0, 0]);
        let plain = decode_inline(&b64).unwrap();
        assert_eq!((plain.width(), plain.height()), (1, 1));

        let with_header = decode_inline(&format!("data:image/png;base64,{}", b64)).unwrap();
        assert_eq!(with_header.to_rgb8().get_pixel(0, 0).0, [255, 0, 0]);
    }

    #[test]
    fn test_decode_inline_rejects_garbage() {
        assert!(matches!(
            decode_inline("not base64 at all!!"),
            Err(EmbeddingError::Decode(_))
        ));
        // Valid base64, not an image
        assert!(matches!(
            decode_inline(&STANDARD.encode(b"hello")),
            Err(EmbeddingError::Decode(_))
        ));
    }

    #[test]
    fn test_preprocess_shape_and_normalization() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 2, Rgb([255, 255, 255])));
        let pre = ImagePreprocessor {
            size: 2,
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
            squash: false,
        };
        let tensor = pre.preprocess(&image, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[3, 2, 2]);
        let values: Vec<f32> = tensor.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (v - 1.0).abs() < 1e-5));

        let batch = pre
            .preprocess_batch(&[image.clone(), image], &Device::Cpu)
            .unwrap();
        assert_eq!(batch.dims(), &[2, 3, 2, 2]);
    }

    #[test]
    fn test_open_clip_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("open_clip_config.json");
        std::fs::write(
            &path,
            r#"{"model_cfg":{"embed_dim":768,"vision_cfg":{"image_size":256}},
                "preprocess_cfg":{"mean":[0.5,0.5,0.5],"std":[0.5,0.5,0.5],"resize_mode":"squash"}}"#,
        )
        .unwrap();
        let pre = ImagePreprocessor::from_open_clip_config(&path).unwrap();
        assert_eq!(pre.size, 256);
        assert_eq!(pre.mean, [0.5, 0.5, 0.5]);
        assert!(pre.squash);
    }

    #[test]
    fn test_squash_keeps_whole_image() {
        // Left half black, right half white; a center crop of a 4x2 image
        // to 2x2 would drop the outer columns of both halves.
        let mut rgb = RgbImage::from_pixel(4, 2, Rgb([0, 0, 0]));
        for y in 0..2 {
            for x in 2..4 {
                rgb.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        let pre = ImagePreprocessor {
            size: 2,
            mean: [0.0, 0.0, 0.0],
            std: [1.0, 1.0, 1.0],
            squash: true,
        };
        let tensor = pre
            .preprocess(&DynamicImage::ImageRgb8(rgb), &Device::Cpu)
            .unwrap();
        let red: Vec<Vec<f32>> = tensor.get(0).unwrap().to_vec2().unwrap();
        assert!(red[0][0] < 0.5);
        assert!(red[0][1] > 0.5);
    }

    #[tokio::test]
    async fn test_fetch_not_found_fails_batch() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let resolver = ImageResolver::new(Duration::from_secs(5));
        let items = vec![
            one_pixel_png_base64([0, 0, 0]),
            format!("{}/missing.png", server.uri()),
        ];
        let result = resolver.resolve_all(&items).await;
        assert!(matches!(result, Err(EmbeddingError::Fetch { .. })));
    }

    #[tokio::test]
    async fn test_fetch_ok() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let png = STANDARD.decode(one_pixel_png_base64([1, 2, 3])).unwrap();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png))
            .mount(&server)
            .await;

        let resolver = ImageResolver::new(Duration::from_secs(5));
        let images = resolver
            .resolve_all(&[format!("{}/ok.png", server.uri())])
            .await
            .unwrap();
        assert_eq!(images[0].to_rgb8().get_pixel(0, 0).0, [1, 2, 3]);
    }
}
