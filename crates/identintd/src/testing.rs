//! Test doubles shared by the server's unit tests.

use identint_core::{
    BoundingBox, FaceBackend, FaceEncoding, FaceError, RgbImage, ENCODING_DIM,
};
use std::path::{Path, PathBuf};

/// Red channel value that makes [`ColorBackend`] panic, killing the engine thread.
pub const CRASH_FACES: u8 = 255;

/// Backend driven by pixel colour: the red channel of the top-left pixel is
/// the number of faces, the green channel picks the encoding's unit axis.
pub struct ColorBackend;

impl FaceBackend for ColorBackend {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, FaceError> {
        let red = image.get_pixel(0, 0)[0];
        if red == CRASH_FACES {
            panic!("backend crashed");
        }
        let count = red as usize;
        Ok((0..count)
            .map(|i| BoundingBox {
                x: i as f32 * 10.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
                confidence: 0.9,
                landmarks: None,
            })
            .collect())
    }

    fn encode(
        &mut self,
        image: &RgbImage,
        _face: &BoundingBox,
    ) -> Result<FaceEncoding, FaceError> {
        Ok(axis_encoding(image.get_pixel(0, 0)[1] as usize))
    }
}

pub fn axis_encoding(axis: usize) -> FaceEncoding {
    let mut values = vec![0.0; ENCODING_DIM];
    values[axis % ENCODING_DIM] = 1.0;
    FaceEncoding::new(values).unwrap()
}

/// PNG bytes whose pixels encode `faces` and `axis` for [`ColorBackend`].
pub fn png_bytes(faces: u8, axis: u8) -> Vec<u8> {
    let image = RgbImage::from_pixel(8, 8, image::Rgb([faces, axis, 0]));
    let mut bytes = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, image::ImageFormat::Png)
        .unwrap();
    bytes.into_inner()
}

pub fn write_png(dir: &Path, name: &str, faces: u8, axis: u8) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, png_bytes(faces, axis)).unwrap();
    path
}
