//! Image preparation for the ImageNet-trained models, in both directions:
//! files to normalized tensors, and synthesized tensors back to files.

use image::{GenericImageView, GrayImage, RgbImage};
use ndarray::{Array2, Array3, Array4, ArrayView3, Axis, ShapeError};

/// Per-channel mean of the ImageNet dataset.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// Per-channel standard deviation of the ImageNet dataset.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Preprocess a single image for the ImageNet dataset.
///
/// It should be used only on a single image.
/// It will always add a batch dimension equal to 1 to the result.
pub fn preprocessing(image: &image::DynamicImage) -> Array4<f32> {
    // call single_preprocessing on the image and add a batch dimension
    single_preprocessing(image).insert_axis(Axis(0))
}

/// Preprocess an image batch for the ImageNet dataset.
///
/// It should be used on a batch of images.
/// It will add a batch dimension equal to the number of images to the result.
pub fn batch_preprocessing(images: &[image::DynamicImage]) -> Result<Array4<f32>, ShapeError> {
    // call preprocessing on each image and create an array4 from the results
    Array4::from_shape_vec(
        (images.len(), 3, 224, 224),
        images.iter().flat_map(single_preprocessing).collect(),
    )
}

/// Preprocess an image without cropping, resizing its shorter side to
/// `target_size` while keeping the aspect ratio.
///
/// Style transfer feeds the convolutional trunk directly, so any spatial
/// size works; classification should keep using [`preprocessing`].
pub fn preprocessing_scaled(image: &image::DynamicImage, target_size: u32) -> Array4<f32> {
    let resized = resize_with_fixed_aspect_ratio(image, target_size);
    let (width, height) = resized.dimensions();
    normalize_rgb(&resized, width, height).insert_axis(Axis(0))
}

/// Postprocess the output of the model.
///
/// This will apply a softmax function to the scores.
pub fn postprocessing(tensor: Array2<f32>) -> Array2<f32> {
    // softmax on the last axis of the tensor
    let tensor = tensor.mapv(|x| x.exp());

    tensor.clone() / tensor.sum_axis(Axis(1)).insert_axis(Axis(1))
}

/// Converts one element of a normalized batch back into an 8-bit RGB image.
///
/// Inverts the ImageNet normalization and clamps to the displayable range.
pub fn deprocess(batch: &Array4<f32>, index: usize) -> RgbImage {
    let tensor: ArrayView3<f32> = batch.index_axis(Axis(0), index);
    let (height, width) = (tensor.shape()[1], tensor.shape()[2]);

    let mut image = RgbImage::new(width as u32, height as u32);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let mut rgb = [0u8; 3];
        for (c, value) in rgb.iter_mut().enumerate() {
            let v = tensor[[c, y as usize, x as usize]] * IMAGENET_STD[c] + IMAGENET_MEAN[c];
            *value = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        }
        *pixel = image::Rgb(rgb);
    }
    image
}

/// Renders a non-negative saliency map as a grayscale image, scaled by its
/// maximum.
pub fn saliency_to_image(map: &Array2<f32>) -> GrayImage {
    let max = map.iter().cloned().fold(0.0_f32, f32::max);
    let scale = if max > 0.0 { 255.0 / max } else { 0.0 };

    let (height, width) = (map.shape()[0], map.shape()[1]);
    let mut image = GrayImage::new(width as u32, height as u32);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let v = (map[[y as usize, x as usize]] * scale).round().clamp(0.0, 255.0);
        *pixel = image::Luma([v as u8]);
    }
    image
}

/// The interval of normalized values corresponding to displayable pixels,
/// per color channel.
pub fn valid_pixel_range(channel: usize) -> (f32, f32) {
    let mean = IMAGENET_MEAN[channel];
    let std = IMAGENET_STD[channel];
    ((0.0 - mean) / std, (1.0 - mean) / std)
}

/// Preprocess a batch element for the ImageNet dataset.
fn single_preprocessing(image: &image::DynamicImage) -> Array3<f32> {
    // resize image to 256x256
    let image = resize_with_fixed_aspect_ratio(image, 256);
    // crop image to 224x224 from center
    let cropped_image_view = crop_image_from_center(&image, 224, 224);
    normalize_rgb(&cropped_image_view, 224, 224)
}

/// Converts an RGB image into a normalized `[3, height, width]` tensor.
fn normalize_rgb(image: &image::DynamicImage, width: u32, height: u32) -> Array3<f32> {
    let tensor = Array3::from_shape_fn((height as usize, width as usize, 3), |(y, x, c)| {
        image.get_pixel(x as u32, y as u32)[c] as f32
    });

    // transpose the image from [height, width, 3] to [3, height, width]
    let tensor = tensor.permuted_axes([2, 0, 1]);

    // normalize using the mean and std of the ImageNet dataset
    Array3::from_shape_fn(
        (3, height as usize, width as usize),
        |(c, y, x)| (tensor[[c, y, x]] / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c],
    )
}

/// Crop an image from its center
fn crop_image_from_center(
    image: &image::DynamicImage,
    crop_w: u32,
    crop_h: u32,
) -> image::DynamicImage {
    let (width, height) = image.dimensions();
    let start_x = width / 2 - crop_w / 2;
    let start_y = height / 2 - crop_h / 2;
    image.crop_imm(start_x, start_y, crop_w, crop_h)
}

/// According to the documentation, you should resize so that the shorter side is 256 (min_dimension), maintaining aspect ratio
fn resize_with_fixed_aspect_ratio(
    image: &image::DynamicImage,
    min_dimension: u32,
) -> image::DynamicImage {
    let (width, height) = image.dimensions();
    let ratio = min_dimension as f32 / u32::min(width, height) as f32;
    let new_width = if width > height {
        (ratio * width as f32).round() as u32
    } else {
        min_dimension
    };
    let new_height = if height > width {
        min_dimension
    } else {
        (ratio * height as f32).round() as u32
    };
    image.resize_exact(new_width, new_height, image::imageops::FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn solid_image(width: u32, height: u32, rgb: [u8; 3]) -> image::DynamicImage {
        let mut img = RgbImage::new(width, height);
        for pixel in img.pixels_mut() {
            *pixel = image::Rgb(rgb);
        }
        image::DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn preprocessing_yields_classifier_input_shape() {
        let tensor = preprocessing(&solid_image(320, 240, [128, 128, 128]));
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);
    }

    #[test]
    fn preprocessing_normalizes_with_imagenet_stats() {
        let tensor = preprocessing(&solid_image(256, 256, [255, 0, 0]));
        let expected_r = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        let expected_g = (0.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1];
        assert!((tensor[[0, 0, 100, 100]] - expected_r).abs() < 1e-5);
        assert!((tensor[[0, 1, 100, 100]] - expected_g).abs() < 1e-5);
    }

    #[test]
    fn scaled_preprocessing_keeps_aspect_ratio() {
        let tensor = preprocessing_scaled(&solid_image(400, 200, [10, 20, 30]), 100);
        assert_eq!(tensor.shape(), &[1, 3, 100, 200]);
    }

    #[test]
    fn deprocess_inverts_normalization() {
        let image = solid_image(260, 260, [200, 60, 20]);
        let tensor = preprocessing(&image);
        let restored = deprocess(&tensor, 0);
        let pixel = restored.get_pixel(10, 10);
        // resizing blurs nothing on a solid image, so the roundtrip is exact
        assert_eq!(pixel.0, [200, 60, 20]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let scores = arr2(&[[1.0_f32, 2.0, 3.0], [0.0, 0.0, 0.0]]);
        let probs = postprocessing(scores);
        for row in probs.outer_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert!(probs[[0, 2]] > probs[[0, 0]]);
    }

    #[test]
    fn saliency_rendering_scales_to_full_range() {
        let map = arr2(&[[0.0_f32, 0.5], [1.0, 2.0]]);
        let rendered = saliency_to_image(&map);
        assert_eq!(rendered.get_pixel(0, 0).0, [0]);
        assert_eq!(rendered.get_pixel(1, 1).0, [255]);
    }
}
