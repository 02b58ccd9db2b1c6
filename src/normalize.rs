extern crate image;

use std::fmt;
use std::path::{Path, PathBuf};
use image::{DynamicImage, GenericImageView, GrayImage, ImageBuffer, Luma, Rgb};
use image::imageops::{self, FilterType};
use image::io::Reader;
use tracing::debug;

use crate::image_error::SimilarityError;


/// A single input image: where it lives and the name it is reported under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageRef {
	pub fpath: PathBuf,		//The path to the image
	pub name: String,		//Base filename, used when reporting matches
}

impl ImageRef {

	pub fn new<P: Into<PathBuf>>( fpath: P ) -> ImageRef {
		let fpath = fpath.into();
		//Fall back to the whole path for things like "/" or ".." that have no file name
		let name = match fpath.file_name() {
			Some(name) => name.to_string_lossy().into_owned(),
			None => fpath.display().to_string(),
		};
		return ImageRef { fpath, name };
	}
}

impl fmt::Display for ImageRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.fpath.display())
	}
}

/// A fixed size greyscale grid of integer intensities (0-255), stored row by row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage {
	width: u32,
	height: u32,
	pixels: Vec<i32>,
}

impl NormalizedImage {

	pub fn from_pixels( width: u32, height: u32, pixels: Vec<i32> ) -> Result<NormalizedImage, SimilarityError> {
		if pixels.len() != (width as usize) * (height as usize) {
			return Err(SimilarityError::ConfigurationError(format!("Error: Expected {}x{} pixels but got {}", width, height, pixels.len())));
		}
		return Ok(NormalizedImage { width, height, pixels });
	}

	pub fn width(&self) -> u32 {
		self.width
	}

	pub fn height(&self) -> u32 {
		self.height
	}

	pub fn pixels(&self) -> &[i32] {
		&self.pixels
	}

	//Sum of the absolute differences between each pixel of this and another grid (L1 distance)
	//Grids of different sizes can't be compared
	pub fn distance( &self, other: &NormalizedImage ) -> Result<u64, SimilarityError> {
		if (self.width, self.height) != (other.width, other.height) {
			return Err(SimilarityError::ConfigurationError(format!("Error: Can't compare a {}x{} grid with a {}x{} grid", self.width, self.height, other.width, other.height)));
		}

		let mut diff: u64 = 0;
		for (a, b) in self.pixels.iter().zip(other.pixels.iter()) {
			diff += (a - b).unsigned_abs() as u64;
		}

		return Ok(diff);
	}

	pub fn mean(&self) -> f32 {
		if self.pixels.is_empty() {
			return 0.0;
		}
		let total: i64 = self.pixels.iter().map(|p| *p as i64).sum();
		return total as f32 / self.pixels.len() as f32;
	}

	pub fn min_max(&self) -> (i32, i32) {
		let min = self.pixels.iter().copied().min().unwrap_or(0);
		let max = self.pixels.iter().copied().max().unwrap_or(0);
		return (min, max);
	}
}

/// Turns an image into a grid that can be compared against other grids.
pub trait ImageNormalizer: Send + Sync {
	fn normalize( &self, image: &ImageRef ) -> Result<NormalizedImage, SimilarityError>;
}

/// Greyscale, bicubic resize to a fixed size, integer intensities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GreyscaleNormalizer {
	pub width: u32,
	pub height: u32,
}

impl Default for GreyscaleNormalizer {
	fn default() -> Self {
		GreyscaleNormalizer::new( GreyscaleNormalizer::DEFAULT_SIZE )
	}
}

//Open an image from the specific path
//Guesses the format from the file contents rather than the extension
fn load_image_from_file( image_path: &Path ) -> Result<DynamicImage, SimilarityError> {

	let img = match Reader::open(image_path) {
		Ok(image) => image,
		Err(_) => {
			return Err(SimilarityError::FileError(format!("Error: Failed to read image file: {}", image_path.display())));
		},
	};

	let format_guessed = match img.with_guessed_format() {
		Ok( format_guessed ) => format_guessed,
		Err(_) => {
			return Err(SimilarityError::DecodeError(format!("Error: Failed to identify image file format {}", image_path.display())));
		}
	};

	let decoded_img = match format_guessed.decode() {
		Ok( decoded_img ) => decoded_img,
		Err(e) => {
			return Err(SimilarityError::DecodeError(format!("Error: Failed to correctly decode image: {} ({})", image_path.display(), e)));
		}
	};

	return Ok(decoded_img);
}

//ITU-R 601-2 luma in 16 bit fixed point, the same integer transform PIL's convert('L') applies.
//The weights sum to 65536 so a grey pixel maps to itself.
fn luma_601( rgb: &Rgb<u8> ) -> u8 {
	let [r, g, b] = rgb.0;
	let l = (r as u32) * 19595 + (g as u32) * 38470 + (b as u32) * 7471 + 0x8000;
	return (l >> 16) as u8;
}

impl GreyscaleNormalizer {

	pub const DEFAULT_SIZE: u32 = 16;	//Default width and height of the normalized grid

	//Catmull-Rom is the bicubic filter in the image crate
	pub const FILTER: FilterType = FilterType::CatmullRom;

	pub fn new( size: u32 ) -> GreyscaleNormalizer {
		GreyscaleNormalizer { width: size, height: size }
	}

	pub fn normalize_image( &self, img: &DynamicImage, fpath: &Path ) -> Result<NormalizedImage, SimilarityError> {
		let (width, height) = img.dimensions();
		if width == 0 || height == 0 {
			return Err(SimilarityError::EmptyImage(format!("Error: Image has no pixels: {}", fpath.display())));
		}

		let rgb = img.to_rgb8();
		let grey: GrayImage = ImageBuffer::from_fn(width, height, |x, y| Luma([luma_601(rgb.get_pixel(x, y))]));

		//Resizing 8 bit pixels gives whole numbers straight out of the filter,
		//so the conversion to i32 below never has a fraction to drop
		let scaled = imageops::resize(&grey, self.width, self.height, GreyscaleNormalizer::FILTER);

		let (scaled_width, scaled_height) = scaled.dimensions();
		if scaled_width != self.width || scaled_height != self.height {
			return Err(SimilarityError::DecodeError(format!("Error: Failed to resize image correctly: {}", fpath.display())));
		}

		let pixels: Vec<i32> = scaled.pixels().map(|p| i32::from(p.0[0])).collect();

		return NormalizedImage::from_pixels( self.width, self.height, pixels );
	}
}

impl ImageNormalizer for GreyscaleNormalizer {

	fn normalize( &self, image: &ImageRef ) -> Result<NormalizedImage, SimilarityError> {
		let img = load_image_from_file( &image.fpath )?;
		debug!(path = %image.fpath.display(), width = img.width(), height = img.height(), "decoded image");
		return self.normalize_image( &img, &image.fpath );
	}
}
