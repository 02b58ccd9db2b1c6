use thiserror::Error;


/// SimilarityError enumerates all possible errors returned while comparing images.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimilarityError {

	//Probably retrieving the image file
	#[error("{0}")]
	FileError(String),

	//The image library couldn't decode the file as an image
	#[error("{0}")]
	DecodeError(String),

	//Decoded fine but there are no pixels to normalize
	#[error("{0}")]
	EmptyImage(String),

	//Invalid limit, size, thread count or debug arguments
	#[error("{0}")]
	ConfigurationError(String),
}

impl SimilarityError {

	//True for the errors that mean a single image could not be turned into a grid
	pub fn is_decode_class(&self) -> bool {
		return !matches!(self, SimilarityError::ConfigurationError(_));
	}
}
