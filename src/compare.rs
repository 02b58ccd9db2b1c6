use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};
use threadpool::ThreadPool;
use indicatif::ProgressBar;
use tracing::{debug, info};

use crate::image_error::SimilarityError;
use crate::normalize::{ImageNormalizer, ImageRef, NormalizedImage};


/// What to do when one of the images can't be normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
	/// Skip every pair involving the broken image and list it at the end.
	Isolate,
	/// Stop the run at the first broken image.
	Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareOptions {
	pub limit : u64,
	pub num_threads : u32,
	pub failure_policy : FailurePolicy,
	pub show_progress : bool,
}

impl CompareOptions {
	pub const DEFAULT_LIMIT: u64 = 6000;		//Default L1 distance at or under which two images are declared similar
	pub const DEFAULT_NUM_THREADS: u32 = 4;
}

impl Default for CompareOptions {
	fn default() -> Self {
		CompareOptions {
			limit: CompareOptions::DEFAULT_LIMIT,
			num_threads: CompareOptions::DEFAULT_NUM_THREADS,
			failure_policy: FailurePolicy::Isolate,
			show_progress: false,
		}
	}
}

/// A pair of images whose distance is within the limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonResult {
	pub first: ImageRef,
	pub second: ImageRef,
	pub distance: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedImage {
	pub image: ImageRef,
	pub error: SimilarityError,
}

#[derive(Debug, Clone, Default)]
pub struct CompareSummary {
	pub num_images: usize,
	pub pairs_evaluated: u64,
	pub pairs_skipped: u64,
	pub matches: u64,
	pub failures: Vec<FailedImage>,
	pub elapsed: Duration,
}

/// Every unordered pair of positions in 0..len exactly once: (1,0), (2,0), (2,1), (3,0) ...
#[derive(Debug, Clone)]
pub struct PairIndices {
	len: usize,
	i: usize,
	j: usize,
}

pub fn pair_indices( len: usize ) -> PairIndices {
	PairIndices { len, i: 1, j: 0 }
}

impl Iterator for PairIndices {
	type Item = (usize, usize);

	fn next(&mut self) -> Option<(usize, usize)> {
		if self.i >= self.len {
			return None;
		}
		let pair = (self.i, self.j);
		self.j += 1;
		if self.j >= self.i {
			self.i += 1;
			self.j = 0;
		}
		return Some(pair);
	}

	fn size_hint(&self) -> (usize, Option<usize>) {
		if self.i >= self.len {
			return (0, Some(0));
		}
		//Pairs left in the current row plus all the complete rows after it
		let rest_of_row = self.i - self.j;
		let later_rows = (self.len * (self.len - 1) / 2) - (self.i * (self.i + 1) / 2);
		let remaining = rest_of_row + later_rows;
		return (remaining, Some(remaining));
	}
}

impl ExactSizeIterator for PairIndices {}

type CacheEntry = Result<Arc<NormalizedImage>, SimilarityError>;

/// Normalized grids (or the reason there isn't one) for a single comparison run.
/// Each image is normalized at most once, failures included.
#[derive(Debug, Default)]
pub struct NormalizationCache {
	entries: HashMap<ImageRef, CacheEntry>,
}

impl NormalizationCache {

	pub fn new() -> NormalizationCache {
		NormalizationCache { entries: HashMap::new() }
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn get( &self, image: &ImageRef ) -> Option<&CacheEntry> {
		self.entries.get(image)
	}

	pub fn get_or_normalize<N: ImageNormalizer + ?Sized>( &mut self, image: &ImageRef, normalizer: &N ) -> CacheEntry {
		if let Some(entry) = self.entries.get(image) {
			return entry.clone();
		}

		let outcome = normalizer.normalize(image).map(Arc::new);
		self.entries.insert( image.clone(), outcome.clone() );
		return outcome;
	}

	//Normalize every image not already cached on n threads.
	//Each distinct image is handed to the pool exactly once and the bar counts only those.
	pub fn prefetch<N: ImageNormalizer + ?Sized + 'static>( &mut self, images: &[ImageRef], normalizer: &Arc<N>, num_threads: u32, progress_bar: &ProgressBar ) -> usize {

		let mut queued = HashSet::new();
		let pending: Vec<ImageRef> = images.iter()
			.filter(|image| !self.entries.contains_key(*image) && queued.insert(*image))
			.cloned()
			.collect();

		if pending.is_empty() {
			return 0;
		}

		let num_pending = pending.len();
		progress_bar.set_length( num_pending as u64 );

		let num_threads = (num_threads.max(1) as usize).min(pending.len());
		debug!(images = pending.len(), threads = num_threads, "prefetching normalized images");

		let pool = ThreadPool::new(num_threads);

		let (tx, rx) = channel();
		for image in pending {
			let tx = tx.clone();
			let normalizer = Arc::clone(normalizer);
			pool.execute(move|| {
				let outcome = normalizer.normalize(&image).map(Arc::new);
				//The receiver only goes away if the run itself has gone away
				let _ = tx.send( (image, outcome) );
			});
		}
		drop(tx);

		//Collate the output of the threads
		for (image, outcome) in rx.into_iter() {
			self.entries.insert( image, outcome );
			progress_bar.inc(1);
		}
		progress_bar.finish();

		return num_pending;
	}
}

/// Compares every image against every other image once and reports the similar pairs.
pub struct PairwiseComparator<N: ImageNormalizer + ?Sized + 'static> {
	normalizer: Arc<N>,
	options: CompareOptions,
}

impl<N: ImageNormalizer + ?Sized + 'static> PairwiseComparator<N> {

	pub fn new( normalizer: Arc<N>, options: CompareOptions ) -> PairwiseComparator<N> {
		PairwiseComparator { normalizer, options }
	}

	pub fn options(&self) -> &CompareOptions {
		&self.options
	}

	pub fn is_similar( &self, distance: u64 ) -> bool {
		distance <= self.options.limit
	}

	/// Runs the comparison, handing each similar pair to `report` in enumeration order.
	///
	/// With [`FailurePolicy::Abort`] the first normalization failure is returned as the
	/// error; pairs already reported stay reported.
	pub fn compare_all<F: FnMut(&ComparisonResult)>( &self, images: &[ImageRef], mut report: F ) -> Result<CompareSummary, SimilarityError> {

		let tstart_compare = Instant::now();
		let mut cache = NormalizationCache::new();
		let mut summary = CompareSummary { num_images: images.len(), ..CompareSummary::default() };

		if images.len() < 2 {
			debug!(images = images.len(), "nothing to compare");
			summary.elapsed = tstart_compare.elapsed();
			return Ok(summary);
		}

		if self.options.num_threads > 1 {
			let progress_bar = if self.options.show_progress {
				ProgressBar::new(0)
			}else{
				ProgressBar::hidden()
			};
			let dispatched = cache.prefetch( images, &self.normalizer, self.options.num_threads, &progress_bar );
			debug!(dispatched, cached = cache.len(), "prefetch finished");
		}

		for (i, j) in pair_indices(images.len()) {
			//Look both up before skipping so a broken image is always recorded
			let first = self.lookup( &mut cache, &images[i] )?;
			let second = self.lookup( &mut cache, &images[j] )?;

			let (first, second) = match (first, second) {
				(Some(first), Some(second)) => (first, second),
				_ => {
					summary.pairs_skipped += 1;
					continue;
				}
			};

			let distance = first.distance(&second)?;
			summary.pairs_evaluated += 1;

			if self.is_similar(distance) {
				summary.matches += 1;
				report( &ComparisonResult { first: images[i].clone(), second: images[j].clone(), distance } );
			}
		}

		//Failures in the order the images were given
		let mut listed = HashSet::new();
		for image in images {
			if let Some(Err(e)) = cache.get(image) {
				if listed.insert(image) {
					debug!(path = %image.fpath.display(), "skipped image: {}", e);
					summary.failures.push( FailedImage { image: image.clone(), error: e.clone() } );
				}
			}
		}

		summary.elapsed = tstart_compare.elapsed();
		info!(
			images = summary.num_images,
			pairs = summary.pairs_evaluated,
			matches = summary.matches,
			failed = summary.failures.len(),
			"comparing all files took {:?}", summary.elapsed
		);

		return Ok(summary);
	}

	//None means the image is broken and its pairs should be skipped
	fn lookup( &self, cache: &mut NormalizationCache, image: &ImageRef ) -> Result<Option<Arc<NormalizedImage>>, SimilarityError> {
		match cache.get_or_normalize( image, &*self.normalizer ) {
			Ok(grid) => return Ok(Some(grid)),
			Err(e) => {
				if self.options.failure_policy == FailurePolicy::Isolate && e.is_decode_class() {
					return Ok(None);
				}
				return Err(e);
			}
		}
	}
}
