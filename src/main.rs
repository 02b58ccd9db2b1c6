extern crate clap;
extern crate walkdir;
extern crate indicatif;

use std::path::{Path, PathBuf};
use std::ffi::OsStr;
use std::io::{self, BufRead};
use std::process::ExitCode;
use std::sync::Arc;
use std::collections::BTreeSet;
use clap::Parser;
use walkdir::{DirEntry, WalkDir};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

mod compare;
mod image_error;
mod normalize;

use compare::{CompareOptions, CompareSummary, ComparisonResult, FailurePolicy, PairwiseComparator};
use image_error::SimilarityError;
use normalize::{GreyscaleNormalizer, ImageNormalizer, ImageRef, NormalizedImage};


#[derive(Parser, Debug)]
#[command(name = "Similar Image Finder", version, about = "Finds pairs of visually similar images in a folder")]
struct Cli {
	/// Directories or image files to compare. Read from stdin, one per line, when none are given.
	dir_or_file: Vec<String>,

	/// Largest summed greyscale difference at which two images are reported as similar (Min:0, Default:6000)
	#[arg(short, long, default_value_t = CompareOptions::DEFAULT_LIMIT as i64, allow_negative_numbers = true)]
	limit: i64,

	/// Width and height of the greyscale grid each image is reduced to before comparing
	#[arg(short, long, default_value_t = GreyscaleNormalizer::DEFAULT_SIZE)]
	size: u32,

	/// Number of CPU threads used to decode and normalize images. 1 decodes lazily on a single thread.
	#[arg(short, long, default_value_t = CompareOptions::DEFAULT_NUM_THREADS)]
	threads: u32,

	/// Descend into sub-directories (hidden directories are skipped)
	#[arg(short, long)]
	recursive: bool,

	/// Only consider files with a known image extension instead of trying every file
	#[arg(short = 'y', long)]
	images_only: bool,

	/// Stop at the first image that can't be decoded instead of skipping it
	#[arg(long)]
	fail_fast: bool,

	/// Print the distance alongside each similar pair
	#[arg(short = 'd', long)]
	show_distance: bool,

	/// No progress bar and no summary line
	#[arg(short, long)]
	quiet: bool,

	/// Debug logging (RUST_LOG overrides this)
	#[arg(short, long)]
	verbose: bool,

	/// Debug mode. Normalize one or two files and explain why they are or aren't similar.
	#[arg(short = 'g', long, conflicts_with_all = ["recursive", "images_only", "fail_fast"])]
	debug: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ConfigOptions {
	compare : CompareOptions,
	size : u32,
	recursive : bool,
	only_known_file_extensions : bool,
	show_distance : bool,
	quiet : bool,
}

fn main() -> ExitCode {

	//Process command line arguments
	let cli = Cli::parse();
	init_tracing( cli.verbose );

	//Set the configuration options based on the command line
	let config = match set_config_options( &cli ) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("{}", e);
			return ExitCode::FAILURE;
		}
	};

	if cli.debug {
		return debug_mode( &cli.dir_or_file, &config );
	}

	//Gather the list of files to inspect
	let path_list = if cli.dir_or_file.is_empty() {
		gather_file_list_from_stdin()
	}else{
		Some(cli.dir_or_file.clone())
	};

	let images = match path_list {
		Some(path_list) => gather_file_list( &path_list, &config ),
		None => Vec::new(),
	};

	if images.is_empty() {
		eprintln!("Didn't find any image files to test");
		return ExitCode::SUCCESS;
	}

	let comparator = PairwiseComparator::new( Arc::new(GreyscaleNormalizer::new(config.size)), config.compare.clone() );
	let show_distance = config.show_distance;

	match comparator.compare_all( &images, |result| output_result( result, show_distance ) ) {
		Ok(summary) => {
			output_summary( &summary, &config );
			return ExitCode::SUCCESS;
		},
		Err(e) => {
			eprintln!("{}", e);
			return ExitCode::FAILURE;
		}
	}
}

fn init_tracing( verbose: bool ) {
	let default_level = if verbose { "debug" } else { "warn" };
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

	//Logs go to stderr so stdout only ever holds the similar pairs
	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(io::stderr)
		.try_init();
}

fn get_default_config_options() -> ConfigOptions {
	return ConfigOptions {
		compare : CompareOptions { show_progress: true, ..CompareOptions::default() },
		size : GreyscaleNormalizer::DEFAULT_SIZE,
		recursive : false,
		only_known_file_extensions : false,
		show_distance : false,
		quiet : false,
	};
}

fn set_config_options( cli: &Cli ) -> Result<ConfigOptions, SimilarityError> {

	let mut config : ConfigOptions = get_default_config_options();

	if cli.limit < 0 {
		return Err(SimilarityError::ConfigurationError(format!("Error: --limit must be 0 or greater, got {}", cli.limit)));
	}
	config.compare.limit = cli.limit as u64;

	if cli.size < 1 {
		return Err(SimilarityError::ConfigurationError("Error: --size must be greater than 0".to_string()));
	}
	config.size = cli.size;

	if cli.threads < 1 {
		return Err(SimilarityError::ConfigurationError("Error: Number of threads must be greater than 0".to_string()));
	}
	config.compare.num_threads = cli.threads;

	if cli.fail_fast {
		config.compare.failure_policy = FailurePolicy::Abort;
	}

	config.recursive = cli.recursive;
	config.only_known_file_extensions = cli.images_only;
	config.show_distance = cli.show_distance;
	config.quiet = cli.quiet;
	config.compare.show_progress = !cli.quiet;

	return Ok(config);
}

//Debug function to normalize one or two images and show the numbers behind the decision
fn debug_mode( paths: &[String], config : &ConfigOptions ) -> ExitCode {

	if paths.is_empty() || paths.len() > 2 {
		eprintln!("{}", SimilarityError::ConfigurationError("Error: Debug mode requires either exactly 1 or 2 paths to images.".to_string()));
		return ExitCode::FAILURE;
	}

	let normalizer = GreyscaleNormalizer::new( config.size );
	let comparator = PairwiseComparator::new( Arc::new(normalizer), config.compare.clone() );

	let first = ImageRef::new( &paths[0] );
	let a = match normalizer.normalize( &first ) {
		Ok(a) => a,
		Err(e) => {
			eprintln!("{}", e);
			return ExitCode::FAILURE;
		}
	};
	print_grid( "First", &a );

	if let Some(second_path) = paths.get(1) {
		let second = ImageRef::new( second_path );
		match normalizer.normalize( &second ) {
			Ok(b) => {
				print_grid( "Second", &b );
				let distance = match a.distance( &b ) {
					Ok(distance) => distance,
					Err(e) => {
						eprintln!("{}", e);
						return ExitCode::FAILURE;
					}
				};
				eprintln!("Greyscale difference: {} ", distance);
				eprintln!("Limit: {} ", comparator.options().limit);
				eprintln!("Are both images similar?:  {} ", comparator.is_similar( distance ));
			},
			Err(e) => {
				eprintln!("{}", e);
				return ExitCode::FAILURE;
			},
		}
	}

	return ExitCode::SUCCESS;
}

//Grid statistics followed by the grid itself, one row per line
fn print_grid( label: &str, grid: &NormalizedImage ) {
	let (min, max) = grid.min_max();
	eprintln!("Grid {}: {}x{} mean {:.1} min {} max {}", label, grid.width(), grid.height(), grid.mean(), min, max);
	for row in grid.pixels().chunks(grid.width().max(1) as usize) {
		let cells: Vec<String> = row.iter().map(|p| format!("{:3}", p)).collect();
		eprintln!("\t{}", cells.join(" "));
	}
}

//Read in the list of paths to inspect from stdin
fn gather_file_list_from_stdin( ) -> Option<Vec<String>> {
	let stdin = io::stdin();
	return read_path_list( stdin.lock() );
}

fn read_path_list<R: BufRead>( reader: R ) -> Option<Vec<String>> {
	let mut path_list  : Vec<String> = Vec::new();

	for line in reader.lines() {
		match line {
			Ok(line) => {
				let line = line.trim_end_matches('\r');
				if !line.is_empty() {
					path_list.push( line.to_string() )
				}
			},
			Err(e) => {
				warn!("Error reading from stdin: {}", e);
			}
		}
	}

	if path_list.is_empty() {
		return None;
	}

	return Some(path_list);
}

//Only allows certain file extensions that may be images
//Unless the user has elected to only test known image files every file is tried
fn valid_file_extension( fpath: &Path, config: &ConfigOptions ) -> bool {

	//List of known image file extensions
	const KNOWN_EXTENSIONS: [&str; 9] = [ "jpg", "jpeg", "png", "tif", "tiff", "gif", "bmp", "webp", "ico" ];

	if config.only_known_file_extensions {
		match fpath.extension().and_then(OsStr::to_str) {
			Some(extension) => {
				let ext_lower = extension.to_lowercase();
				return KNOWN_EXTENSIONS.contains(&ext_lower.as_str());
			},
			None => return false,
		}
	}

	return true;
}

//Files directly inside a directory, like a shell's dir/*
fn list_directory( dir: &str ) -> Vec<PathBuf> {
	let mut files = Vec::new();
	let pattern = Path::new(&glob::Pattern::escape(dir)).join("*");

	//Like the shell, * doesn't pick up hidden files
	let options = glob::MatchOptions { require_literal_leading_dot: true, ..glob::MatchOptions::new() };

	let entries = match glob::glob_with( &pattern.to_string_lossy(), options ) {
		Ok(entries) => entries,
		Err(e) => {
			warn!("ERROR: Bad directory pattern {}: {}", dir, e);
			return files;
		}
	};

	for entry in entries {
		match entry {
			Ok(path) => {
				if path.is_file() {
					files.push( path );
				}
			},
			Err(e) => warn!("ERROR: Failed to read: {}", e),
		}
	}

	return files;
}

//Every file below a directory, skipping hidden directories
fn walk_directory( dir: &str ) -> Vec<PathBuf> {
	let mut files = Vec::new();

	let recurse_dir = WalkDir::new(dir).sort_by_file_name().into_iter();
	for entry in recurse_dir.filter_entry(|e| !dir_filter(e)) {
		match entry {
			Ok(entry) => {
				if entry.file_type().is_file() {
					files.push( entry.into_path() );
				}
			},
			Err(e) => warn!("ERROR: Failed to read: {}", e),
		}
	}

	return files;
}

//Filter out invisible directories below the starting point
fn dir_filter(entry: &DirEntry) -> bool {
	entry.depth() > 0 && entry.file_type().is_dir() &&
		entry.file_name()
			.to_str()
			.map(|s| s.starts_with("."))
			.unwrap_or(false)
}

//Expand directories.
//De-duplicate and sort the paths so that every run compares the images in the same order.
fn gather_file_list( path_list : &[String], config: &ConfigOptions ) -> Vec<ImageRef> {

	let mut dedup_file_list = BTreeSet::new();

	for file_or_dir in path_list {
		let fod_test = Path::new(file_or_dir);
		if !fod_test.exists() {
			warn!("ERROR: Failed to read: {}", file_or_dir);
			continue;
		}

		if fod_test.is_file() {
			if valid_file_extension( fod_test, config ) {
				dedup_file_list.insert( fod_test.to_path_buf() );
			}
		}

		if fod_test.is_dir() {
			let found = if config.recursive { walk_directory( file_or_dir ) } else { list_directory( file_or_dir ) };
			for path in found {
				if valid_file_extension( &path, config ) {
					dedup_file_list.insert( path );
				}
			}
		}
	}

	debug!(files = dedup_file_list.len(), "gathered file list");

	return dedup_file_list.into_iter().map(ImageRef::new).collect();
}

//Print one similar pair as soon as it is found
fn output_result( result: &ComparisonResult, show_distance: bool ) {
	if show_distance {
		println!("{} and {} (distance {})", result.first.name, result.second.name, result.distance);
	}else{
		println!("{} and {}", result.first.name, result.second.name);
	}
}

//Print the images that couldn't be compared, then the totals
fn output_summary( summary: &CompareSummary, config: &ConfigOptions ) {

	//Printed after the run as printing them live disrupts the progress bar
	for failed in &summary.failures {
		eprintln!("Skipped {}: {}", failed.image.name, failed.error);
	}

	if !config.quiet {
		eprintln!("Images: {} Pairs compared: {} Pairs skipped: {} Similar pairs: {} Failed images: {}",
			summary.num_images, summary.pairs_evaluated, summary.pairs_skipped, summary.matches, summary.failures.len());
		eprintln!("comparing all files in folder took : {:.3}s", summary.elapsed.as_secs_f64());
	}
}


#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use tempfile::TempDir;

	fn parse( args: &[&str] ) -> Cli {
		let mut full = vec!["simimg"];
		full.extend_from_slice(args);
		Cli::try_parse_from(full).unwrap()
	}

	fn touch( dir: &Path, name: &str ) -> PathBuf {
		let path = dir.join(name);
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).unwrap();
		}
		fs::write(&path, b"x").unwrap();
		path
	}

	fn names( images: &[ImageRef] ) -> Vec<String> {
		images.iter().map(|i| i.name.clone()).collect()
	}

	#[test]
	fn test_default_config() {
		let config = set_config_options( &parse(&["photos"]) ).unwrap();
		assert_eq!( config.compare.limit, 6000 );
		assert_eq!( config.size, 16 );
		assert_eq!( config.compare.num_threads, 4 );
		assert_eq!( config.compare.failure_policy, FailurePolicy::Isolate );
		assert!( !config.only_known_file_extensions );
	}

	#[test]
	fn test_config_options_from_flags() {
		let config = set_config_options( &parse(&["-l", "1234", "--size", "8", "-t", "1", "--fail-fast", "-y", "-q", "photos"]) ).unwrap();
		assert_eq!( config.compare.limit, 1234 );
		assert_eq!( config.size, 8 );
		assert_eq!( config.compare.num_threads, 1 );
		assert_eq!( config.compare.failure_policy, FailurePolicy::Abort );
		assert!( config.only_known_file_extensions );
		assert!( !config.compare.show_progress );
	}

	#[test]
	fn test_negative_limit_rejected() {
		let result = set_config_options( &parse(&["--limit", "-1", "photos"]) );
		assert!( matches!(result, Err(SimilarityError::ConfigurationError(_))) );
	}

	#[test]
	fn test_zero_limit_allowed() {
		assert_eq!( set_config_options( &parse(&["--limit", "0"]) ).unwrap().compare.limit, 0 );
	}

	#[test]
	fn test_zero_size_and_threads_rejected() {
		assert!( set_config_options( &parse(&["--size", "0"]) ).is_err() );
		assert!( set_config_options( &parse(&["--threads", "0"]) ).is_err() );
	}

	#[test]
	fn test_read_path_list() {
		let input = "a.jpg\n\nphotos/b.png\r\n";
		assert_eq!( read_path_list( input.as_bytes() ), Some(vec!["a.jpg".to_string(), "photos/b.png".to_string()]) );
		assert_eq!( read_path_list( "\n\n".as_bytes() ), None );
	}

	#[test]
	fn test_directory_listing_is_not_recursive() {
		let dir = TempDir::new().unwrap();
		touch( dir.path(), "b.jpg" );
		touch( dir.path(), "a.png" );
		touch( dir.path(), "notes.txt" );
		touch( dir.path(), ".hidden.jpg" );
		touch( dir.path(), "nested/c.jpg" );

		let config = get_default_config_options();
		let images = gather_file_list( &[dir.path().display().to_string()], &config );
		assert_eq!( names(&images), vec!["a.png", "b.jpg", "notes.txt"] );
	}

	#[test]
	fn test_recursive_skips_hidden_directories() {
		let dir = TempDir::new().unwrap();
		touch( dir.path(), "a.png" );
		touch( dir.path(), "nested/c.jpg" );
		touch( dir.path(), ".thumbnails/a_thumb.png" );

		let config = ConfigOptions { recursive: true, ..get_default_config_options() };
		let images = gather_file_list( &[dir.path().display().to_string()], &config );
		assert_eq!( names(&images), vec!["a.png", "c.jpg"] );
	}

	#[test]
	fn test_images_only_filters_extensions() {
		let dir = TempDir::new().unwrap();
		touch( dir.path(), "a.PNG" );
		touch( dir.path(), "b.jpeg" );
		touch( dir.path(), "notes.txt" );
		touch( dir.path(), "no_extension" );

		let config = ConfigOptions { only_known_file_extensions: true, ..get_default_config_options() };
		let images = gather_file_list( &[dir.path().display().to_string()], &config );
		assert_eq!( names(&images), vec!["a.PNG", "b.jpeg"] );
	}

	#[test]
	fn test_file_list_is_deduplicated_and_sorted() {
		let dir = TempDir::new().unwrap();
		let b = touch( dir.path(), "b.jpg" );
		touch( dir.path(), "a.jpg" );

		let config = get_default_config_options();
		let path_list = vec![
			b.display().to_string(),
			dir.path().display().to_string(),
			dir.path().join("missing.jpg").display().to_string(),
		];
		let images = gather_file_list( &path_list, &config );
		assert_eq!( names(&images), vec!["a.jpg", "b.jpg"] );
	}

	#[test]
	fn test_directory_with_glob_characters() {
		let dir = TempDir::new().unwrap();
		let odd = dir.path().join("shots [2024]");
		touch( &odd, "a.jpg" );

		let images = gather_file_list( &[odd.display().to_string()], &get_default_config_options() );
		assert_eq!( names(&images), vec!["a.jpg"] );
	}
}
