//! Media localization and transcoding pipeline
//!
//! Three stages, each runnable as an independent job: the localizer
//! re-hosts arbitrary source media into durable storage, the normalizer
//! brings video into the envelope all destination platforms accept, and
//! the compressor squeezes video under per-platform byte ceilings.

pub mod chunked;
pub mod compress;
pub mod localizer;
pub mod normalize;
pub mod probe;
pub mod sniff;
pub mod store;

pub use compress::SizeConstrainedCompressor;
pub use localizer::MediaLocalizer;
pub use normalize::VideoNormalizer;
pub use store::{LocalStore, MediaStore, ResumableHttpStore};
