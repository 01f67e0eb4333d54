//! Install pipeline: single-flight downloads, atomic verify and swap,
//! phase-tracked progress, and cache housekeeping.

mod fetcher;
mod index;
mod layout;
mod pipeline;
mod progress;

pub use fetcher::{artifact_url, ArtifactFetcher, ByteStream, FetchResponse, HttpFetcher};
pub use index::{LocalModel, LocalModelIndex};
pub use layout::CacheLayout;
pub use pipeline::{hash_file, InstallKey, InstallWatch, Installer};
pub use progress::{InstallPhase, InstallProgress};
