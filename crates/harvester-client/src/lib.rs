//! reqwest-backed [`Fetcher`](harvester_core::traits::Fetcher) and
//! [`Prober`](harvester_core::traits::Prober) implementations.

pub mod fetcher;
mod guard;
mod http;
pub mod prober;

pub use fetcher::HttpFetcher;
pub use prober::HttpProber;
