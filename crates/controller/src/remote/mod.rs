//! Remote scale-set registry adapter: client trait, HTTP implementation,
//! and the per-credential client cache.

pub mod cache;
pub mod client;
pub mod http;

pub use cache::{ClientCache, ScaleSetClientFactory};
pub use client::{
    ClientSettings, NewScaleSet, RemoteError, RunnerGroup, ScaleSet, ScaleSetClient,
    ScaleSetUpdate,
};
pub use http::{HttpClientFactory, HttpScaleSetClient};
