//! Client side of chunked transfers: upload and download orchestration
//! over a pluggable [`Remote`], with an HTTP implementation.

pub mod config;
pub mod download;
pub mod http;
pub mod transport;
pub mod upload;

pub use config::{ClientConfig, ConfigError};
pub use download::{DownloadOptions, Downloaded, Downloader};
pub use http::HttpRemote;
pub use transport::{FrameStream, Remote, RemoteFile};
pub use upload::{UploadOptions, UploadProgress, Uploader};
