//! Dummy HTTP Server
//!
//! A stand-in HTTP backend for integration tests. It answers every request
//! with a canned response chosen by ordered matching rules, and archives each
//! request as a JSON document in a capture directory for later inspection.
//!
//! # Features
//!
//! - **Rule Matching**: Match by method set and by a regex searched in the path
//! - **First Match Wins**: Rules are tried in order, with a built-in fallback
//!   answering `200` and `{}`
//! - **Request Capture**: One file per request, named after its arrival time
//!   and method
//! - **Capture Opt-out**: Rules can skip capturing the requests they answer
//!
//! # Example Configuration
//!
//! ```yaml
//! address: ":8080"
//! captureDir: var
//! maxRequestSize: 1048576
//! responses:
//!   - pathPattern: "^/health$"
//!     methods: [GET]
//!     skipCapture: true
//!   - pathPattern: "^/api/"
//!     contentType: application/json
//!     returnCode: 201
//!     body: eyJvayI6dHJ1ZX0=
//! ```

pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod response;
pub mod server;

pub use capture::CapturedRequest;
pub use config::{ResponseConfig, ServerConfig};
pub use engine::Engine;
pub use error::{BuildError, CaptureError};
pub use response::{Response, ResponseBuilder, ResponseSet, DEFAULT_RESPONSE};
pub use server::Server;
