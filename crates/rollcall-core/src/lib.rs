//! rollcall-core: face recognition and attendance bookkeeping.
//!
//! Uses YuNet for face detection and FaceNet for embeddings, both running via
//! ONNX Runtime, and matches embeddings against a registered gallery by
//! Euclidean distance. Matches are recorded in a day-partitioned CSV ledger.

pub mod compositor;
pub mod config;
pub mod detector;
pub mod embedder;
pub mod engine;
pub mod font;
pub mod gallery;
pub mod ledger;
pub mod matcher;
pub mod types;

pub use config::{Config, ConfigError};
pub use detector::FaceDetector;
pub use embedder::FaceEmbedder;
pub use engine::{EngineError, OnnxEngine, RecognitionEngine};
pub use gallery::{Gallery, GalleryError, GalleryStore};
pub use ledger::{AttendanceLedger, AttendanceRecord, Clock, LedgerError, MarkOutcome, SystemClock};
pub use matcher::{EuclideanMatcher, IdentityMatch, Matcher};
pub use types::{BoundingBox, Detection, Embedding, GalleryEntry, MatchLabel, MatchResult};
