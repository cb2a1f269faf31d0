//! Playlist Rewriter (spec §4.6).

pub mod rewriter;

pub use rewriter::{detect_kind, rewrite_master_ingest, rewrite_media_playlist, PlaylistKind};
