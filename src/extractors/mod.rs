// src/extractors/mod.rs
pub mod pdf;

// Re-export key extraction functions for convenience
pub use pdf::pdf_to_text;
