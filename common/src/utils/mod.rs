pub mod embedding;
pub mod redaction;
