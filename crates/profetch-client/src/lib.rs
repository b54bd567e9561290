pub mod exporter;
pub mod extractor;
pub mod fetcher;

pub use exporter::{CsvExporter, JsonLinesExporter};
pub use extractor::JsonExtractor;
pub use fetcher::ReqwestFetcher;
