pub mod classifier;
pub mod export;
pub mod gateway;
pub mod review;

#[cfg(test)]
pub(crate) mod testing;

pub use classifier::{Classifier, StaticSupplierDirectory, SupplierDirectory};
pub use export::{export_filename, invoices_to_csv};
pub use gateway::{content_hash, IngestionGateway, UploadReceipt, SUPPORTED_EXTENSIONS};
pub use review::{ApprovalRequest, CsvExport, InvoiceDetail, OriginalFile, ReviewService};
