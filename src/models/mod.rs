pub mod entry;
pub mod extraction;
pub mod invoice;

pub use entry::{AttrValue, EntryAttrs, EntryType, ExtraAttr, InvoiceEntry, NewEntry, RESERVED_ATTRS};
pub use extraction::{Classification, ExtractionOutcome, FieldExtraction, OcrConfidence, TierOutput, TierRequest};
pub use invoice::{
    compose_display_name, filename_stem, ExceptionType, Invoice, InvoiceFields, InvoiceStatus, OcrTier,
};
