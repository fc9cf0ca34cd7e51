//! Email ingest: mailbox access, per-message pipeline, and the scan daemon.

pub mod gmail;
pub mod pipeline;
pub mod scanner;

pub use gmail::{GmailClient, MailboxClient, MailboxMessage};
pub use pipeline::{EmailPipeline, HttpGateway, ShipmentGateway, ShipmentRef, StoreGateway};
pub use scanner::{EmailScanner, ScanSummary};
