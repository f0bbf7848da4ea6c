// Built-in commands used by the executor itself and by thin callers.
//
// Business payloads stay opaque (`serde_json::Value`); typing them is
// the session layer's job.

mod compare_exchange;
mod documents;
mod operations;
mod topology;

pub use compare_exchange::{CompareExchangeResult, PutCompareExchangeValueCommand};
pub use documents::{GetDocumentsCommand, GetDocumentsResult, PutDocumentCommand, PutResult};
pub use operations::{GetNextOperationIdCommand, NextOperationId};
pub use topology::GetDatabaseTopologyCommand;
