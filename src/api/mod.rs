//! Backend collaborator: transport, wire types and resource keys.

pub mod client;
pub mod keys;
pub mod status;
pub mod types;

pub use client::{Backend, Credentials, HttpBackend, IDEMPOTENCY_HEADER};
pub use keys::ResourceKey;
pub use types::{
  PresignedTransferToken, RawResponse, RemoteFile, RemoteFolder, TransferOperation, UploadFile,
};
