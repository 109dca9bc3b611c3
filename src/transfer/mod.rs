pub mod export;
pub mod import;
pub mod payload;

pub use export::{
    complete_transfer, export_identity, register_export, ExportBundle,
    DEFAULT_TRANSFER_TTL_MINUTES,
};
pub use import::{ImportCompletion, ImportError, ImportMachine, ImportState};
pub use payload::{
    generate_transfer_code, normalize_transfer_code, parse_transfer_payload, TRANSFER_CODE_LEN,
};
