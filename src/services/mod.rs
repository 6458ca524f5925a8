pub mod lifecycle;
pub mod payload_signer;
pub mod pii_cipher;
pub mod serial_number;
pub mod utils;
