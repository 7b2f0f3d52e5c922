//! Hybrid encryption, password-based decryption, and secure deletion (C1).

pub mod hybrid;
pub mod otp;
pub mod secure_delete;

pub use hybrid::hybrid_encrypt_file;
pub use otp::{otp_decrypt_file, DecryptFormat};
pub use secure_delete::secure_delete;
