use serde_json::Value;

use murmur_types::models::Event;

/// Result of trying to decrypt one stored event.
#[derive(Debug, Clone, PartialEq)]
pub enum Decryption {
    Plaintext { event_type: String, content: Value },
    /// Keys are not available yet. The event is stored encrypted and a
    /// session request is queued.
    Pending { error: String },
}

/// Decrypts room events. Implementations must not block on the network:
/// they run inside storage transactions.
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, evt: &Event) -> Decryption;
}

/// Used when no key store is attached; every encrypted event stays pending.
pub struct NoopDecryptor;

impl Decryptor for NoopDecryptor {
    fn decrypt(&self, _evt: &Event) -> Decryption {
        Decryption::Pending {
            error: "no decryption backend configured".into(),
        }
    }
}
