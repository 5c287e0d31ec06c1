/// Protocol version stamped on every envelope. Envelopes carrying any other
/// version are rejected.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Application name
pub const APP_NAME: &str = "Parley";

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Number of BLAKE3 output bytes kept for a key fingerprint
pub const FINGERPRINT_BYTES: usize = 8;

/// Random bytes behind an invite code (16 base64url characters)
pub const INVITE_CODE_BYTES: usize = 12;

/// Maximum chat message length in characters
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Maximum room name length in characters
pub const MAX_ROOM_NAME_CHARS: usize = 100;

/// Maximum room description length in characters
pub const MAX_DESCRIPTION_CHARS: usize = 500;

/// History page size used when a caller asks for a non-positive limit
pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

/// Nickname used when a client authenticates without one
pub const DEFAULT_NICKNAME: &str = "Anonymous";
