pub mod content_key;
pub mod jwt;
pub mod resume_token;

pub use content_key::{derive_content_key, ContentKeyCache, CONTENT_KEY_LEN};
pub use jwt::{RoomClaims, RoomTokenService};
pub use resume_token::{ResumeTokenCodec, ResumeTokenError};
