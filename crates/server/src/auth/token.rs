//! Session token validation

use deskrelay_shared::{
    close_codes, ConversationId, ParticipantId, ParticipantRole, SessionClaims,
};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};

/// Clock skew tolerance applied to `exp`
const LEEWAY_SECS: u64 = 60;

/// Identity resolved from a verified session token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub conversation_id: ConversationId,
    pub participant_id: ParticipantId,
    pub role: ParticipantRole,
    pub authenticated: bool,
    pub expires_at: i64,
}

/// Verifies HS256 session tokens against the shared secret
#[derive(Clone)]
pub struct TokenVerifier {
    decoding_key: DecodingKey,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Validate the token carried by a handshake
    ///
    /// Explicit algorithm pinning prevents algorithm confusion attacks.
    pub fn verify(&self, token: Option<&str>) -> Result<VerifiedIdentity, TokenError> {
        let token = token.map(str::trim).filter(|t| !t.is_empty());
        let token = token.ok_or(TokenError::Missing)?;

        // A header that fails to parse is a broken token, not a bad identity
        decode_header(token).map_err(|e| TokenError::Invalid(e.to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = LEEWAY_SECS;

        // Claims are only deserialized once the signature has verified
        let claims = decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::Json(_) | ErrorKind::MissingRequiredClaim(_) => {
                    TokenError::MalformedIdentity(e.to_string())
                }
                _ => TokenError::Invalid(e.to_string()),
            })?;

        identity_from_claims(claims)
    }
}

fn identity_from_claims(claims: SessionClaims) -> Result<VerifiedIdentity, TokenError> {
    let participant_id = claims.participant_id.trim();
    let conversation_id = claims.conversation_id.trim();

    if participant_id.is_empty() {
        return Err(TokenError::MalformedIdentity(
            "participantId is empty".to_string(),
        ));
    }
    if conversation_id.is_empty() {
        return Err(TokenError::MalformedIdentity(
            "conversationId is empty".to_string(),
        ));
    }

    let role: ParticipantRole = claims
        .role
        .parse()
        .map_err(|e: deskrelay_shared::ProtocolError| TokenError::MalformedIdentity(e.to_string()))?;

    Ok(VerifiedIdentity {
        conversation_id: ConversationId::new(conversation_id),
        participant_id: ParticipantId::new(participant_id),
        role,
        authenticated: claims.authenticated,
        expires_at: claims.exp,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Missing token")]
    Missing,
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token: {0}")]
    Invalid(String),
    #[error("Malformed identity payload: {0}")]
    MalformedIdentity(String),
}

impl TokenError {
    /// WebSocket close code sent when a handshake is rejected for this reason
    pub fn close_code(&self) -> u16 {
        match self {
            TokenError::Missing => close_codes::MISSING_TOKEN,
            TokenError::Expired => close_codes::TOKEN_EXPIRED,
            TokenError::Invalid(_) => close_codes::INVALID_TOKEN,
            TokenError::MalformedIdentity(_) => close_codes::MALFORMED_IDENTITY,
        }
    }

    /// Short close reason; close frames are limited to 123 bytes
    pub fn close_reason(&self) -> &'static str {
        match self {
            TokenError::Missing => "missing token",
            TokenError::Expired => "token expired",
            TokenError::Invalid(_) => "invalid token",
            TokenError::MalformedIdentity(_) => "malformed identity",
        }
    }
}
