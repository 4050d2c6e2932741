//! SCRAM-SHA-256 authentication implementation.
//!
//! Implements RFC 5802 (SCRAM) and RFC 7677 (SCRAM-SHA-256) for PostgreSQL.
//! The exchange runs in three steps, each only valid after the previous one:
//! [`ScramSession::start`], [`ScramSession::continue_exchange`] and
//! [`ScramSession::finalize`].

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use super::protocol::SCRAM_SHA_256;

type HmacSha256 = Hmac<Sha256>;

/// Channel binding flag sent in client-final, `base64("n,,")`.
const GS2_HEADER_B64: &str = "biws";

#[derive(Debug, Clone)]
enum Step {
    /// Client-first sent, waiting for server-first.
    ClientFirstSent { client_nonce: String },
    /// Client-final sent, waiting for the server signature.
    ClientFinalSent { server_signature: [u8; 32] },
    /// Signature verified or rejected.
    Done,
}

/// SCRAM-SHA-256 client session.
#[derive(Debug, Clone)]
pub struct ScramSession {
    step: Step,
}

impl ScramSession {
    /// Begin an exchange if the server offers SCRAM-SHA-256.
    ///
    /// Returns the session and the client-first message `n,,n=*,r=<nonce>`.
    /// The user name is left to the startup packet, as the server ignores it.
    pub fn start(mechanisms: &[String]) -> Result<(Self, Vec<u8>), ScramError> {
        // Generate 18 bytes of random data, then base64 encode (24 chars)
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::start_with_nonce(mechanisms, &BASE64.encode(nonce_bytes))
    }

    pub(crate) fn start_with_nonce(
        mechanisms: &[String],
        client_nonce: &str,
    ) -> Result<(Self, Vec<u8>), ScramError> {
        if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
            return Err(ScramError::UnsupportedMechanism(mechanisms.join(", ")));
        }

        let first = format!("n,,{}", client_first_bare(client_nonce)).into_bytes();
        let session = Self {
            step: Step::ClientFirstSent {
                client_nonce: client_nonce.to_string(),
            },
        };
        Ok((session, first))
    }

    /// Answer the server-first message with the client proof.
    ///
    /// Server message format: `r=<nonce>,s=<salt>,i=<iterations>`
    /// Returns: client-final-message `c=biws,r=<nonce>,p=<proof>`
    pub fn continue_exchange(
        &mut self,
        password: &str,
        server_msg: &[u8],
    ) -> Result<Vec<u8>, ScramError> {
        let client_nonce = match &self.step {
            Step::ClientFirstSent { client_nonce } => client_nonce.clone(),
            _ => return Err(ScramError::OutOfOrder("SASLContinue")),
        };
        self.step = Step::Done;

        if password.is_empty() {
            return Err(ScramError::EmptyPassword);
        }

        let server_first =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;
        let ServerFirst {
            nonce,
            salt,
            iterations,
        } = parse_server_first(server_first)?;

        // Verify nonce extends our client nonce
        if !nonce.starts_with(&client_nonce) {
            return Err(ScramError::NonceMismatch);
        }
        if nonce.len() == client_nonce.len() {
            return Err(ScramError::NonceTooShort);
        }

        // Calculate SaltedPassword using PBKDF2
        let salted_password = hi(password, &salt, iterations);

        // Calculate keys
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);
        let server_key = hmac_sha256(&salted_password, b"Server Key");

        // Build auth message
        let client_final_without_proof = format!("c={},r={}", GS2_HEADER_B64, nonce);
        let auth_message = format!(
            "{},{},{}",
            client_first_bare(&client_nonce),
            server_first,
            client_final_without_proof
        );

        // Calculate proof
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let client_proof = xor_bytes(&client_key, &client_signature);

        self.step = Step::ClientFinalSent {
            server_signature: hmac_sha256(&server_key, auth_message.as_bytes()),
        };

        let client_final = format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(client_proof)
        );
        Ok(client_final.into_bytes())
    }

    /// Verify the server's final message (server signature).
    ///
    /// Server message format: `v=<verifier>`
    pub fn finalize(&mut self, server_msg: &[u8]) -> Result<(), ScramError> {
        let expected = match &self.step {
            Step::ClientFinalSent { server_signature } => *server_signature,
            _ => return Err(ScramError::OutOfOrder("SASLFinal")),
        };
        self.step = Step::Done;

        let server_str =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut verifier = None;
        for part in server_str.split(',') {
            if let Some(value) = part.strip_prefix("e=") {
                return Err(ScramError::ServerError(value.to_string()));
            } else if let Some(value) = part.strip_prefix("v=") {
                verifier = Some(value);
            }
        }
        let verifier = verifier.ok_or(ScramError::MissingServerSignature)?;

        let server_signature = BASE64
            .decode(verifier)
            .map_err(|_| ScramError::InvalidServerSignature)?;

        if server_signature[..] != expected[..] {
            return Err(ScramError::ServerSignatureMismatch);
        }

        Ok(())
    }

    /// Whether the exchange ran to the end, server signature included.
    pub fn is_finished(&self) -> bool {
        matches!(self.step, Step::Done)
    }
}

struct ServerFirst {
    nonce: String,
    salt: Vec<u8>,
    iterations: u32,
}

fn parse_server_first(server_str: &str) -> Result<ServerFirst, ScramError> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for part in server_str.split(',') {
        if let Some(value) = part.strip_prefix("r=") {
            if value.is_empty() || !value.chars().all(|c| c.is_ascii_graphic() && c != ',') {
                return Err(ScramError::InvalidNonce);
            }
            nonce = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("s=") {
            salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?);
        } else if let Some(value) = part.strip_prefix("i=") {
            let count = value
                .parse::<u32>()
                .map_err(|_| ScramError::InvalidIterations)?;
            if count == 0 {
                return Err(ScramError::InvalidIterations);
            }
            iterations = Some(count);
        }
    }

    Ok(ServerFirst {
        nonce: nonce.ok_or(ScramError::MissingNonce)?,
        salt: salt.ok_or(ScramError::MissingSalt)?,
        iterations: iterations.ok_or(ScramError::MissingIterations)?,
    })
}

fn client_first_bare(client_nonce: &str) -> String {
    format!("n=*,r={}", client_nonce)
}

/// SCRAM authentication errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    UnsupportedMechanism(String),
    OutOfOrder(&'static str),
    EmptyPassword,
    InvalidServerMessage,
    InvalidNonce,
    InvalidSalt,
    InvalidIterations,
    MissingNonce,
    MissingSalt,
    MissingIterations,
    NonceMismatch,
    NonceTooShort,
    MissingServerSignature,
    InvalidServerSignature,
    ServerSignatureMismatch,
    ServerError(String),
}

impl std::fmt::Display for ScramError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedMechanism(offered) => write!(
                f,
                "Only mechanism SCRAM-SHA-256 is currently supported (server offered: {})",
                offered
            ),
            Self::OutOfOrder(step) => write!(f, "{} received in the wrong session state", step),
            Self::EmptyPassword => write!(f, "client password must be a non-empty string"),
            Self::InvalidServerMessage => write!(f, "Invalid server message"),
            Self::InvalidNonce => write!(f, "nonce must only contain printable characters"),
            Self::InvalidSalt => write!(f, "Invalid salt encoding"),
            Self::InvalidIterations => write!(f, "Invalid iteration count"),
            Self::MissingNonce => write!(f, "Missing nonce in server message"),
            Self::MissingSalt => write!(f, "Missing salt in server message"),
            Self::MissingIterations => write!(f, "Missing iterations in server message"),
            Self::NonceMismatch => write!(f, "server nonce does not start with client nonce"),
            Self::NonceTooShort => write!(f, "server nonce is too short"),
            Self::MissingServerSignature => write!(f, "server signature is missing"),
            Self::InvalidServerSignature => write!(f, "Invalid server signature"),
            Self::ServerSignatureMismatch => write!(f, "server signature does not match"),
            Self::ServerError(e) => write!(f, "server reported error: {}", e),
        }
    }
}

impl std::error::Error for ScramError {}

// ============================================================================
// Helper Functions
// ============================================================================

/// Hi() function - PBKDF2 with HMAC-SHA-256
pub(crate) fn hi(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .expect("valid output length");
    output
}

/// HMAC-SHA-256
pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// SHA-256 hash
fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// XOR two byte arrays
fn xor_bytes(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut result = [0u8; 32];
    for (r, (x, y)) in result.iter_mut().zip(a.iter().zip(b.iter())) {
        *r = x ^ y;
    }
    result
}
