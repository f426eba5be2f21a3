//! SCRAM-SHA-256 authentication (RFC 5802, RFC 7677).
//!
//! The exchange is modelled as two steps so a client proof can only be
//! produced from a server-first message and a server signature can only be
//! checked against the proof that was sent.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const MECHANISM: &str = "SCRAM-SHA-256";

/// GS2 header for "no channel binding, no authzid", base64 is `biws`.
const GS2_HEADER: &str = "n,,";
const CHANNEL_BINDING: &str = "c=biws";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScramError {
    #[error("server message is not valid UTF-8")]
    InvalidServerMessage,
    #[error("server message is missing attribute '{0}'")]
    MissingAttribute(char),
    #[error("invalid salt encoding")]
    InvalidSalt,
    #[error("invalid iteration count")]
    InvalidIterations,
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("server reported authentication error: {0}")]
    ServerError(String),
    #[error("server signature verification failed")]
    SignatureMismatch,
}

/// Client side of a SCRAM-SHA-256 exchange, before the server challenge.
pub struct ScramClient {
    password: String,
    client_first_bare: String,
    client_nonce: String,
}

/// State kept after the client proof is sent.
pub struct ServerVerifier {
    expected_signature: [u8; 32],
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(username, password, &BASE64.encode(nonce_bytes))
    }

    /// Fixed nonce, for reproducing known exchanges.
    pub fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        Self {
            password: password.to_string(),
            client_first_bare: format!("n={},r={}", escape_username(username), nonce),
            client_nonce: nonce.to_string(),
        }
    }

    /// `n,,n=<user>,r=<nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("{}{}", GS2_HEADER, self.client_first_bare).into_bytes()
    }

    /// Answer the server challenge `r=<nonce>,s=<salt>,i=<iterations>`.
    pub fn client_final_message(
        self,
        server_first: &[u8],
    ) -> Result<(Vec<u8>, ServerVerifier), ScramError> {
        let server_first =
            std::str::from_utf8(server_first).map_err(|_| ScramError::InvalidServerMessage)?;

        let nonce = attribute(server_first, 'r')?;
        let salt = BASE64
            .decode(attribute(server_first, 's')?)
            .map_err(|_| ScramError::InvalidSalt)?;
        let iterations: u32 = attribute(server_first, 'i')?
            .parse()
            .map_err(|_| ScramError::InvalidIterations)?;
        if iterations == 0 {
            return Err(ScramError::InvalidIterations);
        }

        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(ScramError::NonceMismatch);
        }

        let without_proof = format!("{},r={}", CHANNEL_BINDING, nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );

        let salted_password = hi(self.password.as_bytes(), &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());

        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature.iter()) {
            *p ^= s;
        }

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let verifier = ServerVerifier {
            expected_signature: hmac_sha256(&server_key, auth_message.as_bytes()),
        };

        let message = format!("{},p={}", without_proof, BASE64.encode(proof));
        Ok((message.into_bytes(), verifier))
    }
}

impl ServerVerifier {
    /// Check `v=<signature>` (or surface `e=<error>`).
    pub fn verify(&self, server_final: &[u8]) -> Result<(), ScramError> {
        let server_final =
            std::str::from_utf8(server_final).map_err(|_| ScramError::InvalidServerMessage)?;

        if let Ok(error) = attribute(server_final, 'e') {
            return Err(ScramError::ServerError(error.to_string()));
        }

        let signature = BASE64
            .decode(attribute(server_final, 'v')?)
            .map_err(|_| ScramError::SignatureMismatch)?;

        if signature[..] != self.expected_signature[..] {
            return Err(ScramError::SignatureMismatch);
        }
        Ok(())
    }
}

fn attribute(message: &str, name: char) -> Result<&str, ScramError> {
    message
        .split(',')
        .find_map(|part| {
            let mut chars = part.chars();
            (chars.next() == Some(name) && chars.next() == Some('=')).then(|| &part[2..])
        })
        .ok_or(ScramError::MissingAttribute(name))
}

/// `=` and `,` are reserved in saslname.
fn escape_username(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

/// Hi() is PBKDF2 with HMAC-SHA-256 and a single output block.
pub(crate) fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password, salt, iterations, &mut output)
        .unwrap_or_else(|_| unreachable!("HMAC key length is unrestricted"));
    output
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC key length is unrestricted"));
    mac.update(data);
    mac.finalize().into_bytes().into()
}
