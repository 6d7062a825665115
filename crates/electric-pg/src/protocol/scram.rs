//! SCRAM-SHA-256 client (RFC 5802, RFC 7677)
//!
//! ```text
//! client                            server
//!   |--- client-first-message ------->|  nonce
//!   |<-- server-first-message --------|  salt, iterations, combined nonce
//!   |--- client-final-message ------->|  proof
//!   |<-- server-final-message --------|  verifier
//! ```
//!
//! Channel binding is not used (`n,,` GS2 header).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// SCRAM authentication error
#[derive(Debug, Error)]
pub enum ScramError {
    #[error("invalid server message: {0}")]
    InvalidServerMessage(String),

    #[error("server nonce does not extend the client nonce")]
    InvalidNonce,

    #[error("server signature verification failed")]
    ServerVerificationFailed,

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid iteration count: {0}")]
    InvalidIterations(String),

    #[error("server reported: {0}")]
    ServerError(String),

    #[error("message out of order")]
    OutOfOrder,
}

type Result<T> = std::result::Result<T, ScramError>;

/// State carried from the client-final message to server verification
struct Exchange {
    salted_password: [u8; 32],
    auth_message: String,
}

/// SCRAM-SHA-256 authentication state machine
pub struct ScramSha256 {
    username: String,
    password: String,
    client_nonce: String,
    exchange: Option<Exchange>,
}

impl ScramSha256 {
    /// SASL mechanism name
    pub const MECHANISM: &'static str = "SCRAM-SHA-256";

    pub fn new(username: &str, password: &str) -> Self {
        use rand::RngCore;

        let mut nonce_bytes = [0u8; 24];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        Self::with_nonce(username, password, &BASE64.encode(nonce_bytes))
    }

    pub(crate) fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        Self {
            username: username.replace('=', "=3D").replace(',', "=2C"),
            password: password.to_string(),
            client_nonce: nonce.to_string(),
            exchange: None,
        }
    }

    /// `n,,n=<user>,r=<nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", self.username, self.client_nonce)
    }

    /// Consume the server-first message and produce the client-final
    /// message `c=biws,r=<nonce>,p=<proof>`
    pub fn client_final_message(&mut self, server_first: &[u8]) -> Result<Vec<u8>> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|e| ScramError::InvalidServerMessage(e.to_string()))?;
        let (nonce, salt, iterations) = parse_server_first(server_first)?;

        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(ScramError::InvalidNonce);
        }

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2::<Hmac<Sha256>>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        )
        .map_err(|e| ScramError::InvalidServerMessage(e.to_string()))?;

        let without_proof = format!("c={},r={}", BASE64.encode("n,,"), nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );

        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;

        let mut proof = [0u8; 32];
        for (p, (k, s)) in proof
            .iter_mut()
            .zip(client_key.iter().zip(client_signature.iter()))
        {
            *p = k ^ s;
        }

        self.exchange = Some(Exchange {
            salted_password,
            auth_message,
        });
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check the server-final message `v=<signature>`
    pub fn verify_server_final(&self, server_final: &[u8]) -> Result<()> {
        let server_final = std::str::from_utf8(server_final)
            .map_err(|e| ScramError::InvalidServerMessage(e.to_string()))?;

        if let Some(error) = server_final.strip_prefix("e=") {
            return Err(ScramError::ServerError(error.to_string()));
        }
        let signature = server_final
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or_else(|| ScramError::InvalidServerMessage("missing server signature".into()))?;
        let signature = BASE64.decode(signature)?;

        let exchange = self.exchange.as_ref().ok_or(ScramError::OutOfOrder)?;
        let server_key = hmac_sha256(&exchange.salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, exchange.auth_message.as_bytes())?;

        if bool::from(signature.as_slice().ct_eq(expected.as_slice())) {
            Ok(())
        } else {
            Err(ScramError::ServerVerificationFailed)
        }
    }
}

impl fmt::Debug for ScramSha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScramSha256")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("client_nonce", &self.client_nonce)
            .finish()
    }
}

fn parse_server_first(msg: &str) -> Result<(String, Vec<u8>, u32)> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for part in msg.split(',') {
        if let Some(value) = part.strip_prefix("r=") {
            nonce = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("s=") {
            salt = Some(BASE64.decode(value)?);
        } else if let Some(value) = part.strip_prefix("i=") {
            let n = value
                .parse::<u32>()
                .map_err(|e| ScramError::InvalidIterations(e.to_string()))?;
            if n == 0 {
                return Err(ScramError::InvalidIterations("0".into()));
            }
            iterations = Some(n);
        }
    }

    let missing = |what: &str| ScramError::InvalidServerMessage(format!("missing {what}"));
    Ok((
        nonce.ok_or_else(|| missing("nonce"))?,
        salt.ok_or_else(|| missing("salt"))?,
        iterations.ok_or_else(|| missing("iterations"))?,
    ))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| ScramError::InvalidServerMessage(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}
