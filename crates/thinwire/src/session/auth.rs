//! Two-phase authentication.
//!
//! Phase one announces the user and the mode. In challenge-response mode the
//! server answers with `salt`, `iterations` and `server_nonce`; the client
//! then proves knowledge of the password without sending it:
//!
//! ```text
//! salted     = PBKDF2-HMAC-SHA256(password, salt, iterations)
//! client_key = HMAC(salted, "Client Key")
//! stored_key = SHA256(client_key)
//! message    = username "," server_nonce "," client_nonce
//! proof      = client_key XOR HMAC(stored_key, message)
//! ```
//!
//! and checks the server's `server_signature = HMAC(HMAC(salted, "Server
//! Key"), message)` before trusting the session.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::SessionIo;
use crate::codec::message::find_parameter;
use crate::codec::{Parameter, Request, Response};
use crate::config::{AuthMode, Credentials, SessionOptions};
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub(crate) const KEY_LEN: usize = 32;
pub(crate) const NONCE_LEN: usize = 32;

/// Server error code for a rejected username or password.
pub(crate) const INVALID_CREDENTIALS: u32 = 1017;

pub(crate) mod keys {
    pub const SALT: &str = "salt";
    pub const ITERATIONS: &str = "iterations";
    pub const SERVER_NONCE: &str = "server_nonce";
    pub const CLIENT_NONCE: &str = "client_nonce";
    pub const PROOF: &str = "proof";
    pub const PASSWORD: &str = "password";
    pub const SERVER_SIGNATURE: &str = "server_signature";
    pub const SESSION_ID: &str = "session_id";
    pub const SERIAL: &str = "serial";
    pub const CHARSET: &str = "charset";
    pub const NCHARSET: &str = "ncharset";
    pub const VERSION: &str = "version";
}

/// Facts about the session learned during authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AuthOutcome {
    pub session_id: u32,
    pub serial: u32,
    pub charset: u16,
    pub ncharset: u16,
    pub banner: String,
}

pub(crate) fn salted_password(password: &str, salt: &[u8], iterations: u32) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    out
}

fn mac(key: &[u8]) -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(key).map_err(|e| Error::auth(format!("HMAC key: {e}")))
}

fn to_key(bytes: &[u8]) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&bytes[..KEY_LEN]);
    out
}

fn hmac(key: &[u8], data: &[u8]) -> Result<[u8; KEY_LEN]> {
    let mut mac = mac(key)?;
    mac.update(data);
    Ok(to_key(&mac.finalize().into_bytes()))
}

pub(crate) fn auth_message(username: &str, server_nonce: &[u8], client_nonce: &[u8]) -> Vec<u8> {
    let mut message =
        Vec::with_capacity(username.len() + server_nonce.len() + client_nonce.len() + 2);
    message.extend_from_slice(username.as_bytes());
    message.push(b',');
    message.extend_from_slice(server_nonce);
    message.push(b',');
    message.extend_from_slice(client_nonce);
    message
}

pub(crate) fn stored_key(salted: &[u8]) -> Result<[u8; KEY_LEN]> {
    Ok(to_key(&Sha256::digest(hmac(salted, b"Client Key")?)))
}

pub(crate) fn client_proof(salted: &[u8], message: &[u8]) -> Result<[u8; KEY_LEN]> {
    let client_key = hmac(salted, b"Client Key")?;
    let signature = hmac(&stored_key(salted)?, message)?;
    let mut proof = [0u8; KEY_LEN];
    for (out, (k, s)) in proof.iter_mut().zip(client_key.iter().zip(&signature)) {
        *out = k ^ s;
    }
    Ok(proof)
}

/// Recover the client key from a proof and check it against the stored key.
pub(crate) fn verify_client_proof(stored: &[u8], message: &[u8], proof: &[u8]) -> bool {
    if proof.len() != KEY_LEN {
        return false;
    }
    let Ok(signature) = hmac(stored, message) else {
        return false;
    };
    let client_key: Vec<u8> = proof.iter().zip(&signature).map(|(p, s)| p ^ s).collect();
    Sha256::digest(&client_key).as_slice() == stored
}

pub(crate) fn server_signature(salted: &[u8], message: &[u8]) -> Result<[u8; KEY_LEN]> {
    hmac(&hmac(salted, b"Server Key")?, message)
}

fn verify_server_signature(salted: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let mut mac = mac(&hmac(salted, b"Server Key")?)?;
    mac.update(message);
    mac.verify_slice(signature)
        .map_err(|_| Error::auth("server signature does not match, the server is not trusted"))
}

fn required<'a>(response: &'a Response, key: &str) -> Result<&'a [u8]> {
    response
        .parameter(key)
        .ok_or_else(|| Error::auth(format!("server did not send `{key}`")))
}

fn numeric<T: std::str::FromStr>(response: &Response, key: &str) -> Result<T> {
    let raw = required(response, key)?;
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::protocol(format!("parameter `{key}` is not a number")))
}

// Any server error while authenticating is a rejected login.
fn as_auth_error(err: Error) -> Error {
    match err.server_error() {
        Some(server) if server.code() == INVALID_CREDENTIALS => {
            Error::auth(format!("invalid username or password ({server})"))
        }
        Some(server) => Error::auth(server.to_string()),
        None => err,
    }
}

/// Run both phases on a freshly negotiated connection.
pub(crate) fn authenticate(
    io: &mut SessionIo,
    credentials: &Credentials,
    options: &SessionOptions,
) -> Result<AuthOutcome> {
    let mode = credentials.auth_mode();
    let phase_one = Request::AuthPhaseOne {
        username: credentials.username().to_string(),
        program: options.program.clone(),
        mode,
    };
    let (challenge, _) = io.round_trip(&phase_one, None)?;
    let challenge = challenge.into_result().map_err(as_auth_error)?;
    debug!(username = credentials.username(), ?mode, "auth phase one accepted");

    let (parameters, verifier) = match mode {
        AuthMode::Plain => (
            vec![Parameter::new(keys::PASSWORD, credentials.password().as_bytes())],
            None,
        ),
        AuthMode::ChallengeResponse => {
            let salt = required(&challenge, keys::SALT)?;
            let iterations: u32 = numeric(&challenge, keys::ITERATIONS)?;
            if iterations == 0 {
                return Err(Error::protocol("server requested zero key iterations"));
            }
            let server_nonce = required(&challenge, keys::SERVER_NONCE)?;

            let mut client_nonce = [0u8; NONCE_LEN];
            rand::thread_rng().fill_bytes(&mut client_nonce);

            let salted = salted_password(credentials.password(), salt, iterations);
            let message = auth_message(credentials.username(), server_nonce, &client_nonce);
            let proof = client_proof(&salted, &message)?;
            (
                vec![
                    Parameter::new(keys::CLIENT_NONCE, client_nonce.to_vec()),
                    Parameter::new(keys::PROOF, proof.to_vec()),
                ],
                Some((salted, message)),
            )
        }
    };

    let (accepted, _) = io.round_trip(&Request::AuthPhaseTwo { parameters }, None)?;
    let accepted = accepted.into_result().map_err(as_auth_error)?;

    if let Some((salted, message)) = verifier {
        let signature = required(&accepted, keys::SERVER_SIGNATURE)?;
        verify_server_signature(&salted, &message, signature)?;
    }

    let outcome = AuthOutcome {
        session_id: numeric(&accepted, keys::SESSION_ID)?,
        serial: numeric(&accepted, keys::SERIAL)?,
        charset: numeric(&accepted, keys::CHARSET)?,
        ncharset: numeric(&accepted, keys::NCHARSET)?,
        banner: find_parameter(&accepted.parameters, keys::VERSION)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default(),
    };
    debug!(session_id = outcome.session_id, serial = outcome.serial, "authenticated");
    Ok(outcome)
}
