//! Client side of the SCRAM SASL handshake (RFC 5802).
//!
//! One [`ScramClient`] per authentication attempt. The conversation strictly
//! alternates: `begin` fixes the identity, then three `step` calls produce
//! client-first, client-final, and the empty message acknowledging the
//! server's signature. Calling out of order is a programming error and fails
//! fast instead of operating on uninitialized state.

use crate::error::{Error, Result};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Hash strength of the SCRAM mechanism, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramHash {
    /// 32-byte digests (SCRAM-SHA-256)
    Sha256,
    /// 64-byte digests (SCRAM-SHA-512)
    Sha512,
}

impl ScramHash {
    pub fn mechanism_name(self) -> &'static str {
        match self {
            Self::Sha256 => "SCRAM-SHA-256",
            Self::Sha512 => "SCRAM-SHA-512",
        }
    }
}

enum State {
    Created,
    Started {
        username: String,
        password: String,
        authz_id: String,
    },
    AwaitingServerFirst {
        password: String,
        gs2_header: String,
        client_first_bare: String,
        client_nonce: String,
    },
    AwaitingServerFinal {
        server_signature: Vec<u8>,
    },
    Done,
    /// A failed conversation; the client must be discarded.
    Failed,
}

/// Client half of one SCRAM conversation.
pub struct ScramClient {
    hash: ScramHash,
    state: State,
}

impl ScramClient {
    pub fn new(hash: ScramHash) -> Self {
        Self {
            hash,
            state: State::Created,
        }
    }

    /// Fix the identity and credential for this conversation.
    pub fn begin(&mut self, username: &str, password: &str, authz_id: &str) -> Result<()> {
        if !matches!(self.state, State::Created) {
            return Err(Error::Auth("SCRAM begin called twice".to_string()));
        }
        if username.is_empty() {
            return Err(Error::Auth("SCRAM username must not be empty".to_string()));
        }
        self.state = State::Started {
            username: username.to_string(),
            password: password.to_string(),
            authz_id: authz_id.to_string(),
        };
        Ok(())
    }

    /// Consume one server message and produce the next client message.
    ///
    /// The first call takes an empty input and yields client-first; the last
    /// call validates server-final and yields an empty string.
    pub fn step(&mut self, server_message: &str) -> Result<String> {
        match std::mem::replace(&mut self.state, State::Failed) {
            State::Created => Err(Error::Auth(
                "SCRAM step called before begin".to_string(),
            )),
            State::Started {
                username,
                password,
                authz_id,
            } => {
                if !server_message.is_empty() {
                    return Err(Error::Auth(
                        "First SCRAM step takes no server message".to_string(),
                    ));
                }
                let mut nonce_bytes = [0_u8; 18];
                OsRng.fill_bytes(&mut nonce_bytes);
                let client_nonce = STANDARD_NO_PAD.encode(nonce_bytes);

                let gs2_header = if authz_id.is_empty() {
                    "n,,".to_string()
                } else {
                    format!("n,a={},", escape_username(&authz_id))
                };
                let client_first_bare =
                    format!("n={},r={client_nonce}", escape_username(&username));
                let client_first = format!("{gs2_header}{client_first_bare}");

                self.state = State::AwaitingServerFirst {
                    password,
                    gs2_header,
                    client_first_bare,
                    client_nonce,
                };
                Ok(client_first)
            }
            State::AwaitingServerFirst {
                password,
                gs2_header,
                client_first_bare,
                client_nonce,
            } => {
                let attrs = parse_attributes(server_message)?;
                let combined_nonce = attrs
                    .get(&'r')
                    .ok_or_else(|| Error::Auth("Server first lacks nonce".to_string()))?;
                if !combined_nonce.starts_with(&client_nonce) {
                    return Err(Error::Auth("SCRAM nonce mismatch".to_string()));
                }
                let salt = attrs
                    .get(&'s')
                    .ok_or_else(|| Error::Auth("Server first lacks salt".to_string()))
                    .and_then(|s| {
                        decode_base64(s)
                            .map_err(|_| Error::Auth("Invalid SCRAM salt encoding".to_string()))
                    })?;
                let iterations: u32 = attrs
                    .get(&'i')
                    .ok_or_else(|| Error::Auth("Server first lacks iteration count".to_string()))?
                    .parse()
                    .map_err(|_| Error::Auth("Invalid SCRAM iteration count".to_string()))?;
                if iterations == 0 {
                    return Err(Error::Auth("Invalid SCRAM iteration count".to_string()));
                }

                // RFC 5802 base64 is padded; emission stays strict while
                // decode_base64 tolerates servers that drop the padding.
                let channel_binding = STANDARD.encode(gs2_header.as_bytes());
                let without_proof = format!("c={channel_binding},r={combined_nonce}");
                let auth_message =
                    format!("{client_first_bare},{server_message},{without_proof}");

                let salted = self.salt_password(password.as_bytes(), &salt, iterations);
                let client_key = self.hmac(&salted, b"Client Key");
                let stored_key = self.digest(&client_key);
                let client_signature = self.hmac(&stored_key, auth_message.as_bytes());
                let proof: Vec<u8> = client_key
                    .iter()
                    .zip(client_signature.iter())
                    .map(|(k, s)| k ^ s)
                    .collect();

                let server_key = self.hmac(&salted, b"Server Key");
                let server_signature = self.hmac(&server_key, auth_message.as_bytes());

                self.state = State::AwaitingServerFinal { server_signature };
                Ok(format!("{without_proof},p={}", STANDARD.encode(proof)))
            }
            State::AwaitingServerFinal { server_signature } => {
                let attrs = parse_attributes(server_message)?;
                if let Some(err) = attrs.get(&'e') {
                    return Err(Error::Auth(format!("Server rejected SCRAM auth: {err}")));
                }
                let verifier = attrs
                    .get(&'v')
                    .ok_or_else(|| Error::Auth("Server final lacks signature".to_string()))
                    .and_then(|v| {
                        decode_base64(v).map_err(|_| {
                            Error::Auth("Invalid SCRAM server signature encoding".to_string())
                        })
                    })?;
                if verifier.len() != server_signature.len()
                    || verifier.ct_eq(&server_signature).unwrap_u8() != 1
                {
                    return Err(Error::Auth(
                        "SCRAM server signature verification failed".to_string(),
                    ));
                }
                self.state = State::Done;
                Ok(String::new())
            }
            State::Done => Err(Error::Auth(
                "SCRAM conversation already completed".to_string(),
            )),
            State::Failed => Err(Error::Auth(
                "SCRAM conversation already failed".to_string(),
            )),
        }
    }

    /// True only once the server's final signature has been validated.
    pub fn done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    fn salt_password(&self, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        match self.hash {
            ScramHash::Sha256 => {
                let mut out = [0_u8; 32];
                pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
                out.to_vec()
            }
            ScramHash::Sha512 => {
                let mut out = [0_u8; 64];
                pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut out);
                out.to_vec()
            }
        }
    }

    fn hmac(&self, key: &[u8], payload: &[u8]) -> Vec<u8> {
        match self.hash {
            ScramHash::Sha256 => {
                let mut mac = HmacSha256::new_from_slice(key)
                    .expect("HMAC-SHA-256 supports variable key size");
                mac.update(payload);
                mac.finalize().into_bytes().to_vec()
            }
            ScramHash::Sha512 => {
                let mut mac = HmacSha512::new_from_slice(key)
                    .expect("HMAC-SHA-512 supports variable key size");
                mac.update(payload);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    fn digest(&self, payload: &[u8]) -> Vec<u8> {
        match self.hash {
            ScramHash::Sha256 => Sha256::digest(payload).to_vec(),
            ScramHash::Sha512 => Sha512::digest(payload).to_vec(),
        }
    }
}

/// "," and "=" are attribute delimiters; RFC 5802 escapes them in names.
fn escape_username(value: &str) -> String {
    value.replace('=', "=3D").replace(',', "=2C")
}

fn parse_attributes(input: &str) -> Result<BTreeMap<char, String>> {
    let mut attrs = BTreeMap::new();
    for pair in input.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(Error::Auth("Malformed SCRAM attribute".to_string()));
        };
        let mut chars = key.chars();
        let Some(key_char) = chars.next() else {
            return Err(Error::Auth("Malformed SCRAM attribute key".to_string()));
        };
        if chars.next().is_some() {
            return Err(Error::Auth("Malformed SCRAM attribute key".to_string()));
        }
        attrs.insert(key_char, value.to_string());
    }
    Ok(attrs)
}

/// Accept both padded and unpadded base64, as servers vary.
fn decode_base64(input: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    STANDARD_NO_PAD.decode(input.trim_end_matches('='))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal server side of the handshake, enough to drive the client
    /// through a full conversation.
    struct TestServer {
        hash: ScramHash,
        password: String,
        salt: Vec<u8>,
        iterations: u32,
        combined_nonce: String,
        auth_message: String,
    }

    impl TestServer {
        fn new(hash: ScramHash, password: &str) -> Self {
            Self {
                hash,
                password: password.to_string(),
                salt: b"pinch-of-salt".to_vec(),
                iterations: 4096,
                combined_nonce: String::new(),
                auth_message: String::new(),
            }
        }

        fn hmac(&self, key: &[u8], payload: &[u8]) -> Vec<u8> {
            ScramClient::new(self.hash).hmac(key, payload)
        }

        fn handle_client_first(&mut self, client_first: &str) -> String {
            let (_, bare) = client_first.split_once(",,").expect("gs2 header");
            let attrs = parse_attributes(bare).unwrap();
            self.combined_nonce = format!("{}serverpart", attrs[&'r']);
            let server_first = format!(
                "r={},s={},i={}",
                self.combined_nonce,
                STANDARD_NO_PAD.encode(&self.salt),
                self.iterations
            );
            self.auth_message = format!("{bare},{server_first}");
            server_first
        }

        fn handle_client_final(&mut self, client_final: &str) -> String {
            let (without_proof, proof_b64) = client_final.rsplit_once(",p=").expect("proof");
            let attrs = parse_attributes(without_proof).unwrap();
            assert_eq!(attrs[&'r'], self.combined_nonce);
            self.auth_message = format!("{},{}", self.auth_message, without_proof);

            let client = ScramClient::new(self.hash);
            let salted =
                client.salt_password(self.password.as_bytes(), &self.salt, self.iterations);
            let client_key = self.hmac(&salted, b"Client Key");
            let stored_key = client.digest(&client_key);
            let client_signature = self.hmac(&stored_key, self.auth_message.as_bytes());
            let proof = STANDARD.decode(proof_b64).expect("proof b64");
            let recovered_key: Vec<u8> = proof
                .iter()
                .zip(client_signature.iter())
                .map(|(p, s)| p ^ s)
                .collect();
            assert_eq!(
                client.digest(&recovered_key),
                stored_key,
                "client proof verification failed"
            );

            let server_key = self.hmac(&salted, b"Server Key");
            let server_signature = self.hmac(&server_key, self.auth_message.as_bytes());
            format!("v={}", STANDARD_NO_PAD.encode(server_signature))
        }
    }

    fn run_handshake(hash: ScramHash) {
        let mut server = TestServer::new(hash, "topsecret");
        let mut client = ScramClient::new(hash);
        client.begin("bob", "topsecret", "").unwrap();
        assert!(!client.done());

        let client_first = client.step("").unwrap();
        assert!(client_first.starts_with("n,,n=bob,r="));
        assert!(!client.done());

        let server_first = server.handle_client_first(&client_first);
        let client_final = client.step(&server_first).unwrap();
        assert!(client_final.starts_with("c="));
        assert!(!client.done());

        let server_final = server.handle_client_final(&client_final);
        assert_eq!(client.step(&server_final).unwrap(), "");
        assert!(client.done());
    }

    #[test]
    fn test_full_handshake_sha256() {
        run_handshake(ScramHash::Sha256);
    }

    #[test]
    fn test_full_handshake_sha512() {
        run_handshake(ScramHash::Sha512);
    }

    #[test]
    fn test_step_before_begin_fails_fast() {
        let mut client = ScramClient::new(ScramHash::Sha256);
        assert!(matches!(client.step(""), Err(Error::Auth(_))));
    }

    #[test]
    fn test_begin_twice_fails() {
        let mut client = ScramClient::new(ScramHash::Sha256);
        client.begin("bob", "pw", "").unwrap();
        assert!(client.begin("bob", "pw", "").is_err());
    }

    #[test]
    fn test_first_step_rejects_server_input() {
        let mut client = ScramClient::new(ScramHash::Sha256);
        client.begin("bob", "pw", "").unwrap();
        assert!(client.step("r=unexpected").is_err());
    }

    #[test]
    fn test_nonce_mismatch_rejected() {
        let mut client = ScramClient::new(ScramHash::Sha256);
        client.begin("bob", "pw", "").unwrap();
        let _ = client.step("").unwrap();
        let bogus = format!(
            "r=completely-different,s={},i=4096",
            STANDARD_NO_PAD.encode(b"salt")
        );
        assert!(matches!(client.step(&bogus), Err(Error::Auth(_))));
        assert!(!client.done());
    }

    #[test]
    fn test_server_error_message_surfaced() {
        let mut server = TestServer::new(ScramHash::Sha256, "pw");
        let mut client = ScramClient::new(ScramHash::Sha256);
        client.begin("bob", "pw", "").unwrap();
        let client_first = client.step("").unwrap();
        let server_first = server.handle_client_first(&client_first);
        let _ = client.step(&server_first).unwrap();
        let err = client.step("e=invalid-proof").unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert!(!client.done());
    }

    #[test]
    fn test_bad_server_signature_rejected() {
        let mut server = TestServer::new(ScramHash::Sha256, "pw");
        let mut client = ScramClient::new(ScramHash::Sha256);
        client.begin("bob", "pw", "").unwrap();
        let client_first = client.step("").unwrap();
        let server_first = server.handle_client_first(&client_first);
        let _ = client.step(&server_first).unwrap();
        let forged = format!("v={}", STANDARD_NO_PAD.encode(b"forged-signature"));
        assert!(client.step(&forged).is_err());
        assert!(!client.done());
    }

    #[test]
    fn test_client_final_emits_padded_base64() {
        let mut server = TestServer::new(ScramHash::Sha256, "pw");
        let mut client = ScramClient::new(ScramHash::Sha256);
        client.begin("bob", "pw", "").unwrap();
        let client_first = client.step("").unwrap();
        let server_first = server.handle_client_first(&client_first);
        let client_final = client.step(&server_first).unwrap();

        // 32-byte SHA-256 proof encodes to 44 chars including padding.
        let (without_proof, proof_b64) = client_final.rsplit_once(",p=").unwrap();
        assert_eq!(proof_b64.len(), 44);
        assert!(proof_b64.ends_with('='));
        assert!(STANDARD.decode(proof_b64).is_ok());
        // Empty authzid gs2 header "n,," is the standard "biws".
        assert!(without_proof.starts_with("c=biws,"));
    }

    #[test]
    fn test_username_escaping() {
        let mut client = ScramClient::new(ScramHash::Sha256);
        client.begin("a=b,c", "pw", "").unwrap();
        let client_first = client.step("").unwrap();
        assert!(client_first.contains("n=a=3Db=2Cc,"));
    }

    #[test]
    fn test_empty_username_rejected() {
        let mut client = ScramClient::new(ScramHash::Sha256);
        assert!(client.begin("", "pw", "").is_err());
    }
}
